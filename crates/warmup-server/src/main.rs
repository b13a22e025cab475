mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::control::WarmupControl;
use core::http::run_http_server;
use core::imap::ImapListener;
use core::orchestrator::OrchestratorDeps;
use core::smtp::SmtpMailer;
use core::store::MySqlStore;
use core::textgen::LlmTextGenerator;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warmup_helpers::{logging, shutdown};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "warmup_server=info,sqlx=warn,tokio=warn",
        "WARMUP_LOG",
        "warmup-server",
    );

    let config = Config::load().context("failed to load configuration")?;
    let cipher = config.cipher()?;

    let store = Arc::new(
        MySqlStore::connect(&config.database_url, cipher)
            .await
            .context("failed to connect database")?,
    );

    let generator = Arc::new(
        LlmTextGenerator::new(
            &config.textgen.api_url,
            &config.textgen.api_key,
            &config.textgen.model,
            config.textgen.timeout,
        )
        .context("failed to build text generator")?,
    );

    let deps = OrchestratorDeps {
        store: store.clone(),
        mailer: Arc::new(SmtpMailer),
        listener: Arc::new(ImapListener),
        generator,
    };
    let control =
        Arc::new(WarmupControl::new(deps, config.warmup.timing()));

    let state = AppState {
        control: control.clone(),
        shutdown: CancellationToken::new(),
    };

    info!(
        "server starting: listen={}, textgen_model={}",
        config.listen, config.textgen.model
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    run_http_server(&config.listen, state).await?;

    // Graceful: pause every live orchestrator, then release the pool.
    control.shutdown().await;
    store.close().await;
    info!("server stopped");
    Ok(())
}
