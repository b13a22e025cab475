use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Under systemd on linux the journald
/// layer is preferred so service logs land in the unit journal; every
/// other environment gets the stderr formatter.
///
/// The filter is taken from `env_key` first, then `RUST_LOG`, then
/// `default_filter`.
pub fn init_logging(
    default_filter: &str,
    env_key: &str,
    service_name: &str,
) {
    if init_journald(default_filter, env_key, service_name) {
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(default_filter, env_key))
        .init();
}

fn build_filter(default_filter: &str, env_key: &str) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

#[cfg(target_os = "linux")]
fn init_journald(
    default_filter: &str,
    env_key: &str,
    service_name: &str,
) -> bool {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let under_systemd = std::env::var_os("JOURNAL_STREAM").is_some()
        || std::env::var_os("INVOCATION_ID").is_some();
    if !under_systemd {
        return false;
    }

    match tracing_journald::layer() {
        Ok(layer) => {
            tracing_subscriber::registry()
                .with(build_filter(default_filter, env_key))
                .with(layer)
                .init();
            true
        }
        Err(err) => {
            eprintln!(
                "{service_name}: journald init failed, falling back to stderr formatter: {err}"
            );
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn init_journald(
    _default_filter: &str,
    _env_key: &str,
    _service_name: &str,
) -> bool {
    false
}
