use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::control::WarmupControl;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<WarmupControl>,
    pub shutdown: CancellationToken,
}
