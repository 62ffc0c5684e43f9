// SPDX-License-Identifier: PolyForm-Shield-1.0

use tokio::signal;
use tracing::{info, warn};

pub async fn wait_for_signal() {
    info!("waiting for shutdown signal");
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
    }
}
