// SPDX-License-Identifier: PolyForm-Shield-1.0

use tracing_subscriber::EnvFilter;

/// install the global fmt subscriber.
///
/// verbosity comes from `RUST_LOG` and defaults to `info`. calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
