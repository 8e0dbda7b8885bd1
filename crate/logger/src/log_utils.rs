use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Default filter used when neither `RUST_LOG` nor an explicit default is given.
const DEFAULT_FILTER: &str = "info,cosmian_pkcs11_binding=debug";

/// Install the global tracing subscriber once per process.
///
/// `RUST_LOG` wins when it is set; otherwise `default_value` is used, falling
/// back to [`DEFAULT_FILTER`]. Subsequent calls are no-ops, which lets every
/// test call it unconditionally.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_value.unwrap_or(DEFAULT_FILTER)));
        tracing_setup(filter);
    });
}

fn tracing_setup(filter: EnvFilter) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    // another subscriber may already be installed by the embedding application
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(format)
            .try_init(),
    );
}
