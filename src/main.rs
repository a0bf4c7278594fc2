use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ts2any_lib::{load_config_from_env, run_streamer_app_with_config};

/// Main entry point for the TimescaleDB event streamer
#[tokio::main]
async fn main() {
    init_logging();

    tracing::info!("Starting ts2any event streamer");

    let config = match load_config_from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Configuration error: {}", err);
            std::process::exit(1);
        }
    };

    let exit_code = run_streamer_app_with_config(config).await;
    tracing::info!("Event streamer stopped");
    std::process::exit(exit_code);
}

/// Initialize structured logging
///
/// The log level can be controlled via the `RUST_LOG` environment variable.
/// Defaults to debug for the streamer itself and info for the PostgreSQL
/// client.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ts2any=debug,ts2any_lib=debug,tokio_postgres=info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
