//! meetup: connect two TCP endpoints through a bidirectional pipe
//!
//! Either endpoint may listen or connect; see `meetup --help`.

use clap::Parser;
use eyre::WrapErr;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = meetup::Args::parse_from(meetup::normalize_flag_args(std::env::args_os()));
    let config = match meetup::Config::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let graceful = meetup::Graceful::new();
    let proxy = meetup::Meetup::bind(config).await?;

    let result = tokio::select! {
        result = proxy.run(&graceful) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("failed to listen for ctrl-c")?;
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    graceful.shutdown().await?;
    result
}
