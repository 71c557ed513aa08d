// Main entry point for the credit reconciler

use anyhow::Context;
use credit_reconciler::app::App;
use credit_reconciler::config::Config;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first, before any logging exists
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config);

    info!("Starting credit reconciler");

    let app = App::build(&config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize components");
        e
    })?;

    let cancel = CancellationToken::new();
    let handles = app.start_background(&cancel);

    shutdown_signal().await?;
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Credit reconciler stopped");
    Ok(())
}

/// Initialize tracing subscriber (`RUST_LOG` overrides `LOG_LEVEL`)
fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let rust_log = std::env::var("RUST_LOG").ok();
    let subscriber = fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(log_filter(rust_log.as_deref(), &config.log_level));

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn log_filter(rust_log: Option<&str>, log_level: &str) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        let mut terminate =
            unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to install Ctrl+C handler")?;
                info!("Ctrl+C received, starting graceful shutdown");
            },
            _ = terminate.recv() => {
                info!("SIGTERM received, starting graceful shutdown");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to install Ctrl+C handler")?;
        info!("Ctrl+C received, starting graceful shutdown");
    }

    Ok(())
}
