use anyhow::Context;
use clap::Parser;
use lookout_capture::config::{load_config, StorageMode};
use lookout_capture::upload::AwsCliUploader;
use lookout_capture::CameraHandler;
use lookout_common::StillSource;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/lookout.yaml")]
    config: String,

    /// Log level, overrides logging.level from the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level))?;

    if args.check {
        info!(
            "Configuration OK: {} camera(s), storage {:?}",
            config.cameras.len(),
            config.storage.mode
        );
        return Ok(());
    }

    info!("Starting Lookout with {} camera(s)", config.cameras.len());

    let mut handler = CameraHandler::new(config.clone());
    if config.storage.mode == StorageMode::S3 {
        handler = handler.with_uploader(Arc::new(AwsCliUploader::from_config(&config.cloud)));
    }
    let handler = Arc::new(handler);

    handler
        .start_streams()
        .await
        .context("Failed to start camera streams")?;

    let source: Arc<dyn StillSource> = handler.clone();
    let server = lookout_viewer::build_server(source, &config.server.host, config.server.port)
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    wait_for_shutdown().await;

    info!("Shutting down Lookout");
    handler.close_streams().await;
    server_handle.stop(true).await;
    match server_task.await {
        Ok(Err(e)) => error!("Viewer exited with error: {}", e),
        Err(e) => error!("Viewer task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install the tracing subscriber")?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
