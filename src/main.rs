use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leafscan::{AppState, Args, RegistryConfig, start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leafscan=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = AppState::new(
        RegistryConfig {
            detector_path: PathBuf::from(&args.detector_model),
            classifier_path: PathBuf::from(&args.classifier_model),
            cuda: args.cuda,
        },
        Duration::from_secs(args.timeout_secs),
    );

    // Warm the registry up front; a failed load is logged and the affected
    // endpoints fail per-request instead of taking the process down.
    state.registry.warmup().await;

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("starting leaf disease detection service");
    start_server(&addr, state).await?;

    Ok(())
}
