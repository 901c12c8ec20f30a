//! doc-auditor - HTTP Server Entry Point
//!
//! Starts the audit workers and the HTTP server.

use doc_auditor::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_auditor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: docs_dir={}, workers={}, inference={}",
        config.docs_dir.display(),
        config.workers,
        if config.inference_enabled {
            config.services.inference.as_str()
        } else {
            "(disabled)"
        }
    );
    info!(
        "Services: parser={}, rule_engine={}",
        config.services.parser, config.services.rule_engine
    );

    api::serve(config).await?;

    Ok(())
}
