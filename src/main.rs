use anyhow::{Context, bail};
use clap::Parser;
use direct_upload::config::UploadConfig;
use direct_upload::infrastructure::http;
use direct_upload::utils::validation::validate_upload;
use direct_upload::{BatchCoordinator, UploadEvent, UploadFile, UploadOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Destination prefix for the stored objects
    #[arg(short, long)]
    prefix: Option<String>,

    /// Request publicly readable objects
    #[arg(long)]
    public: bool,

    /// Maximum number of files uploading at once
    #[arg(short = 'c', long)]
    max_concurrent: Option<usize>,

    /// Metadata attached to every object, as key=value
    #[arg(short, long = "meta", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no '=' in '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("invalid key=value: empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "direct_upload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = UploadConfig::from_env();
    info!(
        "🛡️  Upload Config: Max Size={}MB, Concurrency={}, Require ETag={}",
        config.max_file_size / 1024 / 1024,
        config.max_concurrent,
        config.require_integrity_token
    );

    let mut files = Vec::new();
    let mut rejected = 0usize;
    for path in &args.files {
        let prepared = UploadFile::from_path(path)
            .await
            .and_then(|file| validate_upload(&file, &config).map(|_| file));
        match prepared {
            Ok(file) => files.push(file),
            Err(e) => {
                warn!("⚠️  Skipping {}: {}", path.display(), e);
                rejected += 1;
            }
        }
    }
    if files.is_empty() {
        bail!("no uploadable files among {} given", args.files.len());
    }

    let coordinator = Arc::new(http::setup_coordinator(&config).context("invalid configuration")?);
    let options = UploadOptions {
        destination_prefix: args.prefix.or_else(|| config.default_prefix.clone()),
        is_public: args.public || config.is_public,
        metadata: args.metadata.into_iter().collect::<HashMap<_, _>>(),
        max_concurrent: args.max_concurrent.unwrap_or(config.max_concurrent),
    };

    let reporter = tokio::spawn(report_progress(coordinator.clone()));
    let interrupt = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.cancel_all();
        })
    };

    info!("🚀 Uploading {} file(s)...", files.len());
    let results = coordinator.upload_batch(files, options).await;
    interrupt.abort();
    reporter.abort();

    println!("{}", serde_json::to_string_pretty(&results)?);

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 || rejected > 0 {
        for result in results.iter().filter(|r| !r.success) {
            error!(
                "❌ {}: {}",
                result.file_id,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        bail!(
            "{} upload(s) failed, {} file(s) rejected before upload",
            failed,
            rejected
        );
    }

    info!("✅ All uploads confirmed.");
    Ok(())
}

async fn report_progress(coordinator: Arc<BatchCoordinator>) {
    let registry = coordinator.registry().clone();
    let mut events = registry.subscribe();
    loop {
        match events.recv().await {
            Ok(UploadEvent::Progress { id, percent }) => {
                let name = registry.get(id).map(|f| f.name).unwrap_or_default();
                info!(
                    "📤 {} {}% (overall {}%)",
                    name,
                    percent,
                    registry.aggregate_progress()
                );
            }
            Ok(UploadEvent::StatusChanged { id, status }) => {
                let name = registry.get(id).map(|f| f.name).unwrap_or_default();
                info!("📦 {} is now {}", name, status);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Progress reporter lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, cancelling uploads...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, cancelling uploads...");
        },
    }
}
