use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docstream::{Config, DocumentStatus, GenerationPipeline, GenerationRequest, UserProfile};

const USAGE: &str = "usage: docstream <profile.json> <job_description.txt>";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let profile_path = args.next().context(USAGE)?;
    let jd_path = args.next().context(USAGE)?;

    let profile: UserProfile = serde_json::from_str(
        &std::fs::read_to_string(&profile_path)
            .with_context(|| format!("Failed to read profile file '{profile_path}'"))?,
    )
    .with_context(|| format!("'{profile_path}' is not a valid profile"))?;
    let job_description = std::fs::read_to_string(&jd_path)
        .with_context(|| format!("Failed to read job description file '{jd_path}'"))?;

    info!("Starting docstream v{}", env!("CARGO_PKG_VERSION"));

    let pipeline = GenerationPipeline::new(config);
    let handle = pipeline.start(GenerationRequest {
        profile,
        job_description,
    });
    let cancel = handle.cancel_handle();

    let mut run = Box::pin(handle.wait());
    let document = tokio::select! {
        document = &mut run => document?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling generation");
            cancel.cancel();
            run.await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&document)?);

    if document.status == DocumentStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
