use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use serde::Deserialize;
use serde_yaml::Value;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use podprov::config::Config;
use podprov::provisioner::{Asset, ContainerDriver, Credentials, ProvisionerError, validate_params};

#[derive(Parser)]
#[command(name = "podprov", about = "Single-container provisioner for podman")]
enum Cli {
    /// Check an asset document's provider parameters without touching the engine
    Validate {
        /// Asset document (YAML)
        file: PathBuf,
    },
    /// Start the asset's container and print its record as JSON
    Create {
        /// Asset document (YAML)
        file: PathBuf,
    },
    /// Remove the asset's container
    Delete {
        /// Asset document (YAML)
        file: PathBuf,
        /// Container id, overriding the document's asset_id
        #[arg(long)]
        asset_id: Option<String>,
    },
}

/// On-disk asset description consumed by every subcommand.
#[derive(Debug, Deserialize)]
struct AssetDocument {
    name: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    provider: Value,
    #[serde(default)]
    credentials: Option<Credentials>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("podprov=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Validate { file } => validate(&file).await,
        Cli::Create { file } => create(&file, &config).await,
        Cli::Delete { file, asset_id } => delete(&file, asset_id, &config).await,
    }
}

async fn load(path: &Path) -> Result<AssetDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read asset document: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse asset document: {}", path.display()))
}

async fn validate(path: &Path) -> Result<()> {
    let doc = load(path).await?;
    let spec = match validate_params(&doc.provider) {
        Ok(spec) => spec,
        Err(ProvisionerError::Validation(violations)) => {
            for v in &violations {
                eprintln!("{v}");
            }
            bail!("{} has {} violation(s)", path.display(), violations.len());
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(asset = %doc.name, image = %spec.image, "asset document is valid");
    Ok(())
}

async fn create(path: &Path, config: &Config) -> Result<()> {
    let doc = load(path).await?;
    let mut asset = Asset {
        name: doc.name,
        asset_id: doc.asset_id,
    };

    let mut driver = ContainerDriver::connect(doc.provider, doc.credentials, &config.engine_defaults())
        .await
        .context("failed to initialize container backend")?;
    driver.validate()?;
    driver.authenticate().await?;
    let results = driver
        .create(&mut asset)
        .await
        .with_context(|| format!("failed to create container for {}", asset.name))?;
    driver.close();

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

async fn delete(path: &Path, asset_id: Option<String>, config: &Config) -> Result<()> {
    let doc = load(path).await?;
    let asset = Asset {
        name: doc.name,
        asset_id: asset_id.or(doc.asset_id),
    };
    if asset.asset_id.is_none() {
        bail!("no asset_id in {} and none given with --asset-id", path.display());
    }

    let mut driver = ContainerDriver::connect(doc.provider, doc.credentials, &config.engine_defaults())
        .await
        .context("failed to initialize container backend")?;
    driver.validate()?;
    match driver.delete(&asset).await {
        Ok(()) => {}
        Err(ProvisionerError::AlreadyDeleted(id)) => {
            tracing::warn!(container_id = %id, "container already deleted");
        }
        Err(e) => return Err(e).context(format!("failed to delete container for {}", asset.name)),
    }
    driver.close();
    Ok(())
}
