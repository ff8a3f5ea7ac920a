//! Folio plugin administration CLI: install, update and remove marketplace
//! plugins against the configured database and plugins directory.
//!
//! Callers are expected to have checked that the operator may manage plugins.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use folio_plugin::{
    InstallOrchestrator, InstallResult, MarketplaceClient, PackageVerifier, PipelineConfig,
    PluginRegistry, SandboxConfig, SandboxExecutor,
};
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "folio-admin")]
#[command(about = "Folio plugin administration tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Install a plugin from the marketplace
    Install {
        /// Plugin id, e.g. seo-tools
        id: String,

        /// License key for paid or trial plugins
        #[arg(long, env = "FOLIO_LICENSE_KEY")]
        license_key: Option<String>,
    },

    /// Update an installed plugin to the latest marketplace version
    Update { id: String },

    /// Remove an installed plugin and its settings
    Uninstall { id: String },

    /// List installed plugins with a newer marketplace version
    CheckUpdates,

    /// List installed plugins
    List,

    /// List plugins available in the marketplace
    Available,

    /// Clean up after interrupted installs and exit
    Reconcile,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<bool> {
    let orchestrator = build_orchestrator().await?;

    // A reconcile command reports the pass itself; everything else runs it silently first.
    if command != Commands::Reconcile {
        let report = orchestrator
            .reconcile()
            .await
            .context("startup reconciliation failed")?;
        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "some in-flight markers could not be reconciled");
        }
    }

    match command {
        Commands::Install { id, license_key } => {
            Ok(report(orchestrator.install(&id, license_key.as_deref()).await))
        }
        Commands::Update { id } => Ok(report(orchestrator.update(&id).await)),
        Commands::Uninstall { id } => Ok(report(orchestrator.uninstall(&id).await)),
        Commands::CheckUpdates => {
            let updates = orchestrator.check_for_updates().await?;
            if updates.is_empty() {
                println!("All plugins are up to date");
            }
            for (id, info) in updates {
                println!("{id}: {} -> {}", info.current, info.available);
                if let Some(changelog) = info.changelog {
                    for line in changelog.lines() {
                        println!("    {line}");
                    }
                }
            }
            Ok(true)
        }
        Commands::List => {
            for plugin in orchestrator.registry().list_installed().await? {
                println!(
                    "{:<32} {:<12} {:<6} installed {}",
                    plugin.id,
                    plugin.version,
                    plugin.license_type,
                    plugin.installed_at.format("%Y-%m-%d")
                );
            }
            Ok(true)
        }
        Commands::Available => {
            for plugin in orchestrator.marketplace().get_available_plugins().await? {
                println!(
                    "{:<32} {:<12} {:<6} {}",
                    plugin.id,
                    plugin.version,
                    plugin.license_type,
                    plugin.description.as_deref().unwrap_or("")
                );
            }
            Ok(true)
        }
        Commands::Reconcile => {
            let report = orchestrator.reconcile().await?;
            println!(
                "{} marker(s): {} restored, {} removed, {} finalized, {} failed",
                report.markers,
                report.restored.len(),
                report.removed.len(),
                report.finalized.len(),
                report.failed.len()
            );
            Ok(report.failed.is_empty())
        }
    }
}

async fn build_orchestrator() -> anyhow::Result<InstallOrchestrator> {
    let db_config = folio_db::DatabaseConfig::from_env();
    tracing::info!("connecting to database...");
    let db = folio_db::connect(&db_config)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations...");
    folio_migration::Migrator::up(&db, None)
        .await
        .context("failed to run migrations")?;

    let config = PipelineConfig::from_env();
    config
        .ensure_dirs()
        .await
        .with_context(|| format!("failed to prepare {}", config.plugins_dir.display()))?;
    tracing::info!(
        plugins_dir = %config.plugins_dir.display(),
        marketplace = %config.marketplace_url,
        platform_version = %config.platform_version,
        "plugin pipeline configured"
    );

    let sandbox_config = SandboxConfig::from_env();
    let max_wasm_size = sandbox_config.max_wasm_size;
    let marketplace = MarketplaceClient::from_config(&config)?;

    Ok(InstallOrchestrator::new(
        config,
        marketplace,
        PackageVerifier::new(),
        SandboxExecutor::wasm(sandbox_config),
        PluginRegistry::new(db),
    )
    .with_max_wasm_size(max_wasm_size))
}

fn report(result: InstallResult) -> bool {
    match result.error {
        None => println!("{}", result.message),
        Some(kind) => eprintln!("{kind}: {}", result.message),
    }
    result.success
}
