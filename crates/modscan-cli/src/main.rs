// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! `modscan` — operator CLI embedding the orchestrator crates directly
//! in-process, rather than shelling out to the daemon's HTTP surface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modscan_chains::{ChainStore, FileChainStore};
use modscan_config::{load_config, OrchestratorConfig};
use modscan_core::{
    AutoRunConfig, AutoRunRule, AutoRunRuleKind, Chain, FileType, Fingerprint, ModuleKind,
};
use modscan_dispatcher::{AutoRunSettings, Dispatcher, RunTarget};
use modscan_executor::ChainExecutor;
use modscan_queue::RedisQueuePlane;
use modscan_registry::{ModuleRegistry, ProcessContainerDriver};
use modscan_report::ReportStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "modscan", version, about = "modscan orchestrator operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file (same format as the daemon's).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest an artifact file into the content-addressed store.
    Ingest {
        /// Path to the file on disk.
        file: PathBuf,
    },

    /// List registered modules.
    ModulesList,

    /// Register an externally hosted module.
    ModulesRegisterExternal {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        author: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Accepted input formats, comma-separated (apk,ipa,zip,source).
        #[arg(long, value_delimiter = ',')]
        input_formats: Vec<String>,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        healthcheck_url: String,
    },

    /// Deregister a module.
    ModulesDeregister {
        #[arg(long, value_enum)]
        kind: ModuleKindArg,
        id: String,
    },

    /// Build an internal module's container image.
    ModulesBuild { id: String },
    /// Start an internal module's container.
    ModulesStart { id: String },
    /// Stop an internal module's container.
    ModulesStop { id: String },
    /// Rebuild and restart an internal module.
    ModulesRebuild { id: String },

    /// List stored chain definitions.
    ChainsList,
    /// Print one chain definition as JSON.
    ChainsGet { name: String },
    /// Create or replace a chain definition from a JSON file.
    ChainsPut {
        name: String,
        /// Path to a JSON file containing the chain's steps.
        file: PathBuf,
    },
    /// Delete a chain definition.
    ChainsDelete { name: String },

    /// Print the current auto-run rule table.
    AutoRunGet,
    /// Set the auto-run rule for one file type.
    AutoRunSet {
        #[arg(value_enum)]
        file_type: FileTypeArg,
        #[arg(value_enum)]
        kind: AutoRunKindArg,
        /// Module id (for `module`) or chain name (for `chain`).
        target_id: Option<String>,
    },

    /// Start a chain or module run explicitly, bypassing auto-run rules.
    Run {
        #[arg(long, conflicts_with = "module")]
        chain: Option<String>,
        #[arg(long, conflicts_with = "chain")]
        module: Option<String>,
        /// Fingerprint (hex sha256) of a previously ingested artifact.
        fingerprint: String,
        /// Block until the run reaches a terminal state and print the report.
        #[arg(long)]
        wait: bool,
    },

    /// Cancel a running chain. Only effective against runs started by a
    /// still-running `modscan-daemon` or `modscan` process; this CLI's own
    /// `run --wait` invocation holds its own handle in-process instead.
    Cancel {
        fingerprint: String,
        chain_run_id: Uuid,
    },

    /// Print a fingerprint's report as JSON.
    Report { fingerprint: String },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum ModuleKindArg {
    Internal,
    External,
}

impl From<ModuleKindArg> for ModuleKind {
    fn from(v: ModuleKindArg) -> Self {
        match v {
            ModuleKindArg::Internal => ModuleKind::Internal,
            ModuleKindArg::External => ModuleKind::External,
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum FileTypeArg {
    Apk,
    Ipa,
    Zip,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum AutoRunKindArg {
    None,
    Module,
    Chain,
}

/// Bundles the orchestrator components a subcommand might touch. Built once
/// per invocation from the resolved [`OrchestratorConfig`].
struct Orchestrator {
    registry: ModuleRegistry,
    chains: Arc<dyn ChainStore>,
    reports: ReportStore,
    store: modscan_store::ArtifactStore,
    executor: ChainExecutor,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    async fn build(config: &OrchestratorConfig) -> Result<Self> {
        let store_root = PathBuf::from(&config.store_root);

        let queue: Arc<dyn modscan_queue::QueuePlane> = Arc::new(
            RedisQueuePlane::connect(&config.redis_url)
                .await
                .context("connect to redis")?,
        );
        let registry = ModuleRegistry::new(
            PathBuf::from(&config.modules_dir),
            Arc::new(ProcessContainerDriver::default()),
            config.n_build_retries,
            queue.clone(),
        );
        registry.bootstrap().await.context("bootstrap module registry")?;

        let chains: Arc<dyn ChainStore> =
            Arc::new(FileChainStore::new(store_root.join("chains")).context("open chain store")?);
        let reports = ReportStore::new(store_root.join("reports"))
            .await
            .context("open report store")?;
        let store = modscan_store::ArtifactStore::new(store_root.join("artifacts"))
            .await
            .context("open artifact store")?;

        let executor = ChainExecutor::new(
            queue,
            registry.clone(),
            chains.clone(),
            reports.clone(),
            config.default_step_timeout_secs,
            config.lost_task_grace_secs,
        );
        let dispatcher = Dispatcher::new(executor.clone(), AutoRunSettings::new(AutoRunConfig::default()));

        Ok(Self {
            registry,
            chains,
            reports,
            store,
            executor,
            dispatcher,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("modscan=debug")
    } else {
        EnvFilter::new("modscan=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref()).context("load configuration")?;

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn parse_file_type(raw: &str) -> Result<FileType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "apk" => Ok(FileType::Apk),
        "ipa" => Ok(FileType::Ipa),
        "zip" => Ok(FileType::Zip),
        "source" => Ok(FileType::Source),
        other => anyhow::bail!("unknown file type '{other}' (expected apk, ipa, zip, or source)"),
    }
}

async fn run(command: Commands, config: &OrchestratorConfig) -> Result<()> {
    match command {
        Commands::Ingest { file } => {
            let orch = Orchestrator::build(config).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".into());
            let artifact = orch.store.ingest(&bytes, &name).await?;
            orch.reports.ensure_report(&artifact).await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }

        Commands::ModulesList => {
            let orch = Orchestrator::build(config).await?;
            println!("{}", serde_json::to_string_pretty(&orch.registry.list().await)?);
        }

        Commands::ModulesRegisterExternal {
            id,
            name,
            version,
            author,
            description,
            input_formats,
            base_url,
            healthcheck_url,
        } => {
            let orch = Orchestrator::build(config).await?;
            let input_formats = input_formats
                .iter()
                .map(|s| parse_file_type(s))
                .collect::<Result<Vec<_>>>()?;
            let descriptor = orch
                .registry
                .register_external(
                    id,
                    name,
                    version,
                    author,
                    description,
                    input_formats,
                    base_url,
                    healthcheck_url,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }

        Commands::ModulesDeregister { kind, id } => {
            let orch = Orchestrator::build(config).await?;
            orch.registry.deregister(kind.into(), &id).await?;
            println!("deregistered {id}");
        }

        Commands::ModulesBuild { id } => {
            let orch = Orchestrator::build(config).await?;
            orch.registry.build(&id).await?;
            println!("built {id}");
        }
        Commands::ModulesStart { id } => {
            let orch = Orchestrator::build(config).await?;
            orch.registry.start(&id).await?;
            println!("started {id}");
        }
        Commands::ModulesStop { id } => {
            let orch = Orchestrator::build(config).await?;
            orch.registry.stop(&id).await?;
            println!("stopped {id}");
        }
        Commands::ModulesRebuild { id } => {
            let orch = Orchestrator::build(config).await?;
            orch.registry.rebuild(&id).await?;
            println!("rebuilt {id}");
        }

        Commands::ChainsList => {
            let orch = Orchestrator::build(config).await?;
            println!("{}", serde_json::to_string_pretty(&orch.chains.list_chains().await?)?);
        }
        Commands::ChainsGet { name } => {
            let orch = Orchestrator::build(config).await?;
            println!("{}", serde_json::to_string_pretty(&orch.chains.get_chain(&name).await?)?);
        }
        Commands::ChainsPut { name, file } => {
            let orch = Orchestrator::build(config).await?;
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("read {}", file.display()))?;
            let mut chain: Chain =
                serde_json::from_str(&content).context("parse chain definition")?;
            chain.name = name;
            let known_ids: HashSet<String> =
                orch.registry.list().await.into_iter().map(|m| m.id).collect();
            orch.chains.put_chain(chain, &known_ids).await?;
            println!("saved");
        }
        Commands::ChainsDelete { name } => {
            let orch = Orchestrator::build(config).await?;
            orch.chains.delete_chain(&name).await?;
            println!("deleted {name}");
        }

        Commands::AutoRunGet => {
            // Auto-run settings live in daemon process memory; the CLI's
            // own view always starts from the built-in default since there
            // is no persisted store for it (spec §4.7 keeps this in-memory).
            println!("{}", serde_json::to_string_pretty(&AutoRunConfig::default())?);
        }
        Commands::AutoRunSet {
            file_type,
            kind,
            target_id,
        } => {
            let rule = AutoRunRule {
                kind: match kind {
                    AutoRunKindArg::None => AutoRunRuleKind::None,
                    AutoRunKindArg::Module => AutoRunRuleKind::Module,
                    AutoRunKindArg::Chain => AutoRunRuleKind::Chain,
                },
                target_id,
            };
            let mut config = AutoRunConfig::default();
            match file_type {
                FileTypeArg::Apk => config.apk = rule,
                FileTypeArg::Ipa => config.ipa = rule,
                FileTypeArg::Zip => config.zip = rule,
            }
            println!(
                "note: this only prints the rule; persist it via the daemon's PUT /auto-run"
            );
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Run {
            chain,
            module,
            fingerprint,
            wait,
        } => {
            let orch = Orchestrator::build(config).await?;
            let fingerprint = Fingerprint::parse(&fingerprint).context("parse fingerprint")?;
            let report = orch.reports.get_report(fingerprint).await?;

            let target = match (chain, module) {
                (Some(name), None) => RunTarget::Chain(name),
                (None, Some(id)) => RunTarget::Module(id),
                _ => anyhow::bail!("exactly one of --chain or --module is required"),
            };

            let handle = orch
                .dispatcher
                .run_explicit(
                    target,
                    fingerprint,
                    report.artifact_meta.extracted_root.clone(),
                    report.artifact_meta.detected_type,
                )
                .await?;
            let chain_run_id = handle.chain_run_id();
            println!("chain_run_id: {chain_run_id}");

            if wait {
                handle.join().await;
                let report = orch.reports.get_report(fingerprint).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }

        Commands::Cancel {
            fingerprint,
            chain_run_id,
        } => {
            let orch = Orchestrator::build(config).await?;
            let fingerprint = Fingerprint::parse(&fingerprint).context("parse fingerprint")?;
            orch.executor.cancel_persisted(fingerprint, chain_run_id).await?;
            println!("cancelled");
        }

        Commands::Report { fingerprint } => {
            let orch = Orchestrator::build(config).await?;
            let fingerprint = Fingerprint::parse(&fingerprint).context("parse fingerprint")?;
            let report = orch.reports.get_report(fingerprint).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
