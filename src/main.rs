use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use party_merge::merge::{CandidateFilter, MergeService, SchemaCatalog};
use party_merge::store::{connection::pool_from_config, PgStore};
use party_merge::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "party-merge")]
#[command(about = "Detect and merge duplicate party records across a relational schema")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still apply)
    #[arg(long, global = true, env = "PARTY_MERGE_CONFIG")]
    config: Option<PathBuf>,

    /// TOML schema description used instead of the database catalog
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the merge candidate table
    InitDb,
    /// Scan postal addresses and emails for duplicate parties
    FindCandidates,
    /// Merge every pending candidate
    RunBatch,
    /// Merge one party into another
    Merge {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Acting user, checked against the authorization roles
        #[arg(long)]
        user: String,
        #[arg(long)]
        skip_validation: bool,
    },
    /// Check whether a merge would be allowed
    Validate {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        user: String,
    },
    /// List merge candidates (open ones unless --all)
    Candidates {
        #[arg(long)]
        all: bool,
    },
    /// Block a candidate from auto-merge
    Block {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        reason: String,
    },
    /// Print the entity traversal order from the root
    Traversal,
    /// Print the schema catalog as TOML
    Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.operational.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = pool_from_config(&config).await?;
    let store = Arc::new(PgStore::new(pool, config.operational.catalog_schema.clone()));
    let service = MergeService::from_config(store.clone(), &config)?;

    if let Some(path) = &cli.catalog {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        service
            .catalog_cache()
            .install(SchemaCatalog::from_toml_str(&content)?)
            .await?;
        info!("Using schema catalog from {}", path.display());
    }

    match cli.command {
        Commands::InitDb => {
            store.initialize().await?;
            println!("Merge candidate table is ready");
        }
        Commands::FindCandidates => {
            let report = service.find_candidates().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::RunBatch => {
            let report = service.run_batch().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Merge {
            from,
            to,
            user,
            skip_validation,
        } => {
            let summary = service.merge(&from, &to, &user, skip_validation).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Validate { from, to, user } => {
            match service.validate_merge(&from, &to, &user).await {
                Ok(()) => println!("Merge of {from} into {to} is allowed"),
                Err(e) if e.is_rejection() => println!("Rejected: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Candidates { all } => {
            let filter = if all {
                CandidateFilter::All
            } else {
                CandidateFilter::Unprocessed
            };
            for candidate in service.list_candidates(filter).await? {
                let state = match (candidate.processed_at, candidate.blocked) {
                    (Some(at), _) => format!("processed {}", at.to_rfc3339()),
                    (None, true) => "blocked".to_string(),
                    (None, false) => "pending".to_string(),
                };
                println!(
                    "{} -> {} [{}] {}",
                    candidate.from_party_id, candidate.to_party_id, state, candidate.reason
                );
            }
        }
        Commands::Block { from, to, reason } => {
            if service.block_candidate(&from, &to, &reason).await? {
                println!("Blocked {from} -> {to}");
            } else {
                println!("No open candidate {from} -> {to}");
            }
        }
        Commands::Traversal => {
            let order = service.traversal_order().await?;
            for (index, entity) in order.iter().enumerate() {
                println!("{:>4}  {}", index, entity.name);
            }
        }
        Commands::Catalog => {
            let catalog = service.catalog().await?;
            print!("{}", catalog.to_toml_string()?);
        }
    }

    Ok(())
}
