use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use roadmap_engine::render::{render_manifest, render_steps};
use roadmap_engine::roadmap_core::db::Database;
use roadmap_engine::roadmap_core::models::{CandidateStep, CreateRoadmapInput};
use roadmap_engine::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "roadmap")]
#[command(about = "Dependency-aware roadmap engine")]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    Init,
    /// Create a roadmap from a JSON description ("-" reads stdin)
    Create {
        #[arg(long)]
        user: Uuid,
        file: PathBuf,
    },
    /// Print a roadmap as a tree
    Show {
        #[arg(long)]
        tree: Uuid,
        /// Print the manifest document instead
        #[arg(long)]
        json: bool,
    },
    /// Mark a step completed
    Complete {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        step: Uuid,
        #[arg(long)]
        reflection: Option<String>,
    },
    /// Add steps beneath an existing step
    Expand {
        #[arg(long)]
        step: Uuid,
        /// Free text handed to the step generator
        #[arg(long, conflicts_with = "candidates")]
        context: Option<String>,
        /// JSON array of candidate steps
        #[arg(long, requires = "fingerprint")]
        candidates: Option<PathBuf>,
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Phase progress and next-phase candidates
    Phases {
        #[arg(long)]
        tree: Uuid,
    },
    /// Steps whose dependencies are all finished
    Ready {
        #[arg(long)]
        tree: Uuid,
    },
    /// Audit log of a roadmap
    Audit {
        #[arg(long)]
        tree: Uuid,
    },
}

/// Initialize tracing on stderr so stdout stays clean for JSON output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "roadmap_engine=info,roadmap_core=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(path: Option<PathBuf>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::open(path)?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

fn read_input(path: &PathBuf) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let db = open_database(cli.db)?;
    let engine = Engine::new(Arc::new(db), EngineConfig::from_env());

    match cli.command {
        Commands::Init => {
            tracing::info!("Database ready");
        }
        Commands::Create { user, file } => {
            let input: CreateRoadmapInput = serde_json::from_str(&read_input(&file)?)?;
            let manifest = engine.create_roadmap(user, input)?;
            print_json(&manifest)?;
        }
        Commands::Show { tree, json } => {
            let manifest = engine.manifest(tree)?;
            if json {
                print_json(&manifest)?;
            } else {
                print!("{}", render_manifest(&manifest));
            }
        }
        Commands::Complete {
            user,
            step,
            reflection,
        } => {
            let result = engine.complete(step, user, reflection).await?;
            print_json(&result)?;
        }
        Commands::Expand {
            step,
            context,
            candidates,
            fingerprint,
        } => match (context, candidates) {
            (_, Some(path)) => {
                let candidates: Vec<CandidateStep> = serde_json::from_str(&read_input(&path)?)?;
                let fingerprint = fingerprint.unwrap_or_default();
                let result = engine.expand(step, candidates, &fingerprint).await?;
                print_json(&result)?;
            }
            (Some(context), None) => match engine.expand_from_context(step, &context).await? {
                Some(result) => print_json(&result)?,
                None => eprintln!("No steps were proposed; roadmap unchanged"),
            },
            (None, None) => anyhow::bail!("expand needs --context or --candidates"),
        },
        Commands::Phases { tree } => {
            let status = engine.evaluate_phases(tree).await?;
            print_json(&status)?;
        }
        Commands::Ready { tree } => {
            print!("{}", render_steps(&engine.ready_steps(tree)?));
        }
        Commands::Audit { tree } => {
            print_json(&engine.audit_log(tree)?)?;
        }
    }

    Ok(())
}
