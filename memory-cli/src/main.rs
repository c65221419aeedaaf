use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memory_config::EngineConfig;
use memory_core::{MemoryEngine, Partition, RetrievalQuery, StoreRequest};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "memory-cli", version, about = "Cognitive memory engine control plane")]
struct Cli {
    /// Path to the engine's TOML configuration file.
    #[arg(long, global = true, default_value = "memory.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify, embed, and store a new memory.
    Store {
        content: String,
        #[arg(long, default_value = "cli")]
        agent_id: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        private_hint: bool,
    },
    /// Hybrid recall against a partition.
    Recall {
        query: String,
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        min_score: Option<f32>,
        #[arg(long, default_value = "cli")]
        agent_id: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Run a dream compaction cycle for an agent's cells in a partition.
    Dream {
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
        #[arg(long, default_value = "cli")]
        agent_id: String,
        #[arg(long)]
        budget_seconds: Option<u64>,
    },
    /// Check whether a dream cycle is due for an agent.
    ShouldDream {
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
        #[arg(long, default_value = "cli")]
        agent_id: String,
    },
    /// Run one consolidation batch over a partition.
    Consolidate {
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
    },
    /// Mine recurring patterns over a partition.
    Mine {
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
    },
    /// Apply feedback sentiment to the cells most recently recalled.
    Feedback {
        /// Memory ids most recently recalled, space separated.
        #[arg(long, num_args = 1.., required = true)]
        cell_ids: Vec<uuid::Uuid>,
        #[arg(long, value_enum, default_value = "shared")]
        partition: CliPartition,
        response: String,
    },
    /// Warm the in-process keyword index from the shared partition.
    Bootstrap,
    /// Read, write, list, or delete a named shared block.
    Shared {
        #[command(subcommand)]
        command: SharedCommands,
    },
}

#[derive(Debug, Subcommand)]
enum SharedCommands {
    Get {
        name: String,
    },
    Set {
        name: String,
        content: String,
        #[arg(long, default_value = "cli")]
        writer: String,
    },
    Delete {
        name: String,
    },
    List,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliPartition {
    Shared,
    Private,
    Profiles,
    Skills,
}

impl From<CliPartition> for Partition {
    fn from(value: CliPartition) -> Self {
        match value {
            CliPartition::Shared => Partition::Shared,
            CliPartition::Private => Partition::Private,
            CliPartition::Profiles => Partition::Profiles,
            CliPartition::Skills => Partition::Skills,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading engine config at {}", cli.config))?;
    let engine = MemoryEngine::new(config)?;

    match cli.command {
        Commands::Store { content, agent_id, user_id, private_hint } => {
            if let Some(user_id) = &user_id {
                engine.record_preference_signal(user_id, &agent_id, &content, None);
            }
            let outcome = engine
                .store(StoreRequest {
                    content,
                    agent_id,
                    user_id,
                    context_hint_private: private_hint,
                    extra_entities: Vec::new(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "action": format!("{:?}", outcome.action),
                "cell": outcome.cell.map(|c| c.id),
            }))?);
        }
        Commands::Recall { query, partition, limit, min_score, agent_id, user_id } => {
            let results = engine
                .recall(partition.into(), RetrievalQuery { text: query, limit, min_score, agent_id, user_id })
                .await?;
            for result in results {
                println!("{:.3}  {}  {}", result.score, result.cell.id, result.cell.content);
            }
        }
        Commands::Dream { partition, agent_id, budget_seconds } => {
            let budget = budget_seconds.map(std::time::Duration::from_secs);
            let report = engine.dream(partition.into(), &agent_id, budget).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "deduped": report.deduped,
                "episodic_merged": report.episodic_merged,
                "pruned": report.pruned,
                "strengthened": report.strengthened,
                "aborted_on_budget": report.aborted_on_budget,
            }))?);
        }
        Commands::ShouldDream { partition, agent_id } => {
            let due = engine.should_dream(partition.into(), &agent_id).await?;
            println!("{due}");
        }
        Commands::Consolidate { partition } => {
            let (report, next_offset) = engine.consolidate_batch(partition.into(), None).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "contradictions_flagged": report.contradictions_flagged,
                "merges": report.merges,
                "promotions": report.promotions,
                "demotions": report.demotions,
                "next_offset": next_offset,
            }))?);
        }
        Commands::Mine { partition } => {
            let report = engine.mine_patterns(partition.into()).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "clusters": report.clusters.len(),
                "recurring_errors": report.recurring_errors,
                "cooccurrences": report.cooccurrences,
                "patterns_persisted": report.patterns_persisted,
            }))?);
        }
        Commands::Feedback { cell_ids, partition, response } => {
            let partition: Partition = partition.into();
            let cells = engine.get_cells(partition, &cell_ids).await?;
            let outcomes = engine.apply_feedback(partition, &cells, &response).await?;
            for outcome in outcomes {
                println!("{}  promoted_to_core={}", outcome.cell_id, outcome.promoted_to_core);
            }
        }
        Commands::Bootstrap => {
            let added = engine.bootstrap_keyword_index().await;
            println!("added {added} entries to the keyword index");
        }
        Commands::Shared { command } => match command {
            SharedCommands::Get { name } => {
                let block = engine.get_shared_block(&name).await?;
                println!("{}", serde_json::to_string_pretty(&block)?);
            }
            SharedCommands::Set { name, content, writer } => {
                let version = engine.set_shared_block(&name, &content, &writer).await?;
                println!("version {version}");
            }
            SharedCommands::Delete { name } => {
                engine.delete_shared_block(&name).await?;
                println!("deleted");
            }
            SharedCommands::List => {
                let blocks = engine.list_shared_blocks().await?;
                println!("{}", serde_json::to_string_pretty(&blocks)?);
            }
        },
    }

    Ok(())
}
