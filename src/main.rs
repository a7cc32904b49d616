#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

//! Maintenance CLI over the durable store. Message processing lives in the
//! embedding host; this binary only inspects and repairs state.

use anyhow::Result;
use burrow::config::Config;
use burrow::executor::Trigger;
use burrow::reminders::Store;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

/// Burrow - debounced conversation routing and single-flight task execution.
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Maintenance CLI for the burrow assistant core.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and manage durable reminders
    Reminders {
        #[command(subcommand)]
        command: ReminderCommands,
    },
    /// Inspect execution agent checkpoints
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ReminderCommands {
    /// List all reminders with status, schedule, and retry count
    List,
    /// Cancel a pending reminder (non-pending reminders are refused)
    Cancel {
        /// Reminder id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Show an agent's checkpointed status and last result
    Status {
        /// Agent id
        agent_id: String,
    },
    /// List an agent's triggers
    Triggers {
        /// Agent id
        agent_id: String,
    },
}

fn main() -> Result<()> {
    let config = Config::load_or_init()?;
    init_tracing(&config.observability.log_level);

    let store = Store::open(config.store_db_path());
    let cli = Cli::parse();
    match cli.command {
        Commands::Reminders { command } => handle_reminders(command, &store),
        Commands::Agents { command } => handle_agents(command, &store),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    fmt().with_env_filter(filter).init();
}

fn handle_reminders(command: ReminderCommands, store: &Store) -> Result<()> {
    match command {
        ReminderCommands::List => {
            let reminders = store.list_reminders()?;
            if reminders.is_empty() {
                println!("No reminders yet.");
                return Ok(());
            }

            println!("🕒 Reminders ({}):", reminders.len());
            for reminder in reminders {
                println!(
                    "- {} | {} | agent={} | scheduled={} | retries={}\n    task: {}",
                    reminder.id,
                    reminder.status,
                    reminder.agent_id,
                    reminder.scheduled_at.to_rfc3339(),
                    reminder.retry_count,
                    reminder.task_description
                );
                if let Some(error) = reminder.error_message {
                    println!("    error: {error}");
                }
            }
            Ok(())
        }
        ReminderCommands::Cancel { id } => {
            let Some(reminder) = store.find_reminder(&id)? else {
                anyhow::bail!("Reminder '{id}' not found");
            };
            // The in-process timer (if any) belongs to the daemon; the row
            // transition alone is enough, a later fire hits the status guard.
            if store.cancel_pending(&id)? {
                println!("✅ Cancelled reminder {id}");
                Ok(())
            } else {
                anyhow::bail!("Cannot cancel reminder with status: {}", reminder.status);
            }
        }
    }
}

fn handle_agents(command: AgentCommands, store: &Store) -> Result<()> {
    match command {
        AgentCommands::Status { agent_id } => {
            let Some(row) = store.load_agent(&agent_id)? else {
                anyhow::bail!("Agent '{agent_id}' not found");
            };
            println!("Agent {}", row.agent_id);
            println!("  status : {}", row.status);
            println!(
                "  task   : {}",
                row.task_description.as_deref().unwrap_or("n/a")
            );
            println!("  result : {}", row.result.as_deref().unwrap_or("n/a"));
            println!("  updated: {}", row.updated_at.to_rfc3339());
            Ok(())
        }
        AgentCommands::Triggers { agent_id } => {
            let Some(row) = store.load_agent(&agent_id)? else {
                anyhow::bail!("Agent '{agent_id}' not found");
            };
            let triggers: Vec<Trigger> = serde_json::from_str(&row.triggers_json)
                .unwrap_or_default();
            if triggers.is_empty() {
                println!("No triggers for agent {agent_id}.");
                return Ok(());
            }

            println!("Triggers for agent {agent_id} ({}):", triggers.len());
            for trigger in triggers {
                let rrule = trigger.rrule.as_deref().unwrap_or("one-shot");
                let last_run = trigger
                    .last_run_at
                    .map_or_else(|| "never".into(), |d| d.to_rfc3339());
                println!(
                    "- {} | {} | start={} | rrule={} | last_run={}\n    payload: {}",
                    trigger.id,
                    trigger.status,
                    trigger.start_time.to_rfc3339(),
                    rrule,
                    last_run,
                    trigger.payload
                );
            }
            Ok(())
        }
    }
}
