//! Navis CLI: drive the workflow engine from the command line.
//!
//! Every command goes through the same engine state that a host service
//! would embed.

use clap::{Parser, Subcommand};
use navis_cli::commands::{self, definitions::Format};

/// Navis: workflow orchestration engine
#[derive(Parser)]
#[command(name = "navis", version, about = "Navis: workflow orchestration engine")]
pub struct Cli {
    /// Path to the SQLite database file (overrides NAVIS_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Namespace assigned to definitions that declare none (overrides NAVIS_NAMESPACE)
    #[arg(long)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export registered workflow definitions
    Definitions {
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },

    /// Create and inspect workflow instances
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Route an external event to the workflows bound to it
    Event {
        /// Event name (e.g. "documents-uploaded")
        name: String,
        #[arg(long)]
        resource_name: String,
        #[arg(long)]
        resource_id: String,
        /// Step selector, for step-scoped handlers
        #[arg(long)]
        selector: Option<String>,
        /// Event payload as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Send a raw JSON-RPC request
    Rpc {
        /// JSON-RPC method name (e.g. "workflows.get")
        #[arg(long)]
        method: String,
        /// JSON-RPC params as a JSON string
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// List supported JSON-RPC methods
    Methods,
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Create a workflow instance bound to a resource
    Create {
        /// Definition key (e.g. "loan-application")
        key: String,
        #[arg(long, default_value = "default")]
        resource_name: String,
        /// Defaults to a random UUID
        #[arg(long)]
        resource_id: Option<String>,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        title: Option<String>,
        /// Start the workflow right after creating it
        #[arg(long)]
        start: bool,
    },
    /// Show the full state of a workflow instance
    Get {
        key: String,
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "navis_core=info,navis_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = commands::engine_config(cli.db, cli.namespace);

    let result = match cli.command {
        Some(command) => match commands::init_state(config) {
            Ok(state) => match command {
                Commands::Definitions { format } => commands::definitions::list(&state, format),
                Commands::Workflow { action } => match action {
                    WorkflowAction::Create {
                        key,
                        resource_name,
                        resource_id,
                        params,
                        title,
                        start,
                    } => {
                        commands::workflow::create(
                            &state,
                            &key,
                            &resource_name,
                            resource_id.as_deref(),
                            &params,
                            title.as_deref(),
                            start,
                        )
                        .await
                    }
                    WorkflowAction::Get { key, id } => commands::workflow::get(&state, &key, &id).await,
                },
                Commands::Event {
                    name,
                    resource_name,
                    resource_id,
                    selector,
                    data,
                } => {
                    commands::event::send(
                        &state,
                        &name,
                        &resource_name,
                        &resource_id,
                        selector.as_deref(),
                        &data,
                    )
                    .await
                }
                Commands::Rpc { method, params } => commands::rpc::call(&state, &method, &params).await,
                Commands::Methods => {
                    commands::rpc::methods(&state);
                    Ok(())
                }
            },
            Err(e) => Err(e),
        },
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
