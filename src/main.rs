mod doctor;
mod subscriptions;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowlink_core::config::AppConfig;
use flowlink_core::types::{EngineEvent, ScopeId};
use flowlink_engine::{EngineConfig, SyncEngine, WsConnector};

use subscriptions::TriggerSubscriptions;

#[derive(Parser)]
#[command(name = "flowlink", version, about = "Client for a workflow execution backend")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowlink.toml")]
    config: PathBuf,

    /// Backend WebSocket URL (overrides the config file)
    #[arg(long, env = "FLOWLINK_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resync a workflow and print its state
    Status {
        /// Workflow id
        workflow: String,
    },
    /// Execute a whole workflow
    Run {
        /// Workflow id
        workflow: String,
        /// Extra request fields as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Keep printing node status changes until interrupted
        #[arg(long)]
        follow: bool,
    },
    /// Execute a single node
    Exec {
        /// Workflow id
        workflow: String,
        /// Node id
        node: String,
        /// Extra request fields as a JSON object
        #[arg(long)]
        input: Option<String>,
    },
    /// Stop the running execution of a workflow
    Stop {
        /// Workflow id
        workflow: String,
    },
    /// Deploy a workflow for continuous triggering
    Deploy {
        /// Workflow id
        workflow: String,
        /// Extra request fields as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Print deployment changes until it reaches a terminal state
        #[arg(long)]
        follow: bool,
    },
    /// Cancel a deployment
    Undeploy {
        /// Workflow id
        workflow: String,
    },
    /// Fetch the authoritative deployment status
    Deployment {
        /// Workflow id
        workflow: String,
    },
    /// Arm trigger nodes and print each activation
    Wait {
        /// Workflow id
        workflow: String,
        /// Trigger node ids
        #[arg(required = true)]
        nodes: Vec<String>,
        /// Exit after this many activations (0 = until interrupted)
        #[arg(long, default_value = "1")]
        count: usize,
        /// Extra request fields as a JSON object
        #[arg(long)]
        input: Option<String>,
    },
    /// Stream engine events as JSON lines
    Watch {
        /// Only show events for this workflow (and make it active)
        workflow: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Run configuration and connectivity checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    let command = match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "flowlink", &mut std::io::stdout());
            return Ok(());
        }
        command => command,
    };

    let config = load_config(&cli.config, cli.url.as_deref())?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            doctor::run_doctor(&config).await;
        }
        Commands::Status { workflow } => {
            let engine = connect(&config).await?;
            let scope = ScopeId::from(workflow);
            engine.switch_active_scope(scope.clone()).await?;
            print_json(&serde_json::to_value(engine.scope(scope).snapshot())?);
            engine.close().await;
        }
        Commands::Run {
            workflow,
            input,
            follow,
        } => {
            let engine = connect(&config).await?;
            let scope = ScopeId::from(workflow);
            let events = engine.subscribe();
            let response = engine
                .execute_workflow(&scope, parse_input(input.as_deref())?)
                .await?;
            print_json(&response);
            if follow {
                stream_events(events, Some(&scope), |_| false).await;
            }
            engine.close().await;
        }
        Commands::Exec {
            workflow,
            node,
            input,
        } => {
            let engine = connect(&config).await?;
            let response = engine
                .execute_node(&ScopeId::from(workflow), &node, parse_input(input.as_deref())?)
                .await?;
            print_json(&response);
            engine.close().await;
        }
        Commands::Stop { workflow } => {
            let engine = connect(&config).await?;
            print_json(&engine.stop_execution(&ScopeId::from(workflow)).await?);
            engine.close().await;
        }
        Commands::Deploy {
            workflow,
            input,
            follow,
        } => {
            let engine = connect(&config).await?;
            let scope = ScopeId::from(workflow);
            let events = engine.subscribe();
            let response = engine
                .deploy_workflow(&scope, parse_input(input.as_deref())?)
                .await?;
            print_json(&response);
            if follow {
                stream_events(events, Some(&scope), |event| {
                    matches!(
                        event,
                        EngineEvent::DeploymentChanged { status, .. } if status.state.is_terminal()
                    )
                })
                .await;
            }
            engine.close().await;
        }
        Commands::Undeploy { workflow } => {
            let engine = connect(&config).await?;
            print_json(&engine.cancel_deployment(&ScopeId::from(workflow)).await?);
            engine.close().await;
        }
        Commands::Deployment { workflow } => {
            let engine = connect(&config).await?;
            let status = engine
                .fetch_deployment_status(&ScopeId::from(workflow))
                .await?;
            print_json(&serde_json::to_value(status)?);
            engine.close().await;
        }
        Commands::Wait {
            workflow,
            nodes,
            count,
            input,
        } => {
            let engine = connect(&config).await?;
            let scope = ScopeId::from(workflow);
            let params = parse_input(input.as_deref())?;

            let mut subs = TriggerSubscriptions::new(engine.clone());
            for node in nodes {
                subs.add(scope.clone(), node, params.clone());
            }
            subs.arm_all()?;

            let mut fired = 0usize;
            loop {
                tokio::select! {
                    firing = subs.next() => {
                        let firing = firing?;
                        print_json(&serde_json::json!({
                            "workflow_id": firing.scope,
                            "node_id": firing.node_id,
                            "payload": firing.payload,
                        }));
                        fired += 1;
                        if count != 0 && fired >= count {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, cancelling trigger waits");
                        break;
                    }
                }
            }
            subs.cancel_all().await;
            engine.close().await;
        }
        Commands::Watch { workflow } => {
            let engine = connect(&config).await?;
            let events = engine.subscribe();
            let scope = workflow.map(ScopeId::from);
            if let Some(scope) = &scope {
                engine.switch_active_scope(scope.clone()).await?;
            }
            stream_events(events, scope.as_ref(), |_| false).await;
            engine.close().await;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path, url: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        AppConfig::load(path)?
    } else if let Some(url) = url {
        AppConfig::for_url(url)
    } else {
        bail!(
            "No config file at {} and no --url given (or set FLOWLINK_URL)",
            path.display()
        );
    };

    if let Some(url) = url {
        config.connection.url = url.to_string();
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: &AppConfig) -> anyhow::Result<SyncEngine> {
    let connector = Arc::new(WsConnector::new(config.connection.url.clone()));
    let engine = SyncEngine::new(EngineConfig::from(config), connector);
    engine.connect();
    let generation = engine
        .wait_connected(Duration::from_secs(config.requests.default_timeout_secs))
        .await
        .with_context(|| format!("Could not reach {}", config.connection.url))?;
    info!(endpoint = %config.connection.url, generation, "Connected");
    Ok(engine)
}

fn parse_input(input: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(text) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str(text).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {other}"),
    }
}

/// Print events (optionally for one scope) as JSON lines until `done`
/// matches one or the user interrupts.
async fn stream_events(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    scope: Option<&ScopeId>,
    done: impl Fn(&EngineEvent) -> bool,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if scope.is_some() && event.scope_id().is_some() && event.scope_id() != scope {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "Failed to serialize event"),
                    }
                    if done(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}
