#![forbid(unsafe_code)]

//! **meshframe-cli** – Command-line front end for the meshframe agent mesh
//! orchestrator.
//!
//! This binary wires an [`InMemoryBroker`] to an
//! [`meshframe_orchestrator::OrchestratorAgent`] and either serves
//! indefinitely (agents and a bus client connect over the same in-process
//! broker, e.g. in an embedding application) or submits a single query and
//! prints the answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use meshframe_bus_core::{BrokerConfig, EventBroker, EventHandler, InMemoryBroker};
use meshframe_llm_gateway::{Config as LlmConfig, LlmGateway};
use meshframe_orchestrator::{AgentRegistry, GatewayCompleter, LlmCompleter, OrchestratorAgent};
use meshframe_types::{Event, TopicPattern};
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshframe")]
#[command(about = "Meshframe agent mesh orchestrator CLI")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for a dispatched task to respond before timing out.
    #[arg(long, default_value_t = 30)]
    task_timeout_secs: u64,

    /// Heartbeat timeout after which an agent is marked unhealthy.
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    /// Maximum number of orchestration sessions in flight at once; further
    /// requests are rejected with a degraded "system busy" response.
    #[arg(long, default_value_t = 64)]
    max_concurrent_sessions: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and block until interrupted. Agents and
    /// clients embedding this process share the in-memory broker.
    Serve,
    /// Submit a single user query and print the resulting answer.
    Ask {
        /// The natural-language request to route through the mesh.
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("starting meshframe-cli v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(AgentRegistry::new(Duration::from_secs(cli.heartbeat_timeout_secs), 0));
    let llm: Arc<dyn LlmCompleter> = Arc::new(GatewayCompleter::new(
        LlmGateway::new(LlmConfig::from_env().context("loading LLM gateway configuration")?)
            .await
            .context("constructing LLM gateway")?,
    ));
    let broker = InMemoryBroker::new("meshframe://cli", BrokerConfig::default());

    let orchestrator = OrchestratorAgent::new(
        registry,
        llm,
        broker.clone() as Arc<dyn EventBroker>,
        "meshframe://orchestrator",
        Duration::from_secs(cli.task_timeout_secs),
        Duration::from_secs(5),
        Duration::from_secs(10),
        Duration::from_secs(10),
        cli.max_concurrent_sessions,
    );
    orchestrator.start().await.context("starting orchestrator")?;

    match cli.command {
        Commands::Serve => run_serve(broker).await,
        Commands::Ask { query } => run_ask(broker, query).await,
    }
}

async fn run_serve(broker: Arc<InMemoryBroker>) -> Result<()> {
    info!("orchestrator running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    broker.stop().await.context("stopping broker")?;
    Ok(())
}

async fn run_ask(broker: Arc<InMemoryBroker>, query: String) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let capture: Arc<dyn EventHandler> = Arc::new(CaptureFirstResponse { tx: std::sync::Mutex::new(Some(tx)) });
    broker
        .subscribe("meshframe-cli", TopicPattern::new("user.response")?, capture)
        .await?;

    let request = Event::builder("user.request", "meshframe://cli")
        .data(serde_json::json!({ "query": query }))
        .build()?;
    broker.publish(request).await?;

    let response = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .context("timed out waiting for a response")??;
    println!("{}", response.data()["answer"].as_str().unwrap_or(""));

    broker.stop().await.context("stopping broker")?;
    Ok(())
}

struct CaptureFirstResponse {
    tx: std::sync::Mutex<Option<oneshot::Sender<Event>>>,
}

#[async_trait]
impl EventHandler for CaptureFirstResponse {
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error> {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(event);
        }
        Ok(())
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init().ok();
    Ok(())
}
