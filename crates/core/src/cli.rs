use clap::{Parser, Subcommand};
use colored::Colorize;
use relay_shared::{AgentContext, AgentRequest};
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::db::{self, SqliteStateStore};
use crate::output;
use crate::runtime_state::{AgentStatus, RuntimeStateManager, StateKey};

#[derive(Parser)]
#[command(
    name = "relay_system",
    version = env!("CARGO_PKG_VERSION"),
    about = "Relay - multi-tenant agent plugin runtime"
)]
pub struct Cli {
    /// Output raw JSON (for scripting/piping)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered agents
    Agents,
    /// Run every agent's health check
    Health,
    /// Dispatch one request through the gateway
    Exec {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        prompt: String,
        /// Action type recorded in the tenant's counters
        #[arg(long, default_value = "message")]
        action: String,
    },
    /// Show runtime state for a tenant (optionally one agent)
    State {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Stop dispatching to an agent for a tenant
    Pause {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a paused agent
    Resume {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Close an agent's circuit breaker for a tenant
    ResetBreaker {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        agent: String,
    },
    /// Print version information
    Version,
}

/// Dispatch CLI subcommands
pub async fn dispatch(cmd: Commands, json_mode: bool) -> anyhow::Result<()> {
    match cmd {
        Commands::Agents => agents(json_mode).await,
        Commands::Health => health(json_mode).await,
        Commands::Exec {
            tenant,
            agent,
            prompt,
            action,
        } => exec(&tenant, &agent, prompt, &action, json_mode).await,
        Commands::State { tenant, agent } => state(&tenant, agent.as_deref(), json_mode).await,
        Commands::Pause {
            tenant,
            agent,
            reason,
        } => set_status(&tenant, &agent, AgentStatus::Paused, reason, json_mode).await,
        Commands::Resume {
            tenant,
            agent,
            reason,
        } => set_status(&tenant, &agent, AgentStatus::Active, reason, json_mode).await,
        Commands::ResetBreaker { tenant, agent } => reset_breaker(&tenant, &agent, json_mode).await,
        Commands::Version => {
            println!("Relay System v{}", env!("CARGO_PKG_VERSION"));
            println!("Agent SDK v{}", relay_shared::SDK_VERSION);
            Ok(())
        }
    }
}

/// State-only commands skip agent discovery.
async fn open_states() -> anyhow::Result<RuntimeStateManager> {
    let config = AppConfig::load()?;
    let pool = db::connect(&config.database_url).await?;
    Ok(RuntimeStateManager::new(
        Arc::new(SqliteStateStore::new(pool)),
        config.state_defaults(),
    ))
}

async fn agents(json_mode: bool) -> anyhow::Result<()> {
    let app = crate::build_state(AppConfig::load()?).await?;
    let agents = app.registry.list_all().await;
    app.shutdown().await;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    output::print_header("Registered Agents");
    output::print_agents_table(&agents);
    println!();
    Ok(())
}

async fn health(json_mode: bool) -> anyhow::Result<()> {
    let app = crate::build_state(AppConfig::load()?).await?;
    let report = app.registry.health_check_all().await;
    app.shutdown().await;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    output::print_header("Agent Health");
    output::print_health_table(&report);
    println!();
    Ok(())
}

async fn exec(
    tenant: &str,
    agent: &str,
    prompt: String,
    action: &str,
    json_mode: bool,
) -> anyhow::Result<()> {
    let app = crate::build_state(AppConfig::load()?).await?;
    let request = AgentRequest::new(prompt);
    let result = app
        .gateway
        .dispatch(tenant, agent, &request, AgentContext::new(), action)
        .await;
    app.shutdown().await;
    let response = result?;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    output::print_header(&format!("{agent} → {tenant}"));
    println!("  {}", response.message);
    if let Some(ms) = response.execution_time_ms {
        println!("  {}", format!("{ms} ms").dimmed());
    }
    println!();
    Ok(())
}

async fn state(tenant: &str, agent: Option<&str>, json_mode: bool) -> anyhow::Result<()> {
    let states = open_states().await?;
    let docs = match agent {
        Some(agent) => states
            .get_agent_state(&StateKey::new(tenant, agent))
            .await?
            .into_iter()
            .collect(),
        None => states.list_tenant_states(tenant).await?,
    };

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }
    output::print_header(&format!("Runtime State: {tenant}"));
    if docs.is_empty() {
        println!("  {}", "No runtime state recorded.".dimmed());
    }
    for doc in &docs {
        output::print_state(doc);
    }
    println!();
    Ok(())
}

async fn set_status(
    tenant: &str,
    agent: &str,
    status: AgentStatus,
    reason: Option<String>,
    json_mode: bool,
) -> anyhow::Result<()> {
    let states = open_states().await?;
    let doc = states
        .update_status(&StateKey::new(tenant, agent), status, reason)
        .await?;
    info!(tenant = %tenant, agent = %agent, status = %status, "Status updated from CLI");

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        output::print_state(&doc);
    }
    Ok(())
}

async fn reset_breaker(tenant: &str, agent: &str, json_mode: bool) -> anyhow::Result<()> {
    let states = open_states().await?;
    let doc = states
        .reset_circuit_breaker(&StateKey::new(tenant, agent))
        .await?;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        output::print_state(&doc);
    }
    Ok(())
}
