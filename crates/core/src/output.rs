use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};
use relay_shared::AgentMetadata;
use std::collections::BTreeMap;

use crate::managers::RegistryInfo;
use crate::runtime_state::{AgentRuntimeState, AgentStatus, BreakerState};

/// Print a decorated section header.
pub fn print_header(title: &str) {
    let line = "─".repeat(36);
    println!();
    println!("  {}", title.bold());
    println!("  {}", line.dimmed());
}

/// Status dot: ● (active/green), ◐ (degraded/yellow), ○ (paused or down/dim).
pub fn status_dot(status: &str) -> String {
    match status {
        "active" | "healthy" | "closed" => "●".green().to_string(),
        "half_open" | "error" => "◐".yellow().to_string(),
        "circuit_breaker" | "open" | "unhealthy" => "●".red().to_string(),
        _ => "○".dimmed().to_string(),
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn print_agents_table(agents: &[AgentMetadata]) {
    if agents.is_empty() {
        println!("  {}", "No agents registered.".dimmed());
        return;
    }

    let mut table = table();
    for agent in agents {
        let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        table.add_row(vec![
            format!("  {}", agent.name.clone().bold()),
            agent.version.clone(),
            agent.model_tier.to_string().cyan().to_string(),
            caps.join(", ").dimmed().to_string(),
            agent.description.clone().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_health_table(report: &BTreeMap<String, bool>) {
    if report.is_empty() {
        println!("  {}", "No agents registered.".dimmed());
        return;
    }

    let mut table = table();
    for (name, healthy) in report {
        let label = if *healthy { "healthy" } else { "unhealthy" };
        table.add_row(vec![
            format!("  {}", status_dot(label)),
            name.clone().bold().to_string(),
            label.to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_registry_summary(info: &RegistryInfo) {
    print_header("Relay Registry");
    println!("  {}   {}", "Agents:".dimmed(), info.total_agents);
    println!(
        "  {}  {} executions, {} errors",
        "Metrics:".dimmed(),
        info.total_executions,
        if info.total_errors > 0 {
            info.total_errors.to_string().red().to_string()
        } else {
            info.total_errors.to_string()
        }
    );
    let tiers: Vec<String> = info.by_tier.iter().map(|(t, n)| format!("{t}={n}")).collect();
    println!("  {}    {}", "Tiers:".dimmed(), tiers.join(" "));
    let channels: Vec<String> = info.by_channel.iter().map(|(c, n)| format!("{c}={n}")).collect();
    println!("  {} {}", "Channels:".dimmed(), channels.join(" "));
}

pub fn print_state(state: &AgentRuntimeState) {
    let status = state.status.to_string();
    let breaker = state.circuit_breaker.state.to_string();
    println!(
        "  {} {}  {}",
        status_dot(&status),
        state.agent_name.clone().bold(),
        status
    );
    if let Some(reason) = &state.status_reason {
        if state.status != AgentStatus::Active {
            println!("      {} {}", "reason:".dimmed(), reason);
        }
    }

    let mut table = table();
    table.add_row(vec![
        "      breaker".dimmed().to_string(),
        format!("{} {}", status_dot(&breaker), breaker),
        if state.circuit_breaker.state == BreakerState::Closed {
            String::new()
        } else {
            state
                .circuit_breaker
                .cooldown_until
                .map(|t| format!("until {}", t.format("%H:%M:%S")))
                .unwrap_or_default()
        },
    ]);
    let hourly = &state.rate_limits.hourly;
    let daily = &state.rate_limits.daily;
    table.add_row(vec![
        "      hourly".dimmed().to_string(),
        format!("{}/{}", hourly.current, hourly.limit),
        format!("resets {}", hourly.reset_at.format("%H:%M")).dimmed().to_string(),
    ]);
    table.add_row(vec![
        "      daily".dimmed().to_string(),
        format!("{}/{}", daily.current, daily.limit),
        format!("resets {}", daily.reset_at.format("%Y-%m-%d %H:%M")).dimmed().to_string(),
    ]);
    let c = &state.counters;
    table.add_row(vec![
        "      actions".dimmed().to_string(),
        format!("{} ({} ok, {} failed)", c.actions_taken, c.actions_successful, c.actions_failed),
        format!("revenue {:.2}", c.revenue_generated).dimmed().to_string(),
    ]);
    table.add_row(vec![
        "      health".dimmed().to_string(),
        format!("{:.0}% success", state.health.success_rate_24h * 100.0),
        format!("{:.0} ms avg", state.health.average_response_time_ms).dimmed().to_string(),
    ]);
    println!("{table}");
}
