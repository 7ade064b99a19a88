//! Fleet Warden Control - operator CLI for wardend

mod client;
mod output;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client::WardenClient;
use serde::Serialize;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "wardenctl")]
#[command(about = "Fleet Warden - operator control", long_about = None)]
#[command(version)]
struct Cli {
    /// wardend API address
    #[arg(long, global = true, env = "WARDEN_URL", default_value = "http://127.0.0.1:8088")]
    url: String,

    /// Print raw JSON
    #[arg(long, global = true)]
    json: bool,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node summary: agent counts, breakers, peer link
    Status,

    /// Per-agent health, circuit state and failure probability
    Agents,

    /// Predictive, breaker and failover alerts
    Alerts,

    /// Circuit breaker table
    Breakers,

    /// Liveness of the daemon itself
    Health,

    /// Trigger a manual recovery
    Recover {
        agent: String,

        /// Recovery tier (1-4)
        #[arg(long, conflicts_with = "strategy")]
        tier: Option<u8>,

        /// restart, clear_state, restart_dependencies or restart_all
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Recent recovery actions, or sync attempts with --sync
    History {
        #[arg(long)]
        sync: bool,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// `--tier N` becomes `tierN`; the daemon validates the name
fn resolve_strategy(tier: Option<u8>, strategy: Option<String>) -> Result<String> {
    match (tier, strategy) {
        (Some(tier @ 1..=4), _) => Ok(format!("tier{}", tier)),
        (Some(tier), _) => bail!("tier must be between 1 and 4, got {}", tier),
        (None, Some(strategy)) => Ok(strategy),
        (None, None) => bail!("either --tier or --strategy is required"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = WardenClient::new(&cli.url, Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::Status => {
            let status = client.status().await?;
            if cli.json {
                return print_json(&status);
            }
            output::print_status(&status);
        }
        Commands::Agents => {
            let agents = client.agents().await?;
            if cli.json {
                return print_json(&agents);
            }
            output::print_agents(&agents);
        }
        Commands::Alerts => {
            let alerts = client.alerts().await?;
            if cli.json {
                return print_json(&alerts);
            }
            output::print_alerts(&alerts);
        }
        Commands::Breakers => {
            let breakers = client.breakers().await?;
            if cli.json {
                return print_json(&breakers);
            }
            output::print_breakers(&breakers);
        }
        Commands::Health => {
            let health = client.health().await?;
            if cli.json {
                return print_json(&health);
            }
            output::print_health(&health);
        }
        Commands::Recover { agent, tier, strategy } => {
            let strategy = resolve_strategy(tier, strategy)?;
            let response = client.trigger_recovery(&agent, &strategy).await?;
            if cli.json {
                return print_json(&response);
            }
            output::print_recovery(&response.action);
        }
        Commands::History { sync, limit } => {
            if sync {
                let history = client.sync_history(limit).await?;
                if cli.json {
                    return print_json(&history);
                }
                output::print_sync_history(&history);
            } else {
                let history = client.recovery_history(limit).await?;
                if cli.json {
                    return print_json(&history);
                }
                for action in &history.actions {
                    output::print_recovery(action);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strategy() {
        assert_eq!(resolve_strategy(Some(3), None).unwrap(), "tier3");
        assert_eq!(
            resolve_strategy(None, Some("clear_state".to_string())).unwrap(),
            "clear_state"
        );
        assert!(resolve_strategy(Some(7), None).is_err());
        assert!(resolve_strategy(None, None).is_err());
    }

    #[test]
    fn test_recover_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "wardenctl", "recover", "memory", "--tier", "2", "--strategy", "restart",
        ]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from(["wardenctl", "--json", "recover", "memory", "--tier", "2"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Recover { tier: Some(2), .. }));
    }
}
