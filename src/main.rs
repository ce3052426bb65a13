use std::io::Read;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnward::config::Config;
use turnward::host::HostLoop;

const DEFAULT_CONFIG_PATH: &str = "config/turnward.toml";

fn print_help() {
    println!(
        "\
turnward v{}

A turn-based agent runtime: signed control tokens, capability-gated tools,
per-turn sandboxes.

USAGE:
    turnward [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -a, --agent <NAME>    Agent model to run [default: the only configured agent]
    -h, --help            Print this help message and exit
    -V, --version         Print version and exit

INPUT:
    The initial user data is read from stdin: a JSON document, or plain
    text passed as a JSON string. The final output is printed to stdout.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax
    (account api_key and provider host only).

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, turnward=debug,warn)
    ANTHROPIC_API_KEY     API key for Anthropic Claude models
                          (from https://console.anthropic.com/)

EXAMPLES:
    echo '{{\"question\": \"hi\"}}' | turnward --agent helper
    echo 'summarize /tmp/notes.txt' | turnward /etc/turnward.toml
    RUST_LOG=debug turnward < input.json",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config_path: String,
    agent: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut agent = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("turnward v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--agent" | "-a" => {
                agent = Some(args.next().ok_or_else(|| anyhow!("--agent needs a value"))?);
            }
            other if other.starts_with("--agent=") => {
                agent = Some(other["--agent=".len()..].to_string());
            }
            other if other.starts_with('-') => bail!("unknown option '{other}' (see --help)"),
            other => {
                if config_path.is_some() {
                    bail!("unexpected argument '{other}' (see --help)");
                }
                config_path = Some(other.to_string());
            }
        }
    }
    Ok(Args {
        config_path: config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
        agent,
    })
}

/// JSON if it parses, the trimmed text otherwise; nothing is `null`.
fn user_data_from(input: &str) -> Value {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Logs go to stderr; stdout carries the agent's output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnward=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Loading configuration from {}", args.config_path);
    let config = Config::load(&args.config_path)?;

    let agent = match args.agent {
        Some(name) => name,
        None => match config.agents.as_slice() {
            [only] => only.name.clone(),
            [] => bail!("no [[agents]] configured in {}", args.config_path),
            _ => bail!("several agents configured; pick one with --agent"),
        },
    };

    let host = HostLoop::from_config(&config)?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let user_data = user_data_from(&input);

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            watcher.cancel();
        }
    });

    let outcome = host.ask(&agent, user_data, &cancel).await?;
    info!(
        "Session {} finished after {} turn(s): {}",
        outcome.session_id, outcome.turns, outcome.stop
    );
    println!("{}", outcome.output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_data_json() {
        assert_eq!(user_data_from(" {\"a\": 1}\n"), json!({"a": 1}));
    }

    #[test]
    fn test_user_data_plain_text() {
        assert_eq!(user_data_from("hello there\n"), json!("hello there"));
    }

    #[test]
    fn test_user_data_empty() {
        assert_eq!(user_data_from("  \n"), Value::Null);
    }
}
