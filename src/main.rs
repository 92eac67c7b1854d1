use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tunnel_supervisor::frp::types::DEFAULT_LOCAL_PORT;
use tunnel_supervisor::logging;
use tunnel_supervisor::state::{EndpointUpdate, JsonFileStore};
use tunnel_supervisor::{EndpointRegistry, EndpointSpec, Settings, SupervisorState, TunnelSupervisor};

const STATE_FILE_NAME: &str = "tunnel-state.json";

#[derive(Parser, Debug)]
#[command(name = "tunnel-supervisor", version)]
struct Args {
    /// YAML settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON file holding the server config and endpoints.
    #[arg(long)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    Endpoint {
        #[command(subcommand)]
        command: EndpointCommand,
    },
    /// Print the agent config that a start would write.
    Render,
    /// Copy the agent binary for this architecture into the data directory.
    Install,
    /// Collect a diagnostics report as JSON.
    Diagnose,
    /// Start the tunnel and supervise it until Ctrl-C.
    Run,
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    Set {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value_t = 7000)]
        port: u16,
        #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
        token: String,
    },
    Show,
}

#[derive(Subcommand, Debug)]
enum EndpointCommand {
    Add {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_LOCAL_PORT)]
        local_port: u16,
        /// Next free port when omitted.
        #[arg(long)]
        remote_port: Option<u16>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
    Update {
        id: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        local_port: Option<u16>,
        #[arg(long)]
        remote_port: Option<u16>,
    },
    List,
    Remove {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    Url {
        id: String,
    },
    NextPort,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load_or_default(args.config.as_deref())?;
    logging::init(&settings.log_level);

    let state_path = args
        .state
        .unwrap_or_else(|| settings.data_dir.join(STATE_FILE_NAME));
    let registry = EndpointRegistry::new(Arc::new(JsonFileStore::new(state_path)));
    let supervisor = TunnelSupervisor::new(settings);

    match args.command {
        Command::Server { command } => run_server_command(&registry, command),
        Command::Endpoint { command } => run_endpoint_command(&registry, command),
        Command::Render => {
            let server = registry.server_config()?;
            let endpoints = registry.enabled_endpoints()?;
            let artifact = supervisor.render_config(server.as_ref(), &endpoints)?;
            print!("{}", artifact.as_str());
            Ok(())
        }
        Command::Install => {
            let installed = supervisor.install().await?;
            println!("{}", serde_json::to_string_pretty(&installed)?);
            Ok(())
        }
        Command::Diagnose => {
            let server = registry.server_config()?;
            let endpoints = registry.endpoints()?;
            let report = supervisor.diagnostics_for(server, endpoints).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Run => run_tunnel(&supervisor, &registry).await,
    }
}

fn run_server_command(registry: &EndpointRegistry, command: ServerCommand) -> Result<()> {
    match command {
        ServerCommand::Set { addr, port, token } => {
            let server = registry.save_server_config(&addr, port, &token)?;
            println!("Server set to {}", server.address());
        }
        ServerCommand::Show => match registry.server_config()? {
            Some(server) => println!("{}", server.address()),
            None => println!("No server configured"),
        },
    }
    Ok(())
}

fn run_endpoint_command(registry: &EndpointRegistry, command: EndpointCommand) -> Result<()> {
    match command {
        EndpointCommand::Add {
            host,
            local_port,
            remote_port,
            id,
            disabled,
        } => {
            let remote_port = match remote_port {
                Some(port) => port,
                None => registry
                    .next_available_port()?
                    .ok_or_else(|| anyhow!("No free remote port left"))?,
            };
            let mut spec = EndpointSpec::new(id.unwrap_or_default(), host, local_port, remote_port);
            spec.enabled = !disabled;
            let added = registry.add_endpoint(spec)?;
            println!("{}", serde_json::to_string_pretty(&added)?);
        }
        EndpointCommand::Update {
            id,
            host,
            local_port,
            remote_port,
        } => {
            let update = EndpointUpdate {
                local_host: host,
                local_port,
                remote_port,
                enabled: None,
            };
            let updated = registry.update_endpoint(&id, update)?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        EndpointCommand::List => {
            println!("{}", serde_json::to_string_pretty(&registry.endpoints()?)?);
        }
        EndpointCommand::Remove { id } => {
            let removed = registry.remove_endpoint(&id)?;
            println!("Removed {}", removed.id);
        }
        EndpointCommand::Enable { id } => {
            registry.set_enabled(&id, true)?;
        }
        EndpointCommand::Disable { id } => {
            registry.set_enabled(&id, false)?;
        }
        EndpointCommand::Url { id } => {
            println!("{}", registry.stream_url(&id)?);
        }
        EndpointCommand::NextPort => match registry.next_available_port()? {
            Some(port) => println!("{}", port),
            None => println!("No free remote port left"),
        },
    }
    Ok(())
}

async fn run_tunnel(supervisor: &TunnelSupervisor, registry: &EndpointRegistry) -> Result<()> {
    let _logs = supervisor.on_log(|event| println!("[{}] {}", event.method, event.line));
    let _exits = supervisor.on_exit(|event| {
        log::info!("Agent ({}) exited with code {:?}", event.method, event.code);
    });

    let report = supervisor
        .start_from_store(registry)
        .await
        .context("Failed to start tunnel")?;
    for attempt in &report.attempts {
        log::debug!("Attempt {}: {:?}", attempt.strategy, attempt.outcome);
    }
    if report.method.is_simulation() {
        log::warn!("Running in simulation mode, no traffic is tunneled");
    }

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping tunnel");
                break;
            }
            _ = poll.tick() => {
                if supervisor.status().state == SupervisorState::Stopped {
                    log::warn!("Tunnel stopped on its own");
                    break;
                }
            }
        }
    }

    supervisor.stop_with_store(registry).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_server_set_takes_token_flag() {
        let args = Args::try_parse_from([
            "tunnel-supervisor",
            "server",
            "set",
            "--addr",
            "relay.example.com",
            "--token",
            "tok",
        ])
        .unwrap();
        match args.command {
            Command::Server {
                command: ServerCommand::Set { addr, port, token },
            } => {
                assert_eq!(addr, "relay.example.com");
                assert_eq!(port, 7000);
                assert_eq!(token, "tok");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
