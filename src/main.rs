use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use governor_lite::config::{NodeConfig, PeerConfig, ReaperConfig};
use governor_lite::governor::Governor;
use governor_lite::rpc::messages::HandleLocksRequest;
use governor_lite::rpc::AgentClient;
use governor_lite::shutdown::install_shutdown_handler;
use governor_lite::state::{KeyState, LockRequest};

#[derive(Parser, Debug)]
#[command(name = "governor-lite")]
#[command(version)]
#[command(about = "Peer governors coordinating exclusive key locks for a pool of agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a governor node
    Server(ServerArgs),

    /// Talk to a governor over the agent channel
    Agent {
        #[command(flatten)]
        client: AgentArgs,

        #[command(subcommand)]
        command: AgentCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for peer and agent connections
    #[arg(long, default_value = "7400")]
    port: u16,

    /// Unique node name (defaults to governor-<port>)
    #[arg(long)]
    node_name: Option<String>,

    /// Election priority. Higher wins, 0 never leads
    #[arg(long, default_value = "1")]
    priority: u32,

    /// Port for the HTTP control surface (optional)
    #[arg(long)]
    api_port: Option<u16>,

    /// Hostname advertised to peers
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Age after which the leader force-ends a job
    #[arg(long, default_value = "300000")]
    job_max_age_ms: u64,

    /// Pause between two reaper sweeps
    #[arg(long, default_value = "60000")]
    reap_interval_ms: u64,

    /// Every governor of the cluster as host:port. This node's own address
    /// may be included and is skipped.
    nodes: Vec<String>,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Governor address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:7400")]
    addr: String,

    /// Agent name to identify with
    #[arg(long, short = 'n', default_value = "cli-agent")]
    name: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum AgentCommands {
    /// Request locks and start a job
    Lock {
        /// Job type the locks are taken for
        job_type: String,

        /// Keys to lock
        keys: Vec<String>,

        /// Keys to check without locking
        #[arg(long)]
        probe: Vec<String>,

        /// Per-job maximum age before the reaper ends it
        #[arg(long)]
        max_age_ms: Option<u64>,

        /// Keep the connection open until Ctrl-C. The governor releases an
        /// agent's locks when its connection closes.
        #[arg(long)]
        hold: bool,
    },
    /// End a running job
    End {
        /// The job ID (UUID)
        job_id: Uuid,

        /// Keys to release instead of the ones the job started with
        #[arg(long)]
        keys: Option<Vec<String>>,
    },
    /// Register a job type for this agent
    Register {
        job_type: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct KeyOutput {
    key: String,
    locked: bool,
}

#[derive(Serialize)]
struct LockOutput {
    ok: bool,
    updated: bool,
    version: u64,
    job_id: Option<Uuid>,
    keys: Vec<KeyOutput>,
}

#[derive(Serialize)]
struct EndOutput {
    job_id: Uuid,
    updated: bool,
    version: u64,
}

#[derive(Serialize)]
struct RegisterOutput {
    agent: String,
    job_type: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

/// Drop the entries of `nodes` that resolve to this node's own listen
/// address.
async fn peers_excluding_self(nodes: &[String], hostname: &str, port: u16) -> Vec<PeerConfig> {
    let mut own: Vec<SocketAddr> = vec![SocketAddr::from(([127, 0, 0, 1], port))];
    if let Ok(resolved) = tokio::net::lookup_host((hostname, port)).await {
        own.extend(resolved);
    }

    let mut peers = Vec::new();
    for node in nodes {
        let is_self = match tokio::net::lookup_host(node.as_str()).await {
            Ok(mut resolved) => resolved.any(|addr| own.contains(&addr)),
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "Could not resolve node address");
                false
            }
        };
        if is_self {
            tracing::debug!(node = %node, "Skipping own address");
        } else {
            peers.push(PeerConfig { addr: node.clone() });
        }
    }
    peers
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let api_addr: Option<SocketAddr> = match args.api_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };
    let peers = peers_excluding_self(&args.nodes, &args.hostname, args.port).await;

    let config = NodeConfig {
        node_name: args
            .node_name
            .unwrap_or_else(|| format!("governor-{}", args.port)),
        hostname: args.hostname,
        listen_addr,
        api_addr,
        peers,
        priority: args.priority,
        reaper: ReaperConfig {
            job_max_age_ms: args.job_max_age_ms,
            interval_ms: args.reap_interval_ms,
        },
        ..NodeConfig::default()
    };

    tracing::info!(
        node = %config.node_name,
        listen_addr = %config.listen_addr,
        api_addr = ?config.api_addr,
        priority = config.priority,
        peers = ?config.peers.iter().map(|p| p.addr.as_str()).collect::<Vec<_>>(),
        "Starting governor-lite node"
    );

    let listener = TcpListener::bind(config.listen_addr).await?;
    let shutdown = install_shutdown_handler();
    Governor::new(config, shutdown).run(listener).await?;

    Ok(())
}

// =============================================================================
// Agent Command Handlers
// =============================================================================

fn key_state_label(state: KeyState) -> &'static str {
    match state {
        KeyState::Ok => "free",
        KeyState::Locked => "LOCKED",
    }
}

async fn handle_agent_lock(
    client: &AgentClient,
    job_type: String,
    keys: Vec<String>,
    probe: Vec<String>,
    max_age_ms: Option<u64>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let lock_data: Vec<LockRequest> = keys
        .into_iter()
        .map(LockRequest::lock)
        .chain(probe.into_iter().map(LockRequest::probe))
        .collect();
    let names: Vec<String> = lock_data.iter().map(|r| r.key.clone()).collect();

    let reply = client
        .handle_locks_with(HandleLocksRequest {
            agent_name: client.agent_name().to_string(),
            job_type,
            lock_data,
            date: None,
            max_age_ms,
        })
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = LockOutput {
                ok: reply.status.ok,
                updated: reply.status.updated,
                version: reply.status.version,
                job_id: reply.id,
                keys: names
                    .into_iter()
                    .zip(reply.status.per_key_state.iter())
                    .map(|(key, state)| KeyOutput {
                        key,
                        locked: *state == KeyState::Locked,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if reply.status.ok {
                println!("Locks granted (version {})", reply.status.version);
            } else {
                println!("Locks refused (version {})", reply.status.version);
            }
            if let Some(id) = reply.id {
                println!("Job ID: {}", id);
            }
            println!();
            println!("{:<40} STATE", "KEY");
            println!("{}", "-".repeat(48));
            for (key, state) in names.iter().zip(reply.status.per_key_state.iter()) {
                println!("{:<40} {}", key, key_state_label(*state));
            }
        }
    }

    Ok(())
}

async fn handle_agent_end(
    client: &AgentClient,
    job_id: Uuid,
    keys: Option<Vec<String>>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let lock_data = keys.map(|keys| keys.into_iter().map(LockRequest::lock).collect());
    let status = client.job_end(job_id, lock_data).await?;

    match output_format {
        OutputFormat::Json => {
            let output = EndOutput {
                job_id,
                updated: status.updated,
                version: status.version,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job {} ended", job_id);
            println!("Lock state version: {}", status.version);
        }
    }

    Ok(())
}

async fn handle_agent_register(
    client: &AgentClient,
    job_type: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    client.register_job(&job_type).await?;

    match output_format {
        OutputFormat::Json => {
            let output = RegisterOutput {
                agent: client.agent_name().to_string(),
                job_type,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "Registered job type '{}' for agent '{}'",
                job_type,
                client.agent_name()
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Agent { client, command } => {
            let agent = AgentClient::connect(&client.addr, client.name.clone()).await?;

            match command {
                AgentCommands::Lock {
                    job_type,
                    keys,
                    probe,
                    max_age_ms,
                    hold,
                } => {
                    handle_agent_lock(&agent, job_type, keys, probe, max_age_ms, &client.output)
                        .await?;
                    if hold {
                        eprintln!("Holding locks, press Ctrl-C to release");
                        tokio::signal::ctrl_c().await?;
                    }
                }
                AgentCommands::End { job_id, keys } => {
                    handle_agent_end(&agent, job_id, keys, &client.output).await?;
                }
                AgentCommands::Register { job_type } => {
                    handle_agent_register(&agent, job_type, &client.output).await?;
                }
            }

            agent.close();
        }
    }

    Ok(())
}
