// agentmesh — overlay node daemon and control-plane client
//
// `run` starts the node with its local gRPC control plane and wires
// SIGINT/SIGTERM to a graceful stop. The other subcommands are thin
// clients against a running node's control plane.

mod client;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use agentmesh_core::{
    api, AgentKeys, AgentNode, ContractRegistry, InMemoryRegistry, NodeOptions, NodeRole, Registry,
};

const DEFAULT_CONTROL: &str = "http://127.0.0.1:50051";

#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "AgentMesh — registry-gated overlay messaging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the overlay node with its local control plane
    Run(RunArgs),
    /// Send a message through a running node
    Send {
        #[arg(long, env = "CONTROL_ADDR", default_value = DEFAULT_CONTROL)]
        control: String,
        /// Recipient account address (0x…)
        recipient: String,
        /// Message text
        message: String,
    },
    /// List agents known to a running node
    Agents {
        #[arg(long, env = "CONTROL_ADDR", default_value = DEFAULT_CONTROL)]
        control: String,
    },
    /// Stream events from a running node
    Watch {
        #[arg(long, env = "CONTROL_ADDR", default_value = DEFAULT_CONTROL)]
        control: String,
    },
    /// Stop a running node
    Stop {
        #[arg(long, env = "CONTROL_ADDR", default_value = DEFAULT_CONTROL)]
        control: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// 32-byte account secret, hex encoded
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Network context; selects the compiled-in bootstrap set
    #[arg(long, env = "NETWORK", default_value = "base")]
    network: String,

    /// One of bootstrap|full|server|light
    #[arg(long, env = "NODE_TYPE", default_value = "full")]
    node_type: String,

    /// Overlay listen port (falls back to PORT, then 9000)
    #[arg(long, env = "P2P_PORT")]
    port: Option<u16>,

    /// Display name; selects the pinned bootstrap entry when matching
    #[arg(long, env = "AGENT_NAME", default_value = "agent")]
    agent_name: String,

    /// Seal outbound message content for the recipient
    #[arg(long, env = "USE_ENCRYPTION", default_value_t = false)]
    use_encryption: bool,

    /// Pinned overlay keypair for bootstrap peers (hex ed25519 secret)
    #[arg(long, env = "BOOTSTRAP_PRIVATE_KEY", hide_env_values = true)]
    bootstrap_private_key: Option<String>,

    /// On-chain registry contract address
    #[arg(long, env = "REGISTRY_ADDRESS")]
    registry_address: Option<String>,

    /// Read/write RPC endpoint
    #[arg(long, env = "RPC_URL")]
    rpc_url: Option<String>,

    /// Local control plane port
    #[arg(long, env = "CONTROL_PORT", default_value_t = 50051)]
    control_port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Send {
            control,
            recipient,
            message,
        } => client::send(&control, &recipient, &message).await,
        Commands::Agents { control } => client::agents(&control).await,
        Commands::Watch { control } => client::watch(&control).await,
        Commands::Stop { control } => client::stop(&control).await,
    };

    if let Err(e) = outcome {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_node(args: RunArgs) -> Result<()> {
    let node_type = NodeRole::from_str(&args.node_type)?;
    let port = args
        .port
        .or_else(|| {
            std::env::var("PORT")
                .ok()
                .and_then(|raw| raw.parse().ok())
        })
        .unwrap_or(9000);

    // BOOTSTRAP_NAME selects the pinned rendezvous entry when the
    // generic display name was left at its default.
    let agent_name = match std::env::var("BOOTSTRAP_NAME") {
        Ok(bootstrap_name) if args.agent_name == "agent" => bootstrap_name,
        _ => args.agent_name,
    };

    let options = NodeOptions {
        private_key: args.private_key.clone(),
        network: args.network,
        node_type,
        port,
        agent_name,
        use_encryption: args.use_encryption,
        bootstrap_private_key: args.bootstrap_private_key,
        bootstrap_peers: None,
    };

    let registry = build_registry(&args.private_key, args.registry_address, args.rpc_url).await?;

    let node = Arc::new(AgentNode::new(options, registry)?);
    node.start().await.context("Node startup failed")?;

    let control_addr = format!("127.0.0.1:{}", args.control_port)
        .parse()
        .context("Invalid control plane address")?;
    let api_task = tokio::spawn(api::serve(node.clone(), control_addr));

    wait_for_stop_signal().await;
    tracing::info!("Signal received; stopping node");
    let _ = node.stop().await;
    let _ = api_task.await;

    Ok(())
}

async fn build_registry(
    private_key: &str,
    registry_address: Option<String>,
    rpc_url: Option<String>,
) -> Result<Arc<dyn Registry>> {
    match (registry_address, rpc_url) {
        (Some(address), Some(url)) => {
            let contract = address
                .parse()
                .context("REGISTRY_ADDRESS is not an address")?;
            let registry = ContractRegistry::connect(&url, contract, private_key)
                .await
                .context("Registry RPC connection failed")?;
            Ok(Arc::new(registry))
        }
        (None, None) => {
            tracing::warn!("REGISTRY_ADDRESS/RPC_URL unset; using in-memory stub registry");
            let keys = AgentKeys::from_hex(private_key)?;
            Ok(Arc::new(InMemoryRegistry::new(keys.address())))
        }
        _ => anyhow::bail!("REGISTRY_ADDRESS and RPC_URL must be set together"),
    }
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
