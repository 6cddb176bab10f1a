//! edgetunnel - cloud/edge tunnel multiplexer
//!
//! The cloud accepts one authenticated stream per edge node; TCP connections
//! in either direction are multiplexed over it.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config_file, ConfigFile, TokenCacheConfig};
use edgetunnel_auth::{TokenAuthenticator, TokenCache, TokenGenerator};
use edgetunnel_control::{
    AgentConfig, AllowAll, AllowList, EdgeAgent, FatalHook, ForwardRule, Role, TargetResolver,
    TcpDialer, TcpForwarder, TcpModule, TunnelContext, TunnelServer,
};
use edgetunnel_proto::Category;
use edgetunnel_transport::{TcpTransportConnector, TcpTransportListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "edgetunnel")]
#[command(about = "Multiplex TCP connections between a cloud and its edge nodes")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "EDGETUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "EDGETUNNEL_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept edge streams and relay connections
    #[command(long_about = r#"
Accept authenticated streams from edge nodes and multiplex connections
over them.

EXAMPLES:
  # Listen for edges, forward local port 2222 to ssh on edge-1
  edgetunnel cloud --listen 0.0.0.0:9000 \
    --tokens /etc/edgetunnel/tokens \
    --forward 127.0.0.1:2222=edge-1/127.0.0.1:22

ENVIRONMENT VARIABLES:
  EDGETUNNEL_LISTEN   Address edges connect to
  EDGETUNNEL_TOKENS   Credentials file (one name:token per line)
    "#)]
    Cloud {
        #[arg(long, env = "EDGETUNNEL_LISTEN")]
        listen: Option<String>,

        #[arg(long, env = "EDGETUNNEL_TOKENS")]
        tokens: Option<PathBuf>,

        /// LISTEN=NODE/TARGET, repeatable
        #[arg(long = "forward")]
        forwards: Vec<String>,
    },

    /// Connect this node to the cloud
    #[command(long_about = r#"
Open the uplink stream to the cloud and serve connection requests for
this node. The process exits when the uplink is lost so a supervisor
can restart it.

EXAMPLES:
  edgetunnel edge --cloud cloud.example.com:9000 \
    --node edge-1 --token $EDGETUNNEL_TOKEN

ENVIRONMENT VARIABLES:
  EDGETUNNEL_CLOUD    Cloud address
  EDGETUNNEL_NODE     Node name
  EDGETUNNEL_TOKEN    Node token
    "#)]
    Edge {
        #[arg(long, env = "EDGETUNNEL_CLOUD")]
        cloud: Option<String>,

        #[arg(long, env = "EDGETUNNEL_NODE")]
        node: Option<String>,

        #[arg(long, env = "EDGETUNNEL_TOKEN")]
        token: Option<String>,

        /// LISTEN=NODE/TARGET, repeatable
        #[arg(long = "forward")]
        forwards: Vec<String>,

        /// Target this edge may dial (repeatable; none allows all)
        #[arg(long = "allow")]
        allow: Vec<String>,
    },

    /// Generate a token and print its credentials file line
    GenToken {
        /// Node the token is for (use "default" for the fallback entry)
        #[arg(long)]
        node: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn parse_forwards(rules: &[String]) -> Result<Vec<ForwardRule>> {
    rules
        .iter()
        .map(|rule| rule.parse::<ForwardRule>().map_err(anyhow::Error::msg))
        .collect()
}

async fn start_forwarders(ctx: &Arc<TunnelContext>, rules: Vec<ForwardRule>) -> Result<()> {
    for rule in rules {
        let listen = rule.listen.clone();
        let forwarder = TcpForwarder::bind(ctx.clone(), rule)
            .await
            .with_context(|| format!("Failed to bind forward listener {}", listen))?;
        tokio::spawn(async move {
            if let Err(e) = forwarder.run().await {
                error!(listen = %listen, error = %e, "Forwarder stopped");
            }
        });
    }
    Ok(())
}

async fn run_cloud(
    file: ConfigFile,
    listen: Option<String>,
    tokens: Option<PathBuf>,
    forwards: Vec<String>,
) -> Result<()> {
    let listen = listen
        .or(file.cloud.listen)
        .context("Listen address is required (use --listen or config file)")?;
    let token_config = match (tokens, file.cloud.tokens) {
        (Some(path), Some(cfg)) => TokenCacheConfig { path, ..cfg },
        (Some(path), None) => TokenCacheConfig {
            path,
            refresh_interval: 10,
        },
        (None, Some(cfg)) => cfg,
        (None, None) => anyhow::bail!("Token file is required (use --tokens or config file)"),
    };
    let mut rules = parse_forwards(&file.cloud.forwards)?;
    rules.extend(parse_forwards(&forwards)?);

    let cache = Arc::new(
        TokenCache::load(&token_config.path)
            .await
            .context("Failed to load token file")?,
    );
    let refresh = cache
        .clone()
        .spawn_refresh(Duration::from_secs(token_config.refresh_interval.max(1)));

    let ctx = TunnelContext::new(Role::Cloud, file.tunnel).await;
    TcpModule::with_defaults(&ctx)
        .register(&ctx, Category::Tcp)
        .await;
    start_forwarders(&ctx, rules).await?;

    let listener = TcpTransportListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    let server = TunnelServer::new(ctx.clone(), Arc::new(TokenAuthenticator::new(cache)));

    info!(listen = %listen, "Cloud started");

    let result = tokio::select! {
        result = server.serve(listener) => result.context("Tunnel server stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    refresh.abort();
    result
}

async fn run_edge(
    file: ConfigFile,
    cloud: Option<String>,
    node: Option<String>,
    token: Option<String>,
    forwards: Vec<String>,
    allow: Vec<String>,
) -> Result<()> {
    let cloud_addr = cloud
        .or(file.edge.cloud_addr)
        .context("Cloud address is required (use --cloud or config file)")?;
    let node_name = node
        .or(file.edge.node_name)
        .context("Node name is required (use --node or config file)")?;
    let token = token
        .or(file.edge.token)
        .context("Token is required (use --token, EDGETUNNEL_TOKEN or config file)")?;

    let mut rules = parse_forwards(&file.edge.forwards)?;
    rules.extend(parse_forwards(&forwards)?);
    let allow = if allow.is_empty() { file.edge.allow } else { allow };

    let ctx = TunnelContext::new(
        Role::Edge {
            node: node_name.clone(),
        },
        file.tunnel,
    )
    .await;

    let resolver: Arc<dyn TargetResolver> = if allow.is_empty() {
        Arc::new(AllowAll)
    } else {
        info!(targets = allow.len(), "Restricting dial targets");
        Arc::new(AllowList::new(allow))
    };
    TcpModule::new(
        Arc::new(TcpDialer::new(ctx.config().dial_timeout)),
        resolver,
    )
    .register(&ctx, Category::Tcp)
    .await;
    start_forwarders(&ctx, rules).await?;

    let fatal: FatalHook = Arc::new(|reason: &str| {
        error!(reason = %reason, "Uplink lost, exiting");
        std::process::exit(1);
    });

    let agent = EdgeAgent::new(
        ctx.clone(),
        AgentConfig {
            cloud_addr,
            node_name,
            token,
        },
        fatal,
    );
    let connector = TcpTransportConnector::new(ctx.config().handshake_timeout);

    tokio::select! {
        result = agent.run(&connector) => {
            result.context("Uplink failed")?;
            warn!("Uplink closed by cloud");
            anyhow::bail!("Uplink closed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Cloud {
            listen,
            tokens,
            forwards,
        } => run_cloud(file, listen, tokens, forwards).await,
        Commands::Edge {
            cloud,
            node,
            token,
            forwards,
            allow,
        } => run_edge(file, cloud, node, token, forwards, allow).await,
        Commands::GenToken { node } => {
            if node.is_empty() || node.contains(':') {
                anyhow::bail!("Node name must be non-empty and must not contain ':'");
            }
            let token = TokenGenerator::generate();
            println!("{}", TokenGenerator::credentials_line(&node, &token));
            Ok(())
        }
    }
}
