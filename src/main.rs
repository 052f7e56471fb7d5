//! Burrow - expose services behind NAT through a public relay
//!
//! `burrow server` runs the relay, `burrow agent` runs next to the services.

use anyhow::{bail, Context, Result};
use burrow_auth::{AllowAll, JwtVerifier, StaticTokenVerifier, TokenVerifier};
use burrow_client::{Agent, AgentConfig, ProxyDef};
use burrow_control::{PortRange, ServerConfig};
use burrow_server::Server;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - reverse tunnel for TCP and HTTP services
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the relay. Agents dial the bind address; tcp proxies get their own public
port and http proxies share the vhost port, routed by Host header and path.

EXAMPLES:
  # Relay with a shared token and an HTTP vhost port
  burrow server --bind 0.0.0.0:7000 --vhost-http-port 80 --token $TOKEN

  # Subdomain routing and a restricted tcp port range
  burrow server --subdomain-host tunnel.example.com --vhost-http-port 80 \
    --allowed-ports 6000-6100 --token $TOKEN

ENVIRONMENT VARIABLES:
  BURROW_BIND            Agent listener address
  BURROW_TOKEN           Shared authentication token
  BURROW_JWT_SECRET      HS256 secret; agents then present JWTs
"#)]
    Server(ServerArgs),

    /// Connect to a relay and expose local services
    #[command(long_about = r#"
Connect to a relay and expose local services. Reconnects with exponential
backoff when the connection drops.

EXAMPLES:
  # Proxies from a config file
  burrow agent --config agent.yaml

  # Expose local SSH on relay port 6000 and a web app under www.example.com
  burrow agent --server relay.example.com:7000 --token $TOKEN \
    --tcp ssh:22:6000 --http web:8080:www.example.com

ENVIRONMENT VARIABLES:
  BURROW_SERVER          Relay address
  BURROW_TOKEN           Shared authentication token
"#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address agents connect to
    #[arg(long, env = "BURROW_BIND", default_value = "0.0.0.0:7000")]
    bind: SocketAddr,

    /// Address public proxy ports bind to
    #[arg(long, default_value = "0.0.0.0")]
    proxy_bind: IpAddr,

    /// Shared HTTP port for http proxies
    #[arg(long)]
    vhost_http_port: Option<u16>,

    /// Domain suffix for subdomain proxies (e.g. tunnel.example.com)
    #[arg(long)]
    subdomain_host: Option<String>,

    /// Ports tcp proxies may use, e.g. "6000-6100,7001"
    #[arg(long)]
    allowed_ports: Option<String>,

    /// Shared authentication token
    #[arg(long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Accept HS256 JWTs signed with this secret instead of a shared token
    #[arg(long, env = "BURROW_JWT_SECRET", conflicts_with = "token")]
    jwt_secret: Option<String>,

    /// Seconds without control traffic before a session is closed
    #[arg(long, default_value_t = 90)]
    heartbeat_timeout: u64,

    /// Seconds an inbound connection waits for a work connection
    #[arg(long, default_value_t = 10)]
    work_conn_timeout: u64,

    /// Largest work connection pool an agent may request
    #[arg(long, default_value_t = 5)]
    max_pool_count: u32,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Agent configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Relay address (e.g. relay.example.com:7000)
    #[arg(long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// Shared authentication token
    #[arg(long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Work connections to keep ready
    #[arg(long)]
    pool_count: Option<u32>,

    /// TCP proxy as NAME:LOCAL_PORT[:REMOTE_PORT]
    #[arg(long = "tcp", value_parser = parse_tcp_proxy)]
    tcp: Vec<ProxyDef>,

    /// HTTP proxy as NAME:LOCAL_PORT:DOMAIN[,DOMAIN...]
    #[arg(long = "http", value_parser = parse_http_proxy)]
    http: Vec<ProxyDef>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        ctrl_c.cancel();
    });

    match cli.command {
        Commands::Server(args) => run_server(args, shutdown).await,
        Commands::Agent(args) => run_agent(args, shutdown).await,
    }
}

/// Setup logging; `RUST_LOG` wins over the verbosity flag
fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_server(args: ServerArgs, shutdown: CancellationToken) -> Result<()> {
    let verifier: Arc<dyn TokenVerifier> = match (&args.jwt_secret, &args.token) {
        (Some(secret), _) => Arc::new(JwtVerifier::new(secret.as_bytes())),
        (None, Some(token)) => Arc::new(StaticTokenVerifier::new(token.clone())),
        (None, None) => {
            warn!("No token configured; any agent may log in");
            Arc::new(AllowAll)
        }
    };

    let allowed_ports = match &args.allowed_ports {
        Some(list) => PortRange::parse_list(list).map_err(anyhow::Error::msg)?,
        None => Vec::new(),
    };

    let config = ServerConfig {
        bind_addr: args.bind,
        proxy_bind_addr: args.proxy_bind,
        vhost_http_port: args.vhost_http_port,
        subdomain_host: args.subdomain_host,
        allowed_ports,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        work_conn_timeout: Duration::from_secs(args.work_conn_timeout),
        max_pool_count: args.max_pool_count,
        ..ServerConfig::default()
    };

    let server = Server::new(config, verifier)
        .bind()
        .await
        .context("Failed to start relay")?;
    server.run(shutdown).await.context("Relay failed")?;
    Ok(())
}

async fn run_agent(args: AgentArgs, shutdown: CancellationToken) -> Result<()> {
    let config = build_agent_config(args)?;
    info!(
        "Exposing {} proxies through {}",
        config.proxies.len(),
        config.server_addr
    );

    let agent = Agent::new(config).context("Invalid agent configuration")?;
    agent
        .run_with_reconnect(shutdown)
        .await
        .context("Agent stopped")?;
    Ok(())
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_agent_config(args: AgentArgs) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let Some(server) = &args.server else {
                bail!("Either --config or --server is required");
            };
            AgentConfig::new(server.clone())
        }
    };

    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    if let Some(pool_count) = args.pool_count {
        config.pool_count = pool_count;
    }
    config.proxies.extend(args.tcp);
    config.proxies.extend(args.http);

    if config.proxies.is_empty() {
        bail!("No proxies configured; use --tcp, --http or a config file");
    }
    config.validate()?;
    Ok(config)
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse().map_err(|_| format!("invalid port '{}'", s))
}

fn parse_tcp_proxy(s: &str) -> Result<ProxyDef, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let (name, local_port, remote_port) = match parts.as_slice() {
        [name, local] => (*name, parse_port(local)?, 0),
        [name, local, remote] => (*name, parse_port(local)?, parse_port(remote)?),
        _ => return Err(format!("expected NAME:LOCAL_PORT[:REMOTE_PORT], got '{}'", s)),
    };
    if name.is_empty() {
        return Err("proxy name is empty".to_string());
    }
    Ok(ProxyDef::Tcp {
        name: name.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port,
        remote_port,
    })
}

fn parse_http_proxy(s: &str) -> Result<ProxyDef, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(name), Some(local), Some(domains)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected NAME:LOCAL_PORT:DOMAIN[,DOMAIN...], got '{}'", s));
    };
    if name.is_empty() {
        return Err("proxy name is empty".to_string());
    }
    let custom_domains: Vec<String> = domains
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    if custom_domains.is_empty() {
        return Err(format!("no domain in '{}'", s));
    }

    Ok(ProxyDef::Http {
        name: name.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port: parse_port(local)?,
        custom_domains,
        subdomain: None,
        locations: Vec::new(),
        http_user: None,
        http_pwd: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_proxy() {
        assert_eq!(
            parse_tcp_proxy("ssh:22:6000").unwrap(),
            ProxyDef::Tcp {
                name: "ssh".to_string(),
                local_ip: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: 6000,
            }
        );
        assert!(matches!(
            parse_tcp_proxy("db:5432").unwrap(),
            ProxyDef::Tcp { remote_port: 0, .. }
        ));
        assert!(parse_tcp_proxy("ssh").is_err());
        assert!(parse_tcp_proxy("ssh:abc").is_err());
        assert!(parse_tcp_proxy(":22").is_err());
    }

    #[test]
    fn test_parse_http_proxy() {
        match parse_http_proxy("web:8080:a.example.com,b.example.com").unwrap() {
            ProxyDef::Http {
                name,
                local_port,
                custom_domains,
                ..
            } => {
                assert_eq!(name, "web");
                assert_eq!(local_port, 8080);
                assert_eq!(custom_domains, vec!["a.example.com", "b.example.com"]);
            }
            other => panic!("unexpected proxy: {:?}", other),
        }
        assert!(parse_http_proxy("web:8080").is_err());
        assert!(parse_http_proxy("web:8080:").is_err());
    }

    #[test]
    fn test_agent_flags_build_config() {
        let cli = Cli::try_parse_from([
            "burrow",
            "agent",
            "--server",
            "relay:7000",
            "--token",
            "t",
            "--tcp",
            "ssh:22:6000",
            "--http",
            "web:8080:www.example.com",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        let config = build_agent_config(args).unwrap();
        assert_eq!(config.server_addr, "relay:7000");
        assert_eq!(config.token.as_deref(), Some("t"));
        assert_eq!(config.proxies.len(), 2);
    }

    #[test]
    fn test_server_flags() {
        let cli = Cli::try_parse_from([
            "burrow",
            "server",
            "--vhost-http-port",
            "8080",
            "--allowed-ports",
            "6000-6100,7001",
            "--token",
            "t",
        ])
        .unwrap();
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.vhost_http_port, Some(8080));
        assert_eq!(
            PortRange::parse_list(args.allowed_ports.as_deref().unwrap()).unwrap(),
            vec![PortRange::new(6000, 6100), PortRange::single(7001)]
        );
    }
}
