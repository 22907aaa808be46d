//! deskrelay - remote support relay and endpoint agent
//!
//! **Relay** (`deskrelay serve`): HTTP/WebSocket server that operators talk
//! to and agents hold a persistent link to.
//!
//! **Agent** (`deskrelay agent`): runs on a managed machine, connects out to
//! the relay and executes allowlisted remediations, validated installers and
//! terminal sessions. Enroll once with `deskrelay enroll`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use deskrelay::{
    agent::{self, connection::RelayConnection, AgentRuntime},
    api,
    config::{self, AgentConfig, ConfigError, RelayConfig},
    identity::{Role, SecretBox, TokenService},
    remediation::{Elevation, RegistrationError},
    store::{Assignment, Store, StoreError, OPERATOR_BCRYPT_COST},
    validator::CommandValidator,
};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};


/// deskrelay - remote support relay and endpoint agent
#[derive(ClapParser, Debug)]
#[command(name = "deskrelay", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Relay config file
        #[arg(long, env = "DESKRELAY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Run the endpoint agent (must be enrolled first)
    Agent {
        /// Agent config file
        #[arg(long, env = "DESKRELAY_AGENT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Enroll this machine with a relay
    Enroll {
        /// Relay base URL, e.g. https://relay.example.com
        #[arg(long)]
        server: String,

        /// One-time enrollment token issued by an administrator
        #[arg(long, env = "DESKRELAY_ENROLLMENT_TOKEN")]
        token: String,

        /// Agent config file to write
        #[arg(long, env = "DESKRELAY_AGENT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Administer the relay database directly
    Admin {
        /// Relay config file
        #[arg(long, env = "DESKRELAY_CONFIG")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Create a tenant and print its id
    CreateTenant { name: String },

    /// Create an operator account
    CreateOperator {
        username: String,

        /// technician, admin or superadmin
        #[arg(long, default_value = "technician")]
        role: Role,

        #[arg(long, default_value = "")]
        display_name: String,

        #[arg(long, env = "DESKRELAY_OPERATOR_PASSWORD")]
        password: String,
    },

    /// Mint a one-time enrollment token for a tenant
    EnrollmentToken {
        tenant_id: String,

        /// Lifetime in hours (defaults to the configured value)
        #[arg(long)]
        ttl_hours: Option<u64>,
    },

    /// Grant an operator access to a tenant or a single endpoint
    Assign {
        operator_id: String,

        #[arg(long, conflicts_with = "endpoint", required_unless_present = "endpoint")]
        tenant: Option<String>,

        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    #[error("server error: {0}")]
    Server(std::io::Error),

    #[error("agent is not enrolled; run `deskrelay enroll` first")]
    NotEnrolled,

    #[error("no agent config at {}", .0.display())]
    MissingAgentConfig(PathBuf),

    #[error("failed to set up agent: {0}")]
    Agent(#[from] RegistrationError),

    #[error("invalid key material: {0}")]
    Key(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { config } => run_relay(config).await,
        Commands::Agent { config } => run_agent(config).await,
        Commands::Enroll {
            server,
            token,
            config,
        } => run_enroll(server, token, config).await,
        Commands::Admin { config, command } => run_admin(config, command),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "deskrelay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn relay_config(path: Option<PathBuf>) -> Result<RelayConfig, CliError> {
    let path = path.unwrap_or_else(|| config::default_config_path("relay.toml"));
    match RelayConfig::load(&path)? {
        Some(config) => {
            tracing::debug!(path = %path.display(), "loaded relay config");
            Ok(config)
        }
        None => {
            tracing::info!(path = %path.display(), "no relay config found, using defaults");
            Ok(RelayConfig::default())
        }
    }
}

fn open_store(path: &Path) -> Result<Store, CliError> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "failed to create database directory");
        }
    }
    Ok(Store::open(path)?)
}

// ── Relay ──────────────────────────────────────────────────────────

async fn run_relay(config_path: Option<PathBuf>) -> Result<(), CliError> {
    let config = relay_config(config_path)?;
    let store = open_store(&config.database)?;

    let token_key = match config.token_key_bytes()? {
        Some(key) => key,
        None => {
            tracing::warn!("no token_key configured; sessions will not survive a restart");
            config::decode_key("token_key", &config::generate_key_hex(), 32)?
        }
    };
    let tokens = TokenService::new(&token_key).map_err(|e| CliError::Key(e.to_string()))?;

    let secrets = match config.secret_key_bytes()? {
        Some(key) => SecretBox::new(&key).map_err(|e| CliError::Key(e.to_string()))?,
        None => {
            tracing::warn!("no secret_key configured; two-factor operations are unavailable");
            SecretBox::unavailable()
        }
    };

    let mut state = api::AppState::new(store, tokens, secrets);
    state.enrollment_ttl = Duration::from_secs(config.enrollment_token_ttl_hours.max(1) * 3600);

    if config.allow_loopback_admin {
        tracing::warn!("loopback admin exemption is enabled; do not use in production");
    }
    let app = api::router(
        state,
        api::RouterConfig {
            allow_loopback_admin: config.allow_loopback_admin,
            cors_origins: config.cors_origins.clone(),
            auth_rate_limit: config.auth_rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| CliError::Bind(config.bind, e))?;
    tracing::info!(addr = %config.bind, "relay listening");

    api::serve(listener, app, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, shutting down");
    })
    .await
    .map_err(CliError::Server)
}

// ── Agent ──────────────────────────────────────────────────────────

fn agent_config_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| config::default_config_path("agent.toml"))
}

async fn run_agent(config_path: Option<PathBuf>) -> Result<(), CliError> {
    let path = agent_config_path(config_path);
    let config = AgentConfig::load(&path)?.ok_or_else(|| CliError::MissingAgentConfig(path.clone()))?;
    let (Some(endpoint_id), Some(endpoint_secret)) = (config.endpoint_id.clone(), config.endpoint_secret.clone())
    else {
        return Err(CliError::NotEnrolled);
    };

    let elevation = Elevation::detect();
    if !elevation.is_elevated() {
        tracing::warn!("agent is not running elevated; high-risk actions and installers are disabled");
    }
    let runtime = Arc::new(AgentRuntime::builtin(
        CommandValidator::new(&config.staging_dir),
        elevation,
    )?);

    tracing::info!(server = %config.server_url, endpoint = %endpoint_id, "starting agent");
    let connection = RelayConnection::spawn(
        &config.server_url,
        agent::connection::EndpointCredentials {
            endpoint_id,
            endpoint_secret,
        },
        runtime,
    );

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C, disconnecting");
    connection.shutdown();
    connection.join().await;
    Ok(())
}

async fn run_enroll(server: String, token: String, config_path: Option<PathBuf>) -> Result<(), CliError> {
    let path = agent_config_path(config_path);
    let mut config = match AgentConfig::load(&path)? {
        Some(mut existing) => {
            existing.server_url = server.clone();
            existing
        }
        None => AgentConfig::new(server.clone()),
    };

    let credentials = agent::enroll::enroll(&server, &token).await?;
    config.endpoint_id = Some(credentials.endpoint_id.clone());
    config.endpoint_secret = Some(credentials.endpoint_secret);
    config.save(&path)?;

    tracing::info!(endpoint = %credentials.endpoint_id, path = %path.display(), "enrolled");
    println!("{}", credentials.endpoint_id);
    Ok(())
}

// ── Admin ──────────────────────────────────────────────────────────

fn run_admin(config_path: Option<PathBuf>, command: AdminCommand) -> Result<(), CliError> {
    let config = relay_config(config_path)?;
    let store = open_store(&config.database)?;

    match command {
        AdminCommand::CreateTenant { name } => {
            let tenant = store.create_tenant(&name)?;
            println!("{}", tenant.id);
        }
        AdminCommand::CreateOperator {
            username,
            role,
            display_name,
            password,
        } => {
            let display_name = if display_name.trim().is_empty() {
                username.clone()
            } else {
                display_name
            };
            let operator = store.create_operator(&username, &display_name, role, &password, OPERATOR_BCRYPT_COST)?;
            println!("{}", operator.id);
        }
        AdminCommand::EnrollmentToken { tenant_id, ttl_hours } => {
            let hours = ttl_hours.unwrap_or(config.enrollment_token_ttl_hours).max(1);
            let token = store.create_enrollment_token(&tenant_id, Duration::from_secs(hours * 3600))?;
            println!("{token}");
        }
        AdminCommand::Assign {
            operator_id,
            tenant,
            endpoint,
        } => {
            let assignment = match (tenant, endpoint) {
                (Some(tenant), _) => Assignment::Tenant(tenant),
                (None, Some(endpoint)) => Assignment::Endpoint(endpoint),
                (None, None) => return Err(anyhow::anyhow!("--tenant or --endpoint is required").into()),
            };
            store.assign(&operator_id, &assignment)?;
            tracing::info!(operator = %operator_id, ?assignment, "assignment recorded");
        }
    }
    Ok(())
}
