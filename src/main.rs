use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing_subscriber::EnvFilter;

use seaweed_master::config::{parse_white_list, MasterConfig, MasterOptions, TlsConfig};
use seaweed_master::lifecycle::install_shutdown_handler;
use seaweed_master::proto::master_service_client::MasterServiceClient;
use seaweed_master::proto::GetMasterConfigurationRequest;
use seaweed_master::tls::{TlsIdentity, CLUSTER_DOMAIN};
use seaweed_master::{Bootstrap, MasterError};

#[derive(Parser, Debug)]
#[command(name = "seaweed-master")]
#[command(version)]
#[command(about = "Coordinator node of a distributed blob store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master server
    Master(MasterArgs),

    /// Cluster inspection commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// HTTP listen port. The RPC port is this plus 10000
    #[arg(long, default_value = "9333")]
    port: u16,

    /// Address other masters and clients use to reach this master
    #[arg(long, default_value = "localhost")]
    ip: String,

    /// Address to bind the listeners to
    #[arg(long, default_value = "0.0.0.0")]
    ip_bind: String,

    /// Data directory to store meta data (defaults to the system temp dir)
    #[arg(long)]
    mdir: Option<PathBuf>,

    /// All master nodes in comma separated ip:port list, example: 127.0.0.1:9093,127.0.0.1:9094
    #[arg(long, default_value = "")]
    peers: String,

    /// Master stops directing writes to oversized volumes
    #[arg(long, default_value = "30000")]
    volume_size_limit_mb: u64,

    /// Preallocate disk space for volumes
    #[arg(long)]
    volume_preallocate: bool,

    /// Number of seconds between heartbeats
    #[arg(long, default_value = "5")]
    pulse_seconds: u64,

    /// Default replication type if not specified
    #[arg(long, default_value = "000")]
    default_replication: String,

    /// Threshold to vacuum and reclaim spaces
    #[arg(long, default_value = "0.3")]
    garbage_threshold: f64,

    /// Comma separated IP addresses having write permission. No limit if empty
    #[arg(long, default_value = "")]
    white_list: String,

    /// Disable HTTP requests, only gRPC operations are allowed
    #[arg(long)]
    disable_http: bool,

    /// Prometheus gateway address, advertised to volume servers
    #[arg(long, default_value = "")]
    metrics_address: String,

    /// Prometheus push interval in seconds
    #[arg(long, default_value = "15")]
    metrics_interval_sec: u32,

    // === TLS Options ===
    /// Enable mutual TLS on the RPC port
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to node certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to node private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl MasterArgs {
    fn into_config(self) -> MasterConfig {
        let defaults = MasterConfig::default();
        MasterConfig {
            port: self.port,
            ip: self.ip,
            ip_bind: self.ip_bind,
            meta_folder: self.mdir.unwrap_or(defaults.meta_folder),
            peers: self.peers,
            options: MasterOptions {
                volume_size_limit_mb: self.volume_size_limit_mb,
                volume_preallocate: self.volume_preallocate,
                pulse_seconds: self.pulse_seconds,
                default_replication: self.default_replication,
                garbage_threshold: self.garbage_threshold,
                white_list: parse_white_list(&self.white_list),
                disable_http: self.disable_http,
                metrics_address: self.metrics_address,
                metrics_interval_sec: self.metrics_interval_sec,
            },
            tls: TlsConfig {
                enabled: self.tls,
                ca_cert_path: self.ca_cert,
                cert_path: self.cert,
                key_path: self.key,
                allow_insecure: self.allow_insecure,
            },
        }
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master RPC address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:19333")]
    addr: String,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

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
enum ClusterCommands {
    /// Show the configuration the master hands out and its current leader
    Status,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    leader: String,
    volume_size_limit_mb: u64,
    default_replication: String,
    volume_preallocate: bool,
    garbage_threshold: f64,
    metrics_address: String,
    metrics_interval_seconds: u32,
}

// =============================================================================
// Master
// =============================================================================

async fn run_master(args: MasterArgs) -> Result<(), MasterError> {
    let config = args.into_config();

    let tls_identity = TlsIdentity::from_config(&config.tls).await?;
    if tls_identity.is_none() && !config.peers.is_empty() {
        tracing::warn!(
            "Running without TLS in a multi-master cluster. \
             Consider using --tls for production deployments."
        );
    }

    tracing::info!(
        ip = %config.ip,
        port = config.port,
        meta_folder = %config.meta_folder.display(),
        peers = %config.peers,
        tls_enabled = tls_identity.is_some(),
        "Starting master"
    );

    let shutdown = install_shutdown_handler()
        .map_err(|e| MasterError::Internal(format!("failed to install signal handlers: {}", e)))?;

    let running = Bootstrap::new(config, tls_identity).start().await?;
    running.wait(shutdown).await;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    let has_tls = args.ca_cert.is_some() || args.addr.starts_with("https://");
    if !has_tls {
        return Ok(endpoint.connect().await?);
    }

    let mut tls_config = ClientTlsConfig::new().domain_name(CLUSTER_DOMAIN);
    if let Some(ca_path) = &args.ca_cert {
        let ca_cert = Certificate::from_pem(tokio::fs::read(ca_path).await?);
        tls_config = tls_config.ca_certificate(ca_cert);
    }
    if let (Some(cert_path), Some(key_path)) = (&args.cert, &args.key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        tls_config = tls_config.identity(Identity::from_pem(cert, key));
    }

    Ok(endpoint.tls_config(tls_config)?.connect().await?)
}

async fn handle_cluster_status(
    client: &mut MasterServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get_master_configuration(GetMasterConfigurationRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = ClusterStatusOutput {
                leader: response.leader,
                volume_size_limit_mb: response.volume_size_limit_mb,
                default_replication: response.default_replication,
                volume_preallocate: response.volume_preallocate,
                garbage_threshold: response.garbage_threshold,
                metrics_address: response.metrics_address,
                metrics_interval_seconds: response.metrics_interval_seconds,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let leader = if response.leader.is_empty() {
                "(none)".to_string()
            } else {
                response.leader
            };
            println!("Master Status");
            println!("{}", "=".repeat(40));
            println!("Leader:              {}", leader);
            println!("Volume size limit:   {} MB", response.volume_size_limit_mb);
            println!("Default replication: {}", response.default_replication);
            println!("Preallocate:         {}", response.volume_preallocate);
            println!("Garbage threshold:   {}", response.garbage_threshold);
            if !response.metrics_address.is_empty() {
                println!(
                    "Metrics:             {} every {}s",
                    response.metrics_address, response.metrics_interval_seconds
                );
            }
        }
    }
    Ok(())
}

async fn run_cluster_command(
    client: ClientArgs,
    command: ClusterCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let channel = create_client_channel(&client).await?;
    let mut grpc_client = MasterServiceClient::new(channel);

    match command {
        ClusterCommands::Status => handle_cluster_status(&mut grpc_client, &client.output).await,
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Master(master_args) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            if let Err(e) = run_master(master_args).await {
                tracing::error!(kind = ?e.kind(), error = %e, "Master failed to start");
                std::process::exit(1);
            }
        }
        Commands::Cluster { client, command } => {
            let result = run_cluster_command(client, command).await;

            if let Err(e) = result {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
