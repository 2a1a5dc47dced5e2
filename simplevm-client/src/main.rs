use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simplevm_client::bibigrid::BibigridConnector;
use simplevm_client::config::{Config, OpenStackAuth};
use simplevm_client::forc::ForcConnector;
use simplevm_client::grpc::VirtualMachineServiceImpl;
use simplevm_client::metadata::MetadataConnector;
use simplevm_client::openstack::OpenStackConnector;
use simplevm_client::openstack::api::OpenStackApi;
use simplevm_client::proto::virtual_machine_service_server::VirtualMachineServiceServer;
use simplevm_client::store::PipelineStore;

#[derive(Parser)]
#[command(name = "simplevm-client")]
#[command(about = "SimpleVM portal control plane daemon")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, default_value = "/etc/simplevm/config.yml")]
    config: PathBuf,

    /// Data directory for downloaded playbooks and per-VM scratch dirs
    #[arg(short, long, default_value = "/var/lib/simplevm")]
    data_dir: PathBuf,
}

fn init_tracing() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("simplevm_client={level}").parse()?);

    // Log rotation is left to the surrounding service manager.
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open log file {path}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    // The worker pool size serving RPCs comes from the config file.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads)
        .enable_all()
        .build()?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    info!(config = %args.config.display(), "Initializing simplevm-client");
    tokio::fs::create_dir_all(&args.data_dir).await?;

    // OpenStack
    let auth = OpenStackAuth::from_env()?;
    let api = Arc::new(OpenStackApi::new(
        auth,
        config.openstack.compute_api_version.clone(),
        config.production,
    )?);
    api.authorize().await?;
    let openstack = Arc::new(OpenStackConnector::new(api, config.openstack.clone())?);
    openstack.get_or_create_default_ssh_security_group().await?;

    // Pipeline state
    let store = PipelineStore::connect(&config.redis_url()).await?;

    // Forc + template catalog
    let plays_dir = args.data_dir.join("plays");
    tokio::fs::create_dir_all(&plays_dir).await?;
    let forc = Arc::new(ForcConnector::new(
        config.forc.clone(),
        store,
        plays_dir,
        config.production,
    )?);
    let _refresh_shutdown = forc.clone().spawn_template_refresh();

    // Bibigrid + metadata sidecar
    let bibigrid = Arc::new(BibigridConnector::new(
        config.bibigrid.clone(),
        config.openstack.gateway_ip.clone(),
        config.openstack.ssh_port_calculation.clone(),
        config.production,
    )?);
    let metadata = Arc::new(MetadataConnector::new(
        config.metadata_server.clone(),
        config.production,
    )?);

    let service = VirtualMachineServiceImpl::new(openstack, forc, bibigrid, metadata);
    let shutdown_hook = service.clone();

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!(addr = %addr, "Starting gRPC server");

    let mut builder = Server::builder();
    if config.server.use_ssl {
        let certfile = config
            .server
            .certfile
            .as_ref()
            .context("server.use_ssl requires server.certfile")?;
        let pem = tokio::fs::read(certfile).await?;
        let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(&pem, &pem));
        if let Some(ca_path) = &config.server.ca_certs_path {
            let ca = tokio::fs::read(ca_path).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
        }
        builder = builder.tls_config(tls)?;
    }

    builder
        .add_service(VirtualMachineServiceServer::new(service))
        .serve_with_shutdown(addr, wait_for_termination())
        .await?;

    // Termination requested: clear every trace of VMs still waiting on
    // their playbooks, then exit non-zero.
    shutdown_hook.shutdown().await;
    error!("Terminated by signal");
    std::process::exit(1);
}

async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
