use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::grpc::GrpcServer;
use crate::listener::{bind, ListenAddrs, DEFAULT_BACKLOG};
use crate::master_server::MasterServer;
use crate::peers::{resolve_peers, NodeAddress, PeerSet};
use crate::raft::{RaftServer, RaftTimings};
use crate::tls::TlsIdentity;

/// The meta folder must be an existing directory this process can create
/// files in.
pub fn check_meta_folder_writable(path: &Path) -> Result<()> {
    let not_writable = |reason: String| MasterError::MetaFolderNotWritable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| not_writable(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(not_writable("not a directory".into()));
    }

    let probe = path.join(format!(".seaweed-master-probe-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| not_writable(e.to_string()))?;
    let _ = fs::remove_file(&probe);

    Ok(())
}

/// Brings up one master from an immutable configuration.
pub struct Bootstrap {
    config: MasterConfig,
    tls: Option<TlsIdentity>,
}

impl Bootstrap {
    pub fn new(config: MasterConfig, tls: Option<TlsIdentity>) -> Self {
        Self { config, tls }
    }

    /// Run the startup sequence:
    /// 1. Check the meta folder is writable
    /// 2. Validate options and resolve the peer set
    /// 3. Bind the HTTP and RPC listeners
    /// 4. Build the management service
    /// 5. Build the consensus service over the meta folder
    /// 6. Attach consensus to management and merge the status route
    /// 7. Register the RPC services
    /// 8. Start serving in background tasks
    ///
    /// # Errors
    ///
    /// The first failing step is returned. Nothing acquired by earlier steps
    /// is released explicitly; the caller is expected to exit.
    pub async fn start(self) -> Result<RunningMaster> {
        let Bootstrap { config, tls } = self;

        check_meta_folder_writable(&config.meta_folder)?;

        config.validate()?;
        let (self_address, peers) = resolve_peers(&config.ip, config.port, &config.peers)?;

        let addrs = ListenAddrs::derive(&config.ip_bind, config.port)?;
        let http_listener = bind(&addrs.http, DEFAULT_BACKLOG).await?;
        let grpc_listener = bind(&addrs.grpc, DEFAULT_BACKLOG).await?;
        let http_addr = local_addr(&http_listener, &addrs.http)?;
        let grpc_addr = local_addr(&grpc_listener, &addrs.grpc)?;

        let master = MasterServer::new(
            config.options.clone(),
            peers.clone(),
            self_address.clone(),
            tls.clone(),
        )?;

        let raft = RaftServer::new(
            tls.as_ref(),
            peers.clone(),
            self_address.clone(),
            &config.meta_folder,
            master.topology().clone(),
            RaftTimings::from_pulse_seconds(config.options.pulse_seconds),
        )?;

        master.attach_raft(raft.clone())?;
        let http_router = master
            .router()
            .merge(raft.status_router())
            .layer(TraceLayer::new_for_http());

        let grpc = GrpcServer::new(master.clone(), raft.clone(), tls.as_ref())?;

        let mut tasks = raft.start();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc.serve(grpc_listener).await {
                tracing::error!(error = %e, "gRPC server failed");
            }
        }));

        let client = master.client().clone();
        tasks.push(tokio::spawn(async move {
            client.keep_connected_to_master().await;
        }));

        tasks.push(tokio::spawn(async move {
            let app = http_router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(http_listener, app).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }));

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            self_address = %self_address,
            http = %http_addr,
            grpc = %grpc_addr,
            peers = ?peers.to_strings(),
            "Master started"
        );

        Ok(RunningMaster {
            http_addr,
            grpc_addr,
            self_address,
            peers,
            master,
            raft,
            tasks,
        })
    }
}

fn local_addr(listener: &TcpListener, addr: &str) -> Result<SocketAddr> {
    listener.local_addr().map_err(|source| MasterError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// A master whose listeners are serving.
pub struct RunningMaster {
    http_addr: SocketAddr,
    grpc_addr: SocketAddr,
    self_address: NodeAddress,
    peers: PeerSet,
    master: Arc<MasterServer>,
    raft: Arc<RaftServer>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RunningMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningMaster")
            .field("http_addr", &self.http_addr)
            .field("grpc_addr", &self.grpc_addr)
            .field("self_address", &self.self_address)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl RunningMaster {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.self_address
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn master(&self) -> &Arc<MasterServer> {
        &self.master
    }

    pub fn raft(&self) -> &Arc<RaftServer> {
        &self.raft
    }

    /// Hold the process until `shutdown` is cancelled. The serving tasks
    /// never end this on their own. On return every task this master
    /// spawned, raft loops included, has stopped.
    pub async fn wait(self, shutdown: CancellationToken) {
        shutdown.cancelled().await;

        tracing::info!(self_address = %self.self_address, "Stopping master");
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
