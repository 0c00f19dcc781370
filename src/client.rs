//! Keeps this master registered with whichever master currently leads.

use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{MasterError, Result};
use crate::listener::grpc_address;
use crate::peers::{NodeAddress, PeerSet};
use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::KeepConnectedRequest;
use crate::tls::{self, TlsIdentity};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How a single `KeepConnected` attempt ended.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    /// The master named a different leader.
    Redirect(NodeAddress),
    /// The stream was served and has ended, or no leader is known.
    Done,
}

pub struct MasterClient {
    name: String,
    peers: PeerSet,
    tls: Option<TlsIdentity>,
    current_master: RwLock<Option<NodeAddress>>,
}

impl MasterClient {
    pub fn new(name: impl Into<String>, peers: PeerSet, tls: Option<TlsIdentity>) -> Self {
        Self {
            name: name.into(),
            peers,
            tls,
            current_master: RwLock::new(None),
        }
    }

    /// The master last seen acting as leader.
    pub async fn current_master(&self) -> Option<NodeAddress> {
        self.current_master.read().await.clone()
    }

    /// Never returns.
    pub async fn keep_connected_to_master(&self) {
        tracing::info!(name = %self.name, "Starting master client");
        loop {
            self.try_all_masters().await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn try_all_masters(&self) {
        for master in self.peers.iter() {
            let mut next = Some(master.clone());
            // Bounded so two masters naming each other cannot loop forever.
            let mut hops = self.peers.len();

            while let Some(target) = next.take() {
                match self.try_connect(&target).await {
                    Ok(Attempt::Redirect(leader)) if hops > 0 => {
                        tracing::debug!(from = %target, to = %leader, "Redirected to leader");
                        hops -= 1;
                        next = Some(leader);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(master = %target, error = %e, "Failed to keep connected");
                    }
                }
            }
        }
    }

    async fn try_connect(&self, master: &NodeAddress) -> Result<Attempt> {
        let addr = grpc_address(master)?;
        let channel = tls::endpoint(&addr, self.tls.as_ref())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        let mut client = MasterServiceClient::new(channel);

        let mut stream = client
            .keep_connected(KeepConnectedRequest {
                name: self.name.clone(),
            })
            .await?
            .into_inner();

        let Some(first) = stream.message().await? else {
            return Ok(Attempt::Done);
        };

        if first.leader.is_empty() {
            return Ok(Attempt::Done);
        }
        let leader = NodeAddress::from(first.leader);
        if &leader != master {
            return Ok(Attempt::Redirect(leader));
        }

        {
            let mut current = self.current_master.write().await;
            if current.as_ref() != Some(master) {
                tracing::info!(master = %master, "Connected to leader");
            }
            *current = Some(master.clone());
        }

        loop {
            match stream.message().await {
                Ok(Some(update)) => {
                    if update.leader != master.as_str() {
                        if update.leader.is_empty() {
                            return Ok(Attempt::Done);
                        }
                        return Ok(Attempt::Redirect(NodeAddress::from(update.leader)));
                    }
                    tracing::trace!(master = %master, max_volume_id = update.max_volume_id, "Master update");
                }
                Ok(None) => return Ok(Attempt::Done),
                Err(status) => return Err(MasterError::Grpc(status)),
            }
        }
    }
}
