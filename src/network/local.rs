use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::audit::MemoryAuditLog;
use crate::common::ServerId;
use crate::config::ReplicaSettings;
use crate::consensus::{Ack, Execute, Multicast, Replica, ReplicaError};

use super::{Directory, NetworkError, PeerClient};

/*
    In-process transport. Replicas call each other directly; a link can be
    held, which parks every call towards that replica until it is released.
    Holding a link simulates a slow or partitioned peer without losing the
    message.
*/

#[derive(Default)]
pub struct LocalNetwork {
    replicas: RwLock<HashMap<ServerId, Weak<Replica>>>,
    gates: Mutex<HashMap<ServerId, watch::Sender<bool>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    pub fn register(&self, replica: &Arc<Replica>) {
        self.replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(replica.id(), Arc::downgrade(replica));
    }

    /// Parks calls towards `id` until `release` is called.
    pub fn hold(&self, id: ServerId) {
        self.gate(id).send_replace(false);
    }

    pub fn release(&self, id: ServerId) {
        self.gate(id).send_replace(true);
    }

    fn gate(&self, id: ServerId) -> watch::Sender<bool> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| watch::channel(true).0)
            .clone()
    }
}

impl Directory for LocalNetwork {
    fn lookup(&self, id: ServerId) -> Result<Arc<dyn PeerClient>, NetworkError> {
        let replica = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(NetworkError::UnknownPeer(id))?;
        Ok(Arc::new(LocalPeer {
            id,
            replica,
            gate: self.gate(id).subscribe(),
        }))
    }
}

struct LocalPeer {
    id: ServerId,
    replica: Weak<Replica>,
    gate: watch::Receiver<bool>,
}

impl LocalPeer {
    async fn connect(&self) -> Result<Arc<Replica>, NetworkError> {
        let mut gate = self.gate.clone();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(NetworkError::UnknownPeer(self.id));
        }
        self.replica.upgrade().ok_or(NetworkError::UnknownPeer(self.id))
    }
}

fn remote_error(id: ServerId, e: ReplicaError) -> NetworkError {
    match e {
        ReplicaError::Halted(_) => NetworkError::PeerHalted(id),
        other => NetworkError::Remote(other.to_string()),
    }
}

#[async_trait]
impl PeerClient for LocalPeer {
    async fn multicast(&self, message: Multicast) -> Result<Ack, NetworkError> {
        let replica = self.connect().await?;
        replica
            .receive_multicast(message)
            .map_err(|e| remote_error(self.id, e))
    }

    async fn execute(&self, message: Execute) -> Result<(), NetworkError> {
        let replica = self.connect().await?;
        replica
            .receive_execute(message)
            .await
            .map(|_| ())
            .map_err(|e| remote_error(self.id, e))
    }
}

/// A set of replicas wired together over one `LocalNetwork`, each with an
/// in-memory audit log.
pub struct LocalCluster {
    pub network: Arc<LocalNetwork>,
    pub replicas: Vec<Arc<Replica>>,
    pub audits: Vec<Arc<MemoryAuditLog>>,
}

impl LocalCluster {
    pub fn start(ids: &[ServerId], settings: &ReplicaSettings) -> Self {
        let network = LocalNetwork::new();
        let mut replicas = Vec::with_capacity(ids.len());
        let mut audits = Vec::with_capacity(ids.len());
        for &id in ids {
            let audit = Arc::new(MemoryAuditLog::new());
            let replica = Arc::new(Replica::new(
                id,
                ids.to_vec(),
                settings,
                network.clone(),
                audit.clone(),
            ));
            network.register(&replica);
            replicas.push(replica);
            audits.push(audit);
        }
        LocalCluster {
            network,
            replicas,
            audits,
        }
    }

    pub fn replica(&self, id: ServerId) -> &Arc<Replica> {
        self.replicas
            .iter()
            .find(|replica| replica.id() == id)
            .unwrap_or_else(|| panic!("no replica {id} in cluster"))
    }

    pub fn audit(&self, id: ServerId) -> &Arc<MemoryAuditLog> {
        let index = self
            .replicas
            .iter()
            .position(|replica| replica.id() == id)
            .unwrap_or_else(|| panic!("no replica {id} in cluster"));
        &self.audits[index]
    }
}
