use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::ServerId;
use crate::config::{ClusterConfig, ReplicaSettings};
use crate::consensus::{Ack, Execute, Multicast, Replica};

use super::rpc::{dispatch, read_frame, write_frame, RpcRequest, RpcResponse};
use super::{Directory, NetworkError, PeerClient};

/// Handle to a replica reachable over TCP. Every call opens its own
/// connection, so a long-running execute instruction never holds up a
/// multicast to the same peer.
#[derive(Debug, Clone)]
pub struct TcpPeer {
    id: ServerId,
    address: String,
    connect_timeout: Duration,
    connect_attempts: u32,
    retry_backoff: Duration,
}

impl TcpPeer {
    pub fn new(id: ServerId, address: impl Into<String>, settings: &ReplicaSettings) -> Self {
        TcpPeer {
            id,
            address: address.into(),
            connect_timeout: settings.connect_timeout,
            connect_attempts: settings.connect_attempts.max(1),
            retry_backoff: settings.retry_backoff,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    async fn connect(&self) -> Result<TcpStream, NetworkError> {
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => NetworkError::Io(e),
                Err(_) => NetworkError::ConnectTimeout(self.address.clone()),
            };
            if attempt >= self.connect_attempts {
                return Err(error);
            }
            debug!(peer = self.id, address = %self.address, attempt, error = %error, "connect failed, retrying");
            attempt += 1;
            tokio::time::sleep(self.retry_backoff).await;
        }
    }

    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, NetworkError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &request).await?;
        match read_frame(&mut stream).await? {
            Some(response) => Ok(response),
            None => Err(NetworkError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

#[async_trait]
impl PeerClient for TcpPeer {
    async fn multicast(&self, message: Multicast) -> Result<Ack, NetworkError> {
        match self.call(RpcRequest::Multicast(message)).await? {
            RpcResponse::Ack(ack) => Ok(ack),
            RpcResponse::Error(e) => Err(e.into_network_error(self.id)),
            _ => Err(NetworkError::UnexpectedResponse("ack")),
        }
    }

    async fn execute(&self, message: Execute) -> Result<(), NetworkError> {
        match self.call(RpcRequest::Execute(message)).await? {
            RpcResponse::Executed => Ok(()),
            RpcResponse::Error(e) => Err(e.into_network_error(self.id)),
            _ => Err(NetworkError::UnexpectedResponse("executed")),
        }
    }
}

/// Resolves peers from the server table.
pub struct TcpDirectory {
    peers: HashMap<ServerId, Arc<TcpPeer>>,
}

impl TcpDirectory {
    pub fn new(cluster: &ClusterConfig, settings: &ReplicaSettings) -> Self {
        let peers = cluster
            .servers()
            .map(|(id, address)| (id, Arc::new(TcpPeer::new(id, address.to_string(), settings))))
            .collect();
        TcpDirectory { peers }
    }
}

impl Directory for TcpDirectory {
    fn lookup(&self, id: ServerId) -> Result<Arc<dyn PeerClient>, NetworkError> {
        self.peers
            .get(&id)
            .cloned()
            .map(|peer| peer as Arc<dyn PeerClient>)
            .ok_or(NetworkError::UnknownPeer(id))
    }
}

/// Serves frames from one connection until the client closes it.
pub async fn handle_connection(mut stream: TcpStream, replica: Arc<Replica>) -> Result<(), NetworkError> {
    while let Some(request) = read_frame::<_, RpcRequest>(&mut stream).await? {
        let response = dispatch(&replica, request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let settings = ReplicaSettings {
            connect_attempts: 2,
            retry_backoff: Duration::from_millis(10),
            ..ReplicaSettings::default()
        };
        let peer = TcpPeer::new(9, address, &settings);
        let result = peer.call(RpcRequest::GetServerId).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_resolves_configured_servers() {
        let cluster = ClusterConfig::parse("127.0.0.1 1 7001\n127.0.0.1 2 7002\n").unwrap();
        let directory = TcpDirectory::new(&cluster, &ReplicaSettings::default());

        assert!(directory.lookup(2).is_ok());
        assert!(matches!(directory.lookup(3), Err(NetworkError::UnknownPeer(3))));
    }
}
