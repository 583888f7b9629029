use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::consensus::{HaltReport, Replica};

use super::tcp::handle_connection;
use super::NetworkError;

/// A replica bound to a TCP listener. Serves peers and clients until the
/// replica executes a halt request.
pub struct Node {
    replica: Arc<Replica>,
    listener: TcpListener,
    shutdown_grace: Duration,
}

impl Node {
    pub async fn bind(
        replica: Arc<Replica>,
        address: impl ToSocketAddrs,
        shutdown_grace: Duration,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address).await?;
        info!(server = replica.id(), address = %listener.local_addr()?, "listening");
        Ok(Node {
            replica,
            listener,
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<HaltReport, NetworkError> {
        let id = self.replica.id();
        let report = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = accepted?;
                    debug!(server = id, %remote, "connection accepted");
                    self.serve(stream, remote);
                }
                halted = self.replica.halted() => {
                    match halted {
                        Some(report) => break report,
                        None => return Err(NetworkError::PeerHalted(id)),
                    }
                }
            }
        };

        // Keep serving duplicate execute instructions for a moment.
        let grace = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.serve(stream, remote),
                    Err(e) => warn!(server = id, error = %e, "accept failed during shutdown"),
                },
            }
        }

        info!(server = id, report = %report, "shutting down");
        Ok(report)
    }

    fn serve(&self, stream: TcpStream, remote: SocketAddr) {
        let id = self.replica.id();
        let replica = self.replica.clone();
        tokio::spawn(async move {
            // Peers that already shut down close connections mid-reply.
            if let Err(e) = handle_connection(stream, replica).await {
                warn!(server = id, %remote, error = %e, "connection closed with error");
            }
        });
    }
}
