use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::ServerId;
use crate::consensus::{Ack, Execute, Multicast, Operation, Outcome, Replica, ReplicaError};
use crate::ledger::{AccountId, Balance};

use super::NetworkError;

/*
    Wire format: every frame is a 4-byte big-endian length followed by a
    serde_json body. One RpcRequest is answered by exactly one RpcResponse
    on the same connection.
*/

pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Client operation; the receiving replica coordinates it.
    Submit(Operation),
    Multicast(Multicast),
    Execute(Execute),
    GetBalance(AccountId),
    GetServerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Outcome(Outcome),
    Ack(Ack),
    Executed,
    Balance(Option<Balance>),
    ServerId(ServerId),
    Error(RpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    Halted,
    PeerUnreachable,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl From<&ReplicaError> for RpcError {
    fn from(e: &ReplicaError) -> Self {
        let kind = match e {
            ReplicaError::Halted(_) => RpcErrorKind::Halted,
            ReplicaError::PeerUnreachable { .. } => RpcErrorKind::PeerUnreachable,
            ReplicaError::UnknownSender(_) => RpcErrorKind::Rejected,
        };
        RpcError {
            kind,
            message: e.to_string(),
        }
    }
}

impl RpcError {
    pub fn into_network_error(self, server: ServerId) -> NetworkError {
        match self.kind {
            RpcErrorKind::Halted => NetworkError::PeerHalted(server),
            RpcErrorKind::PeerUnreachable | RpcErrorKind::Rejected => NetworkError::Remote(self.message),
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Server side: runs one request against the local replica.
pub async fn dispatch(replica: &Replica, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Submit(operation) => match replica.submit(operation).await {
            Ok(outcome) => RpcResponse::Outcome(outcome),
            Err(e) => RpcResponse::Error(RpcError::from(&e)),
        },
        RpcRequest::Multicast(message) => match replica.receive_multicast(message) {
            Ok(ack) => RpcResponse::Ack(ack),
            Err(e) => RpcResponse::Error(RpcError::from(&e)),
        },
        RpcRequest::Execute(message) => match replica.receive_execute(message).await {
            Ok(_) => RpcResponse::Executed,
            Err(e) => RpcResponse::Error(RpcError::from(&e)),
        },
        RpcRequest::GetBalance(account) => RpcResponse::Balance(replica.balance(account)),
        RpcRequest::GetServerId => RpcResponse::ServerId(replica.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Request;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = RpcRequest::Multicast(Multicast {
            request: Request::new(3, 1, Operation::Deposit { account: 2, amount: 10 }),
            sender: 1,
            watermark: 3,
        });
        write_frame(&mut client, &request).await.unwrap();
        write_frame(&mut client, &RpcRequest::GetServerId).await.unwrap();
        drop(client);

        let first: RpcRequest = read_frame(&mut server).await.unwrap().unwrap();
        let RpcRequest::Multicast(message) = first else {
            panic!("expected multicast");
        };
        assert_eq!(message.request.id().timestamp, 3);
        assert!(matches!(
            read_frame::<_, RpcRequest>(&mut server).await.unwrap(),
            Some(RpcRequest::GetServerId)
        ));
        assert!(read_frame::<_, RpcRequest>(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let result = read_frame::<_, RpcRequest>(&mut server).await;
        assert!(matches!(result, Err(NetworkError::FrameTooLarge(_))));
    }

    #[test]
    fn test_replica_error_kinds() {
        let halted = RpcError::from(&ReplicaError::Halted(2));
        assert_eq!(halted.kind, RpcErrorKind::Halted);
        assert!(matches!(halted.into_network_error(2), NetworkError::PeerHalted(2)));

        let rejected = RpcError::from(&ReplicaError::UnknownSender(9));
        assert_eq!(rejected.kind, RpcErrorKind::Rejected);
        assert!(matches!(rejected.into_network_error(2), NetworkError::Remote(_)));
    }
}
