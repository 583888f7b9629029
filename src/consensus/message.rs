use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{ServerId, Timestamp};
use crate::ledger::{AccountId, Balance, LedgerError};

/*
    A request is stamped exactly once, by the replica that accepted it from
    a client, and is immutable afterwards. Replicas compare requests by
    (timestamp, origin) only; two requests with the same key are the same
    request no matter how many times it travels over the wire.
*/

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RequestId {
    pub timestamp: Timestamp,
    pub origin: ServerId,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.timestamp, self.origin)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Operation {
    CreateAccount,
    Deposit {
        account: AccountId,
        amount: Balance,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Balance,
    },
    Halt,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateAccount => "createAccount",
            Operation::Deposit { .. } => "deposit",
            Operation::Transfer { .. } => "transfer",
            Operation::Halt => "halt",
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, Operation::Halt)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Deposit { account, amount } => write!(f, "deposit {amount} to {account}"),
            Operation::Transfer { from, to, amount } => {
                write!(f, "transfer {amount} from {from} to {to}")
            }
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub timestamp: Timestamp,
    pub origin: ServerId,
    pub operation: Operation,
}

impl Request {
    pub fn new(timestamp: Timestamp, origin: ServerId, operation: Operation) -> Self {
        Request {
            timestamp,
            origin,
            operation,
        }
    }

    pub fn id(&self) -> RequestId {
        RequestId {
            timestamp: self.timestamp,
            origin: self.origin,
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Request {}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(&other.id())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Status {
    Ok,
    UnknownAccount,
    InvalidAmount,
    InsufficientFunds,
}

impl From<Result<(), LedgerError>> for Status {
    fn from(result: Result<(), LedgerError>) -> Self {
        match result {
            Ok(()) => Status::Ok,
            Err(LedgerError::UnknownAccount(_)) => Status::UnknownAccount,
            Err(LedgerError::InvalidAmount(_)) => Status::InvalidAmount,
            Err(LedgerError::InsufficientFunds { .. }) => Status::InsufficientFunds,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::UnknownAccount => "UnknownAccount",
            Status::InvalidAmount => "InvalidAmount",
            Status::InsufficientFunds => "InsufficientFunds",
        };
        f.write_str(s)
    }
}

/// Audit summary a replica produces when it executes a halt request.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct HaltReport {
    pub server_id: ServerId,
    pub request: RequestId,
    pub total_balance: Balance,
    pub queue_len: usize,
    pub ledger_digest: String,
}

impl fmt::Display for HaltReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.server_id, self.request, self.total_balance, self.queue_len
        )
    }
}

/// Result of executing a request against the ledger.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Outcome {
    Created(AccountId),
    Status(Status),
    Halted(HaltReport),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Created(id) => write!(f, "{id}"),
            Outcome::Status(status) => write!(f, "{status}"),
            Outcome::Halted(report) => write!(f, "halted: {report}"),
        }
    }
}

/*
    Peer-to-peer messages. Every one of them carries the sender's ack
    watermark t: every request the sender has originated or ever will
    originate that orders before (t, sender) is already in every replica's
    queue. The watermark is the sender's clock, capped at the stamp of its
    own multicast round while one is in flight.
*/

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Multicast {
    pub request: Request,
    pub sender: ServerId,
    pub watermark: Timestamp,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub from: ServerId,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execute {
    pub request: Request,
    pub sender: ServerId,
    pub watermark: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_breaks_ties_by_origin() {
        let a = Request::new(4, 2, Operation::Halt);
        let b = Request::new(4, 1, Operation::CreateAccount);
        let c = Request::new(3, 9, Operation::CreateAccount);

        let mut requests = vec![a.clone(), b.clone(), c.clone()];
        requests.sort();
        assert_eq!(requests, vec![c, b, a]);
    }

    #[test]
    fn test_equality_ignores_operation() {
        let a = Request::new(5, 1, Operation::CreateAccount);
        let b = Request::new(5, 1, Operation::Halt);
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_status_from_ledger_result() {
        assert_eq!(Status::from(Ok(())), Status::Ok);
        assert_eq!(
            Status::from(Err(LedgerError::InsufficientFunds {
                account: 1,
                balance: 0,
                requested: 5
            })),
            Status::InsufficientFunds
        );
        assert_eq!(Status::from(Err(LedgerError::UnknownAccount(3))), Status::UnknownAccount);
    }

    #[test]
    fn test_request_serde() {
        let request = Request::new(
            12,
            3,
            Operation::Transfer {
                from: 1,
                to: 2,
                amount: 300,
            },
        );
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id(), request.id());
        assert_eq!(decoded.operation, request.operation);
    }
}
