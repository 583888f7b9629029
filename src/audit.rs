//! Append-only audit trail of protocol events.
//!
//! The replication core only needs a sink it can `append` records to. The
//! file sink writes one line per record; the memory sink backs the tests
//! that compare execution order across replicas.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::error;

use crate::common::ServerId;
use crate::consensus::{HaltReport, Operation, Outcome, RequestId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditRecord {
    /// A client operation was accepted and stamped by this replica.
    ClientRequest {
        server: ServerId,
        request: RequestId,
        operation: Operation,
    },
    /// A peer's multicast was queued.
    MulticastReceived {
        server: ServerId,
        request: RequestId,
        sender: ServerId,
        operation: Operation,
    },
    /// A request was executed and removed from the queue.
    Executed {
        server: ServerId,
        request: RequestId,
        outcome: Outcome,
    },
    Halt(HaltReport),
}

impl AuditRecord {
    pub fn server(&self) -> ServerId {
        match self {
            AuditRecord::ClientRequest { server, .. }
            | AuditRecord::MulticastReceived { server, .. }
            | AuditRecord::Executed { server, .. } => *server,
            AuditRecord::Halt(report) => report.server_id,
        }
    }

    fn to_line(&self, time: &str) -> String {
        match self {
            AuditRecord::ClientRequest {
                server,
                request,
                operation,
            } => format!("Server-{server} CLIENT-REQ {time} {request} {operation}"),
            AuditRecord::MulticastReceived {
                server,
                request,
                sender,
                operation,
            } => format!("Server-{server} SRV-REQ {time} {request} from {sender} {operation}"),
            AuditRecord::Executed {
                server,
                request,
                outcome,
            } => format!("Server-{server} REQ_PROCESSING {time} {request} {outcome}"),
            AuditRecord::Halt(report) => format!(
                "Server-{} HALT {time} {} total={} queue={} digest={}",
                report.server_id,
                report.request,
                report.total_balance,
                report.queue_len,
                report.ledger_digest
            ),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord);
}

pub struct FileAuditLog {
    file: Mutex<File>,
}

impl FileAuditLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(FileAuditLog {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditLog {
    fn append(&self, record: &AuditRecord) {
        let time = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        let line = record.to_line(&time);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            error!(error = %e, "audit log append failed");
        }
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Requests in the order this log saw them executed.
    pub fn executed_order(&self) -> Vec<RequestId> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                AuditRecord::Executed { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn halt_report(&self) -> Option<HaltReport> {
        self.records().into_iter().find_map(|record| match record {
            AuditRecord::Halt(report) => Some(report),
            _ => None,
        })
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

pub struct NullAuditLog;

impl AuditSink for NullAuditLog {
    fn append(&self, _record: &AuditRecord) {}
}
