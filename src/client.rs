//! Client surface of the bank.
//!
//! `BankClient` talks to one replica over TCP. The load generator drives
//! random transfers through any set of `Endpoint`s, either real servers or
//! an in-process cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::common::ServerId;
use crate::config::{ClusterConfig, ConfigError, ReplicaSettings};
use crate::consensus::{HaltReport, Operation, Outcome, Replica, ReplicaError, Status};
use crate::ledger::{AccountId, Balance};
use crate::network::rpc::{RpcRequest, RpcResponse};
use crate::network::{LocalCluster, NetworkError, TcpPeer};

/// Anything a client operation can be submitted to.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn server_id(&self) -> ServerId;

    async fn submit(&self, operation: Operation) -> Result<Outcome, NetworkError>;
}

pub struct BankClient {
    peer: TcpPeer,
}

impl BankClient {
    pub fn new(cluster: &ClusterConfig, server: ServerId, settings: &ReplicaSettings) -> Result<Self, ConfigError> {
        let address = cluster.address(server)?;
        Ok(BankClient {
            peer: TcpPeer::new(server, address.to_string(), settings),
        })
    }

    async fn outcome(&self, operation: Operation) -> Result<Outcome, NetworkError> {
        match self.peer.call(RpcRequest::Submit(operation)).await? {
            RpcResponse::Outcome(outcome) => Ok(outcome),
            RpcResponse::Error(e) => Err(e.into_network_error(self.peer.id())),
            _ => Err(NetworkError::UnexpectedResponse("outcome")),
        }
    }

    pub async fn create_account(&self) -> Result<AccountId, NetworkError> {
        match self.outcome(Operation::CreateAccount).await? {
            Outcome::Created(id) => Ok(id),
            _ => Err(NetworkError::UnexpectedResponse("account id")),
        }
    }

    pub async fn deposit(&self, account: AccountId, amount: Balance) -> Result<Status, NetworkError> {
        self.status(Operation::Deposit { account, amount }).await
    }

    pub async fn transfer(&self, from: AccountId, to: AccountId, amount: Balance) -> Result<Status, NetworkError> {
        self.status(Operation::Transfer { from, to, amount }).await
    }

    pub async fn halt(&self) -> Result<HaltReport, NetworkError> {
        match self.outcome(Operation::Halt).await? {
            Outcome::Halted(report) => Ok(report),
            _ => Err(NetworkError::UnexpectedResponse("halt report")),
        }
    }

    /// Local read on the connected replica; not ordered with in-flight
    /// requests.
    pub async fn get_balance(&self, account: AccountId) -> Result<Option<Balance>, NetworkError> {
        match self.peer.call(RpcRequest::GetBalance(account)).await? {
            RpcResponse::Balance(balance) => Ok(balance),
            _ => Err(NetworkError::UnexpectedResponse("balance")),
        }
    }

    pub async fn get_server_id(&self) -> Result<ServerId, NetworkError> {
        match self.peer.call(RpcRequest::GetServerId).await? {
            RpcResponse::ServerId(id) => Ok(id),
            _ => Err(NetworkError::UnexpectedResponse("server id")),
        }
    }

    async fn status(&self, operation: Operation) -> Result<Status, NetworkError> {
        match self.outcome(operation).await? {
            Outcome::Status(status) => Ok(status),
            _ => Err(NetworkError::UnexpectedResponse("status")),
        }
    }
}

#[async_trait]
impl Endpoint for BankClient {
    fn server_id(&self) -> ServerId {
        self.peer.id()
    }

    async fn submit(&self, operation: Operation) -> Result<Outcome, NetworkError> {
        self.outcome(operation).await
    }
}

#[async_trait]
impl Endpoint for Replica {
    fn server_id(&self) -> ServerId {
        self.id()
    }

    async fn submit(&self, operation: Operation) -> Result<Outcome, NetworkError> {
        Replica::submit(self, operation).await.map_err(|e| match e {
            ReplicaError::Halted(id) => NetworkError::PeerHalted(id),
            other => NetworkError::Remote(other.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Concurrent client tasks.
    pub tasks: usize,
    pub iterations: usize,
    /// Transfers pick accounts from `1..=accounts`.
    pub accounts: AccountId,
    pub max_amount: Balance,
    pub seed: Option<u64>,
    pub halt: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            tasks: 4,
            iterations: 50,
            accounts: 20,
            max_amount: 50,
            seed: None,
            halt: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub requests: usize,
    pub ok: usize,
    pub insufficient_funds: usize,
    pub other: usize,
    pub mean_latency: Duration,
    pub max_latency: Duration,
    pub halt: Option<HaltReport>,
}

impl LoadSummary {
    fn record(&mut self, status: Status, latency: Duration, total: &mut Duration) {
        self.requests += 1;
        match status {
            Status::Ok => self.ok += 1,
            Status::InsufficientFunds => self.insufficient_funds += 1,
            _ => self.other += 1,
        }
        *total += latency;
        self.max_latency = self.max_latency.max(latency);
    }

    fn merge(&mut self, other: LoadSummary) {
        self.requests += other.requests;
        self.ok += other.ok;
        self.insufficient_funds += other.insufficient_funds;
        self.other += other.other;
        self.max_latency = self.max_latency.max(other.max_latency);
    }
}

/// Runs `config.tasks` concurrent workers, each submitting
/// `config.iterations` random transfers to random endpoints, then halts
/// through the first endpoint if asked to.
pub async fn run_load(endpoints: Vec<Arc<dyn Endpoint>>, config: &LoadConfig) -> Result<LoadSummary, NetworkError> {
    let Some(first) = endpoints.first().cloned() else {
        return Ok(LoadSummary::default());
    };

    let mut workers = Vec::with_capacity(config.tasks);
    for task in 0..config.tasks {
        let endpoints = endpoints.clone();
        let config = config.clone();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(task as u64)),
            None => StdRng::from_entropy(),
        };
        workers.push(tokio::spawn(async move {
            let mut summary = LoadSummary::default();
            let mut total = Duration::ZERO;
            for _ in 0..config.iterations {
                let endpoint = &endpoints[rng.gen_range(0..endpoints.len())];
                let operation = Operation::Transfer {
                    from: rng.gen_range(1..=config.accounts.max(1)),
                    to: rng.gen_range(1..=config.accounts.max(1)),
                    amount: rng.gen_range(1..=config.max_amount.max(1)),
                };
                debug!(task, server = endpoint.server_id(), operation = %operation, "submitting");
                let started = Instant::now();
                let outcome = endpoint.submit(operation).await?;
                let status = match outcome {
                    Outcome::Status(status) => status,
                    _ => return Err(NetworkError::UnexpectedResponse("status")),
                };
                summary.record(status, started.elapsed(), &mut total);
            }
            Ok::<_, NetworkError>((summary, total))
        }));
    }

    let mut summary = LoadSummary::default();
    let mut total = Duration::ZERO;
    for worker in workers {
        let (part, elapsed) = worker
            .await
            .map_err(|e| NetworkError::Remote(format!("load worker failed: {e}")))??;
        summary.merge(part);
        total += elapsed;
    }
    if summary.requests > 0 {
        summary.mean_latency = total / summary.requests as u32;
    }
    info!(
        requests = summary.requests,
        ok = summary.ok,
        mean_latency = ?summary.mean_latency,
        max_latency = ?summary.max_latency,
        "load finished"
    );

    if config.halt {
        match first.submit(Operation::Halt).await? {
            Outcome::Halted(report) => summary.halt = Some(report),
            _ => return Err(NetworkError::UnexpectedResponse("halt report")),
        }
    }
    Ok(summary)
}

/// Runs the load generator against an in-process cluster and returns the
/// load summary together with every replica's halt report.
pub async fn simulate(
    servers: ServerId,
    settings: &ReplicaSettings,
    config: &LoadConfig,
) -> Result<(LoadSummary, Vec<HaltReport>), NetworkError> {
    let ids: Vec<ServerId> = (1..=servers.max(1)).collect();
    let cluster = LocalCluster::start(&ids, settings);
    let endpoints = cluster
        .replicas
        .iter()
        .map(|replica| replica.clone() as Arc<dyn Endpoint>)
        .collect();

    let config = LoadConfig {
        halt: true,
        ..config.clone()
    };
    let summary = run_load(endpoints, &config).await?;

    let mut reports = Vec::with_capacity(ids.len());
    for replica in &cluster.replicas {
        let report = replica
            .halted()
            .await
            .ok_or(NetworkError::PeerHalted(replica.id()))?;
        reports.push(report);
    }
    Ok((summary, reports))
}
