use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::common::{to_hex, Hashable, LogicalClock, ServerId, Timestamp};
use crate::config::ReplicaSettings;
use crate::ledger::{AccountId, Balance, Ledger};
use crate::network::{Directory, NetworkError};

use super::message::{Ack, Execute, HaltReport, Multicast, Operation, Outcome, Request, RequestId, Status};
use super::peers::{AckTracker, Peers};
use super::queue::DeliveryQueue;

/*
    State machine replication over Lamport timestamps.

    A replica that accepts a client operation becomes the coordinator for
    that request only:
      1. stamp it with the local clock and queue it locally
      2. multicast it to every peer, one round at a time per replica,
         folding each peer's acknowledgment into the ack tracker
      3. wait until the request heads the local queue and every participant's
         watermark has passed it (see AckTracker)
      4. instruct every peer, then itself, to execute it

    A replica that receives an execute instruction waits until the request
    heads its own queue before applying it, so every replica applies the
    same requests in the same (timestamp, origin) order.

    Waits are driven by a version counter bumped on every change to the
    queue, the ack tracker, the clock or the ledger.
*/

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("peer {peer} unreachable: {source}")]
    PeerUnreachable {
        peer: ServerId,
        #[source]
        source: NetworkError,
    },

    #[error("replica {0} has halted")]
    Halted(ServerId),

    #[error("server {0} is not a member of the cluster")]
    UnknownSender(ServerId),
}

struct CoreState {
    queue: DeliveryQueue,
    acks: AckTracker,
    ledger: Ledger,
    /// Outcome of every executed request, answering resent execute
    /// instructions. Lives as long as the run; never pruned.
    executed: HashMap<RequestId, Outcome>,
    open_round: Option<Timestamp>,
    halt: Option<HaltReport>,
}

pub struct Replica {
    id: ServerId,
    peers: Peers,
    clock: LogicalClock,
    state: Mutex<CoreState>,
    changed: watch::Sender<u64>,
    round: AsyncMutex<()>,
    halted: watch::Sender<Option<HaltReport>>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditSink>,
}

impl Replica {
    pub fn new(
        id: ServerId,
        peers: Vec<ServerId>,
        settings: &ReplicaSettings,
        directory: Arc<dyn Directory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let peers = Peers::new(peers.into_iter().filter(|peer| *peer != id).collect());
        let state = CoreState {
            queue: DeliveryQueue::new(),
            acks: AckTracker::new(&peers),
            ledger: Ledger::seeded(settings.seed_accounts, settings.seed_balance),
            executed: HashMap::new(),
            open_round: None,
            halt: None,
        };
        let (changed, _) = watch::channel(0);
        let (halted, _) = watch::channel(None);

        info!(
            server = id,
            peers = ?peers.members,
            accounts = settings.seed_accounts,
            "replica initialised"
        );

        Replica {
            id,
            peers,
            clock: LogicalClock::new(),
            state: Mutex::new(state),
            changed,
            round: AsyncMutex::new(()),
            halted,
            directory,
            audit,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn clock(&self) -> Timestamp {
        self.clock.current()
    }

    pub fn balance(&self, account: AccountId) -> Option<Balance> {
        self.lock_state().ledger.balance(account)
    }

    pub fn total_balance(&self) -> Balance {
        self.lock_state().ledger.total_balance()
    }

    pub fn ledger_digest(&self) -> String {
        to_hex(&self.lock_state().ledger.hash())
    }

    pub fn queued(&self) -> Vec<RequestId> {
        self.lock_state().queue.ids()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn is_executed(&self, id: RequestId) -> bool {
        self.lock_state().executed.contains_key(&id)
    }

    pub fn acked(&self, peer: ServerId) -> Option<Timestamp> {
        self.lock_state().acks.get(peer)
    }

    /// Resolves once this replica has executed a halt request.
    pub async fn halted(&self) -> Option<HaltReport> {
        let mut halted = self.halted.subscribe();
        let report = halted.wait_for(Option::is_some).await.ok()?;
        (*report).clone()
    }

    /// Drives a client operation through the whole protocol with this
    /// replica as coordinator and returns the local execution outcome.
    pub async fn submit(&self, operation: Operation) -> Result<Outcome, ReplicaError> {
        let request = {
            let _round = self.round.lock().await;
            let request = self.accept(operation)?;
            let multicast = self.multicast(&request).await;
            self.close_round();
            if let Err(e) = multicast {
                error!(
                    server = self.id,
                    request = %request.id(),
                    error = %e,
                    "multicast failed, request stays queued"
                );
                return Err(e);
            }
            request
        };

        self.await_deliverable(request.id()).await?;
        self.distribute_execute(&request).await
    }

    /// Peer side of the multicast: queue the request and acknowledge with
    /// this replica's watermark.
    pub fn receive_multicast(&self, message: Multicast) -> Result<Ack, ReplicaError> {
        let Multicast {
            request,
            sender,
            watermark,
        } = message;
        let id = request.id();

        let (inserted, timestamp) = {
            let mut state = self.lock_state();
            if state.halt.is_some() {
                return Err(ReplicaError::Halted(self.id));
            }
            // No execute instruction would ever follow, and the request
            // would block the queue once it reached the head.
            if !self.peers.is_member(sender) || request.origin != sender {
                warn!(server = self.id, sender, request = %id, "multicast from a server outside the cluster rejected");
                return Err(ReplicaError::UnknownSender(sender));
            }
            self.clock.witness(request.timestamp);
            state.acks.record(sender, watermark);
            let inserted = !state.executed.contains_key(&id) && state.queue.insert(request.clone());
            (inserted, self.watermark(&state))
        };
        self.notify();

        if inserted {
            debug!(server = self.id, request = %id, sender, ack = timestamp, "multicast queued");
            self.audit.append(&AuditRecord::MulticastReceived {
                server: self.id,
                request: id,
                sender,
                operation: request.operation,
            });
        }

        Ok(Ack {
            from: self.id,
            timestamp,
        })
    }

    /// Peer side of the execute phase. Waits until the request heads the
    /// local queue; a duplicate instruction returns the recorded outcome.
    pub async fn receive_execute(&self, message: Execute) -> Result<Outcome, ReplicaError> {
        {
            let mut state = self.lock_state();
            self.clock.update(message.watermark);
            state.acks.record(message.sender, message.watermark);
        }
        self.notify();
        self.execute(&message.request).await
    }

    fn accept(&self, operation: Operation) -> Result<Request, ReplicaError> {
        let request = {
            let mut state = self.lock_state();
            if state.halt.is_some() {
                return Err(ReplicaError::Halted(self.id));
            }
            let timestamp = self.clock.increment_and_stamp();
            let request = Request::new(timestamp, self.id, operation);
            state.open_round = Some(timestamp);
            state.queue.insert(request.clone());
            request
        };
        self.notify();

        debug!(server = self.id, request = %request.id(), operation = %request.operation, "client request accepted");
        self.audit.append(&AuditRecord::ClientRequest {
            server: self.id,
            request: request.id(),
            operation: request.operation.clone(),
        });
        Ok(request)
    }

    async fn multicast(&self, request: &Request) -> Result<(), ReplicaError> {
        for &peer in &self.peers.members {
            let message = Multicast {
                request: request.clone(),
                sender: self.id,
                watermark: self.current_watermark(),
            };
            let ack = match self.directory.lookup(peer) {
                Ok(client) => client.multicast(message).await,
                Err(e) => Err(e),
            }
            .map_err(|source| ReplicaError::PeerUnreachable { peer, source })?;

            self.record_ack(peer, ack.timestamp);
        }
        Ok(())
    }

    fn record_ack(&self, peer: ServerId, timestamp: Timestamp) {
        {
            let mut state = self.lock_state();
            self.clock.update(timestamp);
            state.acks.record(peer, timestamp);
        }
        self.notify();
    }

    fn close_round(&self) {
        self.lock_state().open_round = None;
        self.notify();
    }

    async fn await_deliverable(&self, id: RequestId) -> Result<(), ReplicaError> {
        let mut changes = self.changed.subscribe();
        let mut reported = false;
        loop {
            changes.borrow_and_update();
            {
                let state = self.lock_state();
                if state.halt.is_some() {
                    return Err(ReplicaError::Halted(self.id));
                }
                if state.queue.is_head(id) {
                    if state.acks.is_deliverable(id, self.id, self.watermark(&state)) {
                        debug!(server = self.id, request = %id, "request deliverable");
                        return Ok(());
                    }
                    if !reported {
                        debug!(server = self.id, request = %id, waiting_on = ?state.acks.blocking(id), "request at head, waiting for acknowledgments");
                        reported = true;
                    }
                }
            }
            if changes.changed().await.is_err() {
                return Err(ReplicaError::Halted(self.id));
            }
        }
    }

    async fn distribute_execute(&self, request: &Request) -> Result<Outcome, ReplicaError> {
        let mut failure = None;
        for &peer in &self.peers.members {
            let message = Execute {
                request: request.clone(),
                sender: self.id,
                watermark: self.current_watermark(),
            };
            let result = match self.directory.lookup(peer) {
                Ok(client) => client.execute(message).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                // Peers may already be gone by the time a halt reaches them.
                Err(e) if request.operation.is_halt() => {
                    warn!(server = self.id, peer, error = %e, "peer did not confirm halt");
                }
                Err(source) => {
                    error!(server = self.id, peer, request = %request.id(), error = %source, "execute instruction failed");
                    if failure.is_none() {
                        failure = Some(ReplicaError::PeerUnreachable { peer, source });
                    }
                }
            }
        }

        let outcome = self.execute(request).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    async fn execute(&self, request: &Request) -> Result<Outcome, ReplicaError> {
        let mut changes = self.changed.subscribe();
        loop {
            changes.borrow_and_update();
            if let Some(result) = self.try_execute(request.id()) {
                return result;
            }
            if changes.changed().await.is_err() {
                return Err(ReplicaError::Halted(self.id));
            }
        }
    }

    /// Applies the request if it heads the queue. `None` means not yet.
    fn try_execute(&self, id: RequestId) -> Option<Result<Outcome, ReplicaError>> {
        let (request, outcome) = {
            let mut state = self.lock_state();
            if let Some(outcome) = state.executed.get(&id) {
                return Some(Ok(outcome.clone()));
            }
            if state.halt.is_some() {
                return Some(Err(ReplicaError::Halted(self.id)));
            }
            if !state.queue.is_head(id) {
                return None;
            }
            let request = state.queue.pop_head()?;
            let outcome = self.apply(&mut state, &request);
            state.executed.insert(id, outcome.clone());

            // Appended under the lock so the audit trail keeps execution order.
            self.audit.append(&AuditRecord::Executed {
                server: self.id,
                request: id,
                outcome: outcome.clone(),
            });
            if let Outcome::Halted(report) = &outcome {
                self.audit.append(&AuditRecord::Halt(report.clone()));
            }
            (request, outcome)
        };
        self.notify();

        debug!(server = self.id, request = %id, operation = %request.operation, outcome = %outcome, "request executed");
        if let Outcome::Halted(report) = &outcome {
            info!(
                server = report.server_id,
                request = %report.request,
                total_balance = report.total_balance,
                queue_len = report.queue_len,
                "halt executed"
            );
            self.halted.send_replace(Some(report.clone()));
        }
        Some(Ok(outcome))
    }

    fn apply(&self, state: &mut CoreState, request: &Request) -> Outcome {
        match &request.operation {
            Operation::CreateAccount => Outcome::Created(state.ledger.create_account()),
            Operation::Deposit { account, amount } => {
                Outcome::Status(Status::from(state.ledger.deposit(*account, *amount)))
            }
            Operation::Transfer { from, to, amount } => {
                Outcome::Status(Status::from(state.ledger.transfer(*from, *to, *amount)))
            }
            Operation::Halt => {
                let report = HaltReport {
                    server_id: self.id,
                    request: request.id(),
                    total_balance: state.ledger.total_balance(),
                    queue_len: state.queue.len(),
                    ledger_digest: to_hex(&state.ledger.hash()),
                };
                state.halt = Some(report.clone());
                Outcome::Halted(report)
            }
        }
    }

    fn watermark(&self, state: &CoreState) -> Timestamp {
        let clock = self.clock.current();
        match state.open_round {
            Some(stamp) => clock.min(stamp),
            None => clock,
        }
    }

    fn current_watermark(&self) -> Timestamp {
        let state = self.lock_state();
        self.watermark(&state)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{MemoryAuditLog, NullAuditLog};
    use crate::network::{LocalCluster, LocalNetwork};

    fn settings() -> ReplicaSettings {
        ReplicaSettings {
            seed_accounts: 3,
            seed_balance: 100,
            ..ReplicaSettings::default()
        }
    }

    fn lone_replica(id: ServerId, peers: Vec<ServerId>) -> (Replica, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let replica = Replica::new(id, peers, &settings(), LocalNetwork::new(), audit.clone());
        (replica, audit)
    }

    #[tokio::test]
    async fn test_single_replica_executes_immediately() {
        let (replica, audit) = lone_replica(1, vec![]);

        let outcome = replica
            .submit(Operation::Transfer {
                from: 1,
                to: 2,
                amount: 60,
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Status(Status::Ok));
        assert_eq!(replica.balance(1), Some(40));
        assert_eq!(replica.balance(2), Some(160));

        let created = replica.submit(Operation::CreateAccount).await.unwrap();
        assert_eq!(created, Outcome::Created(4));
        assert_eq!(replica.queue_len(), 0);
        assert_eq!(audit.executed_order().len(), 2);
    }

    #[tokio::test]
    async fn test_business_failures_are_statuses() {
        let (replica, _) = lone_replica(1, vec![]);

        let overdraw = Operation::Transfer {
            from: 1,
            to: 2,
            amount: 101,
        };
        assert_eq!(replica.submit(overdraw).await.unwrap(), Outcome::Status(Status::InsufficientFunds));
        let unknown = Operation::Deposit {
            account: 42,
            amount: 1,
        };
        assert_eq!(replica.submit(unknown).await.unwrap(), Outcome::Status(Status::UnknownAccount));
        let negative = Operation::Deposit {
            account: 1,
            amount: -1,
        };
        assert_eq!(replica.submit(negative).await.unwrap(), Outcome::Status(Status::InvalidAmount));
        assert_eq!(replica.total_balance(), 300);
    }

    #[tokio::test]
    async fn test_multicast_receipt_queues_and_acks_past_the_stamp() {
        let (replica, audit) = lone_replica(2, vec![1, 3]);
        let request = Request::new(5, 1, Operation::CreateAccount);

        let ack = replica
            .receive_multicast(Multicast {
                request: request.clone(),
                sender: 1,
                watermark: 5,
            })
            .unwrap();

        assert_eq!(ack.from, 2);
        assert_eq!(ack.timestamp, 6);
        assert_eq!(replica.clock(), 6);
        assert_eq!(replica.queued(), vec![request.id()]);
        assert_eq!(replica.acked(1), Some(5));
        assert_eq!(audit.records().len(), 1);

        // A resent multicast is acknowledged but not queued twice.
        replica
            .receive_multicast(Multicast {
                request,
                sender: 1,
                watermark: 5,
            })
            .unwrap();
        assert_eq!(replica.queue_len(), 1);
        assert_eq!(audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_execute_applies_once() {
        let (replica, audit) = lone_replica(2, vec![1]);
        let request = Request::new(
            1,
            1,
            Operation::Deposit {
                account: 1,
                amount: 50,
            },
        );
        replica
            .receive_multicast(Multicast {
                request: request.clone(),
                sender: 1,
                watermark: 1,
            })
            .unwrap();

        let execute = Execute {
            request,
            sender: 1,
            watermark: 2,
        };
        let first = replica.receive_execute(execute.clone()).await.unwrap();
        let second = replica.receive_execute(execute).await.unwrap();

        assert_eq!(first, Outcome::Status(Status::Ok));
        assert_eq!(second, first);
        assert_eq!(replica.balance(1), Some(150));
        assert_eq!(audit.executed_order().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_waits_for_queue_head() {
        let (replica, _) = lone_replica(3, vec![1, 2]);
        let replica = Arc::new(replica);
        let early = Request::new(
            1,
            1,
            Operation::Transfer {
                from: 1,
                to: 2,
                amount: 100,
            },
        );
        let late = Request::new(
            1,
            2,
            Operation::Transfer {
                from: 1,
                to: 3,
                amount: 100,
            },
        );
        for (request, sender) in [(early.clone(), 1), (late.clone(), 2)] {
            replica
                .receive_multicast(Multicast {
                    request,
                    sender,
                    watermark: 1,
                })
                .unwrap();
        }

        let waiting = {
            let replica = replica.clone();
            tokio::spawn(async move {
                replica
                    .receive_execute(Execute {
                        request: late,
                        sender: 2,
                        watermark: 3,
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(replica.balance(3), Some(100));

        let first = replica
            .receive_execute(Execute {
                request: early,
                sender: 1,
                watermark: 3,
            })
            .await
            .unwrap();
        assert_eq!(first, Outcome::Status(Status::Ok));

        // Account 1 was emptied by the earlier request.
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second, Outcome::Status(Status::InsufficientFunds));
        assert_eq!(replica.balance(2), Some(200));
        assert_eq!(replica.balance(3), Some(100));
    }

    #[tokio::test]
    async fn test_halted_replica_rejects_new_work() {
        let replica = Replica::new(1, vec![], &settings(), LocalNetwork::new(), Arc::new(NullAuditLog));

        let outcome = replica.submit(Operation::Halt).await.unwrap();
        let Outcome::Halted(report) = outcome else {
            panic!("expected a halt report");
        };
        assert_eq!(report.total_balance, 300);
        assert_eq!(report.queue_len, 0);
        assert_eq!(replica.halted().await, Some(report));

        assert!(matches!(
            replica.submit(Operation::CreateAccount).await,
            Err(ReplicaError::Halted(1))
        ));
        assert!(matches!(
            replica.receive_multicast(Multicast {
                request: Request::new(9, 2, Operation::CreateAccount),
                sender: 2,
                watermark: 9,
            }),
            Err(ReplicaError::Halted(1))
        ));
    }

    #[tokio::test]
    async fn test_overflowing_deposit_is_a_status() {
        let (replica, audit) = lone_replica(1, vec![]);

        let outcome = replica
            .submit(Operation::Deposit {
                account: 1,
                amount: Balance::MAX,
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Status(Status::InvalidAmount));
        assert_eq!(replica.balance(1), Some(100));
        assert_eq!(replica.queue_len(), 0);
        assert_eq!(audit.executed_order().len(), 1);

        // The replica keeps serving afterwards.
        let next = replica.submit(Operation::CreateAccount).await.unwrap();
        assert_eq!(next, Outcome::Created(4));
    }

    #[tokio::test]
    async fn test_multicast_from_outside_the_cluster_is_rejected() {
        let (replica, audit) = lone_replica(2, vec![1, 3]);

        let stranger = replica.receive_multicast(Multicast {
            request: Request::new(1, 7, Operation::CreateAccount),
            sender: 7,
            watermark: 1,
        });
        assert!(matches!(stranger, Err(ReplicaError::UnknownSender(7))));

        let forged = replica.receive_multicast(Multicast {
            request: Request::new(1, 3, Operation::CreateAccount),
            sender: 1,
            watermark: 1,
        });
        assert!(matches!(forged, Err(ReplicaError::UnknownSender(1))));

        assert_eq!(replica.queue_len(), 0);
        assert_eq!(replica.clock(), 0);
        assert!(audit.records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waits_for_peer_watermark_after_multicast() {
        let cluster = LocalCluster::start(&[1, 2], &settings());
        cluster.network.hold(2);

        // Replica 1 opens a round with stamp 1; its multicast to 2 is parked.
        let first = cluster.replica(1).clone();
        let early = tokio::spawn(async move {
            first
                .submit(Operation::Deposit {
                    account: 1,
                    amount: 5,
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Replica 2 stamps (1, 2). Its multicast reaches 1, whose watermark
        // is capped by the open round at 1, so (1, 1) still blocks it.
        let second = cluster.replica(2).clone();
        let late = tokio::spawn(async move {
            second
                .submit(Operation::Transfer {
                    from: 1,
                    to: 2,
                    amount: 105,
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let late_id = RequestId {
            timestamp: 1,
            origin: 2,
        };
        assert!(!late.is_finished());
        assert_eq!(cluster.replica(1).queue_len(), 2);
        assert_eq!(cluster.replica(2).queued(), vec![late_id]);
        assert_eq!(cluster.replica(2).acked(1), Some(1));
        assert!(!cluster.replica(2).is_executed(late_id));

        cluster.network.release(2);
        assert_eq!(early.await.unwrap().unwrap(), Outcome::Status(Status::Ok));
        // Runs after the deposit, so the balance covers it.
        assert_eq!(late.await.unwrap().unwrap(), Outcome::Status(Status::Ok));

        let order = vec![
            RequestId {
                timestamp: 1,
                origin: 1,
            },
            late_id,
        ];
        assert_eq!(cluster.audit(1).executed_order(), order);
        assert_eq!(cluster.audit(2).executed_order(), order);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        // Peer 2 is configured but never registered with the network.
        let (replica, _) = lone_replica(1, vec![2]);
        let result = replica.submit(Operation::CreateAccount).await;

        assert!(matches!(result, Err(ReplicaError::PeerUnreachable { peer: 2, .. })));
        assert_eq!(replica.queue_len(), 1);
    }
}
