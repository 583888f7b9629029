use std::collections::BTreeMap;

use crate::common::{ServerId, Timestamp};

use super::message::RequestId;

/// The other replicas of the cluster, in ascending id order.
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<ServerId>,
}

impl Peers {
    pub fn new(mut members: Vec<ServerId>) -> Self {
        members.sort_unstable();
        members.dedup();
        Peers { members }
    }

    pub fn is_member(&self, id: ServerId) -> bool {
        self.members.binary_search(&id).is_ok()
    }
}

/*
    Highest watermark heard from each peer. Entries only move forward. A
    request (ts, origin) is deliverable when no participant can still
    introduce a request ordered before it:

        for every participant p:  (watermark[p], p) >= (ts, origin)

    i.e. watermark[p] >= ts, and on a tie p must not order before the origin.
*/

#[derive(Debug, Clone)]
pub struct AckTracker {
    acks: BTreeMap<ServerId, Timestamp>,
}

impl AckTracker {
    pub fn new(peers: &Peers) -> Self {
        AckTracker {
            acks: peers.members.iter().map(|id| (*id, 0)).collect(),
        }
    }

    /// Records `timestamp` for `peer`. Returns false for ids outside the
    /// cluster, which are never tracked.
    pub fn record(&mut self, peer: ServerId, timestamp: Timestamp) -> bool {
        match self.acks.get_mut(&peer) {
            Some(current) => {
                *current = (*current).max(timestamp);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: ServerId) -> Option<Timestamp> {
        self.acks.get(&peer).copied()
    }

    pub fn is_deliverable(&self, request: RequestId, local: ServerId, local_watermark: Timestamp) -> bool {
        let key = (request.timestamp, request.origin);
        (local_watermark, local) >= key
            && self.acks.iter().all(|(peer, acked)| (*acked, *peer) >= key)
    }

    /// Peers whose watermark still blocks `request`, for diagnostics.
    pub fn blocking(&self, request: RequestId) -> Vec<ServerId> {
        let key = (request.timestamp, request.origin);
        self.acks
            .iter()
            .filter(|(peer, acked)| (**acked, **peer) < key)
            .map(|(peer, _)| *peer)
            .collect()
    }
}
