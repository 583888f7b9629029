use std::collections::BTreeMap;

use super::message::{Request, RequestId};

/// Undelivered requests in (timestamp, origin) order. Once every multicast
/// has arrived, all correct replicas hold the same queue.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    requests: BTreeMap<RequestId, Request>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        DeliveryQueue {
            requests: BTreeMap::new(),
        }
    }

    /// Returns false if a request with the same id is already queued.
    pub fn insert(&mut self, request: Request) -> bool {
        let id = request.id();
        if self.requests.contains_key(&id) {
            return false;
        }
        self.requests.insert(id, request);
        true
    }

    pub fn head_id(&self) -> Option<RequestId> {
        self.requests.keys().next().copied()
    }

    pub fn is_head(&self, id: RequestId) -> bool {
        self.head_id() == Some(id)
    }

    pub fn pop_head(&mut self) -> Option<Request> {
        self.requests.pop_first().map(|(_, request)| request)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.keys().copied().collect()
    }
}
