use chrono::{DateTime, Duration, Utc};
use ethereum_types::H256;
use ragno_common::types::{AttemptStatus, ConnectionAttempt, HostInfo};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::dial_state::DialState;

/// A node waiting for its next dial.
#[derive(Debug, Clone)]
pub struct QueuedNode {
    host_info: HostInfo,
    state: DialState,
    next_dial_time: DateTime<Utc>,
    /// Armed on the first failure of a streak; None while the node behaves.
    deprecation_time: Option<DateTime<Utc>>,
}

impl QueuedNode {
    fn new(host_info: HostInfo) -> Self {
        Self {
            host_info,
            state: DialState::Zero,
            next_dial_time: DateTime::<Utc>::MIN_UTC,
            deprecation_time: None,
        }
    }

    pub fn state(&self) -> DialState {
        self.state
    }

    pub fn next_dial_time(&self) -> DateTime<Utc> {
        self.next_dial_time
    }

    fn ready_to_dial(&self, now: DateTime<Utc>) -> bool {
        self.next_dial_time <= now
    }

    fn is_deprecable(&self, now: DateTime<Utc>) -> bool {
        self.deprecation_time.is_some_and(|deadline| deadline < now)
    }

    fn add_positive_dial(&mut self, base_time: DateTime<Utc>) {
        self.state = DialState::Positive;
        self.next_dial_time = base_time + self.state.delay();
        self.deprecation_time = None;
    }

    fn add_negative_dial(
        &mut self,
        base_time: DateTime<Utc>,
        state: DialState,
        deprecation_window: Duration,
    ) {
        self.state = state;
        self.next_dial_time = base_time + state.delay();
        if self.deprecation_time.is_none() {
            self.deprecation_time = Some(base_time + deprecation_window);
        }
    }
}

/// The scheduling structure the orchestrator iterates: nodes ordered by next
/// dial time with a cursor over the sorted list.
pub struct NodeOrderedSet {
    deprecation_window: Duration,
    inner: RwLock<Inner>,
}

struct Inner {
    cursor: usize,
    order: Vec<H256>,
    nodes: HashMap<H256, QueuedNode>,
}

impl Inner {
    fn remove(&mut self, node_id: H256) {
        if self.nodes.remove(&node_id).is_none() {
            warn!(node_id = %format!("{node_id:#x}"), "removing an untracked node");
            return;
        }
        match self.order.iter().position(|id| *id == node_id) {
            Some(index) => {
                self.order.remove(index);
                // keep the cursor pointing at the same next element
                if index < self.cursor {
                    self.cursor -= 1;
                }
            }
            None => warn!("queued node missing from the ordered list"),
        }
    }
}

impl NodeOrderedSet {
    pub fn new(deprecation_window: Duration) -> Self {
        Self {
            deprecation_window,
            inner: RwLock::new(Inner {
                cursor: 0,
                order: Vec::new(),
                nodes: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("queue lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: H256) -> bool {
        self.inner
            .read()
            .expect("queue lock poisoned")
            .nodes
            .contains_key(&node_id)
    }

    /// Idempotent insert at the head of the list.
    pub fn add(&self, host_info: HostInfo) {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        let node_id = host_info.node_id;
        if inner.nodes.contains_key(&node_id) {
            return;
        }
        trace!(node_id = %format!("{node_id:#x}"), "adding node to the queue");
        inner.nodes.insert(node_id, QueuedNode::new(host_info));
        inner.order.insert(0, node_id);
    }

    pub fn remove(&self, node_id: H256) {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        inner.remove(node_id);
    }

    pub fn get(&self, node_id: H256) -> Option<QueuedNode> {
        self.inner
            .read()
            .expect("queue lock poisoned")
            .nodes
            .get(&node_id)
            .cloned()
    }

    /// Merges candidates from the store (insert-if-absent), re-sorts by next
    /// dial time and rewinds the cursor.
    pub fn merge_from_store(&self, candidates: Vec<HostInfo>) {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        let inner = &mut *inner;
        let total_candidates = candidates.len();
        let mut new_nodes = 0;
        for host_info in candidates {
            let node_id = host_info.node_id;
            if inner.nodes.contains_key(&node_id) {
                continue;
            }
            inner.nodes.insert(node_id, QueuedNode::new(host_info));
            inner.order.insert(0, node_id);
            new_nodes += 1;
        }
        let nodes = &inner.nodes;
        inner.order.sort_by_key(|id| nodes[id].next_dial_time);
        inner.cursor = 0;
        info!(
            total_candidates,
            new_nodes,
            queued = inner.order.len(),
            "merged candidate nodes from the store"
        );
    }

    /// The node under the cursor, if its dial time has come. Advances the
    /// cursor on a hit; a miss means the rest of the sorted list is not due
    /// either.
    pub fn next_ready(&self) -> Option<HostInfo> {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        let node_id = *inner.order.get(inner.cursor)?;
        let node = &inner.nodes[&node_id];
        if !node.ready_to_dial(Utc::now()) {
            return None;
        }
        let host_info = node.host_info.clone();
        inner.cursor += 1;
        Some(host_info)
    }

    /// The single place dial outcomes mutate scheduling state. Also decides
    /// and records whether the attempt deprecates the node.
    pub fn update_from_attempt(
        &self,
        node_id: H256,
        attempt: &mut ConnectionAttempt,
        same_network: bool,
    ) {
        let mut inner = self.inner.write().expect("queue lock poisoned");
        let Some(node) = inner.nodes.get_mut(&node_id) else {
            warn!(
                node_id = %format!("{node_id:#x}"),
                "connection attempt for an untracked node"
            );
            return;
        };
        match attempt.status {
            AttemptStatus::Succeeded => {
                if !same_network {
                    // wrong network: identified but useless to us from now on
                    attempt.deprecable = true;
                    inner.remove(node_id);
                    return;
                }
                node.add_positive_dial(attempt.timestamp);
                attempt.deprecable = false;
            }
            AttemptStatus::Failed => {
                attempt.deprecable = node.is_deprecable(Utc::now());
                if attempt.deprecable {
                    debug!(
                        node_id = %format!("{node_id:#x}"),
                        "failure streak exceeded the deprecation window, pruning"
                    );
                    inner.remove(node_id);
                } else {
                    node.add_negative_dial(
                        attempt.timestamp,
                        DialState::from_error(attempt.error),
                        self.deprecation_window,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H512;
    use ragno_common::types::ErrorKind;

    fn host_info(byte: u8) -> HostInfo {
        HostInfo {
            node_id: H256::repeat_byte(byte),
            public_key: H512::repeat_byte(byte),
            ip: "1.2.3.4".parse().unwrap(),
            tcp: 30303,
        }
    }

    fn queue() -> NodeOrderedSet {
        NodeOrderedSet::new(Duration::hours(48))
    }

    #[test]
    fn add_is_idempotent() {
        let queue = queue();
        queue.add(host_info(1));
        queue.add(host_info(1));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(H256::repeat_byte(1)));
    }

    #[test]
    fn fresh_nodes_are_ready_immediately() {
        let queue = queue();
        queue.add(host_info(1));
        queue.add(host_info(2));
        assert!(queue.next_ready().is_some());
        assert!(queue.next_ready().is_some());
        assert!(queue.next_ready().is_none());
    }

    #[test]
    fn successful_attempt_advances_ten_minutes() {
        let queue = queue();
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);

        let mut attempt =
            ConnectionAttempt::succeeded(node_id, std::time::Duration::from_millis(50));
        queue.update_from_attempt(node_id, &mut attempt, true);

        assert!(!attempt.deprecable);
        let node = queue.get(node_id).unwrap();
        assert_eq!(node.state(), DialState::Positive);
        assert_eq!(node.next_dial_time(), attempt.timestamp + Duration::minutes(10));
    }

    #[test]
    fn failed_attempt_delay_matches_error_state() {
        let queue = queue();
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);

        let mut attempt = ConnectionAttempt::failed(node_id, ErrorKind::ConnectionRefused);
        queue.update_from_attempt(node_id, &mut attempt, false);
        assert!(!attempt.deprecable);
        let node = queue.get(node_id).unwrap();
        assert_eq!(node.state(), DialState::NegativeWithHope);
        assert_eq!(node.next_dial_time(), attempt.timestamp + Duration::minutes(3));

        let mut attempt = ConnectionAttempt::failed(node_id, ErrorKind::Timeout);
        queue.update_from_attempt(node_id, &mut attempt, false);
        let node = queue.get(node_id).unwrap();
        assert_eq!(node.state(), DialState::NegativeWithoutHope);
        assert_eq!(node.next_dial_time(), attempt.timestamp + Duration::minutes(20));
    }

    #[test]
    fn wrong_network_success_prunes_immediately() {
        let queue = queue();
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);

        let mut attempt =
            ConnectionAttempt::succeeded(node_id, std::time::Duration::from_millis(10));
        queue.update_from_attempt(node_id, &mut attempt, false);

        assert!(attempt.deprecable);
        assert!(!queue.contains(node_id));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn failure_streak_deprecates_after_the_window() {
        let queue = NodeOrderedSet::new(Duration::seconds(1));
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);

        // first failure arms the deprecation clock
        let mut first = ConnectionAttempt::failed(node_id, ErrorKind::ConnectionRefused);
        queue.update_from_attempt(node_id, &mut first, false);
        assert!(!first.deprecable);
        assert!(queue.contains(node_id));

        // second failure after the window fires the deprecation
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let mut second = ConnectionAttempt::failed(node_id, ErrorKind::ConnectionRefused);
        queue.update_from_attempt(node_id, &mut second, false);
        assert!(second.deprecable);
        assert!(!queue.contains(node_id));
    }

    #[test]
    fn positive_dial_clears_the_deprecation_clock() {
        let queue = NodeOrderedSet::new(Duration::seconds(1));
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);

        let mut failure = ConnectionAttempt::failed(node_id, ErrorKind::Eof);
        queue.update_from_attempt(node_id, &mut failure, false);

        let mut success =
            ConnectionAttempt::succeeded(node_id, std::time::Duration::from_millis(10));
        queue.update_from_attempt(node_id, &mut success, true);

        // the streak restarted: a late failure must arm a fresh clock
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let mut failure = ConnectionAttempt::failed(node_id, ErrorKind::Eof);
        queue.update_from_attempt(node_id, &mut failure, false);
        assert!(!failure.deprecable);
        assert!(queue.contains(node_id));
    }

    #[test]
    fn merge_sorts_by_next_dial_time_and_resets_cursor() {
        let queue = queue();
        queue.add(host_info(1));
        queue.add(host_info(2));

        // push node 1 into the future
        let node_id = H256::repeat_byte(1);
        let mut attempt = ConnectionAttempt::failed(node_id, ErrorKind::Timeout);
        queue.update_from_attempt(node_id, &mut attempt, false);

        // drain the ready node so the cursor moves
        assert!(queue.next_ready().is_some());
        assert!(queue.next_ready().is_none());

        queue.merge_from_store(vec![host_info(3)]);
        // fresh node 3 and untouched node 2 come before the delayed node 1
        let first = queue.next_ready().unwrap();
        let second = queue.next_ready().unwrap();
        assert_ne!(first.node_id, node_id);
        assert_ne!(second.node_id, node_id);
        assert!(queue.next_ready().is_none());
    }

    #[test]
    fn next_ready_stops_at_future_nodes() {
        let queue = queue();
        queue.add(host_info(1));
        let node_id = H256::repeat_byte(1);
        let mut attempt =
            ConnectionAttempt::succeeded(node_id, std::time::Duration::from_millis(10));
        queue.update_from_attempt(node_id, &mut attempt, true);

        // only node is scheduled ten minutes out
        assert!(queue.next_ready().is_none());
    }

    #[test]
    fn removal_behind_the_cursor_keeps_it_consistent() {
        let queue = queue();
        queue.add(host_info(1));
        queue.add(host_info(2));
        queue.add(host_info(3));

        // advance past the first two, then drop the first one sent
        let first = queue.next_ready().unwrap();
        let _second = queue.next_ready().unwrap();
        queue.remove(first.node_id);

        // the third node is still reachable and the cursor stays in bounds
        assert!(queue.next_ready().is_some());
        assert!(queue.next_ready().is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn untracked_nodes_are_ignored() {
        let queue = queue();
        let node_id = H256::repeat_byte(9);
        let mut attempt = ConnectionAttempt::failed(node_id, ErrorKind::Eof);
        queue.update_from_attempt(node_id, &mut attempt, false);
        assert!(!attempt.deprecable);
        assert!(queue.is_empty());
    }
}
