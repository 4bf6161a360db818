//! In-process coordination backend.
//!
//! Models the parts of `ZooKeeper` the registrar relies on: a node tree with
//! per-parent sequence counters, session-owned ephemeral nodes, one-shot
//! existence and children watches, and a connect/ping session lifecycle.
//! Faults can be injected per operation, and call counters make retry and
//! reconnect behavior observable.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::coordinator::{
    CoordinationError, Coordinator, SessionState, Watch, WatchEvent, WatchEventKind, WatchTrigger,
};

/// Operations that can have faults injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Exists,
    Children,
    Get,
    Delete,
    Ping,
    Connect,
}

#[derive(Debug)]
struct Node {
    data: Bytes,
    version: i32,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    session: Option<u64>,
    next_session: u64,
    connected: bool,
    suppress_watches: bool,
    exist_watches: HashMap<String, Vec<WatchTrigger>>,
    child_watches: HashMap<String, Vec<WatchTrigger>>,
    /// Watches that will never fire but must not resolve as dropped.
    parked_watches: Vec<WatchTrigger>,
    faults: HashMap<Operation, VecDeque<CoordinationError>>,
    delete_faults: HashMap<String, CoordinationError>,
    failing_connects: usize,
}

impl State {
    fn check(&mut self, op: Operation) -> Result<(), CoordinationError> {
        if let Some(err) = self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if self.connected {
            Ok(())
        } else {
            Err(CoordinationError::ConnectionLoss)
        }
    }

    fn has_node(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn child_names(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_owned()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let rest = &path[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn ensure_parents(&mut self, parent: &str) {
        let mut current = String::new();
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            let grandparent = if current.is_empty() {
                "/".to_owned()
            } else {
                current.clone()
            };
            current.push('/');
            current.push_str(segment);
            if !self.nodes.contains_key(&current) {
                self.nodes.insert(
                    current.clone(),
                    Node {
                        data: Bytes::new(),
                        version: 0,
                        owner: None,
                    },
                );
                self.fire_children(&grandparent);
            }
        }
    }

    fn add_watch(&mut self, children: bool, path: &str, trigger: WatchTrigger) {
        self.prune_watches();
        if self.suppress_watches {
            self.parked_watches.push(trigger);
            return;
        }
        let map = if children {
            &mut self.child_watches
        } else {
            &mut self.exist_watches
        };
        map.entry(path.to_owned()).or_default().push(trigger);
    }

    /// Drop triggers whose watch was already dropped by the caller.
    fn prune_watches(&mut self) {
        for map in [&mut self.exist_watches, &mut self.child_watches] {
            map.retain(|_, triggers| {
                triggers.retain(|t| !t.is_closed());
                !triggers.is_empty()
            });
        }
        self.parked_watches.retain(|t| !t.is_closed());
    }

    fn fire_exists(&mut self, path: &str, kind: WatchEventKind) {
        for trigger in self.exist_watches.remove(path).unwrap_or_default() {
            let _ = trigger.send(WatchEvent::node(kind));
        }
    }

    fn fire_children(&mut self, parent: &str) {
        for trigger in self.child_watches.remove(parent).unwrap_or_default() {
            let _ = trigger.send(WatchEvent::node(WatchEventKind::NodeChildrenChanged));
        }
    }

    fn fire_session(&mut self, state: SessionState) {
        let pending = self
            .exist_watches
            .drain()
            .chain(self.child_watches.drain())
            .flat_map(|(_, triggers)| triggers);
        for trigger in pending {
            let _ = trigger.send(WatchEvent::session(state));
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire_exists(path, WatchEventKind::NodeDeleted);
            self.fire_children(&parent_of(path));
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

#[derive(Debug, Default)]
struct Counters {
    creates: AtomicUsize,
    connects: AtomicUsize,
    deletes: AtomicUsize,
}

/// Single-process [`Coordinator`] implementation.
///
/// Starts connected with an open session.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    state: Mutex<State>,
    counters: Counters,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let state = State {
            session: Some(1),
            next_session: 2,
            connected: true,
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            counters: Counters::default(),
        }
    }

    /// Drop the connection but keep the session; pending watches fire with
    /// [`SessionState::Disconnected`].
    pub fn disconnect(&self) {
        let mut st = self.state.lock();
        st.connected = false;
        st.fire_session(SessionState::Disconnected);
    }

    /// Expire the session: its ephemeral nodes are removed and pending watches
    /// fire with [`SessionState::Expired`].
    pub fn expire_session(&self) {
        let mut st = self.state.lock();
        let owned: Vec<String> = st
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.is_some() && node.owner == st.session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            st.nodes.remove(path);
        }
        st.session = None;
        st.connected = false;
        st.fire_session(SessionState::Expired);
    }

    /// Stop delivering watch notifications. Pending and future watches stay
    /// armed but never fire, as if the notification was lost in transit.
    pub fn suppress_watches(&self, suppress: bool) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.suppress_watches = suppress;
        if suppress {
            let pending: Vec<WatchTrigger> = st
                .exist_watches
                .drain()
                .chain(st.child_watches.drain())
                .flat_map(|(_, triggers)| triggers)
                .collect();
            st.parked_watches.extend(pending);
        }
    }

    /// Make the next call of `op` fail with `err`. Faults queue in order.
    pub fn fail_next(&self, op: Operation, err: CoordinationError) {
        self.state.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Make the next delete of `path` fail with `err`.
    pub fn fail_delete(&self, path: impl Into<String>, err: CoordinationError) {
        self.state.lock().delete_faults.insert(path.into(), err);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    /// Remove a node regardless of connection state, as another client would.
    pub fn evict(&self, path: &str) {
        self.state.lock().remove_node(path);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().has_node(path)
    }

    /// Child names of `path`, bypassing connection checks.
    #[must_use]
    pub fn child_names(&self, path: &str) -> Vec<String> {
        self.state.lock().child_names(path)
    }

    /// Watches armed and not yet fired, parked ones included.
    #[must_use]
    pub fn pending_watches(&self) -> usize {
        let mut st = self.state.lock();
        st.prune_watches();
        st.exist_watches
            .values()
            .chain(st.child_watches.values())
            .map(Vec::len)
            .sum::<usize>()
            + st.parked_watches.len()
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.counters.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        payload: Bytes,
    ) -> Result<String, CoordinationError> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        st.check(Operation::Create)?;
        if !prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(CoordinationError::Other(format!("invalid path prefix '{prefix}'")));
        }

        let parent = parent_of(prefix);
        st.ensure_parents(&parent);
        let seq = st.sequences.entry(parent.clone()).or_insert(0);
        let path = format!("{prefix}{:010}", *seq);
        *seq += 1;

        let owner = st.session;
        st.nodes.insert(
            path.clone(),
            Node {
                data: payload,
                version: 0,
                owner,
            },
        );
        st.fire_exists(&path, WatchEventKind::NodeCreated);
        st.fire_children(&parent);
        Ok(path)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        let mut st = self.state.lock();
        st.check(Operation::Exists)?;
        Ok(st.has_node(path))
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, Watch), CoordinationError> {
        let mut st = self.state.lock();
        st.check(Operation::Exists)?;
        let (trigger, watch) = Watch::channel();
        st.add_watch(false, path, trigger);
        Ok((st.has_node(path), watch))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let mut st = self.state.lock();
        st.check(Operation::Children)?;
        if !st.has_node(path) {
            return Err(CoordinationError::NoNode);
        }
        Ok(st.child_names(path))
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordinationError> {
        let mut st = self.state.lock();
        st.check(Operation::Children)?;
        if !st.has_node(path) {
            return Err(CoordinationError::NoNode);
        }
        let (trigger, watch) = Watch::channel();
        st.add_watch(true, path, trigger);
        Ok((st.child_names(path), watch))
    }

    async fn get(&self, path: &str) -> Result<Bytes, CoordinationError> {
        let mut st = self.state.lock();
        st.check(Operation::Get)?;
        st.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or(CoordinationError::NoNode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        st.check(Operation::Delete)?;
        if let Some(err) = st.delete_faults.remove(path) {
            return Err(err);
        }
        let node = st.nodes.get(path).ok_or(CoordinationError::NoNode)?;
        if version.is_some_and(|v| v != node.version) {
            return Err(CoordinationError::BadVersion);
        }
        if !st.child_names(path).is_empty() {
            return Err(CoordinationError::Other(format!("node '{path}' has children")));
        }
        st.remove_node(path);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        self.state.lock().check(Operation::Ping)
    }

    async fn connect(&self, _session_timeout: Duration) -> Result<(), CoordinationError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        if let Some(err) = st
            .faults
            .get_mut(&Operation::Connect)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if st.failing_connects > 0 {
            st.failing_connects -= 1;
            return Err(CoordinationError::ConnectionLoss);
        }
        if st.session.is_none() {
            let id = st.next_session;
            st.next_session += 1;
            st.session = Some(id);
        }
        st.connected = true;
        Ok(())
    }
}
