//! Mock node for testing.
//!
//! Fully in-memory [`NodeHandle`] implementation with deterministic,
//! scripted failure injection: each operation pops the next queued failure
//! for that operation before touching the credential set, so tests can
//! express "fail twice then succeed" exactly.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use vac_common::NodeError;

use crate::node_client::NodeHandle;

/// In-memory proxy node double.
pub struct MockNode {
    credentials: Mutex<HashSet<Uuid>>,
    fail_list: Mutex<VecDeque<NodeError>>,
    fail_add: Mutex<VecDeque<NodeError>>,
    fail_remove: Mutex<VecDeque<NodeError>>,
    list_calls: AtomicU32,
    add_calls: AtomicU32,
    remove_calls: AtomicU32,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            credentials: Mutex::new(HashSet::new()),
            fail_list: Mutex::new(VecDeque::new()),
            fail_add: Mutex::new(VecDeque::new()),
            fail_remove: Mutex::new(VecDeque::new()),
            list_calls: AtomicU32::new(0),
            add_calls: AtomicU32::new(0),
            remove_calls: AtomicU32::new(0),
        }
    }

    /// Start with these credentials already loaded.
    pub fn with_credentials(ids: impl IntoIterator<Item = Uuid>) -> Self {
        let node = Self::new();
        node.credentials.lock().extend(ids);
        node
    }

    /// Queue `err` to be returned by the next `count` list calls.
    pub fn fail_list(&self, err: NodeError, count: u32) {
        let mut queue = self.fail_list.lock();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Queue `err` to be returned by the next `count` add calls.
    pub fn fail_add(&self, err: NodeError, count: u32) {
        let mut queue = self.fail_add.lock();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Queue `err` to be returned by the next `count` remove calls.
    pub fn fail_remove(&self, err: NodeError, count: u32) {
        let mut queue = self.fail_remove.lock();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Current credential set, for assertions.
    pub fn loaded(&self) -> HashSet<Uuid> {
        self.credentials.lock().clone()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.credentials.lock().contains(&id)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn add_calls(&self) -> u32 {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> u32 {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandle for MockNode {
    async fn list_credentials(&self) -> Result<HashSet<Uuid>, NodeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_list.lock().pop_front() {
            return Err(err);
        }
        Ok(self.credentials.lock().clone())
    }

    async fn add_credential(&self, id: Uuid, _tier: &str, _label: &str) -> Result<(), NodeError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_add.lock().pop_front() {
            return Err(err);
        }
        // inserting an existing id is success, same as the real node
        self.credentials.lock().insert(id);
        Ok(())
    }

    async fn remove_credential(&self, id: Uuid) -> Result<(), NodeError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_remove.lock().pop_front() {
            return Err(err);
        }
        // removing an absent id is success, same as the real node
        self.credentials.lock().remove(&id);
        Ok(())
    }
}
