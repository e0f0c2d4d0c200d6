//! In-memory remote store shared by the integration tests.
//!
//! Behaves like the reference server: a send whose change tag matches the
//! stored record overwrites it and gets a fresh tag, a stale tag is answered
//! with the stored record as a conflict. Every client has its own cursor into
//! the change feed.

#![allow(dead_code)]

use fieldsync_engine::{
    error::Result, ChangeTag, Error, JsonCodec, LocalStore, ManualClock, RecordCodec,
    RemoteRecord, RowKey, SendResult, SyncConfig, SyncCoordinator, Transport, WireRecord,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct Remote {
    records: Mutex<BTreeMap<RowKey, RemoteRecord>>,
    feed: Mutex<Vec<RowKey>>,
    next_tag: AtomicU64,
}

impl Remote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<RemoteRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// Store `incoming` unless its change tag is stale.
    pub fn save(&self, mut incoming: RemoteRecord) -> SendResult {
        let mut records = self.records.lock().unwrap();
        if let Some(current) = records.get(&incoming.key) {
            if current.change_tag != incoming.change_tag {
                return SendResult::conflict(current.clone());
            }
        }

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        incoming.change_tag = Some(ChangeTag::new(format!("tag-{tag}")));
        incoming.recompute_overall_mod_time();
        records.insert(incoming.key.clone(), incoming.clone());
        self.feed.lock().unwrap().push(incoming.key.clone());
        SendResult::confirmed(incoming)
    }

    /// Keys changed since `cursor`, deduplicated, with the new cursor.
    fn changes_since(&self, cursor: usize) -> (Vec<RemoteRecord>, usize) {
        let records = self.records.lock().unwrap();
        let feed = self.feed.lock().unwrap();
        let mut seen = Vec::new();
        for key in &feed[cursor.min(feed.len())..] {
            if !seen.contains(key) {
                seen.push(key.clone());
            }
        }
        let changed = seen
            .iter()
            .filter_map(|key| records.get(key).cloned())
            .collect();
        (changed, feed.len())
    }
}

/// One client's connection to the shared remote.
pub struct MemoryTransport {
    remote: Arc<Remote>,
    cursor: Mutex<usize>,
    pub offline: AtomicBool,
    pub stalled: AtomicBool,
    /// Raw items delivered ahead of the feed on the next receive
    pub injected: Mutex<Vec<WireRecord>>,
}

impl MemoryTransport {
    pub fn new(remote: Arc<Remote>) -> Self {
        Self {
            remote,
            cursor: Mutex::new(0),
            offline: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            injected: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for MemoryTransport {
    fn send_batch(
        &self,
        items: Vec<RemoteRecord>,
    ) -> impl Future<Output = Result<Vec<SendResult>>> + Send {
        async move {
            if self.stalled.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Transport("offline".into()));
            }
            Ok(items.into_iter().map(|item| self.remote.save(item)).collect())
        }
    }

    fn receive_batch(&self) -> BoxStream<'_, Result<WireRecord>> {
        if self.offline.load(Ordering::SeqCst) {
            return stream::iter(vec![Err(Error::Transport("offline".into()))]).boxed();
        }

        let mut cursor = self.cursor.lock().unwrap();
        let (changed, next) = self.remote.changes_since(*cursor);
        *cursor = next;

        let codec = JsonCodec::new();
        let mut items: Vec<Result<WireRecord>> = std::mem::take(&mut *self.injected.lock().unwrap())
            .into_iter()
            .map(Ok)
            .collect();
        items.extend(changed.iter().map(|record| codec.encode(record)));
        stream::iter(items).boxed()
    }
}

/// A client: its own store, clock, and connection.
pub struct Client {
    pub clock: Arc<ManualClock>,
    pub sync: SyncCoordinator<MemoryTransport>,
}

impl Client {
    pub fn new(remote: &Arc<Remote>, start: u64) -> Self {
        Self::with_config(remote, start, SyncConfig::default())
    }

    pub fn with_config(remote: &Arc<Remote>, start: u64, config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(LocalStore::new(clock.clone()));
        let sync = SyncCoordinator::new(store, MemoryTransport::new(remote.clone()), config);
        Self { clock, sync }
    }

    pub fn store(&self) -> &LocalStore {
        self.sync.store()
    }

    pub fn transport(&self) -> &MemoryTransport {
        self.sync.transport()
    }
}
