//! In-memory store with optional JSON snapshot persistence.
//!
//! # Design Decisions
//! - One async mutex guards all state; every mutation is serialized
//! - With a snapshot path, each mutation is applied to a copy, the copy is
//!   written atomically (temp file, then rename), and only then replaces the
//!   live state. A failed write leaves the store as it was
//! - A snapshot that exists but cannot be read is a startup error

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::ledger::{BlockId, Digest, PublicKey};
use crate::store::types::{Deposit, NotifyState, RequestKey, RequestStatus, SendRequest};
use crate::store::{Store, StoreError, StoreResult};

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    requests: Vec<SendRequest>,
    deposits: Vec<Deposit>,
    subscriptions: Vec<(String, PublicKey)>,
    cursors: BTreeMap<String, BlockId>,
}

#[derive(Debug, Default, Clone)]
struct State {
    /// Insertion order doubles as age order.
    requests: Vec<SendRequest>,
    index: HashMap<RequestKey, usize>,
    deposits: Vec<Deposit>,
    deposit_keys: HashSet<(String, PublicKey, Digest)>,
    subscriptions: Vec<(String, PublicKey)>,
    cursors: BTreeMap<String, BlockId>,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let index = snapshot
            .requests
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
        let deposit_keys = snapshot.deposits.iter().map(Deposit::key).collect();
        Self {
            requests: snapshot.requests,
            index,
            deposits: snapshot.deposits,
            deposit_keys,
            subscriptions: snapshot.subscriptions,
            cursors: snapshot.cursors,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            requests: self.requests.clone(),
            deposits: self.deposits.clone(),
            subscriptions: self.subscriptions.clone(),
            cursors: self.cursors.clone(),
        }
    }

    fn request_mut(&mut self, key: &RequestKey) -> StoreResult<&mut SendRequest> {
        let idx = *self
            .index
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(&mut self.requests[idx])
    }
}

/// Reference [`Store`] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            path: None,
        }
    }

    /// Store backed by a snapshot file, loading it if present.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| StoreError::Backend(format!("read {}: {}", path.display(), e)))?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .map_err(|e| StoreError::Backend(format!("parse {}: {}", path.display(), e)))?;
            tracing::info!(
                path = %path.display(),
                requests = snapshot.requests.len(),
                deposits = snapshot.deposits.len(),
                subscriptions = snapshot.subscriptions.len(),
                "Loaded store snapshot"
            );
            State::from_snapshot(snapshot)
        } else {
            tracing::info!(path = %path.display(), "No store snapshot found, starting empty");
            State::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    /// Run `change` against the state. The closure returns its value and
    /// whether it modified anything. Modifications become visible only after
    /// the snapshot is written.
    async fn mutate<T>(&self, change: impl FnOnce(&mut State) -> StoreResult<(T, bool)>) -> StoreResult<T> {
        let mut state = self.state.lock().await;
        if self.path.is_none() {
            return change(&mut state).map(|(value, _)| value);
        }
        let mut next = state.clone();
        let (value, dirty) = change(&mut next)?;
        if dirty {
            self.persist(&next).await?;
            *state = next;
        }
        Ok(value)
    }

    async fn persist(&self, state: &State) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(&state.to_snapshot())
            .map_err(|e| StoreError::Backend(format!("serialize snapshot: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content)
            .await
            .map_err(|e| StoreError::Backend(format!("write {}: {}", temp_path.display(), e)))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::Backend(format!("rename {}: {}", path.display(), e)))?;
        tracing::trace!(path = %path.display(), "Store snapshot saved");
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, request: &SendRequest) -> StoreResult<()> {
        self.mutate(|state| {
            if state.index.contains_key(&request.key) {
                return Err(StoreError::Duplicate);
            }
            let idx = state.requests.len();
            state.index.insert(request.key.clone(), idx);
            state.requests.push(request.clone());
            Ok(((), true))
        })
        .await
    }

    async fn get_request(&self, key: &RequestKey) -> StoreResult<Option<SendRequest>> {
        let state = self.state.lock().await;
        Ok(state.index.get(key).map(|&i| state.requests[i].clone()))
    }

    async fn list_requests(&self, status: RequestStatus, limit: usize) -> StoreResult<Vec<SendRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_stale_posted(&self, max_post_height: BlockId, limit: usize) -> StoreResult<Vec<SendRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Posted)
            .filter(|r| r.posted.is_some_and(|p| p.post_height <= max_post_height))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_request(&self, request: &SendRequest) -> StoreResult<()> {
        self.mutate(|state| {
            let stored = state.request_mut(&request.key)?;
            if stored.status.is_terminal() {
                return Err(StoreError::Immutable(request.key.to_string()));
            }
            *stored = request.clone();
            Ok(((), true))
        })
        .await
    }

    async fn confirm_posted(&self, signer: &PublicKey, digest: &Digest, block_id: BlockId) -> StoreResult<Option<RequestKey>> {
        self.mutate(|state| {
            let found = state.requests.iter_mut().find(|r| {
                r.status == RequestStatus::Posted
                    && r.posted.is_some_and(|p| p.signer == *signer && p.digest == *digest)
            });
            Ok(match found {
                Some(request) => {
                    request.status = RequestStatus::Confirmed;
                    request.confirmed_block = Some(block_id);
                    (Some(request.key.clone()), true)
                }
                None => (None, false),
            })
        })
        .await
    }

    async fn max_nonce(&self, signer: &PublicKey) -> StoreResult<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status != RequestStatus::Failed)
            .filter_map(|r| r.posted.filter(|p| p.signer == *signer).map(|p| p.nonce))
            .max())
    }

    async fn list_unnotified(&self, now: u64, limit: usize) -> StoreResult<Vec<SendRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| r.status.is_terminal() && !r.notify.notified)
            .filter(|r| r.notify.next_attempt.map_or(true, |t| t <= now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_notification(&self, key: &RequestKey, notify: NotifyState) -> StoreResult<()> {
        self.mutate(|state| {
            state.request_mut(key)?.notify = notify;
            Ok(((), true))
        })
        .await
    }

    async fn insert_deposit(&self, deposit: &Deposit) -> StoreResult<()> {
        self.mutate(|state| {
            if !state.deposit_keys.insert(deposit.key()) {
                return Err(StoreError::Duplicate);
            }
            state.deposits.push(deposit.clone());
            Ok(((), true))
        })
        .await
    }

    async fn list_deposits(&self, service: &str, wallet: &PublicKey) -> StoreResult<Vec<Deposit>> {
        let state = self.state.lock().await;
        Ok(state
            .deposits
            .iter()
            .filter(|d| d.service == service && d.wallet == *wallet)
            .cloned()
            .collect())
    }

    async fn add_subscription(&self, service: &str, wallet: &PublicKey) -> StoreResult<bool> {
        self.mutate(|state| {
            if state.subscriptions.iter().any(|(s, w)| s == service && w == wallet) {
                return Ok((false, false));
            }
            state.subscriptions.push((service.to_string(), *wallet));
            Ok((true, true))
        })
        .await
    }

    async fn remove_subscription(&self, service: &str, wallet: &PublicKey) -> StoreResult<bool> {
        self.mutate(|state| {
            let before = state.subscriptions.len();
            state.subscriptions.retain(|(s, w)| !(s == service && w == wallet));
            let removed = state.subscriptions.len() != before;
            Ok((removed, removed))
        })
        .await
    }

    async fn list_subscriptions(&self) -> StoreResult<Vec<(String, PublicKey)>> {
        Ok(self.state.lock().await.subscriptions.clone())
    }

    async fn cursor(&self, name: &str) -> StoreResult<Option<BlockId>> {
        Ok(self.state.lock().await.cursors.get(name).copied())
    }

    async fn set_cursor(&self, name: &str, block_id: BlockId) -> StoreResult<()> {
        self.mutate(|state| {
            state.cursors.insert(name.to_string(), block_id);
            Ok(((), true))
        })
        .await
    }
}
