//! In-memory session registry.
//!
//! A session groups the latest result of each tab for one patient visit.
//! Sessions expire after a period without access and the registry holds at
//! most a configured number of them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::workflows::Tab;

/// Snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub results: BTreeMap<Tab, Value>,
    pub files: BTreeMap<Tab, Vec<PathBuf>>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_accessed: now,
            results: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_accessed > timeout
    }

    fn into_files(self) -> impl Iterator<Item = PathBuf> {
        self.files.into_values().flatten()
    }
}

/// Delete uploads that no live session refers to any more
async fn remove_files(paths: impl IntoIterator<Item = PathBuf>) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove upload {:?}: {}", path, e);
        }
    }
}

/// Shared handle to the session map
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    timeout: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            timeout: i64::try_from(config.timeout_minutes)
                .ok()
                .and_then(Duration::try_minutes)
                .unwrap_or(Duration::MAX),
            max_sessions: config.max_sessions.max(1),
        }
    }

    /// Remove and return every session that has outlived the timeout
    fn take_expired(
        &self,
        sessions: &mut HashMap<Uuid, Session>,
        now: DateTime<Utc>,
    ) -> Vec<Session> {
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.is_expired(now, self.timeout))
            .map(|s| s.id)
            .collect();
        expired.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Start a new session, evicting expired or least recently used ones
    /// when the registry is full. Files of evicted sessions are deleted.
    pub async fn create(&self) -> Session {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let mut evicted = Vec::new();
        if sessions.len() >= self.max_sessions {
            evicted = self.take_expired(&mut sessions, now);
        }
        while sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.last_accessed)
                .map(|s| s.id);
            match oldest.and_then(|id| sessions.remove(&id)) {
                Some(session) => {
                    debug!("Evicting session {} to make room", session.id);
                    evicted.push(session);
                }
                None => break,
            }
        }

        let session = Session::new(now);
        sessions.insert(session.id, session.clone());
        drop(sessions);
        info!("Session created: {}", session.id);

        remove_files(evicted.into_iter().flat_map(Session::into_files)).await;
        session
    }

    /// Fetch a live session, refreshing its last access time
    pub async fn get(&self, id: Uuid) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let expired = sessions.get(&id)?.is_expired(now, self.timeout);
        if expired {
            debug!("Session {} expired", id);
            let stale = sessions.remove(&id);
            drop(sessions);
            remove_files(stale.into_iter().flat_map(Session::into_files)).await;
            return None;
        }

        let session = sessions.get_mut(&id)?;
        session.last_accessed = now;
        Some(session.clone())
    }

    /// Reuse the given session if it is live, otherwise start a new one
    pub async fn resolve(&self, id: Option<Uuid>) -> Uuid {
        if let Some(id) = id {
            if self.get(id).await.is_some() {
                return id;
            }
            debug!("Unknown session {}, starting a new one", id);
        }
        self.create().await.id
    }

    /// Store the latest result of `tab`. Returns false if the session is gone.
    pub async fn record_result(&self, id: Uuid, tab: Tab, result: Value) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) => {
                session.results.insert(tab, result);
                session.last_accessed = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remember which files were uploaded for `tab`, deleting the files of
    /// the run they replace
    pub async fn record_files(&self, id: Uuid, tab: Tab, paths: Vec<PathBuf>) -> bool {
        let mut sessions = self.sessions.write().await;
        let replaced = match sessions.get_mut(&id) {
            Some(session) => session.files.insert(tab, paths),
            None => return false,
        };
        drop(sessions);
        remove_files(replaced.into_iter().flatten()).await;
        true
    }

    /// Drop every expired session and its files, returning how many
    /// sessions were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let expired = self.take_expired(&mut sessions, now);
        drop(sessions);

        let count = expired.len();
        remove_files(expired.into_iter().flat_map(Session::into_files)).await;
        count
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    #[cfg(test)]
    async fn backdate(&self, id: Uuid, by: Duration) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.last_accessed = session.last_accessed - by;
        }
    }
}
