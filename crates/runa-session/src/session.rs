// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use runa_model::Message;

use crate::jobs::BackgroundJob;

/// The conversation session: ordered append-only message history plus the
/// per-session state tools act on — which files were read and modified,
/// which domains and command prefixes the user authorized, and the running
/// background jobs.
///
/// All state sits behind one reader-preference lock; methods take `&self`
/// so the session can be shared across concurrently executing tool calls.
pub struct Session {
    pub id: String,
    root: PathBuf,
    inner: RwLock<SessionState>,
    next_job_id: AtomicU64,
}

#[derive(Default)]
struct SessionState {
    messages: Vec<Arc<Message>>,
    files_read: HashMap<PathBuf, String>,
    files_modified: HashSet<PathBuf>,
    authorized_domains: HashSet<String>,
    authorized_prefixes: Vec<String>,
    authorized_actions: HashSet<String>,
    jobs: HashMap<u64, Arc<BackgroundJob>>,
}

/// Messages-only persistence form; jobs, read-sets and authorizations are
/// transient by design.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    id: String,
    messages: Vec<Message>,
}

impl Session {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            root: root.into(),
            inner: RwLock::new(SessionState::default()),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// Root directory all relative tool paths resolve against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Append a message and return its shared handle.
    pub fn push(&self, msg: Message) -> Arc<Message> {
        let arc = Arc::new(msg);
        self.write().messages.push(Arc::clone(&arc));
        arc
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    /// Cheap snapshot of the current history (shared handles, no copies).
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.read().messages.clone()
    }

    /// Replace `original_prefix` with a single system-role summary message.
    ///
    /// Succeeds only when every element of `original_prefix` is still the
    /// same `Arc` at the head of the live message list.  Any
    /// interleaved mutation (another compaction winning the race, a replaced
    /// history) makes this a no-op returning `false`.  This gate is what
    /// makes concurrent compaction attempts safe without a coordination lock.
    pub fn compact_with_summary(&self, original_prefix: &[Arc<Message>], summary: &str) -> bool {
        if original_prefix.is_empty() {
            return false;
        }
        let mut st = self.write();
        if st.messages.len() < original_prefix.len() {
            return false;
        }
        let matches = original_prefix
            .iter()
            .zip(st.messages.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b));
        if !matches {
            warn!("compaction prefix no longer matches session head; skipping");
            return false;
        }
        let tail = st.messages.split_off(original_prefix.len());
        st.messages = Vec::with_capacity(tail.len() + 1);
        st.messages.push(Arc::new(Message::system(format!(
            "[Earlier conversation compacted]\n{summary}"
        ))));
        st.messages.extend(tail);
        debug!(
            replaced = original_prefix.len(),
            "session head replaced by summary"
        );
        true
    }

    // ── Read / write tracking ─────────────────────────────────────────────────

    pub fn track_file_read(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.write().files_read.insert(path.into(), content.into());
    }

    pub fn track_file_modified(&self, path: impl Into<PathBuf>) {
        self.write().files_modified.insert(path.into());
    }

    pub fn was_read(&self, path: &Path) -> bool {
        self.read().files_read.contains_key(path)
    }

    /// Last content observed for a read path.
    pub fn read_content(&self, path: &Path) -> Option<String> {
        self.read().files_read.get(path).cloned()
    }

    pub fn modified_paths(&self) -> Vec<PathBuf> {
        let mut v: Vec<PathBuf> = self.read().files_modified.iter().cloned().collect();
        v.sort();
        v
    }

    // ── Authorization state ───────────────────────────────────────────────────

    /// Record an authorized domain.  Accepts exact names and `*.suffix`
    /// wildcards.
    pub fn authorize_domain(&self, domain: impl Into<String>) {
        self.write()
            .authorized_domains
            .insert(domain.into().to_ascii_lowercase());
    }

    pub fn domain_authorized(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let st = self.read();
        if st.authorized_domains.contains(&domain) {
            return true;
        }
        st.authorized_domains.iter().any(|entry| {
            entry
                .strip_prefix("*.")
                .is_some_and(|suffix| domain == suffix || domain.ends_with(&format!(".{suffix}")))
        })
    }

    /// Record an authorized command prefix, preserving insertion order.
    pub fn authorize_command_prefix(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        let mut st = self.write();
        if !st.authorized_prefixes.iter().any(|p| *p == prefix) {
            st.authorized_prefixes.push(prefix);
        }
    }

    pub fn command_authorized(&self, command: &str) -> bool {
        let command = command.trim_start();
        self.read()
            .authorized_prefixes
            .iter()
            .any(|p| command.starts_with(p.as_str()))
    }

    pub fn authorized_prefixes(&self) -> Vec<String> {
        self.read().authorized_prefixes.clone()
    }

    /// Record an approved action kind ("file_mutation", "sandbox_exec").
    pub fn authorize_action(&self, kind: impl Into<String>) {
        self.write().authorized_actions.insert(kind.into());
    }

    pub fn action_authorized(&self, kind: &str) -> bool {
        self.read().authorized_actions.contains(kind)
    }

    // ── Background jobs ───────────────────────────────────────────────────────

    pub fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_job(&self, job: Arc<BackgroundJob>) {
        self.write().jobs.insert(job.id, job);
    }

    pub fn job(&self, id: u64) -> Option<Arc<BackgroundJob>> {
        self.read().jobs.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<Arc<BackgroundJob>> {
        let mut v: Vec<Arc<BackgroundJob>> = self.read().jobs.values().cloned().collect();
        v.sort_by_key(|j| j.id);
        v
    }

    /// Drop all per-session state.  Running jobs are killed.
    pub fn clear(&self) {
        let jobs: Vec<Arc<BackgroundJob>> = {
            let mut st = self.write();
            st.messages.clear();
            st.files_read.clear();
            st.files_modified.clear();
            st.authorized_domains.clear();
            st.authorized_prefixes.clear();
            st.authorized_actions.clear();
            st.jobs.drain().map(|(_, j)| j).collect()
        };
        for job in jobs {
            job.kill();
        }
    }

    // ── Path resolution ───────────────────────────────────────────────────────

    /// Resolve `path` against the session root and verify containment.
    ///
    /// Rejects any path that, after lexical normalization, escapes the root
    /// (absolute paths outside the root, `..` traversal).
    pub fn resolve_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize_lexically(&joined);
        if !normalized.starts_with(&self.root) {
            anyhow::bail!(
                "path {} resolves outside the session root {}",
                path,
                self.root.display()
            );
        }
        Ok(normalized)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Messages-only JSON transcript.
    pub fn to_json(&self) -> anyhow::Result<String> {
        let st = self.read();
        let persisted = PersistedSession {
            id: self.id.clone(),
            messages: st.messages.iter().map(|m| (**m).clone()).collect(),
        };
        Ok(serde_json::to_string_pretty(&persisted)?)
    }

    /// Rebuild a session (messages only) from a saved transcript.
    pub fn from_json(root: impl Into<PathBuf>, json: &str) -> anyhow::Result<Self> {
        let persisted: PersistedSession = serde_json::from_str(json)?;
        let session = Self::new(root);
        {
            let mut st = session.write();
            st.messages = persisted.messages.into_iter().map(Arc::new).collect();
        }
        Ok(Self {
            id: persisted.id,
            ..session
        })
    }
}

/// Normalize `.` and `..` components without touching the filesystem, so
/// containment can be checked for paths that do not exist yet.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
