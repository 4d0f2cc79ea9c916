//! Capture layer: turns document mutations into admitted comment events
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌────────────┐
//! │  View logs   │ ──► │ EventWatcher │ ──► │   Store    │
//! │ (*.jsonl)    │     │              │     │  (outbox)  │
//! └──────────────┘     └──────────────┘     └────────────┘
//!                            │
//!                            ▼
//!                    ┌──────────────┐
//!                    │  Extractor   │
//!                    └──────────────┘
//! ```
//!
//! Each open document view appends node snapshots to its own view log (one
//! subtree per log). The watcher attaches to every discovered log, reads
//! past a per-log byte checkpoint, and runs matched nodes through the
//! admission pipeline: extract → identity check → dedup → persist.

pub mod extract;

pub use extract::{CommentExtractor, EventFields, Extractor, Node};

use crate::error::{Error, Result};
use crate::identity::IdentityResolver;
use crate::store::Store;
use crate::types::{normalize_actor_key, same_actor, ActorIdentity, CommentEvent};
use chrono::Utc;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Counters for one capture pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    /// Comment nodes seen
    pub nodes_seen: usize,
    /// Candidates admitted into the outbox
    pub admitted: usize,
    /// Candidates rejected as duplicates of stored records
    pub duplicates: usize,
    /// Candidates rejected by the identity admission rule
    pub rejected: usize,
    /// Admitted candidates with one or more empty extracted fields
    pub gaps: usize,
}

impl CaptureStats {
    fn merge(&mut self, other: CaptureStats) {
        self.nodes_seen += other.nodes_seen;
        self.admitted += other.admitted;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.gaps += other.gaps;
    }
}

/// Watches view-log subtrees and admits comment events into the outbox.
pub struct EventWatcher {
    store: Arc<Store>,
    resolver: Arc<IdentityResolver>,
    extractor: Arc<dyn Extractor>,
    roots: Vec<PathBuf>,
    /// Per-subtree byte checkpoint. Presence in the map means "attached".
    tails: Mutex<HashMap<PathBuf, u64>>,
    captured: Arc<Notify>,
}

impl EventWatcher {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<IdentityResolver>,
        extractor: Arc<dyn Extractor>,
        roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            store,
            resolver,
            extractor,
            roots,
            tails: Mutex::new(HashMap::new()),
            captured: Arc::new(Notify::new()),
        }
    }

    /// Signal fired once per admitted event; the delivery engine wakes on it.
    pub fn captured_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.captured)
    }

    /// Attach to one view-log subtree. Idempotent: attaching twice to the
    /// same subtree is a no-op and returns false.
    pub fn attach(&self, path: &Path) -> bool {
        let mut tails = self.tails.lock().unwrap();
        if tails.contains_key(path) {
            return false;
        }
        tails.insert(path.to_path_buf(), 0);
        tracing::debug!(path = %path.display(), "Attached view log");
        true
    }

    /// Outer discovery pass: scan the roots for view logs that appeared
    /// after setup and attach to them. Returns how many were new.
    pub fn rescan(&self) -> Result<usize> {
        let mut attached = 0;
        for root in &self.roots {
            let pattern = root.join("*.jsonl");
            let paths = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::Config(format!("bad watch root {:?}: {}", root, e)))?;
            for entry in paths {
                match entry {
                    Ok(path) => {
                        if self.attach(&path) {
                            attached += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable view log during rescan");
                    }
                }
            }
        }
        if attached > 0 {
            tracing::info!(attached, "Discovered new view logs");
        }
        Ok(attached)
    }

    /// Poll every attached subtree for newly appeared nodes.
    pub fn poll_all(&self) -> Result<CaptureStats> {
        let paths: Vec<PathBuf> = self.tails.lock().unwrap().keys().cloned().collect();
        let mut stats = CaptureStats::default();
        for path in paths {
            stats.merge(self.poll_subtree(&path)?);
        }
        Ok(stats)
    }

    /// Poll one subtree: read complete lines past the checkpoint and run
    /// each node through the admission pipeline.
    ///
    /// A vanished or unreadable log is logged and skipped without retry;
    /// the document state has already moved on. Store failures propagate.
    pub fn poll_subtree(&self, path: &Path) -> Result<CaptureStats> {
        let mut stats = CaptureStats::default();

        let offset = match self.tails.lock().unwrap().get(path) {
            Some(offset) => *offset,
            None => return Ok(stats), // not attached
        };

        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "View log vanished, skipping");
                return Ok(stats);
            }
        };

        let len = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot stat view log, skipping");
                return Ok(stats);
            }
        };

        // A shrunken log was rewritten; start over from the top. The store
        // dedup makes re-reading safe.
        let offset = if len < offset { 0 } else { offset };
        if len == offset {
            return Ok(stats);
        }

        let mut buf = String::new();
        let read = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_to_string(&mut buf));
        if let Err(e) = read {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read view log, skipping");
            return Ok(stats);
        }

        // Consume only complete lines; a trailing partial line waits for
        // the writer to finish it.
        let consumed = buf.rfind('\n').map(|i| i + 1).unwrap_or(0);
        for line in buf[..consumed].lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Node>(line) {
                Ok(node) => self.process_node(&node, path, &mut stats)?,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed node line");
                }
            }
        }

        self.tails
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), offset + consumed as u64);

        Ok(stats)
    }

    fn process_node(&self, node: &Node, origin: &Path, stats: &mut CaptureStats) -> Result<()> {
        if !self.extractor.matches(node) {
            return Ok(());
        }
        stats.nodes_seen += 1;

        let fields = self.extractor.extract(node);
        let has_gap = fields.text.is_empty()
            || fields.actor_name.is_empty()
            || fields.actor_profile.is_empty();

        let candidate = ActorIdentity {
            name: fields.actor_name.clone(),
            key: normalize_actor_key(&fields.actor_profile),
        };

        // Only capture events authored by this process's own actor
        let resolved = self.resolver.resolve()?;
        if resolved.is_empty() || !same_actor(&candidate, &resolved) {
            stats.rejected += 1;
            tracing::debug!(
                node_id = %node.node_id,
                candidate = %candidate.key,
                "Comment not authored by resolved actor, ignoring"
            );
            return Ok(());
        }

        let event = CommentEvent {
            external_id: fields.external_id,
            text: fields.text,
            actor_name: fields.actor_name,
            actor_key: candidate.key,
            occurred_at: fields.occurred_at.unwrap_or_else(Utc::now),
            source_locator: fields.source_locator,
            context_id: fields.context_id,
            context_author: fields.context_author,
            context_body: fields.context_body,
        };

        match self.store.admit(&event)? {
            Some(local_id) => {
                stats.admitted += 1;
                if has_gap {
                    stats.gaps += 1;
                }
                tracing::info!(
                    local_id,
                    origin = %origin.display(),
                    "Comment captured"
                );
                self.captured.notify_one();
            }
            None => {
                stats.duplicates += 1;
                tracing::debug!(node_id = %node.node_id, "Duplicate comment, not admitted");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use std::io::Write;

    fn setup(dir: &Path) -> EventWatcher {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();

        let config = IdentityConfig {
            name: Some("Jane".to_string()),
            profile_url: Some("https://example.com/in/jane".to_string()),
            ..Default::default()
        };
        let resolver = Arc::new(IdentityResolver::with_default_probes(
            Arc::clone(&store),
            &config,
            &[],
        ));

        EventWatcher::new(
            store,
            resolver,
            Arc::new(CommentExtractor),
            vec![dir.to_path_buf()],
        )
    }

    fn comment_line(id: &str, text: &str, profile: &str) -> String {
        format!(
            r#"{{"node_id": "{}", "kind": "comment", "fields": {{"text": "{}", "author_name": "Jane", "author_profile": "{}", "occurred_at": "2025-06-01T12:00:00Z"}}}}"#,
            id, text, profile
        )
    }

    #[test]
    fn test_attach_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("view.jsonl");

        assert!(watcher.attach(&log));
        assert!(!watcher.attach(&log));
    }

    #[test]
    fn test_rescan_discovers_new_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());

        std::fs::write(dir.path().join("a.jsonl"), "").unwrap();
        assert_eq!(watcher.rescan().unwrap(), 1);

        // A subtree appearing after initial setup is picked up too
        std::fs::write(dir.path().join("b.jsonl"), "").unwrap();
        assert_eq!(watcher.rescan().unwrap(), 1);

        // And rescanning is idempotent
        assert_eq!(watcher.rescan().unwrap(), 0);
    }

    #[test]
    fn test_poll_admits_own_comments_only() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("view.jsonl");

        let mut f = std::fs::File::create(&log).unwrap();
        writeln!(f, "{}", comment_line("c1", "mine", "https://example.com/in/jane")).unwrap();
        writeln!(f, "{}", comment_line("c2", "theirs", "https://example.com/in/bob")).unwrap();
        drop(f);

        watcher.rescan().unwrap();
        let stats = watcher.poll_all().unwrap();

        assert_eq!(stats.nodes_seen, 2);
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.rejected, 1);

        let pending = watcher.store.list_unsynced().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.text, "mine");
    }

    #[test]
    fn test_poll_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("view.jsonl");

        std::fs::write(
            &log,
            format!("{}\n", comment_line("c1", "one", "/in/jane")),
        )
        .unwrap();
        watcher.rescan().unwrap();
        assert_eq!(watcher.poll_all().unwrap().admitted, 1);

        // Append a second comment; the first must not be re-read
        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "{}", comment_line("c2", "two", "/in/jane")).unwrap();
        drop(f);

        let stats = watcher.poll_all().unwrap();
        assert_eq!(stats.nodes_seen, 1);
        assert_eq!(stats.admitted, 1);
        assert_eq!(watcher.store.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_reread_after_restart_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("view.jsonl");

        std::fs::write(
            &log,
            format!("{}\n", comment_line("c1", "one", "/in/jane")),
        )
        .unwrap();
        watcher.rescan().unwrap();
        assert_eq!(watcher.poll_all().unwrap().admitted, 1);

        // A fresh watcher over the same store re-reads from offset 0;
        // the store-level dedup keeps the outbox clean.
        let watcher2 = EventWatcher::new(
            Arc::clone(&watcher.store),
            Arc::clone(&watcher.resolver),
            Arc::new(CommentExtractor),
            vec![dir.path().to_path_buf()],
        );
        watcher2.rescan().unwrap();
        let stats = watcher2.poll_all().unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(watcher.store.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_vanished_log_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("gone.jsonl");

        watcher.attach(&log);
        let stats = watcher.poll_all().unwrap();
        assert_eq!(stats.nodes_seen, 0);
    }

    #[test]
    fn test_partial_trailing_line_waits() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = setup(dir.path());
        let log = dir.path().join("view.jsonl");

        // No trailing newline: the writer is mid-append
        std::fs::write(&log, comment_line("c1", "partial", "/in/jane")).unwrap();
        watcher.rescan().unwrap();
        assert_eq!(watcher.poll_all().unwrap().nodes_seen, 0);

        // Writer finishes the line
        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f).unwrap();
        drop(f);
        assert_eq!(watcher.poll_all().unwrap().admitted, 1);
    }

    #[test]
    fn test_unresolved_identity_admits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        let resolver = Arc::new(IdentityResolver::with_default_probes(
            Arc::clone(&store),
            &IdentityConfig::default(),
            &[],
        ));
        let watcher = EventWatcher::new(
            Arc::clone(&store),
            resolver,
            Arc::new(CommentExtractor),
            vec![dir.path().to_path_buf()],
        );

        let log = dir.path().join("view.jsonl");
        std::fs::write(
            &log,
            format!("{}\n", comment_line("c1", "one", "/in/jane")),
        )
        .unwrap();
        watcher.rescan().unwrap();

        let stats = watcher.poll_all().unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(store.pending_count().unwrap(), 0);
    }
}
