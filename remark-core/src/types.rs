//! Core domain types for remark
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Comment** | One user-authored comment detected in an observed document |
//! | **Actor** | The authenticated user whose comments we capture |
//! | **Actor key** | Normalized, stable profile path identifying an actor |
//! | **Context** | The enclosing content unit (post) a comment was left on |
//! | **Outbox** | The durable queue of comments awaiting collector delivery |
//!
//! A comment is captured once, persisted `synced = false`, delivered
//! at-least-once, flipped to `synced = true`, and finally swept. The
//! collector performs its own dedup keyed on [`CommentEvent::event_key`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================
// Content fragments
// ============================================

/// One typed piece of the enclosing post's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Fragment {
    Text(String),
    Image(String),
    Video(String),
}

// ============================================
// Comment events
// ============================================

/// A captured comment event, immutable once created.
///
/// Field contents come from the pluggable extractor; any of them may be
/// empty when the document did not expose the value. Emptiness is a gap,
/// not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    /// Externally supplied stable identifier, when the document carries one.
    /// Takes precedence over the composite dedup key.
    pub external_id: Option<String>,
    /// The comment body as authored
    pub text: String,
    /// Display name of the comment's author
    pub actor_name: String,
    /// Normalized profile path of the comment's author
    pub actor_key: String,
    /// When the comment was authored
    pub occurred_at: DateTime<Utc>,
    /// Where the comment occurred (e.g. a page URL)
    pub source_locator: String,
    /// Identifier of the enclosing content unit
    pub context_id: String,
    /// Author of the enclosing content unit
    pub context_author: String,
    /// Ordered body of the enclosing content unit
    pub context_body: Vec<Fragment>,
}

impl CommentEvent {
    /// Stable identifier sent to the collector for server-side dedup.
    ///
    /// The external id wins when present; otherwise a SHA-256 over the
    /// composite identity of the event.
    pub fn event_key(&self) -> String {
        if let Some(id) = &self.external_id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(self.actor_key.as_bytes());
        hasher.update(b"|");
        hasher.update(self.occurred_at.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A comment event as held by the store, with outbox bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredComment {
    /// Store-assigned id, unique and stable for the record's lifetime
    pub local_id: i64,
    /// false→true exactly once, never reverses
    pub synced: bool,
    /// Failed delivery attempts so far (persisted so backoff survives restarts)
    pub retry_count: i64,
    /// The captured event
    pub event: CommentEvent,
}

// ============================================
// Actor identity
// ============================================

/// The resolved identity of the acting user.
///
/// An empty identity means "unknown", not an error; callers must treat it
/// as unresolved and expect a later re-poll to fill it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub name: String,
    pub key: String,
}

impl ActorIdentity {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// True when neither field carries a usable value.
    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty() && self.key.trim().is_empty()
    }
}

/// Normalize a profile locator into a stable actor key.
///
/// Strips the scheme and host from absolute URLs and any trailing slash,
/// so `https://example.com/in/jane/` and `/in/jane` compare equal.
pub fn normalize_actor_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        },
        None => trimmed,
    };
    path.trim_end_matches('/').to_string()
}

/// Admission equality: do these two identities denote the same actor?
///
/// Keys are compared exactly after normalization when both are present;
/// otherwise names compare case-insensitively. Two identities without any
/// common non-empty field never match.
pub fn same_actor(a: &ActorIdentity, b: &ActorIdentity) -> bool {
    let ak = normalize_actor_key(&a.key);
    let bk = normalize_actor_key(&b.key);
    if !ak.is_empty() && !bk.is_empty() {
        return ak == bk;
    }
    let an = a.name.trim();
    let bn = b.name.trim();
    if an.is_empty() || bn.is_empty() {
        return false;
    }
    an.eq_ignore_ascii_case(bn)
}

/// Cache-update guard: should `fresh` overwrite `cached`?
///
/// Mirrors [`same_actor`] but treats an empty side as "different" so an
/// empty cache always accepts the first resolved identity.
pub fn differs_from_cached(cached: &ActorIdentity, fresh: &ActorIdentity) -> bool {
    if cached.is_empty() || fresh.is_empty() {
        return true;
    }
    !same_actor(cached, fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(text: &str, external_id: Option<&str>) -> CommentEvent {
        CommentEvent {
            external_id: external_id.map(String::from),
            text: text.to_string(),
            actor_name: "Jane Doe".to_string(),
            actor_key: "/in/jane".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            source_locator: "https://example.com/feed".to_string(),
            context_id: "urn:post:1".to_string(),
            context_author: "Bob".to_string(),
            context_body: vec![Fragment::Text("hello".to_string())],
        }
    }

    #[test]
    fn test_normalize_actor_key() {
        assert_eq!(normalize_actor_key("https://example.com/in/jane/"), "/in/jane");
        assert_eq!(normalize_actor_key("http://example.com/in/jane"), "/in/jane");
        assert_eq!(normalize_actor_key("/in/jane/"), "/in/jane");
        assert_eq!(normalize_actor_key("  /in/jane  "), "/in/jane");
        assert_eq!(normalize_actor_key("https://example.com"), "");
        assert_eq!(normalize_actor_key(""), "");
    }

    #[test]
    fn test_same_actor_prefers_keys() {
        let a = ActorIdentity::new("Jane", "https://example.com/in/jane/");
        let b = ActorIdentity::new("Someone Else", "/in/jane");
        assert!(same_actor(&a, &b));

        let c = ActorIdentity::new("Jane", "/in/notjane");
        assert!(!same_actor(&a, &c));
    }

    #[test]
    fn test_same_actor_name_fallback() {
        let a = ActorIdentity::new("Jane Doe", "");
        let b = ActorIdentity::new("jane doe", "");
        assert!(same_actor(&a, &b));

        // One-sided key falls back to names too
        let c = ActorIdentity::new("Jane Doe", "/in/jane");
        assert!(same_actor(&a, &c));

        let empty = ActorIdentity::default();
        assert!(!same_actor(&a, &empty));
        assert!(!same_actor(&empty, &empty));
    }

    #[test]
    fn test_differs_from_cached() {
        let cached = ActorIdentity::new("Jane", "/in/jane");
        assert!(!differs_from_cached(&cached, &cached.clone()));
        assert!(differs_from_cached(&cached, &ActorIdentity::new("Jane", "/in/other")));
        // Empty cache always accepts
        assert!(differs_from_cached(&ActorIdentity::default(), &cached));
    }

    #[test]
    fn test_event_key_external_id_wins() {
        let e = event("hello", Some("urn:comment:42"));
        assert_eq!(e.event_key(), "urn:comment:42");
    }

    #[test]
    fn test_event_key_hash_is_stable() {
        let a = event("hello", None);
        let b = event("hello", None);
        assert_eq!(a.event_key(), b.event_key());
        assert_eq!(a.event_key().len(), 64);

        let c = event("different text", None);
        assert_ne!(a.event_key(), c.event_key());
    }

    #[test]
    fn test_fragment_serde_shape() {
        let frag = Fragment::Image("https://cdn.example.com/a.png".to_string());
        let json = serde_json::to_value(&frag).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data"], "https://cdn.example.com/a.png");
    }
}
