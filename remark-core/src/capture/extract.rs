//! Extraction capability
//!
//! The watcher is independent of any concrete document technology: it only
//! sees [`Node`] snapshots and asks an [`Extractor`] whether a node is a
//! comment unit and what field values it carries. Extraction gaps are not
//! errors; missing fields come back as empty strings.

use crate::types::Fragment;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A node snapshot lifted out of a view log line.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    /// Document-assigned node identifier (may be empty)
    #[serde(default)]
    pub node_id: String,
    /// Node shape discriminator (e.g. "comment")
    #[serde(default)]
    pub kind: String,
    /// Free-form per-kind payload
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Field values extracted from one comment node.
#[derive(Debug, Clone, Default)]
pub struct EventFields {
    pub external_id: Option<String>,
    pub text: String,
    pub actor_name: String,
    /// Raw profile locator; the watcher normalizes it into the actor key
    pub actor_profile: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source_locator: String,
    pub context_id: String,
    pub context_author: String,
    pub context_body: Vec<Fragment>,
}

/// Maps document nodes to comment event fields.
pub trait Extractor: Send + Sync {
    /// Does this node have the shape of one comment unit?
    fn matches(&self, node: &Node) -> bool;

    /// Extract field values. Infallible: anything the node does not carry
    /// comes back empty.
    fn extract(&self, node: &Node) -> EventFields;
}

/// Default extractor for comment nodes as written by document views.
///
/// Expected payload shape (all fields optional):
///
/// ```json
/// {"node_id": "urn:comment:42", "kind": "comment", "fields": {
///     "text": "...", "author_name": "...", "author_profile": "...",
///     "occurred_at": "2025-06-01T12:00:00Z", "source_url": "...",
///     "context_id": "...", "context_author": "...",
///     "context_body": [{"type": "text", "data": "..."}]}}
/// ```
pub struct CommentExtractor;

impl CommentExtractor {
    fn text_field(fields: &serde_json::Value, key: &str) -> String {
        fields
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

impl Extractor for CommentExtractor {
    fn matches(&self, node: &Node) -> bool {
        node.kind == "comment"
    }

    fn extract(&self, node: &Node) -> EventFields {
        let f = &node.fields;

        let occurred_at = f
            .get("occurred_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let context_body = f
            .get("context_body")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<Fragment>>(v).ok())
            .unwrap_or_default();

        EventFields {
            external_id: (!node.node_id.is_empty()).then(|| node.node_id.clone()),
            text: Self::text_field(f, "text"),
            actor_name: Self::text_field(f, "author_name"),
            actor_profile: Self::text_field(f, "author_profile"),
            occurred_at,
            source_locator: Self::text_field(f, "source_url"),
            context_id: Self::text_field(f, "context_id"),
            context_author: Self::text_field(f, "context_author"),
            context_body,
        }
    }
}
