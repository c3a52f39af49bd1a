//! Wire types for the CouchDB-shaped HTTP surface

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Response of `GET /db/_changes`
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesResult {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

/// One row of the change feed
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    #[serde(default)]
    pub seq: Value,
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

impl ChangesResult {
    /// Leaf revisions listed per document id, skipping rows with empty ids
    /// (some feeds contain them; they are unaddressable).
    pub fn open_revisions(&self) -> HashMap<String, Vec<String>> {
        let mut open = HashMap::new();
        for row in &self.results {
            if row.id.is_empty() {
                continue;
            }
            let revs: &mut Vec<String> = open.entry(row.id.clone()).or_default();
            for change in &row.changes {
                if !revs.contains(&change.rev) {
                    revs.push(change.rev.clone());
                }
            }
        }
        open
    }
}

/// Per-document entry of a `POST /db/_revs_diff` response
#[derive(Debug, Clone, Deserialize)]
pub struct MissingRevisions {
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub possible_ancestors: Vec<String>,
}

/// CouchDB `_revisions` ancestry: digest-only ids, newest first, with the
/// generation of the first entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revisions {
    pub start: u64,
    pub ids: Vec<String>,
}

/// A revision bundle from `open_revs` or `_bulk_get`
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRevs {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    #[serde(default, rename = "_deleted")]
    pub deleted: bool,
    #[serde(default, rename = "_attachments")]
    pub attachments: Map<String, Value>,
    #[serde(rename = "_revisions")]
    pub revisions: Option<Revisions>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl DocumentRevs {
    /// Full rev ids from the oldest known ancestor up to this revision.
    /// Falls back to the revision alone when the server sent no ancestry.
    pub fn history(&self) -> Vec<String> {
        match &self.revisions {
            Some(revisions) if !revisions.ids.is_empty() => revisions
                .ids
                .iter()
                .enumerate()
                .map(|(i, digest)| format!("{}-{}", revisions.start - i as u64, digest))
                .rev()
                .collect(),
            _ => vec![self.rev.clone()],
        }
    }

    /// The document body re-serialized to bytes
    pub fn body_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.body.clone())).unwrap_or_else(|_| b"{}".to_vec())
    }
}

/// Attachment metadata as found under `_attachments`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentMeta {
    #[serde(default)]
    pub stub: bool,
    pub data: Option<String>,
    pub content_type: Option<String>,
    pub encoding: Option<String>,
    pub length: Option<i64>,
    pub encoded_length: Option<i64>,
    pub revpos: Option<i64>,
}

/// One entry of a `POST /db/_bulk_get` request
#[derive(Debug, Clone, Serialize)]
pub struct BulkGetRequest {
    pub id: String,
    pub rev: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub atts_since: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkGetResponse {
    #[serde(default)]
    pub results: Vec<BulkGetResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkGetResult {
    #[serde(default)]
    pub docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkGetDoc {
    pub ok: Option<DocumentRevs>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BulkGetResponse {
    /// Every successfully returned revision bundle
    pub fn revisions(self) -> Vec<DocumentRevs> {
        self.results
            .into_iter()
            .flat_map(|result| result.docs)
            .filter_map(|doc| doc.ok)
            .collect()
    }
}
