//! Pull and push replication between a local store and a remote CouchDB
//!
//! Both strategies share the same external contract: a cooperative `run`,
//! a cancellation flag that may be set before or during the run, progress
//! counters, and an event bus that posts exactly one terminal event.
//! Checkpoints live in the local store as `_local/<replication-id>`
//! documents, so an interrupted replication resumes from its last fully
//! committed batch.

pub mod client;
pub mod pull;
pub mod push;
pub mod wire;

use crate::error::Result;
use crate::events::{EventBus, ReplicationEvent};
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use client::{ChangesSelection, CouchClient, MultipartAttachment};
pub use pull::PullStrategy;
pub use push::PushStrategy;

/// Common capability set of pull and push
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// Run the replication to completion, cancellation, or error. Always
    /// posts a terminal event on [`Self::event_bus`]; never panics or
    /// returns an error directly.
    async fn run(&self);

    /// Request cooperative cancellation. Valid before `run()`: the run then
    /// terminates immediately with zeroed counters.
    fn set_cancel(&self);

    fn event_bus(&self) -> &EventBus<ReplicationEvent>;

    fn document_counter(&self) -> usize;

    fn batch_counter(&self) -> usize;

    fn is_terminated(&self) -> bool;
}

/// Shared mutable state of a strategy run
#[derive(Debug, Default)]
pub(crate) struct StrategyState {
    pub cancel: AtomicBool,
    pub terminated: AtomicBool,
    pub documents: AtomicUsize,
    pub batches: AtomicUsize,
}

impl StrategyState {
    pub fn canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.documents.store(0, Ordering::SeqCst);
        self.batches.store(0, Ordering::SeqCst);
    }
}

/// Deterministic identity of a replication: the SHA-1 of the canonical JSON
/// of its source, target and selection. Names the checkpoint document, so
/// the same replication resumes and a different one starts fresh.
pub(crate) fn replication_id(
    source: &str,
    target: &str,
    selection: &ChangesSelection,
) -> Result<String> {
    // BTreeMap keeps key order canonical
    let mut dict: BTreeMap<&str, String> = BTreeMap::new();
    dict.insert("source", source.to_string());
    dict.insert("target", target.to_string());
    match selection {
        ChangesSelection::All => {}
        ChangesSelection::Filter { name, params } => {
            let mut filter = name.clone();
            for (key, value) in params {
                filter.push_str(&format!("&{}={}", key, value));
            }
            dict.insert("filter", filter);
        }
        ChangesSelection::Selector(selector) => {
            dict.insert("selector", serde_json::to_string(selector)?);
        }
        ChangesSelection::DocIds(ids) => {
            dict.insert("docIds", ids.join(","));
        }
    }
    let mut hasher = Sha1::new();
    hasher.update(serde_json::to_vec(&dict)?);
    Ok(hex::encode(hasher.finalize()))
}

const CHECKPOINT_BODY_KEY: &str = "lastSequence";

fn checkpoint_docid(replication_id: &str) -> String {
    format!("_local/{}", replication_id)
}

/// The remote sequence recorded at the last committed batch, if any
pub(crate) async fn read_checkpoint(
    store: &DocumentStore,
    replication_id: &str,
) -> Result<Option<Value>> {
    match store.get_local(&checkpoint_docid(replication_id)).await {
        Ok(local) => {
            let body: Value = serde_json::from_slice(&local.body)?;
            Ok(body.get(CHECKPOINT_BODY_KEY).cloned())
        }
        Err(crate::error::Error::DocumentNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Record a checkpoint; written only after everything it covers committed
pub(crate) async fn write_checkpoint(
    store: &DocumentStore,
    replication_id: &str,
    last_seq: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(&json!({ CHECKPOINT_BODY_KEY: last_seq }))?;
    store.put_local(&checkpoint_docid(replication_id), &body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_id_is_deterministic() {
        let a = replication_id("http://remote/db", "/tmp/store", &ChangesSelection::All).unwrap();
        let b = replication_id("http://remote/db", "/tmp/store", &ChangesSelection::All).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_replication_id_varies_with_endpoints_and_selection() {
        let base =
            replication_id("http://remote/db", "/tmp/store", &ChangesSelection::All).unwrap();
        assert_ne!(
            base,
            replication_id("http://other/db", "/tmp/store", &ChangesSelection::All).unwrap()
        );
        assert_ne!(
            base,
            replication_id(
                "http://remote/db",
                "/tmp/store",
                &ChangesSelection::DocIds(vec!["a".to_string()])
            )
            .unwrap()
        );
        assert_ne!(
            base,
            replication_id(
                "http://remote/db",
                "/tmp/store",
                &ChangesSelection::Selector(serde_json::json!({"kind": "fish"}))
            )
            .unwrap()
        );
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("store")).await.unwrap();

        assert!(read_checkpoint(&store, "abc").await.unwrap().is_none());
        write_checkpoint(&store, "abc", &serde_json::json!("5-xyz"))
            .await
            .unwrap();
        assert_eq!(
            read_checkpoint(&store, "abc").await.unwrap(),
            Some(serde_json::json!("5-xyz"))
        );

        // a different replication id has its own checkpoint
        assert!(read_checkpoint(&store, "def").await.unwrap().is_none());
    }
}
