//! Push replication: local changes out to a remote database
//!
//! The mirror image of pull: read the local change log since the
//! checkpoint, ask the remote which of those revisions it is missing via
//! `_revs_diff`, upload the missing ones with their full ancestry — a
//! `multipart/related` PUT per revision carrying attachments, a single
//! `_bulk_docs?new_edits=false` for the rest — then advance the checkpoint
//! to the local sequence the batch covered.

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, ReplicationEvent};
use crate::replication::client::{ChangesSelection, CouchClient, MultipartAttachment};
use crate::replication::{
    read_checkpoint, replication_id, write_checkpoint, ReplicationStrategy, StrategyState,
};
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Pushes a local store to a remote database
pub struct PushStrategy {
    source: Arc<DocumentStore>,
    target: CouchClient,
    config: ReplicationConfig,
    state: StrategyState,
    events: EventBus<ReplicationEvent>,
}

impl PushStrategy {
    pub fn new(
        source: Arc<DocumentStore>,
        target: CouchClient,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
            state: StrategyState::default(),
            events: EventBus::new(),
        }
    }

    /// Identity of this replication, naming its checkpoint document
    pub fn replication_id(&self) -> Result<String> {
        replication_id(
            &self.source.path().to_string_lossy(),
            &self.target.identifier(),
            &ChangesSelection::All,
        )
    }

    async fn replicate(&self) -> Result<()> {
        info!("Push replication started to {}", self.target.identifier());

        if !self.target.exists().await? {
            return Err(Error::RemoteNotFound(self.target.identifier()));
        }
        let replication_id = self.replication_id()?;

        while !self.state.canceled() {
            let batch = self.state.batches.fetch_add(1, Ordering::SeqCst) + 1;
            let checkpoint = read_checkpoint(&self.source, &replication_id).await?;
            let since = checkpoint.as_ref().and_then(Value::as_i64).unwrap_or(0);
            debug!("Batch {} starting from local sequence {}", batch, since);

            let page = self
                .source
                .changes(since, self.config.change_limit_per_batch)
                .await?;
            info!("Batch {} contains {} changes", batch, page.results.len());

            if !page.results.is_empty() {
                let pushed = self.push_changes_batch(&page.results).await?;
                self.state.documents.fetch_add(pushed, Ordering::SeqCst);

                if !self.state.canceled() && page.last_seq != since {
                    if let Err(e) =
                        write_checkpoint(&self.source, &replication_id, &json!(page.last_seq))
                            .await
                    {
                        warn!("Failed to write checkpoint: {}", e);
                    }
                }
            }

            if page.results.len() < self.config.change_limit_per_batch {
                break;
            }
        }

        info!(
            "Push finished ({} documents over {} batches)",
            self.state.documents.load(Ordering::SeqCst),
            self.state.batches.load(Ordering::SeqCst),
        );
        Ok(())
    }

    async fn push_changes_batch(
        &self,
        changes: &[crate::store::revision::DocumentRevision],
    ) -> Result<usize> {
        let mut revisions: HashMap<String, Vec<String>> = HashMap::new();
        for revision in changes {
            revisions
                .entry(revision.id.clone())
                .or_default()
                .push(revision.rev.to_string());
        }

        let missing = self.target.revs_diff(&revisions).await?;
        if missing.is_empty() {
            return Ok(0);
        }

        let wanted: Vec<(String, Vec<String>)> = missing
            .into_iter()
            .map(|(id, entry)| (id, entry.missing))
            .collect();

        let mut pushed = 0;
        for sub_batch in wanted.chunks(self.config.insert_batch_size) {
            if self.state.canceled() {
                break;
            }
            let mut docs = Vec::new();
            for (id, revs) in sub_batch {
                for rev in revs {
                    let (doc, attachments) = self.push_document(id, rev).await?;
                    if attachments.is_empty() {
                        docs.push(doc);
                    } else {
                        // revisions carrying attachments go up one at a
                        // time as multipart/related
                        debug!(
                            "Uploading {} at {} with {} attachments as multipart",
                            id,
                            rev,
                            attachments.len()
                        );
                        self.target.put_multipart(id, &doc, &attachments).await?;
                        pushed += 1;
                    }
                }
            }
            if !docs.is_empty() {
                debug!("Uploading {} revisions", docs.len());
                self.target.bulk_docs_new_edits_false(&docs).await?;
                pushed += docs.len();
            }
        }
        Ok(pushed)
    }

    /// Build the upload form of one local revision: body plus `_id`,
    /// `_rev`, `_deleted` and its full `_revisions` ancestry. Attachment
    /// payloads are returned separately; their metadata carries
    /// `follows: true` and the parts list matches `_attachments` key order.
    async fn push_document(
        &self,
        id: &str,
        rev: &str,
    ) -> Result<(Value, Vec<MultipartAttachment>)> {
        let revision = self.source.get_revision(id, rev).await?;
        let mut doc = match revision.body_json()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        doc.insert("_id".to_string(), json!(id));
        doc.insert("_rev".to_string(), json!(rev));
        if revision.deleted {
            doc.insert("_deleted".to_string(), json!(true));
        }

        let history = self.source.revision_history(id, rev).await?;
        let ids: Vec<&str> = history
            .iter()
            .rev()
            .map(|r| r.split_once('-').map(|(_, digest)| digest).unwrap_or(r))
            .collect();
        doc.insert(
            "_revisions".to_string(),
            json!({ "start": revision.rev.generation(), "ids": ids }),
        );

        let mut payloads = Vec::new();
        if !revision.attachments.is_empty() {
            let mut attachments = Map::new();
            for (name, attachment) in &revision.attachments {
                let data = self.source.blobs().read_decoded(attachment)?;
                attachments.insert(
                    name.clone(),
                    json!({
                        "follows": true,
                        "content_type": attachment.content_type,
                        "revpos": attachment.revpos,
                        "length": data.len(),
                    }),
                );
                payloads.push(MultipartAttachment {
                    name: name.clone(),
                    content_type: attachment.content_type.clone(),
                    data,
                });
            }
            doc.insert("_attachments".to_string(), Value::Object(attachments));
        }
        Ok((Value::Object(doc), payloads))
    }
}

#[async_trait]
impl ReplicationStrategy for PushStrategy {
    async fn run(&self) {
        if self.state.canceled() {
            self.state.reset_counters();
            self.state.terminated.store(true, Ordering::SeqCst);
            self.events.post(ReplicationEvent::Completed {
                canceled: true,
                documents: 0,
                batches: 0,
            });
            return;
        }

        let outcome = self.replicate().await;
        self.state.terminated.store(true, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                let canceled = self.state.canceled();
                info!(
                    "Push replication terminated via {}",
                    if canceled { "cancel" } else { "completion" }
                );
                self.events.post(ReplicationEvent::Completed {
                    canceled,
                    documents: self.document_counter(),
                    batches: self.batch_counter(),
                });
            }
            Err(e) => {
                error!(
                    "Batch {} ended with error: {}",
                    self.state.batches.load(Ordering::SeqCst),
                    e
                );
                self.events.post(ReplicationEvent::Errored {
                    error: e.to_string(),
                });
            }
        }
    }

    fn set_cancel(&self) {
        self.state.cancel.store(true, Ordering::SeqCst);
    }

    fn event_bus(&self) -> &EventBus<ReplicationEvent> {
        &self.events
    }

    fn document_counter(&self) -> usize {
        self.state.documents.load(Ordering::SeqCst)
    }

    fn batch_counter(&self) -> usize {
        self.state.batches.load(Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    async fn source() -> (tempfile::TempDir, Arc<DocumentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("store")).await.unwrap();
        (dir, Arc::new(store))
    }

    fn push(server: &MockServer, store: Arc<DocumentStore>) -> PushStrategy {
        let config = Config::default();
        let base = Url::parse(&format!("{}/db", server.uri())).unwrap();
        let client = CouchClient::new(base, &config.replication, config.retry).unwrap();
        PushStrategy::new(store, client, config.replication)
    }

    async fn mock_db_root(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/db"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"db_name": "db"})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_push_uploads_missing_revisions_with_ancestry() {
        let server = MockServer::start().await;
        let (_dir, store) = source().await;
        let first = store
            .create_document(Some("doc1"), br#"{"n":1}"#, Vec::new())
            .await
            .unwrap();
        let second = store
            .update_document("doc1", &first.rev.to_string(), br#"{"n":2}"#, Vec::new())
            .await
            .unwrap();

        mock_db_root(&server).await;
        let missing_rev = second.rev.to_string();
        Mock::given(method("POST"))
            .and(path("/db/_revs_diff"))
            .respond_with(move |_req: &Request| {
                ResponseTemplate::new(200)
                    .set_body_json(json!({"doc1": {"missing": [missing_rev]}}))
            })
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/db/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = push(&server, store.clone());
        let mut events = strategy.event_bus().subscribe();
        strategy.run().await;

        match events.recv().await.unwrap() {
            ReplicationEvent::Completed {
                canceled,
                documents,
                ..
            } => {
                assert!(!canceled);
                assert_eq!(documents, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the upload carried new_edits=false and the full ancestry
        let requests = server.received_requests().await.unwrap();
        let upload = requests
            .iter()
            .find(|r| r.url.path().ends_with("_bulk_docs"))
            .unwrap();
        let body: Value = serde_json::from_slice(&upload.body).unwrap();
        assert_eq!(body["new_edits"], json!(false));
        let doc = &body["docs"][0];
        assert_eq!(doc["_id"], json!("doc1"));
        assert_eq!(doc["_rev"], json!(second.rev.to_string()));
        assert_eq!(doc["_revisions"]["start"], json!(2));
        assert_eq!(
            doc["_revisions"]["ids"],
            json!([second.rev.digest(), first.rev.digest()])
        );

        // the checkpoint advanced to the local last sequence
        let rid = strategy.replication_id().unwrap();
        let checkpoint = read_checkpoint(&store, &rid).await.unwrap();
        assert_eq!(checkpoint, Some(json!(second.sequence)));
    }

    #[tokio::test]
    async fn test_push_skips_revisions_remote_already_has() {
        let server = MockServer::start().await;
        let (_dir, store) = source().await;
        store
            .create_document(Some("doc1"), br#"{"n":1}"#, Vec::new())
            .await
            .unwrap();

        mock_db_root(&server).await;
        Mock::given(method("POST"))
            .and(path("/db/_revs_diff"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/db/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let strategy = push(&server, store.clone());
        strategy.run().await;
        assert_eq!(strategy.document_counter(), 0);
        assert!(strategy.is_terminated());
    }

    #[tokio::test]
    async fn test_push_uploads_attachments_as_multipart() {
        let server = MockServer::start().await;
        let (_dir, store) = source().await;
        let attachment = crate::attachments::UnsavedAttachment {
            name: "a.txt".to_string(),
            data: b"push me".to_vec(),
            content_type: "text/plain".to_string(),
        };
        let created = store
            .create_document(Some("doc1"), br#"{"n":1}"#, vec![attachment])
            .await
            .unwrap();

        mock_db_root(&server).await;
        let missing_rev = created.rev.to_string();
        Mock::given(method("POST"))
            .and(path("/db/_revs_diff"))
            .respond_with(move |_req: &Request| {
                ResponseTemplate::new(200)
                    .set_body_json(json!({"doc1": {"missing": [missing_rev]}}))
            })
            .mount(&server)
            .await;
        // the revision carries an attachment, so it must arrive as a
        // multipart/related PUT, not through _bulk_docs
        Mock::given(method("PUT"))
            .and(path("/db/doc1"))
            .and(query_param("new_edits", "false"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/db/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let strategy = push(&server, store.clone());
        strategy.run().await;
        assert_eq!(strategy.document_counter(), 1);

        let requests = server.received_requests().await.unwrap();
        let upload = requests
            .iter()
            .find(|r| r.url.path() == "/db/doc1")
            .unwrap();
        let content_type = upload
            .headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/related; boundary="));

        let body = String::from_utf8_lossy(&upload.body);
        // json part: follows stub with metadata, then the raw payload part
        assert!(body.contains("\"follows\":true"));
        assert!(body.contains("\"content_type\":\"text/plain\""));
        assert!(body.contains("\"revpos\":1"));
        assert!(!body.contains("\"data\":"));
        let json_at = body.find("_attachments").unwrap();
        let blob_at = body.find("push me").unwrap();
        assert!(json_at < blob_at);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let server = MockServer::start().await;
        let (_dir, store) = source().await;
        let strategy = push(&server, store);
        strategy.set_cancel();
        let mut events = strategy.event_bus().subscribe();
        strategy.run().await;
        assert!(strategy.is_terminated());
        assert!(matches!(
            events.recv().await.unwrap(),
            ReplicationEvent::Completed { canceled: true, .. }
        ));
    }
}
