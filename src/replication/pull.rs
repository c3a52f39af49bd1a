//! Pull replication: remote changes into the local store
//!
//! Each batch reads the checkpoint, fetches a page of `_changes`, diffs the
//! listed revisions against the local store, fetches the missing revision
//! bundles in sub-batches (via `_bulk_get` when the server supports it,
//! bounded parallel `open_revs` fetches otherwise), force-inserts them, and
//! finally advances the checkpoint. Cancellation is checked between batches,
//! sub-batches and per-revision work.

use crate::attachments::Encoding;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, ReplicationEvent};
use crate::replication::client::{ChangesSelection, CouchClient};
use crate::replication::wire::{AttachmentMeta, BulkGetRequest, ChangesResult, DocumentRevs};
use crate::replication::{
    read_checkpoint, replication_id, write_checkpoint, ReplicationStrategy, StrategyState,
};
use crate::store::{DocumentStore, ForceInsertAttachment, ForceInsertItem};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Bound on parallel `open_revs` fetches when `_bulk_get` is unavailable
const OPEN_REVS_CONCURRENCY: usize = 4;

/// Cap on possible-ancestor rev ids sent as `atts_since`
const MAX_POSSIBLE_ANCESTORS: usize = 50;

/// Pulls a remote database into a local store
pub struct PullStrategy {
    source: CouchClient,
    target: Arc<DocumentStore>,
    selection: ChangesSelection,
    config: ReplicationConfig,
    state: StrategyState,
    events: EventBus<ReplicationEvent>,
}

impl PullStrategy {
    pub fn new(
        source: CouchClient,
        target: Arc<DocumentStore>,
        selection: ChangesSelection,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            source,
            target,
            selection,
            config,
            state: StrategyState::default(),
            events: EventBus::new(),
        }
    }

    /// Identity of this replication, naming its checkpoint document
    pub fn replication_id(&self) -> Result<String> {
        replication_id(
            &self.source.identifier(),
            &self.target.path().to_string_lossy(),
            &self.selection,
        )
    }

    async fn replicate(&self, use_bulk_get: bool) -> Result<()> {
        info!("Pull replication started from {}", self.source.identifier());

        if !self.source.exists().await? {
            return Err(Error::RemoteNotFound(self.source.identifier()));
        }
        let replication_id = self.replication_id()?;

        while !self.state.canceled() {
            let batch = self.state.batches.fetch_add(1, Ordering::SeqCst) + 1;
            let checkpoint = read_checkpoint(&self.target, &replication_id).await?;
            debug!("Batch {} starting from checkpoint {:?}", batch, checkpoint);

            let changes = self
                .source
                .changes(
                    &self.selection,
                    checkpoint.as_ref(),
                    self.config.change_limit_per_batch,
                )
                .await?;
            info!(
                "Batch {} contains {} changes (remote last_seq {})",
                batch,
                changes.results.len(),
                changes.last_seq
            );

            if !changes.results.is_empty() {
                let processed = self.process_changes_batch(&changes, use_bulk_get).await?;
                self.state.documents.fetch_add(processed, Ordering::SeqCst);
                info!("Batch {} completed ({} changes processed)", batch, processed);
            }

            if !self.state.canceled() && checkpoint.as_ref() != Some(&changes.last_seq) {
                if let Err(e) =
                    write_checkpoint(&self.target, &replication_id, &changes.last_seq).await
                {
                    // next run resumes from the previous checkpoint
                    warn!("Failed to write checkpoint: {}", e);
                }
            }

            if changes.results.len() < self.config.change_limit_per_batch {
                break;
            }
        }

        info!(
            "Pull finished ({} changes over {} batches)",
            self.state.documents.load(Ordering::SeqCst),
            self.state.batches.load(Ordering::SeqCst),
        );
        Ok(())
    }

    async fn process_changes_batch(
        &self,
        changes: &ChangesResult,
        use_bulk_get: bool,
    ) -> Result<usize> {
        let open_revisions = changes.open_revisions();
        let missing = self.target.revs_diff(&open_revisions).await?;
        let ids: Vec<&String> = missing.keys().collect();

        let mut processed = 0;
        for sub_batch in ids.chunks(self.config.insert_batch_size) {
            if self.state.canceled() {
                break;
            }
            processed += self.process_sub_batch(sub_batch, &missing, use_bulk_get).await?;
        }
        Ok(processed)
    }

    async fn process_sub_batch(
        &self,
        ids: &[&String],
        missing: &HashMap<String, Vec<String>>,
        use_bulk_get: bool,
    ) -> Result<usize> {
        let inline = self.config.pull_attachments_inline;

        // atts_since lets the server stub attachments we already hold; it is
        // fine to list ancestors from sibling subtrees.
        let mut atts_since: HashMap<&str, Vec<String>> = HashMap::new();
        for id in ids {
            let mut ancestors = Vec::new();
            for rev in &missing[*id] {
                for ancestor in self
                    .target
                    .possible_ancestors(id, rev, MAX_POSSIBLE_ANCESTORS)
                    .await?
                {
                    if !ancestors.contains(&ancestor) {
                        ancestors.push(ancestor);
                    }
                }
            }
            atts_since.insert(id.as_str(), ancestors);
        }

        let bundles: Vec<DocumentRevs> = if use_bulk_get {
            let requests: Vec<BulkGetRequest> = ids
                .iter()
                .flat_map(|id| {
                    let docid = (*id).clone();
                    let since = atts_since[id.as_str()].clone();
                    missing[*id].iter().map(move |rev| BulkGetRequest {
                        id: docid.clone(),
                        rev: rev.clone(),
                        atts_since: since.clone(),
                    })
                })
                .collect();
            self.source.bulk_get(&requests, inline).await?
        } else {
            let fetches: Vec<_> = ids
                .iter()
                .map(|id| {
                    let source = &self.source;
                    let revs = &missing[*id];
                    let since = &atts_since[id.as_str()];
                    async move { source.open_revs(id, revs, since, inline).await }
                })
                .collect();
            let results: Vec<Result<Vec<DocumentRevs>>> = stream::iter(fetches)
                .buffer_unordered(OPEN_REVS_CONCURRENCY)
                .collect()
                .await;
            let mut bundles = Vec::new();
            for result in results {
                bundles.extend(result?);
            }
            bundles
        };

        let mut items = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            if self.state.canceled() {
                break;
            }
            items.push(self.build_force_insert_item(bundle).await?);
        }
        let count = items.len();
        self.target.force_insert(items).await?;
        Ok(count)
    }

    /// Turn a remote revision bundle into a force-insert item, downloading
    /// streamed attachment payloads as needed.
    async fn build_force_insert_item(&self, bundle: DocumentRevs) -> Result<ForceInsertItem> {
        let inline = self.config.pull_attachments_inline;
        let mut attachments = Vec::new();

        for (name, meta) in &bundle.attachments {
            let meta: AttachmentMeta = serde_json::from_value(meta.clone())?;
            if self.already_have_attachment(&bundle, name, &meta).await? {
                continue;
            }
            if inline {
                // stubs are attachments the server knows we hold already
                if meta.stub {
                    continue;
                }
                let data_base64 = meta.data.clone().ok_or_else(|| {
                    Error::Replication(format!(
                        "inline attachment {} of {} has no data",
                        name, bundle.id
                    ))
                })?;
                attachments.push(ForceInsertAttachment::Inline {
                    name: name.clone(),
                    data_base64,
                    content_type: meta.content_type.clone().unwrap_or_default(),
                    encoding: Encoding::parse(meta.encoding.as_deref()),
                    length: meta.length,
                    revpos: meta.revpos,
                });
            } else {
                let data = self
                    .source
                    .get_attachment(&bundle.id, &bundle.rev, name)
                    .await?;
                // the server decodes on the way out, so store as plain
                let prepared = self.target.blobs().prepare(
                    name,
                    &data,
                    meta.content_type.as_deref().unwrap_or_default(),
                    Encoding::Plain,
                    None,
                )?;
                attachments.push(ForceInsertAttachment::Prepared {
                    attachment: prepared,
                    revpos: meta.revpos,
                });
            }
        }

        Ok(ForceInsertItem {
            id: bundle.id.clone(),
            rev: bundle.rev.clone(),
            body: bundle.body_bytes(),
            deleted: bundle.deleted,
            history: bundle.history(),
            attachments,
        })
    }

    /// Skip an attachment whose `revpos` names an ancestor revision we
    /// already hold with that attachment: same name at the same position
    /// means the same content.
    async fn already_have_attachment(
        &self,
        bundle: &DocumentRevs,
        name: &str,
        meta: &AttachmentMeta,
    ) -> Result<bool> {
        let Some(revpos) = meta.revpos else {
            return Ok(false);
        };
        let Some(revisions) = &bundle.revisions else {
            return Ok(false);
        };
        let offset = revisions.start as i64 - revpos;
        if offset < 0 || offset as usize >= revisions.ids.len() {
            return Ok(false);
        }
        let ancestor = format!("{}-{}", revpos, revisions.ids[offset as usize]);
        match self
            .target
            .get_attachment(&bundle.id, Some(&ancestor), name)
            .await
        {
            Ok(_) => {
                debug!(
                    "Attachment {} of {} already present at {}, skipping",
                    name, bundle.id, ancestor
                );
                Ok(true)
            }
            Err(Error::AttachmentNotFound(_)) | Err(Error::RevisionNotFound(_, _)) => Ok(false),
            Err(Error::DocumentNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ReplicationStrategy for PullStrategy {
    async fn run(&self) {
        if self.state.canceled() {
            // canceled before starting: report a clean, empty termination
            self.state.reset_counters();
            self.state.terminated.store(true, Ordering::SeqCst);
            self.events.post(ReplicationEvent::Completed {
                canceled: true,
                documents: 0,
                batches: 0,
            });
            return;
        }

        let outcome = async {
            let use_bulk_get = self.source.supports_bulk_get().await?;
            self.replicate(use_bulk_get).await
        }
        .await;

        self.state.terminated.store(true, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                let canceled = self.state.canceled();
                info!(
                    "Pull replication terminated via {}",
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
