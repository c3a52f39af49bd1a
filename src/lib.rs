//! satchel: an embedded document store with CouchDB-compatible sync
//!
//! Documents are JSON bodies with binary attachments, organized into
//! per-document revision trees that preserve concurrent edits as conflicts
//! and pick winners deterministically. Stores replicate bidirectionally
//! with any CouchDB-shaped server by exchanging revision trees over HTTP,
//! and support ad-hoc selector queries compiled onto local indexes.
//!
//! The three subsystems:
//! - [`store`]: the revision tree engine over SQLite
//! - [`replication`]: pull and push strategies with checkpoints
//! - [`query`]: index management and the selector language

pub mod attachments;
pub mod config;
pub mod error;
pub mod events;
pub mod query;
pub mod replication;
pub mod store;

pub use attachments::{
    BlobStore, Encoding, PreparedAttachment, SavedAttachment, UnsavedAttachment,
};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus, ReplicationEvent};
pub use query::{FindOptions, Index, IndexType, QueryManager, QueryResult, SortField};
pub use replication::{
    ChangesSelection, CouchClient, MultipartAttachment, PullStrategy, PushStrategy,
    ReplicationStrategy,
};
pub use store::revision::{DocumentRevision, RevisionId};
pub use store::{
    AttachmentInput, ChangesPage, DocumentStore, ForceInsertAttachment, ForceInsertItem,
    LocalDocument,
};
