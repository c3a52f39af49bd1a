//! Custom error types for satchel

use thiserror::Error;

/// Main error type for document store operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Revision not found: {0} at {1}")]
    RevisionNotFound(String, String),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("Attachment could not be saved: {0}")]
    AttachmentNotSaved(String),

    #[error("Store corruption: {0}")]
    Corruption(String),

    #[error("Invalid revision id: {0}")]
    InvalidRevisionId(String),

    #[error("Invalid document body: {0}")]
    InvalidBody(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Remote database not found: {0}")]
    RemoteNotFound(String),

    #[error("Replication canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Store is closed")]
    Closed,
}

/// Result type alias for satchel
pub type Result<T> = std::result::Result<T, Error>;
