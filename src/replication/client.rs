//! HTTP client for a remote CouchDB-shaped database
//!
//! A thin wrapper over reqwest owning the database base URL. 429 Too Many
//! Requests responses are replayed here with exponential backoff (honouring
//! Retry-After when configured), so callers never see them until the replay
//! budget is spent.

use crate::config::{ReplicationConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::replication::wire::{
    BulkGetRequest, BulkGetResponse, ChangesResult, DocumentRevs, MissingRevisions,
};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Cap applied to server-sent Retry-After values
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60 * 60);

/// How a pull selects changes from the remote feed
#[derive(Debug, Clone)]
pub enum ChangesSelection {
    /// The whole feed
    All,
    /// A named server-side filter function with its parameters
    Filter {
        name: String,
        params: BTreeMap<String, String>,
    },
    /// A Mango selector evaluated by the server
    Selector(Value),
    /// An explicit document id list
    DocIds(Vec<String>),
}

/// One attachment payload accompanying a multipart document upload.
/// Parts go on the wire in the order given, which must match the order of
/// the document's `_attachments` keys.
#[derive(Debug, Clone)]
pub struct MultipartAttachment {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Client for one remote database
#[derive(Debug, Clone)]
pub struct CouchClient {
    http: Client,
    base: Url,
    retry: RetryConfig,
}

impl CouchClient {
    pub fn new(base: Url, replication: &ReplicationConfig, retry: RetryConfig) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid database URL: {}", base)));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(replication.request_timeout_secs))
            .gzip(true)
            .build()?;
        Ok(Self { http, base, retry })
    }

    /// The remote's identity, as used in replication ids
    pub fn identifier(&self) -> String {
        self.base.to_string()
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Invalid database URL: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Does the remote database exist?
    pub async fn exists(&self) -> Result<bool> {
        let response = self.execute(self.http.get(self.base.clone())).await?;
        Ok(response.status().is_success())
    }

    /// Read one page of the change feed
    pub async fn changes(
        &self,
        selection: &ChangesSelection,
        since: Option<&Value>,
        limit: usize,
    ) -> Result<ChangesResult> {
        let mut url = self.url(&["_changes"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("style", "all_docs");
            query.append_pair("limit", &limit.to_string());
            if let Some(since) = since {
                query.append_pair("since", &seq_param(since));
            }
            match selection {
                ChangesSelection::All => {}
                ChangesSelection::Filter { name, params } => {
                    query.append_pair("filter", name);
                    for (key, value) in params {
                        query.append_pair(key, value);
                    }
                }
                ChangesSelection::Selector(_) => {
                    query.append_pair("filter", "_selector");
                }
                ChangesSelection::DocIds(_) => {
                    query.append_pair("filter", "_doc_ids");
                }
            }
        }

        let request = match selection {
            ChangesSelection::Selector(selector) => self
                .http
                .post(url)
                .json(&json!({ "selector": selector })),
            ChangesSelection::DocIds(ids) => {
                self.http.post(url).json(&json!({ "doc_ids": ids }))
            }
            _ => self.http.get(url),
        };

        let response = self.expect_success(request, "_changes").await?;
        Ok(response.json().await?)
    }

    /// Ask the remote which of our revisions it is missing
    pub async fn revs_diff(
        &self,
        revisions: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, MissingRevisions>> {
        let request = self.http.post(self.url(&["_revs_diff"])?).json(revisions);
        let response = self.expect_success(request, "_revs_diff").await?;
        Ok(response.json().await?)
    }

    /// Probe `_bulk_get` support; unsupported servers answer 4xx
    pub async fn supports_bulk_get(&self) -> Result<bool> {
        let request = self
            .http
            .post(self.url(&["_bulk_get"])?)
            .json(&json!({ "docs": [] }));
        let response = self.execute(request).await?;
        let supported = response.status().is_success();
        debug!("_bulk_get supported: {}", supported);
        Ok(supported)
    }

    /// Fetch many revision bundles in one request
    pub async fn bulk_get(
        &self,
        requests: &[BulkGetRequest],
        attachments: bool,
    ) -> Result<Vec<DocumentRevs>> {
        let mut url = self.url(&["_bulk_get"])?;
        url.query_pairs_mut()
            .append_pair("revs", "true")
            .append_pair("latest", "true")
            .append_pair("attachments", if attachments { "true" } else { "false" });
        let request = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&json!({ "docs": requests }));
        let response = self.expect_success(request, "_bulk_get").await?;
        let parsed: BulkGetResponse = response.json().await?;
        Ok(parsed.revisions())
    }

    /// Fetch the open revisions of one document
    pub async fn open_revs(
        &self,
        id: &str,
        revs: &[String],
        atts_since: &[String],
        attachments: bool,
    ) -> Result<Vec<DocumentRevs>> {
        let mut url = self.url(&[id])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("open_revs", &serde_json::to_string(revs)?);
            query.append_pair("revs", "true");
            query.append_pair("latest", "true");
            query.append_pair("attachments", if attachments { "true" } else { "false" });
            if !atts_since.is_empty() {
                query.append_pair("atts_since", &serde_json::to_string(atts_since)?);
            }
        }
        let request = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json");
        let response = self.expect_success(request, "open_revs").await?;

        // the array entries are {"ok": {...}} or {"missing": "rev"}
        let entries: Vec<Value> = response.json().await?;
        let mut bundles = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(ok) = entry.get("ok") {
                bundles.push(serde_json::from_value(ok.clone())?);
            } else if let Some(missing) = entry.get("missing") {
                warn!("Remote is missing revision {} of {}", missing, id);
            }
        }
        Ok(bundles)
    }

    /// Fetch one attachment payload (decoded form)
    pub async fn get_attachment(&self, id: &str, rev: &str, name: &str) -> Result<Vec<u8>> {
        let mut url = self.url(&[id, name])?;
        url.query_pairs_mut().append_pair("rev", rev);
        let response = self.execute(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::AttachmentNotFound(format!("{}/{}", id, name)));
        }
        let response = check_status(response, "attachment fetch")?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Upload one revision with its attachment payloads as a
    /// `multipart/related` PUT, preserving its rev id.
    ///
    /// The document JSON is the first part; each attachment follows as its
    /// own part in `_attachments` key order, with the metadata carrying
    /// `follows: true` instead of inline data.
    pub async fn put_multipart(
        &self,
        id: &str,
        doc: &Value,
        attachments: &[MultipartAttachment],
    ) -> Result<()> {
        let mut url = self.url(&[id])?;
        url.query_pairs_mut().append_pair("new_edits", "false");

        let boundary = Uuid::new_v4().simple().to_string();
        let mut body = Vec::new();
        body.extend_from_slice(
            format!("--{}\r\nContent-Type: application/json\r\n\r\n", boundary).as_bytes(),
        );
        body.extend_from_slice(&serde_json::to_vec(doc)?);
        for attachment in attachments {
            body.extend_from_slice(
                format!(
                    "\r\n--{}\r\nContent-Type: {}\r\n\r\n",
                    boundary, attachment.content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(&attachment.data);
        }
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let request = self
            .http
            .put(url)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary=\"{}\"", boundary),
            )
            .body(body);
        self.expect_success(request, "multipart put").await?;
        Ok(())
    }

    /// Upload revisions verbatim, preserving their rev ids
    pub async fn bulk_docs_new_edits_false(&self, docs: &[Value]) -> Result<()> {
        let request = self
            .http
            .post(self.url(&["_bulk_docs"])?)
            .json(&json!({ "docs": docs, "new_edits": false }));
        self.expect_success(request, "_bulk_docs").await?;
        Ok(())
    }

    async fn expect_success(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.execute(request).await?;
        check_status(response, what)
    }

    /// Send a request, replaying 429 responses per the retry policy
    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            let cloned = request
                .try_clone()
                .ok_or_else(|| Error::Replication("request body is not replayable".to_string()))?;
            let response = cloned.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS
                || attempt >= self.retry.number_of_replays
            {
                return Ok(response);
            }
            let delay = self.backoff(attempt, &response);
            warn!(
                "429 Too Many Requests from {}, replaying in {:?} (attempt {})",
                self.base,
                delay,
                attempt + 1
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32, response: &Response) -> Duration {
        let mut delay = self
            .retry
            .initial_backoff()
            .saturating_mul(2u32.saturating_pow(attempt));
        if self.retry.prefer_retry_after {
            if let Some(header) = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
            {
                match header.parse::<u64>() {
                    Ok(seconds) => {
                        delay = Duration::from_secs(seconds);
                        if delay > RETRY_AFTER_CAP {
                            warn!("Retry-After exceeds one hour, capping");
                            delay = RETRY_AFTER_CAP;
                        }
                    }
                    Err(_) => {
                        warn!("Invalid Retry-After value, falling back to local backoff");
                    }
                }
            }
        }
        delay
    }
}

fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(Error::RemoteNotFound(format!("{} returned 404", what)))
    } else {
        Err(Error::Replication(format!("{} failed: HTTP {}", what, status)))
    }
}

/// CouchDB sequences are opaque: integers on classic servers, strings on
/// clustered ones. Strings go on the wire raw, everything else as JSON.
fn seq_param(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
