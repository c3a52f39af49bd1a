//! Revision identifiers and the in-memory revision model

use crate::attachments::SavedAttachment;
use crate::error::{Error, Result};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A revision identifier of the form `N-H`: a positive generation and a
/// 16-byte hex digest derived from the revision's content.
///
/// Ordering is generation first, then lexicographic on the digest; this is
/// exactly the tie-break order used when picking a winning revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Identifier for a root revision (generation 1)
    pub fn root(deleted: bool, attachments: &[(String, Vec<u8>)], body: &[u8]) -> Self {
        Self {
            generation: 1,
            digest: content_digest(None, deleted, attachments, body),
        }
    }

    /// Identifier for a child of `parent`
    pub fn child_of(
        parent: &RevisionId,
        deleted: bool,
        attachments: &[(String, Vec<u8>)],
        body: &[u8],
    ) -> Self {
        Self {
            generation: parent.generation + 1,
            digest: content_digest(Some(parent), deleted, attachments, body),
        }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (gen_part, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevisionId(s.to_string()))?;
        let generation: u64 = gen_part
            .parse()
            .map_err(|_| Error::InvalidRevisionId(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(Error::InvalidRevisionId(s.to_string()));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

/// Digest over the canonical revision material: parent id (or empty), the
/// deleted flag, attachment keys sorted by filename, and the body bytes.
/// Reproducible across peers so that idempotent pulls converge on identical
/// revision ids.
fn content_digest(
    parent: Option<&RevisionId>,
    deleted: bool,
    attachments: &[(String, Vec<u8>)],
    body: &[u8],
) -> String {
    let mut hasher = Sha1::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([0u8]);
    hasher.update([deleted as u8]);

    let mut sorted: Vec<&(String, Vec<u8>)> = attachments.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, key) in sorted {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(key);
        hasher.update([0u8]);
    }

    hasher.update(body);
    hex::encode(&hasher.finalize()[..16])
}

/// A single revision of a document as stored
#[derive(Debug, Clone)]
pub struct DocumentRevision {
    pub id: String,
    pub rev: RevisionId,
    /// Raw JSON bytes; empty when the body has been compacted away
    pub body: Vec<u8>,
    pub deleted: bool,
    pub sequence: i64,
    pub parent: Option<i64>,
    pub current: bool,
    pub attachments: BTreeMap<String, SavedAttachment>,
}

impl DocumentRevision {
    /// Parse the body bytes as JSON. Tombstones and compacted revisions
    /// yield an empty object.
    pub fn body_json(&self) -> Result<Value> {
        if self.body.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Attachment keys in the digest-input form, sorted by name
    pub fn attachment_keys(&self) -> Vec<(String, Vec<u8>)> {
        self.attachments
            .iter()
            .map(|(name, att)| (name.clone(), att.key.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let rev: RevisionId = "3-deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(rev.to_string(), "3-deadbeefdeadbeefdeadbeefdeadbeef");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("nodash".parse::<RevisionId>().is_err());
        assert!("0-abc".parse::<RevisionId>().is_err());
        assert!("x-abc".parse::<RevisionId>().is_err());
        assert!("2-".parse::<RevisionId>().is_err());
    }

    #[test]
    fn test_ordering_prefers_generation_then_digest() {
        let a: RevisionId = "2-aaa".parse().unwrap();
        let b: RevisionId = "2-bbb".parse().unwrap();
        let c: RevisionId = "10-000".parse().unwrap();
        assert!(b > a);
        // generation 10 beats generation 2 even though "10" < "2" as strings
        assert!(c > b);
    }

    #[test]
    fn test_digest_is_reproducible() {
        let atts = vec![("a.txt".to_string(), vec![1u8; 20])];
        let first = RevisionId::root(false, &atts, b"{\"a\":1}");
        let second = RevisionId::root(false, &atts, b"{\"a\":1}");
        assert_eq!(first, second);
        assert_eq!(first.generation(), 1);
        assert_eq!(first.digest().len(), 32);
    }

    #[test]
    fn test_digest_varies_with_inputs() {
        let base = RevisionId::root(false, &[], b"{}");
        assert_ne!(base, RevisionId::root(true, &[], b"{}"));
        assert_ne!(base, RevisionId::root(false, &[], b"{\"x\":1}"));
        assert_ne!(
            base,
            RevisionId::root(false, &[("a".to_string(), vec![0u8; 20])], b"{}")
        );
        let child = RevisionId::child_of(&base, false, &[], b"{}");
        assert_eq!(child.generation(), 2);
        assert_ne!(child.digest(), base.digest());
    }

    #[test]
    fn test_attachment_order_does_not_matter() {
        let ab = vec![
            ("a".to_string(), vec![1u8; 20]),
            ("b".to_string(), vec![2u8; 20]),
        ];
        let ba = vec![
            ("b".to_string(), vec![2u8; 20]),
            ("a".to_string(), vec![1u8; 20]),
        ];
        assert_eq!(
            RevisionId::root(false, &ab, b"{}"),
            RevisionId::root(false, &ba, b"{}")
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_parse(generation in 1u64..10_000, digest in "[0-9a-f]{32}") {
            let formatted = format!("{}-{}", generation, digest);
            let parsed: RevisionId = formatted.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), formatted);
        }

        #[test]
        fn prop_ordering_matches_tuple_order(
            g1 in 1u64..100, g2 in 1u64..100,
            d1 in "[0-9a-f]{8}", d2 in "[0-9a-f]{8}",
        ) {
            let a = RevisionId { generation: g1, digest: d1.clone() };
            let b = RevisionId { generation: g2, digest: d2.clone() };
            prop_assert_eq!(a.cmp(&b), (g1, d1).cmp(&(g2, d2)));
        }
    }
}
