//! Document identifiers and local artifact paths
//!
//! A docId is an opaque string matching `[-=_\w~%]+`. It may be a composite
//! URL-id encoding up to four fields:
//!
//! ```text
//! trunkId[~forkId[~forkUserId]][~v=snapshotId]
//! ```
//!
//! A snapshotId addresses a historical version; identifiers differing only in
//! snapshotId refer to the same underlying object. `parse_url_id` and
//! `build_url_id` round-trip canonically.
//!
//! Local artifacts for a docId live under the docs root:
//!
//! ```text
//! <root>/<docId>.grist            live SQLite file
//! <root>/<docId>.grist-hash       last confirmed content digest
//! <root>/<docId>.grist-backup-*   transient snapshot during upload
//! <root>/<docId>.grist-replacing  transient holder during replace
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Sentinel trunk id for a document that does not exist yet anywhere.
pub const NEW_DOCUMENT_CODE: &str = "new";

/// Extension of the live document file.
pub const DOC_EXT: &str = ".grist";

/// Invalid document identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid document id: {0}")]
pub struct InvalidDocId(pub String);

fn doc_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-=_a-zA-Z0-9~%]+$").expect("doc id regex"))
}

/// Checks the docId character class. Raised eagerly by any path-forming call.
pub fn validate_doc_id(doc_id: &str) -> Result<(), InvalidDocId> {
    if doc_id_regex().is_match(doc_id) {
        Ok(())
    } else {
        Err(InvalidDocId(doc_id.to_string()))
    }
}

/// Components of a composite URL-id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocIdParts {
    /// Base document, or [`NEW_DOCUMENT_CODE`] for a fork of nothing.
    pub trunk_id: String,
    /// Fork discriminator; forks are derived lazily from the trunk.
    pub fork_id: Option<String>,
    /// Owner of the fork, when fork creation is restricted to one user.
    pub fork_user_id: Option<i64>,
    /// Historical version address. Immutable view when present.
    pub snapshot_id: Option<String>,
}

impl DocIdParts {
    /// A plain docId with no fork or snapshot component.
    pub fn trunk(trunk_id: impl Into<String>) -> Self {
        Self {
            trunk_id: trunk_id.into(),
            ..Default::default()
        }
    }

    /// The same identifier with any snapshot address removed.
    pub fn without_snapshot(mut self) -> Self {
        self.snapshot_id = None;
        self
    }
}

/// Parses a composite URL-id into its components.
///
/// Segments are separated by `~`. The first segment is the trunk id. A
/// segment of the form `v=<id>` carries the snapshot id and must come last.
/// Between them, the first extra segment is the fork id and the second, if
/// present, is the numeric fork user id.
pub fn parse_url_id(url_id: &str) -> Result<DocIdParts, InvalidDocId> {
    validate_doc_id(url_id)?;

    let mut parts = DocIdParts::default();
    for (i, segment) in url_id.split('~').enumerate() {
        if segment.is_empty() {
            return Err(InvalidDocId(url_id.to_string()));
        }
        if parts.snapshot_id.is_some() {
            // Nothing may follow the snapshot segment
            return Err(InvalidDocId(url_id.to_string()));
        }
        if i == 0 {
            parts.trunk_id = segment.to_string();
        } else if let Some(snapshot) = segment.strip_prefix("v=") {
            if snapshot.is_empty() {
                return Err(InvalidDocId(url_id.to_string()));
            }
            parts.snapshot_id = Some(snapshot.to_string());
        } else if parts.fork_id.is_none() {
            parts.fork_id = Some(segment.to_string());
        } else if parts.fork_user_id.is_none() {
            let user_id = segment
                .parse::<i64>()
                .map_err(|_| InvalidDocId(url_id.to_string()))?;
            parts.fork_user_id = Some(user_id);
        } else {
            return Err(InvalidDocId(url_id.to_string()));
        }
    }
    Ok(parts)
}

/// Builds the canonical URL-id for the given components.
pub fn build_url_id(parts: &DocIdParts) -> String {
    let mut out = parts.trunk_id.clone();
    if let Some(fork_id) = &parts.fork_id {
        out.push('~');
        out.push_str(fork_id);
        if let Some(user_id) = parts.fork_user_id {
            out.push('~');
            out.push_str(&user_id.to_string());
        }
    }
    if let Some(snapshot_id) = &parts.snapshot_id {
        out.push_str("~v=");
        out.push_str(snapshot_id);
    }
    out
}

/// The docId with any snapshot address stripped: the identifier of the
/// underlying remote object.
pub fn doc_id_without_snapshot(url_id: &str) -> Result<String, InvalidDocId> {
    let parts = parse_url_id(url_id)?;
    Ok(build_url_id(&parts.without_snapshot()))
}

/// Strips any path components an id might smuggle in. Validation rejects
/// separators already; this keeps path formation safe on its own.
fn basename(doc_id: &str) -> &str {
    Path::new(doc_id)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(doc_id)
}

/// Path of the live SQLite file for a docId.
pub fn doc_path(root: &Path, doc_id: &str) -> PathBuf {
    root.join(format!("{}{}", basename(doc_id), DOC_EXT))
}

/// Path of the `-hash` sidecar holding the last confirmed digest.
pub fn hash_path(root: &Path, doc_id: &str) -> PathBuf {
    root.join(format!("{}{}-hash", basename(doc_id), DOC_EXT))
}

/// Path of a transient backup sidecar. Each concurrent backup passes its own
/// unique suffix so that no two backups of the same document collide.
pub fn backup_path(root: &Path, doc_id: &str, suffix: &str) -> PathBuf {
    root.join(format!("{}{}-backup-{}", basename(doc_id), DOC_EXT, suffix))
}

/// Path of the transient holder used during replace. If this file exists at
/// startup a replace crashed midway; the live file is authoritative and the
/// holder is deleted.
pub fn replacing_path(root: &Path, doc_id: &str) -> PathBuf {
    root.join(format!("{}{}-replacing", basename(doc_id), DOC_EXT))
}

/// Object store key for a docId (snapshot component must already be
/// stripped; snapshots are native object versions, not part of the key).
pub fn object_key(prefix: &str, doc_id: &str) -> String {
    format!("{}{}{}", prefix, doc_id, DOC_EXT)
}
