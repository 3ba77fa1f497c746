//! Logged record: payload + metadata, and the insert request that produces it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CaptureId, RecordId};

/// Well-known metadata keys.
pub mod meta {
    pub const SOURCE_IP: &str = "source_ip";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const RECEIVED_AT: &str = "received_at";
    /// Time of the live insert attempt that succeeded. Replay keeps it.
    pub const INSERTED_AT: &str = "inserted_at";
    /// 1-indexed position of the store that accepted the live insert. Replay keeps it.
    pub const INSERT_ATTEMPT: &str = "insert_attempt";
    /// One id per inbound capture, shared by every copy of it in any store.
    pub const CAPTURE_ID: &str = "capture_id";
    pub const REPLAYED_AT: &str = "replayed_at";
    pub const REPLAYED_FROM: &str = "replayed_from";
    /// Time the replayed copy was written to the canonical store.
    pub const REPLAY_INSERTED_AT: &str = "replay_inserted_at";
    /// Id the record had in the fallback store; downstream dedups on it.
    pub const ORIGIN_ID: &str = "origin_id";
    /// Prefix for copied inbound HTTP headers.
    pub const HEADER_PREFIX: &str = "header.";
}

/// Fields for one insert, before any store has accepted them.
///
/// The payload cannot be changed after construction. Metadata can only gain keys
/// through [`NewRecord::annotate`], which overwrites nothing the caller set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
    attempted_stores: Vec<String>,
}

impl NewRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: BTreeMap::new(),
            attempted_stores: Vec::new(),
        }
    }

    /// Builder-style metadata setter.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Re-insert request for a record captured in a fallback store.
    ///
    /// Payload, metadata and the live attempt trail are carried over unchanged.
    pub fn from_logged(record: &LoggedRecord) -> Self {
        Self {
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
            attempted_stores: record.insert_attempted_stores.clone(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn attempted_stores(&self) -> &[String] {
        &self.attempted_stores
    }

    /// Add a metadata key if absent. Returns false when the key was already set.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.metadata.contains_key(&key) {
            return false;
        }
        self.metadata.insert(key, value.into());
        true
    }

    /// Set a coordinator-owned metadata key (inserted_at, insert_attempt,
    /// replay_inserted_at). Each attempt overwrites the previous value.
    pub(crate) fn stamp(&mut self, key: &str, value: String) {
        self.metadata.insert(key.to_string(), value);
    }

    pub(crate) fn push_attempt(&mut self, store_url: String) {
        self.attempted_stores.push(store_url);
    }

    /// Materialize into a stored record. Called by datastore implementations.
    pub fn into_logged(self, id: RecordId, created_at: DateTime<Utc>) -> LoggedRecord {
        LoggedRecord {
            id,
            payload: self.payload,
            metadata: self.metadata,
            insert_attempted_stores: self.attempted_stores,
            created_at,
        }
    }
}

/// A webhook capture as persisted in one of the stores.
///
/// Canonical and fallback stores share this schema, so a record moves
/// between them without transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedRecord {
    pub id: RecordId,
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
    /// Store URLs tried before the insert succeeded, last entry = accepting store.
    pub insert_attempted_stores: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl LoggedRecord {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Id of the record this one was replayed from, if any.
    pub fn origin_id(&self) -> Option<RecordId> {
        self.meta(meta::ORIGIN_ID).and_then(|s| s.parse().ok())
    }

    /// Capture this record belongs to, if it went through the live insert path.
    pub fn capture_id(&self) -> Option<CaptureId> {
        self.meta(meta::CAPTURE_ID).and_then(|s| s.parse().ok())
    }

    /// Identity for downstream dedup.
    ///
    /// Every copy of one capture shares it: a replayed copy, and a copy that a
    /// timed-out store wrote late. Records without a capture id fall back to
    /// `origin_id`, then to their own id.
    pub fn dedup_key(&self) -> String {
        match self.capture_id() {
            Some(capture) => capture.to_string(),
            None => self.origin_id().unwrap_or(self.id).to_string(),
        }
    }
}
