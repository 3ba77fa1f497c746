//! Webhook logging - the concrete durable-write use case.
//!
//! # フロー
//! 1. HTTP 層が [`WebhookCapture`] を作る（payload + ヘッダ）
//! 2. `into_record` で `received_at` などのメタデータを付けた `NewRecord` にする
//! 3. [`webhook_log_action`] で組み立てた ResilientAction に insert
//!
//! 検証（[`WebhookLogPolicy`]）はストアに触れる前に走る。リプレイ時も同じ検証を通る。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;

use crate::app::{ActionBuilder, BuildError, RecordPolicy, ResilientAction};
use crate::config::LifeboatConfig;
use crate::domain::{NewRecord, ValidationError, meta};
use crate::ports::{Clock, Datastore, ReplayQueue};

/// One inbound webhook delivery as seen by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookCapture {
    pub payload: Vec<u8>,
    pub source_ip: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl WebhookCapture {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Convert into an insert request, stamping `received_at` from `clock`.
    ///
    /// Header names are lowercased so lookups do not depend on the sender's casing.
    pub fn into_record(self, clock: &dyn Clock) -> NewRecord {
        let mut record =
            NewRecord::new(self.payload).with_meta(meta::RECEIVED_AT, clock.now().to_rfc3339());
        if let Some(ip) = self.source_ip {
            record = record.with_meta(meta::SOURCE_IP, ip);
        }
        if let Some(ct) = self.content_type {
            record = record.with_meta(meta::CONTENT_TYPE, ct);
        }
        for (name, value) in self.headers {
            record = record.with_meta(
                format!("{}{}", meta::HEADER_PREFIX, name.to_ascii_lowercase()),
                value,
            );
        }
        record
    }
}

/// Validation applied to every webhook record, live or replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookLogPolicy {
    pub max_payload_bytes: usize,
}

impl RecordPolicy for WebhookLogPolicy {
    fn prepare(&self, record: NewRecord) -> Result<NewRecord, ValidationError> {
        let size = record.payload().len();
        if size == 0 {
            return Err(ValidationError::EmptyPayload);
        }
        if size > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }
        let Some(received_at) = record.metadata().get(meta::RECEIVED_AT) else {
            return Err(ValidationError::MissingMetadata(meta::RECEIVED_AT.to_string()));
        };
        if let Err(e) = DateTime::parse_from_rfc3339(received_at) {
            return Err(ValidationError::InvalidMetadata {
                key: meta::RECEIVED_AT.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(record)
    }
}

/// Builder pre-filled from `config`; callers may keep customizing it.
pub fn webhook_log_builder(
    config: &LifeboatConfig,
    stores: Vec<Arc<dyn Datastore>>,
    queue: Arc<dyn ReplayQueue>,
    clock: Arc<dyn Clock>,
) -> ActionBuilder {
    ResilientAction::builder(config.action.clone())
        .table(config.table.clone())
        .stores(stores)
        .treat_as_unavailable(config.unavailable_errors.iter().copied())
        .store_timeout(config.store_timeout())
        .policy(Arc::new(WebhookLogPolicy {
            max_payload_bytes: config.max_payload_bytes,
        }))
        .queue(queue)
        .clock(clock)
}

/// Build the webhook logging action from configuration.
///
/// `stores` must follow the order of `config.store_urls`.
pub fn webhook_log_action(
    config: &LifeboatConfig,
    stores: Vec<Arc<dyn Datastore>>,
    queue: Arc<dyn ReplayQueue>,
    clock: Arc<dyn Clock>,
) -> Result<ResilientAction, BuildError> {
    webhook_log_builder(config, stores, queue, clock).build()
}
