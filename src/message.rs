//! Message records as they arrive from a source and as they live in the store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// A message exactly as the source reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub content: String,
    /// RFC 3339 timestamp with whatever offset the source used.
    pub authored_at: String,
    pub attachment_count: usize,
}

/// A validated message ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub external_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub content: String,
    pub captured_at: DateTime<Utc>,
    pub attachment_count: u32,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub row_id: i64,
    pub external_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub content: String,
    pub captured_at: DateTime<Utc>,
    pub attachment_count: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record has an empty id")]
    MissingId,
    #[error("unparseable authored_at '{value}': {reason}")]
    BadTimestamp { value: String, reason: String },
    #[error("attachment count {0} out of range")]
    AttachmentCount(usize),
}

/// Validates a raw record and converts its timestamp to UTC.
/// Content is stored verbatim, including empty bodies.
pub fn normalize(record: &RawRecord) -> Result<NewMessage, NormalizeError> {
    let external_id = record.id.trim();
    if external_id.is_empty() {
        return Err(NormalizeError::MissingId);
    }

    let captured_at = DateTime::parse_from_rfc3339(record.authored_at.trim())
        .map_err(|e| NormalizeError::BadTimestamp {
            value: record.authored_at.clone(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    let attachment_count = u32::try_from(record.attachment_count)
        .map_err(|_| NormalizeError::AttachmentCount(record.attachment_count))?;

    Ok(NewMessage {
        external_id: external_id.to_string(),
        channel_id: record.channel_id.clone(),
        author_id: record.author_id.clone(),
        author_display_name: record.author_display_name.clone(),
        content: record.content.clone(),
        captured_at,
        attachment_count,
    })
}

/// Fixed-width UTC form used on disk, so string order is time order.
pub fn to_canonical(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_canonical(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
