use crate::message::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

pub mod discord;

pub use discord::DiscordSource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
}

pub type RecordStream<'a> = BoxStream<'a, Result<RawRecord, SourceError>>;

/// A pull-based, lazily paged feed of messages from one channel.
///
/// `fetch` fails before yielding anything if the source cannot be reached
/// or the channel does not exist. Records are not guaranteed to be ordered.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<RecordStream<'_>, SourceError>;
}

/// In-memory source for tests and dry runs.
pub struct VecSource {
    items: Vec<Result<RawRecord, SourceError>>,
    fail_with: Option<SourceError>,
    fetches: AtomicUsize,
}

impl VecSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self::with_items(records.into_iter().map(Ok).collect())
    }

    /// Items are yielded as given, so an `Err` simulates a failed page.
    pub fn with_items(items: Vec<Result<RawRecord, SourceError>>) -> Self {
        Self {
            items,
            fail_with: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: SourceError) -> Self {
        Self {
            items: Vec::new(),
            fail_with: Some(error),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn fetch(&self, _since: DateTime<Utc>) -> Result<RecordStream<'_>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        // Window filtering is the engine's job; hand everything over.
        let items = self.items.clone();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}
