//! Incremental ingestion: pull one window of records from a source and
//! insert each one exactly once.
//!
//! Fatal conditions (source unreachable, channel missing, store unusable
//! before the first record) abort the run through [`IngestError`]. Anything
//! that goes wrong with a single record is recorded in the [`RunReport`]
//! and the run moves on; the next run's overlapping window acts as retry.

use crate::config::Config;
use crate::db::{Database, StoreError};
use crate::message::{normalize, NewMessage, RawRecord};
use crate::source::{RecordSource, SourceError};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source unavailable: {0}")]
    Source(#[from] SourceError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Half-open interval `[start, end)` of authorship times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn lookback(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start: sub_std(now, lookback),
            end: now,
        }
    }

    /// Like [`Window::lookback`], but reaches back to `watermark` when the
    /// previous run left a gap. Never reaches further than `max_catchup`.
    pub fn resolve(
        now: DateTime<Utc>,
        lookback: Duration,
        watermark: Option<DateTime<Utc>>,
        max_catchup: Duration,
    ) -> Self {
        let mut window = Self::lookback(now, lookback);
        if let Some(mark) = watermark {
            if mark < window.start {
                window.start = mark.max(sub_std(now, max_catchup));
            }
        }
        window
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn sub_std(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub window: Window,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Records the source returned with an authorship time outside the window.
    pub outside_window: usize,
    pub failures: Vec<FailedRecord>,
}

impl RunReport {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            inserted: 0,
            skipped: 0,
            failed: 0,
            outside_window: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, external_id: &str, outcome: Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(FailedRecord {
                    external_id: external_id.to_string(),
                    reason,
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub lookback: Duration,
    pub use_watermark: bool,
    pub max_catchup: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(3600),
            use_watermark: false,
            max_catchup: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            lookback: config.lookback,
            use_watermark: config.use_watermark,
            max_catchup: config.max_catchup,
        }
    }
}

pub struct IngestEngine<S> {
    db: Database,
    source: S,
    options: EngineOptions,
}

impl<S: RecordSource> IngestEngine<S> {
    pub fn new(db: Database, source: S, options: EngineOptions) -> Self {
        Self {
            db,
            source,
            options,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Computes the window for a run starting at `now`.
    pub async fn window_at(&self, now: DateTime<Utc>) -> Result<Window, IngestError> {
        let watermark = if self.options.use_watermark {
            self.db.run_blocking(|db| db.latest_captured_at()).await?
        } else {
            None
        };
        Ok(Window::resolve(
            now,
            self.options.lookback,
            watermark,
            self.options.max_catchup,
        ))
    }

    /// Drains the source for one window. Per-record problems are counted,
    /// source failures abort the run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunReport, IngestError> {
        let window = self.window_at(now).await?;
        info!(
            "Ingest: window [{}, {})",
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        let mut stream = self.source.fetch(window.start).await.map_err(|e| {
            error!("Ingest: aborting before any insert: {}", e);
            e
        })?;

        let mut report = RunReport::new(window);
        while let Some(item) = stream.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        "Ingest: source failed mid-run after {} inserted, {} skipped, {} failed: {}",
                        report.inserted, report.skipped, report.failed, e
                    );
                    return Err(e.into());
                }
            };

            let message = match normalize_or_reject(&record) {
                Ok(message) => message,
                Err(rejected) => {
                    report.record(&record.id, rejected);
                    continue;
                }
            };

            if !window.contains(message.captured_at) {
                debug!(
                    "Ingest: record {} at {} is outside the window",
                    message.external_id, message.captured_at
                );
                report.outside_window += 1;
                continue;
            }

            let external_id = message.external_id.clone();
            let outcome = self.store(message).await;
            report.record(&external_id, outcome);
        }

        info!(
            "Ingest: run finished: {} inserted, {} skipped, {} failed",
            report.inserted, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Normalizes and stores one record. Never returns an error: failures
    /// come back as [`Outcome::Failed`].
    pub async fn ingest_one(&self, record: &RawRecord) -> Outcome {
        match normalize_or_reject(record) {
            Ok(message) => self.store(message).await,
            Err(rejected) => rejected,
        }
    }

    async fn store(&self, message: NewMessage) -> Outcome {
        let external_id = message.external_id.clone();

        // Fast path only; the UNIQUE constraint is what keeps races safe.
        let probe_id = external_id.clone();
        match self.db.run_blocking(move |db| db.exists(&probe_id)).await {
            Ok(true) => {
                debug!("Ingest: message {} already exists, skipping", external_id);
                return Outcome::Skipped(SkipReason::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Ingest: existence check failed for {}: {}", external_id, e);
                return Outcome::Failed(e.to_string());
            }
        }

        match self.db.run_blocking(move |db| db.insert(&message)).await {
            Ok(row_id) => {
                debug!("Ingest: stored message {} as row {}", external_id, row_id);
                Outcome::Inserted
            }
            Err(StoreError::DuplicateKey(_)) => {
                debug!("Ingest: message {} was inserted concurrently", external_id);
                Outcome::Skipped(SkipReason::Duplicate)
            }
            Err(e) => {
                warn!("Ingest: failed to store message {}: {}", external_id, e);
                Outcome::Failed(e.to_string())
            }
        }
    }
}

/// Shared by `run` and `ingest_one` so both reject malformed records the same way.
fn normalize_or_reject(record: &RawRecord) -> Result<NewMessage, Outcome> {
    normalize(record).map_err(|e| {
        warn!("Ingest: rejecting record '{}': {}", record.id, e);
        Outcome::Failed(e.to_string())
    })
}
