pub mod config;
pub mod db;
pub mod ingest;
pub mod message;
pub mod source;

pub use ingest::{IngestEngine, IngestError, Outcome, RunReport, Window};
