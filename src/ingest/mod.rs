//! Delivery of telemetry records to the streaming ingestion service.
//!
//! One record per cell execution is submitted with a single `PutRecord`
//! call. There is no batching and no retry: delivery failure is reported to
//! the caller, which treats telemetry loss as acceptable.

mod client;
mod credentials;
mod sign;

pub use client::{DeliverError, FirehoseClient, MemorySink, RecordSink};
pub use credentials::{CredentialError, Credentials, load_credentials};
