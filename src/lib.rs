//! Streaming span aggregation and harvest pipeline.
//!
//! Records arrive on an ingest feed, are aggregated per destination
//! credential (running statistics keyed by metric identity, or pass-through
//! span lists), and are periodically cut into immutable batches delivered in
//! parallel to external telemetry endpoints. Failed batches are merged back
//! into live state and retried on the next harvest cycle.

pub mod config;
pub mod deliver;
pub mod export;
pub mod pipeline;
pub mod record;
