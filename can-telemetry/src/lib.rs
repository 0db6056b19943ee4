//! CAN Telemetry Core Library
//!
//! Ingests raw CAN frames, decodes them against a bit-level signal catalog,
//! validates frame integrity, rolls decoded values into time-windowed
//! aggregates, and distributes live decoded messages to subscribers.
//!
//! # Architecture
//!
//! - [`codec`]: bit-exact extraction/encoding of fixed-width fields with
//!   endianness, sign extension and scale/offset/clamp arithmetic
//! - [`catalog`]: immutable, load-once signal definition catalog
//! - [`normalizer`]: applies the codec per frame, enforces sequence-counter
//!   and checksum conventions, isolates per-signal failures
//! - [`diagnostics`]: bounded decode-error and unknown-frame stores
//! - [`store`]: buffered samples rolled into 1s/10s window aggregates with
//!   idempotent upserts, range/snapshot queries and age-based pruning
//! - [`hub`]: subscriber distribution with replay, fan-out and liveness
//! - [`health`]: staleness tracking, health rollup and auto-degrade
//! - [`pipeline`]: wiring, periodic tasks and ordered shutdown
//!
//! The library does NOT own HTTP routes, UI, process configuration or
//! concrete frame-source adapters; those live in the application layer
//! (can-telemetry-server) and talk to the core through [`pipeline`] and the
//! hub/store APIs.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry::catalog::Catalog;
//! use can_telemetry::pipeline::{PipelineConfig, TelemetryPipeline};
//! use can_telemetry::types::RawFrame;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> can_telemetry::types::Result<()> {
//! let catalog = Arc::new(Catalog::from_file(Path::new("vehicle.json"))?);
//! let pipeline = TelemetryPipeline::new(catalog, PipelineConfig::default());
//! pipeline.start();
//!
//! pipeline.ingest_frame(RawFrame::new(0x100, vec![0x07, 0xD0, 0, 0, 0, 0, 0, 0])).await?;
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod codec;
pub mod diagnostics;
pub mod health;
pub mod hub;
pub mod normalizer;
pub mod pipeline;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use catalog::{Catalog, Endianness, MessageDefinition, SignalDefinition};
pub use hub::{ClientRequest, DistributionHub, Envelope};
pub use pipeline::{PipelineConfig, TelemetryPipeline};
pub use store::{AggregateRow, AggregationStore, Window};
pub use types::{DecodedMessage, RawFrame, Result, TelemetryError, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
