//! Tracing setup for the key-rotator job.
//!
//! Structured JSON logs always go to stdout. Spans are also exported over
//! OTLP/gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! Key bytes, wrapped keys and access tokens never appear in any span
//! attribute or log field.

pub mod init;

pub use init::{init_telemetry, shutdown};
