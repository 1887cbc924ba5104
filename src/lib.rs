//! Turnstile - Request Admission Control Service
//!
//! This crate meters inbound API requests against per-route limits. A
//! process-local fixed-window limiter serves single-node deployments; a
//! Redis-backed sliding-log limiter shares accounting across every instance.
//! Decisions and operator endpoints are exposed over gRPC.

pub mod admission;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
