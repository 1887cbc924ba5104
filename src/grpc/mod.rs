//! gRPC server module for the admission service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

/// Generated protobuf types for `turnstile.admission.v1`.
pub mod proto {
    tonic::include_proto!("turnstile.admission.v1");
}

// Re-export commonly used types
pub use proto::admission_service_server::AdmissionServiceServer;
pub use proto::{AdmitRequest, AdmitResponse};
