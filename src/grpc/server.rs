//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::admission::AdmissionGuard;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiterBackend;

/// gRPC server for the admission service.
pub struct GrpcServer<R: RateLimiterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission guard shared by every request
    guard: Arc<AdmissionGuard<R>>,
}

impl<R: RateLimiterBackend + 'static> GrpcServer<R> {
    /// Create a new gRPC server around an admission guard.
    pub fn new(addr: SocketAddr, guard: Arc<AdmissionGuard<R>>) -> Self {
        Self { addr, guard }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.guard);

        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService"
        );

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TurnstileError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimiter, RouteTable};
    use std::time::Duration;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let guard = AdmissionGuard::new(Arc::new(RateLimiter::new()), Arc::new(RouteTable::new()));
        let server = GrpcServer::new(addr, Arc::new(guard));
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let guard = AdmissionGuard::new(Arc::new(RateLimiter::new()), Arc::new(RouteTable::new()));
        let server = GrpcServer::new(addr, Arc::new(guard));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_with_shutdown(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
