//! Abstraction over the VM lifecycle service.

use std::future::Future;
use std::pin::Pin;

use crate::orka::{
    ApiResponse, DeployResponse, OrkaError, StatusResponse, TokenResponse, VmConfig,
};

/// Future returned by VM API operations.
pub type VmFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OrkaError>> + Send + 'a>>;

/// Lifecycle operations offered by the VM farm.
pub trait VmApi: Send + Sync {
    /// Registers a VM configuration.
    fn create<'a>(&'a self, config: &'a VmConfig) -> VmFuture<'a, ApiResponse>;

    /// Deploys a configured VM and reports its address.
    fn deploy<'a>(&'a self, name: &'a str) -> VmFuture<'a, DeployResponse>;

    /// Purges a VM and its configuration.
    fn delete<'a>(&'a self, name: &'a str) -> VmFuture<'a, ApiResponse>;

    /// Reports the deployment status of a VM.
    fn status<'a>(&'a self, name: &'a str) -> VmFuture<'a, StatusResponse>;

    /// Validates the API token.
    fn check_token(&self) -> VmFuture<'_, TokenResponse>;
}
