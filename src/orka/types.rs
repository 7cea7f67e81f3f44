//! Request and response payloads for the Orka VM API.

use serde::{Deserialize, Serialize};

/// VM configuration registered before deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmConfig {
    /// VM (and configuration) name.
    pub name: String,
    /// Base image the VM boots from.
    pub image: String,
    /// CPU core count.
    pub cpu: u32,
    /// Virtual CPU count.
    pub vcpu: u32,
}

/// Wire format of the create request.
#[derive(Debug, Serialize)]
pub(crate) struct CreateRequest<'a> {
    pub(crate) orka_vm_name: &'a str,
    pub(crate) orka_base_image: &'a str,
    pub(crate) orka_image: &'a str,
    pub(crate) orka_cpu_core: u32,
    pub(crate) vcpu_count: u32,
}

impl<'a> From<&'a VmConfig> for CreateRequest<'a> {
    fn from(config: &'a VmConfig) -> Self {
        Self {
            orka_vm_name: &config.name,
            orka_base_image: &config.image,
            orka_image: &config.name,
            orka_cpu_core: config.cpu,
            vcpu_count: config.vcpu,
        }
    }
}

/// Wire format of requests that only name a VM.
#[derive(Debug, Serialize)]
pub(crate) struct NameRequest<'a> {
    pub(crate) orka_vm_name: &'a str,
}

/// A single error reported by the API.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiErrorMessage {
    /// Human-readable error text.
    #[serde(default)]
    pub message: String,
}

/// Envelope shared by every API response.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiResponse {
    /// Informational message.
    #[serde(default)]
    pub message: String,
    /// Errors reported by the service; empty on success.
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<ApiErrorMessage>,
}

/// Response to a deploy request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeployResponse {
    /// Common envelope.
    #[serde(flatten)]
    pub response: ApiResponse,
    /// Memory assigned to the VM.
    #[serde(default)]
    pub ram: String,
    /// Virtual CPUs assigned to the VM.
    #[serde(default)]
    pub vcpu: String,
    /// Host CPUs assigned to the VM.
    #[serde(default)]
    pub host_cpu: String,
    /// Address of the node hosting the VM.
    #[serde(default)]
    pub ip: String,
    /// Port forwarded to the VM's SSH server.
    #[serde(default)]
    pub ssh_port: String,
    /// Port forwarded to the VM's screen sharing server.
    #[serde(default)]
    pub screen_share_port: String,
    /// Deployment identifier.
    #[serde(default)]
    pub vm_id: String,
    /// Port forwarded to the VM's VNC server.
    #[serde(default)]
    pub vnc_port: String,
}

impl DeployResponse {
    /// Returns the `ip:port` remote shell address, when both parts are set.
    #[must_use]
    pub fn ssh_address(&self) -> Option<String> {
        let ip = self.ip.trim();
        let port = self.ssh_port.trim();
        if ip.is_empty() || port.is_empty() {
            return None;
        }
        Some(format!("{ip}:{port}"))
    }
}

/// Response to a status request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusResponse {
    /// Common envelope.
    #[serde(flatten)]
    pub response: ApiResponse,
    /// Configured VMs matching the requested name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub virtual_machine_resources: Vec<VmResource>,
}

/// A configured VM and its deployments.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmResource {
    /// VM name.
    #[serde(default)]
    pub virtual_machine_name: String,
    /// Either `Deployed` or `Not Deployed`.
    #[serde(default)]
    pub vm_deployment_status: String,
    /// Per-deployment node status.
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: Vec<VmNodeStatus>,
}

/// Status of one VM deployment on a node.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmNodeStatus {
    /// Owner of the deployment.
    #[serde(default)]
    pub owner: String,
    /// Deployment identifier.
    #[serde(default)]
    pub virtual_machine_id: String,
    /// Node hosting the deployment.
    #[serde(default)]
    pub node_location: String,
    /// Node health.
    #[serde(default)]
    pub node_status: String,
    /// Node address.
    #[serde(default)]
    pub virtual_machine_ip: String,
    /// Forwarded SSH port.
    #[serde(default)]
    pub ssh_port: String,
    /// CPU core count.
    #[serde(default)]
    pub cpu: u32,
    /// Virtual CPU count.
    #[serde(default)]
    pub vcpu: u32,
    /// Base image of the deployment.
    #[serde(default)]
    pub base_image: String,
    /// Current VM power status.
    #[serde(default)]
    pub vm_status: String,
}

/// Response to a token check.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenResponse {
    /// Common envelope.
    #[serde(flatten)]
    pub response: ApiResponse,
    /// Whether the token authenticated.
    #[serde(default)]
    pub authenticated: bool,
    /// Whether the token has been revoked.
    #[serde(default)]
    pub is_token_revoked: bool,
    /// Account the token belongs to.
    #[serde(default)]
    pub email: String,
}

impl TokenResponse {
    /// Returns `true` when the token is authenticated and not revoked.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.authenticated && !self.is_token_revoked
    }
}

/// Access to the common envelope of any response type.
pub(crate) trait Envelope {
    fn envelope(&self) -> &ApiResponse;
}

impl Envelope for ApiResponse {
    fn envelope(&self) -> &ApiResponse {
        self
    }
}

impl Envelope for DeployResponse {
    fn envelope(&self) -> &ApiResponse {
        &self.response
    }
}

impl Envelope for StatusResponse {
    fn envelope(&self) -> &ApiResponse {
        &self.response
    }
}

impl Envelope for TokenResponse {
    fn envelope(&self) -> &ApiResponse {
        &self.response
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
