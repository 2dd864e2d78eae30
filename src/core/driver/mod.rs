use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HostSpec, Provider, SubnetSpec};
use crate::error::{Error, Result};

use super::executor::RemoteExecutor;
use super::model::PowerState;

mod cloud;
mod kvm;

pub use cloud::CloudDriver;
pub use kvm::KvmDriver;
pub(crate) use kvm::shell_quote;

/// Label namespace stamped onto every domain this controller creates.
/// Reconciliation sweeps match on it.
pub const DOMAIN_LABEL: &str = "cyris";

/// What a driver is asked to materialize for a network.
#[derive(Debug, Clone)]
pub struct NetworkDefinition {
    pub range_id: String,
    pub network_id: String,
    pub bridge_name: String,
    pub subnet: Option<SubnetSpec>,
    pub gateway: Option<Ipv4Addr>,
    pub nat: bool,
}

/// A provisioned (or pre-existing) network on one host.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub host: String,
    pub network_id: String,
    pub bridge_name: String,
    /// Whether this call created the network. Pre-existing networks are
    /// never destroyed with the range.
    pub created: bool,
}

/// What a driver is asked to materialize for a guest domain. The overlay
/// referenced here was created by the image distributor; the definition
/// never mutates the base image.
#[derive(Debug, Clone)]
pub struct DomainDefinition {
    pub range_id: String,
    pub guest_id: String,
    pub domain_name: String,
    pub vcpu: u32,
    pub mem_mib: u64,
    /// Fingerprint of the backing base image. Cloud providers clone from
    /// it directly; the KVM driver works through `overlay_path`.
    pub base_fingerprint: String,
    pub overlay_path: PathBuf,
    pub nics: Vec<DomainNic>,
}

#[derive(Debug, Clone)]
pub struct DomainNic {
    pub bridge_name: String,
    pub mac: Option<String>,
}

/// Handle to a hypervisor-side domain. For domains discovered by
/// [`HypervisorDriver::list_domains`], the range/guest labels are parsed
/// from hypervisor metadata and may be absent on foreign domains.
#[derive(Debug, Clone)]
pub struct GuestHandle {
    pub host: String,
    pub domain: String,
    pub range_id: Option<String>,
    pub guest_id: Option<String>,
    pub overlay_path: Option<PathBuf>,
}

/// One observation of a domain's runtime state.
#[derive(Debug, Clone)]
pub struct GuestObservation {
    pub power: PowerState,
    pub leased_ips: Vec<String>,
    pub agent_reachable: bool,
}

/// Uniform capability set over local KVM/libvirt and cloud providers.
///
/// Operations are synchronous in effect: they return only after the
/// hypervisor has acknowledged. `destroy` is idempotent; destroying an
/// unknown domain succeeds.
pub trait HypervisorDriver: Send + Sync {
    fn host_id(&self) -> &str;

    /// Create the network if absent; idempotent on name.
    fn ensure_network(&self, definition: &NetworkDefinition) -> Result<NetworkHandle>;

    /// Tear down a range-created network. Unknown networks succeed.
    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()>;

    /// Define a domain backed by a copy-on-write overlay. Fails when the
    /// overlay (or its base) is missing. Does not start the domain.
    fn clone_guest(&self, definition: &DomainDefinition) -> Result<GuestHandle>;

    fn start(&self, handle: &GuestHandle) -> Result<()>;

    /// Request a guest-cooperative shutdown and wait up to
    /// `graceful_timeout`. Returns `true` once the domain is off, `false`
    /// when the window lapsed with the domain still running.
    fn shutdown(&self, handle: &GuestHandle, graceful_timeout: Duration) -> Result<bool>;

    fn force_off(&self, handle: &GuestHandle) -> Result<()>;

    /// Undefine the domain, deleting its overlay storage when asked.
    /// Idempotent.
    fn destroy(&self, handle: &GuestHandle, delete_storage: bool) -> Result<()>;

    fn observe(&self, handle: &GuestHandle) -> Result<GuestObservation>;

    /// Domains on this host carrying `label` metadata, for reconciliation
    /// and orphan sweeps.
    fn list_domains(&self, label: &str) -> Result<Vec<GuestHandle>>;
}

/// Per-host driver instances for one controller process.
pub struct DriverSet {
    drivers: HashMap<String, Arc<dyn HypervisorDriver>>,
}

impl DriverSet {
    /// Instantiate a driver per host according to its provider.
    pub fn for_hosts(
        hosts: &[HostSpec],
        executor: Arc<RemoteExecutor>,
        scratch_dir: PathBuf,
    ) -> Result<Self> {
        let mut drivers: HashMap<String, Arc<dyn HypervisorDriver>> = HashMap::new();
        for host in hosts {
            let driver: Arc<dyn HypervisorDriver> = match host.provider {
                Provider::Kvm => Arc::new(KvmDriver::new(
                    host.clone(),
                    executor.clone(),
                    scratch_dir.clone(),
                )),
                Provider::CloudX => Arc::new(CloudDriver::new(host.clone())?),
            };
            drivers.insert(host.id.clone(), driver);
        }
        Ok(Self { drivers })
    }

    pub fn get(&self, host_id: &str) -> Result<Arc<dyn HypervisorDriver>> {
        self.drivers.get(host_id).cloned().ok_or_else(|| Error::Internal {
            message: format!("no driver instantiated for host `{host_id}`"),
        })
    }

    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Assemble a set from pre-built driver instances. The orchestrator
    /// test harness injects fakes through this.
    pub fn from_map(drivers: HashMap<String, Arc<dyn HypervisorDriver>>) -> Self {
        Self { drivers }
    }
}

/// Render the metadata title embedded in every domain definition:
/// `cyris.range=<range-id> cyris.guest=<guest-id>`.
pub fn domain_title(range_id: &str, guest_id: &str) -> String {
    format!("{DOMAIN_LABEL}.range={range_id} {DOMAIN_LABEL}.guest={guest_id}")
}

/// Parse a domain title back into (range, guest) labels.
pub fn parse_domain_title(title: &str) -> (Option<String>, Option<String>) {
    let mut range = None;
    let mut guest = None;
    for part in title.split_whitespace() {
        if let Some(value) = part.strip_prefix(&format!("{DOMAIN_LABEL}.range=")) {
            range = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix(&format!("{DOMAIN_LABEL}.guest=")) {
            guest = Some(value.to_string());
        }
    }
    (range, guest)
}

/// Canonical domain name for a guest: `cr-<range-id>-<guest-id>`.
pub fn domain_name(range_id: &str, guest_id: &str) -> String {
    format!("cr-{range_id}-{guest_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_title_round_trips() {
        let title = domain_title("training-01", "desktop");
        let (range, guest) = parse_domain_title(&title);
        assert_eq!(range.as_deref(), Some("training-01"));
        assert_eq!(guest.as_deref(), Some("desktop"));
    }

    #[test]
    fn foreign_title_parses_to_nothing() {
        let (range, guest) = parse_domain_title("somebody else's domain");
        assert!(range.is_none());
        assert!(guest.is_none());
    }
}
