use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Provider;
use crate::error::{Error, Result};

/// Lifecycle state of a range. Transitions are monotonic along
/// `Planned → Deploying → Active | Failed` and
/// `Active | Failed → Destroying → Destroyed`; the orchestrator is the
/// only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeState {
    Planned,
    Deploying,
    Active,
    Failed,
    Destroying,
    Destroyed,
}

impl RangeState {
    pub fn describe(&self) -> &'static str {
        match self {
            RangeState::Planned => "planned",
            RangeState::Deploying => "deploying",
            RangeState::Active => "active",
            RangeState::Failed => "failed",
            RangeState::Destroying => "destroying",
            RangeState::Destroyed => "destroyed",
        }
    }

    /// Whether the range holds no live resources by definition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RangeState::Destroyed)
    }

    pub fn can_transition(&self, to: RangeState) -> bool {
        use RangeState::*;
        matches!(
            (self, to),
            (Planned, Deploying)
                | (Planned, Active)
                | (Planned, Destroying)
                | (Deploying, Active)
                | (Deploying, Failed)
                | (Active, Destroying)
                | (Failed, Destroying)
                | (Deploying, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

/// Observed state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestState {
    /// Recorded, nothing materialized yet.
    Pending,
    /// Clone step in flight.
    Cloning,
    /// Domain defined and started, boot probe outstanding.
    Booting,
    /// Boot probe answered; tasks may run.
    Ready,
    /// All tasks terminal, at least the non-skipped ones succeeded.
    Active,
    /// Image placement or host assignment failed before any clone.
    FailedPreCreate,
    /// The clone step itself failed; any overlay was deleted.
    FailedCreate,
    /// The boot probe never answered within budget.
    FailedBoot,
    /// A task failed; remaining tasks on this guest were skipped.
    FailedTask,
    /// Registry row exists but the hypervisor no longer knows the domain.
    Missing,
    Destroyed,
}

impl GuestState {
    pub fn describe(&self) -> &'static str {
        match self {
            GuestState::Pending => "pending",
            GuestState::Cloning => "cloning",
            GuestState::Booting => "booting",
            GuestState::Ready => "ready",
            GuestState::Active => "active",
            GuestState::FailedPreCreate => "failed-pre-create",
            GuestState::FailedCreate => "failed-create",
            GuestState::FailedBoot => "failed-boot",
            GuestState::FailedTask => "failed-task",
            GuestState::Missing => "missing",
            GuestState::Destroyed => "destroyed",
        }
    }

    /// States in which no domain is expected to exist on the host.
    pub fn expects_no_domain(&self) -> bool {
        matches!(
            self,
            GuestState::Pending
                | GuestState::FailedPreCreate
                | GuestState::Destroyed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    SkippedUpstreamFailed,
}

impl TaskState {
    pub fn describe(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::SkippedUpstreamFailed => "skipped-upstream-failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::SkippedUpstreamFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    Unknown,
    Running,
    Off,
}

/// Durable record of a range and everything beneath it. Destruction is
/// transitive; every cross-reference is an id, never a pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// RFC 3339 creation stamp.
    pub created_at: String,
    pub state: RangeState,
    /// Path to the immutable plan document.
    pub plan_path: PathBuf,
    #[serde(default)]
    pub guests: BTreeMap<String, GuestRecord>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkRecord>,
    /// Host ids this range touches, for status and reconciliation scoping.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl RangeRecord {
    /// Guard for the monotonic lifecycle; the registry refuses illegal
    /// transitions so a buggy caller cannot rewind history.
    pub fn transition(&mut self, to: RangeState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(Error::Internal {
                message: format!(
                    "illegal range transition {} → {} for `{}`",
                    self.state.describe(),
                    to.describe(),
                    self.id
                ),
            });
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestRecord {
    pub id: String,
    /// SHA-256 fingerprint of the backing base image.
    pub base_fingerprint: String,
    /// Host the guest was assigned to.
    pub host: String,
    /// Hypervisor-side domain name.
    pub domain: String,
    #[serde(default)]
    pub overlay_path: Option<PathBuf>,
    pub state: GuestState,
    #[serde(default)]
    pub power: PowerState,
    #[serde(default)]
    pub boot_ready: bool,
    #[serde(default)]
    pub nics: Vec<NicRecord>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl Default for PowerState {
    fn default() -> Self {
        PowerState::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicRecord {
    pub network: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub expected_ip: Option<String>,
    #[serde(default)]
    pub observed_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub host: String,
    pub bridge_name: String,
    #[serde(default)]
    pub subnet: Option<String>,
    /// Whether this range created the bridge (and must tear it down) or
    /// attached to a pre-existing one.
    pub created_by_range: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Task kind label as declared in the spec.
    pub kind: String,
    pub state: TaskState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub critical_to_range: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Terminal result detail: captured output tail or failure message.
    #[serde(default)]
    pub detail: Option<String>,
    /// Artifacts the task collected (pcap paths, generated credentials).
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Host inventory row carried in the registry so reconciliation works
/// without re-reading the original range description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth: String,
    pub provider: Provider,
    pub capacity: u32,
}

/// Placement table row: a verified base image copy on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub fingerprint: String,
    pub host: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Seconds since the epoch of the host-side file at verification time.
    pub mtime: u64,
    /// RFC 3339 stamp of the verification.
    pub recorded_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_lifecycle_is_monotonic() {
        let mut record = RangeRecord {
            id: "r1".into(),
            name: "r1".into(),
            owner: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            state: RangeState::Planned,
            plan_path: PathBuf::from("plan.json"),
            guests: BTreeMap::new(),
            networks: BTreeMap::new(),
            hosts: Vec::new(),
        };
        record.transition(RangeState::Deploying).unwrap();
        record.transition(RangeState::Active).unwrap();
        assert!(record.transition(RangeState::Planned).is_err());
        record.transition(RangeState::Destroying).unwrap();
        record.transition(RangeState::Destroyed).unwrap();
        assert!(record.transition(RangeState::Active).is_err());
    }

    #[test]
    fn deploying_range_can_fail_or_be_cancelled() {
        assert!(RangeState::Deploying.can_transition(RangeState::Failed));
        assert!(RangeState::Deploying.can_transition(RangeState::Destroying));
        assert!(!RangeState::Destroyed.can_transition(RangeState::Destroying));
    }

    #[test]
    fn transition_to_same_state_is_a_noop() {
        let mut record = RangeRecord {
            id: "r1".into(),
            name: "r1".into(),
            owner: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            state: RangeState::Active,
            plan_path: PathBuf::from("plan.json"),
            guests: BTreeMap::new(),
            networks: BTreeMap::new(),
            hosts: Vec::new(),
        };
        record.transition(RangeState::Active).unwrap();
        assert_eq!(record.state, RangeState::Active);
    }
}
