//! End-to-end orchestration contract against an in-memory hypervisor.
//!
//! The fake driver implements the full driver capability set over a
//! shared mutable domain table, so deploy, destroy, cancellation, and
//! reconciliation run the real scheduler, registry, and planner with no
//! hypervisor or SSH endpoint behind them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cyris::core::driver::{
    DOMAIN_LABEL, DomainDefinition, DriverSet, GuestHandle, GuestObservation, HypervisorDriver,
    NetworkDefinition, NetworkHandle, domain_title, parse_domain_title,
};
use cyris::core::executor::{ExecutorConfig, RemoteExecutor};
use cyris::core::model::{GuestState, PowerState, RangeState};
use cyris::core::distributor::{ImageDistributor, host_image_path};
use cyris::core::orchestrator::Orchestrator;
use cyris::core::planner::{HostInventory, emit_plan};
use cyris::core::registry::Registry;
use cyris::core::events::{Event, Reporter};
use cyris::core::model::ImageRecord;
use cyris::core::{CoreConfig, CoreContext};
use cyris::{RangeSpec, load_range_spec};

const FINGERPRINT_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

#[derive(Default)]
struct FakeHypervisor {
    domains: BTreeMap<String, FakeDomain>,
    networks: BTreeSet<String>,
    destroy_calls: Vec<String>,
}

struct FakeDomain {
    title: String,
    running: bool,
}

struct FakeDriver {
    host: String,
    state: Arc<Mutex<FakeHypervisor>>,
    /// Guests that never answer their boot probe.
    never_ready: HashSet<String>,
}

impl FakeDriver {
    fn new(host: &str, state: Arc<Mutex<FakeHypervisor>>) -> Self {
        Self {
            host: host.to_string(),
            state,
            never_ready: HashSet::new(),
        }
    }

    fn with_never_ready(mut self, guest: &str) -> Self {
        self.never_ready.insert(guest.to_string());
        self
    }
}

impl HypervisorDriver for FakeDriver {
    fn host_id(&self) -> &str {
        &self.host
    }

    fn ensure_network(&self, definition: &NetworkDefinition) -> cyris::Result<NetworkHandle> {
        let mut state = self.state.lock().unwrap();
        let created = state.networks.insert(definition.bridge_name.clone());
        Ok(NetworkHandle {
            host: self.host.clone(),
            network_id: definition.network_id.clone(),
            bridge_name: definition.bridge_name.clone(),
            created,
        })
    }

    fn destroy_network(&self, handle: &NetworkHandle) -> cyris::Result<()> {
        self.state.lock().unwrap().networks.remove(&handle.bridge_name);
        Ok(())
    }

    fn clone_guest(&self, definition: &DomainDefinition) -> cyris::Result<GuestHandle> {
        let mut state = self.state.lock().unwrap();
        state.domains.insert(
            definition.domain_name.clone(),
            FakeDomain {
                title: domain_title(&definition.range_id, &definition.guest_id),
                running: false,
            },
        );
        Ok(GuestHandle {
            host: self.host.clone(),
            domain: definition.domain_name.clone(),
            range_id: Some(definition.range_id.clone()),
            guest_id: Some(definition.guest_id.clone()),
            overlay_path: None,
        })
    }

    fn start(&self, handle: &GuestHandle) -> cyris::Result<()> {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(&handle.domain) {
            domain.running = true;
        }
        Ok(())
    }

    fn shutdown(&self, handle: &GuestHandle, _graceful: Duration) -> cyris::Result<bool> {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(&handle.domain) {
            domain.running = false;
        }
        Ok(true)
    }

    fn force_off(&self, handle: &GuestHandle) -> cyris::Result<()> {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(&handle.domain) {
            domain.running = false;
        }
        Ok(())
    }

    fn destroy(&self, handle: &GuestHandle, _delete_storage: bool) -> cyris::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.domains.remove(&handle.domain);
        state.destroy_calls.push(handle.domain.clone());
        Ok(())
    }

    fn observe(&self, handle: &GuestHandle) -> cyris::Result<GuestObservation> {
        let state = self.state.lock().unwrap();
        let Some(domain) = state.domains.get(&handle.domain) else {
            return Err(cyris::Error::Hypervisor {
                host: self.host.clone(),
                message: format!("domain `{}` not found", handle.domain),
            });
        };
        let guest = handle.guest_id.clone().unwrap_or_default();
        let ready = domain.running && !self.never_ready.contains(&guest);
        Ok(GuestObservation {
            power: if domain.running {
                PowerState::Running
            } else {
                PowerState::Off
            },
            leased_ips: if ready {
                vec!["10.1.1.50".to_string()]
            } else {
                Vec::new()
            },
            agent_reachable: ready,
        })
    }

    fn list_domains(&self, label: &str) -> cyris::Result<Vec<GuestHandle>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .domains
            .iter()
            .filter(|(_, domain)| domain.title.contains(label))
            .map(|(name, domain)| {
                let (range_id, guest_id) = parse_domain_title(&domain.title);
                GuestHandle {
                    host: self.host.clone(),
                    domain: name.clone(),
                    range_id,
                    guest_id,
                    overlay_path: None,
                }
            })
            .collect())
    }
}

#[derive(Default)]
struct EventLog(Vec<Event>);

impl Reporter for EventLog {
    fn report(&mut self, event: Event) {
        self.0.push(event);
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    spec: RangeSpec,
    registry: Arc<Registry>,
    orchestrator: Orchestrator,
    hypervisors: HashMap<String, Arc<Mutex<FakeHypervisor>>>,
}

const TWO_HOST_RANGE: &str = r#"
version = "0.1.0"

[range]
id = "contract-01"
name = "Contract range"

[controller]
boot_timeout_secs = 8

[[hosts]]
id = "h1"
address = "198.51.100.10"
user = "cyris"
auth = "agent"
provider = "cloud-x"
capacity = 4

[[hosts]]
id = "h2"
address = "198.51.100.11"
user = "cyris"
auth = "agent"
provider = "cloud-x"
capacity = 4

[[base_images]]
id = "b1"
source = "base.qcow2"
fingerprint = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"

[[networks]]
id = "lan1"
host = "h1"

[[networks]]
id = "lan2"
host = "h2"

[[guests]]
id = "g1"
base_image = "b1"
host = "h1"
[guests.resources]
vcpu = 1
mem_mib = 512
[[guests.nics]]
network = "lan1"

[[guests]]
id = "g2"
base_image = "b1"
host = "h2"
[guests.resources]
vcpu = 1
mem_mib = 512
[[guests.nics]]
network = "lan2"
"#;

fn build_harness(spec_toml: &str, never_ready: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec_path = dir.path().join("range.toml");
    std::fs::write(&spec_path, spec_toml).expect("write spec");
    std::fs::write(dir.path().join("base.qcow2"), b"image-bytes").expect("write image");
    let spec = load_range_spec(&spec_path).expect("spec validates");

    let state_root = dir.path().join("state");
    let context = CoreContext::prepare(
        state_root,
        CoreConfig::with_overrides(&spec.controller),
    )
    .expect("context");
    let opened = Registry::open(&context.state_root).expect("registry opens");
    let registry = Arc::new(opened.registry);

    // Every host already holds the base image: the placement steps take
    // the dedup path and stay off the network.
    for host in &spec.hosts {
        registry
            .record_image(ImageRecord {
                fingerprint: FINGERPRINT_A.to_string(),
                host: host.id.clone(),
                path: PathBuf::from(host_image_path(FINGERPRINT_A)),
                size_bytes: 11,
                mtime: 0,
                recorded_at: "2026-01-01T00:00:00Z".to_string(),
            })
            .expect("seed image record");
    }

    let executor = Arc::new(RemoteExecutor::new(ExecutorConfig::default()));
    let distributor = Arc::new(ImageDistributor::new(
        executor.clone(),
        registry.clone(),
        spec.hosts.clone(),
        context.staging_dir.clone(),
        context.config.transfer_timeout,
    ));

    let mut hypervisors = HashMap::new();
    let mut drivers: HashMap<String, Arc<dyn HypervisorDriver>> = HashMap::new();
    for host in &spec.hosts {
        let state = Arc::new(Mutex::new(FakeHypervisor::default()));
        let mut driver = FakeDriver::new(&host.id, state.clone());
        for (h, guest) in never_ready {
            if *h == host.id {
                driver = driver.with_never_ready(guest);
            }
        }
        hypervisors.insert(host.id.clone(), state);
        drivers.insert(host.id.clone(), Arc::new(driver));
    }

    let orchestrator = Orchestrator::new(
        context,
        registry.clone(),
        executor,
        distributor,
        DriverSet::from_map(drivers),
        spec.hosts.clone(),
    );

    Harness {
        _dir: dir,
        spec,
        registry,
        orchestrator,
        hypervisors,
    }
}

fn plan_for(harness: &Harness) -> cyris::core::planner::Plan {
    let mut fingerprints = BTreeMap::new();
    fingerprints.insert("b1".to_string(), FINGERPRINT_A.to_string());
    emit_plan(
        &harness.spec,
        &fingerprints,
        &HostInventory::from_spec(&harness.spec),
    )
    .expect("plan emits")
}

fn deploy(harness: &Harness) -> (cyris::core::orchestrator::DeployReport, EventLog) {
    let plan = plan_for(harness);
    harness
        .orchestrator
        .register_range(&harness.spec, &plan)
        .expect("register");
    let mut log = EventLog::default();
    let report = harness
        .orchestrator
        .deploy(&harness.spec, &plan, &mut log)
        .expect("deploy runs");
    (report, log)
}

#[test]
fn two_hosts_two_guests_reach_active() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let (report, log) = deploy(&harness);

    assert_eq!(report.range_state, RangeState::Active);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let record = harness.registry.get_range("contract-01").unwrap();
    assert_eq!(record.state, RangeState::Active);
    for guest in record.guests.values() {
        assert_eq!(guest.state, GuestState::Active, "guest {}", guest.id);
        assert!(guest.boot_ready);
        assert_eq!(
            guest.nics[0].observed_ip.as_deref(),
            Some("10.1.1.50")
        );
    }

    // One labelled domain per host, running.
    for host in ["h1", "h2"] {
        let hypervisor = harness.hypervisors[host].lock().unwrap();
        assert_eq!(hypervisor.domains.len(), 1, "host {host}");
        assert!(hypervisor.domains.values().all(|d| d.running));
    }

    assert!(
        log.0
            .iter()
            .any(|e| matches!(e, Event::BootReady { guest, .. } if guest == "g1"))
    );
}

#[test]
fn boot_timeout_fails_one_guest_and_spares_the_rest() {
    let harness = build_harness(TWO_HOST_RANGE, &[("h2", "g2")]);
    let (report, _log) = deploy(&harness);

    // The range survives a non-critical guest failure.
    assert_eq!(report.range_state, RangeState::Active);

    let record = harness.registry.get_range("contract-01").unwrap();
    assert_eq!(record.guests["g1"].state, GuestState::Active);
    assert_eq!(record.guests["g2"].state, GuestState::FailedBoot);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, cyris::ErrorKind::Timeout);
}

#[test]
fn destroy_leaves_no_labelled_domains() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let (_report, _log) = deploy(&harness);

    let mut log = EventLog::default();
    let errors = harness
        .orchestrator
        .destroy_range("contract-01", &mut log)
        .expect("destroy runs");
    assert!(errors.is_empty(), "{errors:?}");

    let record = harness.registry.get_range("contract-01").unwrap();
    assert_eq!(record.state, RangeState::Destroyed);
    assert!(
        record
            .guests
            .values()
            .all(|g| g.state == GuestState::Destroyed)
    );

    for host in ["h1", "h2"] {
        let hypervisor = harness.hypervisors[host].lock().unwrap();
        assert!(hypervisor.domains.is_empty(), "host {host} keeps domains");
    }

    // Destroy is idempotent on a terminal range.
    let mut log = EventLog::default();
    let errors = harness
        .orchestrator
        .destroy_range("contract-01", &mut log)
        .expect("second destroy");
    assert!(errors.is_empty());
}

#[test]
fn cancellation_mid_deploy_then_destroy_leaves_nothing() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let plan = plan_for(&harness);
    harness
        .orchestrator
        .register_range(&harness.spec, &plan)
        .expect("register");

    // Cancel before the first step is claimed: the frontier refuses all
    // work and the range stays in Deploying for the destroy path.
    harness
        .orchestrator
        .cancel_flag()
        .store(true, Ordering::SeqCst);

    let mut log = EventLog::default();
    let report = harness
        .orchestrator
        .deploy(&harness.spec, &plan, &mut log)
        .expect("deploy returns");
    assert!(report.cancelled);
    assert_eq!(report.range_state, RangeState::Deploying);

    let mut log = EventLog::default();
    let errors = harness
        .orchestrator
        .destroy_range("contract-01", &mut log)
        .expect("destroy");
    assert!(errors.is_empty());

    let record = harness.registry.get_range("contract-01").unwrap();
    assert_eq!(record.state, RangeState::Destroyed);
    for host in ["h1", "h2"] {
        assert!(harness.hypervisors[host].lock().unwrap().domains.is_empty());
    }
}

#[test]
fn orphan_domains_are_swept_and_phantoms_marked() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let (_report, _log) = deploy(&harness);

    // An injected labelled domain the registry knows nothing about.
    harness.hypervisors["h1"].lock().unwrap().domains.insert(
        "cr-stale-guest".to_string(),
        FakeDomain {
            title: domain_title("stale", "guest"),
            running: true,
        },
    );
    // And a domain removed behind the registry's back.
    harness
        .hypervisors["h2"]
        .lock()
        .unwrap()
        .domains
        .clear();

    let mut log = EventLog::default();
    let report = harness
        .orchestrator
        .reconcile(false, false, &mut log)
        .expect("reconcile");

    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].1, "cr-stale-guest");
    {
        let hypervisor = harness.hypervisors["h1"].lock().unwrap();
        assert!(!hypervisor.domains.contains_key("cr-stale-guest"));
        assert!(
            hypervisor
                .destroy_calls
                .contains(&"cr-stale-guest".to_string())
        );
    }

    assert_eq!(report.phantoms, vec![("contract-01".to_string(), "g2".to_string())]);
    let record = harness.registry.get_range("contract-01").unwrap();
    assert_eq!(record.guests["g2"].state, GuestState::Missing);

    // The grace flag reports without destroying.
    harness.hypervisors["h1"].lock().unwrap().domains.insert(
        "cr-stale-guest2".to_string(),
        FakeDomain {
            title: domain_title("stale", "guest2"),
            running: true,
        },
    );
    let mut log = EventLog::default();
    let report = harness
        .orchestrator
        .reconcile(true, false, &mut log)
        .expect("reconcile with grace");
    assert_eq!(report.orphans.len(), 1);
    assert!(
        harness.hypervisors["h1"]
            .lock()
            .unwrap()
            .domains
            .contains_key("cr-stale-guest2")
    );
}

#[test]
fn journal_lines_carry_stamped_operations() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let (_report, _log) = deploy(&harness);

    // Every journal line is one self-describing transition: a snake_case
    // op tag followed by an RFC 3339 stamp. Crash recovery depends on
    // this shape, so lock it down.
    let journal =
        std::fs::read_to_string(harness._dir.path().join("state/journal.log")).expect("journal");
    let shape = regex::Regex::new(
        r#"^\{"op":"[a-z_]+","at":"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|\+00:00)".*\}$"#,
    )
    .unwrap();
    let lines: Vec<&str> = journal.lines().collect();
    assert!(!lines.is_empty(), "deploy must journal transitions");
    for line in lines {
        assert!(shape.is_match(line), "journal line out of shape: {line}");
    }
}

#[test]
fn registry_survives_controller_restart() {
    let harness = build_harness(TWO_HOST_RANGE, &[]);
    let (_report, _log) = deploy(&harness);

    // Drop everything holding the registry (and its lock) while keeping
    // the state directory alive, as a crashed-and-restarted controller
    // would find it.
    let Harness {
        _dir,
        spec: _,
        registry,
        orchestrator,
        hypervisors: _,
    } = harness;
    drop(orchestrator);
    drop(registry);

    let reopened = Registry::open(&_dir.path().join("state")).expect("reopen");
    let record = reopened.registry.get_range("contract-01").expect("range");
    assert_eq!(record.guests.len(), 2);
    assert_eq!(record.state, RangeState::Active);
}
