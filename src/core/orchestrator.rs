use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{HostSpec, Provider, RangeSpec, TaskKind};
use crate::error::{Error, ErrorKind, Result};

use super::context::CoreContext;
use super::diagnostics::Severity;
use super::distributor::{ImageDistributor, host_overlay_path};
use super::driver::{
    DOMAIN_LABEL, DomainDefinition, DomainNic, DriverSet, GuestHandle, NetworkDefinition,
    NetworkHandle, domain_name,
};
use super::events::{Event, OrphanAction, Reporter, ShutdownOutcome, TaskEventStatus};
use super::executor::{RemoteExecutor, Target};
use super::model::{
    GuestRecord, GuestState, NetworkRecord, NicRecord, PowerState, RangeRecord, RangeState,
    TaskRecord, TaskState,
};
use super::planner::{Plan, StepKind};
use super::registry::{Registry, now_stamp};
use super::tasks::{TaskContext, apply_task, ensure_target_contained};

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const GRACEFUL_SHUTDOWN_WINDOW: Duration = Duration::from_secs(30);

/// Execution status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// An upstream step failed; this one never ran.
    SkippedUpstreamFailed,
    /// Cancellation refused this step before it became ready.
    Cancelled,
}

impl StepStatus {
    pub fn describe(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::SkippedUpstreamFailed => "skipped-upstream-failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// A failure attributed to one entity, for the grouped result surface.
#[derive(Debug, Clone)]
pub struct AttributedError {
    pub component: &'static str,
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// What `deploy` hands back to the operation layer.
#[derive(Debug)]
pub struct DeployReport {
    pub range_state: RangeState,
    pub step_statuses: Vec<StepStatus>,
    pub errors: Vec<AttributedError>,
    /// (guest, task) → password generated during `add_user`.
    pub generated_passwords: BTreeMap<(String, String), String>,
    pub cancelled: bool,
}

/// Report of one reconciliation sweep.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Hypervisor-side domains with no registry row, and what was done.
    pub orphans: Vec<(String, String, OrphanAction)>,
    /// Registry guests whose domain no longer exists.
    pub phantoms: Vec<(String, String)>,
    pub errors: Vec<AttributedError>,
}

/// Drives a plan to completion over a fixed worker pool, owns every
/// lifecycle transition, and is the only writer of range state.
pub struct Orchestrator {
    context: CoreContext,
    registry: Arc<Registry>,
    executor: Arc<RemoteExecutor>,
    distributor: Arc<ImageDistributor>,
    drivers: DriverSet,
    hosts: Vec<HostSpec>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        context: CoreContext,
        registry: Arc<Registry>,
        executor: Arc<RemoteExecutor>,
        distributor: Arc<ImageDistributor>,
        drivers: DriverSet,
        hosts: Vec<HostSpec>,
    ) -> Self {
        Self {
            context,
            registry,
            executor,
            distributor,
            drivers,
            hosts,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle callers use to request cancellation from another thread
    /// (user-initiated destroy of a still-deploying range, controller
    /// shutdown).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn host_spec(&self, host_id: &str) -> Result<&HostSpec> {
        self.hosts
            .iter()
            .find(|h| h.id == host_id)
            .ok_or_else(|| Error::Internal {
                message: format!("no host spec for `{host_id}`"),
            })
    }

    /// Controller-side overlay inventory under `ranges/<id>/overlays/`,
    /// one document per guest, so operators can audit host-side storage
    /// without reaching the hosts.
    fn write_overlay_inventory(
        &self,
        range_id: &str,
        guest_id: &str,
        host_id: &str,
        overlay: &std::path::Path,
    ) -> Result<()> {
        let dir = self.context.overlays_dir(range_id);
        std::fs::create_dir_all(&dir).map_err(|source| Error::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let entry = serde_json::json!({
            "guest": guest_id,
            "host": host_id,
            "overlay_path": overlay,
            "recorded_at": now_stamp(),
        });
        let path = dir.join(format!("{guest_id}.json"));
        std::fs::write(&path, format!("{entry:#}\n")).map_err(|source| Error::WriteState {
            path,
            source,
        })
    }

    fn drop_overlay_inventory(&self, range_id: &str, guest_id: &str) {
        let path = self
            .context
            .overlays_dir(range_id)
            .join(format!("{guest_id}.json"));
        let _ = std::fs::remove_file(path);
    }

    /// Record the full range (guests pending, tasks pending) and move it
    /// `Planned → Deploying`. The write-ahead record is what makes crash
    /// recovery sound: every domain we may create is journalled first.
    pub fn register_range(&self, spec: &RangeSpec, plan: &Plan) -> Result<()> {
        let mut guests = BTreeMap::new();
        let assignments: BTreeMap<String, String> = plan
            .steps
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::CloneGuest { guest, host } => Some((guest.clone(), host.clone())),
                _ => None,
            })
            .collect();
        let fingerprints: BTreeMap<String, String> = plan
            .steps
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::PlaceImage {
                    image, fingerprint, ..
                } => Some((image.clone(), fingerprint.clone())),
                _ => None,
            })
            .collect();

        for guest in &spec.guests {
            let host = assignments
                .get(&guest.id)
                .cloned()
                .unwrap_or_else(|| guest.host.clone().unwrap_or_default());
            let tasks = guest
                .tasks
                .iter()
                .map(|task| {
                    (
                        task.id.clone(),
                        TaskRecord {
                            id: task.id.clone(),
                            kind: task.kind.label().to_string(),
                            state: TaskState::Pending,
                            attempts: 0,
                            critical_to_range: task.critical_to_range,
                            depends_on: task.depends_on.clone(),
                            detail: None,
                            artifacts: Vec::new(),
                        },
                    )
                })
                .collect();
            guests.insert(
                guest.id.clone(),
                GuestRecord {
                    id: guest.id.clone(),
                    base_fingerprint: fingerprints
                        .get(&guest.base_image)
                        .cloned()
                        .unwrap_or_default(),
                    host,
                    domain: domain_name(&spec.range.id, &guest.id),
                    overlay_path: None,
                    state: GuestState::Pending,
                    power: PowerState::Unknown,
                    boot_ready: false,
                    nics: guest
                        .nics
                        .iter()
                        .map(|nic| NicRecord {
                            network: nic.network.clone(),
                            mac: nic.mac.clone(),
                            expected_ip: nic.ip.map(|ip| ip.to_string()),
                            observed_ip: None,
                        })
                        .collect(),
                    tasks,
                },
            );
        }

        let networks = spec
            .networks
            .iter()
            .map(|network| {
                (
                    network.id.clone(),
                    NetworkRecord {
                        id: network.id.clone(),
                        host: network.host.clone(),
                        bridge_name: network.bridge_name.clone(),
                        subnet: network.subnet.map(|s| s.to_string()),
                        created_by_range: false,
                    },
                )
            })
            .collect();

        self.registry.upsert_range(RangeRecord {
            id: spec.range.id.clone(),
            name: spec.range.name.clone(),
            owner: spec.range.owner.clone(),
            created_at: now_stamp(),
            state: RangeState::Planned,
            plan_path: self.context.plan_path(&spec.range.id),
            guests,
            networks,
            hosts: self.hosts.iter().map(|h| h.id.clone()).collect(),
        })
    }

    /// Execute the plan across the worker pool. Partial failure follows
    /// the per-step policy; the range ends `Active` unless a
    /// critical-to-range task failed or cancellation was requested.
    pub fn deploy(
        &self,
        spec: &RangeSpec,
        plan: &Plan,
        reporter: &mut dyn Reporter,
    ) -> Result<DeployReport> {
        let range_id = &spec.range.id;

        if plan.is_empty() {
            // Boundary: an empty range deploys with zero steps.
            self.registry.range_state(range_id, RangeState::Deploying)?;
            self.registry.range_state(range_id, RangeState::Active)?;
            reporter.report(Event::RangeStateChanged {
                range: range_id.clone(),
                state: RangeState::Active.describe(),
            });
            return Ok(DeployReport {
                range_state: RangeState::Active,
                step_statuses: Vec::new(),
                errors: Vec::new(),
                generated_passwords: BTreeMap::new(),
                cancelled: false,
            });
        }

        self.registry.range_state(range_id, RangeState::Deploying)?;
        reporter.report(Event::RangeStateChanged {
            range: range_id.clone(),
            state: RangeState::Deploying.describe(),
        });

        let scheduler = Scheduler::new(plan, &self.context, &self.hosts);
        let (event_tx, event_rx) = mpsc::channel::<Event>();
        let workers = self
            .context
            .config
            .effective_workers(self.hosts.len())
            .min(plan.steps.len().max(1));

        let shared = SharedDeploy {
            orchestrator: self,
            spec,
            plan,
            scheduler: &scheduler,
            results: Mutex::new(DeployAccumulator::default()),
        };

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let tx = event_tx.clone();
                let shared = &shared;
                handles.push(scope.spawn(move || shared.worker_loop(tx)));
            }
            drop(event_tx);

            while let Ok(event) = event_rx.recv() {
                reporter.report(event);
            }
            for handle in handles {
                if let Err(payload) = handle.join() {
                    panic::resume_unwind(payload);
                }
            }
        });

        let accumulator = shared
            .results
            .into_inner()
            .expect("deploy accumulator poisoned");
        let statuses = scheduler.statuses();
        let cancelled = self.cancel.load(Ordering::SeqCst);
        let critical = scheduler.critical_failure();

        let range_state = if critical {
            self.registry.range_state(range_id, RangeState::Failed)?;
            reporter.report(Event::RangeStateChanged {
                range: range_id.clone(),
                state: RangeState::Failed.describe(),
            });
            // Graceful teardown of whatever was built; the Failed row
            // remains for the operator.
            self.teardown_guests(range_id, reporter)?;
            RangeState::Failed
        } else if cancelled {
            // The caller decides: destroy-mid-deploy continues into
            // destruction, controller shutdown leaves Deploying for the
            // startup sweep.
            RangeState::Deploying
        } else {
            self.registry.range_state(range_id, RangeState::Active)?;
            reporter.report(Event::RangeStateChanged {
                range: range_id.clone(),
                state: RangeState::Active.describe(),
            });
            RangeState::Active
        };

        Ok(DeployReport {
            range_state,
            step_statuses: statuses,
            errors: accumulator.errors,
            generated_passwords: accumulator.generated_passwords,
            cancelled,
        })
    }

    /// Destroy a range: guests in parallel (graceful → forced → destroy
    /// with storage), then range-created networks, then overlays and the
    /// lifecycle transition to `Destroyed`.
    pub fn destroy_range(
        &self,
        range_id: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<AttributedError>> {
        let record = self
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.to_string(),
            })?;
        if record.state == RangeState::Destroyed {
            return Ok(Vec::new());
        }

        self.registry.range_state(range_id, RangeState::Destroying)?;
        reporter.report(Event::RangeStateChanged {
            range: range_id.to_string(),
            state: RangeState::Destroying.describe(),
        });

        let mut errors = self.teardown_guests(range_id, reporter)?;

        // Networks this range created, newest record wins.
        let record = self
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.to_string(),
            })?;
        for network in record.networks.values() {
            if !network.created_by_range {
                continue;
            }
            let driver = match self.drivers.get(&network.host) {
                Ok(driver) => driver,
                Err(err) => {
                    errors.push(attribute("orchestrator", &network.id, &err));
                    continue;
                }
            };
            let handle = NetworkHandle {
                host: network.host.clone(),
                network_id: network.id.clone(),
                bridge_name: network.bridge_name.clone(),
                created: true,
            };
            match driver.destroy_network(&handle) {
                Ok(()) => reporter.report(Event::NetworkDestroyed {
                    network: network.id.clone(),
                    host: network.host.clone(),
                }),
                Err(err) => errors.push(attribute("driver", &network.id, &err)),
            }
        }

        // Side effects first, then the durable terminal transition: a
        // crash in between leaves over-reported rows for the sweeper.
        self.registry.range_state(range_id, RangeState::Destroyed)?;
        reporter.report(Event::RangeStateChanged {
            range: range_id.to_string(),
            state: RangeState::Destroyed.describe(),
        });
        Ok(errors)
    }

    fn teardown_guests(
        &self,
        range_id: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<AttributedError>> {
        let record = self
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.to_string(),
            })?;

        struct GuestTeardown {
            guest: String,
            outcome: Result<ShutdownOutcome>,
        }

        let (event_tx, event_rx) = mpsc::channel::<Event>();
        let mut results: Vec<GuestTeardown> = Vec::new();

        thread::scope(|scope| {
            let mut handles = Vec::new();
            for guest in record.guests.values() {
                if guest.state.expects_no_domain() {
                    continue;
                }
                let tx = event_tx.clone();
                let guest = guest.clone();
                let this = &*self;
                let range_id = range_id.to_string();
                handles.push(scope.spawn(move || GuestTeardown {
                    guest: guest.id.clone(),
                    outcome: this.teardown_one_guest(&range_id, &guest, &tx),
                }));
            }
            drop(event_tx);

            while let Ok(event) = event_rx.recv() {
                reporter.report(event);
            }
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
        });

        let mut errors = Vec::new();
        for result in results {
            if let Err(err) = result.outcome {
                errors.push(attribute("driver", &result.guest, &err));
            }
        }
        Ok(errors)
    }

    fn teardown_one_guest(
        &self,
        range_id: &str,
        guest: &GuestRecord,
        events: &mpsc::Sender<Event>,
    ) -> Result<ShutdownOutcome> {
        let started = Instant::now();
        let driver = self.drivers.get(&guest.host)?;
        let handle = GuestHandle {
            host: guest.host.clone(),
            domain: guest.domain.clone(),
            range_id: Some(range_id.to_string()),
            guest_id: Some(guest.id.clone()),
            overlay_path: guest.overlay_path.clone(),
        };

        let _ = events.send(Event::ShutdownRequested {
            guest: guest.id.clone(),
        });

        let outcome = match driver.shutdown(&handle, GRACEFUL_SHUTDOWN_WINDOW) {
            Ok(true) => ShutdownOutcome::Graceful,
            Ok(false) => {
                let _ = events.send(Event::ShutdownEscalated {
                    guest: guest.id.clone(),
                    waited_ms: GRACEFUL_SHUTDOWN_WINDOW.as_millis() as u64,
                });
                driver.force_off(&handle)?;
                ShutdownOutcome::Forced
            }
            // A vanished domain means there is nothing left to stop.
            Err(_) => ShutdownOutcome::AlreadyOff,
        };

        driver.destroy(&handle, true)?;
        if let Some(overlay) = &guest.overlay_path {
            let host = self.host_spec(&guest.host)?;
            if host.provider == Provider::Kvm {
                let _ = self.distributor.remove_overlay(host, overlay);
            }
        }
        self.drop_overlay_inventory(range_id, &guest.id);

        self.registry
            .guest_state(range_id, &guest.id, GuestState::Destroyed)?;
        let _ = events.send(Event::ShutdownComplete {
            guest: guest.id.clone(),
            outcome,
            total_ms: started.elapsed().as_millis() as u64,
        });
        let _ = events.send(Event::GuestDestroyed {
            guest: guest.id.clone(),
            host: guest.host.clone(),
        });
        Ok(outcome)
    }

    /// Cross-check the registry against each host's labelled domains.
    /// Orphans (domains without rows) are destroyed unless `grace`;
    /// phantoms (rows without domains) are marked `missing`.
    pub fn reconcile(
        &self,
        grace: bool,
        dry_run: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let expected = self.registry.expected_domains();

        for host_id in self.drivers.host_ids() {
            let driver = self.drivers.get(&host_id)?;
            let domains = match driver.list_domains(DOMAIN_LABEL) {
                Ok(domains) => domains,
                Err(err) => {
                    report.errors.push(attribute("driver", &host_id, &err));
                    continue;
                }
            };

            let expected_here = expected.get(&host_id).cloned().unwrap_or_default();
            let expected_names: HashSet<&str> = expected_here
                .iter()
                .map(|domain| domain.domain.as_str())
                .collect();
            let actual_names: HashSet<String> =
                domains.iter().map(|d| d.domain.clone()).collect();

            for domain in &domains {
                if expected_names.contains(domain.domain.as_str()) {
                    continue;
                }
                let action = if dry_run {
                    OrphanAction::DryRun
                } else if grace {
                    OrphanAction::Reported
                } else {
                    match driver.destroy(domain, true) {
                        Ok(()) => OrphanAction::Destroyed,
                        Err(err) => {
                            report
                                .errors
                                .push(attribute("driver", &domain.domain, &err));
                            continue;
                        }
                    }
                };
                reporter.report(Event::OrphanDetected {
                    host: host_id.clone(),
                    domain: domain.domain.clone(),
                    action,
                });
                report
                    .orphans
                    .push((host_id.clone(), domain.domain.clone(), action));
            }

            for expected_domain in &expected_here {
                if actual_names.contains(&expected_domain.domain) {
                    continue;
                }
                if !dry_run {
                    self.registry.guest_state(
                        &expected_domain.range,
                        &expected_domain.guest,
                        GuestState::Missing,
                    )?;
                }
                reporter.report(Event::PhantomDetected {
                    range: expected_domain.range.clone(),
                    guest: expected_domain.guest.clone(),
                    host: host_id.clone(),
                });
                report
                    .phantoms
                    .push((expected_domain.range.clone(), expected_domain.guest.clone()));
            }
        }

        Ok(report)
    }
}

#[derive(Default)]
struct DeployAccumulator {
    errors: Vec<AttributedError>,
    generated_passwords: BTreeMap<(String, String), String>,
}

/// Borrowed bundle shared by all deploy workers.
struct SharedDeploy<'a> {
    orchestrator: &'a Orchestrator,
    spec: &'a RangeSpec,
    plan: &'a Plan,
    scheduler: &'a Scheduler,
    results: Mutex<DeployAccumulator>,
}

impl SharedDeploy<'_> {
    fn worker_loop(&self, events: mpsc::Sender<Event>) {
        loop {
            let claim = self
                .scheduler
                .next_ready(&self.orchestrator.cancel);
            let step_id = match claim {
                Claim::Step(step_id) => step_id,
                Claim::Drained => return,
            };

            let kind = &self.plan.step(step_id).kind;
            let outcome = self.execute_step(step_id, kind, &events);
            match outcome {
                Ok(()) => self.scheduler.complete(step_id, StepStatus::Succeeded),
                Err(err) => {
                    self.record_error(kind, &err);
                    self.handle_failure(step_id, kind, err, &events);
                }
            }
        }
    }

    fn record_error(&self, kind: &StepKind, err: &Error) {
        let component = match kind {
            StepKind::CreateNetwork { .. } | StepKind::CloneGuest { .. } => "driver",
            StepKind::PlaceImage { .. } => "distributor",
            StepKind::WaitBoot { .. } => "orchestrator",
            StepKind::RunTask { .. } => "tasks",
            StepKind::FinalizeRange => "orchestrator",
        };
        let resource = match kind {
            StepKind::CreateNetwork { network, .. } => network.clone(),
            StepKind::PlaceImage { image, .. } => image.clone(),
            StepKind::CloneGuest { guest, .. }
            | StepKind::WaitBoot { guest }
            | StepKind::RunTask { guest, .. } => guest.clone(),
            StepKind::FinalizeRange => self.plan.range_id.clone(),
        };
        let mut results = self.results.lock().expect("deploy accumulator poisoned");
        results.errors.push(AttributedError {
            component,
            resource,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn handle_failure(
        &self,
        step_id: usize,
        kind: &StepKind,
        err: Error,
        events: &mpsc::Sender<Event>,
    ) {
        let range_id = &self.spec.range.id;
        let registry = &self.orchestrator.registry;
        let _ = events.send(Event::Message {
            severity: Severity::Error,
            text: format!("{} failed: {err}", kind.describe()),
        });

        match kind {
            StepKind::PlaceImage { .. } => {
                // Guests waiting on this placement can never be created.
                let skipped = self.scheduler.fail_with_downstream(step_id);
                self.mark_skipped_guests(&skipped, GuestState::FailedPreCreate, events);
            }
            StepKind::CloneGuest { guest, host } => {
                // Remove any half-created overlay before reporting.
                if let Ok(host_spec) = self.orchestrator.host_spec(host) {
                    if host_spec.provider == Provider::Kvm {
                        let overlay = host_overlay_path(range_id, guest);
                        let _ = self
                            .orchestrator
                            .distributor
                            .remove_overlay(host_spec, &overlay);
                    }
                }
                let _ = registry.guest_state(range_id, guest, GuestState::FailedCreate);
                let skipped = self.scheduler.fail_with_downstream(step_id);
                self.mark_skipped_tasks(&skipped, events);
            }
            StepKind::WaitBoot { guest } => {
                let _ = registry.guest_state(range_id, guest, GuestState::FailedBoot);
                let skipped = self.scheduler.fail_with_downstream(step_id);
                self.mark_skipped_tasks(&skipped, events);
            }
            StepKind::RunTask { guest, task } => {
                let _ = registry.guest_state(range_id, guest, GuestState::FailedTask);
                // Default policy: remaining tasks on the same guest are
                // skipped, with or without a declared edge; other guests
                // continue.
                let skipped = self
                    .scheduler
                    .fail_task_and_guest(step_id, guest, self.plan);
                self.mark_skipped_tasks(&skipped, events);

                let critical = self
                    .spec
                    .guests
                    .iter()
                    .find(|g| &g.id == guest)
                    .and_then(|g| g.tasks.iter().find(|t| &t.id == task))
                    .map(|t| t.critical_to_range)
                    .unwrap_or(false);
                if critical {
                    self.scheduler.mark_critical_failure();
                    self.orchestrator.cancel.store(true, Ordering::SeqCst);
                }
            }
            StepKind::CreateNetwork { .. } | StepKind::FinalizeRange => {
                let skipped = self.scheduler.fail_with_downstream(step_id);
                self.mark_skipped_guests(&skipped, GuestState::FailedPreCreate, events);
            }
        }
    }

    /// Push terminal states for guests whose CloneGuest step was skipped.
    fn mark_skipped_guests(
        &self,
        skipped: &[usize],
        state: GuestState,
        events: &mpsc::Sender<Event>,
    ) {
        let range_id = &self.spec.range.id;
        for &step_id in skipped {
            match &self.plan.step(step_id).kind {
                StepKind::CloneGuest { guest, .. } => {
                    let _ = self
                        .orchestrator
                        .registry
                        .guest_state(range_id, guest, state);
                }
                StepKind::RunTask { guest, task } => {
                    self.record_task_skip(guest, task, events);
                }
                _ => {}
            }
        }
    }

    fn mark_skipped_tasks(&self, skipped: &[usize], events: &mpsc::Sender<Event>) {
        for &step_id in skipped {
            if let StepKind::RunTask { guest, task } = &self.plan.step(step_id).kind {
                self.record_task_skip(guest, task, events);
            }
        }
    }

    fn record_task_skip(&self, guest: &str, task: &str, events: &mpsc::Sender<Event>) {
        let range_id = &self.spec.range.id;
        if let Some(range) = self.orchestrator.registry.get_range(range_id) {
            if let Some(guest_record) = range.guests.get(guest) {
                if let Some(mut task_record) = guest_record.tasks.get(task).cloned() {
                    task_record.state = TaskState::SkippedUpstreamFailed;
                    let _ = self
                        .orchestrator
                        .registry
                        .update_task(range_id, guest, task_record);
                }
            }
        }
        let _ = events.send(Event::TaskCompleted {
            guest: guest.to_string(),
            task: task.to_string(),
            status: TaskEventStatus::SkippedUpstreamFailed,
            duration_ms: 0,
            detail: Some("upstream step failed".to_string()),
        });
    }

    fn execute_step(
        &self,
        _step_id: usize,
        kind: &StepKind,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        match kind {
            StepKind::CreateNetwork { network, host } => self.exec_create_network(network, host, events),
            StepKind::PlaceImage {
                image,
                fingerprint,
                host,
            } => self.exec_place_image(image, fingerprint, host, events),
            StepKind::CloneGuest { guest, host } => self.exec_clone_guest(guest, host, events),
            StepKind::WaitBoot { guest } => self.exec_wait_boot(guest, events),
            StepKind::RunTask { guest, task } => self.exec_run_task(guest, task, events),
            StepKind::FinalizeRange => self.exec_finalize(),
        }
    }

    fn exec_create_network(
        &self,
        network_id: &str,
        host_id: &str,
        _events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let orchestrator = self.orchestrator;
        let spec = self
            .spec
            .network(network_id)
            .ok_or_else(|| Error::Internal {
                message: format!("plan references unknown network `{network_id}`"),
            })?;
        let driver = orchestrator.drivers.get(host_id)?;
        let definition = NetworkDefinition {
            range_id: self.spec.range.id.clone(),
            network_id: network_id.to_string(),
            bridge_name: spec.bridge_name.clone(),
            subnet: spec.subnet,
            gateway: spec.gateway,
            nat: spec.nat,
        };
        let handle = driver.ensure_network(&definition)?;

        // Host-level forwarding rules ride along with network creation.
        if !spec.forwarding_rules.is_empty() {
            let host = orchestrator.host_spec(host_id)?;
            let target = Target::for_host(host);
            for rule in &spec.forwarding_rules {
                let output = orchestrator.executor.run(
                    &target,
                    &format!("iptables {rule}"),
                    None,
                    orchestrator.context.config.task_timeout,
                )?;
                if !output.success() {
                    return Err(Error::Hypervisor {
                        host: host_id.to_string(),
                        message: format!(
                            "forwarding rule `{rule}` rejected: {}",
                            output.stderr.render()
                        ),
                    });
                }
            }
        }

        // Persist whether destruction owns this bridge.
        let range_id = &self.spec.range.id;
        if let Some(range) = orchestrator.registry.get_range(range_id) {
            if let Some(mut record) = range.networks.get(network_id).cloned() {
                record.created_by_range = handle.created;
                orchestrator.registry.update_network(range_id, record)?;
            }
        }
        Ok(())
    }

    fn exec_place_image(
        &self,
        image_id: &str,
        fingerprint: &str,
        host_id: &str,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let orchestrator = self.orchestrator;
        let image = self
            .spec
            .base_image(image_id)
            .ok_or_else(|| Error::Internal {
                message: format!("plan references unknown base image `{image_id}`"),
            })?;
        let host = orchestrator.host_spec(host_id)?;

        if orchestrator
            .registry
            .image_on_host(fingerprint, host_id)
            .is_none()
        {
            let bytes = match &image.source {
                crate::config::ImageSource::Controller(path) => {
                    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
                }
                crate::config::ImageSource::Host { .. } => orchestrator
                    .registry
                    .image_seeds(fingerprint)
                    .first()
                    .map(|record| record.size_bytes)
                    .unwrap_or(0),
            };
            let _ = events.send(Event::ImageTransferStarted {
                fingerprint: fingerprint.to_string(),
                host: host_id.to_string(),
                bytes,
            });
        }

        let outcome = orchestrator
            .distributor
            .place_on_host(image, fingerprint, host)?;
        if outcome.retried {
            let _ = events.send(Event::ImageVerificationFailed {
                fingerprint: fingerprint.to_string(),
                host: host_id.to_string(),
                observed: "<mismatch>".to_string(),
                will_retry: true,
            });
        }
        let _ = events.send(Event::ImagePlaced {
            fingerprint: fingerprint.to_string(),
            host: host_id.to_string(),
            path: outcome.record.path.clone(),
            already_present: outcome.already_present,
        });
        Ok(())
    }

    fn exec_clone_guest(
        &self,
        guest_id: &str,
        host_id: &str,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let orchestrator = self.orchestrator;
        let range_id = &self.spec.range.id;
        let guest_spec = self
            .spec
            .guests
            .iter()
            .find(|g| g.id == guest_id)
            .ok_or_else(|| Error::Internal {
                message: format!("plan references unknown guest `{guest_id}`"),
            })?;
        let host = orchestrator.host_spec(host_id)?;
        let driver = orchestrator.drivers.get(host_id)?;

        let range = orchestrator
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.clone(),
            })?;
        let mut guest_record = range
            .guests
            .get(guest_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("guest `{guest_id}` missing from registry"),
            })?;

        let overlay = host_overlay_path(range_id, guest_id);

        // Write-ahead: the journal knows about the domain before the
        // hypervisor does, so a crash can only over-report.
        guest_record.state = GuestState::Cloning;
        guest_record.overlay_path =
            (host.provider == Provider::Kvm).then(|| overlay.clone());
        orchestrator
            .registry
            .update_guest(range_id, guest_record.clone())?;

        if host.provider == Provider::Kvm {
            orchestrator.distributor.create_overlay(
                host,
                &guest_record.base_fingerprint,
                &overlay,
                guest_spec.resources.disk_mib,
                orchestrator.context.config.clone_timeout,
            )?;
            orchestrator.write_overlay_inventory(range_id, guest_id, host_id, &overlay)?;
            let _ = events.send(Event::OverlayCreated {
                guest: guest_id.to_string(),
                host: host_id.to_string(),
                overlay_path: overlay.clone(),
            });
        }

        let nics = guest_spec
            .nics
            .iter()
            .map(|nic| {
                let bridge = self
                    .spec
                    .network(&nic.network)
                    .map(|n| n.bridge_name.clone())
                    .unwrap_or_else(|| nic.network.clone());
                DomainNic {
                    bridge_name: bridge,
                    mac: nic.mac.clone(),
                }
            })
            .collect();

        let definition = DomainDefinition {
            range_id: range_id.clone(),
            guest_id: guest_id.to_string(),
            domain_name: guest_record.domain.clone(),
            vcpu: guest_spec.resources.vcpu,
            mem_mib: guest_spec.resources.mem_mib,
            base_fingerprint: guest_record.base_fingerprint.clone(),
            overlay_path: overlay.clone(),
            nics,
        };
        let handle = driver.clone_guest(&definition)?;
        driver.start(&handle)?;

        guest_record.state = GuestState::Booting;
        guest_record.power = PowerState::Running;
        orchestrator
            .registry
            .update_guest(range_id, guest_record)?;
        let _ = events.send(Event::GuestCloned {
            guest: guest_id.to_string(),
            host: host_id.to_string(),
            domain: definition.domain_name.clone(),
        });
        Ok(())
    }

    fn exec_wait_boot(&self, guest_id: &str, events: &mpsc::Sender<Event>) -> Result<()> {
        let orchestrator = self.orchestrator;
        let range_id = &self.spec.range.id;
        let started = Instant::now();
        let budget = orchestrator.context.config.boot_timeout;

        let range = orchestrator
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.clone(),
            })?;
        let mut guest_record = range
            .guests
            .get(guest_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("guest `{guest_id}` missing from registry"),
            })?;
        let host = orchestrator.host_spec(&guest_record.host)?;
        let driver = orchestrator.drivers.get(&guest_record.host)?;
        let handle = GuestHandle {
            host: guest_record.host.clone(),
            domain: guest_record.domain.clone(),
            range_id: Some(range_id.clone()),
            guest_id: Some(guest_id.to_string()),
            overlay_path: guest_record.overlay_path.clone(),
        };

        loop {
            if started.elapsed() >= budget {
                return Err(Error::Timeout {
                    operation: format!("wait-boot {guest_id}"),
                    budget,
                });
            }

            let observation = driver.observe(&handle)?;
            let mut address = observation.leased_ips.first().cloned();
            if address.is_none() {
                address = guest_record
                    .nics
                    .iter()
                    .find_map(|nic| nic.expected_ip.clone());
            }

            if matches!(observation.power, PowerState::Running) {
                if let Some(address) = address {
                    // The driver's own probe (guest agent, provider
                    // reachability) is authoritative; an SSH health check
                    // covers drivers that cannot observe the guest.
                    let reachable = observation.agent_reachable || {
                        let target = Target::for_guest(guest_id, &address, host);
                        orchestrator.executor.health_check(&target).is_ok()
                    };
                    if reachable {
                        for (nic, observed) in guest_record
                            .nics
                            .iter_mut()
                            .zip(observation.leased_ips.iter())
                        {
                            nic.observed_ip = Some(observed.clone());
                        }
                        if guest_record.nics.iter().all(|n| n.observed_ip.is_none()) {
                            if let Some(first) = guest_record.nics.first_mut() {
                                first.observed_ip = Some(address.clone());
                            }
                        }
                        guest_record.boot_ready = true;
                        guest_record.power = PowerState::Running;
                        guest_record.state = GuestState::Ready;
                        orchestrator
                            .registry
                            .update_guest(range_id, guest_record.clone())?;
                        let _ = events.send(Event::BootReady {
                            guest: guest_id.to_string(),
                            leased_ips: observation.leased_ips.clone(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                        return Ok(());
                    }
                }
            }
            thread::sleep(BOOT_POLL_INTERVAL);
        }
    }

    /// Guests that came through with every task succeeded (or none
    /// declared) graduate from `Ready` to `Active`.
    fn exec_finalize(&self) -> Result<()> {
        let range_id = &self.spec.range.id;
        let Some(range) = self.orchestrator.registry.get_range(range_id) else {
            return Ok(());
        };
        for guest in range.guests.values() {
            if guest.state == GuestState::Ready {
                self.orchestrator
                    .registry
                    .guest_state(range_id, &guest.id, GuestState::Active)?;
            }
        }
        Ok(())
    }

    fn exec_run_task(
        &self,
        guest_id: &str,
        task_id: &str,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let orchestrator = self.orchestrator;
        let range_id = &self.spec.range.id;
        let guest_spec = self
            .spec
            .guests
            .iter()
            .find(|g| g.id == guest_id)
            .ok_or_else(|| Error::Internal {
                message: format!("plan references unknown guest `{guest_id}`"),
            })?;
        let task_spec = guest_spec
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::Internal {
                message: format!("plan references unknown task `{task_id}`"),
            })?;

        // Emulation pre-check happens here, before anything reaches the
        // guest.
        if let TaskKind::EmulateAttack { target, .. } = &task_spec.kind {
            ensure_target_contained(target, &self.spec.subnets())?;
        }

        let range = orchestrator
            .registry
            .get_range(range_id)
            .ok_or_else(|| Error::UnknownRange {
                range: range_id.clone(),
            })?;
        let guest_record = range
            .guests
            .get(guest_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("guest `{guest_id}` missing from registry"),
            })?;
        let address = guest_record
            .nics
            .iter()
            .find_map(|nic| nic.observed_ip.clone().or_else(|| nic.expected_ip.clone()))
            .ok_or_else(|| Error::Internal {
                message: format!("guest `{guest_id}` reached task stage with no address"),
            })?;
        let host = orchestrator.host_spec(&guest_record.host)?;
        let target = Target::for_guest(guest_id, &address, host);

        let mut task_record = guest_record
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("task `{task_id}` missing from registry"),
            })?;
        task_record.state = TaskState::Running;
        task_record.attempts += 1;
        orchestrator
            .registry
            .update_task(range_id, guest_id, task_record.clone())?;
        let _ = events.send(Event::TaskStarted {
            guest: guest_id.to_string(),
            task: task_id.to_string(),
            kind: task_spec.kind.label(),
            attempt: task_record.attempts,
        });

        let artifacts_dir = orchestrator
            .context
            .range_dir(range_id)
            .join("artifacts");
        let subnets = self.spec.subnets();
        let task_context = TaskContext {
            executor: &orchestrator.executor,
            target: &target,
            timeout: orchestrator.context.config.task_timeout,
            artifacts_dir: &artifacts_dir,
            range_subnets: &subnets,
        };
        let report = apply_task(&task_spec.kind, &task_context)?;

        task_record.state = if report.success {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        task_record.detail = Some(report.captured_output.clone());
        task_record.artifacts = report.artifacts.clone();
        orchestrator
            .registry
            .update_task(range_id, guest_id, task_record)?;

        let _ = events.send(Event::TaskCompleted {
            guest: guest_id.to_string(),
            task: task_id.to_string(),
            status: if report.success {
                TaskEventStatus::Succeeded
            } else {
                TaskEventStatus::Failed
            },
            duration_ms: report.duration.as_millis() as u64,
            detail: if report.captured_output.is_empty() {
                None
            } else {
                Some(report.captured_output.clone())
            },
        });

        if let Some(password) = report.generated_password {
            let mut results = self.results.lock().expect("deploy accumulator poisoned");
            results
                .generated_passwords
                .insert((guest_id.to_string(), task_id.to_string()), password);
        }

        if report.success {
            Ok(())
        } else {
            Err(Error::TaskFailed {
                guest: guest_id.to_string(),
                task: task_id.to_string(),
                message: report.captured_output,
            })
        }
    }
}

fn attribute(component: &'static str, resource: &str, err: &Error) -> AttributedError {
    AttributedError {
        component,
        resource: resource.to_string(),
        kind: err.kind(),
        message: err.to_string(),
    }
}

enum Claim {
    Step(usize),
    Drained,
}

/// Ready-frontier scheduler: a Mutex/Condvar pair over step states plus
/// the per-kind in-flight counters that implement the step semaphores
/// (clones per host, transfer streams, one task at a time per guest).
struct Scheduler {
    state: Mutex<SchedState>,
    cv: Condvar,
    /// Semaphore class per step, derived from the plan at construction.
    resources: Vec<StepResource>,
    /// Steps exempt from upstream-failure skipping: FinalizeRange only
    /// observes whatever completed.
    exempt: HashSet<usize>,
    clone_caps: HashMap<String, usize>,
    transfer_cap: usize,
    transfer_cap_per_host: usize,
}

struct SchedState {
    status: Vec<StepStatus>,
    indegree: Vec<usize>,
    successors: Vec<Vec<usize>>,
    clones_in_flight: HashMap<String, usize>,
    transfers_in_flight: usize,
    transfers_per_host: HashMap<String, usize>,
    busy_guests: HashSet<String>,
    critical_failure: bool,
}

#[derive(Clone)]
enum StepResource {
    Clone(String),
    Transfer(String),
    GuestTask(String),
    Free,
}

impl Scheduler {
    fn new(plan: &Plan, context: &CoreContext, hosts: &[HostSpec]) -> Self {
        let mut indegree = vec![0usize; plan.steps.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];
        for step in &plan.steps {
            for &dep in &step.deps {
                indegree[step.id] += 1;
                successors[dep].push(step.id);
            }
        }
        let resources = plan
            .steps
            .iter()
            .map(|step| match &step.kind {
                StepKind::CloneGuest { host, .. } => StepResource::Clone(host.clone()),
                StepKind::PlaceImage { host, .. } => StepResource::Transfer(host.clone()),
                StepKind::RunTask { guest, .. } => StepResource::GuestTask(guest.clone()),
                _ => StepResource::Free,
            })
            .collect();
        let exempt = plan
            .steps
            .iter()
            .filter(|step| matches!(step.kind, StepKind::FinalizeRange))
            .map(|step| step.id)
            .collect();
        // Clones are disk-bound (overlay creation rides inside the clone
        // step), so the per-host cap is the smaller of the host's clone
        // budget and the overlay worker pool.
        let overlay_workers = context.config.overlay_workers.max(1);
        let clone_caps = hosts
            .iter()
            .map(|host| (host.id.clone(), (host.capacity as usize).min(overlay_workers)))
            .collect();
        Self {
            state: Mutex::new(SchedState {
                status: vec![StepStatus::Pending; plan.steps.len()],
                indegree,
                successors,
                clones_in_flight: HashMap::new(),
                transfers_in_flight: 0,
                transfers_per_host: HashMap::new(),
                busy_guests: HashSet::new(),
                critical_failure: false,
            }),
            cv: Condvar::new(),
            resources,
            exempt,
            clone_caps,
            transfer_cap: context.config.transfer_streams,
            transfer_cap_per_host: context.config.transfer_streams_per_host,
        }
    }

    /// Block until a runnable step exists (dependencies terminal,
    /// semaphore slots free), claiming it, or until the plan drains.
    /// Cancellation refuses pending steps and lets in-flight ones finish.
    fn next_ready(&self, cancel: &AtomicBool) -> Claim {
        let mut state = self.state.lock().expect("scheduler poisoned");
        loop {
            if cancel.load(Ordering::SeqCst) {
                for status in state.status.iter_mut() {
                    if *status == StepStatus::Pending {
                        *status = StepStatus::Cancelled;
                    }
                }
                self.cv.notify_all();
            }

            if state.status.iter().all(|s| s.is_terminal()) {
                return Claim::Drained;
            }

            let plan_len = state.status.len();
            let mut claimed = None;
            for step_id in 0..plan_len {
                if state.status[step_id] != StepStatus::Pending
                    || state.indegree[step_id] != 0
                {
                    continue;
                }
                if self.try_reserve(&mut state, step_id) {
                    claimed = Some(step_id);
                    break;
                }
            }

            if let Some(step_id) = claimed {
                state.status[step_id] = StepStatus::Running;
                return Claim::Step(step_id);
            }

            // Nothing runnable: everything pending is blocked on a
            // semaphore held by a running step or on an unfinished
            // predecessor. Completions wake us.
            state = self.cv.wait(state).expect("scheduler poisoned");
        }
    }

    /// Check and charge the semaphore guarding `step_id`. Caller holds
    /// the scheduler lock. Symmetric with `release`.
    fn try_reserve(&self, state: &mut SchedState, step_id: usize) -> bool {
        match &self.resources[step_id] {
            StepResource::Clone(host) => {
                let cap = self.clone_caps.get(host).copied().unwrap_or(1);
                let in_flight = state.clones_in_flight.entry(host.clone()).or_insert(0);
                if *in_flight >= cap {
                    return false;
                }
                *in_flight += 1;
                true
            }
            StepResource::Transfer(host) => {
                if state.transfers_in_flight >= self.transfer_cap {
                    return false;
                }
                let per_host = state.transfers_per_host.entry(host.clone()).or_insert(0);
                if *per_host >= self.transfer_cap_per_host {
                    return false;
                }
                *per_host += 1;
                state.transfers_in_flight += 1;
                true
            }
            StepResource::GuestTask(guest) => state.busy_guests.insert(guest.clone()),
            StepResource::Free => true,
        }
    }

    fn release(&self, state: &mut SchedState, step_id: usize) {
        match &self.resources[step_id] {
            StepResource::Clone(host) => {
                if let Some(in_flight) = state.clones_in_flight.get_mut(host) {
                    *in_flight = in_flight.saturating_sub(1);
                }
            }
            StepResource::Transfer(host) => {
                state.transfers_in_flight = state.transfers_in_flight.saturating_sub(1);
                if let Some(per_host) = state.transfers_per_host.get_mut(host) {
                    *per_host = per_host.saturating_sub(1);
                }
            }
            StepResource::GuestTask(guest) => {
                state.busy_guests.remove(guest);
            }
            StepResource::Free => {}
        }
    }

    /// Every edge (dep → successor) decrements the successor's indegree
    /// exactly once, when the dep turns terminal. A successor whose dep
    /// failed has already been marked skipped; draining its indegree just
    /// lets the frontier bookkeeping converge.
    fn propagate_terminal(state: &mut SchedState, step_id: usize) {
        let successors = state.successors[step_id].clone();
        for next in successors {
            state.indegree[next] = state.indegree[next].saturating_sub(1);
        }
    }

    fn complete(&self, step_id: usize, status: StepStatus) {
        let mut state = self.state.lock().expect("scheduler poisoned");
        self.release(&mut state, step_id);
        state.status[step_id] = status;
        Self::propagate_terminal(&mut state, step_id);
        self.cv.notify_all();
    }

    /// Mark a step failed and everything transitively downstream of it
    /// skipped (FinalizeRange excepted). Returns the skipped step ids.
    fn fail_with_downstream(&self, step_id: usize) -> Vec<usize> {
        let mut state = self.state.lock().expect("scheduler poisoned");
        self.release(&mut state, step_id);
        state.status[step_id] = StepStatus::Failed;
        Self::propagate_terminal(&mut state, step_id);
        let skipped = self.skip_transitive(&mut state, vec![step_id]);
        self.cv.notify_all();
        skipped
    }

    /// Task-failure policy: fail the step, skip its transitive
    /// dependents, and additionally skip every still-pending task step on
    /// the same guest even without a declared edge. Other guests keep
    /// going.
    fn fail_task_and_guest(&self, step_id: usize, guest: &str, plan: &Plan) -> Vec<usize> {
        let mut state = self.state.lock().expect("scheduler poisoned");
        self.release(&mut state, step_id);
        state.status[step_id] = StepStatus::Failed;
        Self::propagate_terminal(&mut state, step_id);

        let mut roots = vec![step_id];
        let mut skipped = Vec::new();
        for step in &plan.steps {
            if let StepKind::RunTask { guest: g, .. } = &step.kind {
                if g == guest
                    && step.id != step_id
                    && state.status[step.id] == StepStatus::Pending
                {
                    state.status[step.id] = StepStatus::SkippedUpstreamFailed;
                    Self::propagate_terminal(&mut state, step.id);
                    skipped.push(step.id);
                    roots.push(step.id);
                }
            }
        }
        skipped.extend(self.skip_transitive(&mut state, roots));
        skipped.sort_unstable();
        skipped.dedup();
        self.cv.notify_all();
        skipped
    }

    fn skip_transitive(&self, state: &mut SchedState, roots: Vec<usize>) -> Vec<usize> {
        let mut stack = roots;
        let mut skipped = Vec::new();
        while let Some(current) = stack.pop() {
            let successors = state.successors[current].clone();
            for next in successors {
                if self.exempt.contains(&next) {
                    continue;
                }
                if state.status[next] == StepStatus::Pending {
                    state.status[next] = StepStatus::SkippedUpstreamFailed;
                    Self::propagate_terminal(state, next);
                    skipped.push(next);
                    stack.push(next);
                }
            }
        }
        skipped
    }

    fn mark_critical_failure(&self) {
        let mut state = self.state.lock().expect("scheduler poisoned");
        state.critical_failure = true;
        self.cv.notify_all();
    }

    fn critical_failure(&self) -> bool {
        self.state
            .lock()
            .expect("scheduler poisoned")
            .critical_failure
    }

    fn statuses(&self) -> Vec<StepStatus> {
        self.state.lock().expect("scheduler poisoned").status.clone()
    }
}
