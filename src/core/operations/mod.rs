use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

mod cleanup;

use crate::config::{AuthRef, HostSpec, RangeSpec, load_range_spec};
use crate::error::{Error, Result};

use super::context::{CheckOutcome, CoreConfig, CoreContext, check_controller_disk, default_state_root};
use super::diagnostics::{Diagnostic, Severity};
use super::distributor::{ImageDistributor, compute_fingerprint};
use super::driver::DriverSet;
use super::events::{Event, Reporter};
use super::executor::{ExecutorConfig, RemoteExecutor};
use super::model::{GuestState, HostRecord, RangeRecord, RangeState};
use super::options::{CreateOptions, DestroyOptions, ListOptions, StatusOptions};
use super::orchestrator::Orchestrator;
use super::outcome::{
    CreateOutcome, CredentialRow, DestroyOutcome, EntityError, GuestRow, ListOutcome,
    OperationOutput, OperationResult, RangeSummary, StatusOutcome, TaskRow,
};
use super::planner::{HostInventory, emit_plan, persist_plan};
use super::registry::Registry;

pub use cleanup::cleanup;

/// Materialize a range description: validate, plan, distribute images,
/// clone guests, run instantiation tasks, and record everything in the
/// registry. With `plan_only` the plan is rendered and nothing else
/// happens.
pub fn create(
    options: CreateOptions,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<CreateOutcome> {
    let mut reporter = ReporterProxy::new(reporter);

    let spec = load_range_spec(options.spec.path())?;
    let state_root = options
        .state_root
        .clone()
        .or_else(|| spec.controller.state_root.clone())
        .unwrap_or_else(default_state_root);
    let config = CoreConfig::with_overrides(&spec.controller);
    let context = CoreContext::prepare(state_root, config)?;

    process_check(
        check_controller_disk(&spec, &context),
        options.force,
        &mut reporter,
        "Controller preflight failed:",
        "Pass --force to proceed anyway.",
    )?;

    let executor = Arc::new(RemoteExecutor::new(ExecutorConfig::default()));

    if options.plan_only {
        let fingerprints = fingerprint_all(&spec, &executor)?;
        let inventory = HostInventory::from_spec(&spec);
        let plan = emit_plan(&spec, &fingerprints, &inventory)?;
        reporter.emit(Event::PlanEmitted {
            range: spec.range.id.clone(),
            steps: plan.steps.len(),
            plan_path: None,
        });
        reporter.emit(Event::Message {
            severity: Severity::Info,
            text: "Plan mode only – nothing was created.".to_string(),
        });
        let guests = spec
            .guests
            .iter()
            .map(|guest| GuestRow {
                id: guest.id.clone(),
                host: guest.host.clone().unwrap_or_else(|| "<auto>".to_string()),
                state: GuestState::Pending,
                addresses: Vec::new(),
                boot_ready: false,
                tasks: guest
                    .tasks
                    .iter()
                    .map(|task| TaskRow {
                        id: task.id.clone(),
                        kind: task.kind.label().to_string(),
                        state: super::model::TaskState::Pending,
                        detail: None,
                        artifacts: Vec::new(),
                    })
                    .collect(),
            })
            .collect();
        let (diagnostics, events) = reporter.into_parts();
        return Ok(OperationOutput::new(CreateOutcome {
            range_id: spec.range.id.clone(),
            state: RangeState::Planned,
            plan_steps: plan.steps.len(),
            plan_path: None,
            plan_only: true,
            guests,
            credentials: Vec::new(),
            errors: Vec::new(),
        })
        .with_diagnostics(diagnostics)
        .with_events(events));
    }

    let opened = Registry::open(&context.state_root)?;
    reporter.absorb(opened.diagnostics);
    let registry = Arc::new(opened.registry);

    if registry.get_range(&spec.range.id).is_some_and(|r| !r.state.is_terminal()) {
        return Err(Error::Validation {
            message: format!(
                "range `{}` already exists and is not destroyed; destroy it first or pick another id",
                spec.range.id
            ),
        });
    }

    for host in &spec.hosts {
        registry.record_host(host_record(host))?;
    }

    let distributor = Arc::new(ImageDistributor::new(
        executor.clone(),
        registry.clone(),
        spec.hosts.clone(),
        context.staging_dir.clone(),
        context.config.transfer_timeout,
    ));

    let mut fingerprints = BTreeMap::new();
    for image in &spec.base_images {
        if spec.guests.iter().any(|g| g.base_image == image.id) {
            let (fingerprint, _) = distributor.fingerprint_source(image)?;
            fingerprints.insert(image.id.clone(), fingerprint);
        }
    }

    let inventory = HostInventory::from_spec(&spec);
    let plan = emit_plan(&spec, &fingerprints, &inventory)?;
    let plan_path = context.plan_path(&spec.range.id);
    persist_plan(&plan, &plan_path)?;
    reporter.emit(Event::PlanEmitted {
        range: spec.range.id.clone(),
        steps: plan.steps.len(),
        plan_path: Some(plan_path.clone()),
    });

    let drivers = DriverSet::for_hosts(&spec.hosts, executor.clone(), context.staging_dir.clone())?;
    let orchestrator = Orchestrator::new(
        context.clone(),
        registry.clone(),
        executor,
        distributor,
        drivers,
        spec.hosts.clone(),
    );

    orchestrator.register_range(&spec, &plan)?;
    let report = orchestrator.deploy(&spec, &plan, &mut reporter)?;

    let record = registry
        .get_range(&spec.range.id)
        .ok_or_else(|| Error::UnknownRange {
            range: spec.range.id.clone(),
        })?;
    let credentials = report
        .generated_passwords
        .iter()
        .map(|((guest, task), password)| CredentialRow {
            guest: guest.clone(),
            task: task.clone(),
            password: password.clone(),
        })
        .collect();

    registry.compact()?;

    let (diagnostics, events) = reporter.into_parts();
    Ok(OperationOutput::new(CreateOutcome {
        range_id: spec.range.id.clone(),
        state: report.range_state,
        plan_steps: plan.steps.len(),
        plan_path: Some(plan_path),
        plan_only: false,
        guests: guest_rows(&record),
        credentials,
        errors: report.errors.into_iter().map(EntityError::from).collect(),
    })
    .with_diagnostics(diagnostics)
    .with_events(events))
}

/// Destroy a range and everything it owns. Idempotent: destroying a
/// `Destroyed` range succeeds without touching any host.
pub fn destroy(
    options: DestroyOptions,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<DestroyOutcome> {
    let mut reporter = ReporterProxy::new(reporter);

    let state_root = options.state_root.clone().unwrap_or_else(default_state_root);
    let context = CoreContext::prepare(state_root, CoreConfig::default())?;
    let opened = Registry::open(&context.state_root)?;
    reporter.absorb(opened.diagnostics);
    let registry = Arc::new(opened.registry);

    let record = registry
        .get_range(&options.range_id)
        .ok_or_else(|| Error::UnknownRange {
            range: options.range_id.clone(),
        })?;

    let hosts = hosts_for_range(&registry, &record)?;
    let executor = Arc::new(RemoteExecutor::new(ExecutorConfig::default()));
    let distributor = Arc::new(ImageDistributor::new(
        executor.clone(),
        registry.clone(),
        hosts.clone(),
        context.staging_dir.clone(),
        context.config.transfer_timeout,
    ));
    let drivers = DriverSet::for_hosts(&hosts, executor.clone(), context.staging_dir.clone())?;
    let orchestrator = Orchestrator::new(
        context.clone(),
        registry.clone(),
        executor,
        distributor,
        drivers,
        hosts,
    );

    let errors = orchestrator.destroy_range(&options.range_id, &mut reporter)?;

    let mut purged = false;
    if options.purge && errors.is_empty() {
        let range_dir = context.range_dir(&options.range_id);
        if range_dir.exists() {
            let bytes = directory_size(&range_dir);
            std::fs::remove_dir_all(&range_dir).map_err(|source| Error::WriteState {
                path: range_dir.clone(),
                source,
            })?;
            reporter.emit(Event::CleanupProgress {
                path: range_dir,
                kind: super::events::CleanupKind::RegistryRow,
                bytes,
                dry_run: false,
            });
        }
        registry.remove_range(&options.range_id)?;
        purged = true;
    }

    let state = registry
        .get_range(&options.range_id)
        .map(|r| r.state)
        .unwrap_or(RangeState::Destroyed);
    registry.compact()?;

    let (diagnostics, events) = reporter.into_parts();
    Ok(OperationOutput::new(DestroyOutcome {
        range_id: options.range_id.clone(),
        state,
        purged,
        errors: errors.into_iter().map(EntityError::from).collect(),
    })
    .with_diagnostics(diagnostics)
    .with_events(events))
}

/// Snapshot-consistent view of one range from the registry.
pub fn status(
    options: StatusOptions,
    _reporter: Option<&mut dyn Reporter>,
) -> OperationResult<StatusOutcome> {
    let mut diagnostics = Vec::new();
    let state_root = options.state_root.clone().unwrap_or_else(default_state_root);
    let context = CoreContext::prepare(state_root, CoreConfig::default())?;
    let opened = Registry::open(&context.state_root)?;
    diagnostics.extend(opened.diagnostics);

    let record = opened
        .registry
        .get_range(&options.range_id)
        .ok_or_else(|| Error::UnknownRange {
            range: options.range_id.clone(),
        })?;

    Ok(OperationOutput::new(StatusOutcome {
        summary: summarize(&record),
        guests: guest_rows(&record),
    })
    .with_diagnostics(diagnostics))
}

/// All ranges the registry knows, newest first.
pub fn list(
    options: ListOptions,
    _reporter: Option<&mut dyn Reporter>,
) -> OperationResult<ListOutcome> {
    let mut diagnostics = Vec::new();
    let state_root = options.state_root.clone().unwrap_or_else(default_state_root);
    let context = CoreContext::prepare(state_root, CoreConfig::default())?;
    let opened = Registry::open(&context.state_root)?;
    diagnostics.extend(opened.diagnostics);

    let mut ranges: Vec<RangeSummary> = opened
        .registry
        .list_ranges()
        .iter()
        .map(summarize)
        .collect();
    ranges.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(OperationOutput::new(ListOutcome { ranges }).with_diagnostics(diagnostics))
}

pub(super) fn host_record(host: &HostSpec) -> HostRecord {
    HostRecord {
        id: host.id.clone(),
        address: host.address.clone(),
        port: host.port,
        user: host.user.clone(),
        auth: host.auth.describe(),
        provider: host.provider,
        capacity: host.capacity,
    }
}

pub(super) fn host_spec_from_record(record: &HostRecord) -> Result<HostSpec> {
    let auth = AuthRef::parse(&record.auth).map_err(|message| Error::Internal {
        message: format!("registry host `{}` has unusable auth: {message}", record.id),
    })?;
    Ok(HostSpec {
        id: record.id.clone(),
        address: record.address.clone(),
        port: record.port,
        user: record.user.clone(),
        auth,
        provider: record.provider,
        capacity: record.capacity,
    })
}

/// Hosts a recorded range touches, rebuilt from the registry inventory.
pub(super) fn hosts_for_range(
    registry: &Registry,
    record: &RangeRecord,
) -> Result<Vec<HostSpec>> {
    let inventory = registry.hosts();
    let mut hosts = Vec::new();
    for host_id in &record.hosts {
        let host = inventory
            .iter()
            .find(|h| &h.id == host_id)
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "range `{}` references host `{host_id}` absent from the registry inventory",
                    record.id
                ),
            })?;
        hosts.push(host_spec_from_record(host)?);
    }
    Ok(hosts)
}

pub(super) fn guest_rows(record: &RangeRecord) -> Vec<GuestRow> {
    record
        .guests
        .values()
        .map(|guest| GuestRow {
            id: guest.id.clone(),
            host: guest.host.clone(),
            state: guest.state,
            addresses: guest
                .nics
                .iter()
                .filter_map(|nic| nic.observed_ip.clone().or_else(|| nic.expected_ip.clone()))
                .collect(),
            boot_ready: guest.boot_ready,
            tasks: guest
                .tasks
                .values()
                .map(|task| TaskRow {
                    id: task.id.clone(),
                    kind: task.kind.clone(),
                    state: task.state,
                    detail: task.detail.clone(),
                    artifacts: task.artifacts.clone(),
                })
                .collect(),
        })
        .collect()
}

pub(super) fn summarize(record: &RangeRecord) -> RangeSummary {
    let guest_active = record
        .guests
        .values()
        .filter(|g| matches!(g.state, GuestState::Active | GuestState::Ready))
        .count();
    let guest_failed = record
        .guests
        .values()
        .filter(|g| {
            matches!(
                g.state,
                GuestState::FailedPreCreate
                    | GuestState::FailedCreate
                    | GuestState::FailedBoot
                    | GuestState::FailedTask
                    | GuestState::Missing
            )
        })
        .count();
    RangeSummary {
        id: record.id.clone(),
        name: record.name.clone(),
        owner: record.owner.clone(),
        state: record.state,
        created_at: record.created_at.clone(),
        guest_total: record.guests.len(),
        guest_active,
        guest_failed,
    }
}

fn fingerprint_all(
    spec: &RangeSpec,
    executor: &RemoteExecutor,
) -> Result<BTreeMap<String, String>> {
    let mut fingerprints = BTreeMap::new();
    for image in &spec.base_images {
        if spec.guests.iter().any(|g| g.base_image == image.id) {
            let (fingerprint, _) = compute_fingerprint(executor, image, &spec.hosts)?;
            fingerprints.insert(image.id.clone(), fingerprint);
        }
    }
    Ok(fingerprints)
}

fn directory_size(path: &PathBuf) -> u64 {
    fn walk(path: &std::path::Path) -> u64 {
        let mut total = 0;
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    total += walk(&entry_path);
                } else if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        total
    }
    walk(path)
}

fn process_check(
    outcome: CheckOutcome,
    force: bool,
    reporter: &mut ReporterProxy<'_>,
    header: &str,
    override_hint: &str,
) -> Result<()> {
    let CheckOutcome { warnings, failures } = outcome;
    reporter.absorb(warnings);
    if failures.is_empty() {
        return Ok(());
    }

    if force {
        for failure in failures {
            reporter.warn(Diagnostic::controller(
                Severity::Warning,
                format!("{failure} (continuing due to --force)."),
            ));
        }
        Ok(())
    } else {
        let bullet_list = failures
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(Error::PreflightFailed {
            message: format!("{header}\n{bullet_list}\n{override_hint}"),
        })
    }
}

/// Accumulates the event and diagnostic streams for the outcome envelope
/// while forwarding both live to the caller's [`Reporter`], when one was
/// provided.
pub(super) struct ReporterProxy<'a> {
    delegate: Option<&'a mut dyn Reporter>,
    events: Vec<Event>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> ReporterProxy<'a> {
    pub(super) fn new(delegate: Option<&'a mut dyn Reporter>) -> Self {
        Self {
            delegate,
            events: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub(super) fn emit(&mut self, event: Event) {
        if let Some(reporter) = &mut self.delegate {
            reporter.report(event.clone());
        }
        self.events.push(event);
    }

    /// Raise a diagnostic: streamed to the delegate immediately, kept for
    /// the envelope.
    pub(super) fn warn(&mut self, diagnostic: Diagnostic) {
        if let Some(reporter) = &mut self.delegate {
            reporter.diagnostic(&diagnostic);
        }
        self.diagnostics.push(diagnostic);
    }

    /// Fold in diagnostics produced by a sub-step (registry recovery,
    /// preflight checks), streaming each.
    pub(super) fn absorb(&mut self, diagnostics: Vec<Diagnostic>) {
        for diagnostic in diagnostics {
            self.warn(diagnostic);
        }
    }

    pub(super) fn into_parts(self) -> (Vec<Diagnostic>, Vec<Event>) {
        (self.diagnostics, self.events)
    }
}

impl Reporter for ReporterProxy<'_> {
    fn report(&mut self, event: Event) {
        self.emit(event);
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.warn(diagnostic.clone());
    }
}
