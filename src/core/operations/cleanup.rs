use std::fs;
use std::sync::Arc;

use crate::error::{Error, Result};

use crate::core::context::{CoreConfig, CoreContext, default_state_root};
use crate::core::diagnostics::{Diagnostic, Scope, Severity};
use crate::core::distributor::ImageDistributor;
use crate::core::driver::DriverSet;
use crate::core::events::{CleanupKind, Event, Reporter};
use crate::core::executor::{ExecutorConfig, RemoteExecutor};
use crate::core::model::RangeState;
use crate::core::options::CleanupOptions;
use crate::core::orchestrator::Orchestrator;
use crate::core::outcome::{CleanupOutcome, EntityError, OperationOutput, OperationResult};
use crate::core::registry::Registry;

use super::{ReporterProxy, host_spec_from_record};

/// Reconcile registry against hypervisor reality and collect residue:
/// destroy orphaned domains (unless `grace`), mark phantoms, tear down
/// ranges stranded mid-deploy by a dead controller, and sweep stale
/// staging files.
pub fn cleanup(
    options: CleanupOptions,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<CleanupOutcome> {
    let mut reporter = ReporterProxy::new(reporter);

    let state_root = options.state_root.clone().unwrap_or_else(default_state_root);
    let context = CoreContext::prepare(state_root, CoreConfig::default())?;
    let opened = Registry::open(&context.state_root)?;
    reporter.absorb(opened.diagnostics);
    let registry = Arc::new(opened.registry);

    let hosts: Vec<_> = registry
        .hosts()
        .iter()
        .map(host_spec_from_record)
        .collect::<Result<_>>()?;

    let mut outcome = CleanupOutcome {
        dry_run: options.dry_run,
        ..CleanupOutcome::default()
    };

    if hosts.is_empty() {
        reporter.warn(
            Diagnostic::controller(
                Severity::Info,
                "Registry knows no hosts yet; skipping the hypervisor sweep.",
            )
            .with_help("Hosts are recorded on the first `cyris create` against this state root."),
        );
    } else {
        let executor = Arc::new(RemoteExecutor::new(ExecutorConfig::default()));
        let distributor = Arc::new(ImageDistributor::new(
            executor.clone(),
            registry.clone(),
            hosts.clone(),
            context.staging_dir.clone(),
            context.config.transfer_timeout,
        ));
        let drivers =
            DriverSet::for_hosts(&hosts, executor.clone(), context.staging_dir.clone())?;
        let orchestrator = Orchestrator::new(
            context.clone(),
            registry.clone(),
            executor,
            distributor,
            drivers,
            hosts,
        );

        // A range still `Deploying` here means its controller died
        // mid-deploy. The design treats that as destroy-and-redeploy,
        // never resume.
        for range in registry.list_ranges() {
            if range.state != RangeState::Deploying {
                continue;
            }
            if options.dry_run {
                reporter.warn(Diagnostic::scoped(
                    Severity::Info,
                    Scope::Range(range.id.clone()),
                    "Stranded mid-deploy; a non-dry run would destroy its residue.",
                ));
                continue;
            }
            match orchestrator.destroy_range(&range.id, &mut reporter) {
                Ok(errors) => {
                    outcome.residue_destroyed.push(range.id.clone());
                    outcome
                        .errors
                        .extend(errors.into_iter().map(EntityError::from));
                }
                Err(err) => outcome.errors.push(EntityError {
                    component: "orchestrator".to_string(),
                    resource: range.id.clone(),
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            }
        }

        let report = orchestrator.reconcile(options.grace, options.dry_run, &mut reporter)?;
        outcome.orphans = report.orphans;
        outcome.phantoms = report.phantoms;
        outcome
            .errors
            .extend(report.errors.into_iter().map(EntityError::from));
    }

    outcome.staging_reclaimed_bytes = sweep_staging(&context, options.dry_run, &mut reporter)?;

    registry.compact()?;

    let (diagnostics, events) = reporter.into_parts();
    Ok(OperationOutput::new(outcome)
        .with_diagnostics(diagnostics)
        .with_events(events))
}

/// Staged image downloads are pure cache; reclaim them all.
fn sweep_staging(
    context: &CoreContext,
    dry_run: bool,
    reporter: &mut ReporterProxy<'_>,
) -> Result<u64> {
    let mut reclaimed = 0u64;
    let entries = match fs::read_dir(&context.staging_dir) {
        Ok(entries) => entries,
        Err(err) => {
            reporter.warn(
                Diagnostic::controller(
                    Severity::Warning,
                    format!("Failed to list staging: {err}"),
                )
                .with_path(context.staging_dir.clone()),
            );
            return Ok(0);
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if !dry_run {
            fs::remove_file(&path).map_err(|source| Error::WriteState {
                path: path.clone(),
                source,
            })?;
        }
        reclaimed += bytes;
        reporter.emit(Event::CleanupProgress {
            path,
            kind: CleanupKind::Staging,
            bytes,
            dry_run,
        });
    }
    Ok(reclaimed)
}
