use std::path::PathBuf;

use super::diagnostics::{Diagnostic, Severity};

/// Observer of range orchestration progress.
///
/// The orchestrator delivers events as plan steps complete; operations
/// additionally return the full stream in their outcome envelope, so a
/// caller that only wants the final picture can pass `None` and read the
/// envelope.
pub trait Reporter {
    /// Receive a structured event.
    fn report(&mut self, event: Event);

    /// Receive a diagnostic the moment it is raised, ahead of the outcome
    /// envelope. The default drops it; the envelope still carries every
    /// diagnostic.
    fn diagnostic(&mut self, _diagnostic: &Diagnostic) {}
}

/// Structured event emitted during long-running operations.
#[derive(Debug, Clone)]
pub enum Event {
    /// A textual progress update with a severity level.
    Message {
        /// Severity of the message.
        severity: Severity,
        /// Human-readable text.
        text: String,
    },
    /// A plan was compiled for a range.
    PlanEmitted {
        /// Range identifier.
        range: String,
        /// Number of steps in the plan.
        steps: usize,
        /// Path the immutable plan was persisted to, when persisted.
        plan_path: Option<PathBuf>,
    },
    /// A base image transfer to a host began.
    ImageTransferStarted {
        /// Content fingerprint of the image.
        fingerprint: String,
        /// Receiving host.
        host: String,
        /// Bytes that will travel.
        bytes: u64,
    },
    /// A base image is in place and verified on a host.
    ImagePlaced {
        /// Content fingerprint of the image.
        fingerprint: String,
        /// Holding host.
        host: String,
        /// Path on the host.
        path: PathBuf,
        /// Whether the placement table already held a verified copy.
        already_present: bool,
    },
    /// A transferred image failed verification on the receiver.
    ImageVerificationFailed {
        /// Expected fingerprint.
        fingerprint: String,
        /// Receiving host.
        host: String,
        /// Fingerprint observed after transfer.
        observed: String,
        /// Whether a retry from an alternate seed will follow.
        will_retry: bool,
    },
    /// A copy-on-write overlay was created for a guest.
    OverlayCreated {
        /// Guest identifier.
        guest: String,
        /// Host holding the overlay.
        host: String,
        /// Filesystem path to the overlay.
        overlay_path: PathBuf,
    },
    /// A guest domain was defined and started.
    GuestCloned {
        /// Guest identifier.
        guest: String,
        /// Host the domain runs on.
        host: String,
        /// Hypervisor-side domain name.
        domain: String,
    },
    /// A guest answered its boot probe.
    BootReady {
        /// Guest identifier.
        guest: String,
        /// Leased addresses observed at readiness, one per NIC where known.
        leased_ips: Vec<String>,
        /// Milliseconds from clone to readiness.
        elapsed_ms: u64,
    },
    /// An instantiation task started on a guest.
    TaskStarted {
        /// Guest identifier.
        guest: String,
        /// Task identifier.
        task: String,
        /// Task kind label.
        kind: &'static str,
        /// Attempt number, 1-based.
        attempt: u32,
    },
    /// An instantiation task finished.
    TaskCompleted {
        /// Guest identifier.
        guest: String,
        /// Task identifier.
        task: String,
        /// Terminal status of the task.
        status: TaskEventStatus,
        /// Milliseconds spent in the task.
        duration_ms: u64,
        /// Optional detail (captured tail, skip reason).
        detail: Option<String>,
    },
    /// Ordered lifecycle events for guest shutdown.
    ShutdownRequested {
        /// Guest identifier.
        guest: String,
    },
    /// Host escalated shutdown beyond the graceful attempt.
    ShutdownEscalated {
        /// Guest identifier.
        guest: String,
        /// Milliseconds waited for the graceful phase.
        waited_ms: u64,
    },
    /// A guest completed its shutdown sequence.
    ShutdownComplete {
        /// Guest identifier.
        guest: String,
        /// Outcome of the shutdown path (graceful vs forced).
        outcome: ShutdownOutcome,
        /// Milliseconds elapsed from shutdown request until completion.
        total_ms: u64,
    },
    /// A guest domain and its storage were destroyed.
    GuestDestroyed {
        /// Guest identifier.
        guest: String,
        /// Host the domain ran on.
        host: String,
    },
    /// A range-created network was destroyed.
    NetworkDestroyed {
        /// Network identifier.
        network: String,
        /// Host the bridge lived on.
        host: String,
    },
    /// A range reached a new lifecycle state.
    RangeStateChanged {
        /// Range identifier.
        range: String,
        /// State label after the transition.
        state: &'static str,
    },
    /// Reconciliation found a hypervisor-side domain with no registry row.
    OrphanDetected {
        /// Host the domain was found on.
        host: String,
        /// Hypervisor-side domain name.
        domain: String,
        /// Action taken for the orphan.
        action: OrphanAction,
    },
    /// Reconciliation found a registry guest with no hypervisor-side domain.
    PhantomDetected {
        /// Range identifier.
        range: String,
        /// Guest identifier.
        guest: String,
        /// Host the guest was recorded on.
        host: String,
    },
    /// Progress emitted during cleanup operations.
    CleanupProgress {
        /// Path targeted by the cleanup step.
        path: PathBuf,
        /// Category of artifact being processed.
        kind: CleanupKind,
        /// Number of bytes associated with the action.
        bytes: u64,
        /// Whether the action occurred in dry-run mode.
        dry_run: bool,
    },
}

/// Terminal status carried by [`Event::TaskCompleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventStatus {
    Succeeded,
    Failed,
    SkippedUpstreamFailed,
}

impl TaskEventStatus {
    pub fn describe(&self) -> &'static str {
        match self {
            TaskEventStatus::Succeeded => "succeeded",
            TaskEventStatus::Failed => "failed",
            TaskEventStatus::SkippedUpstreamFailed => "skipped-upstream-failed",
        }
    }
}

/// How a guest shutdown concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The guest powered off within the graceful window.
    Graceful,
    /// The host forced the domain off after the graceful window lapsed.
    Forced,
    /// The domain was already off.
    AlreadyOff,
}

/// Action taken for an orphaned domain during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanAction {
    /// The domain was destroyed together with its storage.
    Destroyed,
    /// The grace flag suppressed destruction; the orphan was only reported.
    Reported,
    /// Dry-run mode; nothing was touched.
    DryRun,
}

/// Category of artifact processed during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    /// Per-guest copy-on-write overlay.
    Overlay,
    /// Immutable plan document.
    Plan,
    /// Registry rows for a terminal range.
    RegistryRow,
    /// Staged image transfer residue.
    Staging,
}

impl CleanupKind {
    pub fn describe(&self) -> &'static str {
        match self {
            CleanupKind::Overlay => "overlay",
            CleanupKind::Plan => "plan",
            CleanupKind::RegistryRow => "registry row",
            CleanupKind::Staging => "staging",
        }
    }
}
