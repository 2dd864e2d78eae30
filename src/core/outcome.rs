use std::path::PathBuf;

use crate::error::ErrorKind;

use super::diagnostics::Diagnostic;
use super::events::{Event, OrphanAction};
use super::model::{GuestState, RangeState, TaskState};
use super::orchestrator::AttributedError;

/// Result wrapper returned by high-level operations.
pub type OperationResult<T> = crate::error::Result<OperationOutput<T>>;

/// Envelope for successful operation outcomes.
#[derive(Debug)]
pub struct OperationOutput<T> {
    /// Primary value produced by the operation.
    pub value: T,
    /// Diagnostics collected while performing the operation.
    pub diagnostics: Vec<Diagnostic>,
    /// Structured events captured during the run.
    pub events: Vec<Event>,
}

impl<T> OperationOutput<T> {
    /// Create a new operation output.
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Attach diagnostics to the output.
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Attach events to the output.
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

/// A failure attributed to (component, resource) with its taxonomy kind.
/// The rendering layer groups these range → guest → task.
#[derive(Debug, Clone)]
pub struct EntityError {
    pub component: String,
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<AttributedError> for EntityError {
    fn from(err: AttributedError) -> Self {
        Self {
            component: err.component.to_string(),
            resource: err.resource,
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Per-task row in status and create outcomes.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub kind: String,
    pub state: TaskState,
    pub detail: Option<String>,
    pub artifacts: Vec<String>,
}

/// Per-guest row in status and create outcomes.
#[derive(Debug, Clone)]
pub struct GuestRow {
    pub id: String,
    pub host: String,
    pub state: GuestState,
    pub addresses: Vec<String>,
    pub boot_ready: bool,
    pub tasks: Vec<TaskRow>,
}

/// Credential surfaced from an `add_user` task that generated a password.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub guest: String,
    pub task: String,
    pub password: String,
}

/// Outcome of `create`.
#[derive(Debug)]
pub struct CreateOutcome {
    pub range_id: String,
    pub state: RangeState,
    pub plan_steps: usize,
    /// Set when the plan was persisted (not in plan-only mode).
    pub plan_path: Option<PathBuf>,
    pub plan_only: bool,
    pub guests: Vec<GuestRow>,
    pub credentials: Vec<CredentialRow>,
    pub errors: Vec<EntityError>,
}

impl CreateOutcome {
    /// Overall success: the range deployed and no guest is stranded in a
    /// failed state.
    pub fn fully_successful(&self) -> bool {
        self.state == RangeState::Active
            && self.errors.is_empty()
            && self.guests.iter().all(|guest| {
                matches!(guest.state, GuestState::Active | GuestState::Ready)
            })
    }
}

/// Outcome of `destroy`.
#[derive(Debug)]
pub struct DestroyOutcome {
    pub range_id: String,
    pub state: RangeState,
    pub purged: bool,
    pub errors: Vec<EntityError>,
}

/// Compact per-range line for `list`.
#[derive(Debug, Clone)]
pub struct RangeSummary {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub state: RangeState,
    pub created_at: String,
    pub guest_total: usize,
    pub guest_active: usize,
    pub guest_failed: usize,
}

/// Outcome of `status`.
#[derive(Debug)]
pub struct StatusOutcome {
    pub summary: RangeSummary,
    pub guests: Vec<GuestRow>,
}

/// Outcome of `list`.
#[derive(Debug)]
pub struct ListOutcome {
    pub ranges: Vec<RangeSummary>,
}

/// Outcome of `cleanup`.
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    /// (host, domain, action) per orphan encountered.
    pub orphans: Vec<(String, String, OrphanAction)>,
    /// (range, guest) per phantom marked missing.
    pub phantoms: Vec<(String, String)>,
    /// Ranges found mid-deploy at startup and torn down.
    pub residue_destroyed: Vec<String>,
    /// Bytes reclaimed from stale staging files.
    pub staging_reclaimed_bytes: u64,
    pub dry_run: bool,
    pub errors: Vec<EntityError>,
}
