//! Core Cyris library API surface.

pub mod diagnostics;
pub mod events;
pub mod options;
pub mod outcome;

pub mod context;
pub mod distributor;
pub mod driver;
pub mod executor;
pub mod model;
pub mod operations;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod tasks;

pub use context::{CoreConfig, CoreContext};
pub use diagnostics::{Diagnostic, Scope, Severity};
pub use events::{Event, Reporter};
pub use operations::{cleanup, create, destroy, list, status};
pub use options::{
    CleanupOptions, CreateOptions, DestroyOptions, ListOptions, SpecSource, StatusOptions,
};
pub use outcome::{
    CleanupOutcome, CreateOutcome, CredentialRow, DestroyOutcome, EntityError, GuestRow,
    ListOutcome, OperationOutput, OperationResult, RangeSummary, StatusOutcome, TaskRow,
};
