use std::fmt;
use std::path::PathBuf;

/// Severity of a finding raised while operating on a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational; no action required.
    Info,
    /// Something is off but the operation can continue.
    Warning,
    /// Hard failures normally travel as `Result::Err`; this level exists
    /// for findings that accompany an otherwise successful outcome.
    Error,
}

/// Where in the range hierarchy a finding is anchored.
///
/// The result surface groups failures range → guest → task; diagnostics
/// carry the same coordinates so a single line locates the blame without
/// cross-referencing the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// Controller-local concern: state root, staging area, registry files.
    #[default]
    Controller,
    /// A whole range.
    Range(String),
    /// A hypervisor host, independent of any range.
    Host(String),
    /// One guest inside a range.
    Guest { range: String, guest: String },
    /// One instantiation task on a guest.
    Task {
        range: String,
        guest: String,
        task: String,
    },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Controller => write!(f, "controller"),
            Scope::Range(range) => write!(f, "range `{range}`"),
            Scope::Host(host) => write!(f, "host `{host}`"),
            Scope::Guest { range, guest } => write!(f, "guest `{range}/{guest}`"),
            Scope::Task { range, guest, task } => {
                write!(f, "task `{range}/{guest}/{task}`")
            }
        }
    }
}

/// A non-fatal finding surfaced alongside operation outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Entity the finding is about.
    pub scope: Scope,
    /// Human-readable description.
    pub message: String,
    /// Optional file the finding refers to (range description, journal,
    /// overlay inventory).
    pub path: Option<PathBuf>,
    /// Optional remediation hint.
    pub help: Option<String>,
}

impl Diagnostic {
    /// A controller-scoped finding; most preflight and registry findings
    /// live here.
    pub fn controller<S: Into<String>>(severity: Severity, message: S) -> Self {
        Self::scoped(severity, Scope::Controller, message)
    }

    /// A finding anchored to a specific range, host, guest, or task.
    pub fn scoped<S: Into<String>>(severity: Severity, scope: Scope, message: S) -> Self {
        Self {
            severity,
            scope,
            message: message.into(),
            path: None,
            help: None,
        }
    }

    /// Attach the file the finding refers to.
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Attach a remediation hint.
    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_render_range_guest_task_coordinates() {
        assert_eq!(Scope::Controller.to_string(), "controller");
        assert_eq!(
            Scope::Guest {
                range: "r1".into(),
                guest: "g1".into(),
            }
            .to_string(),
            "guest `r1/g1`"
        );
        assert_eq!(
            Scope::Task {
                range: "r1".into(),
                guest: "g1".into(),
                task: "t1".into(),
            }
            .to_string(),
            "task `r1/g1/t1`"
        );
    }

    #[test]
    fn builders_compose() {
        let diagnostic = Diagnostic::scoped(
            Severity::Warning,
            Scope::Range("r1".into()),
            "journal replay stopped early",
        )
        .with_path(PathBuf::from("journal.log"))
        .with_help("Re-run cleanup to reconcile.");
        assert_eq!(diagnostic.scope, Scope::Range("r1".into()));
        assert!(diagnostic.help.is_some());
    }
}
