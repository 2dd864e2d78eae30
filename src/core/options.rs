use std::path::PathBuf;

/// Where the range description comes from.
#[derive(Debug, Clone)]
pub enum SpecSource {
    /// Explicit path to a `cyris.toml` range description.
    Explicit(PathBuf),
}

impl SpecSource {
    pub fn path(&self) -> &PathBuf {
        match self {
            SpecSource::Explicit(path) => path,
        }
    }
}

/// Options accepted by the `create` operation.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Range description to materialize.
    pub spec: SpecSource,
    /// Override for the durable state root. Falls back to the
    /// description's `[controller]` table, then the process default.
    pub state_root: Option<PathBuf>,
    /// Render the plan without side effects: no registry writes, no
    /// hypervisor calls.
    pub plan_only: bool,
    /// Downgrade preflight failures to warnings.
    pub force: bool,
}

/// Options accepted by the `destroy` operation.
#[derive(Debug, Clone)]
pub struct DestroyOptions {
    pub range_id: String,
    pub state_root: Option<PathBuf>,
    /// Also remove the registry row and on-disk range directory after a
    /// successful destruction; default keeps the terminal row for audit.
    pub purge: bool,
}

/// Options accepted by the `status` operation.
#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub range_id: String,
    pub state_root: Option<PathBuf>,
}

/// Options accepted by the `list` operation.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub state_root: Option<PathBuf>,
}

/// Options accepted by the `cleanup` operation (orphan sweep plus stale
/// residue collection).
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub state_root: Option<PathBuf>,
    /// Report orphans without destroying them.
    pub grace: bool,
    /// Walk everything, touch nothing.
    pub dry_run: bool,
}
