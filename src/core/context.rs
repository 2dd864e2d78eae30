use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::Disks;

use crate::config::{ControllerOverrides, RangeSpec};
use crate::error::{Error, Result};

use super::diagnostics::{Diagnostic, Severity};

const DISK_WARN_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;
const DISK_FAIL_THRESHOLD: u64 = 500 * 1024 * 1024;

/// Tunable budgets and limits for one controller process.
///
/// Values come from the defaults below merged with the optional
/// `[controller]` table of the range description.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Worker pool size for plan execution. Zero means "hosts × 4".
    pub workers: usize,
    pub clone_timeout: Duration,
    pub boot_timeout: Duration,
    pub task_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Global cap on concurrent image transfer streams across the fleet.
    pub transfer_streams: usize,
    /// Per-host cap on concurrent image transfer streams.
    pub transfer_streams_per_host: usize,
    /// Worker pool for overlay creation, serialized per host.
    pub overlay_workers: usize,
    /// Intra-guest task parallelism. Kept at 1 so idempotency reasoning
    /// stays sound.
    pub tasks_per_guest: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            clone_timeout: Duration::from_secs(120),
            boot_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(180),
            transfer_timeout: Duration::from_secs(1800),
            transfer_streams: 50,
            transfer_streams_per_host: 2,
            overlay_workers: 4,
            tasks_per_guest: 1,
        }
    }
}

impl CoreConfig {
    pub fn with_overrides(overrides: &ControllerOverrides) -> Self {
        let mut config = Self::default();
        if let Some(workers) = overrides.workers {
            config.workers = workers;
        }
        if let Some(secs) = overrides.clone_timeout_secs {
            config.clone_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.boot_timeout_secs {
            config.boot_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.task_timeout_secs {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.transfer_timeout_secs {
            config.transfer_timeout = Duration::from_secs(secs);
        }
        if let Some(streams) = overrides.transfer_streams {
            config.transfer_streams = streams.max(1);
        }
        if let Some(streams) = overrides.transfer_streams_per_host {
            config.transfer_streams_per_host = streams.max(1);
        }
        if let Some(workers) = overrides.overlay_workers {
            config.overlay_workers = workers.max(1);
        }
        config
    }

    /// Effective worker-pool size for a fleet of `hosts` hosts.
    pub fn effective_workers(&self, hosts: usize) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            (hosts.max(1)) * 4
        }
    }
}

/// Explicit context handed to every component at construction time:
/// resolved paths plus the effective [`CoreConfig`]. Replaces the ambient
/// globals of the system this design descends from.
#[derive(Debug, Clone)]
pub struct CoreContext {
    /// Root of all durable controller state.
    pub state_root: PathBuf,
    /// Scratch area for image staging before transfer.
    pub staging_dir: PathBuf,
    /// Per-range directories (`ranges/<id>/`).
    pub ranges_dir: PathBuf,
    pub config: CoreConfig,
}

impl CoreContext {
    /// Resolve the state layout under `state_root`, creating directories
    /// as needed.
    pub fn prepare(state_root: PathBuf, config: CoreConfig) -> Result<Self> {
        let staging_dir = state_root.join("staging");
        let ranges_dir = state_root.join("ranges");
        for dir in [&state_root, &staging_dir, &ranges_dir] {
            fs::create_dir_all(dir).map_err(|source| Error::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            state_root,
            staging_dir,
            ranges_dir,
            config,
        })
    }

    pub fn range_dir(&self, range_id: &str) -> PathBuf {
        self.ranges_dir.join(range_id)
    }

    pub fn plan_path(&self, range_id: &str) -> PathBuf {
        self.range_dir(range_id).join("plan.json")
    }

    pub fn overlays_dir(&self, range_id: &str) -> PathBuf {
        self.range_dir(range_id).join("overlays")
    }
}

/// Default state root: `$CYRIS_STATE_ROOT`, else `~/.cyris`, else `.cyris`
/// under the working directory.
pub fn default_state_root() -> PathBuf {
    if let Ok(root) = std::env::var("CYRIS_STATE_ROOT") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Path::new(&home).join(".cyris");
        }
    }
    PathBuf::from(".cyris")
}

#[derive(Debug, Default)]
pub struct CheckOutcome {
    pub warnings: Vec<Diagnostic>,
    pub failures: Vec<String>,
}

/// Controller-local disk preflight: the staging area must be able to hold
/// the largest controller-sourced base image, and the state root must not
/// be on a nearly-full disk.
pub fn check_controller_disk(spec: &RangeSpec, context: &CoreContext) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();

    let mut paths: HashSet<PathBuf> = HashSet::new();
    paths.insert(context.state_root.clone());
    paths.insert(context.staging_dir.clone());

    let mut disks = Disks::new_with_refreshed_list();
    for path in paths {
        let probe = existing_directory(&path);
        match available_disk_space(&mut disks, &probe) {
            Some(space) if space < DISK_FAIL_THRESHOLD => {
                outcome.failures.push(format!(
                    "{} has only {} free (requires at least {}).",
                    probe.display(),
                    format_bytes(space),
                    format_bytes(DISK_FAIL_THRESHOLD),
                ));
            }
            Some(space) if space < DISK_WARN_THRESHOLD => {
                outcome.warnings.push(Diagnostic::controller(
                    Severity::Warning,
                    format!(
                        "{} has {} free; image staging may stall (recommended {}).",
                        probe.display(),
                        format_bytes(space),
                        format_bytes(DISK_WARN_THRESHOLD),
                    ),
                ));
            }
            Some(_) => {}
            None => outcome.warnings.push(Diagnostic::controller(
                Severity::Warning,
                format!(
                    "Unable to determine free space at {}; skipping disk safety check for this path.",
                    probe.display()
                ),
            )),
        }
    }

    // Controller-sourced images travel through staging once each.
    let mut largest: u64 = 0;
    for image in &spec.base_images {
        if let crate::config::ImageSource::Controller(path) = &image.source {
            match fs::metadata(path) {
                Ok(meta) => largest = largest.max(meta.len()),
                Err(err) => outcome.failures.push(format!(
                    "Base image `{}` at {} is not readable: {err}.",
                    image.id,
                    path.display()
                )),
            }
        }
    }
    if largest > 0 {
        if let Some(space) = available_disk_space(&mut disks, &existing_directory(&context.staging_dir)) {
            if space < largest {
                outcome.failures.push(format!(
                    "Staging at {} has {} free but the largest base image needs {}.",
                    context.staging_dir.display(),
                    format_bytes(space),
                    format_bytes(largest),
                ));
            }
        }
    }

    outcome
}

fn existing_directory(path: &Path) -> PathBuf {
    let mut probe = path.to_path_buf();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => return PathBuf::from("."),
        }
    }
    probe
}

fn available_disk_space(disks: &mut Disks, path: &Path) -> Option<u64> {
    disks.refresh();
    let canonical = path.canonicalize().ok()?;
    disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_budgets() {
        let config = CoreConfig::default();
        assert_eq!(config.clone_timeout, Duration::from_secs(120));
        assert_eq!(config.boot_timeout, Duration::from_secs(300));
        assert_eq!(config.task_timeout, Duration::from_secs(180));
        assert_eq!(config.transfer_timeout, Duration::from_secs(1800));
        assert_eq!(config.transfer_streams, 50);
        assert_eq!(config.transfer_streams_per_host, 2);
        assert_eq!(config.tasks_per_guest, 1);
    }

    #[test]
    fn worker_default_scales_with_hosts() {
        let config = CoreConfig::default();
        assert_eq!(config.effective_workers(3), 12);
        let pinned = CoreConfig {
            workers: 7,
            ..CoreConfig::default()
        };
        assert_eq!(pinned.effective_workers(3), 7);
    }

    #[test]
    fn format_bytes_picks_sensible_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.0 MiB");
    }

    #[test]
    fn state_root_env_override() {
        temp_env::with_var("CYRIS_STATE_ROOT", Some("/tmp/cyris-test-root"), || {
            assert_eq!(default_state_root(), PathBuf::from("/tmp/cyris-test-root"));
        });
    }

    #[test]
    fn context_prepare_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let context =
            CoreContext::prepare(dir.path().join("state"), CoreConfig::default()).unwrap();
        assert!(context.staging_dir.is_dir());
        assert!(context.ranges_dir.is_dir());
        assert_eq!(
            context.plan_path("r1"),
            dir.path().join("state/ranges/r1/plan.json")
        );
    }
}
