use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{Error, Result};

use super::diagnostics::{Diagnostic, Severity};
use super::model::{
    GuestRecord, GuestState, HostRecord, ImageRecord, NetworkRecord, RangeRecord, RangeState,
    TaskRecord,
};

const SNAPSHOT_FILE: &str = "registry.json";
const JOURNAL_FILE: &str = "journal.log";
const LOCK_FILE: &str = "lock";
const SNAPSHOT_VERSION: u32 = 1;
/// Journal entries tolerated before the next write also compacts.
const COMPACT_THRESHOLD: u64 = 512;

/// Durable source of truth for ranges, guests, networks, tasks, and image
/// placements.
///
/// Writes append a journal entry, flush it to disk, and only then return;
/// the caller performs the corresponding side effect after the ack, so a
/// crash can over-report live resources (reconciled by the orphan sweep)
/// but never under-report them. Reads clone whole range records under the
/// same lock, so a reader always sees a range together with all children
/// recorded up to one journal point.
pub struct Registry {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    /// Held for the life of the process; guards the state root.
    _lock: File,
    inner: Mutex<Inner>,
}

struct Inner {
    snapshot: Snapshot,
    journal: File,
    appended: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    ranges: BTreeMap<String, RangeRecord>,
    #[serde(default)]
    hosts: BTreeMap<String, HostRecord>,
    #[serde(default)]
    images: Vec<ImageRecord>,
}

/// One durable state transition. Entries are coarse-grained full records
/// so journal replay is a pure left fold with no ordering subtleties
/// beyond append order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    RangeUpserted {
        at: String,
        range: RangeRecord,
    },
    RangeState {
        at: String,
        range: String,
        state: RangeState,
    },
    GuestUpdated {
        at: String,
        range: String,
        guest: GuestRecord,
    },
    GuestState {
        at: String,
        range: String,
        guest: String,
        state: GuestState,
    },
    NetworkUpdated {
        at: String,
        range: String,
        network: NetworkRecord,
    },
    TaskUpdated {
        at: String,
        range: String,
        guest: String,
        task: TaskRecord,
    },
    HostRecorded {
        at: String,
        host: HostRecord,
    },
    ImageRecorded {
        at: String,
        image: ImageRecord,
    },
    ImageDropped {
        at: String,
        fingerprint: String,
        host: String,
    },
    RangeRemoved {
        at: String,
        range: String,
    },
}

/// Result of opening a registry: the handle plus any non-fatal findings
/// from snapshot/journal recovery.
pub struct RegistryOpen {
    pub registry: Registry,
    pub diagnostics: Vec<Diagnostic>,
}

impl Registry {
    /// Open (or initialize) the registry under `root`. Takes an exclusive
    /// advisory lock on the state root; a second controller gets
    /// [`Error::StateRootLocked`].
    pub fn open(root: &Path) -> Result<RegistryOpen> {
        fs::create_dir_all(root).map_err(|source| Error::CreateDir {
            path: root.to_path_buf(),
            source,
        })?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| Error::WriteState {
                path: lock_path.clone(),
                source,
            })?;
        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::StateRootLocked {
                path: root.to_path_buf(),
            });
        }

        let snapshot_path = root.join(SNAPSHOT_FILE);
        let journal_path = root.join(JOURNAL_FILE);
        let mut diagnostics = Vec::new();

        let mut snapshot = if snapshot_path.is_file() {
            let contents =
                fs::read_to_string(&snapshot_path).map_err(|source| Error::ReadState {
                    path: snapshot_path.clone(),
                    source,
                })?;
            match serde_json::from_str::<Snapshot>(&contents) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    diagnostics.push(
                        Diagnostic::controller(
                            Severity::Warning,
                            format!("Registry snapshot is unreadable ({err}); rebuilding from the journal."),
                        )
                        .with_path(snapshot_path.clone()),
                    );
                    Snapshot::default()
                }
            }
        } else {
            Snapshot::default()
        };
        snapshot.version = SNAPSHOT_VERSION;

        let mut replayed = 0u64;
        if journal_path.is_file() {
            let file = File::open(&journal_path).map_err(|source| Error::ReadState {
                path: journal_path.clone(),
                source,
            })?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        diagnostics.push(Diagnostic::controller(
                            Severity::Warning,
                            format!("Journal read stopped at line {}: {err}.", line_no + 1),
                        ));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => {
                        apply_entry(&mut snapshot, entry);
                        replayed += 1;
                    }
                    Err(err) => {
                        // A torn trailing line is an unacknowledged write;
                        // its side effect never ran. Dropping it keeps the
                        // registry on the safe side of the contract.
                        diagnostics.push(
                            Diagnostic::controller(
                                Severity::Warning,
                                format!(
                                    "Discarding unparseable journal line {}: {err}.",
                                    line_no + 1
                                ),
                            )
                            .with_path(journal_path.clone()),
                        );
                        break;
                    }
                }
            }
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(|source| Error::WriteState {
                path: journal_path.clone(),
                source,
            })?;

        let registry = Registry {
            snapshot_path,
            journal_path,
            _lock: lock,
            inner: Mutex::new(Inner {
                snapshot,
                journal,
                appended: replayed,
            }),
        };

        Ok(RegistryOpen {
            registry,
            diagnostics,
        })
    }

    /// Transactional write of a range and all its children.
    pub fn upsert_range(&self, record: RangeRecord) -> Result<()> {
        self.append(JournalEntry::RangeUpserted {
            at: now_stamp(),
            range: record,
        })
    }

    /// Transition a range's lifecycle state. Illegal transitions are
    /// refused before anything reaches the journal.
    pub fn range_state(&self, range_id: &str, state: RangeState) -> Result<()> {
        {
            let inner = self.inner.lock().expect("registry lock poisoned");
            let record = inner.snapshot.ranges.get(range_id).ok_or_else(|| {
                Error::UnknownRange {
                    range: range_id.to_string(),
                }
            })?;
            if record.state != state && !record.state.can_transition(state) {
                return Err(Error::Internal {
                    message: format!(
                        "illegal range transition {} → {} for `{range_id}`",
                        record.state.describe(),
                        state.describe()
                    ),
                });
            }
        }
        self.append(JournalEntry::RangeState {
            at: now_stamp(),
            range: range_id.to_string(),
            state,
        })
    }

    pub fn update_guest(&self, range_id: &str, guest: GuestRecord) -> Result<()> {
        self.append(JournalEntry::GuestUpdated {
            at: now_stamp(),
            range: range_id.to_string(),
            guest,
        })
    }

    pub fn guest_state(&self, range_id: &str, guest_id: &str, state: GuestState) -> Result<()> {
        self.append(JournalEntry::GuestState {
            at: now_stamp(),
            range: range_id.to_string(),
            guest: guest_id.to_string(),
            state,
        })
    }

    pub fn update_network(&self, range_id: &str, network: NetworkRecord) -> Result<()> {
        self.append(JournalEntry::NetworkUpdated {
            at: now_stamp(),
            range: range_id.to_string(),
            network,
        })
    }

    pub fn update_task(&self, range_id: &str, guest_id: &str, task: TaskRecord) -> Result<()> {
        self.append(JournalEntry::TaskUpdated {
            at: now_stamp(),
            range: range_id.to_string(),
            guest: guest_id.to_string(),
            task,
        })
    }

    /// Record (or refresh) a host inventory row so later operations can
    /// reach the host without the original range description.
    pub fn record_host(&self, host: HostRecord) -> Result<()> {
        self.append(JournalEntry::HostRecorded {
            at: now_stamp(),
            host,
        })
    }

    pub fn hosts(&self) -> Vec<HostRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.snapshot.hosts.values().cloned().collect()
    }

    pub fn record_image(&self, image: ImageRecord) -> Result<()> {
        self.append(JournalEntry::ImageRecorded {
            at: now_stamp(),
            image,
        })
    }

    pub fn drop_image(&self, fingerprint: &str, host: &str) -> Result<()> {
        self.append(JournalEntry::ImageDropped {
            at: now_stamp(),
            fingerprint: fingerprint.to_string(),
            host: host.to_string(),
        })
    }

    /// Remove a terminal range's row entirely (optional purge after
    /// destruction).
    pub fn remove_range(&self, range_id: &str) -> Result<()> {
        self.append(JournalEntry::RangeRemoved {
            at: now_stamp(),
            range: range_id.to_string(),
        })
    }

    /// Snapshot-consistent read of one range with all children.
    pub fn get_range(&self, range_id: &str) -> Option<RangeRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.snapshot.ranges.get(range_id).cloned()
    }

    pub fn list_ranges(&self) -> Vec<RangeRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.snapshot.ranges.values().cloned().collect()
    }

    /// Placement table row for (fingerprint, host), if any.
    pub fn image_on_host(&self, fingerprint: &str, host: &str) -> Option<ImageRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .snapshot
            .images
            .iter()
            .find(|img| img.fingerprint == fingerprint && img.host == host)
            .cloned()
    }

    /// Hosts currently holding a verified copy of `fingerprint`.
    pub fn image_seeds(&self, fingerprint: &str) -> Vec<ImageRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .snapshot
            .images
            .iter()
            .filter(|img| img.fingerprint == fingerprint)
            .cloned()
            .collect()
    }

    /// Whether any non-destroyed range still references `fingerprint`.
    /// Base images are reference-counted across ranges at destruction.
    pub fn image_referenced(&self, fingerprint: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.snapshot.ranges.values().any(|range| {
            !range.state.is_terminal()
                && range
                    .guests
                    .values()
                    .any(|guest| guest.base_fingerprint == fingerprint)
        })
    }

    /// Domain names the registry expects to exist, keyed by host. The
    /// complement of this set against `list_domains` output is the orphan
    /// set; the missing intersection is the phantom set.
    pub fn expected_domains(&self) -> BTreeMap<String, Vec<ExpectedDomain>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut expected: BTreeMap<String, Vec<ExpectedDomain>> = BTreeMap::new();
        for range in inner.snapshot.ranges.values() {
            if range.state.is_terminal() {
                continue;
            }
            for guest in range.guests.values() {
                if guest.state.expects_no_domain() {
                    continue;
                }
                expected
                    .entry(guest.host.clone())
                    .or_default()
                    .push(ExpectedDomain {
                        range: range.id.clone(),
                        guest: guest.id.clone(),
                        domain: guest.domain.clone(),
                    });
            }
        }
        expected
    }

    /// Write a fresh snapshot and truncate the journal. Called on clean
    /// shutdown of an operation and automatically once the journal grows
    /// past the compaction threshold.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        let contents =
            serde_json::to_string_pretty(&inner.snapshot).map_err(|source| Error::EncodeState {
                source,
            })?;
        let mut tmp = File::create(&tmp_path).map_err(|source| Error::WriteState {
            path: tmp_path.clone(),
            source,
        })?;
        tmp.write_all(contents.as_bytes())
            .and_then(|_| tmp.sync_all())
            .map_err(|source| Error::WriteState {
                path: tmp_path.clone(),
                source,
            })?;
        fs::rename(&tmp_path, &self.snapshot_path).map_err(|source| Error::WriteState {
            path: self.snapshot_path.clone(),
            source,
        })?;

        inner.journal = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.journal_path)
            .map_err(|source| Error::WriteState {
                path: self.journal_path.clone(),
                source,
            })?;
        inner.appended = 0;
        Ok(())
    }

    fn append(&self, entry: JournalEntry) -> Result<()> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        // Validate against the in-memory state before anything durable
        // happens, so the journal never records a transition that replay
        // would reject.
        check_entry(&inner.snapshot, &entry)?;

        let mut line =
            serde_json::to_string(&entry).map_err(|source| Error::EncodeState { source })?;
        line.push('\n');
        inner
            .journal
            .write_all(line.as_bytes())
            .and_then(|_| inner.journal.sync_data())
            .map_err(|source| Error::WriteState {
                path: self.journal_path.clone(),
                source,
            })?;

        apply_entry(&mut inner.snapshot, entry);
        inner.appended += 1;
        if inner.appended >= COMPACT_THRESHOLD {
            self.compact_locked(&mut inner)?;
        }
        Ok(())
    }
}

/// A domain the registry believes exists on a host.
#[derive(Debug, Clone)]
pub struct ExpectedDomain {
    pub range: String,
    pub guest: String,
    pub domain: String,
}

fn check_entry(snapshot: &Snapshot, entry: &JournalEntry) -> Result<()> {
    let require_range = |range: &str| -> Result<()> {
        if snapshot.ranges.contains_key(range) {
            Ok(())
        } else {
            Err(Error::UnknownRange {
                range: range.to_string(),
            })
        }
    };
    match entry {
        JournalEntry::RangeUpserted { .. }
        | JournalEntry::HostRecorded { .. }
        | JournalEntry::ImageRecorded { .. }
        | JournalEntry::ImageDropped { .. } => Ok(()),
        JournalEntry::RangeState { range, .. }
        | JournalEntry::GuestUpdated { range, .. }
        | JournalEntry::GuestState { range, .. }
        | JournalEntry::NetworkUpdated { range, .. }
        | JournalEntry::TaskUpdated { range, .. }
        | JournalEntry::RangeRemoved { range, .. } => require_range(range),
    }
}

fn apply_entry(snapshot: &mut Snapshot, entry: JournalEntry) {
    match entry {
        JournalEntry::RangeUpserted { range, .. } => {
            snapshot.ranges.insert(range.id.clone(), range);
        }
        JournalEntry::RangeState { range, state, .. } => {
            if let Some(record) = snapshot.ranges.get_mut(&range) {
                record.state = state;
            }
        }
        JournalEntry::GuestUpdated { range, guest, .. } => {
            if let Some(record) = snapshot.ranges.get_mut(&range) {
                record.guests.insert(guest.id.clone(), guest);
            }
        }
        JournalEntry::GuestState {
            range,
            guest,
            state,
            ..
        } => {
            if let Some(record) = snapshot.ranges.get_mut(&range) {
                if let Some(guest) = record.guests.get_mut(&guest) {
                    guest.state = state;
                }
            }
        }
        JournalEntry::NetworkUpdated { range, network, .. } => {
            if let Some(record) = snapshot.ranges.get_mut(&range) {
                record.networks.insert(network.id.clone(), network);
            }
        }
        JournalEntry::TaskUpdated {
            range,
            guest,
            task,
            ..
        } => {
            if let Some(record) = snapshot.ranges.get_mut(&range) {
                if let Some(guest) = record.guests.get_mut(&guest) {
                    guest.tasks.insert(task.id.clone(), task);
                }
            }
        }
        JournalEntry::HostRecorded { host, .. } => {
            snapshot.hosts.insert(host.id.clone(), host);
        }
        JournalEntry::ImageRecorded { image, .. } => {
            snapshot
                .images
                .retain(|img| !(img.fingerprint == image.fingerprint && img.host == image.host));
            snapshot.images.push(image);
        }
        JournalEntry::ImageDropped {
            fingerprint, host, ..
        } => {
            snapshot
                .images
                .retain(|img| !(img.fingerprint == fingerprint && img.host == host));
        }
        JournalEntry::RangeRemoved { range, .. } => {
            snapshot.ranges.remove(&range);
        }
    }
}

pub(crate) fn now_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{PowerState, TaskState};

    fn sample_range(id: &str) -> RangeRecord {
        RangeRecord {
            id: id.to_string(),
            name: id.to_string(),
            owner: Some("trainer".to_string()),
            created_at: now_stamp(),
            state: RangeState::Planned,
            plan_path: PathBuf::from("plan.json"),
            guests: BTreeMap::new(),
            networks: BTreeMap::new(),
            hosts: vec!["h1".to_string()],
        }
    }

    fn sample_guest(id: &str) -> GuestRecord {
        GuestRecord {
            id: id.to_string(),
            base_fingerprint: "ab".repeat(32),
            host: "h1".to_string(),
            domain: format!("cr-r1-{id}"),
            overlay_path: None,
            state: GuestState::Pending,
            power: PowerState::Unknown,
            boot_ready: false,
            nics: Vec::new(),
            tasks: BTreeMap::new(),
        }
    }

    #[test]
    fn reopen_replays_journal_over_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = Registry::open(dir.path()).unwrap();
            let registry = opened.registry;
            registry.upsert_range(sample_range("r1")).unwrap();
            registry.update_guest("r1", sample_guest("g1")).unwrap();
            registry.range_state("r1", RangeState::Deploying).unwrap();
        }
        let opened = Registry::open(dir.path()).unwrap();
        let range = opened.registry.get_range("r1").expect("range survives");
        assert_eq!(range.state, RangeState::Deploying);
        assert!(range.guests.contains_key("g1"));
    }

    #[test]
    fn torn_trailing_journal_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = Registry::open(dir.path()).unwrap();
            opened.registry.upsert_range(sample_range("r1")).unwrap();
        }
        let journal = dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&journal).unwrap();
        file.write_all(b"{\"op\":\"range_state\",\"at\":\"x").unwrap();

        let opened = Registry::open(dir.path()).unwrap();
        assert!(
            opened
                .diagnostics
                .iter()
                .any(|d| d.message.contains("Discarding"))
        );
        let range = opened.registry.get_range("r1").unwrap();
        assert_eq!(range.state, RangeState::Planned);
    }

    #[test]
    fn second_controller_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let first = Registry::open(dir.path()).unwrap();
        let second = Registry::open(dir.path());
        assert!(matches!(
            second.map(|_| ()),
            Err(Error::StateRootLocked { .. })
        ));
        drop(first);
    }

    #[test]
    fn illegal_transition_never_reaches_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Registry::open(dir.path()).unwrap();
        let registry = opened.registry;
        registry.upsert_range(sample_range("r1")).unwrap();
        registry.range_state("r1", RangeState::Deploying).unwrap();
        registry.range_state("r1", RangeState::Active).unwrap();
        assert!(registry.range_state("r1", RangeState::Planned).is_err());
        assert_eq!(
            registry.get_range("r1").unwrap().state,
            RangeState::Active
        );
    }

    #[test]
    fn compaction_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let opened = Registry::open(dir.path()).unwrap();
            let registry = opened.registry;
            registry.upsert_range(sample_range("r1")).unwrap();
            registry.update_guest("r1", sample_guest("g1")).unwrap();
            registry.compact().unwrap();
        }
        let journal_len = fs::metadata(dir.path().join(JOURNAL_FILE)).unwrap().len();
        assert_eq!(journal_len, 0);
        let opened = Registry::open(dir.path()).unwrap();
        assert!(opened.registry.get_range("r1").is_some());
    }

    #[test]
    fn expected_domains_skip_terminal_and_pre_create() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Registry::open(dir.path()).unwrap();
        let registry = opened.registry;

        let mut range = sample_range("r1");
        let mut live = sample_guest("g1");
        live.state = GuestState::Active;
        let mut failed = sample_guest("g2");
        failed.state = GuestState::FailedPreCreate;
        range.guests.insert(live.id.clone(), live);
        range.guests.insert(failed.id.clone(), failed);
        registry.upsert_range(range).unwrap();

        let expected = registry.expected_domains();
        let on_h1 = expected.get("h1").expect("host present");
        assert_eq!(on_h1.len(), 1);
        assert_eq!(on_h1[0].guest, "g1");
    }

    #[test]
    fn image_reference_counting_spans_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Registry::open(dir.path()).unwrap();
        let registry = opened.registry;

        let fingerprint = "cd".repeat(32);
        let mut range = sample_range("r1");
        let mut guest = sample_guest("g1");
        guest.base_fingerprint = fingerprint.clone();
        guest.state = GuestState::Active;
        range.guests.insert(guest.id.clone(), guest);
        range.state = RangeState::Active;
        registry.upsert_range(range).unwrap();

        assert!(registry.image_referenced(&fingerprint));
        registry.range_state("r1", RangeState::Destroying).unwrap();
        registry.range_state("r1", RangeState::Destroyed).unwrap();
        assert!(!registry.image_referenced(&fingerprint));
    }

    #[test]
    fn task_updates_land_under_their_guest() {
        let dir = tempfile::tempdir().unwrap();
        let opened = Registry::open(dir.path()).unwrap();
        let registry = opened.registry;
        registry.upsert_range(sample_range("r1")).unwrap();
        registry.update_guest("r1", sample_guest("g1")).unwrap();
        registry
            .update_task(
                "r1",
                "g1",
                TaskRecord {
                    id: "t1".to_string(),
                    kind: "add_user".to_string(),
                    state: TaskState::Succeeded,
                    attempts: 1,
                    critical_to_range: false,
                    depends_on: Vec::new(),
                    detail: None,
                    artifacts: Vec::new(),
                },
            )
            .unwrap();
        let range = registry.get_range("r1").unwrap();
        assert_eq!(
            range.guests["g1"].tasks["t1"].state,
            TaskState::Succeeded
        );
    }
}
