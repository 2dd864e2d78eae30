use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RangeSpec;
use crate::error::{Error, Result};

/// The immutable provisioning DAG for one range. Nodes are steps, edges
/// are `deps` (ids of steps that must succeed first). Emitted once per
/// range, persisted to `plan.json`, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub range_id: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: usize,
    pub kind: StepKind,
    #[serde(default)]
    pub deps: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepKind {
    CreateNetwork {
        network: String,
        host: String,
    },
    PlaceImage {
        image: String,
        fingerprint: String,
        host: String,
    },
    CloneGuest {
        guest: String,
        host: String,
    },
    WaitBoot {
        guest: String,
    },
    RunTask {
        guest: String,
        task: String,
    },
    FinalizeRange,
}

impl StepKind {
    pub fn describe(&self) -> String {
        match self {
            StepKind::CreateNetwork { network, host } => {
                format!("create-network {network} on {host}")
            }
            StepKind::PlaceImage { image, host, .. } => format!("place-image {image} on {host}"),
            StepKind::CloneGuest { guest, host } => format!("clone {guest} on {host}"),
            StepKind::WaitBoot { guest } => format!("wait-boot {guest}"),
            StepKind::RunTask { guest, task } => format!("task {task} on {guest}"),
            StepKind::FinalizeRange => "finalize".to_string(),
        }
    }
}

impl Plan {
    pub fn step(&self, id: usize) -> &PlanStep {
        &self.steps[id]
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Snapshot of per-host load taken when planning starts. Plans are a pure
/// function of (validated spec, this snapshot).
#[derive(Debug, Clone, Default)]
pub struct HostInventory {
    /// host id → (concurrent-clone capacity, guests currently assigned).
    pub hosts: BTreeMap<String, (u32, u32)>,
}

impl HostInventory {
    pub fn from_spec(spec: &RangeSpec) -> Self {
        let hosts = spec
            .hosts
            .iter()
            .map(|host| (host.id.clone(), (host.capacity, 0)))
            .collect();
        Self { hosts }
    }

    fn remaining(&self, host_id: &str) -> i64 {
        self.hosts
            .get(host_id)
            .map(|(capacity, load)| i64::from(*capacity) - i64::from(*load))
            .unwrap_or(0)
    }

    fn charge(&mut self, host_id: &str) {
        if let Some((_, load)) = self.hosts.get_mut(host_id) {
            *load += 1;
        }
    }
}

/// Assign every guest to a host: pinned assignments are honored, floating
/// guests go round-robin weighted by remaining concurrent-clone budget.
pub fn assign_hosts(
    spec: &RangeSpec,
    inventory: &HostInventory,
) -> Result<BTreeMap<String, String>> {
    let mut inventory = inventory.clone();
    let mut assignments = BTreeMap::new();

    for guest in &spec.guests {
        let eligible = spec.eligible_hosts(guest);
        if eligible.is_empty() {
            return Err(Error::Validation {
                message: format!("guest `{}` has no eligible host", guest.id),
            });
        }
        let chosen = if let Some(host) = &guest.host {
            host.clone()
        } else {
            eligible
                .iter()
                .max_by_key(|host| inventory.remaining(host))
                .expect("eligible set is non-empty")
                .clone()
        };
        inventory.charge(&chosen);
        assignments.insert(guest.id.clone(), chosen);
    }

    Ok(assignments)
}

/// Compile a validated spec into the provisioning DAG.
///
/// `fingerprints` maps base image id → content fingerprint, computed from
/// the source copies before planning (hashing is I/O and stays out of
/// this pure function).
///
/// Emission rules:
/// 1. one `CreateNetwork` per declared network;
/// 2. one `PlaceImage` per distinct (base image, host) pair in use;
/// 3. `CloneGuest(g)` depends on its `PlaceImage` and every
///    `CreateNetwork` it attaches to;
/// 4. `WaitBoot(g)` depends on `CloneGuest(g)`;
/// 5. `RunTask(t)` depends on `WaitBoot(g)` and its declared predecessor
///    tasks;
/// 6. `FinalizeRange` depends on every `RunTask` and `WaitBoot`.
///
/// The DAG is topologically checked at emit time; a cycle is a planning
/// error raised before any side effect.
pub fn emit_plan(
    spec: &RangeSpec,
    fingerprints: &BTreeMap<String, String>,
    inventory: &HostInventory,
) -> Result<Plan> {
    // An empty range deploys with zero steps.
    if spec.guests.is_empty() {
        return Ok(Plan {
            range_id: spec.range.id.clone(),
            steps: Vec::new(),
        });
    }

    let assignments = assign_hosts(spec, inventory)?;
    let mut steps: Vec<PlanStep> = Vec::new();
    let mut push = |kind: StepKind, deps: Vec<usize>| -> usize {
        let id = steps.len();
        steps.push(PlanStep { id, kind, deps });
        id
    };

    let mut network_steps: HashMap<String, usize> = HashMap::new();
    for network in &spec.networks {
        let id = push(
            StepKind::CreateNetwork {
                network: network.id.clone(),
                host: network.host.clone(),
            },
            Vec::new(),
        );
        network_steps.insert(network.id.clone(), id);
    }

    let mut image_steps: HashMap<(String, String), usize> = HashMap::new();
    for guest in &spec.guests {
        let host = assignments[&guest.id].clone();
        let key = (guest.base_image.clone(), host.clone());
        if image_steps.contains_key(&key) {
            continue;
        }
        let fingerprint = fingerprints
            .get(&guest.base_image)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "no fingerprint computed for base image `{}`",
                    guest.base_image
                ),
            })?;
        let id = push(
            StepKind::PlaceImage {
                image: guest.base_image.clone(),
                fingerprint,
                host,
            },
            Vec::new(),
        );
        image_steps.insert(key, id);
    }

    let mut finalize_deps = Vec::new();
    for guest in &spec.guests {
        let host = assignments[&guest.id].clone();
        let mut clone_deps =
            vec![image_steps[&(guest.base_image.clone(), host.clone())]];
        for nic in &guest.nics {
            clone_deps.push(network_steps[&nic.network]);
        }
        let clone_id = push(
            StepKind::CloneGuest {
                guest: guest.id.clone(),
                host,
            },
            clone_deps,
        );
        let boot_id = push(
            StepKind::WaitBoot {
                guest: guest.id.clone(),
            },
            vec![clone_id],
        );
        finalize_deps.push(boot_id);

        // Declared order is not required to be dependency order.
        let mut task_steps: HashMap<&str, usize> = HashMap::new();
        for task in order_guest_tasks(&guest.tasks)? {
            let mut deps = vec![boot_id];
            for predecessor in &task.depends_on {
                deps.push(task_steps[predecessor.as_str()]);
            }
            let task_id = push(
                StepKind::RunTask {
                    guest: guest.id.clone(),
                    task: task.id.clone(),
                },
                deps,
            );
            task_steps.insert(task.id.as_str(), task_id);
            finalize_deps.push(task_id);
        }
    }

    push(StepKind::FinalizeRange, finalize_deps);

    let plan = Plan {
        range_id: spec.range.id.clone(),
        steps,
    };
    topological_order(&plan)?;
    Ok(plan)
}

/// Order one guest's tasks so every task follows its declared
/// predecessors, keeping declaration order among unconstrained tasks.
/// Validation already rejected cycles; a cycle here is an internal error.
fn order_guest_tasks(tasks: &[crate::config::TaskSpec]) -> Result<Vec<&crate::config::TaskSpec>> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; tasks.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            if let Some(&from) = index.get(dep.as_str()) {
                indegree[i] += 1;
                successors[from].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|&i| indegree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(tasks.len());
    while let Some(i) = ready.pop_front() {
        ordered.push(&tasks[i]);
        for &next in &successors[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    if ordered.len() != tasks.len() {
        return Err(Error::Internal {
            message: "task dependency cycle survived validation".to_string(),
        });
    }
    Ok(ordered)
}

/// Kahn's algorithm over the plan. Returns one valid execution order, or
/// a validation error naming a step on a cycle.
pub fn topological_order(plan: &Plan) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; plan.steps.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];
    for step in &plan.steps {
        for &dep in &step.deps {
            if dep >= plan.steps.len() {
                return Err(Error::Internal {
                    message: format!("step {} depends on unknown step {dep}", step.id),
                });
            }
            indegree[step.id] += 1;
            successors[dep].push(step.id);
        }
    }

    let mut ready: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(plan.steps.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for &next in &successors[id] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != plan.steps.len() {
        let stuck: HashSet<usize> = (0..plan.steps.len())
            .filter(|id| indegree[*id] > 0)
            .collect();
        let example = stuck.iter().next().copied().unwrap_or(0);
        return Err(Error::Validation {
            message: format!(
                "plan contains a dependency cycle through `{}`",
                plan.steps[example].kind.describe()
            ),
        });
    }
    Ok(order)
}

/// Persist the emitted plan as the immutable `plan.json` document.
pub fn persist_plan(plan: &Plan, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let contents =
        serde_json::to_string_pretty(plan).map_err(|source| Error::EncodeState { source })?;
    fs::write(path, contents).map_err(|source| Error::WriteState {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadState {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| Error::EncodeState { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_range_spec;
    use std::path::PathBuf;

    const TWO_HOST_SPEC: &str = r#"
version = "0.1.0"

[range]
id = "dist-02"

[[hosts]]
id = "h1"
address = "172.16.1.10"
user = "cyris"
auth = "agent"
provider = "kvm"
capacity = 2

[[hosts]]
id = "h2"
address = "172.16.1.11"
user = "cyris"
auth = "agent"
provider = "kvm"
capacity = 4

[[base_images]]
id = "b1"
source = "base.qcow2"

[[networks]]
id = "lan1"
host = "h1"

[[networks]]
id = "lan2"
host = "h2"

[[guests]]
id = "g1"
base_image = "b1"
host = "h1"
[guests.resources]
vcpu = 1
mem_mib = 512
[[guests.nics]]
network = "lan1"
[[guests.tasks]]
id = "t1"
kind = "set_hostname"
[guests.tasks.params]
hostname = "g1"
[[guests.tasks]]
id = "t2"
kind = "set_hostname"
depends_on = ["t1"]
[guests.tasks.params]
hostname = "g1b"

[[guests]]
id = "g2"
base_image = "b1"
host = "h2"
[guests.resources]
vcpu = 1
mem_mib = 512
[[guests.nics]]
network = "lan2"
"#;

    fn load(contents: &str) -> (tempfile::TempDir, RangeSpec) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range.toml");
        std::fs::write(&path, contents).unwrap();
        std::fs::write(dir.path().join("base.qcow2"), b"base").unwrap();
        let spec = load_range_spec(&path).unwrap();
        (dir, spec)
    }

    fn fingerprints() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("b1".to_string(), "ab".repeat(32));
        map
    }

    #[test]
    fn emission_covers_both_hosts_and_orders_tasks() {
        let (_dir, spec) = load(TWO_HOST_SPEC);
        let inventory = HostInventory::from_spec(&spec);
        let plan = emit_plan(&spec, &fingerprints(), &inventory).unwrap();

        let place_hosts: Vec<&str> = plan
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::PlaceImage { host, .. } => Some(host.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(place_hosts.len(), 2, "one PlaceImage per (image, host)");
        assert!(place_hosts.contains(&"h1") && place_hosts.contains(&"h2"));

        // t2 must depend on t1's step.
        let t1 = plan
            .steps
            .iter()
            .find(|s| matches!(&s.kind, StepKind::RunTask { task, .. } if task == "t1"))
            .unwrap();
        let t2 = plan
            .steps
            .iter()
            .find(|s| matches!(&s.kind, StepKind::RunTask { task, .. } if task == "t2"))
            .unwrap();
        assert!(t2.deps.contains(&t1.id));

        // Finalize is last and depends on both boot steps and both tasks.
        let finalize = plan.steps.last().unwrap();
        assert!(matches!(finalize.kind, StepKind::FinalizeRange));
        assert_eq!(finalize.deps.len(), 4);
    }

    #[test]
    fn plans_are_deterministic() {
        let (_dir, spec) = load(TWO_HOST_SPEC);
        let inventory = HostInventory::from_spec(&spec);
        let first = emit_plan(&spec, &fingerprints(), &inventory).unwrap();
        let second = emit_plan(&spec, &fingerprints(), &inventory).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn empty_guest_list_yields_zero_steps() {
        let contents = TWO_HOST_SPEC
            .split("[[guests]]")
            .next()
            .unwrap()
            .to_string();
        let (_dir, spec) = load(&contents);
        let plan = emit_plan(&spec, &fingerprints(), &HostInventory::from_spec(&spec)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn floating_guests_prefer_spare_capacity() {
        let contents = TWO_HOST_SPEC
            .replace("host = \"h1\"\n[guests.resources]", "[guests.resources]")
            .replace("host = \"h2\"\n[guests.resources]", "[guests.resources]")
            .replace("[[guests.nics]]\nnetwork = \"lan1\"\n", "")
            .replace("[[guests.nics]]\nnetwork = \"lan2\"\n", "");
        let (_dir, spec) = load(&contents);
        let assignments = assign_hosts(&spec, &HostInventory::from_spec(&spec)).unwrap();
        // h2 (capacity 4) soaks up the first floating guest.
        assert_eq!(assignments["g1"], "h2");
    }

    #[test]
    fn topological_order_respects_deps() {
        let (_dir, spec) = load(TWO_HOST_SPEC);
        let plan =
            emit_plan(&spec, &fingerprints(), &HostInventory::from_spec(&spec)).unwrap();
        let order = topological_order(&plan).unwrap();
        let position: HashMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect();
        for step in &plan.steps {
            for dep in &step.deps {
                assert!(position[dep] < position[&step.id]);
            }
        }
    }

    #[test]
    fn forward_declared_task_dependencies_emit_in_order() {
        // t2 is declared before the task it depends on.
        let mutated = TWO_HOST_SPEC.replace(
            "[[guests.tasks]]\nid = \"t1\"\nkind = \"set_hostname\"\n[guests.tasks.params]\nhostname = \"g1\"\n[[guests.tasks]]\nid = \"t2\"\nkind = \"set_hostname\"\ndepends_on = [\"t1\"]\n[guests.tasks.params]\nhostname = \"g1b\"",
            "[[guests.tasks]]\nid = \"t2\"\nkind = \"set_hostname\"\ndepends_on = [\"t1\"]\n[guests.tasks.params]\nhostname = \"g1b\"\n[[guests.tasks]]\nid = \"t1\"\nkind = \"set_hostname\"\n[guests.tasks.params]\nhostname = \"g1\"",
        );
        assert_ne!(mutated, TWO_HOST_SPEC, "replacement must apply");
        let (_dir, spec) = load(&mutated);
        let plan =
            emit_plan(&spec, &fingerprints(), &HostInventory::from_spec(&spec)).unwrap();
        let t1 = plan
            .steps
            .iter()
            .find(|s| matches!(&s.kind, StepKind::RunTask { task, .. } if task == "t1"))
            .unwrap();
        let t2 = plan
            .steps
            .iter()
            .find(|s| matches!(&s.kind, StepKind::RunTask { task, .. } if task == "t2"))
            .unwrap();
        assert!(t2.deps.contains(&t1.id));
        assert!(topological_order(&plan).is_ok());
    }

    #[test]
    fn cycle_is_a_planning_error() {
        let plan = Plan {
            range_id: "r".to_string(),
            steps: vec![
                PlanStep {
                    id: 0,
                    kind: StepKind::WaitBoot {
                        guest: "g".to_string(),
                    },
                    deps: vec![1],
                },
                PlanStep {
                    id: 1,
                    kind: StepKind::WaitBoot {
                        guest: "g".to_string(),
                    },
                    deps: vec![0],
                },
            ],
        };
        let err = topological_order(&plan).expect_err("cycle must fail");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn plan_round_trips_through_disk() {
        let (_dir, spec) = load(TWO_HOST_SPEC);
        let plan =
            emit_plan(&spec, &fingerprints(), &HostInventory::from_spec(&spec)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ranges/dist-02/plan.json");
        persist_plan(&plan, &path).unwrap();
        let loaded = load_plan(&path).unwrap();
        assert_eq!(loaded.steps.len(), plan.steps.len());
        assert_eq!(loaded.range_id, "dist-02");
    }
}
