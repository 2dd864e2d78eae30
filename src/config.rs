use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default SSH port used when a host omits `port`.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default concurrent-clone budget for hosts that omit `capacity`.
pub const DEFAULT_HOST_CAPACITY: u32 = 4;

/// Validated range description consumed by the planner and orchestrator.
///
/// Produced exclusively by [`load_range_spec`]; every cross-reference has
/// been resolved and every task dependency graph checked for cycles before
/// an instance of this type exists.
#[derive(Debug, Clone)]
pub struct RangeSpec {
    pub file_path: PathBuf,
    pub version: String,
    pub range: RangeMeta,
    pub hosts: Vec<HostSpec>,
    pub base_images: Vec<BaseImageSpec>,
    pub networks: Vec<NetworkSpec>,
    pub guests: Vec<GuestSpec>,
    pub controller: ControllerOverrides,
}

impl RangeSpec {
    pub fn host(&self, id: &str) -> Option<&HostSpec> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn network(&self, id: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.id == id)
    }

    pub fn base_image(&self, id: &str) -> Option<&BaseImageSpec> {
        self.base_images.iter().find(|b| b.id == id)
    }

    /// Hosts a guest may legally land on: its pinned host, or the
    /// intersection of the hosts its attached networks are bound to.
    pub fn eligible_hosts(&self, guest: &GuestSpec) -> Vec<String> {
        if let Some(host) = &guest.host {
            return vec![host.clone()];
        }
        let mut eligible: Vec<String> = self.hosts.iter().map(|h| h.id.clone()).collect();
        for nic in &guest.nics {
            if let Some(network) = self.network(&nic.network) {
                eligible.retain(|h| *h == network.host);
            }
        }
        eligible
    }

    /// All declared subnets, used for attack-target containment checks.
    pub fn subnets(&self) -> Vec<SubnetSpec> {
        self.networks.iter().filter_map(|n| n.subnet).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RangeMeta {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
}

/// A hypervisor endpoint. Lifetime independent of any range.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthRef,
    pub provider: Provider,
    /// Concurrent-clone budget used by host assignment and the clone
    /// semaphore.
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Kvm,
    CloudX,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Kvm => write!(f, "kvm"),
            Provider::CloudX => write!(f, "cloud-x"),
        }
    }
}

/// Credentials handle for a host. The concrete secret never lives in the
/// range description; it is resolved at connection time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthRef {
    /// Use the running ssh-agent.
    Agent,
    /// Private key file on the controller.
    KeyFile(PathBuf),
    /// Password read from the named environment variable.
    PasswordEnv(String),
}

impl AuthRef {
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        if input == "agent" {
            return Ok(AuthRef::Agent);
        }
        if let Some(path) = input.strip_prefix("key:") {
            if path.is_empty() {
                return Err("`key:` requires a path to a private key file".to_string());
            }
            return Ok(AuthRef::KeyFile(PathBuf::from(path)));
        }
        if let Some(var) = input.strip_prefix("password-env:") {
            if var.is_empty() {
                return Err("`password-env:` requires an environment variable name".to_string());
            }
            return Ok(AuthRef::PasswordEnv(var.to_string()));
        }
        Err(format!(
            "Unknown auth reference `{input}`. Supported forms: `agent`, `key:<path>`, `password-env:<VAR>`."
        ))
    }

    pub fn describe(&self) -> String {
        match self {
            AuthRef::Agent => "agent".to_string(),
            AuthRef::KeyFile(path) => format!("key:{}", path.display()),
            AuthRef::PasswordEnv(var) => format!("password-env:{var}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaseImageSpec {
    pub id: String,
    pub source: ImageSource,
    /// SHA-256 of the canonical image content when declared up front;
    /// computed from the source copy otherwise.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Path on the controller filesystem.
    Controller(PathBuf),
    /// Path already present on a declared host.
    Host { host: String, path: PathBuf },
}

impl ImageSource {
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Controller(path) => path.display().to_string(),
            ImageSource::Host { host, path } => format!("{host}:{}", path.display()),
        }
    }
}

/// A Layer-2 segment plus optional Layer-3 policy, bound to one host.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub id: String,
    pub host: String,
    pub bridge_name: String,
    pub subnet: Option<SubnetSpec>,
    pub gateway: Option<Ipv4Addr>,
    pub nat: bool,
    pub forwarding_rules: Vec<String>,
}

/// IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl SubnetSpec {
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let (addr, prefix) = input
            .split_once('/')
            .ok_or_else(|| format!("`{input}` is not CIDR notation (expected a.b.c.d/len)"))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("`{addr}` is not a valid IPv4 address"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| format!("`{prefix}` is not a valid prefix length"))?;
        if prefix_len > 32 {
            return Err(format!("Prefix length {prefix_len} exceeds 32"));
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.prefix_len));
        (u32::from(self.network) & mask) == (u32::from(addr) & mask)
    }
}

impl fmt::Display for SubnetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

#[derive(Debug, Clone)]
pub struct GuestSpec {
    pub id: String,
    pub base_image: String,
    /// Pinned host when declared; otherwise assignment is the planner's.
    pub host: Option<String>,
    pub nics: Vec<NicSpec>,
    pub resources: ResourceSpec,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone)]
pub struct NicSpec {
    pub network: String,
    pub mac: Option<String>,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub vcpu: u32,
    pub mem_mib: u64,
    pub disk_mib: Option<u64>,
}

/// One instantiation action bound to a guest.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub kind: TaskKind,
    pub depends_on: Vec<String>,
    /// A failure of this task fails the whole range and begins teardown.
    pub critical_to_range: bool,
}

/// The closed set of post-boot actions a guest can be configured with.
///
/// Parameters are fully typed here; the task library compiles each variant
/// into remote executor calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    AddUser {
        name: String,
        /// Generated (10 chars) and surfaced in the task result when omitted.
        password: Option<String>,
        #[serde(default)]
        groups: Vec<String>,
        shell: Option<String>,
        /// Reset the password even if the user changed it since creation.
        #[serde(default)]
        force_password: bool,
    },
    ModifyUser {
        name: String,
        changes: UserChanges,
    },
    InstallSshKey {
        user: String,
        public_key: String,
    },
    SetHostname {
        hostname: String,
    },
    FirewallRules {
        /// Complete rule specifications, applied replace-not-append.
        rules: Vec<String>,
    },
    CopyContent {
        /// Controller-local source path.
        src: PathBuf,
        dst: String,
        mode: Option<String>,
        owner: Option<String>,
    },
    RunProgram {
        path: String,
        #[serde(default)]
        argv: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        cwd: Option<String>,
        #[serde(default)]
        expect_exit: i32,
    },
    EmulateAttack {
        attack: AttackKind,
        /// Must resolve inside the range's own subnets; enforced before
        /// execution.
        target: String,
        duration_secs: u64,
        #[serde(default = "default_intensity")]
        intensity: u32,
    },
    PrepareTrafficLog {
        noise: NoiseProfile,
        output_path: String,
    },
}

fn default_intensity() -> u32 {
    1
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::AddUser { .. } => "add_user",
            TaskKind::ModifyUser { .. } => "modify_user",
            TaskKind::InstallSshKey { .. } => "install_ssh_key",
            TaskKind::SetHostname { .. } => "set_hostname",
            TaskKind::FirewallRules { .. } => "firewall_rules",
            TaskKind::CopyContent { .. } => "copy_content",
            TaskKind::RunProgram { .. } => "run_program",
            TaskKind::EmulateAttack { .. } => "emulate_attack",
            TaskKind::PrepareTrafficLog { .. } => "prepare_traffic_log",
        }
    }

    /// Whether re-applying the task on a guest already in its target state
    /// is defined to succeed with zero observable mutation.
    pub fn idempotent(&self) -> bool {
        !matches!(
            self,
            TaskKind::RunProgram { .. } | TaskKind::EmulateAttack { .. }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserChanges {
    pub password: Option<String>,
    pub groups: Option<Vec<String>>,
    pub shell: Option<String>,
    pub full_name: Option<String>,
}

impl UserChanges {
    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.groups.is_none()
            && self.shell.is_none()
            && self.full_name.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    SshBruteforce,
    Dos,
    Ddos,
}

impl AttackKind {
    pub fn describe(&self) -> &'static str {
        match self {
            AttackKind::SshBruteforce => "ssh_bruteforce",
            AttackKind::Dos => "dos",
            AttackKind::Ddos => "ddos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseProfile {
    Low,
    Medium,
    High,
}

/// Optional `[controller]` overrides carried alongside the range spec.
/// Anything left `None` falls back to the core defaults.
#[derive(Debug, Clone, Default)]
pub struct ControllerOverrides {
    pub state_root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub clone_timeout_secs: Option<u64>,
    pub boot_timeout_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub transfer_timeout_secs: Option<u64>,
    pub transfer_streams: Option<usize>,
    pub transfer_streams_per_host: Option<usize>,
    pub overlay_workers: Option<usize>,
}

/// Load and validate a range description from a TOML file.
///
/// Unknown keys anywhere in the document are validation errors, not silent
/// drops. No side effects are performed; the returned spec is safe to plan
/// against.
pub fn load_range_spec(path: &Path) -> Result<RangeSpec> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let value: toml::Value = toml::from_str(&contents).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let unknown = detect_unknown_fields(&value);
    if !unknown.is_empty() {
        return Err(invalid_config(
            path,
            format!(
                "Unknown fields are rejected to avoid silent drops:\n{}",
                unknown
                    .iter()
                    .map(|finding| format!("- {finding}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        ));
    }

    let raw = RawSpec::deserialize(value).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    raw.into_validated(path)
}

fn invalid_config(path: &Path, message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

const ALLOWED_ROOT: [&str; 7] = [
    "version",
    "range",
    "controller",
    "hosts",
    "base_images",
    "networks",
    "guests",
];
const ALLOWED_RANGE: [&str; 4] = ["id", "name", "description", "owner"];
const ALLOWED_CONTROLLER: [&str; 9] = [
    "state_root",
    "workers",
    "clone_timeout_secs",
    "boot_timeout_secs",
    "task_timeout_secs",
    "transfer_timeout_secs",
    "transfer_streams",
    "transfer_streams_per_host",
    "overlay_workers",
];
const ALLOWED_HOST: [&str; 7] = [
    "id", "address", "port", "user", "auth", "provider", "capacity",
];
const ALLOWED_BASE_IMAGE: [&str; 4] = ["id", "source", "host", "fingerprint"];
const ALLOWED_NETWORK: [&str; 7] = [
    "id",
    "host",
    "bridge",
    "subnet",
    "gateway",
    "nat",
    "forwarding_rules",
];
const ALLOWED_GUEST: [&str; 6] = ["id", "base_image", "host", "nics", "resources", "tasks"];
const ALLOWED_NIC: [&str; 3] = ["network", "mac", "ip"];
const ALLOWED_RESOURCES: [&str; 3] = ["vcpu", "mem_mib", "disk_mib"];
const ALLOWED_TASK: [&str; 5] = ["id", "kind", "depends_on", "critical_to_range", "params"];

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut findings = Vec::new();
    let toml::Value::Table(table) = value else {
        return findings;
    };
    check_table(table, &ALLOWED_ROOT, "root", &mut findings);

    if let Some(toml::Value::Table(range)) = table.get("range") {
        check_table(range, &ALLOWED_RANGE, "[range]", &mut findings);
    }
    if let Some(toml::Value::Table(controller)) = table.get("controller") {
        check_table(controller, &ALLOWED_CONTROLLER, "[controller]", &mut findings);
    }
    check_array_of_tables(table, "hosts", &ALLOWED_HOST, &mut findings);
    check_array_of_tables(table, "base_images", &ALLOWED_BASE_IMAGE, &mut findings);
    check_array_of_tables(table, "networks", &ALLOWED_NETWORK, &mut findings);

    if let Some(toml::Value::Array(guests)) = table.get("guests") {
        for (idx, entry) in guests.iter().enumerate() {
            let toml::Value::Table(guest) = entry else {
                findings.push(format!("[[guests]] entry #{idx} must be a table."));
                continue;
            };
            check_table(guest, &ALLOWED_GUEST, &format!("[[guests]] #{idx}"), &mut findings);
            if let Some(toml::Value::Table(resources)) = guest.get("resources") {
                check_table(
                    resources,
                    &ALLOWED_RESOURCES,
                    &format!("[guests.resources] #{idx}"),
                    &mut findings,
                );
            }
            if let Some(toml::Value::Array(nics)) = guest.get("nics") {
                for (nic_idx, nic) in nics.iter().enumerate() {
                    if let toml::Value::Table(nic) = nic {
                        check_table(
                            nic,
                            &ALLOWED_NIC,
                            &format!("[[guests.nics]] #{idx}.{nic_idx}"),
                            &mut findings,
                        );
                    }
                }
            }
            if let Some(toml::Value::Array(tasks)) = guest.get("tasks") {
                for (task_idx, task) in tasks.iter().enumerate() {
                    if let toml::Value::Table(task) = task {
                        check_table(
                            task,
                            &ALLOWED_TASK,
                            &format!("[[guests.tasks]] #{idx}.{task_idx}"),
                            &mut findings,
                        );
                    }
                }
            }
        }
    }

    findings
}

fn check_array_of_tables(
    table: &toml::map::Map<String, toml::Value>,
    key: &str,
    allowed: &[&str],
    findings: &mut Vec<String>,
) {
    if let Some(toml::Value::Array(entries)) = table.get(key) {
        for (idx, entry) in entries.iter().enumerate() {
            if let toml::Value::Table(entry) = entry {
                check_table(entry, allowed, &format!("[[{key}]] #{idx}"), findings);
            } else {
                findings.push(format!("[[{key}]] entry #{idx} must be a table."));
            }
        }
    }
}

fn check_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    findings: &mut Vec<String>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            findings.push(format!("Unknown field `{key}` at {context}."));
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    version: Option<String>,
    range: Option<RawRange>,
    controller: Option<RawController>,
    #[serde(default)]
    hosts: Vec<RawHost>,
    #[serde(default)]
    base_images: Vec<RawBaseImage>,
    #[serde(default)]
    networks: Vec<RawNetwork>,
    #[serde(default)]
    guests: Vec<RawGuest>,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawController {
    state_root: Option<PathBuf>,
    workers: Option<usize>,
    clone_timeout_secs: Option<u64>,
    boot_timeout_secs: Option<u64>,
    task_timeout_secs: Option<u64>,
    transfer_timeout_secs: Option<u64>,
    transfer_streams: Option<usize>,
    transfer_streams_per_host: Option<usize>,
    overlay_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    id: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    auth: Option<String>,
    provider: Option<String>,
    capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawBaseImage {
    id: Option<String>,
    source: Option<String>,
    host: Option<String>,
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    id: Option<String>,
    host: Option<String>,
    bridge: Option<String>,
    subnet: Option<String>,
    gateway: Option<String>,
    nat: Option<bool>,
    #[serde(default)]
    forwarding_rules: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawGuest {
    id: Option<String>,
    base_image: Option<String>,
    host: Option<String>,
    #[serde(default)]
    nics: Vec<RawNic>,
    resources: Option<RawResources>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawNic {
    network: Option<String>,
    mac: Option<String>,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResources {
    vcpu: Option<u32>,
    mem_mib: Option<u64>,
    disk_mib: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: Option<String>,
    kind: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    critical_to_range: bool,
    params: Option<toml::Value>,
}

impl RawSpec {
    fn into_validated(self, path: &Path) -> Result<RangeSpec> {
        let version = self.version.ok_or_else(|| {
            invalid_config(
                path,
                "Missing required top-level field `version`. Example: `version = \"0.1.0\"`.",
            )
        })?;

        let range = self.range.ok_or_else(|| {
            invalid_config(
                path,
                "Missing required table `[range]`. Example:\n\
                 [range]\n\
                 id = \"training-01\"\n\
                 name = \"Intro range\"",
            )
        })?;
        let range_id = range
            .id
            .ok_or_else(|| invalid_config(path, "Missing required field `range.id`."))?;
        validate_identifier(path, "range.id", &range_id)?;
        let range_name = range.name.unwrap_or_else(|| range_id.clone());

        if self.hosts.is_empty() {
            return Err(invalid_config(
                path,
                "At least one `[[hosts]]` entry is required. Example:\n\
                 [[hosts]]\n\
                 id = \"h1\"\n\
                 address = \"172.16.1.10\"\n\
                 user = \"cyris\"\n\
                 auth = \"key:~/.ssh/id_ed25519\"\n\
                 provider = \"kvm\"",
            ));
        }

        let mut seen_hosts = HashSet::new();
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            let id = host
                .id
                .ok_or_else(|| invalid_config(path, "Each `[[hosts]]` entry must define `id`."))?;
            validate_identifier(path, "hosts.id", &id)?;
            if !seen_hosts.insert(id.clone()) {
                return Err(invalid_config(
                    path,
                    format!("Duplicate host id `{id}`. Each host must have a unique `id`."),
                ));
            }
            let address = host.address.ok_or_else(|| {
                invalid_config(path, format!("Host `{id}` is missing required field `address`."))
            })?;
            let user = host.user.ok_or_else(|| {
                invalid_config(path, format!("Host `{id}` is missing required field `user`."))
            })?;
            let auth_raw = host.auth.ok_or_else(|| {
                invalid_config(path, format!("Host `{id}` is missing required field `auth`."))
            })?;
            let auth = AuthRef::parse(&auth_raw)
                .map_err(|message| invalid_config(path, format!("Host `{id}`: {message}")))?;
            let provider = match host.provider.as_deref() {
                Some("kvm") | None => Provider::Kvm,
                Some("cloud-x") => Provider::CloudX,
                Some(other) => {
                    return Err(invalid_config(
                        path,
                        format!(
                            "Host `{id}` declares unknown provider `{other}`. Supported: kvm, cloud-x."
                        ),
                    ));
                }
            };
            let capacity = host.capacity.unwrap_or(DEFAULT_HOST_CAPACITY);
            if capacity == 0 {
                return Err(invalid_config(
                    path,
                    format!("Host `{id}` declares `capacity = 0`; the host could never clone a guest."),
                ));
            }
            hosts.push(HostSpec {
                id,
                address,
                port: host.port.unwrap_or(DEFAULT_SSH_PORT),
                user,
                auth,
                provider,
                capacity,
            });
        }

        let root_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut seen_images = HashSet::new();
        let mut base_images = Vec::with_capacity(self.base_images.len());
        for image in self.base_images {
            let id = image.id.ok_or_else(|| {
                invalid_config(path, "Each `[[base_images]]` entry must define `id`.")
            })?;
            validate_identifier(path, "base_images.id", &id)?;
            if !seen_images.insert(id.clone()) {
                return Err(invalid_config(
                    path,
                    format!("Duplicate base image id `{id}`."),
                ));
            }
            let source_raw = image.source.ok_or_else(|| {
                invalid_config(
                    path,
                    format!("Base image `{id}` is missing required field `source`."),
                )
            })?;
            let source = match image.host {
                Some(host) => {
                    if !seen_hosts.contains(&host) {
                        return Err(invalid_config(
                            path,
                            format!("Base image `{id}` references unknown host `{host}`."),
                        ));
                    }
                    ImageSource::Host {
                        host,
                        path: PathBuf::from(source_raw),
                    }
                }
                None => ImageSource::Controller(resolve_path(&root_dir, PathBuf::from(source_raw))),
            };
            if let Some(fingerprint) = &image.fingerprint {
                validate_fingerprint(path, &id, fingerprint)?;
            }
            base_images.push(BaseImageSpec {
                id,
                source,
                fingerprint: image.fingerprint,
            });
        }

        let mut seen_networks = HashSet::new();
        let mut networks = Vec::with_capacity(self.networks.len());
        for network in self.networks {
            let id = network.id.ok_or_else(|| {
                invalid_config(path, "Each `[[networks]]` entry must define `id`.")
            })?;
            validate_identifier(path, "networks.id", &id)?;
            if !seen_networks.insert(id.clone()) {
                return Err(invalid_config(path, format!("Duplicate network id `{id}`.")));
            }
            let host = network.host.ok_or_else(|| {
                invalid_config(
                    path,
                    format!("Network `{id}` is missing required field `host`."),
                )
            })?;
            if !seen_hosts.contains(&host) {
                return Err(invalid_config(
                    path,
                    format!("Network `{id}` references unknown host `{host}`."),
                ));
            }
            let subnet = match &network.subnet {
                Some(raw) => Some(SubnetSpec::parse(raw).map_err(|message| {
                    invalid_config(path, format!("Network `{id}`: {message}"))
                })?),
                None => None,
            };
            let gateway = match &network.gateway {
                Some(raw) => {
                    let addr: Ipv4Addr = raw.parse().map_err(|_| {
                        invalid_config(
                            path,
                            format!("Network `{id}` gateway `{raw}` is not a valid IPv4 address."),
                        )
                    })?;
                    if let Some(subnet) = subnet {
                        if !subnet.contains(addr) {
                            return Err(invalid_config(
                                path,
                                format!(
                                    "Network `{id}` gateway {addr} lies outside its subnet {subnet}."
                                ),
                            ));
                        }
                    }
                    Some(addr)
                }
                None => None,
            };
            if network.nat == Some(true) && gateway.is_none() {
                return Err(invalid_config(
                    path,
                    format!("Network `{id}` enables NAT but declares no gateway."),
                ));
            }
            let bridge_name = network
                .bridge
                .unwrap_or_else(|| format!("cr-{range_id}-{id}"));
            networks.push(NetworkSpec {
                id,
                host,
                bridge_name,
                subnet,
                gateway,
                nat: network.nat.unwrap_or(false),
                forwarding_rules: network.forwarding_rules,
            });
        }

        let mut seen_guests = HashSet::new();
        let mut guests = Vec::with_capacity(self.guests.len());
        for guest in self.guests {
            let id = guest
                .id
                .ok_or_else(|| invalid_config(path, "Each `[[guests]]` entry must define `id`."))?;
            validate_identifier(path, "guests.id", &id)?;
            if !seen_guests.insert(id.clone()) {
                return Err(invalid_config(path, format!("Duplicate guest id `{id}`.")));
            }
            let base_image = guest.base_image.ok_or_else(|| {
                invalid_config(
                    path,
                    format!("Guest `{id}` is missing required field `base_image`."),
                )
            })?;
            if !seen_images.contains(&base_image) {
                return Err(invalid_config(
                    path,
                    format!("Guest `{id}` references unknown base image `{base_image}`."),
                ));
            }
            if let Some(host) = &guest.host {
                if !seen_hosts.contains(host) {
                    return Err(invalid_config(
                        path,
                        format!("Guest `{id}` references unknown host `{host}`."),
                    ));
                }
            }

            let mut nics = Vec::with_capacity(guest.nics.len());
            for (idx, nic) in guest.nics.into_iter().enumerate() {
                let network = nic.network.ok_or_else(|| {
                    invalid_config(
                        path,
                        format!("Guest `{id}` NIC #{idx} is missing required field `network`."),
                    )
                })?;
                let network_spec = networks
                    .iter()
                    .find(|n| n.id == network)
                    .ok_or_else(|| {
                        invalid_config(
                            path,
                            format!("Guest `{id}` NIC #{idx} references unknown network `{network}`."),
                        )
                    })?;
                if let Some(host) = &guest.host {
                    if network_spec.host != *host {
                        return Err(invalid_config(
                            path,
                            format!(
                                "Guest `{id}` is pinned to host `{host}` but attaches network `{network}` bound to host `{}`.",
                                network_spec.host
                            ),
                        ));
                    }
                }
                if let Some(mac) = &nic.mac {
                    validate_mac(path, &id, mac)?;
                }
                let ip = match &nic.ip {
                    Some(raw) => {
                        let addr: Ipv4Addr = raw.parse().map_err(|_| {
                            invalid_config(
                                path,
                                format!(
                                    "Guest `{id}` NIC #{idx} address `{raw}` is not a valid IPv4 address."
                                ),
                            )
                        })?;
                        if let Some(subnet) = network_spec.subnet {
                            if !subnet.contains(addr) {
                                return Err(invalid_config(
                                    path,
                                    format!(
                                        "Guest `{id}` NIC #{idx} address {addr} lies outside subnet {subnet} of network `{network}`."
                                    ),
                                ));
                            }
                        }
                        Some(addr)
                    }
                    None => None,
                };
                nics.push(NicSpec {
                    network,
                    mac: nic.mac,
                    ip,
                });
            }

            let resources = guest.resources.ok_or_else(|| {
                invalid_config(
                    path,
                    format!(
                        "Guest `{id}` is missing required table `resources`. Example:\n\
                         [guests.resources]\n\
                         vcpu = 2\n\
                         mem_mib = 2048"
                    ),
                )
            })?;
            let vcpu = resources.vcpu.unwrap_or(1);
            let mem_mib = resources.mem_mib.unwrap_or(1024);
            if vcpu == 0 || mem_mib == 0 {
                return Err(invalid_config(
                    path,
                    format!("Guest `{id}` requests zero vcpu or memory."),
                ));
            }

            let tasks = validate_tasks(path, &id, guest.tasks, &root_dir)?;

            guests.push(GuestSpec {
                id,
                base_image,
                host: guest.host,
                nics,
                resources: ResourceSpec {
                    vcpu,
                    mem_mib,
                    disk_mib: resources.disk_mib,
                },
                tasks,
            });
        }

        let controller = match self.controller {
            Some(raw) => ControllerOverrides {
                state_root: raw.state_root,
                workers: raw.workers,
                clone_timeout_secs: raw.clone_timeout_secs,
                boot_timeout_secs: raw.boot_timeout_secs,
                task_timeout_secs: raw.task_timeout_secs,
                transfer_timeout_secs: raw.transfer_timeout_secs,
                transfer_streams: raw.transfer_streams,
                transfer_streams_per_host: raw.transfer_streams_per_host,
                overlay_workers: raw.overlay_workers,
            },
            None => ControllerOverrides::default(),
        };

        let spec = RangeSpec {
            file_path: path.to_path_buf(),
            version,
            range: RangeMeta {
                id: range_id,
                name: range_name,
                description: range.description,
                owner: range.owner,
            },
            hosts,
            base_images,
            networks,
            guests,
            controller,
        };

        ensure_assignable(&spec)?;

        Ok(spec)
    }
}

/// Every floating guest must have at least one eligible host once its
/// network attachments are taken into account.
fn ensure_assignable(spec: &RangeSpec) -> Result<()> {
    for guest in &spec.guests {
        let eligible = spec.eligible_hosts(guest);
        if eligible.is_empty() {
            return Err(invalid_config(
                &spec.file_path,
                format!(
                    "Guest `{}` has no eligible host: its NICs attach networks bound to different hosts.",
                    guest.id
                ),
            ));
        }
    }
    Ok(())
}

fn validate_tasks(
    path: &Path,
    guest: &str,
    raw_tasks: Vec<RawTask>,
    root_dir: &Path,
) -> Result<Vec<TaskSpec>> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(raw_tasks.len());

    for (idx, task) in raw_tasks.into_iter().enumerate() {
        let id = task.id.unwrap_or_else(|| format!("task{idx}"));
        validate_identifier(path, "tasks.id", &id)?;
        if !seen.insert(id.clone()) {
            return Err(invalid_config(
                path,
                format!("Guest `{guest}` declares duplicate task id `{id}`."),
            ));
        }
        let kind_name = task.kind.ok_or_else(|| {
            invalid_config(
                path,
                format!("Guest `{guest}` task `{id}` is missing required field `kind`."),
            )
        })?;
        let params = task
            .params
            .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new()));
        let kind = parse_task_kind(path, guest, &id, &kind_name, params, root_dir)?;

        tasks.push(TaskSpec {
            id,
            kind,
            depends_on: task.depends_on,
            critical_to_range: task.critical_to_range,
        });
    }

    // Dependency edges must resolve within the guest and form no cycle.
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(invalid_config(
                    path,
                    format!(
                        "Guest `{guest}` task `{}` depends on unknown task `{dep}`.",
                        task.id
                    ),
                ));
            }
            if dep == &task.id {
                return Err(invalid_config(
                    path,
                    format!("Guest `{guest}` task `{}` depends on itself.", task.id),
                ));
            }
        }
    }
    if let Some(cycle) = find_cycle(&tasks) {
        return Err(invalid_config(
            path,
            format!(
                "Guest `{guest}` task dependencies form a cycle through `{cycle}`."
            ),
        ));
    }

    Ok(tasks)
}

/// Depth-first cycle detection over the per-guest task graph. Returns a
/// task id on the cycle when one exists.
fn find_cycle(tasks: &[TaskSpec]) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];

    fn visit(
        node: usize,
        tasks: &[TaskSpec],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Option<String> {
        match marks[node] {
            Mark::Done => return None,
            Mark::InProgress => return Some(tasks[node].id.clone()),
            Mark::Unvisited => {}
        }
        marks[node] = Mark::InProgress;
        for dep in &tasks[node].depends_on {
            if let Some(&next) = index.get(dep.as_str()) {
                if let Some(cycle) = visit(next, tasks, index, marks) {
                    return Some(cycle);
                }
            }
        }
        marks[node] = Mark::Done;
        None
    }

    (0..tasks.len()).find_map(|node| visit(node, tasks, &index, &mut marks))
}

fn parse_task_kind(
    path: &Path,
    guest: &str,
    task: &str,
    kind: &str,
    params: toml::Value,
    root_dir: &Path,
) -> Result<TaskKind> {
    let mut table = match params {
        toml::Value::Table(table) => table,
        _ => {
            return Err(invalid_config(
                path,
                format!("Guest `{guest}` task `{task}`: `params` must be a table."),
            ));
        }
    };

    // Internally tagged enums cannot carry serde's unknown-field denial,
    // so parameter keys are checked against the kind's schema here.
    let allowed: &[&str] = match kind {
        "add_user" => &["name", "password", "groups", "shell", "force_password"],
        "modify_user" => &["name", "changes"],
        "install_ssh_key" => &["user", "public_key"],
        "set_hostname" => &["hostname"],
        "firewall_rules" => &["rules"],
        "copy_content" => &["src", "dst", "mode", "owner"],
        "run_program" => &["path", "argv", "env", "cwd", "expect_exit"],
        "emulate_attack" => &["attack", "target", "duration_secs", "intensity"],
        "prepare_traffic_log" => &["noise", "output_path"],
        other => {
            return Err(invalid_config(
                path,
                format!(
                    "Guest `{guest}` task `{task}` declares unknown kind `{other}`. \
                     Supported kinds: add_user, modify_user, install_ssh_key, set_hostname, \
                     firewall_rules, copy_content, run_program, emulate_attack, prepare_traffic_log."
                ),
            ));
        }
    };
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(invalid_config(
                path,
                format!("Guest `{guest}` task `{task}` ({kind}): unknown parameter `{key}`."),
            ));
        }
    }

    table.insert("kind".to_string(), toml::Value::String(kind.to_string()));

    let mut parsed =
        TaskKind::deserialize(toml::Value::Table(table)).map_err(|err| {
            invalid_config(
                path,
                format!("Guest `{guest}` task `{task}` ({kind}): {err}"),
            )
        })?;

    match &mut parsed {
        TaskKind::CopyContent { src, .. } => {
            *src = resolve_path(root_dir, std::mem::take(src));
        }
        TaskKind::EmulateAttack { duration_secs, intensity, .. } => {
            if *duration_secs == 0 {
                return Err(invalid_config(
                    path,
                    format!(
                        "Guest `{guest}` task `{task}`: attack emulation requires a bounded, non-zero duration."
                    ),
                ));
            }
            if *intensity == 0 || *intensity > 10 {
                return Err(invalid_config(
                    path,
                    format!(
                        "Guest `{guest}` task `{task}`: intensity must lie in 1..=10."
                    ),
                ));
            }
        }
        TaskKind::FirewallRules { rules } => {
            if rules.iter().any(|rule| rule.trim().is_empty()) {
                return Err(invalid_config(
                    path,
                    format!("Guest `{guest}` task `{task}`: empty firewall rule."),
                ));
            }
        }
        TaskKind::ModifyUser { changes, .. } => {
            if changes.is_empty() {
                return Err(invalid_config(
                    path,
                    format!(
                        "Guest `{guest}` task `{task}`: `modify_user` declares no changes."
                    ),
                ));
            }
        }
        _ => {}
    }

    Ok(parsed)
}

fn validate_identifier(path: &Path, field: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(invalid_config(
            path,
            format!(
                "Invalid {field} `{value}`: identifiers are non-empty ASCII alphanumerics, `-`, `_`."
            ),
        ))
    }
}

fn validate_fingerprint(path: &Path, image: &str, fingerprint: &str) -> Result<()> {
    let ok = fingerprint.len() == 64 && fingerprint.chars().all(|c| c.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(invalid_config(
            path,
            format!(
                "Base image `{image}` fingerprint must be 64 hex characters (SHA-256), got `{fingerprint}`."
            ),
        ))
    }
}

fn validate_mac(path: &Path, guest: &str, mac: &str) -> Result<()> {
    let parts: Vec<&str> = mac.split(':').collect();
    let ok = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(())
    } else {
        Err(invalid_config(
            path,
            format!("Guest `{guest}` declares malformed MAC `{mac}`."),
        ))
    }
}

fn resolve_path(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_spec(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("range.toml");
        fs::write(&path, contents).expect("write spec");
        (dir, path)
    }

    const MINIMAL: &str = r#"
version = "0.1.0"

[range]
id = "training-01"
name = "Intro range"

[[hosts]]
id = "h1"
address = "172.16.1.10"
user = "cyris"
auth = "agent"
provider = "kvm"

[[base_images]]
id = "b1"
source = "images/base.qcow2"

[[networks]]
id = "office"
host = "h1"
subnet = "10.1.1.0/24"
gateway = "10.1.1.1"

[[guests]]
id = "desktop"
base_image = "b1"

[guests.resources]
vcpu = 2
mem_mib = 2048

[[guests.nics]]
network = "office"
ip = "10.1.1.5"

[[guests.tasks]]
id = "user"
kind = "add_user"

[guests.tasks.params]
name = "trainee01"
"#;

    #[test]
    fn minimal_spec_validates() {
        let (_dir, path) = write_spec(MINIMAL);
        let spec = load_range_spec(&path).expect("load");
        assert_eq!(spec.range.id, "training-01");
        assert_eq!(spec.hosts.len(), 1);
        assert_eq!(spec.guests.len(), 1);
        let guest = &spec.guests[0];
        assert_eq!(guest.tasks.len(), 1);
        assert!(matches!(guest.tasks[0].kind, TaskKind::AddUser { .. }));
        assert_eq!(spec.eligible_hosts(guest), vec!["h1".to_string()]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mutated = MINIMAL.replace("name = \"Intro range\"", "name = \"x\"\nflavour = \"y\"");
        let (_dir, path) = write_spec(&mutated);
        let err = load_range_spec(&path).expect_err("unknown field must fail");
        let message = err.to_string();
        assert!(message.contains("flavour"), "{message}");
    }

    #[test]
    fn unknown_network_reference_is_rejected() {
        let mutated = MINIMAL.replace("network = \"office\"", "network = \"lab\"");
        let (_dir, path) = write_spec(&mutated);
        let err = load_range_spec(&path).expect_err("unknown ref must fail");
        assert!(err.to_string().contains("unknown network `lab`"));
    }

    #[test]
    fn task_dependency_cycle_is_rejected() {
        let extra = r#"
[[guests.tasks]]
id = "a"
kind = "set_hostname"
depends_on = ["b"]

[guests.tasks.params]
hostname = "desktop"

[[guests.tasks]]
id = "b"
kind = "set_hostname"
depends_on = ["a"]

[guests.tasks.params]
hostname = "desktop"
"#;
        let (_dir, path) = write_spec(&format!("{MINIMAL}{extra}"));
        let err = load_range_spec(&path).expect_err("cycle must fail");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn guest_ip_outside_subnet_is_rejected() {
        let mutated = MINIMAL.replace("ip = \"10.1.1.5\"", "ip = \"10.9.9.5\"");
        let (_dir, path) = write_spec(&mutated);
        let err = load_range_spec(&path).expect_err("out-of-subnet ip must fail");
        assert!(err.to_string().contains("outside subnet"));
    }

    #[test]
    fn pinned_guest_cannot_attach_foreign_network() {
        let mutated = MINIMAL
            .replace(
                "[[guests]]\nid = \"desktop\"",
                "[[hosts]]\nid = \"h2\"\naddress = \"172.16.1.11\"\nuser = \"cyris\"\nauth = \"agent\"\nprovider = \"kvm\"\n\n[[guests]]\nid = \"desktop\"\nhost = \"h2\"",
            );
        let (_dir, path) = write_spec(&mutated);
        let err = load_range_spec(&path).expect_err("cross-host attach must fail");
        assert!(err.to_string().contains("bound to host"));
    }

    #[test]
    fn subnet_containment() {
        let subnet = SubnetSpec::parse("10.1.1.0/24").expect("parse");
        assert!(subnet.contains("10.1.1.200".parse().unwrap()));
        assert!(!subnet.contains("10.1.2.1".parse().unwrap()));
    }

    #[test]
    fn attack_duration_must_be_bounded() {
        let extra = r#"
[[guests.tasks]]
id = "atk"
kind = "emulate_attack"

[guests.tasks.params]
attack = "dos"
target = "10.1.1.5"
duration_secs = 0
"#;
        let (_dir, path) = write_spec(&format!("{MINIMAL}{extra}"));
        let err = load_range_spec(&path).expect_err("zero duration must fail");
        assert!(err.to_string().contains("non-zero duration"));
    }

    #[test]
    fn auth_ref_forms() {
        assert_eq!(AuthRef::parse("agent").unwrap(), AuthRef::Agent);
        assert_eq!(
            AuthRef::parse("key:/root/.ssh/id_ed25519").unwrap(),
            AuthRef::KeyFile(PathBuf::from("/root/.ssh/id_ed25519"))
        );
        assert_eq!(
            AuthRef::parse("password-env:CYRIS_H1_PASSWORD").unwrap(),
            AuthRef::PasswordEnv("CYRIS_H1_PASSWORD".to_string())
        );
        assert!(AuthRef::parse("kerberos").is_err());
    }
}
