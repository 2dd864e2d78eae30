use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::HostSpec;
use crate::core::executor::{RemoteExecutor, Target};
use crate::core::model::PowerState;
use crate::error::{Error, Result};

use super::{
    DomainDefinition, GuestHandle, GuestObservation, HypervisorDriver, NetworkDefinition,
    NetworkHandle, domain_title, parse_domain_title,
};

const VIRSH_RETRY_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Local-virtualization driver: libvirt over `virsh`, reached locally or
/// through a `qemu+ssh://` connection URI. Guest storage is a per-guest
/// qcow2 overlay whose backing file is the host-local base image, so N
/// guests from one base consume roughly the written delta, not N copies.
pub struct KvmDriver {
    host: HostSpec,
    uri: String,
    virsh: PathBuf,
    executor: Arc<RemoteExecutor>,
    scratch_dir: PathBuf,
}

impl KvmDriver {
    pub fn new(host: HostSpec, executor: Arc<RemoteExecutor>, scratch_dir: PathBuf) -> Self {
        let uri = connection_uri(&host);
        let virsh = std::env::var("CYRIS_VIRSH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("virsh"));
        Self {
            host,
            uri,
            virsh,
            executor,
            scratch_dir,
        }
    }

    fn target(&self) -> Target {
        Target::for_host(&self.host)
    }

    /// Run one virsh subcommand against this host's connection URI.
    /// A narrow busy/locked error class is retried once after backoff;
    /// everything else surfaces immediately.
    fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let output = Command::new(&self.virsh)
                .arg("-c")
                .arg(&self.uri)
                .args(args)
                .output()
                .map_err(|err| Error::Hypervisor {
                    host: self.host.id.clone(),
                    message: format!("failed to spawn {}: {err}", self.virsh.display()),
                })?;

            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if attempt == 1 && is_transient_virsh_error(&stderr) {
                thread::sleep(VIRSH_RETRY_DELAY);
                continue;
            }
            return Err(Error::Hypervisor {
                host: self.host.id.clone(),
                message: format!("virsh {} failed: {}", args.join(" "), stderr.trim()),
            });
        }
    }

    fn virsh_allowing(&self, args: &[&str], tolerated: &[&str]) -> Result<bool> {
        match self.virsh(args) {
            Ok(_) => Ok(true),
            Err(Error::Hypervisor { message, .. })
                if tolerated.iter().any(|needle| message.contains(needle)) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Write a definition document into the controller scratch area so
    /// virsh can read it. The file is deleted after the define call.
    fn write_scratch(&self, name: &str, contents: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.scratch_dir).map_err(|source| Error::CreateDir {
            path: self.scratch_dir.clone(),
            source,
        })?;
        let path = self
            .scratch_dir
            .join(format!("{}-{}.xml", name, std::process::id()));
        fs::write(&path, contents).map_err(|source| Error::WriteState {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn domain_state(&self, domain: &str) -> Result<PowerState> {
        let output = self.virsh(&["domstate", domain])?;
        Ok(parse_domstate(&output))
    }
}

impl HypervisorDriver for KvmDriver {
    fn host_id(&self) -> &str {
        &self.host.id
    }

    fn ensure_network(&self, definition: &NetworkDefinition) -> Result<NetworkHandle> {
        let name = definition.bridge_name.as_str();
        if self.virsh_allowing(&["net-info", name], &["Network not found", "no network with"])? {
            return Ok(NetworkHandle {
                host: self.host.id.clone(),
                network_id: definition.network_id.clone(),
                bridge_name: definition.bridge_name.clone(),
                created: false,
            });
        }

        let xml = render_network_xml(definition);
        let path = self.write_scratch(name, &xml)?;
        let define = self.virsh(&["net-define", &path.to_string_lossy()]);
        let _ = fs::remove_file(&path);
        define?;
        self.virsh(&["net-start", name])?;

        Ok(NetworkHandle {
            host: self.host.id.clone(),
            network_id: definition.network_id.clone(),
            bridge_name: definition.bridge_name.clone(),
            created: true,
        })
    }

    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
        let tolerated = ["Network not found", "no network with", "not active"];
        self.virsh_allowing(&["net-destroy", &handle.bridge_name], &tolerated)?;
        self.virsh_allowing(&["net-undefine", &handle.bridge_name], &tolerated)?;
        Ok(())
    }

    fn clone_guest(&self, definition: &DomainDefinition) -> Result<GuestHandle> {
        // The overlay must already exist on the host; a missing overlay
        // means image placement never happened for this guest.
        let overlay = definition.overlay_path.to_string_lossy();
        let probe = self.executor.run(
            &self.target(),
            &format!("test -f {}", shell_quote(&overlay)),
            None,
            FILE_OP_TIMEOUT,
        )?;
        if !probe.success() {
            return Err(Error::Hypervisor {
                host: self.host.id.clone(),
                message: format!(
                    "overlay {} is missing on host `{}`; base image was never placed",
                    overlay, self.host.id
                ),
            });
        }

        let xml = render_domain_xml(definition);
        let path = self.write_scratch(&definition.domain_name, &xml)?;
        let define = self.virsh(&["define", &path.to_string_lossy()]);
        let _ = fs::remove_file(&path);
        define?;

        Ok(GuestHandle {
            host: self.host.id.clone(),
            domain: definition.domain_name.clone(),
            range_id: Some(definition.range_id.clone()),
            guest_id: Some(definition.guest_id.clone()),
            overlay_path: Some(definition.overlay_path.clone()),
        })
    }

    fn start(&self, handle: &GuestHandle) -> Result<()> {
        self.virsh_allowing(&["start", &handle.domain], &["already active"])?;
        Ok(())
    }

    fn shutdown(&self, handle: &GuestHandle, graceful_timeout: Duration) -> Result<bool> {
        match self.domain_state(&handle.domain)? {
            PowerState::Off => return Ok(true),
            PowerState::Running | PowerState::Unknown => {}
        }
        self.virsh_allowing(&["shutdown", &handle.domain], &["not running"])?;

        let deadline = Instant::now() + graceful_timeout;
        loop {
            if matches!(self.domain_state(&handle.domain)?, PowerState::Off) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }

    fn force_off(&self, handle: &GuestHandle) -> Result<()> {
        self.virsh_allowing(
            &["destroy", &handle.domain],
            &["not running", "Domain not found", "no domain with"],
        )?;
        Ok(())
    }

    fn destroy(&self, handle: &GuestHandle, delete_storage: bool) -> Result<()> {
        // Destroy may race a domain that is already off or already gone;
        // one tolerated set covers both the stop and the undefine.
        let tolerated = ["not running", "Domain not found", "no domain with"];
        self.virsh_allowing(&["destroy", &handle.domain], &tolerated)?;
        self.virsh_allowing(&["undefine", &handle.domain], &tolerated)?;

        if delete_storage {
            if let Some(overlay) = &handle.overlay_path {
                let overlay = overlay.to_string_lossy();
                self.executor.run(
                    &self.target(),
                    &format!("rm -f {}", shell_quote(&overlay)),
                    None,
                    FILE_OP_TIMEOUT,
                )?;
            }
        }
        Ok(())
    }

    fn observe(&self, handle: &GuestHandle) -> Result<GuestObservation> {
        let power = self.domain_state(&handle.domain)?;
        if !matches!(power, PowerState::Running) {
            return Ok(GuestObservation {
                power,
                leased_ips: Vec::new(),
                agent_reachable: false,
            });
        }

        let leased_ips = match self.virsh(&["domifaddr", &handle.domain, "--source", "lease"]) {
            Ok(output) => parse_domifaddr(&output),
            Err(_) => Vec::new(),
        };
        let agent_reachable = self
            .virsh(&["domifaddr", &handle.domain, "--source", "agent"])
            .map(|output| !parse_domifaddr(&output).is_empty())
            .unwrap_or(false);

        Ok(GuestObservation {
            power,
            leased_ips,
            agent_reachable,
        })
    }

    fn list_domains(&self, label: &str) -> Result<Vec<GuestHandle>> {
        let listing = self.virsh(&["list", "--all", "--name"])?;
        let mut handles = Vec::new();
        for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let title = match self.virsh(&["desc", name, "--title"]) {
                Ok(title) => title,
                // The domain may vanish between list and desc.
                Err(_) => continue,
            };
            if !title.contains(label) {
                continue;
            }
            let (range_id, guest_id) = parse_domain_title(title.trim());
            handles.push(GuestHandle {
                host: self.host.id.clone(),
                domain: name.to_string(),
                range_id,
                guest_id,
                overlay_path: None,
            });
        }
        Ok(handles)
    }
}

fn connection_uri(host: &HostSpec) -> String {
    if matches!(host.address.as_str(), "localhost" | "127.0.0.1" | "::1") {
        "qemu:///system".to_string()
    } else {
        format!("qemu+ssh://{}@{}/system", host.user, host.address)
    }
}

fn is_transient_virsh_error(stderr: &str) -> bool {
    stderr.contains("is busy")
        || stderr.contains("locked")
        || stderr.contains("Timed out during operation")
}

fn parse_domstate(output: &str) -> PowerState {
    match output.trim() {
        "running" | "idle" | "paused" => PowerState::Running,
        "shut off" | "crashed" | "pmsuspended" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

/// Parse `virsh domifaddr` tabular output into plain addresses.
fn parse_domifaddr(output: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    for line in output.lines().skip(2) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 4 {
            continue;
        }
        if columns[2] != "ipv4" && columns[2] != "ipv6" {
            continue;
        }
        let address = columns[3].split('/').next().unwrap_or(columns[3]);
        if !address.is_empty() {
            addresses.push(address.to_string());
        }
    }
    addresses
}

fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::new(0, 0, 0, 0);
    }
    Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))
}

fn render_network_xml(definition: &NetworkDefinition) -> String {
    let mut xml = String::new();
    xml.push_str("<network>\n");
    xml.push_str(&format!(
        "  <name>{}</name>\n",
        xml_escape(&definition.bridge_name)
    ));
    xml.push_str(&format!(
        "  <bridge name='{}' stp='on' delay='0'/>\n",
        xml_escape(&definition.bridge_name)
    ));
    if definition.nat {
        xml.push_str("  <forward mode='nat'/>\n");
    }
    if let (Some(subnet), Some(gateway)) = (definition.subnet, definition.gateway) {
        let netmask = netmask_from_prefix(subnet.prefix_len);
        let (dhcp_start, dhcp_end) = dhcp_range(subnet);
        xml.push_str(&format!(
            "  <ip address='{gateway}' netmask='{netmask}'>\n"
        ));
        xml.push_str("    <dhcp>\n");
        xml.push_str(&format!(
            "      <range start='{dhcp_start}' end='{dhcp_end}'/>\n"
        ));
        xml.push_str("    </dhcp>\n");
        xml.push_str("  </ip>\n");
    }
    xml.push_str("</network>\n");
    xml
}

/// DHCP pool inside a subnet: skip the first ten addresses (gateway and
/// statically-assigned guests), stop one short of broadcast.
fn dhcp_range(subnet: crate::config::SubnetSpec) -> (Ipv4Addr, Ipv4Addr) {
    let base = u32::from(subnet.network);
    let span = if subnet.prefix_len >= 31 {
        2
    } else {
        1u32 << (32 - u32::from(subnet.prefix_len))
    };
    let start = base.saturating_add(10.min(span / 2));
    let end = base + span - 2;
    (Ipv4Addr::from(start), Ipv4Addr::from(end.max(start)))
}

fn render_domain_xml(definition: &DomainDefinition) -> String {
    let mem_kib = definition.mem_mib * 1024;
    let mut xml = String::new();
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!(
        "  <name>{}</name>\n",
        xml_escape(&definition.domain_name)
    ));
    xml.push_str(&format!(
        "  <title>{}</title>\n",
        xml_escape(&domain_title(&definition.range_id, &definition.guest_id))
    ));
    xml.push_str(&format!("  <memory unit='KiB'>{mem_kib}</memory>\n"));
    xml.push_str(&format!(
        "  <vcpu placement='static'>{}</vcpu>\n",
        definition.vcpu
    ));
    xml.push_str("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
    xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");
    xml.push_str("  <devices>\n");
    xml.push_str(&format!(
        "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>\n",
        xml_escape(&definition.overlay_path.to_string_lossy())
    ));
    for nic in &definition.nics {
        xml.push_str("    <interface type='network'>\n");
        xml.push_str(&format!(
            "      <source network='{}'/>\n",
            xml_escape(&nic.bridge_name)
        ));
        if let Some(mac) = &nic.mac {
            xml.push_str(&format!("      <mac address='{}'/>\n", xml_escape(mac)));
        }
        xml.push_str("      <model type='virtio'/>\n    </interface>\n");
    }
    xml.push_str("    <serial type='pty'><target port='0'/></serial>\n");
    xml.push_str("    <console type='pty'><target type='serial' port='0'/></console>\n");
    xml.push_str("    <channel type='unix'>\n      <target type='virtio' name='org.qemu.guest_agent.0'/>\n    </channel>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

pub(crate) fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubnetSpec;

    #[test]
    fn remote_hosts_get_ssh_uris() {
        let mut host = sample_host();
        assert_eq!(
            connection_uri(&host),
            "qemu+ssh://cyris@172.16.1.10/system"
        );
        host.address = "localhost".to_string();
        assert_eq!(connection_uri(&host), "qemu:///system");
    }

    fn sample_host() -> HostSpec {
        HostSpec {
            id: "h1".to_string(),
            address: "172.16.1.10".to_string(),
            port: 22,
            user: "cyris".to_string(),
            auth: crate::config::AuthRef::Agent,
            provider: crate::config::Provider::Kvm,
            capacity: 4,
        }
    }

    #[test]
    fn domifaddr_parsing_strips_prefixes() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:f5:9a:2e    ipv4         192.168.122.134/24
 vnet1      52:54:00:11:22:33    ipv6         fe80::1/64
";
        assert_eq!(
            parse_domifaddr(output),
            vec!["192.168.122.134".to_string(), "fe80::1".to_string()]
        );
    }

    #[test]
    fn domifaddr_parsing_survives_empty_output() {
        assert!(parse_domifaddr("").is_empty());
        assert!(parse_domifaddr(" Name MAC\n----\n").is_empty());
    }

    #[test]
    fn domstate_maps_libvirt_vocabulary() {
        assert_eq!(parse_domstate("running\n"), PowerState::Running);
        assert_eq!(parse_domstate("shut off\n"), PowerState::Off);
        assert_eq!(parse_domstate("in shutdown\n"), PowerState::Unknown);
    }

    #[test]
    fn network_xml_includes_nat_and_dhcp() {
        let definition = NetworkDefinition {
            range_id: "r1".to_string(),
            network_id: "office".to_string(),
            bridge_name: "cr-r1-office".to_string(),
            subnet: Some(SubnetSpec::parse("10.1.1.0/24").unwrap()),
            gateway: Some("10.1.1.1".parse().unwrap()),
            nat: true,
        };
        let xml = render_network_xml(&definition);
        assert!(xml.contains("<forward mode='nat'/>"));
        assert!(xml.contains("<ip address='10.1.1.1' netmask='255.255.255.0'>"));
        assert!(xml.contains("start='10.1.1.10'"));
        assert!(xml.contains("end='10.1.1.254'"));
    }

    #[test]
    fn domain_xml_carries_labels_and_overlay() {
        let definition = DomainDefinition {
            range_id: "r1".to_string(),
            guest_id: "desktop".to_string(),
            domain_name: "cr-r1-desktop".to_string(),
            vcpu: 2,
            mem_mib: 2048,
            base_fingerprint: "ab".repeat(32),
            overlay_path: PathBuf::from("/var/lib/cyris/overlays/cr-r1-desktop.qcow2"),
            nics: vec![super::super::DomainNic {
                bridge_name: "cr-r1-office".to_string(),
                mac: Some("52:54:00:00:00:01".to_string()),
            }],
        };
        let xml = render_domain_xml(&definition);
        assert!(xml.contains("<title>cyris.range=r1 cyris.guest=desktop</title>"));
        assert!(xml.contains("<memory unit='KiB'>2097152</memory>"));
        assert!(xml.contains("overlays/cr-r1-desktop.qcow2"));
        assert!(xml.contains("<mac address='52:54:00:00:00:01'/>"));
    }

    #[test]
    fn shell_quote_defuses_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn transient_errors_are_narrow() {
        assert!(is_transient_virsh_error("error: Requested operation is not valid: domain is busy"));
        assert!(is_transient_virsh_error("error: resource is locked"));
        assert!(!is_transient_virsh_error("error: Domain not found"));
    }
}
