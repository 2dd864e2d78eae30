use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::config::{AttackKind, NoiseProfile, SubnetSpec, TaskKind, UserChanges};
use crate::error::{Error, Result};

use super::executor::{ExecOutput, RemoteExecutor, Target};

/// Length of generated passwords for `add_user` tasks that omit one.
const GENERATED_PASSWORD_LEN: usize = 10;
const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
/// Detail strings keep at most this much captured output.
const DETAIL_TAIL: usize = 2048;

/// Everything a task application needs: the shared executor, the guest
/// target, budgets, and where collected artifacts land on the controller.
pub struct TaskContext<'a> {
    pub executor: &'a RemoteExecutor,
    pub target: &'a Target,
    pub timeout: Duration,
    /// Controller-side directory receiving collected artifacts (pcaps).
    pub artifacts_dir: &'a Path,
    /// Subnets of the owning range, for attack-target containment.
    pub range_subnets: &'a [SubnetSpec],
}

/// Terminal result of one task application.
#[derive(Debug)]
pub struct TaskReport {
    pub success: bool,
    pub captured_output: String,
    pub artifacts: Vec<String>,
    pub duration: Duration,
    /// Set when `add_user` generated a password; surfaced in the create
    /// result so the operator can hand out credentials.
    pub generated_password: Option<String>,
}

impl TaskReport {
    fn ok(captured: String, started: Instant) -> Self {
        Self {
            success: true,
            captured_output: captured,
            artifacts: Vec::new(),
            duration: started.elapsed(),
            generated_password: None,
        }
    }

    fn failed(captured: String, started: Instant) -> Self {
        Self {
            success: false,
            captured_output: captured,
            artifacts: Vec::new(),
            duration: started.elapsed(),
            generated_password: None,
        }
    }
}

/// Apply one task to a guest. Transport failures surface as errors after
/// the executor's retry policy; a command that runs and exits non-zero is
/// a failed report, not an error.
pub fn apply_task(kind: &TaskKind, ctx: &TaskContext<'_>) -> Result<TaskReport> {
    let started = Instant::now();
    match kind {
        TaskKind::AddUser {
            name,
            password,
            groups,
            shell,
            force_password,
        } => add_user(ctx, started, name, password.as_deref(), groups, shell.as_deref(), *force_password),
        TaskKind::ModifyUser { name, changes } => modify_user(ctx, started, name, changes),
        TaskKind::InstallSshKey { user, public_key } => {
            install_ssh_key(ctx, started, user, public_key)
        }
        TaskKind::SetHostname { hostname } => set_hostname(ctx, started, hostname),
        TaskKind::FirewallRules { rules } => firewall_rules(ctx, started, rules),
        TaskKind::CopyContent {
            src,
            dst,
            mode,
            owner,
        } => copy_content(ctx, started, src, dst, mode.as_deref(), owner.as_deref()),
        TaskKind::RunProgram {
            path,
            argv,
            env,
            cwd,
            expect_exit,
        } => run_program(ctx, started, path, argv, env, cwd.as_deref(), *expect_exit),
        TaskKind::EmulateAttack {
            attack,
            target,
            duration_secs,
            intensity,
        } => emulate_attack(ctx, started, *attack, target, *duration_secs, *intensity),
        TaskKind::PrepareTrafficLog { noise, output_path } => {
            prepare_traffic_log(ctx, started, *noise, output_path)
        }
    }
}

/// Attack-emulation safety pre-check: the declared target must resolve to
/// an address inside the range's own networks. Enforced before the attack
/// script is ever placed on a guest.
pub fn ensure_target_contained(target: &str, subnets: &[SubnetSpec]) -> Result<Ipv4Addr> {
    let addr: Ipv4Addr = target.parse().map_err(|_| Error::Validation {
        message: format!(
            "attack target `{target}` is not an IPv4 address; emulation refuses to resolve external names"
        ),
    })?;
    if subnets.iter().any(|subnet| subnet.contains(addr)) {
        Ok(addr)
    } else {
        Err(Error::Validation {
            message: format!(
                "attack target {addr} lies outside the range's own networks; refusing to emulate"
            ),
        })
    }
}

fn run(ctx: &TaskContext<'_>, command: &str) -> Result<ExecOutput> {
    ctx.executor.run(ctx.target, command, None, ctx.timeout)
}

fn run_with_stdin(ctx: &TaskContext<'_>, command: &str, stdin: &[u8]) -> Result<ExecOutput> {
    ctx.executor
        .run(ctx.target, command, Some(stdin), ctx.timeout)
}

fn capture(output: &ExecOutput) -> String {
    let stdout = output.stdout.tail_string(DETAIL_TAIL);
    let stderr = output.stderr.tail_string(DETAIL_TAIL);
    if stderr.is_empty() {
        stdout
    } else if stdout.is_empty() {
        stderr
    } else {
        format!("{stdout}\n{stderr}")
    }
}

fn add_user(
    ctx: &TaskContext<'_>,
    started: Instant,
    name: &str,
    password: Option<&str>,
    groups: &[String],
    shell: Option<&str>,
    force_password: bool,
) -> Result<TaskReport> {
    let shell = shell.unwrap_or("/bin/bash");
    let probe = run(ctx, &probe_user_command(name))?;
    let existed = probe.success();

    if existed {
        let output = run(ctx, &format!("usermod -s {} {}", quote(shell), quote(name)))?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    } else {
        let output = run(ctx, &useradd_command(name, shell))?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }

    if !groups.is_empty() {
        let output = run(ctx, &set_groups_command(name, groups))?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }

    // A pre-existing account keeps whatever password it has unless the
    // task explicitly forces a reset.
    let mut generated = None;
    let to_set = match password {
        Some(password) => Some(password.to_string()),
        None if !existed || force_password => {
            let password = generate_password(name);
            generated = Some(password.clone());
            Some(password)
        }
        None => None,
    };
    if let Some(effective) = to_set {
        let output = run_with_stdin(
            ctx,
            "chpasswd",
            format!("{name}:{effective}\n").as_bytes(),
        )?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }

    let mut report = TaskReport::ok(format!("user `{name}` present"), started);
    report.generated_password = generated;
    Ok(report)
}

fn modify_user(
    ctx: &TaskContext<'_>,
    started: Instant,
    name: &str,
    changes: &UserChanges,
) -> Result<TaskReport> {
    let probe = run(ctx, &probe_user_command(name))?;
    if !probe.success() {
        return Ok(TaskReport::failed(
            format!("user `{name}` does not exist"),
            started,
        ));
    }

    if let Some(command) = usermod_command(name, changes) {
        let output = run(ctx, &command)?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }
    if let Some(password) = &changes.password {
        let output = run_with_stdin(
            ctx,
            "chpasswd",
            format!("{name}:{password}\n").as_bytes(),
        )?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }

    Ok(TaskReport::ok(format!("user `{name}` updated"), started))
}

fn install_ssh_key(
    ctx: &TaskContext<'_>,
    started: Instant,
    user: &str,
    public_key: &str,
) -> Result<TaskReport> {
    let key = public_key.trim();
    let home_probe = run(
        ctx,
        &format!("getent passwd {} | cut -d: -f6", quote(user)),
    )?;
    if !home_probe.success() {
        return Ok(TaskReport::failed(
            format!("user `{user}` has no passwd entry"),
            started,
        ));
    }
    let home = home_probe.stdout.render().trim().to_string();
    if home.is_empty() {
        return Ok(TaskReport::failed(
            format!("user `{user}` has an empty home directory field"),
            started,
        ));
    }
    let authorized = format!("{home}/.ssh/authorized_keys");

    // Skip when the exact line is already present, leaving the file
    // byte-for-byte untouched.
    let present = run(
        ctx,
        &format!("grep -qxF {} {}", quote(key), quote(&authorized)),
    )?;
    if present.success() {
        return Ok(TaskReport::ok(
            "key already present; authorized_keys unchanged".to_string(),
            started,
        ));
    }

    let install = run_with_stdin(
        ctx,
        &install_key_command(user, &home),
        format!("{key}\n").as_bytes(),
    )?;
    if !install.success() {
        return Ok(TaskReport::failed(capture(&install), started));
    }
    Ok(TaskReport::ok(
        format!("key installed for `{user}`"),
        started,
    ))
}

fn set_hostname(ctx: &TaskContext<'_>, started: Instant, hostname: &str) -> Result<TaskReport> {
    let current = run(ctx, "hostname")?;
    if current.success() && current.stdout.render().trim() == hostname {
        return Ok(TaskReport::ok("hostname already set".to_string(), started));
    }
    let output = run(ctx, &set_hostname_command(hostname))?;
    if output.success() {
        Ok(TaskReport::ok(format!("hostname set to `{hostname}`"), started))
    } else {
        Ok(TaskReport::failed(capture(&output), started))
    }
}

fn firewall_rules(
    ctx: &TaskContext<'_>,
    started: Instant,
    rules: &[String],
) -> Result<TaskReport> {
    // Replace-not-append: flush, then apply the declared set in order.
    let flush = run(ctx, "iptables -F && iptables -X")?;
    if !flush.success() {
        return Ok(TaskReport::failed(capture(&flush), started));
    }
    for rule in rules {
        let output = run(ctx, &format!("iptables {rule}"))?;
        if !output.success() {
            return Ok(TaskReport::failed(
                format!("rule `{rule}` rejected: {}", capture(&output)),
                started,
            ));
        }
    }
    // Persist where the distribution supports it; absence of the helper
    // is not a failure.
    let _ = run(
        ctx,
        "command -v netfilter-persistent >/dev/null && netfilter-persistent save || true",
    )?;
    Ok(TaskReport::ok(
        format!("{} rule(s) applied", rules.len()),
        started,
    ))
}

fn copy_content(
    ctx: &TaskContext<'_>,
    started: Instant,
    src: &Path,
    dst: &str,
    mode: Option<&str>,
    owner: Option<&str>,
) -> Result<TaskReport> {
    let local_hash = sha256_file(src)?;

    let probe = run(
        ctx,
        &format!("sha256sum {} 2>/dev/null | cut -d' ' -f1", quote(dst)),
    )?;
    if probe.success() && probe.stdout.render().trim() == local_hash {
        return Ok(TaskReport::ok(
            "destination hash matches source; copy skipped".to_string(),
            started,
        ));
    }

    if let Some(parent) = Path::new(dst).parent() {
        let parent = parent.to_string_lossy();
        if !parent.is_empty() && parent != "/" {
            let output = run(ctx, &format!("mkdir -p {}", quote(&parent)))?;
            if !output.success() {
                return Ok(TaskReport::failed(capture(&output), started));
            }
        }
    }

    let mode_bits = mode
        .map(|m| i32::from_str_radix(m, 8))
        .transpose()
        .map_err(|_| Error::Validation {
            message: format!("copy_content mode `{}` is not octal", mode.unwrap_or_default()),
        })?
        .unwrap_or(0o644);
    ctx.executor.put(ctx.target, src, dst, mode_bits)?;

    let verify = run(
        ctx,
        &format!("sha256sum {} | cut -d' ' -f1", quote(dst)),
    )?;
    let observed = verify.stdout.render().trim().to_string();
    if !verify.success() || observed != local_hash {
        return Ok(TaskReport::failed(
            format!("post-copy hash mismatch: expected {local_hash}, found {observed}"),
            started,
        ));
    }

    if let Some(owner) = owner {
        let output = run(ctx, &format!("chown {} {}", quote(owner), quote(dst)))?;
        if !output.success() {
            return Ok(TaskReport::failed(capture(&output), started));
        }
    }

    Ok(TaskReport::ok(format!("{dst} in place"), started))
}

fn run_program(
    ctx: &TaskContext<'_>,
    started: Instant,
    path: &str,
    argv: &[String],
    env: &std::collections::BTreeMap<String, String>,
    cwd: Option<&str>,
    expect_exit: i32,
) -> Result<TaskReport> {
    let command = run_program_command(path, argv, env, cwd);
    let output = run(ctx, &command)?;
    let captured = capture(&output);
    if output.exit == expect_exit {
        Ok(TaskReport::ok(captured, started))
    } else {
        Ok(TaskReport::failed(
            format!("exit {} (expected {expect_exit}): {captured}", output.exit),
            started,
        ))
    }
}

fn emulate_attack(
    ctx: &TaskContext<'_>,
    started: Instant,
    attack: AttackKind,
    target: &str,
    duration_secs: u64,
    intensity: u32,
) -> Result<TaskReport> {
    // Defense in depth: the orchestrator already vetoes external targets,
    // but a driver used directly gets the same check.
    let addr = ensure_target_contained(target, ctx.range_subnets)?;

    let pcap_remote = format!("/tmp/cyris-{}-{}.pcap", attack.describe(), addr);
    let script = attack_script(attack, addr, duration_secs, intensity, &pcap_remote);

    let output = run_with_stdin(ctx, "sh -s", script.as_bytes())?;
    let captured = capture(&output);
    if !output.success() {
        return Ok(TaskReport::failed(captured, started));
    }

    // Collect the capture to the controller next to the range state.
    std::fs::create_dir_all(ctx.artifacts_dir).map_err(|source| Error::CreateDir {
        path: ctx.artifacts_dir.to_path_buf(),
        source,
    })?;
    let local_pcap = ctx.artifacts_dir.join(format!(
        "{}-{}-{}.pcap",
        ctx.target.id,
        attack.describe(),
        addr
    ));
    let mut artifacts = Vec::new();
    if ctx.executor.get(ctx.target, &pcap_remote, &local_pcap).is_ok() {
        artifacts.push(local_pcap.to_string_lossy().into_owned());
    }

    let mut report = TaskReport::ok(captured, started);
    report.artifacts = artifacts;
    Ok(report)
}

fn prepare_traffic_log(
    ctx: &TaskContext<'_>,
    started: Instant,
    noise: NoiseProfile,
    output_path: &str,
) -> Result<TaskReport> {
    // Idempotent by output hash: a non-empty merged capture already at
    // the path short-circuits.
    let probe = run(
        ctx,
        &format!(
            "test -s {p} && sha256sum {p} | cut -d' ' -f1",
            p = quote(output_path)
        ),
    )?;
    if probe.success() && !probe.stdout.render().trim().is_empty() {
        return Ok(TaskReport::ok(
            "merged capture already present; skipped".to_string(),
            started,
        ));
    }

    let script = traffic_log_script(noise, output_path);
    let output = run_with_stdin(ctx, "sh -s", script.as_bytes())?;
    if output.success() {
        Ok(TaskReport::ok(
            format!("merged capture at {output_path}"),
            started,
        ))
    } else {
        Ok(TaskReport::failed(capture(&output), started))
    }
}

// ---- command synthesis (pure, unit-tested) ----

fn probe_user_command(name: &str) -> String {
    format!("id -u {} >/dev/null 2>&1", quote(name))
}

fn useradd_command(name: &str, shell: &str) -> String {
    format!("useradd -m -s {} {}", quote(shell), quote(name))
}

fn set_groups_command(name: &str, groups: &[String]) -> String {
    let list = groups.join(",");
    format!(
        "for g in {}; do getent group \"$g\" >/dev/null || groupadd \"$g\"; done && usermod -G {} {}",
        groups
            .iter()
            .map(|g| quote(g))
            .collect::<Vec<_>>()
            .join(" "),
        quote(&list),
        quote(name)
    )
}

fn usermod_command(name: &str, changes: &UserChanges) -> Option<String> {
    let mut flags = Vec::new();
    if let Some(shell) = &changes.shell {
        flags.push(format!("-s {}", quote(shell)));
    }
    if let Some(groups) = &changes.groups {
        flags.push(format!("-G {}", quote(&groups.join(","))));
    }
    if let Some(full_name) = &changes.full_name {
        flags.push(format!("-c {}", quote(full_name)));
    }
    if flags.is_empty() {
        None
    } else {
        Some(format!("usermod {} {}", flags.join(" "), quote(name)))
    }
}

fn install_key_command(user: &str, home: &str) -> String {
    let ssh_dir = format!("{home}/.ssh");
    format!(
        "mkdir -p {dir} && chmod 700 {dir} && cat >> {dir}/authorized_keys && chmod 600 {dir}/authorized_keys && chown -R {user}: {dir}",
        dir = quote(&ssh_dir),
        user = quote(user),
    )
}

fn set_hostname_command(hostname: &str) -> String {
    format!(
        "hostnamectl set-hostname {h} 2>/dev/null || (echo {h} > /etc/hostname && hostname {h})",
        h = quote(hostname)
    )
}

fn run_program_command(
    path: &str,
    argv: &[String],
    env: &std::collections::BTreeMap<String, String>,
    cwd: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(cwd) = cwd {
        parts.push(format!("cd {} &&", quote(cwd)));
    }
    for (key, value) in env {
        parts.push(format!("{key}={}", quote(value)));
    }
    parts.push(quote(path));
    for arg in argv {
        parts.push(quote(arg));
    }
    parts.join(" ")
}

/// Small bounded driver script per attack kind. The payload tooling is
/// expected on the guest image; the script only parameterizes and bounds
/// it, captures traffic alongside, and never outlives `duration`.
fn attack_script(
    attack: AttackKind,
    target: Ipv4Addr,
    duration_secs: u64,
    intensity: u32,
    pcap_path: &str,
) -> String {
    let body = match attack {
        AttackKind::SshBruteforce => format!(
            "timeout {duration_secs} sh -c 'i=0; while [ $i -lt {attempts} ]; do \
             ssh -o BatchMode=yes -o ConnectTimeout=2 -o StrictHostKeyChecking=no \
             invalid$i@{target} true >/dev/null 2>&1; i=$((i+1)); done' || true",
            attempts = intensity * 100,
        ),
        AttackKind::Dos => format!(
            "timeout {duration_secs} ping -f -q {target} >/dev/null 2>&1 || true"
        ),
        AttackKind::Ddos => format!(
            "for n in $(seq 1 {streams}); do \
             timeout {duration_secs} ping -f -q {target} >/dev/null 2>&1 & done; wait || true",
            streams = intensity.max(2),
        ),
    };
    format!(
        "set -e\n\
         tcpdump -i any host {target} -w {pcap} >/dev/null 2>&1 &\n\
         TCPDUMP_PID=$!\n\
         {body}\n\
         sleep 1\n\
         kill $TCPDUMP_PID 2>/dev/null || true\n\
         wait $TCPDUMP_PID 2>/dev/null || true\n",
        pcap = quote(pcap_path),
    )
}

fn traffic_log_script(noise: NoiseProfile, output_path: &str) -> String {
    let (duration, rate) = match noise {
        NoiseProfile::Low => (10, 1),
        NoiseProfile::Medium => (30, 10),
        NoiseProfile::High => (60, 50),
    };
    format!(
        "set -e\n\
         mkdir -p $(dirname {out})\n\
         tcpdump -i any -w {out} >/dev/null 2>&1 &\n\
         TCPDUMP_PID=$!\n\
         timeout {duration} sh -c 'while true; do ping -c {rate} -i 0.2 127.0.0.1 >/dev/null 2>&1; done' || true\n\
         kill $TCPDUMP_PID 2>/dev/null || true\n\
         wait $TCPDUMP_PID 2>/dev/null || true\n\
         test -s {out}\n",
        out = quote(output_path),
    )
}

/// Deterministic-enough credential generation without an RNG dependency:
/// hash wall clock, pid, and the account name, then map onto a
/// shoulder-surf-resistant alphabet.
fn generate_password(seed: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(GENERATED_PASSWORD_LEN)
        .map(|byte| PASSWORD_ALPHABET[*byte as usize % PASSWORD_ALPHABET.len()] as char)
        .collect()
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|source| Error::ReadState {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|source| Error::ReadState {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(hasher.finalize()))
}

fn quote(input: &str) -> String {
    super::driver::shell_quote(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn generated_passwords_have_fixed_length_and_alphabet() {
        let password = generate_password("trainee01");
        assert_eq!(password.len(), GENERATED_PASSWORD_LEN);
        assert!(
            password
                .bytes()
                .all(|b| PASSWORD_ALPHABET.contains(&b)),
            "{password}"
        );
        // Two different accounts in the same process should not collide.
        assert_ne!(password, generate_password("trainee02"));
    }

    #[test]
    fn containment_accepts_only_range_subnets() {
        let subnets = [SubnetSpec::parse("10.1.1.0/24").unwrap()];
        assert!(ensure_target_contained("10.1.1.7", &subnets).is_ok());
        assert!(ensure_target_contained("192.0.2.1", &subnets).is_err());
        assert!(ensure_target_contained("files.example.com", &subnets).is_err());
    }

    #[test]
    fn run_program_command_orders_cwd_env_argv() {
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "fast".to_string());
        let command = run_program_command(
            "/opt/tool/run",
            &["--once".to_string(), "input file".to_string()],
            &env,
            Some("/opt/tool"),
        );
        assert_eq!(
            command,
            "cd '/opt/tool' && MODE='fast' '/opt/tool/run' '--once' 'input file'"
        );
    }

    #[test]
    fn usermod_command_is_none_for_password_only_changes() {
        let changes = UserChanges {
            password: Some("s3cret".to_string()),
            ..UserChanges::default()
        };
        assert!(usermod_command("alice", &changes).is_none());

        let changes = UserChanges {
            shell: Some("/bin/zsh".to_string()),
            groups: Some(vec!["wheel".to_string(), "dev".to_string()]),
            ..UserChanges::default()
        };
        assert_eq!(
            usermod_command("alice", &changes).unwrap(),
            "usermod -s '/bin/zsh' -G 'wheel,dev' 'alice'"
        );
    }

    #[test]
    fn install_key_command_sets_strict_permissions() {
        let command = install_key_command("ubuntu", "/home/ubuntu");
        assert!(command.contains("chmod 700 '/home/ubuntu/.ssh'"));
        assert!(command.contains("chmod 600 '/home/ubuntu/.ssh'/authorized_keys"));
        assert!(command.contains("cat >> '/home/ubuntu/.ssh'/authorized_keys"));
    }

    #[test]
    fn attack_script_is_time_bounded_and_captures() {
        let script = attack_script(
            AttackKind::Dos,
            "10.1.1.5".parse().unwrap(),
            30,
            3,
            "/tmp/x.pcap",
        );
        assert!(script.contains("timeout 30 ping -f"));
        assert!(script.contains("tcpdump -i any host 10.1.1.5"));
        assert!(script.contains("kill $TCPDUMP_PID"));
    }

    #[test]
    fn bruteforce_scales_attempts_with_intensity() {
        let script = attack_script(
            AttackKind::SshBruteforce,
            "10.1.1.5".parse().unwrap(),
            60,
            5,
            "/tmp/x.pcap",
        );
        assert!(script.contains("-lt 500"), "{script}");
    }
}
