use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{AuthRef, HostSpec};
use crate::error::{Error, Result};

/// Default cap for each captured stream: 32 KiB of head plus 32 KiB of
/// tail, so a chatty command cannot balloon controller memory.
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024;

/// An SSH endpoint the executor can run commands on: a hypervisor host or
/// a booted guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Stable id used in error messages and the circuit breaker table.
    pub id: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthRef,
}

impl Target {
    pub fn for_host(host: &HostSpec) -> Self {
        Self {
            id: host.id.clone(),
            address: host.address.clone(),
            port: host.port,
            user: host.user.clone(),
            auth: host.auth.clone(),
        }
    }

    /// Guests are reached on their leased address as root, authenticated
    /// with the same credentials as their host (base images carry the
    /// controller key).
    pub fn for_guest(guest_id: &str, address: &str, host: &HostSpec) -> Self {
        Self {
            id: guest_id.to_string(),
            address: address.to_string(),
            port: 22,
            user: "root".to_string(),
            auth: host.auth.clone(),
        }
    }

    fn key(&self) -> TargetKey {
        TargetKey {
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.address, self.port)
    }
}

/// Sessions are pooled per (address, port, user).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetKey {
    address: String,
    port: u16,
    user: String,
}

/// Classification of a transport failure, deciding retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectRefused,
    AuthTransient,
    AuthPermanent,
    NetworkTimeout,
    BannerMissing,
    Other,
}

impl TransportErrorKind {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::ConnectRefused
                | TransportErrorKind::AuthTransient
                | TransportErrorKind::NetworkTimeout
                | TransportErrorKind::BannerMissing
        )
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TransportErrorKind::ConnectRefused => "connect-refused",
            TransportErrorKind::AuthTransient => "auth-transient",
            TransportErrorKind::AuthPermanent => "auth-permanent",
            TransportErrorKind::NetworkTimeout => "network-timeout",
            TransportErrorKind::BannerMissing => "ssh-banner-missing",
            TransportErrorKind::Other => "transport",
        }
    }
}

/// Retry and breaker tuning. Defaults follow the documented policy:
/// backoff 1 s doubling to a 30 s cap, three attempts, breaker after five
/// consecutive connect failures with a one-minute cool-down.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: u32,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub capture_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2,
            backoff_cap: Duration::from_secs(30),
            max_attempts: 3,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry attempt `attempt` (1-based; no delay before the
    /// first attempt).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.saturating_pow(attempt - 2);
        let delay = self.backoff_base.saturating_mul(factor);
        delay.min(self.backoff_cap)
    }
}

/// Output of one remote command.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit: i32,
    pub stdout: Captured,
    pub stderr: Captured,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Bounded stream capture: the first half of the limit verbatim, the last
/// half as a sliding tail, with the elided byte count recorded.
#[derive(Debug)]
pub struct Captured {
    head: Vec<u8>,
    tail: Vec<u8>,
    head_cap: usize,
    tail_cap: usize,
    elided: u64,
}

impl Captured {
    pub fn with_limit(limit: usize) -> Self {
        let head_cap = limit / 2;
        let tail_cap = limit - head_cap;
        Self {
            head: Vec::new(),
            tail: Vec::new(),
            head_cap,
            tail_cap,
            elided: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        if self.head.len() < self.head_cap {
            let take = (self.head_cap - self.head.len()).min(rest.len());
            self.head.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        if rest.is_empty() {
            return;
        }
        self.tail.extend_from_slice(rest);
        if self.tail.len() > self.tail_cap {
            let excess = self.tail.len() - self.tail_cap;
            self.tail.drain(..excess);
            self.elided += excess as u64;
        }
    }

    pub fn total_seen(&self) -> u64 {
        self.head.len() as u64 + self.tail.len() as u64 + self.elided
    }

    pub fn is_truncated(&self) -> bool {
        self.elided > 0
    }

    /// Lossy rendering with an elision marker between head and tail.
    pub fn render(&self) -> String {
        let head = String::from_utf8_lossy(&self.head);
        if self.tail.is_empty() {
            return head.into_owned();
        }
        let tail = String::from_utf8_lossy(&self.tail);
        if self.elided == 0 {
            format!("{head}{tail}")
        } else {
            format!("{head}\n... [{} bytes elided] ...\n{tail}", self.elided)
        }
    }

    /// Last portion of the capture, for task result details.
    pub fn tail_string(&self, max: usize) -> String {
        let rendered = self.render();
        if rendered.len() <= max {
            return rendered;
        }
        let start = rendered.len() - max;
        // Avoid splitting a UTF-8 sequence.
        let start = (start..rendered.len())
            .find(|&i| rendered.is_char_boundary(i))
            .unwrap_or(rendered.len());
        rendered[start..].to_string()
    }
}

/// Per-target breaker: opens after a run of connect failures, fails fast
/// during the cool-down, then lets a single probe through.
#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn check(&mut self, threshold: u32, cooldown: Duration, now: Instant) -> BreakerDecision {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) < cooldown => BreakerDecision::FailFast,
            Some(_) => BreakerDecision::Probe,
            None if self.consecutive_failures >= threshold => {
                self.opened_at = Some(now);
                BreakerDecision::FailFast
            }
            None => BreakerDecision::Allow,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, threshold: u32, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= threshold && self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BreakerDecision {
    Allow,
    Probe,
    FailFast,
}

struct LiveSession {
    session: ssh2::Session,
}

/// Slot wrapper so calls against one target serialize while distinct
/// targets proceed independently.
struct SessionSlot {
    live: Mutex<Option<LiveSession>>,
}

/// Process-wide pool of live SSH sessions keyed by (host, port, user).
///
/// One instance is owned by the orchestrator and shared by read-only
/// handle; the internal locks are never held across calls into other
/// components.
pub struct RemoteExecutor {
    config: ExecutorConfig,
    slots: Mutex<HashMap<TargetKey, Arc<SessionSlot>>>,
    breakers: Mutex<HashMap<TargetKey, BreakerState>>,
}

impl RemoteExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `command` on the target, streaming output into bounded
    /// captures. A non-zero exit is an `Ok` outcome; only transport-level
    /// failures surface as errors. Transient connection failures are
    /// retried with exponential backoff; failures after the command has
    /// started are never retried, since commands are not assumed
    /// idempotent at this layer.
    pub fn run(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let slot = self.slot_for(target);
        let guard = slot.live.lock().expect("session slot poisoned");
        self.run_locked(guard, target, command, stdin, timeout)
    }

    fn run_locked(
        &self,
        mut guard: std::sync::MutexGuard<'_, Option<LiveSession>>,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let started = Instant::now();
        let mut channel = self.open_channel(&mut *guard, target)?;

        if let Err(err) = channel.exec(command) {
            *guard = None;
            return Err(self.transport_error(target, classify_ssh_error(&err), &err.to_string()));
        }

        if let Some(data) = stdin {
            if let Err(err) = channel.write_all(data).and_then(|_| {
                channel
                    .send_eof()
                    .map_err(|e| std::io::Error::other(e.to_string()))
            }) {
                *guard = None;
                return Err(self.transport_error(
                    target,
                    TransportErrorKind::Other,
                    &err.to_string(),
                ));
            }
        }

        let deadline = started + timeout;
        let mut stdout = Captured::with_limit(self.config.capture_limit);
        let mut stderr = Captured::with_limit(self.config.capture_limit);
        let mut buf = [0u8; 8192];

        loop {
            if Instant::now() >= deadline {
                let _ = channel.close();
                *guard = None;
                return Err(Error::Timeout {
                    operation: format!("ssh {} `{command}`", target.describe()),
                    budget: timeout,
                });
            }

            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stdout.push(&buf[..n]);
                    progressed = true;
                }
                Err(err) if retriable_io(&err) => {}
                Err(err) => {
                    *guard = None;
                    return Err(self.transport_error(
                        target,
                        TransportErrorKind::Other,
                        &err.to_string(),
                    ));
                }
            }
            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    stderr.push(&buf[..n]);
                    progressed = true;
                }
                Err(err) if retriable_io(&err) => {}
                Err(err) => {
                    *guard = None;
                    return Err(self.transport_error(
                        target,
                        TransportErrorKind::Other,
                        &err.to_string(),
                    ));
                }
            }

            if channel.eof() {
                break;
            }
            if !progressed {
                thread::sleep(Duration::from_millis(20));
            }
        }

        let _ = channel.close();
        let _ = channel.wait_close();
        let exit = match channel.exit_status() {
            Ok(exit) => exit,
            Err(err) => {
                *guard = None;
                return Err(self.transport_error(
                    target,
                    TransportErrorKind::Other,
                    &err.to_string(),
                ));
            }
        };

        Ok(ExecOutput {
            exit,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    /// Upload a controller-local file over the pooled session's SCP
    /// subchannel.
    pub fn put(
        &self,
        target: &Target,
        local_path: &Path,
        remote_path: &str,
        mode: i32,
    ) -> Result<()> {
        let mut local = File::open(local_path).map_err(|source| Error::ReadState {
            path: local_path.to_path_buf(),
            source,
        })?;
        let size = local
            .metadata()
            .map_err(|source| Error::ReadState {
                path: local_path.to_path_buf(),
                source,
            })?
            .len();

        let slot = self.slot_for(target);
        let mut guard = slot.live.lock().expect("session slot poisoned");
        self.ensure_session(&mut *guard, target)?;
        let session = &guard.as_ref().expect("session just ensured").session;

        let mut remote = match session.scp_send(Path::new(remote_path), mode, size, None) {
            Ok(remote) => remote,
            Err(err) => {
                let mapped =
                    self.transport_error(target, classify_ssh_error(&err), &err.to_string());
                *guard = None;
                return Err(mapped);
            }
        };

        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = local.read(&mut buf).map_err(|source| Error::ReadState {
                path: local_path.to_path_buf(),
                source,
            })?;
            if read == 0 {
                break;
            }
            if let Err(err) = remote.write_all(&buf[..read]) {
                *guard = None;
                return Err(self.transport_error(
                    target,
                    TransportErrorKind::Other,
                    &err.to_string(),
                ));
            }
        }
        if let Err(err) = remote.send_eof().and_then(|_| remote.wait_eof()) {
            *guard = None;
            return Err(self.transport_error(target, TransportErrorKind::Other, &err.to_string()));
        }
        let _ = remote.close();
        let _ = remote.wait_close();
        Ok(())
    }

    /// Download a remote file over the pooled session's SCP subchannel.
    pub fn get(&self, target: &Target, remote_path: &str, local_path: &Path) -> Result<()> {
        let slot = self.slot_for(target);
        let mut guard = slot.live.lock().expect("session slot poisoned");
        self.ensure_session(&mut *guard, target)?;
        let session = &guard.as_ref().expect("session just ensured").session;

        let (mut remote, _stat) = match session.scp_recv(Path::new(remote_path)) {
            Ok(pair) => pair,
            Err(err) => {
                let mapped =
                    self.transport_error(target, classify_ssh_error(&err), &err.to_string());
                *guard = None;
                return Err(mapped);
            }
        };

        let mut local = File::create(local_path).map_err(|source| Error::WriteState {
            path: local_path.to_path_buf(),
            source,
        })?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = match remote.read(&mut buf) {
                Ok(read) => read,
                Err(err) => {
                    *guard = None;
                    return Err(self.transport_error(
                        target,
                        TransportErrorKind::Other,
                        &err.to_string(),
                    ));
                }
            };
            if read == 0 {
                break;
            }
            local
                .write_all(&buf[..read])
                .map_err(|source| Error::WriteState {
                    path: local_path.to_path_buf(),
                    source,
                })?;
        }
        let _ = remote.close();
        let _ = remote.wait_close();
        Ok(())
    }

    /// Cheap liveness probe: connect (or reuse) and run `true`.
    pub fn health_check(&self, target: &Target) -> Result<()> {
        let output = self.run(target, "true", None, Duration::from_secs(15))?;
        if output.success() {
            Ok(())
        } else {
            Err(self.transport_error(
                target,
                TransportErrorKind::Other,
                &format!("health probe exited {}", output.exit),
            ))
        }
    }

    /// Drop the pooled session for a target, forcing the next call to
    /// reconnect.
    pub fn release(&self, target: &Target) {
        self.drop_session(target);
    }

    fn slot_for(&self, target: &Target) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().expect("executor pool poisoned");
        slots
            .entry(target.key())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    live: Mutex::new(None),
                })
            })
            .clone()
    }

    fn drop_session(&self, target: &Target) {
        let slot = self.slot_for(target);
        let mut guard = slot.live.lock().expect("session slot poisoned");
        *guard = None;
    }

    /// Connect-with-retry honoring the breaker, filling the slot when it
    /// is empty.
    fn ensure_session(&self, guard: &mut Option<LiveSession>, target: &Target) -> Result<()> {
        if guard.is_none() {
            let session = self.connect_with_retry(target)?;
            *guard = Some(LiveSession { session });
        }
        Ok(())
    }

    /// Open an exec channel on the pooled session, transparently
    /// reconnecting once when the pooled session has gone stale.
    fn open_channel(
        &self,
        guard: &mut Option<LiveSession>,
        target: &Target,
    ) -> Result<ssh2::Channel> {
        self.ensure_session(guard, target)?;
        let first = guard
            .as_ref()
            .expect("session just ensured")
            .session
            .channel_session();
        match first {
            Ok(channel) => Ok(channel),
            Err(_) => {
                *guard = None;
                self.ensure_session(guard, target)?;
                guard
                    .as_ref()
                    .expect("session just ensured")
                    .session
                    .channel_session()
                    .map_err(|err| {
                        self.transport_error(target, classify_ssh_error(&err), &err.to_string())
                    })
            }
        }
    }

    fn connect_with_retry(&self, target: &Target) -> Result<ssh2::Session> {
        let key = target.key();
        {
            let mut breakers = self.breakers.lock().expect("breaker table poisoned");
            let state = breakers.entry(key.clone()).or_default();
            if state.check(
                self.config.breaker_threshold,
                self.config.breaker_cooldown,
                Instant::now(),
            ) == BreakerDecision::FailFast
            {
                return Err(Error::Transport {
                    target: target.describe(),
                    message: format!(
                        "circuit breaker open after {} consecutive connect failures",
                        state.consecutive_failures
                    ),
                });
            }
        }

        let mut last: Option<(TransportErrorKind, String)> = None;
        for attempt in 1..=self.config.max_attempts {
            let delay = self.config.backoff_delay(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            match self.connect_once(target) {
                Ok(session) => {
                    let mut breakers = self.breakers.lock().expect("breaker table poisoned");
                    breakers.entry(key).or_default().record_success();
                    return Ok(session);
                }
                Err((kind, message)) => {
                    {
                        let mut breakers =
                            self.breakers.lock().expect("breaker table poisoned");
                        breakers
                            .entry(key.clone())
                            .or_default()
                            .record_failure(self.config.breaker_threshold, Instant::now());
                    }
                    if !kind.retryable() {
                        return Err(self.transport_error(target, kind, &message));
                    }
                    last = Some((kind, message));
                }
            }
        }

        let (kind, message) =
            last.unwrap_or((TransportErrorKind::Other, "no attempt made".to_string()));
        Err(self.transport_error(
            target,
            kind,
            &format!("{message} (after {} attempts)", self.config.max_attempts),
        ))
    }

    fn connect_once(
        &self,
        target: &Target,
    ) -> std::result::Result<ssh2::Session, (TransportErrorKind, String)> {
        use std::net::ToSocketAddrs;
        let sock_addr = (target.address.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|err| (TransportErrorKind::Other, err.to_string()))?
            .next()
            .ok_or_else(|| {
                (
                    TransportErrorKind::Other,
                    format!("{} resolved to no addresses", target.address),
                )
            })?;

        let tcp = TcpStream::connect_timeout(&sock_addr, self.config.connect_timeout)
            .map_err(|err| (classify_io_error(&err), err.to_string()))?;

        let mut session = ssh2::Session::new()
            .map_err(|err| (TransportErrorKind::Other, err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(
            self.config
                .connect_timeout
                .as_millis()
                .min(u128::from(u32::MAX)) as u32,
        );
        session
            .handshake()
            .map_err(|err| (classify_ssh_error(&err), err.to_string()))?;

        match &target.auth {
            AuthRef::Agent => {
                session
                    .userauth_agent(&target.user)
                    .map_err(|err| (classify_auth_error(&err), err.to_string()))?;
            }
            AuthRef::KeyFile(path) => {
                session
                    .userauth_pubkey_file(&target.user, None, path, None)
                    .map_err(|err| (classify_auth_error(&err), err.to_string()))?;
            }
            AuthRef::PasswordEnv(var) => {
                let password = std::env::var(var).map_err(|_| {
                    (
                        TransportErrorKind::AuthPermanent,
                        format!("credential variable `{var}` is not set"),
                    )
                })?;
                session
                    .userauth_password(&target.user, &password)
                    .map_err(|err| (classify_auth_error(&err), err.to_string()))?;
            }
        }

        if !session.authenticated() {
            return Err((
                TransportErrorKind::AuthPermanent,
                "authentication did not complete".to_string(),
            ));
        }

        // Leave a short blocking-op timeout on the pooled session; run()
        // loops against its own deadline.
        session.set_timeout(1_000);
        Ok(session)
    }

    fn transport_error(
        &self,
        target: &Target,
        kind: TransportErrorKind,
        message: &str,
    ) -> Error {
        Error::Transport {
            target: target.describe(),
            message: format!("{}: {message}", kind.describe()),
        }
    }
}

fn retriable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn classify_io_error(err: &std::io::Error) -> TransportErrorKind {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectRefused,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportErrorKind::NetworkTimeout
        }
        _ => TransportErrorKind::Other,
    }
}

fn classify_ssh_error(err: &ssh2::Error) -> TransportErrorKind {
    use ssh2::ErrorCode;
    match err.code() {
        ErrorCode::Session(code) => match code {
            ssh2_sys_banner_codes::BANNER_RECV | ssh2_sys_banner_codes::BANNER_SEND => {
                TransportErrorKind::BannerMissing
            }
            ssh2_sys_banner_codes::TIMEOUT => TransportErrorKind::NetworkTimeout,
            ssh2_sys_banner_codes::SOCKET_DISCONNECT => TransportErrorKind::ConnectRefused,
            _ => TransportErrorKind::Other,
        },
        ErrorCode::SFTP(_) => TransportErrorKind::Other,
    }
}

/// Raw libssh2 session error codes matched in [`classify_ssh_error`].
mod ssh2_sys_banner_codes {
    pub const BANNER_RECV: i32 = -2;
    pub const BANNER_SEND: i32 = -3;
    pub const TIMEOUT: i32 = -9;
    pub const SOCKET_DISCONNECT: i32 = -13;
}

fn classify_auth_error(err: &ssh2::Error) -> TransportErrorKind {
    // libssh2 reports both "wrong key" and "server still starting sshd"
    // as authentication failures; the caller-visible split is permanent
    // vs transient, and only explicit denials are permanent.
    let message = err.to_string();
    if message.contains("Authentication failed") || message.contains("denied") {
        TransportErrorKind::AuthPermanent
    } else {
        TransportErrorKind::AuthTransient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_to_cap() {
        let config = ExecutorConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::ZERO);
        assert_eq!(config.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(8), Duration::from_secs(30));
    }

    #[test]
    fn capture_keeps_head_and_tail() {
        let mut captured = Captured::with_limit(8);
        captured.push(b"abcd");
        captured.push(b"efgh");
        captured.push(b"ijkl");
        assert_eq!(captured.total_seen(), 12);
        assert!(captured.is_truncated());
        let rendered = captured.render();
        assert!(rendered.starts_with("abcd"), "{rendered}");
        assert!(rendered.ends_with("ijkl"), "{rendered}");
        assert!(rendered.contains("4 bytes elided"), "{rendered}");
    }

    #[test]
    fn capture_below_limit_is_verbatim() {
        let mut captured = Captured::with_limit(64);
        captured.push(b"hello ");
        captured.push(b"world");
        assert!(!captured.is_truncated());
        assert_eq!(captured.render(), "hello world");
    }

    #[test]
    fn tail_string_respects_char_boundaries() {
        let mut captured = Captured::with_limit(1024);
        captured.push("héllo wörld".as_bytes());
        let tail = captured.tail_string(6);
        assert!(tail.len() <= 6);
        assert!("héllo wörld".ends_with(&tail));
    }

    #[test]
    fn breaker_opens_after_threshold_and_probes_after_cooldown() {
        let mut state = BreakerState::default();
        let threshold = 3;
        let cooldown = Duration::from_secs(60);
        let t0 = Instant::now();

        for _ in 0..threshold {
            assert_eq!(state.check(threshold, cooldown, t0), BreakerDecision::Allow);
            state.record_failure(threshold, t0);
        }
        assert_eq!(
            state.check(threshold, cooldown, t0 + Duration::from_secs(1)),
            BreakerDecision::FailFast
        );
        assert_eq!(
            state.check(threshold, cooldown, t0 + Duration::from_secs(61)),
            BreakerDecision::Probe
        );
        state.record_success();
        assert_eq!(
            state.check(threshold, cooldown, t0 + Duration::from_secs(62)),
            BreakerDecision::Allow
        );
    }

    #[test]
    fn auth_denial_is_permanent() {
        assert!(!TransportErrorKind::AuthPermanent.retryable());
        assert!(TransportErrorKind::AuthTransient.retryable());
        assert!(TransportErrorKind::ConnectRefused.retryable());
        assert!(TransportErrorKind::BannerMissing.retryable());
        assert!(!TransportErrorKind::Other.retryable());
    }
}
