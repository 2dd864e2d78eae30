use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use ureq::{Agent, AgentBuilder, Error as UreqError};

use crate::config::{AuthRef, HostSpec};
use crate::core::model::PowerState;
use crate::error::{Error, Result};

use super::{
    DomainDefinition, GuestHandle, GuestObservation, HypervisorDriver, NetworkDefinition,
    NetworkHandle, domain_title, parse_domain_title,
};

const BUSY_RETRY_DELAY: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(3);
const REACHABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cloud-provider driver: the same capability set mapped onto a provider
/// HTTP API. Boot readiness is observed through a reachability probe on
/// the instance's leased address rather than hypervisor events.
pub struct CloudDriver {
    host: HostSpec,
    base_url: String,
    agent: Agent,
    token: Option<String>,
}

/// Provider responses folded into a small vocabulary before mapping onto
/// the error taxonomy. 409/423 are retryable-busy, 401/403 permanent,
/// 404 significant only per-operation (idempotent destroy).
enum CloudCallError {
    NotFound,
    Busy,
    Auth(String),
    Provider(String),
    Transport(String),
}

impl CloudDriver {
    pub fn new(host: HostSpec) -> Result<Self> {
        let token = match &host.auth {
            AuthRef::PasswordEnv(var) => {
                let token = std::env::var(var).map_err(|_| Error::Hypervisor {
                    host: host.id.clone(),
                    message: format!("API token variable `{var}` is not set"),
                })?;
                Some(token)
            }
            AuthRef::KeyFile(path) => {
                let token =
                    std::fs::read_to_string(path).map_err(|source| Error::ReadState {
                        path: path.clone(),
                        source,
                    })?;
                Some(token.trim().to_string())
            }
            AuthRef::Agent => None,
        };

        let base_url = if host.address.starts_with("http://") || host.address.starts_with("https://")
        {
            format!("{}/v1", host.address.trim_end_matches('/'))
        } else {
            format!("https://{}/v1", host.address)
        };

        let agent = AgentBuilder::new()
            .timeout_connect(HTTP_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build();

        Ok(Self {
            host,
            base_url,
            agent,
            token,
        })
    }

    fn call(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Value, CloudCallError> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.agent.request(method, &url);
            if let Some(token) = &self.token {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
            let response = match body {
                Some(body) => request.send_json(body.clone()),
                None => request.call(),
            };
            match response {
                Ok(response) => {
                    let text = response
                        .into_string()
                        .map_err(|err| CloudCallError::Transport(err.to_string()))?;
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_str(&text)
                        .map_err(|err| CloudCallError::Provider(format!("malformed response: {err}")));
                }
                Err(UreqError::Status(code, response)) => {
                    let detail = response
                        .into_string()
                        .unwrap_or_else(|_| String::from("<unreadable body>"));
                    match code {
                        404 => return Err(CloudCallError::NotFound),
                        401 | 403 => {
                            return Err(CloudCallError::Auth(format!(
                                "{method} {path} denied ({code}): {detail}"
                            )));
                        }
                        409 | 423 => {
                            if attempt == 1 {
                                thread::sleep(BUSY_RETRY_DELAY);
                                continue;
                            }
                            return Err(CloudCallError::Busy);
                        }
                        _ => {
                            return Err(CloudCallError::Provider(format!(
                                "{method} {path} failed ({code}): {detail}"
                            )));
                        }
                    }
                }
                Err(UreqError::Transport(transport)) => {
                    return Err(CloudCallError::Transport(transport.to_string()));
                }
            }
        }
    }

    fn map_error(&self, err: CloudCallError, context: &str) -> Error {
        match err {
            CloudCallError::NotFound => Error::Hypervisor {
                host: self.host.id.clone(),
                message: format!("{context}: not found"),
            },
            CloudCallError::Busy => Error::Hypervisor {
                host: self.host.id.clone(),
                message: format!("{context}: provider still busy after retry"),
            },
            CloudCallError::Auth(message) | CloudCallError::Provider(message) => {
                Error::Hypervisor {
                    host: self.host.id.clone(),
                    message: format!("{context}: {message}"),
                }
            }
            CloudCallError::Transport(message) => Error::Transport {
                target: self.host.address.clone(),
                message: format!("{context}: {message}"),
            },
        }
    }

    fn instance_status(&self, domain: &str) -> Result<(PowerState, Vec<String>)> {
        let value = self
            .call("GET", &format!("/instances/{domain}"), None)
            .map_err(|err| self.map_error(err, &format!("observe `{domain}`")))?;
        Ok(parse_instance_status(&value))
    }
}

impl HypervisorDriver for CloudDriver {
    fn host_id(&self) -> &str {
        &self.host.id
    }

    fn ensure_network(&self, definition: &NetworkDefinition) -> Result<NetworkHandle> {
        let name = definition.bridge_name.as_str();
        match self.call("GET", &format!("/networks/{name}"), None) {
            Ok(_) => {
                return Ok(NetworkHandle {
                    host: self.host.id.clone(),
                    network_id: definition.network_id.clone(),
                    bridge_name: definition.bridge_name.clone(),
                    created: false,
                });
            }
            Err(CloudCallError::NotFound) => {}
            Err(err) => return Err(self.map_error(err, &format!("query network `{name}`"))),
        }

        let mut body = json!({
            "name": name,
            "nat": definition.nat,
        });
        if let Some(subnet) = definition.subnet {
            body["cidr"] = json!(subnet.to_string());
        }
        if let Some(gateway) = definition.gateway {
            body["gateway"] = json!(gateway.to_string());
        }
        self.call("POST", "/networks", Some(&body))
            .map_err(|err| self.map_error(err, &format!("create network `{name}`")))?;

        Ok(NetworkHandle {
            host: self.host.id.clone(),
            network_id: definition.network_id.clone(),
            bridge_name: definition.bridge_name.clone(),
            created: true,
        })
    }

    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
        match self.call("DELETE", &format!("/networks/{}", handle.bridge_name), None) {
            Ok(_) | Err(CloudCallError::NotFound) => Ok(()),
            Err(err) => Err(self.map_error(
                err,
                &format!("destroy network `{}`", handle.bridge_name),
            )),
        }
    }

    fn clone_guest(&self, definition: &DomainDefinition) -> Result<GuestHandle> {
        let nics: Vec<Value> = definition
            .nics
            .iter()
            .map(|nic| {
                let mut entry = json!({ "network": nic.bridge_name });
                if let Some(mac) = &nic.mac {
                    entry["mac"] = json!(mac);
                }
                entry
            })
            .collect();

        let body = json!({
            "name": definition.domain_name,
            "image_fingerprint": definition.base_fingerprint,
            "vcpu": definition.vcpu,
            "mem_mib": definition.mem_mib,
            "nics": nics,
            "title": domain_title(&definition.range_id, &definition.guest_id),
        });
        self.call("POST", "/instances", Some(&body)).map_err(|err| {
            self.map_error(err, &format!("clone `{}`", definition.domain_name))
        })?;

        Ok(GuestHandle {
            host: self.host.id.clone(),
            domain: definition.domain_name.clone(),
            range_id: Some(definition.range_id.clone()),
            guest_id: Some(definition.guest_id.clone()),
            overlay_path: None,
        })
    }

    fn start(&self, handle: &GuestHandle) -> Result<()> {
        self.call(
            "POST",
            &format!("/instances/{}/start", handle.domain),
            None,
        )
        .map(|_| ())
        .map_err(|err| self.map_error(err, &format!("start `{}`", handle.domain)))
    }

    fn shutdown(&self, handle: &GuestHandle, graceful_timeout: Duration) -> Result<bool> {
        match self.call(
            "POST",
            &format!("/instances/{}/stop", handle.domain),
            None,
        ) {
            Ok(_) => {}
            Err(CloudCallError::NotFound) => return Ok(true),
            Err(err) => {
                return Err(self.map_error(err, &format!("stop `{}`", handle.domain)));
            }
        }

        let deadline = Instant::now() + graceful_timeout;
        loop {
            let (power, _) = self.instance_status(&handle.domain)?;
            if matches!(power, PowerState::Off) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }

    fn force_off(&self, handle: &GuestHandle) -> Result<()> {
        match self.call(
            "POST",
            &format!("/instances/{}/poweroff", handle.domain),
            None,
        ) {
            Ok(_) | Err(CloudCallError::NotFound) => Ok(()),
            Err(err) => Err(self.map_error(err, &format!("power off `{}`", handle.domain))),
        }
    }

    fn destroy(&self, handle: &GuestHandle, delete_storage: bool) -> Result<()> {
        let path = format!(
            "/instances/{}?delete_storage={delete_storage}",
            handle.domain
        );
        match self.call("DELETE", &path, None) {
            Ok(_) | Err(CloudCallError::NotFound) => Ok(()),
            Err(err) => Err(self.map_error(err, &format!("destroy `{}`", handle.domain))),
        }
    }

    fn observe(&self, handle: &GuestHandle) -> Result<GuestObservation> {
        let (power, leased_ips) = self.instance_status(&handle.domain)?;
        let agent_reachable = matches!(power, PowerState::Running)
            && leased_ips
                .first()
                .map(|address| probe_reachable(address))
                .unwrap_or(false);
        Ok(GuestObservation {
            power,
            leased_ips,
            agent_reachable,
        })
    }

    fn list_domains(&self, label: &str) -> Result<Vec<GuestHandle>> {
        let value = self
            .call("GET", &format!("/instances?label={label}"), None)
            .map_err(|err| self.map_error(err, "list instances"))?;
        let mut handles = Vec::new();
        if let Some(entries) = value.as_array() {
            for entry in entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let title = entry.get("title").and_then(Value::as_str).unwrap_or("");
                if !title.contains(label) {
                    continue;
                }
                let (range_id, guest_id) = parse_domain_title(title);
                handles.push(GuestHandle {
                    host: self.host.id.clone(),
                    domain: name.to_string(),
                    range_id,
                    guest_id,
                    overlay_path: None,
                });
            }
        }
        Ok(handles)
    }
}

/// The provider reports lifecycle as a status string plus an address
/// list; fold it into the shared power vocabulary.
fn parse_instance_status(value: &Value) -> (PowerState, Vec<String>) {
    let power = match value.get("status").and_then(Value::as_str) {
        Some("running") => PowerState::Running,
        Some("stopped") | Some("stopping") | Some("terminated") => PowerState::Off,
        _ => PowerState::Unknown,
    };
    let addresses = value
        .get("addresses")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    (power, addresses)
}

/// Boot-readiness probe: a TCP connect against the guest's SSH port.
fn probe_reachable(address: &str) -> bool {
    use std::net::ToSocketAddrs;
    let Ok(mut addrs) = (address, 22u16).to_socket_addrs() else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    TcpStream::connect_timeout(&addr, REACHABILITY_PROBE_TIMEOUT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_parses_provider_vocabulary() {
        let value = json!({
            "status": "running",
            "addresses": ["10.8.0.4", "192.0.2.17"],
        });
        let (power, addresses) = parse_instance_status(&value);
        assert_eq!(power, PowerState::Running);
        assert_eq!(addresses, vec!["10.8.0.4", "192.0.2.17"]);

        let (power, addresses) = parse_instance_status(&json!({"status": "stopped"}));
        assert_eq!(power, PowerState::Off);
        assert!(addresses.is_empty());

        let (power, _) = parse_instance_status(&json!({"status": "provisioning"}));
        assert_eq!(power, PowerState::Unknown);
    }
}
