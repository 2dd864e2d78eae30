use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::{BaseImageSpec, HostSpec, ImageSource};
use crate::error::{Error, Result};

use super::driver::shell_quote;
use super::executor::{RemoteExecutor, Target};
use super::model::ImageRecord;
use super::registry::{Registry, now_stamp};

/// Where base images live on every managed host.
pub const HOST_IMAGE_DIR: &str = "/var/lib/cyris/images";
/// Distribution failures tolerated per host before it is quarantined.
const QUARANTINE_THRESHOLD: u32 = 2;
const HASH_TIMEOUT: Duration = Duration::from_secs(600);
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one `PlaceImage` step.
#[derive(Debug)]
pub struct PlacementOutcome {
    pub record: ImageRecord,
    /// The placement table already held a verified copy; nothing moved.
    pub already_present: bool,
    /// A verification mismatch forced a second transfer.
    pub retried: bool,
}

/// Parallel base-image placement with dedup by content fingerprint.
///
/// Concurrency is bounded by the orchestrator's per-step semaphores
/// (global stream cap and per-host cap); this type holds only the
/// placement bookkeeping and the per-host quarantine counters, the one
/// process-wide mutable structure besides the executor pool. Its lock is
/// internal and never held across calls into other components.
pub struct ImageDistributor {
    executor: Arc<RemoteExecutor>,
    registry: Arc<Registry>,
    hosts: Vec<HostSpec>,
    staging_dir: PathBuf,
    /// Budget for one whole transfer-and-verify pass against a host.
    transfer_timeout: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ImageDistributor {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        registry: Arc<Registry>,
        hosts: Vec<HostSpec>,
        staging_dir: PathBuf,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            registry,
            hosts,
            staging_dir,
            transfer_timeout,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn host_spec(&self, host_id: &str) -> Result<&HostSpec> {
        self.hosts
            .iter()
            .find(|h| h.id == host_id)
            .ok_or_else(|| Error::Internal {
                message: format!("no host spec for `{host_id}`"),
            })
    }

    /// Compute the content fingerprint of a base image from its source
    /// copy, and its size in bytes, then record the source host as a
    /// verified seed when the source already lives on a host.
    pub fn fingerprint_source(&self, image: &BaseImageSpec) -> Result<(String, u64)> {
        let (fingerprint, size) = compute_fingerprint(&self.executor, image, &self.hosts)?;
        if let ImageSource::Host { host, path } = &image.source {
            // The source host trivially holds a verified copy.
            if self.registry.image_on_host(&fingerprint, host).is_none() {
                self.registry.record_image(ImageRecord {
                    fingerprint: fingerprint.clone(),
                    host: host.clone(),
                    path: path.clone(),
                    size_bytes: size,
                    mtime: 0,
                    recorded_at: now_stamp(),
                })?;
            }
        }
        Ok((fingerprint, size))
    }

    /// Ensure `fingerprint` is present and verified on `host`. One
    /// verification mismatch deletes the transfer and retries once,
    /// preferring an alternate seed when the registry knows one.
    pub fn place_on_host(
        &self,
        image: &BaseImageSpec,
        fingerprint: &str,
        host: &HostSpec,
    ) -> Result<PlacementOutcome> {
        if self.is_quarantined(&host.id) {
            return Err(Error::Resource {
                resource: format!("host `{}`", host.id),
                message: "quarantined after repeated distribution failures".to_string(),
            });
        }

        if let Some(record) = self.registry.image_on_host(fingerprint, &host.id) {
            return Ok(PlacementOutcome {
                record,
                already_present: true,
                retried: false,
            });
        }

        let staged = self.ensure_staged(image, fingerprint)?;
        let dest = host_image_path(fingerprint);
        let target = Target::for_host(host);

        match self.transfer_and_verify(&target, &staged, &dest, fingerprint) {
            Ok(record) => {
                self.clear_failures(&host.id);
                self.registry.record_image(record.clone())?;
                Ok(PlacementOutcome {
                    record,
                    already_present: false,
                    retried: false,
                })
            }
            Err(first_err) => {
                // One retry from a different seed when any host already
                // holds the image; otherwise re-send the staged copy.
                let retry_source = self.alternate_seed_copy(fingerprint, &host.id, &staged);
                let staged_retry = match retry_source {
                    Ok(path) => path,
                    Err(_) => staged.clone(),
                };
                match self.transfer_and_verify(&target, &staged_retry, &dest, fingerprint) {
                    Ok(record) => {
                        self.clear_failures(&host.id);
                        self.registry.record_image(record.clone())?;
                        Ok(PlacementOutcome {
                            record,
                            already_present: false,
                            retried: true,
                        })
                    }
                    Err(_) => {
                        self.record_failure(&host.id);
                        Err(first_err)
                    }
                }
            }
        }
    }

    /// Create a copy-on-write overlay for one guest on its host, backed
    /// by the placed base image. `timeout` is the clone step's budget.
    pub fn create_overlay(
        &self,
        host: &HostSpec,
        fingerprint: &str,
        overlay_path: &Path,
        disk_mib: Option<u64>,
        timeout: Duration,
    ) -> Result<()> {
        let base = self
            .registry
            .image_on_host(fingerprint, &host.id)
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "overlay requested before image {fingerprint} was placed on `{}`",
                    host.id
                ),
            })?;

        let target = Target::for_host(host);
        let overlay = overlay_path.to_string_lossy();
        let parent = overlay_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !parent.is_empty() {
            let mkdir = self.executor.run(
                &target,
                &format!("mkdir -p {}", shell_quote(&parent)),
                None,
                FILE_OP_TIMEOUT,
            )?;
            if !mkdir.success() {
                return Err(Error::Hypervisor {
                    host: host.id.clone(),
                    message: format!("mkdir {parent} failed: {}", mkdir.stderr.render()),
                });
            }
        }

        let mut command = format!(
            "qemu-img create -f qcow2 -F qcow2 -b {} {}",
            shell_quote(&base.path.to_string_lossy()),
            shell_quote(&overlay),
        );
        if let Some(disk_mib) = disk_mib {
            command.push_str(&format!(" {disk_mib}M"));
        }
        let output = self.executor.run(&target, &command, None, timeout)?;
        if !output.success() {
            return Err(Error::Hypervisor {
                host: host.id.clone(),
                message: format!("qemu-img create failed: {}", output.stderr.render()),
            });
        }
        Ok(())
    }

    /// Remove a guest overlay from its host. Missing files succeed.
    pub fn remove_overlay(&self, host: &HostSpec, overlay_path: &Path) -> Result<()> {
        let target = Target::for_host(host);
        let output = self.executor.run(
            &target,
            &format!("rm -f {}", shell_quote(&overlay_path.to_string_lossy())),
            None,
            FILE_OP_TIMEOUT,
        )?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Hypervisor {
                host: host.id.clone(),
                message: format!(
                    "failed to remove overlay {}: {}",
                    overlay_path.display(),
                    output.stderr.render()
                ),
            })
        }
    }

    /// Drop a host's placement record and the file behind it. Used by
    /// cleanup when no live range references the fingerprint.
    pub fn drop_placement(&self, host: &HostSpec, fingerprint: &str) -> Result<()> {
        if let Some(record) = self.registry.image_on_host(fingerprint, &host.id) {
            let target = Target::for_host(host);
            let output = self.executor.run(
                &target,
                &format!("rm -f {}", shell_quote(&record.path.to_string_lossy())),
                None,
                FILE_OP_TIMEOUT,
            )?;
            if !output.success() {
                return Err(Error::Hypervisor {
                    host: host.id.clone(),
                    message: format!("failed to remove {}", record.path.display()),
                });
            }
            self.registry.drop_image(fingerprint, &host.id)?;
        }
        Ok(())
    }

    pub fn is_quarantined(&self, host_id: &str) -> bool {
        let failures = self.failures.lock().expect("quarantine table poisoned");
        failures
            .get(host_id)
            .map(|count| *count >= QUARANTINE_THRESHOLD)
            .unwrap_or(false)
    }

    fn record_failure(&self, host_id: &str) {
        let mut failures = self.failures.lock().expect("quarantine table poisoned");
        *failures.entry(host_id.to_string()).or_insert(0) += 1;
    }

    fn clear_failures(&self, host_id: &str) {
        let mut failures = self.failures.lock().expect("quarantine table poisoned");
        failures.remove(host_id);
    }

    /// Controller-local path for the image content: the source file
    /// itself for controller sources, a staged download for host sources.
    fn ensure_staged(&self, image: &BaseImageSpec, fingerprint: &str) -> Result<PathBuf> {
        match &image.source {
            ImageSource::Controller(path) => Ok(path.clone()),
            ImageSource::Host { .. } => {
                let staged = self.staging_dir.join(format!("{fingerprint}.img"));
                if staged.is_file() && sha256_file(&staged)? == fingerprint {
                    return Ok(staged);
                }
                let seeds = self.registry.image_seeds(fingerprint);
                let seed = seeds.first().ok_or_else(|| Error::Internal {
                    message: format!("no seed host recorded for image {fingerprint}"),
                })?;
                self.download_seed(seed, &staged, fingerprint)?;
                Ok(staged)
            }
        }
    }

    /// Pull a copy from a seed host other than `exclude` into staging so
    /// the retry does not re-read a possibly corrupt stream.
    fn alternate_seed_copy(
        &self,
        fingerprint: &str,
        exclude: &str,
        current: &Path,
    ) -> Result<PathBuf> {
        let seeds = self.registry.image_seeds(fingerprint);
        let seed = seeds
            .iter()
            .find(|record| record.host != exclude)
            .ok_or_else(|| Error::Internal {
                message: format!("no alternate seed for {fingerprint}"),
            })?;
        let staged = self
            .staging_dir
            .join(format!("{fingerprint}.retry.img"));
        if staged == current {
            return Ok(staged);
        }
        self.download_seed(seed, &staged, fingerprint)?;
        Ok(staged)
    }

    fn download_seed(&self, seed: &ImageRecord, dest: &Path, fingerprint: &str) -> Result<()> {
        let host = self.host_spec(&seed.host)?;
        let target = Target::for_host(host);
        self.executor
            .get(&target, &seed.path.to_string_lossy(), dest)?;
        let observed = sha256_file(dest)?;
        if observed != fingerprint {
            let _ = std::fs::remove_file(dest);
            return Err(Error::Integrity {
                path: dest.to_path_buf(),
                expected: fingerprint.to_string(),
                actual: observed,
            });
        }
        Ok(())
    }

    fn transfer_and_verify(
        &self,
        target: &Target,
        staged: &Path,
        dest: &str,
        fingerprint: &str,
    ) -> Result<ImageRecord> {
        let mkdir = self.executor.run(
            target,
            &format!("mkdir -p {}", shell_quote(HOST_IMAGE_DIR)),
            None,
            FILE_OP_TIMEOUT,
        )?;
        if !mkdir.success() {
            return Err(Error::Hypervisor {
                host: target.id.clone(),
                message: format!("mkdir {HOST_IMAGE_DIR} failed: {}", mkdir.stderr.render()),
            });
        }

        self.executor.put(target, staged, dest, 0o644)?;

        let (observed, size) = self.remote_hash_and_size(target, Path::new(dest))?;
        if observed != fingerprint {
            // Delete the corrupt transfer before reporting.
            let _ = self.executor.run(
                target,
                &format!("rm -f {}", shell_quote(dest)),
                None,
                FILE_OP_TIMEOUT,
            );
            return Err(Error::Integrity {
                path: PathBuf::from(dest),
                expected: fingerprint.to_string(),
                actual: observed,
            });
        }

        let mtime = self.remote_mtime(target, dest).unwrap_or(0);
        Ok(ImageRecord {
            fingerprint: fingerprint.to_string(),
            host: target.id.clone(),
            path: PathBuf::from(dest),
            size_bytes: size,
            mtime,
            recorded_at: now_stamp(),
        })
    }

    fn remote_hash_and_size(&self, target: &Target, path: &Path) -> Result<(String, u64)> {
        remote_hash_and_size_with_timeout(&self.executor, target, path, self.transfer_timeout)
    }

    fn remote_mtime(&self, target: &Target, path: &str) -> Result<u64> {
        let output = self.executor.run(
            target,
            &format!("stat -c %Y {}", shell_quote(path)),
            None,
            FILE_OP_TIMEOUT,
        )?;
        Ok(output.stdout.render().trim().parse::<u64>().unwrap_or(0))
    }
}

/// Fingerprint a base image source without touching the registry. Used
/// by plan-only runs, which must stay free of side effects.
pub fn compute_fingerprint(
    executor: &RemoteExecutor,
    image: &BaseImageSpec,
    hosts: &[HostSpec],
) -> Result<(String, u64)> {
    let (fingerprint, size) = match &image.source {
        ImageSource::Controller(path) => {
            let fingerprint = sha256_file(path)?;
            let size = std::fs::metadata(path)
                .map_err(|source| Error::ReadState {
                    path: path.clone(),
                    source,
                })?
                .len();
            (fingerprint, size)
        }
        ImageSource::Host { host, path } => {
            let host_spec = hosts.iter().find(|h| &h.id == host).ok_or_else(|| {
                Error::Internal {
                    message: format!("image `{}` names unknown host `{host}`", image.id),
                }
            })?;
            let target = Target::for_host(host_spec);
            remote_hash_and_size(executor, &target, path)?
        }
    };
    if let Some(declared) = &image.fingerprint {
        if declared != &fingerprint {
            return Err(Error::Integrity {
                path: match &image.source {
                    ImageSource::Controller(path) => path.clone(),
                    ImageSource::Host { path, .. } => path.clone(),
                },
                expected: declared.clone(),
                actual: fingerprint,
            });
        }
    }
    Ok((fingerprint, size))
}

fn remote_hash_and_size(
    executor: &RemoteExecutor,
    target: &Target,
    path: &Path,
) -> Result<(String, u64)> {
    remote_hash_and_size_with_timeout(executor, target, path, HASH_TIMEOUT)
}

fn remote_hash_and_size_with_timeout(
    executor: &RemoteExecutor,
    target: &Target,
    path: &Path,
    timeout: Duration,
) -> Result<(String, u64)> {
    let quoted = shell_quote(&path.to_string_lossy());
    let output = executor.run(
        target,
        &format!("sha256sum {quoted} | cut -d' ' -f1 && stat -c %s {quoted}"),
        None,
        timeout,
    )?;
    if !output.success() {
        return Err(Error::Hypervisor {
            host: target.id.clone(),
            message: format!(
                "failed to hash {}: {}",
                path.display(),
                output.stderr.render()
            ),
        });
    }
    let rendered = output.stdout.render();
    let mut lines = rendered.lines();
    let hash = lines.next().unwrap_or_default().trim().to_string();
    let size = lines
        .next()
        .unwrap_or_default()
        .trim()
        .parse::<u64>()
        .unwrap_or(0);
    if hash.len() != 64 {
        return Err(Error::Hypervisor {
            host: target.id.clone(),
            message: format!("unexpected sha256sum output for {}", path.display()),
        });
    }
    Ok((hash, size))
}

/// Canonical path of a placed base image on a managed host.
pub fn host_image_path(fingerprint: &str) -> String {
    format!("{HOST_IMAGE_DIR}/{fingerprint}.qcow2")
}

/// Canonical overlay path for a guest on its host.
pub fn host_overlay_path(range_id: &str, guest_id: &str) -> PathBuf {
    PathBuf::from(format!(
        "/var/lib/cyris/overlays/{range_id}/{guest_id}.qcow2"
    ))
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_paths_are_fingerprint_addressed() {
        let fp = "ab".repeat(32);
        assert_eq!(
            host_image_path(&fp),
            format!("/var/lib/cyris/images/{fp}.qcow2")
        );
        assert_eq!(
            host_overlay_path("r1", "g1"),
            PathBuf::from("/var/lib/cyris/overlays/r1/g1.qcow2")
        );
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, b"cyris").unwrap();
        // sha256("cyris")
        assert_eq!(
            sha256_file(&path).unwrap(),
            "09647f9c620dedacb29f1421165a54275ea7dd665609bd1c2ac6bd787a3ffd02"
        );
    }
}
