/// Per-instance cgroup v2 directories: memory and process caps plus a kill switch
use crate::config::types::{Result, SandboxLimits, ScoreboxError};
use std::fs;
use std::path::{Path, PathBuf};

/// Unified hierarchy is mounted when this file exists
pub fn cgroup_v2_available() -> bool {
    is_cgroup_dir(Path::new("/sys/fs/cgroup"))
}

fn is_cgroup_dir(path: &Path) -> bool {
    path.join("cgroup.controllers").exists()
}

/// One cgroup owned by one sandbox instance
#[derive(Debug)]
pub struct InstanceCgroup {
    path: PathBuf,
    removed: bool,
}

impl InstanceCgroup {
    /// Create `<root>/<instance_id>` and apply limits.
    /// In strict mode every limit write must succeed.
    pub fn create(root: &Path, instance_id: &str, limits: &SandboxLimits, strict_mode: bool) -> Result<Self> {
        // The root may not exist yet, but it must live inside a v2 hierarchy
        if !is_cgroup_dir(root) && !root.parent().map_or(false, is_cgroup_dir) {
            return Err(ScoreboxError::Cgroup(format!(
                "{} is not inside a cgroup v2 hierarchy",
                root.display()
            )));
        }

        fs::create_dir_all(root)
            .map_err(|e| ScoreboxError::Cgroup(format!("Failed to create {}: {}", root.display(), e)))?;
        // Children only get memory/pids files when the parent delegates them.
        if let Err(e) = fs::write(root.join("cgroup.subtree_control"), "+memory +pids") {
            log::debug!("Could not enable controllers under {}: {}", root.display(), e);
        }

        let path = root.join(instance_id);
        fs::create_dir_all(&path)
            .map_err(|e| ScoreboxError::Cgroup(format!("Failed to create cgroup: {}", e)))?;
        let cgroup = InstanceCgroup {
            path,
            removed: false,
        };

        cgroup.write_limit("memory.max", limits.memory_limit_bytes.to_string(), strict_mode)?;
        cgroup.write_limit("memory.swap.max", "0".to_string(), false)?;
        cgroup.write_limit("memory.oom.group", "1".to_string(), false)?;
        cgroup.write_limit("pids.max", limits.process_limit.to_string(), strict_mode)?;

        log::debug!("Created cgroup {}", cgroup.path.display());
        Ok(cgroup)
    }

    fn write_limit(&self, file: &str, value: String, strict_mode: bool) -> Result<()> {
        let target = self.path.join(file);
        if let Err(e) = fs::write(&target, &value) {
            let msg = format!("Failed to set {}={}: {}", file, value, e);
            if strict_mode {
                return Err(ScoreboxError::Cgroup(msg));
            }
            log::warn!("{} (permissive mode)", msg);
        }
        Ok(())
    }

    /// File a process writes its own pid into to join this cgroup
    pub fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Kill every process in the cgroup
    pub fn kill_all(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() && fs::write(&kill_file, "1").is_ok() {
            return;
        }
        // Kernels before 5.14 have no cgroup.kill
        if let Ok(pids) = fs::read_to_string(self.procs_file()) {
            for pid in pids.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                // SAFETY: plain kill(2) on pids read from our own cgroup.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    /// Remove the directory; it must be empty of processes
    pub fn remove(&mut self) -> Result<()> {
        if self.removed || !self.path.exists() {
            self.removed = true;
            return Ok(());
        }
        for _ in 0..50 {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    self.removed = true;
                    return Ok(());
                }
                // EBUSY while killed processes are still exiting
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(ScoreboxError::Cgroup(format!(
                        "Failed to remove cgroup {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
        Err(ScoreboxError::Cgroup(format!(
            "cgroup {} still busy after kill",
            self.path.display()
        )))
    }
}

impl Drop for InstanceCgroup {
    fn drop(&mut self) {
        if !self.removed {
            self.kill_all();
            if let Err(e) = self.remove() {
                log::warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance");
        fs::create_dir(&path).unwrap();
        let mut cgroup = InstanceCgroup {
            path: path.clone(),
            removed: false,
        };
        assert_eq!(cgroup.procs_file(), path.join("cgroup.procs"));
        cgroup.remove().unwrap();
        assert!(!path.exists());
        cgroup.remove().unwrap();
    }

    #[test]
    fn missing_hierarchy_is_a_cgroup_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = InstanceCgroup::create(dir.path(), "x", &SandboxLimits::default(), true);
        assert!(matches!(result, Err(ScoreboxError::Cgroup(_))));
    }
}
