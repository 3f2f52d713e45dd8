//! Runner-side environment sealing.
//!
//! The runner seals itself while it is still single-threaded and before it
//! reads any request, so untrusted code only ever runs inside a finished jail.
//! The sequence is fixed and encoded as a type-state chain:
//!
//! 1. join the instance cgroup (host cgroupfs must still be visible)
//! 2. parent-death signal, then unshare mount/net/ipc/uts/pid (+user when rootless)
//! 3. fork: the child becomes init of the new PID namespace, the parent only waits
//! 4. private propagation, read-only runtime binds, tmpfs scratch, chroot
//! 5. rlimits
//! 6. bounding set, credentials, remaining capabilities, no_new_privs, env
//!
//! Only `Jail<Locked>` can produce a `SealedJail`.

use crate::config::types::{Result, SandboxLimits, ScoreboxError, SecurityMode};
use crate::isolation::privileges;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Names reported in the runner's ready frame
pub mod controls {
    pub const CGROUP: &str = "cgroup";
    pub const USER_NAMESPACE: &str = "user_namespace";
    pub const NETWORK_NAMESPACE: &str = "network_namespace";
    pub const MOUNT_NAMESPACE: &str = "mount_namespace";
    pub const PID_NAMESPACE: &str = "pid_namespace";
    pub const IPC_NAMESPACE: &str = "ipc_namespace";
    pub const UTS_NAMESPACE: &str = "uts_namespace";
    pub const CHROOT: &str = "chroot";
    pub const SCRATCH_TMPFS: &str = "scratch_tmpfs";
    pub const RLIMITS: &str = "rlimits";
    pub const CREDENTIALS_DROPPED: &str = "credentials_dropped";
    pub const CAPABILITIES_DROPPED: &str = "capabilities_dropped";
    pub const NO_NEW_PRIVILEGES: &str = "no_new_privileges";
}

/// Controls an environment must report before the host accepts it
pub fn required_controls(mode: SecurityMode) -> &'static [&'static str] {
    use controls::*;
    match mode {
        SecurityMode::Strict => &[
            CGROUP,
            NETWORK_NAMESPACE,
            MOUNT_NAMESPACE,
            PID_NAMESPACE,
            CHROOT,
            SCRATCH_TMPFS,
            RLIMITS,
            CREDENTIALS_DROPPED,
            CAPABILITIES_DROPPED,
            NO_NEW_PRIVILEGES,
        ],
        SecurityMode::Permissive => &[
            NETWORK_NAMESPACE,
            MOUNT_NAMESPACE,
            PID_NAMESPACE,
            CHROOT,
            SCRATCH_TMPFS,
            RLIMITS,
            CAPABILITIES_DROPPED,
            NO_NEW_PRIVILEGES,
        ],
        SecurityMode::Dev => &[],
    }
}

/// Jail description handed from the host to the runner (`--jail <json>`)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JailSpec {
    pub instance_id: String,
    pub mode: SecurityMode,
    /// Host directory that becomes `/` (isolated modes) or holds `work/` (dev)
    pub root_dir: PathBuf,
    pub runtime_mounts: Vec<PathBuf>,
    pub interpreter: PathBuf,
    pub limits: SandboxLimits,
    /// cgroup.procs file of the instance cgroup, when one exists
    pub cgroup_procs: Option<PathBuf>,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
}

/// State of the runner once sealing is complete
#[derive(Debug)]
pub struct SealedJail {
    pub controls: Vec<String>,
    pub workdir: PathBuf,
    pub scratch: Vec<PathBuf>,
    /// True when the runner is PID 1 of its own namespace
    pub namespace_init: bool,
    pub interpreter: PathBuf,
}

pub const JAIL_WORKDIR: &str = "/work";
pub const JAIL_TMPDIR: &str = "/tmp";

/// Seal the current process according to `spec`.
/// In isolated modes the original process never returns from this call;
/// it exits with the status of the namespace init.
pub fn seal(spec: &JailSpec) -> Result<SealedJail> {
    if !spec.mode.is_isolated() {
        return seal_dev(spec);
    }

    Jail::new(spec)
        .join_cgroup()?
        .unshare_namespaces()?
        .become_namespace_init()?
        .build_root()?
        .apply_limits()?
        .lock_privileges()
        .map(Jail::finish)
}

fn seal_dev(spec: &JailSpec) -> Result<SealedJail> {
    let workdir = spec.root_dir.join("work");
    fs::create_dir_all(&workdir)
        .map_err(|e| ScoreboxError::Filesystem(format!("Failed to create {}: {}", workdir.display(), e)))?;
    chdir(&workdir)?;
    log::warn!(
        "Instance {} runs in dev mode: NO network, filesystem or resource isolation",
        spec.instance_id
    );
    Ok(SealedJail {
        controls: Vec::new(),
        scratch: vec![workdir.clone()],
        workdir,
        namespace_init: false,
        interpreter: spec.interpreter.clone(),
    })
}

/// Type-state marker: nothing applied yet
pub struct Fresh;
/// Type-state marker: namespaces unshared, PID namespace not yet entered
pub struct Unshared;
/// Type-state marker: running as init of the new PID namespace
pub struct NamespaceInit;
/// Type-state marker: chrooted into the jail root
pub struct Rooted;
/// Type-state marker: limits applied
pub struct Limited;
/// Type-state marker: privileges locked; ready to serve
pub struct Locked;

pub struct Jail<'a, S> {
    spec: &'a JailSpec,
    controls: Vec<String>,
    rootless: bool,
    _state: PhantomData<S>,
}

impl<'a, S> Jail<'a, S> {
    fn advance<T>(self) -> Jail<'a, T> {
        Jail {
            spec: self.spec,
            controls: self.controls,
            rootless: self.rootless,
            _state: PhantomData,
        }
    }

    fn record(&mut self, control: &str) {
        self.controls.push(control.to_string());
    }

    fn strict_mode(&self) -> bool {
        self.spec.mode.strict_mode()
    }

    /// Strict mode turns a degraded control into an error
    fn degrade(&self, err: ScoreboxError) -> Result<()> {
        if self.strict_mode() {
            return Err(err);
        }
        log::warn!("{} (permissive mode)", err);
        Ok(())
    }
}

impl<'a> Jail<'a, Fresh> {
    pub fn new(spec: &'a JailSpec) -> Self {
        Jail {
            spec,
            controls: Vec::new(),
            rootless: !nix::unistd::geteuid().is_root(),
            _state: PhantomData,
        }
    }

    /// Runs before unshare so the host cgroup filesystem is still reachable
    pub fn join_cgroup(mut self) -> Result<Self> {
        let spec = self.spec;
        match &spec.cgroup_procs {
            Some(procs) => match fs::write(procs, std::process::id().to_string()) {
                Ok(()) => self.record(controls::CGROUP),
                Err(e) => self.degrade(ScoreboxError::Cgroup(format!(
                    "Failed to join cgroup via {}: {}",
                    procs.display(),
                    e
                )))?,
            },
            None => self.degrade(ScoreboxError::Cgroup("no cgroup assigned to this instance".to_string()))?,
        }
        Ok(self)
    }

    pub fn unshare_namespaces(mut self) -> Result<Jail<'a, Unshared>> {
        if self.rootless && self.strict_mode() {
            return Err(ScoreboxError::Privilege("strict mode requires root".to_string()));
        }

        nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| ScoreboxError::Process(format!("Failed to set parent death signal: {}", e)))?;

        let host_uid = nix::unistd::getuid().as_raw();
        let host_gid = nix::unistd::getgid().as_raw();

        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID;
        if self.rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(flags).map_err(|e| ScoreboxError::Namespace(format!("unshare({:?}) failed: {}", flags, e)))?;

        if self.rootless {
            write_id_maps(host_uid, host_gid)?;
            self.record(controls::USER_NAMESPACE);
        }
        for control in [
            controls::MOUNT_NAMESPACE,
            controls::NETWORK_NAMESPACE,
            controls::IPC_NAMESPACE,
            controls::UTS_NAMESPACE,
        ] {
            self.record(control);
        }
        Ok(self.advance())
    }
}

/// Map the invoking user to root inside a fresh user namespace
fn write_id_maps(uid: u32, gid: u32) -> Result<()> {
    let write = |file: &str, content: String| {
        fs::write(file, content)
            .map_err(|e| ScoreboxError::Namespace(format!("Failed to write {}: {}", file, e)))
    };
    write("/proc/self/setgroups", "deny".to_string())?;
    write("/proc/self/uid_map", format!("0 {} 1", uid))?;
    write("/proc/self/gid_map", format!("0 {} 1", gid))?;
    Ok(())
}

impl<'a> Jail<'a, Unshared> {
    /// Fork into the PID namespace. The parent stays behind only to mirror
    /// the child's exit status; when either dies the other follows.
    pub fn become_namespace_init(mut self) -> Result<Jail<'a, NamespaceInit>> {
        // SAFETY: the runner is single-threaded until sealing completes.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => std::process::exit(wait_for_init(child)),
            Ok(ForkResult::Child) => {
                nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
                    ScoreboxError::Process(format!("Failed to set parent death signal: {}", e))
                })?;
                self.record(controls::PID_NAMESPACE);
                Ok(self.advance())
            }
            Err(e) => Err(ScoreboxError::Namespace(format!(
                "fork into PID namespace failed: {}",
                e
            ))),
        }
    }
}

fn wait_for_init(child: Pid) -> i32 {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128 + signal as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

impl<'a> Jail<'a, NamespaceInit> {
    pub fn build_root(mut self) -> Result<Jail<'a, Rooted>> {
        let root = self.spec.root_dir.as_path();

        if let Err(e) = nix::unistd::sethostname("scorebox") {
            log::debug!("sethostname failed: {}", e);
        }

        mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
            .map_err(|e| ScoreboxError::Namespace(format!("Failed to make / private: {}", e)))?;
        bind(root, root)?;

        for source in &self.spec.runtime_mounts {
            expose_runtime_path(root, source)?;
        }

        let scratch_opts = format!("size={},mode=1777", self.spec.limits.scratch_size_bytes);
        for dir in [JAIL_WORKDIR, JAIL_TMPDIR] {
            let target = jail_path(root, Path::new(dir));
            create_dir(&target)?;
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(scratch_opts.as_str()),
            )
            .map_err(|e| ScoreboxError::Filesystem(format!("tmpfs at {} failed: {}", target.display(), e)))?;
        }
        self.record(controls::SCRATCH_TMPFS);

        expose_devices(root);
        mount_proc(root);

        remount_read_only(root, MsFlags::MS_NODEV)?;

        chdir(root)?;
        chroot(".").map_err(|e| ScoreboxError::Filesystem(format!("chroot failed: {}", e)))?;
        chdir(JAIL_WORKDIR)?;
        self.record(controls::CHROOT);
        log::debug!("Instance {} chrooted into {}", self.spec.instance_id, root.display());

        Ok(self.advance())
    }
}

fn jail_path(root: &Path, inside: &Path) -> PathBuf {
    root.join(inside.strip_prefix("/").unwrap_or(inside))
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| ScoreboxError::Filesystem(format!("Failed to create {}: {}", path.display(), e)))
}

fn bind(source: &Path, target: &Path) -> Result<()> {
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>).map_err(|e| {
        ScoreboxError::Filesystem(format!(
            "bind {} -> {} failed: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

/// Flags a remount must carry over from the existing mount.
/// Inside a user namespace these are locked and dropping one is EPERM.
fn preserved_flags(path: &Path) -> MsFlags {
    let mut flags = MsFlags::empty();
    if let Ok(stat) = statvfs(path) {
        let current = stat.flags();
        for (st, ms) in [
            (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
            (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
            (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
            (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
            (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
            (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
        ] {
            if current.contains(st) {
                flags |= ms;
            }
        }
    }
    flags
}

fn remount_read_only(target: &Path, extra: MsFlags) -> Result<()> {
    let flags = MsFlags::MS_REMOUNT
        | MsFlags::MS_BIND
        | MsFlags::MS_RDONLY
        | MsFlags::MS_NOSUID
        | preserved_flags(target)
        | extra;
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        ScoreboxError::Filesystem(format!("read-only remount of {} failed: {}", target.display(), e))
    })
}

/// Bind a host runtime path read-only at the same location inside the jail.
/// Symlinks (merged /usr layouts) are recreated as symlinks; missing paths are skipped.
fn expose_runtime_path(root: &Path, source: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(source) {
        Ok(meta) => meta,
        Err(_) => {
            log::debug!("Runtime path {} not present on host; skipping", source.display());
            return Ok(());
        }
    };
    let target = jail_path(root, source);
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }

    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        std::os::unix::fs::symlink(&link, &target).map_err(|e| {
            ScoreboxError::Filesystem(format!("symlink {} failed: {}", target.display(), e))
        })?;
        return Ok(());
    }

    if meta.is_dir() {
        create_dir(&target)?;
    } else {
        fs::write(&target, b"")?;
    }
    bind(source, &target)?;
    remount_read_only(&target, MsFlags::MS_NODEV)
}

/// Best-effort: a handful of character devices the interpreter expects
fn expose_devices(root: &Path) {
    let dev = jail_path(root, Path::new("/dev"));
    if let Err(e) = fs::create_dir_all(&dev) {
        log::warn!("Cannot create {}: {}", dev.display(), e);
        return;
    }
    for name in ["null", "zero", "urandom", "random"] {
        let source = Path::new("/dev").join(name);
        let target = dev.join(name);
        let result = fs::write(&target, b"").map_err(ScoreboxError::from).and_then(|_| {
            mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                .map_err(ScoreboxError::from)
        });
        if let Err(e) = result {
            log::warn!("Cannot expose {} in jail: {}", source.display(), e);
        }
    }
}

/// Best-effort: /proc of the sandbox's own PID namespace
fn mount_proc(root: &Path) {
    let target = jail_path(root, Path::new("/proc"));
    let result = fs::create_dir_all(&target).map_err(ScoreboxError::from).and_then(|_| {
        mount(
            Some("proc"),
            &target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(ScoreboxError::from)
    });
    if let Err(e) = result {
        log::warn!("Cannot mount /proc in jail: {}", e);
    }
}

#[cfg(target_os = "linux")]
fn apply_rlimit_value(
    name: &str,
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
    strict_mode: bool,
) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialized rlimit struct.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let msg = format!("Failed to apply {}={} (hard={}): {}", name, soft, hard, err);
    if strict_mode {
        return Err(ScoreboxError::Process(msg));
    }
    log::warn!("{} (permissive mode)", msg);
    Ok(())
}

impl<'a> Jail<'a, Rooted> {
    pub fn apply_limits(mut self) -> Result<Jail<'a, Limited>> {
        let limits = &self.spec.limits;
        let strict = self.strict_mode();
        apply_rlimit_value("RLIMIT_AS", libc::RLIMIT_AS, limits.memory_limit_bytes, limits.memory_limit_bytes, strict)?;
        apply_rlimit_value(
            "RLIMIT_CPU",
            libc::RLIMIT_CPU,
            limits.cpu_time_limit_secs.max(1),
            limits.cpu_time_limit_secs.max(1) + 1,
            strict,
        )?;
        apply_rlimit_value(
            "RLIMIT_FSIZE",
            libc::RLIMIT_FSIZE,
            limits.file_size_limit_bytes,
            limits.file_size_limit_bytes,
            strict,
        )?;
        apply_rlimit_value("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, limits.fd_limit, limits.fd_limit, strict)?;
        apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, 0, 0, strict)?;
        apply_rlimit_value("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK, 0, 0, strict)?;
        self.record(controls::RLIMITS);
        Ok(self.advance())
    }
}

impl<'a> Jail<'a, Limited> {
    pub fn lock_privileges(mut self) -> Result<Jail<'a, Locked>> {
        let strict = self.strict_mode();

        if self.rootless {
            // uid 0 inside the user namespace is the only mapped id; shed its capabilities
            privileges::drop_capabilities()?;
        } else {
            privileges::drop_bounding_set();
            privileges::clear_ambient_capabilities();
            privileges::drop_credentials(self.spec.sandbox_uid, self.spec.sandbox_gid, strict)?;
            privileges::zero_process_capabilities()?;
            self.record(controls::CREDENTIALS_DROPPED);
        }
        self.record(controls::CAPABILITIES_DROPPED);

        privileges::set_no_new_privs()?;
        self.record(controls::NO_NEW_PRIVILEGES);

        sanitize_environment();
        Ok(self.advance())
    }
}

fn sanitize_environment() {
    let rust_log = std::env::var("RUST_LOG").ok();
    // SAFETY: single-threaded at this point; nothing else reads the environment.
    unsafe {
        libc::clearenv();
    }
    std::env::set_var("PATH", "/usr/local/bin:/usr/bin:/bin");
    std::env::set_var("HOME", JAIL_WORKDIR);
    std::env::set_var("TMPDIR", JAIL_TMPDIR);
    std::env::set_var("LANG", "C.UTF-8");
    if let Some(filter) = rust_log {
        std::env::set_var("RUST_LOG", filter);
    }
}

impl<'a> Jail<'a, Locked> {
    pub fn finish(self) -> SealedJail {
        log::info!(
            "Instance {} sealed with controls {:?}",
            self.spec.instance_id,
            self.controls
        );
        SealedJail {
            controls: self.controls,
            workdir: PathBuf::from(JAIL_WORKDIR),
            scratch: vec![PathBuf::from(JAIL_WORKDIR), PathBuf::from(JAIL_TMPDIR)],
            namespace_init: true,
            interpreter: self.spec.interpreter.clone(),
        }
    }
}

/// Whether this host lets an unprivileged process create user namespaces
pub fn user_namespaces_available() -> bool {
    let read = |path: &str| fs::read_to_string(path).ok().map(|s| s.trim().to_string());
    if read("/proc/sys/kernel/unprivileged_userns_clone").as_deref() == Some("0") {
        return false;
    }
    match read("/proc/sys/user/max_user_namespaces") {
        Some(max) => max.parse::<u64>().map(|n| n > 0).unwrap_or(false),
        None => Path::new("/proc/self/ns/user").exists(),
    }
}
