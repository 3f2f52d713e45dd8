//! Privilege reduction for the sealed runner.
//!
//! CRITICAL: setresgid MUST run before setresuid, otherwise the saved-set-uid
//! can be used to regain root.

use crate::config::types::{Result, ScoreboxError};

const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;
const PR_CAP_AMBIENT: libc::c_int = 47;
const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
const MAX_CAP: libc::c_ulong = 40;

/// Drop every capability from the bounding, ambient, effective, permitted and inheritable sets.
/// Idempotent; individual failures are logged.
pub fn drop_capabilities() -> Result<()> {
    drop_bounding_set();
    clear_ambient_capabilities();
    zero_process_capabilities()
}

/// Needs CAP_SETPCAP, so it must run before credentials are dropped
pub fn drop_bounding_set() {
    for cap in 0..=MAX_CAP {
        // SAFETY: PR_CAPBSET_DROP with any cap number is safe; unknown caps return EINVAL.
        let _ = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
    }
}

pub fn clear_ambient_capabilities() {
    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no pointers.
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    if rc != 0 {
        log::warn!("Failed to clear ambient capabilities (may not be supported)");
    }
}

pub fn zero_process_capabilities() -> Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 carries two words: caps 0-31 and 32-63.
    let data = [
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
    ];

    // SAFETY: header and data are initialized repr(C) structs that outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            log::debug!("capset returned EPERM after credential drop: {}", err);
        } else {
            return Err(ScoreboxError::Privilege(format!("capset failed: {}", err)));
        }
    }
    Ok(())
}

/// Block privilege gain through execve (setuid binaries, file capabilities)
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes no pointers and is irreversible.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(ScoreboxError::Privilege(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if !no_new_privs_set() {
        return Err(ScoreboxError::Privilege(
            "PR_SET_NO_NEW_PRIVS reported success but the flag is not set".to_string(),
        ));
    }
    Ok(())
}

fn no_new_privs_set() -> bool {
    // SAFETY: read-only prctl query.
    unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
}

/// Switch to an unprivileged uid/gid: clear groups, then gid, then uid, then verify
pub fn drop_credentials(uid: u32, gid: u32, strict_mode: bool) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(ScoreboxError::Privilege(format!(
            "refusing to run sandboxed code as root (uid={}, gid={})",
            uid, gid
        )));
    }

    if let Err(e) = nix::unistd::setgroups(&[]) {
        let msg = format!("Failed to clear supplementary groups: {}", e);
        if strict_mode {
            return Err(ScoreboxError::Privilege(msg));
        }
        log::warn!("{} (permissive mode)", msg);
    }

    // SAFETY: setresgid/setresuid take plain integers.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(ScoreboxError::Privilege(format!(
            "setresgid({}) failed: {}",
            gid,
            std::io::Error::last_os_error()
        )));
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(ScoreboxError::Privilege(format!(
            "setresuid({}) failed: {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }

    let (ruid, euid) = (nix::unistd::getuid().as_raw(), nix::unistd::geteuid().as_raw());
    let (rgid, egid) = (nix::unistd::getgid().as_raw(), nix::unistd::getegid().as_raw());
    if ruid != uid || euid != uid || rgid != gid || egid != gid {
        return Err(ScoreboxError::Privilege(format!(
            "credential check failed: uid {}/{} gid {}/{}, expected {}/{}",
            ruid, euid, rgid, egid, uid, gid
        )));
    }

    log::info!("Dropped credentials to uid={} gid={}", uid, gid);
    Ok(())
}
