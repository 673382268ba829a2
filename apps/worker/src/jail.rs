use anyhow::{bail, Context, Result};
use nix::unistd::{self, Gid, Uid};
use tracing::{info, warn};

const NOBODY: u32 = 65534;

/// Enters the jail the broker prepared. The worker is spawned with its
/// jail as the working directory; it chroots into it and drops
/// privileges before touching the engine. Returns false on developer
/// runs without CAP_SYS_CHROOT, which continue unjailed with jail paths
/// resolved against the working directory instead.
pub fn enter_jail() -> Result<bool> {
    let root = std::env::current_dir().context("reading jail working directory")?;
    match unistd::chroot(&root) {
        Ok(()) => {
            unistd::chdir("/").context("chdir into jail root")?;
            drop_privileges()?;
            info!(root = %root.display(), "entered jail");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!(root = %root.display(), "chroot not permitted, running unjailed");
            Ok(false)
        }
        Err(err) => bail!("chroot into {} failed: {}", root.display(), err),
    }
}

fn drop_privileges() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        bail!("prctl(PR_SET_NO_NEW_PRIVS) failed");
    }
    if unistd::geteuid().is_root() {
        unistd::setgroups(&[]).context("dropping supplementary groups")?;
        unistd::setgid(Gid::from_raw(NOBODY)).context("setgid nobody")?;
        unistd::setuid(Uid::from_raw(NOBODY)).context("setuid nobody")?;
    }
    Ok(())
}

/// Labels the process in `ps` output.
pub fn set_process_name(name: &str) {
    let bytes = std::ffi::CString::new(name).unwrap_or_default();
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, bytes.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        warn!(name, "cannot set process name");
    }
}

/// SIGSEGV/SIGBUS traps enabled by `LOOL_DEBUG=1`: announce the crash
/// and park the process so a debugger can attach.
pub fn install_debug_traps() {
    unsafe {
        libc::signal(libc::SIGSEGV, fatal_signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGBUS, fatal_signal_handler as libc::sighandler_t);
    }
}

extern "C" fn fatal_signal_handler(_signo: libc::c_int) {
    const MSG: &[u8] = b"Fatal signal, sleeping so a debugger can attach\n";
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            MSG.as_ptr() as *const libc::c_void,
            MSG.len(),
        );
        loop {
            libc::pause();
        }
    }
}
