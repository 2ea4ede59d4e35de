//! Process hardening applied before any key material is loaded.
//!
//! On Unix the server refuses to write core dumps and pins its pages in
//! RAM so that the master key and disclosed credentials never reach disk.
//! Both steps are no-ops elsewhere.

/// A hardening syscall that did not succeed.
#[derive(Debug, thiserror::Error)]
#[error("{call} failed: {source}")]
pub struct HardeningError {
    call: &'static str,
    #[source]
    source: std::io::Error,
}

/// Set `RLIMIT_CORE` to 0 so a crash cannot dump key material.
///
/// # Errors
///
/// Returns [`HardeningError`] if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), HardeningError> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `setrlimit` reads a valid, fully initialized `rlimit` and only
    // changes a kernel-side limit of this process.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };

    if rc == 0 {
        Ok(())
    } else {
        Err(HardeningError {
            call: "setrlimit(RLIMIT_CORE, 0)",
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), HardeningError> {
    Ok(())
}

/// Lock all current and future pages with `mlockall`.
///
/// Needs `CAP_IPC_LOCK` (or root) on Linux. Set `AGENTKEY_DISABLE_MLOCK=true`
/// to skip it in development.
///
/// # Errors
///
/// Returns [`HardeningError`] if `mlockall` fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), HardeningError> {
    // SAFETY: `mlockall` takes only flag bits and touches no Rust-visible
    // memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if rc == 0 {
        Ok(())
    } else {
        Err(HardeningError {
            call: "mlockall(MCL_CURRENT | MCL_FUTURE)",
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), HardeningError> {
    Ok(())
}
