//! Process hardening applied before logging is initialized.
//!
//! A control-plane daemon runs with elevated privileges and handles
//! password hashes and session tokens in memory; disabling core dumps and
//! locking pages keeps that material from ever hitting disk via a crash
//! dump or the swap file.

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn disable_core_dumps() -> std::io::Result<()> {
    let limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `setrlimit` with a valid `rlimit` struct and a recognized
    // resource constant is a well-defined syscall; failure is reported via
    // errno, which `last_os_error` reads immediately after the call.
    let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn lock_memory() -> std::io::Result<()> {
    // SAFETY: `mlockall` takes no pointer arguments beyond the flag bits;
    // it either succeeds or returns an error via errno.
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn lock_memory() -> std::io::Result<()> {
    Ok(())
}
