use std::io;

/// Raises (or lowers) the process limit on open file descriptors, setting
/// both the soft and hard limit to `limit`.
#[cfg(unix)]
pub fn set_max_open_files(limit: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    // SAFETY: `rlim` is a valid, initialized rlimit that outlives the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn set_max_open_files(_limit: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resource limits are not supported on this platform",
    ))
}

/// Current soft and hard limits on open file descriptors.
#[cfg(unix)]
pub fn max_open_files() -> io::Result<(u64, u64)> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc == 0 {
        Ok((rlim.rlim_cur as u64, rlim.rlim_max as u64))
    } else {
        Err(io::Error::last_os_error())
    }
}
