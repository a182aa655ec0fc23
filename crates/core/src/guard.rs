//! Process resource guard installed before analysis starts.
//!
//! The memory ceiling restricts the whole address space (`RLIMIT_AS`); the
//! timeout arms `SIGALRM` with no handler so the default action kills the
//! process. A limit of `0` is treated the same as an absent limit.

use thiserror::Error;

use crate::config::ResourceLimits;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Failed to set address-space limit to {bytes} bytes: {source}")]
    MemoryLimit {
        bytes: u64,
        #[source]
        source: std::io::Error,
    },
}

/// OS hooks used by [`install`]. Split out so the guard can be tested
/// without changing the test process's own limits.
pub trait ResourceControl {
    fn limit_address_space(&self, bytes: u64) -> std::io::Result<()>;
    fn arm_alarm(&self, seconds: u32);
    fn supported(&self) -> bool {
        true
    }
}

/// Real process limits through `setrlimit`/`alarm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessResources;

#[cfg(unix)]
impl ResourceControl for ProcessResources {
    fn limit_address_space(&self, bytes: u64) -> std::io::Result<()> {
        let bytes = bytes as libc::rlim_t;
        let r = libc::rlimit { rlim_cur: bytes, rlim_max: bytes };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_AS, &r) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn arm_alarm(&self, seconds: u32) {
        // Returns the seconds left on any previous alarm, which we replace.
        unsafe {
            libc::alarm(seconds as libc::c_uint);
        }
    }
}

#[cfg(not(unix))]
impl ResourceControl for ProcessResources {
    fn limit_address_space(&self, _bytes: u64) -> std::io::Result<()> {
        Ok(())
    }

    fn arm_alarm(&self, _seconds: u32) {}

    fn supported(&self) -> bool {
        false
    }
}

/// Which limits actually took effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardReport {
    pub mem_limit: Option<u64>,
    pub timeout_secs: Option<u32>,
}

pub fn install(
    limits: &ResourceLimits,
    control: &dyn ResourceControl,
) -> Result<GuardReport, GuardError> {
    let mem_limit = limits.mem_limit.filter(|&b| b > 0);
    let timeout_secs = limits.timeout_secs.filter(|&s| s > 0);
    if mem_limit.is_none() && timeout_secs.is_none() {
        return Ok(GuardReport::default());
    }
    if !control.supported() {
        log::warn!("resource limits are not supported on this platform; running unbounded");
        return Ok(GuardReport::default());
    }

    if let Some(bytes) = mem_limit {
        control
            .limit_address_space(bytes)
            .map_err(|source| GuardError::MemoryLimit { bytes, source })?;
        log::info!("address space limited to {bytes} bytes");
    }
    if let Some(seconds) = timeout_secs {
        control.arm_alarm(seconds);
        log::info!("analysis timeout armed for {seconds}s");
    }
    Ok(GuardReport { mem_limit, timeout_secs })
}
