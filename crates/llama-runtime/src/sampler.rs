//! Process memory samplers.
//!
//! The watchdog only needs two numbers from the OS: this process's resident set size
//! and the device's physical RAM. Both degrade to `0` when the platform gives no answer.

/// Platform tier used to pick a recommended memory ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// iPhone / iPad: jetsam limits are fixed per app, not per device RAM.
    AppleMobile,
    Android,
    /// Everything else, macOS included.
    Desktop,
}

impl DeviceClass {
    pub fn current() -> Self {
        if cfg!(target_os = "ios") {
            DeviceClass::AppleMobile
        } else if cfg!(target_os = "android") {
            DeviceClass::Android
        } else {
            DeviceClass::Desktop
        }
    }
}

/// Source of memory readings for a `MemoryGuard`.
pub trait MemorySampler: Send + Sync {
    /// Resident bytes of the current process, or 0 if unknown.
    fn resident_bytes(&self) -> usize;

    /// Physical RAM of the device, or 0 if unknown.
    fn total_physical_bytes(&self) -> usize;

    fn device_class(&self) -> DeviceClass {
        DeviceClass::current()
    }
}

/// Sampler backed by the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSampler;

impl MemorySampler for SystemSampler {
    fn resident_bytes(&self) -> usize {
        resident_bytes()
    }

    fn total_physical_bytes(&self) -> usize {
        total_physical_bytes()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn resident_bytes() -> usize {
    // statm: size resident shared text lib data dt, in pages
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<usize>().ok())
        .map(|pages| pages.saturating_mul(page_size()))
        .unwrap_or(0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn total_physical_bytes() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    usize::try_from(pages)
        .unwrap_or(0)
        .saturating_mul(page_size())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn resident_bytes() -> usize {
    use std::mem;

    #[repr(C)]
    struct MachTaskBasicInfo {
        virtual_size: u64,
        resident_size: u64,
        resident_size_max: u64,
        user_time: [i32; 2],
        system_time: [i32; 2],
        policy: i32,
        suspend_count: i32,
    }

    extern "C" {
        fn mach_task_self() -> u32;
        fn task_info(
            target_task: u32,
            flavor: u32,
            task_info: *mut MachTaskBasicInfo,
            task_info_count: *mut u32,
        ) -> i32;
    }

    const MACH_TASK_BASIC_INFO: u32 = 20;

    // SAFETY: `info` is a correctly sized, zeroed out-parameter and `count` holds its
    // length in natural_t units, as task_info requires.
    unsafe {
        let mut info: MachTaskBasicInfo = mem::zeroed();
        let mut count = (mem::size_of::<MachTaskBasicInfo>() / mem::size_of::<u32>()) as u32;
        let result = task_info(mach_task_self(), MACH_TASK_BASIC_INFO, &mut info, &mut count);
        if result == 0 {
            return usize::try_from(info.resident_size).unwrap_or(usize::MAX);
        }
    }
    0
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn total_physical_bytes() -> usize {
    let mut memsize: u64 = 0;
    let mut len = std::mem::size_of::<u64>();
    // SAFETY: the name is NUL-terminated and the out-buffer is exactly `len` bytes.
    let rc = unsafe {
        libc::sysctlbyname(
            b"hw.memsize\0".as_ptr().cast(),
            (&mut memsize as *mut u64).cast(),
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == 0 {
        usize::try_from(memsize).unwrap_or(usize::MAX)
    } else {
        0
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn resident_bytes() -> usize {
    0
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn total_physical_bytes() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn linux_sampler_reports_nonzero() {
        let sampler = SystemSampler;
        assert!(sampler.resident_bytes() > 0);
        assert!(sampler.total_physical_bytes() >= sampler.resident_bytes());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn linux_is_desktop_class() {
        assert_eq!(SystemSampler.device_class(), DeviceClass::Desktop);
    }
}
