//! Host facts reported with every heartbeat

use chrono::Utc;
use taskwire::Heartbeat;

/// Load averages from sysinfo are fixed point with 16 fractional bits
#[cfg(target_os = "linux")]
const LOAD_SCALE: f64 = 65536.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostFacts {
    pub hostname: String,
    pub uptime: u64,
    pub proc_count: u64,
    pub loads: [f64; 3],
    pub mem_total: u64,
    pub mem_free: u64,
}

impl HostFacts {
    /// Gather facts from the running system; missing facts are zero
    pub fn collect() -> Self {
        let mut facts = Self {
            hostname: hostname(),
            ..Self::default()
        };
        fill_sysinfo(&mut facts);
        facts
    }

    pub fn boot_time(&self) -> u64 {
        (Utc::now().timestamp().max(0) as u64).saturating_sub(self.uptime)
    }

    pub fn heartbeat(&self, client_id: &str) -> Heartbeat {
        Heartbeat {
            client_id: client_id.to_string(),
            hostname: self.hostname.clone(),
            uptime: self.uptime,
            boot_time: self.boot_time(),
            proc_count: self.proc_count,
            os: std::env::consts::OS.to_string(),
            load1: self.loads[0],
            load5: self.loads[1],
            load15: self.loads[2],
            mem_total: self.mem_total,
            mem_free: self.mem_free,
            mem_used: self.mem_total.saturating_sub(self.mem_free),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(target_os = "linux")]
fn fill_sysinfo(facts: &mut HostFacts) {
    use std::mem::MaybeUninit;

    // SAFETY: sysinfo fills the struct it is given; we check the return value
    // before reading it.
    let info = unsafe {
        let mut info: MaybeUninit<libc::sysinfo> = MaybeUninit::uninit();
        if libc::sysinfo(info.as_mut_ptr()) != 0 {
            log::debug!("sysinfo failed: {}", std::io::Error::last_os_error());
            return;
        }
        info.assume_init()
    };

    let unit = u64::from(info.mem_unit.max(1));
    facts.uptime = info.uptime.max(0) as u64;
    facts.proc_count = u64::from(info.procs);
    facts.mem_total = info.totalram as u64 * unit;
    facts.mem_free = info.freeram as u64 * unit;
    for (slot, raw) in facts.loads.iter_mut().zip(info.loads) {
        *slot = raw as f64 / LOAD_SCALE;
    }
}

/// Boot timestamp from `sysctl kern.boottime`
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub(crate) fn boot_timeval() -> Option<libc::timeval> {
    use std::mem::{MaybeUninit, size_of};

    let mut tv: MaybeUninit<libc::timeval> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::timeval>();
    // SAFETY: the name is NUL-terminated and `len` is the size of the buffer;
    // the value is only read when the kernel filled all of it.
    unsafe {
        let rc = libc::sysctlbyname(
            c"kern.boottime".as_ptr(),
            tv.as_mut_ptr().cast(),
            &raw mut len,
            std::ptr::null_mut(),
            0,
        );
        if rc != 0 || len != size_of::<libc::timeval>() {
            log::debug!("sysctl kern.boottime failed: {}", std::io::Error::last_os_error());
            return None;
        }
        Some(tv.assume_init())
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn fill_sysinfo(facts: &mut HostFacts) {
    if let Some(tv) = boot_timeval() {
        let now = Utc::now().timestamp();
        facts.uptime = (now - i64::from(tv.tv_sec)).max(0) as u64;
    }
}

#[cfg(windows)]
fn fill_sysinfo(facts: &mut HostFacts) {
    // SAFETY: GetTickCount64 takes no arguments and cannot fail.
    let millis = unsafe { windows_sys::Win32::System::SystemInformation::GetTickCount64() };
    facts.uptime = millis / 1000;
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    windows
)))]
fn fill_sysinfo(_facts: &mut HostFacts) {}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer length passed matches the buffer; gethostname
    // NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return String::from("unknown");
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| String::from("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_has_hostname() {
        let facts = HostFacts::collect();
        assert!(!facts.hostname.is_empty());
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd", windows))]
    #[test]
    fn test_uptime_is_read_from_the_system() {
        let facts = HostFacts::collect();
        assert!(facts.uptime > 0);
        assert!(facts.boot_time() < Utc::now().timestamp() as u64);
    }

    #[test]
    fn test_heartbeat_derives_used_memory() {
        let facts = HostFacts {
            hostname: "web".into(),
            uptime: 60,
            proc_count: 10,
            loads: [0.5, 0.25, 0.125],
            mem_total: 1000,
            mem_free: 400,
        };
        let beat = facts.heartbeat("client-1");
        assert_eq!(beat.client_id, "client-1");
        assert_eq!(beat.mem_used, 600);
        assert_eq!(beat.load5, 0.25);
        assert!(beat.boot_time > 0);
    }
}
