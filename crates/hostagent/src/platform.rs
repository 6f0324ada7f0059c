//! OS integration seam: reboot, local accounts and boot identity

use crate::error::{Error, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

/// Environment variables carrying account details to PowerShell
const ACCOUNT_USER_ENV: &str = "RANGECTL_ACCOUNT_USER";
const ACCOUNT_PASSWORD_ENV: &str = "RANGECTL_ACCOUNT_PASSWORD";

pub trait Platform: Send + Sync {
    /// Ask the OS to reboot; returns once the request is issued
    fn reboot(&self) -> Result<()>;

    fn create_user(&self, user: &str, password: Option<&str>) -> Result<()>;

    fn add_to_group(&self, user: &str, group: &str) -> Result<()>;

    /// Value that changes on every boot
    fn boot_marker(&self) -> Result<String>;

    /// Block while the OS goes down after a reboot request
    fn halt_after_reboot(&self);
}

/// Platform backed by the host's own tools
pub struct SystemPlatform;

fn run(program: &str, args: &[&str]) -> Result<()> {
    log::debug!("Running {} {}", program, args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_command(cmd, program)
}

fn run_command(mut cmd: Command, program: &str) -> Result<()> {
    let status = cmd
        .status()
        .map_err(|e| Error::Platform(format!("failed to run {program}: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Platform(format!("{program} exited with {status}")))
    }
}

/// `New-LocalUser` with the name and password passed through the environment
fn windows_create_user(user: &str, password: Option<&str>) -> Command {
    let script = if password.is_some() {
        format!(
            "$ErrorActionPreference = 'Stop'; \
             $pass = ConvertTo-SecureString $env:{ACCOUNT_PASSWORD_ENV} -AsPlainText -Force; \
             New-LocalUser -Name $env:{ACCOUNT_USER_ENV} -Password $pass | Out-Null"
        )
    } else {
        format!(
            "$ErrorActionPreference = 'Stop'; \
             New-LocalUser -Name $env:{ACCOUNT_USER_ENV} -NoPassword | Out-Null"
        )
    };

    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
    cmd.env(ACCOUNT_USER_ENV, user);
    if let Some(password) = password {
        cmd.env(ACCOUNT_PASSWORD_ENV, password);
    }
    cmd
}

impl Platform for SystemPlatform {
    fn reboot(&self) -> Result<()> {
        log::warn!("Rebooting host");
        if cfg!(windows) {
            run("shutdown", &["/r", "/t", "0"])
        } else {
            run("shutdown", &["-r", "now"])
        }
    }

    fn create_user(&self, user: &str, password: Option<&str>) -> Result<()> {
        if cfg!(windows) {
            log::debug!("Creating local user {user}");
            return run_command(windows_create_user(user, password), "powershell");
        }

        run("useradd", &["-m", user])?;
        if let Some(password) = password {
            let mut child = Command::new("chpasswd")
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| Error::Platform(format!("failed to run chpasswd: {e}")))?;
            if let Some(stdin) = child.stdin.as_mut() {
                writeln!(stdin, "{user}:{password}")
                    .map_err(|e| Error::Platform(format!("chpasswd: {e}")))?;
            }
            let status = child
                .wait()
                .map_err(|e| Error::Platform(format!("chpasswd: {e}")))?;
            if !status.success() {
                return Err(Error::Platform(format!("chpasswd exited with {status}")));
            }
        }
        Ok(())
    }

    fn add_to_group(&self, user: &str, group: &str) -> Result<()> {
        if cfg!(windows) {
            run("net", &["localgroup", group, user, "/add"])
        } else {
            run("usermod", &["-aG", group, user])
        }
    }

    fn boot_marker(&self) -> Result<String> {
        boot_identity()
    }

    fn halt_after_reboot(&self) {
        log::info!("Waiting for the host to go down");
        loop {
            thread::park();
        }
    }
}

/// Kernel-assigned id of the current boot
#[cfg(target_os = "linux")]
fn boot_identity() -> Result<String> {
    let path = "/proc/sys/kernel/random/boot_id";
    std::fs::read_to_string(path)
        .map(|id| id.trim().to_string())
        .map_err(|e| Error::Platform(format!("cannot read {path}: {e}")))
}

/// Exact boot timestamp from `kern.boottime`
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn boot_identity() -> Result<String> {
    crate::facts::boot_timeval()
        .map(|tv| format!("{}.{:06}", tv.tv_sec, tv.tv_usec))
        .ok_or_else(|| Error::Platform("sysctl kern.boottime failed".to_string()))
}

/// Boot counter Windows bumps on every start
#[cfg(windows)]
fn boot_identity() -> Result<String> {
    use std::ptr;
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{HKEY_LOCAL_MACHINE, RRF_RT_REG_DWORD, RegGetValueW};

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    let key = wide(
        r"SYSTEM\CurrentControlSet\Control\Session Manager\Memory Management\PrefetchParameters",
    );
    let value = wide("BootId");
    let mut boot_id: u32 = 0;
    let mut size = std::mem::size_of::<u32>() as u32;
    // SAFETY: both names are NUL-terminated and `size` matches the buffer.
    let rc = unsafe {
        RegGetValueW(
            HKEY_LOCAL_MACHINE,
            key.as_ptr(),
            value.as_ptr(),
            RRF_RT_REG_DWORD,
            ptr::null_mut(),
            (&raw mut boot_id).cast(),
            &raw mut size,
        )
    };
    if rc != ERROR_SUCCESS {
        return Err(Error::Platform(format!("cannot read BootId: error {rc}")));
    }
    Ok(boot_id.to_string())
}

/// No reliable boot identity; reboot-gated steps fail instead of resuming
/// on a guess
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    windows
)))]
fn boot_identity() -> Result<String> {
    Err(Error::Platform(format!(
        "boot identity is not available on {}",
        std::env::consts::OS
    )))
}
