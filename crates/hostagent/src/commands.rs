//! Task command executors.
//!
//! Argument shapes (all strings):
//!
//! | Command        | Args                                   |
//! |----------------|----------------------------------------|
//! | EXECUTE        | `[program, args...]`                   |
//! | DOWNLOAD       | `[url, path]`                          |
//! | EXTRACT        | `[archive, dest]`                      |
//! | DELETE         | `[path]`                               |
//! | CREATEUSER     | `[user]`                               |
//! | CREATEUSERPASS | `[user, password]`                     |
//! | ADDTOGROUP     | `[user, group]`                        |
//! | VALIDATE       | `[path, expected_hex, algorithm?]`     |
//! | CHANGEPERMS    | `[path, octal_mode, "recursive"?]`     |
//! | APPENDFILE     | `[path, content]`                      |
//! | DEFAULT        | ignored                                |

use crate::error::{Error, Result};
use crate::platform::Platform;
use plangraph::TaskCommand;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use taskwire::{FixedInterval, LogCallback, RetryPolicy, with_retry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn message(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs one task command on this host
pub trait StepRunner: Send + Sync {
    fn run(&self, command: TaskCommand, args: &[String]) -> Result<CommandOutput>;
}

/// Lets one command at a time through to the wrapped runner
///
/// Ad-hoc tasks and the local step loop share a host; each holds this lock
/// for the whole command.
pub struct SerialRunner {
    inner: Arc<dyn StepRunner>,
    gate: Mutex<()>,
}

impl SerialRunner {
    pub fn new(inner: Arc<dyn StepRunner>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

impl StepRunner for SerialRunner {
    fn run(&self, command: TaskCommand, args: &[String]) -> Result<CommandOutput> {
        let _held = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.run(command, args)
    }
}

pub struct CommandExecutor {
    platform: Arc<dyn Platform>,
    agent: ureq::Agent,
    download_retry: Box<dyn RetryPolicy>,
}

impl CommandExecutor {
    /// Downloads retry 5 times, 5 seconds apart
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            agent: ureq::Agent::new_with_defaults(),
            download_retry: Box::new(FixedInterval::default()),
        }
    }

    pub fn with_download_retry(mut self, policy: Box<dyn RetryPolicy>) -> Self {
        self.download_retry = policy;
        self
    }

    fn download(&self, url: &str, path: &Path) -> Result<CommandOutput> {
        let bytes = with_retry(self.download_retry.as_ref(), Some(&LogCallback), || {
            self.download_once(url, path)
        })?;
        Ok(CommandOutput::message(format!(
            "downloaded {bytes} bytes to {}",
            path.display()
        )))
    }

    fn download_once(&self, url: &str, path: &Path) -> Result<u64> {
        let mut response = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::StatusCode(code) => Error::Download {
                url: url.to_string(),
                message: format!("HTTP {code}"),
                status: Some(code),
            },
            other => Error::Download {
                url: url.to_string(),
                message: other.to_string(),
                status: None,
            },
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut reader = response.body_mut().as_reader();
        io::copy(&mut reader, &mut file).map_err(|e| Error::Download {
            url: url.to_string(),
            message: e.to_string(),
            status: None,
        })
    }
}

impl StepRunner for CommandExecutor {
    fn run(&self, command: TaskCommand, args: &[String]) -> Result<CommandOutput> {
        log::debug!("Running {} {:?}", command, args);
        match command {
            TaskCommand::Execute => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| Error::invalid_args("EXECUTE", "missing program"))?;
                execute(program, rest)
            }
            TaskCommand::Download => {
                let [url, path] = exact::<2>("DOWNLOAD", args)?;
                self.download(url, Path::new(path))
            }
            TaskCommand::Extract => {
                let [archive, dest] = exact::<2>("EXTRACT", args)?;
                extract(Path::new(archive), Path::new(dest))
            }
            TaskCommand::Delete => {
                let [path] = exact::<1>("DELETE", args)?;
                delete(Path::new(path))
            }
            TaskCommand::Reboot => {
                self.platform.reboot()?;
                Ok(CommandOutput::default())
            }
            TaskCommand::CreateUser => {
                let [user] = exact::<1>("CREATEUSER", args)?;
                self.platform.create_user(user, None)?;
                Ok(CommandOutput::message(format!("created user {user}")))
            }
            TaskCommand::CreateUserPass => {
                let [user, password] = exact::<2>("CREATEUSERPASS", args)?;
                self.platform.create_user(user, Some(password))?;
                Ok(CommandOutput::message(format!("created user {user}")))
            }
            TaskCommand::AddToGroup => {
                let [user, group] = exact::<2>("ADDTOGROUP", args)?;
                self.platform.add_to_group(user, group)?;
                Ok(CommandOutput::message(format!("added {user} to {group}")))
            }
            TaskCommand::Validate => validate(args),
            TaskCommand::ChangePerms => change_perms(args),
            TaskCommand::AppendFile => {
                let [path, content] = exact::<2>("APPENDFILE", args)?;
                append_file(Path::new(path), content)
            }
            TaskCommand::Default => Ok(CommandOutput::default()),
        }
    }
}

fn exact<'a, const N: usize>(command: &'static str, args: &'a [String]) -> Result<[&'a str; N]> {
    if args.len() != N {
        return Err(Error::invalid_args(
            command,
            format!("expected {N} arguments, got {}", args.len()),
        ));
    }
    Ok(std::array::from_fn(|i| args[i].as_str()))
}

fn execute(program: &str, args: &[String]) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::io(program, e))?;
    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if output.status.success() {
        Ok(result)
    } else {
        Err(Error::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            output: result.combined(),
        })
    }
}

/// Unpack `.tar.gz`, `.tgz`, `.tar` or `.zip` into `dest`
pub fn extract(archive: &Path, dest: &Path) -> Result<CommandOutput> {
    use flate2::read::GzDecoder;

    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    let file = File::open(archive).map_err(|e| Error::io(archive, e))?;

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| Error::Archive(format!("{}: {e}", archive.display())))?;
    } else if name.ends_with(".tar") {
        tar::Archive::new(file)
            .unpack(dest)
            .map_err(|e| Error::Archive(format!("{}: {e}", archive.display())))?;
    } else if name.ends_with(".zip") {
        zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| Error::Archive(format!("{}: {e}", archive.display())))?;
    } else {
        return Err(Error::Archive(format!(
            "unsupported archive format: {}",
            archive.display()
        )));
    }

    Ok(CommandOutput::message(format!(
        "extracted {} to {}",
        archive.display(),
        dest.display()
    )))
}

fn delete(path: &Path) -> Result<CommandOutput> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(CommandOutput::message(format!(
                "{} already absent",
                path.display()
            )));
        }
        Err(e) => return Err(Error::io(path, e)),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|e| Error::io(path, e))?;
    } else {
        fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    }
    Ok(CommandOutput::message(format!("deleted {}", path.display())))
}

/// Hex digest of a file; `sha256` (default) or `blake3`
pub fn file_digest(path: &Path, algorithm: &str) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" => {
            let mut hasher = Sha256::new();
            io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
            Ok(format!("{:x}", hasher.finalize()))
        }
        "blake3" => {
            let mut hasher = blake3::Hasher::new();
            io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
            Ok(hasher.finalize().to_hex().to_string())
        }
        other => Err(Error::invalid_args(
            "VALIDATE",
            format!("unknown hash algorithm {other}"),
        )),
    }
}

/// Fails when the file's digest does not match the expected value
fn validate(args: &[String]) -> Result<CommandOutput> {
    let (path, expected, algorithm) = match args {
        [path, expected] => (path, expected, "sha256"),
        [path, expected, algorithm] => (path, expected, algorithm.as_str()),
        _ => {
            return Err(Error::invalid_args(
                "VALIDATE",
                "expected [path, expected_hex, algorithm?]",
            ));
        }
    };
    let path = Path::new(path);
    let actual = file_digest(path, algorithm)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::HashMismatch {
            path: path.to_path_buf(),
            expected: expected.clone(),
            actual,
        });
    }
    Ok(CommandOutput::message(format!(
        "{} {algorithm} ok",
        path.display()
    )))
}

#[cfg(unix)]
fn change_perms(args: &[String]) -> Result<CommandOutput> {
    use std::os::unix::fs::PermissionsExt;

    let (path, mode, recursive) = match args {
        [path, mode] => (path, mode, false),
        [path, mode, flag] if flag == "recursive" => (path, mode, true),
        _ => {
            return Err(Error::invalid_args(
                "CHANGEPERMS",
                "expected [path, octal_mode, \"recursive\"?]",
            ));
        }
    };
    let mode = u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|_| Error::invalid_args("CHANGEPERMS", format!("invalid mode {mode}")))?;
    let root = Path::new(path);

    let set = |p: &Path| {
        fs::set_permissions(p, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(p, e))
    };

    let mut changed = 0usize;
    if recursive {
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.map_err(|e| Error::io(root, io::Error::other(e.to_string())))?;
            if entry.path_is_symlink() {
                continue;
            }
            set(entry.path())?;
            changed += 1;
        }
    } else {
        set(root)?;
        changed = 1;
    }
    Ok(CommandOutput::message(format!(
        "set mode {mode:o} on {changed} path(s)"
    )))
}

#[cfg(not(unix))]
fn change_perms(_args: &[String]) -> Result<CommandOutput> {
    Err(Error::Platform(
        "CHANGEPERMS is only supported on unix hosts".into(),
    ))
}

fn append_file(path: &Path, content: &str) -> Result<CommandOutput> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::io(path, e))?;
    Ok(CommandOutput::message(format!(
        "appended {} bytes to {}",
        content.len(),
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPlatform {
        calls: Mutex<Vec<String>>,
    }

    impl Platform for RecordingPlatform {
        fn reboot(&self) -> Result<()> {
            self.calls.lock().unwrap().push("reboot".into());
            Ok(())
        }

        fn create_user(&self, user: &str, password: Option<&str>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("user {user} {}", password.unwrap_or("-")));
            Ok(())
        }

        fn add_to_group(&self, user: &str, group: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("group {user} {group}"));
            Ok(())
        }

        fn boot_marker(&self) -> Result<String> {
            Ok("boot-1".into())
        }

        fn halt_after_reboot(&self) {}
    }

    fn executor() -> (CommandExecutor, Arc<RecordingPlatform>) {
        let platform = Arc::new(RecordingPlatform::default());
        let executor = CommandExecutor::new(platform.clone()).with_download_retry(Box::new(
            FixedInterval::new(Duration::from_millis(1), 2),
        ));
        (executor, platform)
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_captures_output() {
        let (executor, _) = executor();
        let out = executor
            .run(TaskCommand::Execute, &args(&["sh", "-c", "echo out; echo err >&2"]))
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_failure_keeps_output() {
        let (executor, _) = executor();
        let err = executor
            .run(TaskCommand::Execute, &args(&["sh", "-c", "echo partial; exit 3"]))
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(err.output(), "partial\n");
    }

    #[test]
    fn test_argument_count_is_checked() {
        let (executor, _) = executor();
        assert!(matches!(
            executor.run(TaskCommand::Execute, &[]),
            Err(Error::InvalidArgs { .. })
        ));
        assert!(matches!(
            executor.run(TaskCommand::Download, &args(&["http://x"])),
            Err(Error::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_extract_targz() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("bundle.tar.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            let data = b"payload";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "app/config.ini", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }
        fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let dest = temp.path().join("out");
        let (executor, _) = executor();
        executor
            .run(
                TaskCommand::Extract,
                &args(&[archive.to_str().unwrap(), dest.to_str().unwrap()]),
            )
            .unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("app/config.ini")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn test_extract_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("bundle.zip");
        let mut buffer = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("www/index.html", options).unwrap();
            zip.write_all(b"<h1>flag</h1>").unwrap();
            zip.finish().unwrap();
        }
        fs::write(&archive, &buffer).unwrap();

        let dest = temp.path().join("site");
        extract(&archive, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("www/index.html")).unwrap(),
            "<h1>flag</h1>"
        );
        assert!(extract(&temp.path().join("x.rar"), &dest).is_err());
    }

    #[test]
    fn test_validate_polarity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.bin");
        fs::write(&path, b"hello").unwrap();
        let p = path.to_str().unwrap();
        let sha = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

        let zeros = "0".repeat(64);
        let (executor, _) = executor();
        executor
            .run(TaskCommand::Validate, &args(&[p, sha]))
            .unwrap();
        let err = executor
            .run(TaskCommand::Validate, &args(&[p, zeros.as_str()]))
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));

        let b3 = blake3::hash(b"hello").to_hex().to_string();
        executor
            .run(TaskCommand::Validate, &args(&[p, b3.as_str(), "blake3"]))
            .unwrap();
    }

    #[test]
    fn test_delete_and_append() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("notes/motd");
        let (executor, _) = executor();
        let f = file.to_str().unwrap();

        executor
            .run(TaskCommand::AppendFile, &args(&[f, "line one\n"]))
            .unwrap();
        executor
            .run(TaskCommand::AppendFile, &args(&[f, "line two\n"]))
            .unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "line one\nline two\n");

        let dir = temp.path().join("notes");
        executor
            .run(TaskCommand::Delete, &args(&[dir.to_str().unwrap()]))
            .unwrap();
        assert!(!dir.exists());
        // already gone is fine
        executor
            .run(TaskCommand::Delete, &args(&[dir.to_str().unwrap()]))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_change_perms_recursive() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/a"), "a").unwrap();

        let (executor, _) = executor();
        executor
            .run(
                TaskCommand::ChangePerms,
                &args(&[root.to_str().unwrap(), "750", "recursive"]),
            )
            .unwrap();
        let mode = fs::metadata(root.join("sub/a")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert!(
            executor
                .run(TaskCommand::ChangePerms, &args(&[root.to_str().unwrap(), "9z"]))
                .is_err()
        );
    }

    #[test]
    fn test_account_commands_use_platform() {
        let (executor, platform) = executor();
        executor
            .run(TaskCommand::CreateUser, &args(&["blue"]))
            .unwrap();
        executor
            .run(TaskCommand::CreateUserPass, &args(&["red", "s3cret"]))
            .unwrap();
        executor
            .run(TaskCommand::AddToGroup, &args(&["red", "wheel"]))
            .unwrap();
        executor.run(TaskCommand::Default, &[]).unwrap();
        assert_eq!(
            *platform.calls.lock().unwrap(),
            vec!["user blue -", "user red s3cret", "group red wheel"]
        );
    }

    #[test]
    fn test_download_from_local_server() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            request
                .respond(tiny_http::Response::from_string("artifact"))
                .unwrap();
        });

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dl/artifact.bin");
        let url = format!("http://{addr}/artifact");
        let (executor, _) = executor();
        executor
            .run(
                TaskCommand::Download,
                &args(&[url.as_str(), path.to_str().unwrap()]),
            )
            .unwrap();
        handle.join().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "artifact");
    }

    #[derive(Default)]
    struct OverlapRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StepRunner for OverlapRunner {
        fn run(&self, _command: TaskCommand, _args: &[String]) -> Result<CommandOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput::default())
        }
    }

    #[test]
    fn test_serial_runner_never_overlaps_commands() {
        let inner = Arc::new(OverlapRunner::default());
        let serial = Arc::new(SerialRunner::new(inner.clone()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let serial = Arc::clone(&serial);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        serial.run(TaskCommand::Default, &[]).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(inner.peak.load(Ordering::SeqCst), 1);
    }
}
