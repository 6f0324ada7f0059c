//! Fan one command out to every team
//!
//! Each team gets a bound [`TeamWorker`]. [`Spanner::run`] starts all of them
//! on a pool with one thread per team and collects exactly one
//! [`SpanResult`] per team from a shared channel; a failing team never stops
//! the others.

use crate::error::{Error, Result};
use crate::target::{SpanMode, Target, resolve_remote, team_dir};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanConfig {
    /// Directory holding `team-<n>` directories
    pub base_dir: PathBuf,
    /// Per-team output logs; defaults to `<base_dir>/span-logs`
    pub log_dir: Option<PathBuf>,
    /// Teams are numbered 1..=teams
    pub teams: u32,
    pub mode: SpanMode,
}

/// Outcome of the command for one team
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanResult {
    pub team: u32,
    pub target: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the command could not be run at all
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl SpanResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Called once per team as results arrive
pub trait SpanProgress {
    fn on_result(&self, result: &SpanResult);
}

/// One team's bound worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamWorker {
    pub team: u32,
    pub team_dir: PathBuf,
    pub target: Target,
}

impl TeamWorker {
    fn run(&self, command: &str, log_dir: &Path) -> SpanResult {
        let started = Instant::now();
        let mut result = SpanResult {
            team: self.team,
            target: self.target.describe(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            elapsed: Duration::ZERO,
        };
        if let Err(e) = self.execute(command, log_dir, &mut result) {
            log::warn!("Team {}: {e}", self.team);
            result.error = Some(e.to_string());
        }
        result.elapsed = started.elapsed();
        result
    }

    fn execute(&self, command: &str, log_dir: &Path, result: &mut SpanResult) -> Result<()> {
        let stdout_log = log_dir.join(format!("team-{}.stdout.log", self.team));
        let stderr_log = log_dir.join(format!("team-{}.stderr.log", self.team));
        let stdout_file = File::create(&stdout_log).map_err(|e| Error::io(&stdout_log, e))?;
        let stderr_file = File::create(&stderr_log).map_err(|e| Error::io(&stderr_log, e))?;

        let mut child = self
            .target
            .command(command, &self.team_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&self.team_dir, e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (out, err) = thread::scope(|scope| {
            let out = scope.spawn(|| tee(stdout, stdout_file));
            let err = scope.spawn(|| tee(stderr, stderr_file));
            (join_tee(out), join_tee(err))
        });
        let status = child.wait().map_err(|e| Error::io(&self.team_dir, e))?;

        result.stdout = String::from_utf8_lossy(&out.map_err(|e| Error::io(&stdout_log, e))?)
            .into_owned();
        result.stderr = String::from_utf8_lossy(&err.map_err(|e| Error::io(&stderr_log, e))?)
            .into_owned();
        result.exit_code = status.code();
        Ok(())
    }
}

/// Copy a pipe to its log file, keeping a copy in memory
fn tee(source: Option<impl Read>, mut file: File) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let Some(mut source) = source else {
        return Ok(buffer);
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n])?;
        buffer.extend_from_slice(&chunk[..n]);
    }
    file.flush()?;
    Ok(buffer)
}

fn join_tee(handle: thread::ScopedJoinHandle<'_, io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")))
}

pub struct Spanner {
    workers: Vec<TeamWorker>,
    log_dir: PathBuf,
}

impl Spanner {
    /// Bind one worker per team.
    ///
    /// Remote mode resolves every team's host up front and fails on the first
    /// one that is not active.
    pub fn new(config: &SpanConfig) -> Result<Self> {
        if config.teams == 0 {
            return Err(Error::NoTeams);
        }
        let log_dir = config
            .log_dir
            .clone()
            .unwrap_or_else(|| config.base_dir.join("span-logs"));
        fs::create_dir_all(&log_dir).map_err(|e| Error::io(&log_dir, e))?;

        let workers = (1..=config.teams)
            .map(|team| {
                let dir = team_dir(&config.base_dir, team);
                let target = match &config.mode {
                    SpanMode::Local => {
                        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
                        Target::Local
                    }
                    SpanMode::Remote { hostname } => resolve_remote(team, &dir, hostname)?,
                };
                Ok(TeamWorker {
                    team,
                    team_dir: dir,
                    target,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Bound {} team workers", workers.len());
        Ok(Self { workers, log_dir })
    }

    pub fn workers(&self) -> &[TeamWorker] {
        &self.workers
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run `command` for every team; results are ordered by team number
    pub fn run(&self, command: &str, progress: Option<&dyn SpanProgress>) -> Result<Vec<SpanResult>> {
        let count = self.workers.len();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|i| format!("span-{}", i + 1))
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let mut results = Vec::with_capacity(count);
        thread::scope(|scope| {
            scope.spawn(|| {
                pool.scope(|pool_scope| {
                    for worker in &self.workers {
                        let tx = tx.clone();
                        pool_scope.spawn(move |_| {
                            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                                worker.run(command, &self.log_dir)
                            }))
                            .unwrap_or_else(|_| SpanResult {
                                team: worker.team,
                                target: worker.target.describe(),
                                exit_code: None,
                                stdout: String::new(),
                                stderr: String::new(),
                                error: Some("worker panicked".to_string()),
                                elapsed: Duration::ZERO,
                            });
                            let _ = tx.send(result);
                        });
                    }
                });
            });

            // Every worker sends exactly once
            for _ in 0..count {
                let Ok(result) = rx.recv() else {
                    break;
                };
                if let Some(progress) = progress {
                    progress.on_result(&result);
                }
                results.push(result);
            }
        });

        results.sort_by_key(|r| r.team);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<u32>>);

    impl SpanProgress for Recorder {
        fn on_result(&self, result: &SpanResult) {
            self.0.lock().unwrap().push(result.team);
        }
    }

    fn local(temp: &TempDir, teams: u32) -> Spanner {
        Spanner::new(&SpanConfig {
            base_dir: temp.path().to_path_buf(),
            log_dir: None,
            teams,
            mode: SpanMode::Local,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_teams_is_rejected() {
        let temp = TempDir::new().unwrap();
        let result = Spanner::new(&SpanConfig {
            base_dir: temp.path().to_path_buf(),
            log_dir: None,
            teams: 0,
            mode: SpanMode::Local,
        });
        assert!(matches!(result, Err(Error::NoTeams)));
    }

    #[test]
    fn test_local_workers_bind_team_dirs() {
        let temp = TempDir::new().unwrap();
        let spanner = local(&temp, 3);
        let dirs: Vec<_> = spanner.workers().iter().map(|w| w.team_dir.clone()).collect();
        assert_eq!(dirs[2], temp.path().join("team-3"));
        assert!(dirs.iter().all(|d| d.is_dir()));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_in_each_team_dir() {
        let temp = TempDir::new().unwrap();
        let spanner = local(&temp, 3);
        let results = spanner.run("basename \"$PWD\"", None).unwrap();

        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            let team = i as u32 + 1;
            assert_eq!(result.team, team);
            assert!(result.success());
            assert_eq!(result.stdout.trim(), format!("team-{team}"));
        }
        let log = spanner.log_dir().join("team-2.stdout.log");
        assert_eq!(fs::read_to_string(log).unwrap().trim(), "team-2");
    }

    #[cfg(unix)]
    #[test]
    fn test_one_failure_does_not_stop_others() {
        let temp = TempDir::new().unwrap();
        let spanner = local(&temp, 4);
        let recorder = Recorder(Mutex::new(Vec::new()));
        let command = "if [ \"$(basename \"$PWD\")\" = team-2 ]; then echo broken >&2; exit 3; fi; sleep 0.1; echo ok";
        let results = spanner.run(command, Some(&recorder)).unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(recorder.0.lock().unwrap().len(), 4);
        let failed: Vec<_> = results.iter().filter(|r| !r.success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].team, 2);
        assert_eq!(failed[0].exit_code, Some(3));
        assert_eq!(failed[0].stderr.trim(), "broken");
        let stderr_log = spanner.log_dir().join("team-2.stderr.log");
        assert_eq!(fs::read_to_string(stderr_log).unwrap().trim(), "broken");
        assert!(results.iter().filter(|r| r.success()).all(|r| r.stdout.trim() == "ok"));
    }

    #[test]
    fn test_remote_mode_fails_fast_without_snapshot() {
        let temp = TempDir::new().unwrap();
        let result = Spanner::new(&SpanConfig {
            base_dir: temp.path().to_path_buf(),
            log_dir: Some(temp.path().join("logs")),
            teams: 2,
            mode: SpanMode::Remote {
                hostname: "dc".into(),
            },
        });
        assert!(matches!(result, Err(Error::Snapshot { team: 1, .. })));
    }
}
