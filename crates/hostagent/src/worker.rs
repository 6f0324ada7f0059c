//! Local step worker
//!
//! One dedicated thread owns the host's step sequence. Configuration arrives
//! through [`Worker::load`], a single-slot mailbox answered with a typed
//! reply; the thread only reads the mailbox between steps and while waiting
//! for a reboot, so no two steps ever run at once and a revision conflict
//! never interrupts a running step.
//!
//! Progress is written back to the state file after every transition. After
//! a reboot (or a daemon restart) loading the same file resumes at the first
//! pending step.

use crate::commands::{CommandOutput, StepRunner};
use crate::error::{Error, LoadError};
use crate::platform::Platform;
use crate::shutdown::Shutdown;
use crate::statefile::{BuildStatus, HostState, PendingReboot, StepStatus};
use chrono::{DateTime, Utc};
use plangraph::{ProvisioningStepId, TaskCommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

/// Which revisions above the current one a `Load` may jump to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionPolicy {
    /// Only current + 1
    #[default]
    Sequential,
    /// Any revision above the current one
    AnyHigher,
}

impl RevisionPolicy {
    /// Decide whether `requested` may replace `current`
    pub fn check(&self, current: Option<u64>, requested: u64) -> Result<(), LoadError> {
        let Some(current) = current else {
            return if requested >= 1 {
                Ok(())
            } else {
                Err(LoadError::StaleRevision {
                    current: 0,
                    requested,
                })
            };
        };

        if requested == current {
            Err(LoadError::DuplicateRevision { revision: requested })
        } else if requested < current {
            Err(LoadError::StaleRevision { current, requested })
        } else if requested == current + 1 || *self == Self::AnyHigher {
            Ok(())
        } else {
            Err(LoadError::RevisionMismatch { current, requested })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimings {
    /// How long `load` waits for the worker to answer
    pub load_timeout: Duration,
    /// Sleep between checks while a reboot is pending
    pub reboot_cooldown: Duration,
    /// Pause after each step
    pub step_rest: Duration,
    /// Liveness stamp interval
    pub liveness_tick: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        let cooldown = if cfg!(windows) { 5 } else { 3 };
        Self {
            load_timeout: Duration::from_secs(5),
            reboot_cooldown: Duration::from_secs(cooldown),
            step_rest: Duration::from_secs(1),
            liveness_tick: Duration::from_secs(1),
        }
    }
}

/// Next actionable condition of a loaded sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    AwaitingReboot,
    /// Index of the next pending step
    Ready(usize),
    Finished,
    /// A step failed
    Halted,
}

/// Derive the next condition, repairing leftovers of an interrupted run.
///
/// `boot_marker` is the current boot's marker, or `None` if it could not be
/// read. Returns whether `state` was modified.
pub fn normalize(state: &mut HostState, boot_marker: Option<&str>) -> (Next, bool) {
    let mut dirty = false;

    if let Some(pending) = &state.pending_reboot {
        match boot_marker {
            Some(marker) if marker != pending.boot_marker => {
                log::info!("Reboot after step {} observed", pending.step);
                state.pending_reboot = None;
                dirty = true;
            }
            _ => return (Next::AwaitingReboot, dirty),
        }
    }

    // A step left running without a pending reboot was cut short
    for step in state.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
        log::warn!("Step {} was interrupted, running it again", step.step_number);
        step.status = StepStatus::Pending;
        step.started_at = None;
        dirty = true;
    }

    if state.steps.iter().any(|s| s.status == StepStatus::Failed) {
        return (Next::Halted, dirty);
    }
    let next = state
        .steps
        .iter()
        .position(|s| s.status == StepStatus::Pending)
        .map_or(Next::Finished, Next::Ready);
    (next, dirty)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Running,
    AwaitingReboot,
    Finished,
    Failed,
    Stopped,
}

/// What the worker is doing, shared with the diagnostics server
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub phase: WorkerPhase,
    pub revision: Option<u64>,
    pub current_step: Option<ProvisioningStepId>,
    pub state: Option<HostState>,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkerSnapshot {
    fn default() -> Self {
        Self {
            phase: WorkerPhase::Idle,
            revision: None,
            current_step: None,
            state: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Log file of one step's output stream
pub fn step_log_path(log_dir: &Path, step: ProvisioningStepId, stream: LogStream) -> PathBuf {
    log_dir.join(format!("{step}.{}.log", stream.as_str()))
}

struct LoadRequest {
    path: PathBuf,
    reply: mpsc::Sender<Result<u64, LoadError>>,
    /// Set by the caller once it stops waiting; the worker checks it and
    /// sends the verdict under the same lock
    abandoned: Arc<Mutex<bool>>,
}

/// Clears the in-flight flag when `load` returns
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to the worker thread
pub struct Worker {
    mailbox: SyncSender<LoadRequest>,
    in_flight: AtomicBool,
    timings: WorkerTimings,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    liveness: Arc<AtomicI64>,
    log_dir: PathBuf,
    shutdown: Shutdown,
}

impl Worker {
    /// Start the processing and liveness threads
    pub fn spawn(
        runner: Arc<dyn StepRunner>,
        platform: Arc<dyn Platform>,
        timings: WorkerTimings,
        policy: RevisionPolicy,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        let (mailbox, requests) = mpsc::sync_channel(1);
        let snapshot = Arc::new(RwLock::new(WorkerSnapshot::default()));
        let liveness = Arc::new(AtomicI64::new(Utc::now().timestamp()));
        let shutdown = Shutdown::new();
        let log_dir = log_dir.into();

        let ticker = {
            let liveness = Arc::clone(&liveness);
            let shutdown = shutdown.clone();
            move || {
                loop {
                    liveness.store(Utc::now().timestamp(), Ordering::Relaxed);
                    if shutdown.wait(timings.liveness_tick) {
                        break;
                    }
                }
            }
        };
        thread::spawn(ticker);

        let mut worker_loop = WorkerLoop {
            runner,
            platform,
            timings,
            policy,
            log_dir: log_dir.clone(),
            requests,
            snapshot: Arc::clone(&snapshot),
            shutdown: shutdown.clone(),
            loaded: None,
        };
        thread::spawn(move || worker_loop.run());

        Self {
            mailbox,
            in_flight: AtomicBool::new(false),
            timings,
            snapshot,
            liveness,
            log_dir,
            shutdown,
        }
    }

    /// Hand a state file to the worker and wait for its verdict.
    ///
    /// Returns the accepted revision. A second caller arriving while a request
    /// is in flight gets [`LoadError::WorkerBusy`] immediately.
    pub fn load(&self, path: &Path) -> Result<u64, LoadError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(LoadError::WorkerBusy);
        }
        let _guard = InFlight(&self.in_flight);

        let (reply, verdict) = mpsc::channel();
        let abandoned = Arc::new(Mutex::new(false));
        let request = LoadRequest {
            path: path.to_path_buf(),
            reply,
            abandoned: Arc::clone(&abandoned),
        };
        match self.mailbox.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(LoadError::WorkerBusy),
            Err(TrySendError::Disconnected(_)) => return Err(LoadError::WorkerStopped),
        }

        match verdict.recv_timeout(self.timings.load_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut abandoned = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
                *abandoned = true;
                // A verdict sent before the flag was set still stands
                verdict.try_recv().unwrap_or(Err(LoadError::LoadTimedOut))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LoadError::WorkerStopped),
        }
    }

    /// True while a `load` call is waiting for an answer
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shared_snapshot(&self) -> Arc<RwLock<WorkerSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Unix time of the last liveness tick
    pub fn last_alive(&self) -> i64 {
        self.liveness.load(Ordering::Relaxed)
    }

    pub fn liveness(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.liveness)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Stop after the current step
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

struct Loaded {
    path: PathBuf,
    state: HostState,
    done: bool,
}

struct WorkerLoop {
    runner: Arc<dyn StepRunner>,
    platform: Arc<dyn Platform>,
    timings: WorkerTimings,
    policy: RevisionPolicy,
    log_dir: PathBuf,
    requests: Receiver<LoadRequest>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    shutdown: Shutdown,
    loaded: Option<Loaded>,
}

impl WorkerLoop {
    fn run(&mut self) {
        if let Err(e) = self.process() {
            log::error!("Worker stopped: {e}");
        }
        self.publish(WorkerPhase::Stopped, None);
    }

    fn process(&mut self) -> Result<(), Error> {
        while !self.shutdown.is_triggered() {
            let active = self.loaded.as_ref().is_some_and(|l| !l.done);
            if !active {
                if !self.wait(self.timings.liveness_tick) {
                    return Ok(());
                }
                continue;
            }

            // Requests that arrived during the last step
            while let Ok(request) = self.requests.try_recv() {
                self.answer(request);
            }

            match self.normalize()? {
                Next::AwaitingReboot => {
                    self.publish(WorkerPhase::AwaitingReboot, None);
                    if !self.wait(self.timings.reboot_cooldown) {
                        return Ok(());
                    }
                }
                Next::Ready(index) => {
                    self.do_next_step(index)?;
                    if !self.wait(self.timings.step_rest) {
                        return Ok(());
                    }
                }
                Next::Finished => self.finalize(BuildStatus::Complete)?,
                Next::Halted => self.finalize(BuildStatus::Failed)?,
            }
        }
        Ok(())
    }

    /// Sleep up to `timeout`, answering a load request if one arrives.
    /// Returns false once the handle is gone.
    fn wait(&mut self, timeout: Duration) -> bool {
        match self.requests.recv_timeout(timeout) {
            Ok(request) => {
                self.answer(request);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Validate a request and commit it only if the caller takes the answer
    fn answer(&mut self, request: LoadRequest) {
        let LoadRequest {
            path,
            reply,
            abandoned,
        } = request;
        let checked = self.check(&path);

        let abandoned = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
        if *abandoned {
            log::warn!("Dropping load of {}: caller stopped waiting", path.display());
            return;
        }
        let verdict = checked.as_ref().map(|state| state.build.revision).map_err(Clone::clone);
        let delivered = reply.send(verdict).is_ok();
        drop(abandoned);

        match checked {
            Ok(state) if delivered => {
                log::info!("Loaded revision {} from {}", state.build.revision, path.display());
                self.loaded = Some(Loaded {
                    path,
                    state,
                    done: false,
                });
                self.publish(WorkerPhase::Running, None);
            }
            Ok(_) => log::warn!("Dropping load of {}: caller is gone", path.display()),
            Err(e) => log::warn!("Rejected {}: {e}", path.display()),
        }
    }

    fn check(&self, path: &Path) -> Result<HostState, LoadError> {
        let state = HostState::load(path).map_err(|e| LoadError::InvalidState(e.to_string()))?;
        let current = self.loaded.as_ref().map(|l| l.state.build.revision);
        self.policy.check(current, state.build.revision)?;
        Ok(state)
    }

    fn normalize(&mut self) -> Result<Next, Error> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(Next::Finished);
        };
        let marker = if loaded.state.pending_reboot.is_some() {
            self.platform
                .boot_marker()
                .map_err(|e| log::warn!("Cannot read boot marker: {e}"))
                .ok()
        } else {
            None
        };
        let (next, dirty) = normalize(&mut loaded.state, marker.as_deref());
        if dirty {
            loaded.state.save(&loaded.path)?;
        }
        Ok(next)
    }

    fn do_next_step(&mut self, index: usize) -> Result<(), Error> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(());
        };
        let now = Utc::now();
        let step = &mut loaded.state.steps[index];
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        let (id, number, command, args) = (
            step.id,
            step.step_number,
            step.command,
            step.args.clone(),
        );
        let needs_reboot = step.needs_reboot();
        let build = &mut loaded.state.build;
        build.status = BuildStatus::Running;
        build.started_at.get_or_insert(now);
        loaded.state.save(&loaded.path)?;
        self.publish(WorkerPhase::Running, Some(id));

        log::info!("Running step {number} ({command})");
        let outcome = if command == TaskCommand::Reboot {
            Ok(CommandOutput::default())
        } else {
            self.runner.run(command, &args)
        };
        self.write_logs(id, &outcome);

        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(());
        };
        let step = &mut loaded.state.steps[index];
        step.ended_at = Some(Utc::now());
        let mut reboot = false;
        match outcome {
            Ok(_) if needs_reboot => match self.platform.boot_marker() {
                Ok(boot_marker) => {
                    step.status = StepStatus::Complete;
                    loaded.state.pending_reboot = Some(PendingReboot {
                        boot_marker,
                        step: id,
                        requested_at: Utc::now(),
                    });
                    reboot = true;
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(e.to_string());
                }
            },
            Ok(_) => step.status = StepStatus::Complete,
            Err(e) => {
                log::warn!("Step {number} failed: {e}");
                step.status = StepStatus::Failed;
                step.error = Some(e.to_string());
            }
        }
        loaded.state.save(&loaded.path)?;

        if reboot && let Err(e) = self.platform.reboot() {
            log::error!("Reboot after step {number} failed: {e}");
            loaded.state.pending_reboot = None;
            let step = &mut loaded.state.steps[index];
            step.status = StepStatus::Failed;
            step.error = Some(e.to_string());
            loaded.state.save(&loaded.path)?;
        }
        self.publish(WorkerPhase::Running, None);
        Ok(())
    }

    fn write_logs(&self, step: ProvisioningStepId, outcome: &Result<CommandOutput, Error>) {
        let (stdout, stderr) = match outcome {
            Ok(output) => (output.stdout.clone(), output.stderr.clone()),
            Err(e) => (String::new(), format!("{}\n{e}\n", e.output())),
        };
        if let Err(e) = fs::create_dir_all(&self.log_dir) {
            log::warn!("Cannot create {}: {e}", self.log_dir.display());
            return;
        }
        for (stream, content) in [(LogStream::Stdout, stdout), (LogStream::Stderr, stderr)] {
            let path = step_log_path(&self.log_dir, step, stream);
            if let Err(e) = fs::write(&path, content) {
                log::warn!("Cannot write {}: {e}", path.display());
            }
        }
    }

    fn finalize(&mut self, status: BuildStatus) -> Result<(), Error> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(());
        };
        if loaded.state.build.status != status {
            loaded.state.build.status = status;
            loaded.state.build.ended_at = Some(Utc::now());
            if status == BuildStatus::Failed {
                loaded.state.build.error = loaded
                    .state
                    .steps
                    .iter()
                    .find_map(|s| s.error.clone());
            }
            loaded.state.save(&loaded.path)?;
        }
        loaded.done = true;
        log::info!(
            "Revision {} finished: {:?}",
            loaded.state.build.revision,
            status
        );
        let phase = match status {
            BuildStatus::Failed => WorkerPhase::Failed,
            _ => WorkerPhase::Finished,
        };
        self.publish(phase, None);
        Ok(())
    }

    fn publish(&self, phase: WorkerPhase, current_step: Option<ProvisioningStepId>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.phase = phase;
        snapshot.current_step = current_step;
        snapshot.revision = self.loaded.as_ref().map(|l| l.state.build.revision);
        snapshot.state = self.loaded.as_ref().map(|l| l.state.clone());
        snapshot.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use plangraph::{BuildState, ProvisionedHostId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Boot marker only changes when the test says the host came back up
    #[derive(Default)]
    struct FakePlatform {
        boot: AtomicUsize,
        reboots: AtomicUsize,
    }

    impl FakePlatform {
        fn come_back_up(&self) {
            self.boot.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Platform for FakePlatform {
        fn reboot(&self) -> Result<()> {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn create_user(&self, _user: &str, _password: Option<&str>) -> Result<()> {
            Ok(())
        }

        fn add_to_group(&self, _user: &str, _group: &str) -> Result<()> {
            Ok(())
        }

        fn boot_marker(&self) -> Result<String> {
            Ok(format!("boot-{}", self.boot.load(Ordering::SeqCst)))
        }

        fn halt_after_reboot(&self) {}
    }

    /// Records each run; args containing "fail" fail, "block" waits for the gate
    #[derive(Default)]
    struct FakeRunner {
        runs: Mutex<Vec<String>>,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl FakeRunner {
        fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl StepRunner for FakeRunner {
        fn run(&self, _command: TaskCommand, args: &[String]) -> Result<CommandOutput> {
            let line = args.join(" ");
            if line.contains("block")
                && let Some(gate) = self.gate.lock().unwrap().take()
            {
                let _ = gate.recv();
            }
            self.runs.lock().unwrap().push(line.clone());
            if line.contains("fail") {
                return Err(Error::CommandFailed {
                    program: "fake".into(),
                    status: "exit status: 1".into(),
                    output: "it broke".into(),
                });
            }
            Ok(CommandOutput {
                stdout: line,
                stderr: String::new(),
            })
        }
    }

    fn fast() -> WorkerTimings {
        WorkerTimings {
            load_timeout: Duration::from_secs(2),
            reboot_cooldown: Duration::from_millis(20),
            step_rest: Duration::from_millis(1),
            liveness_tick: Duration::from_millis(10),
        }
    }

    fn wait_for(worker: &Worker, phase: WorkerPhase) -> WorkerSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = worker.snapshot();
            if snapshot.phase == phase {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "stuck in {:?}", snapshot.phase);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Writes a state file with one EXECUTE step per entry
    fn write_state(
        dir: &Path,
        revision: u64,
        steps: &[(&str, bool)],
    ) -> (PathBuf, HostState) {
        let mut build = BuildState::new("range", "quals");
        let team = build.add_team(1);
        let net = build.add_network(team, "lan", "10.1.0.0/24").unwrap();
        let host = build.add_host(net, "dc").unwrap();
        for (arg, reboot_after) in steps {
            let id = build
                .add_step(host, TaskCommand::Execute, vec![(*arg).to_string()])
                .unwrap();
            build.steps.get_mut(&id).unwrap().reboot_after = *reboot_after;
        }
        build.build.revision = revision;
        let state = HostState::from_build(&build, host).unwrap();
        let path = dir.join(format!("state-{revision}.json"));
        state.save(&path).unwrap();
        (path, state)
    }

    fn spawn(
        temp: &TempDir,
        runner: &Arc<FakeRunner>,
        platform: &Arc<FakePlatform>,
        policy: RevisionPolicy,
    ) -> Worker {
        Worker::spawn(
            runner.clone(),
            platform.clone(),
            fast(),
            policy,
            temp.path().join("logs"),
        )
    }

    #[test]
    fn test_revision_rules_sequential() {
        let policy = RevisionPolicy::Sequential;
        assert_eq!(policy.check(None, 1), Ok(()));
        assert_eq!(policy.check(None, 7), Ok(()));
        assert!(matches!(
            policy.check(None, 0),
            Err(LoadError::StaleRevision { .. })
        ));
        assert_eq!(
            policy.check(Some(3), 3),
            Err(LoadError::DuplicateRevision { revision: 3 })
        );
        assert_eq!(
            policy.check(Some(3), 2),
            Err(LoadError::StaleRevision {
                current: 3,
                requested: 2
            })
        );
        assert_eq!(policy.check(Some(3), 4), Ok(()));
        assert_eq!(
            policy.check(Some(3), 5),
            Err(LoadError::RevisionMismatch {
                current: 3,
                requested: 5
            })
        );
    }

    #[test]
    fn test_revision_rules_any_higher() {
        let policy = RevisionPolicy::AnyHigher;
        assert_eq!(policy.check(Some(3), 4), Ok(()));
        assert_eq!(policy.check(Some(3), 9), Ok(()));
        assert!(matches!(
            policy.check(Some(3), 3),
            Err(LoadError::DuplicateRevision { .. })
        ));
        assert!(matches!(
            policy.check(Some(3), 1),
            Err(LoadError::StaleRevision { .. })
        ));
    }

    #[test]
    fn test_load_rejections_reach_the_caller() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::Sequential);

        let (first, _) = write_state(temp.path(), 1, &[("one", false)]);
        let (third, _) = write_state(temp.path(), 3, &[("three", false)]);
        let (second, _) = write_state(temp.path(), 2, &[("two", false)]);

        assert_eq!(worker.load(&first), Ok(1));
        wait_for(&worker, WorkerPhase::Finished);
        assert_eq!(
            worker.load(&first),
            Err(LoadError::DuplicateRevision { revision: 1 })
        );
        assert_eq!(
            worker.load(&third),
            Err(LoadError::RevisionMismatch {
                current: 1,
                requested: 3
            })
        );
        assert_eq!(worker.load(&second), Ok(2));
        wait_for(&worker, WorkerPhase::Finished);
        assert_eq!(
            worker.load(&first),
            Err(LoadError::StaleRevision {
                current: 2,
                requested: 1
            })
        );
        assert_eq!(runner.runs(), vec!["one", "two"]);
        assert!(matches!(
            worker.load(&temp.path().join("missing.json")),
            Err(LoadError::InvalidState(_))
        ));
    }

    #[test]
    fn test_any_higher_skips_ahead() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::AnyHigher);

        let (first, _) = write_state(temp.path(), 1, &[]);
        let (fifth, _) = write_state(temp.path(), 5, &[]);
        assert_eq!(worker.load(&first), Ok(1));
        assert_eq!(worker.load(&fifth), Ok(5));
    }

    #[test]
    fn test_concurrent_load_is_busy() {
        let temp = TempDir::new().unwrap();
        let (release, gate) = mpsc::channel();
        let runner = Arc::new(FakeRunner {
            gate: Mutex::new(Some(gate)),
            ..FakeRunner::default()
        });
        let platform = Arc::new(FakePlatform::default());
        let worker = Arc::new(spawn(&temp, &runner, &platform, RevisionPolicy::Sequential));

        let (first, _) = write_state(temp.path(), 1, &[("block", false)]);
        let (second, _) = write_state(temp.path(), 2, &[("next", false)]);
        assert_eq!(worker.load(&first), Ok(1));

        // The worker is stuck inside the step, so this load waits
        let waiting = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || worker.load(&second))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_busy() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        assert_eq!(worker.load(&first), Err(LoadError::WorkerBusy));
        assert!(started.elapsed() < Duration::from_millis(500));

        release.send(()).unwrap();
        assert_eq!(waiting.join().unwrap(), Ok(2));
    }

    #[test]
    fn test_load_times_out_during_long_step() {
        let temp = TempDir::new().unwrap();
        let (release, gate) = mpsc::channel();
        let runner = Arc::new(FakeRunner {
            gate: Mutex::new(Some(gate)),
            ..FakeRunner::default()
        });
        let platform = Arc::new(FakePlatform::default());
        let worker = Worker::spawn(
            runner.clone(),
            platform,
            WorkerTimings {
                load_timeout: Duration::from_millis(50),
                ..fast()
            },
            RevisionPolicy::Sequential,
            temp.path().join("logs"),
        );

        let (first, _) = write_state(temp.path(), 1, &[("block", false)]);
        let (second, _) = write_state(temp.path(), 2, &[]);
        assert_eq!(worker.load(&first), Ok(1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(worker.load(&second), Err(LoadError::LoadTimedOut));
        release.send(()).unwrap();

        // The abandoned request is dropped, not applied
        let snapshot = wait_for(&worker, WorkerPhase::Finished);
        assert_eq!(snapshot.revision, Some(1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(worker.snapshot().revision, Some(1));
        assert_eq!(runner.runs(), vec!["block"]);
        assert_eq!(worker.load(&second), Ok(2));
    }

    #[test]
    fn test_reboot_resumes_at_next_step() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::Sequential);

        let (path, state) = write_state(temp.path(), 1, &[("zero", true), ("one", false)]);
        assert_eq!(worker.load(&path), Ok(1));

        wait_for(&worker, WorkerPhase::AwaitingReboot);
        assert_eq!(platform.reboots.load(Ordering::SeqCst), 1);
        // Several cooldowns pass without consuming a step
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runner.runs(), vec!["zero"]);
        let on_disk = HostState::load(&path).unwrap();
        assert_eq!(on_disk.steps[0].status, StepStatus::Complete);
        assert_eq!(on_disk.steps[1].status, StepStatus::Pending);
        assert_eq!(
            on_disk.pending_reboot.as_ref().map(|p| p.boot_marker.as_str()),
            Some("boot-0")
        );

        platform.come_back_up();
        wait_for(&worker, WorkerPhase::Finished);
        assert_eq!(runner.runs(), vec!["zero", "one"]);

        let on_disk = HostState::load(&path).unwrap();
        assert!(on_disk.pending_reboot.is_none());
        assert_eq!(on_disk.build.status, BuildStatus::Complete);
        assert_eq!(on_disk.count(StepStatus::Complete), 2);

        let log = step_log_path(worker.log_dir(), state.steps[1].id, LogStream::Stdout);
        assert_eq!(fs::read_to_string(log).unwrap(), "one");
    }

    #[test]
    fn test_restarted_worker_resumes_from_state_file() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        platform.come_back_up();

        let (path, mut state) = write_state(temp.path(), 1, &[("zero", true), ("one", false)]);
        state.steps[0].status = StepStatus::Complete;
        state.pending_reboot = Some(PendingReboot {
            boot_marker: "boot-0".into(),
            step: state.steps[0].id,
            requested_at: Utc::now(),
        });
        state.save(&path).unwrap();

        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::Sequential);
        assert_eq!(worker.load(&path), Ok(1));
        wait_for(&worker, WorkerPhase::Finished);
        assert_eq!(runner.runs(), vec!["one"]);
    }

    #[test]
    fn test_failed_step_halts_sequence() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::Sequential);

        let (path, state) = write_state(temp.path(), 1, &[("fail", false), ("never", false)]);
        assert_eq!(worker.load(&path), Ok(1));
        let snapshot = wait_for(&worker, WorkerPhase::Failed);
        assert_eq!(snapshot.revision, Some(1));
        assert_eq!(runner.runs(), vec!["fail"]);

        let on_disk = HostState::load(&path).unwrap();
        assert_eq!(on_disk.steps[0].status, StepStatus::Failed);
        assert_eq!(on_disk.steps[1].status, StepStatus::Pending);
        assert_eq!(on_disk.build.status, BuildStatus::Failed);
        assert!(on_disk.build.error.is_some());

        let log = step_log_path(worker.log_dir(), state.steps[0].id, LogStream::Stderr);
        assert!(fs::read_to_string(log).unwrap().contains("it broke"));
    }

    #[test]
    fn test_normalize_repairs_interrupted_step() {
        let mut build = BuildState::new("e", "c");
        let team = build.add_team(1);
        let net = build.add_network(team, "n", "10.0.0.0/24").unwrap();
        let host = build.add_host(net, "h").unwrap();
        build.add_step(host, TaskCommand::Default, vec![]).unwrap();
        let mut state = HostState::from_build(&build, host).unwrap();

        state.steps[0].status = StepStatus::Running;
        assert_eq!(normalize(&mut state, None), (Next::Ready(0), true));
        assert_eq!(normalize(&mut state, None), (Next::Ready(0), false));

        state.steps[0].status = StepStatus::Complete;
        state.pending_reboot = Some(PendingReboot {
            boot_marker: "b1".into(),
            step: state.steps[0].id,
            requested_at: Utc::now(),
        });
        assert_eq!(normalize(&mut state, Some("b1")).0, Next::AwaitingReboot);
        assert_eq!(normalize(&mut state, None).0, Next::AwaitingReboot);
        assert_eq!(normalize(&mut state, Some("b2")), (Next::Finished, true));
        assert!(HostState::from_build(&build, ProvisionedHostId::new()).is_none());
    }

    #[test]
    fn test_liveness_ticks() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let platform = Arc::new(FakePlatform::default());
        let worker = spawn(&temp, &runner, &platform, RevisionPolicy::Sequential);
        assert!(worker.last_alive() > 0);
        assert_eq!(worker.snapshot().phase, WorkerPhase::Idle);
    }

    #[test]
    fn test_liveness_keeps_ticking_during_a_blocked_step() {
        let temp = TempDir::new().unwrap();
        let (release, gate) = mpsc::channel();
        let runner = Arc::new(FakeRunner {
            gate: Mutex::new(Some(gate)),
            ..FakeRunner::default()
        });
        let platform = Arc::new(FakePlatform::default());
        let worker = Worker::spawn(
            runner.clone(),
            platform,
            WorkerTimings::default(),
            RevisionPolicy::Sequential,
            temp.path().join("logs"),
        );

        let (path, _) = write_state(temp.path(), 1, &[("block", false)]);
        assert_eq!(worker.load(&path), Ok(1));
        let before = worker.last_alive();

        // Stamps are whole seconds and the tick is one second
        thread::sleep(Duration::from_millis(2200));
        assert!(worker.last_alive() > before);
        assert!(runner.runs().is_empty());

        release.send(()).unwrap();
        wait_for(&worker, WorkerPhase::Finished);
    }
}
