//! Agent side of the task protocol
//!
//! Two independent loops share one single-slot channel: the heartbeat loop
//! puts the control plane's latest `available_tasks` answer into it,
//! replacing any unread one, and the pull loop reads it on its own tick. A
//! pull is skipped while the previous one is still running, so an agent never
//! has more than one task in flight.

use crate::commands::StepRunner;
use crate::error::Result;
use crate::facts::HostFacts;
use crate::platform::Platform;
use crate::recent::{DEFAULT_WINDOW, RecentTasks};
use crate::shutdown::Shutdown;
use plangraph::{TaskCommand, TaskId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use taskwire::{
    ControlPlane, FixedInterval, HeartbeatReply, LogCallback, TaskState, TaskStatusUpdate,
    with_retry,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// String form of the host's ProvisionedHostId
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub pull_interval: Duration,
    /// How many completed task ids to remember for dropping redeliveries
    pub dedup_window: usize,
    /// Retries for status reports
    pub report_retry: FixedInterval,
}

impl AgentConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            heartbeat_interval: Duration::from_secs(10),
            pull_interval: Duration::from_secs(10),
            dedup_window: DEFAULT_WINDOW,
            report_retry: FixedInterval::new(Duration::from_secs(1), 3),
        }
    }
}

/// Single-slot channel that keeps only the newest value
#[derive(Debug, Default)]
pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store `value`, dropping an unread older one
    pub fn put(&self, value: T) {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(value);
        self.ready.notify_one();
    }

    /// Take the value, waiting up to `timeout` for one to arrive
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// Result of one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing queued
    Idle,
    /// Same id as a task that just ran; dropped
    Duplicate(TaskId),
    Ran { task_id: TaskId, status: TaskState },
    /// COMPLETE was reported and the host is going down
    Rebooting(TaskId),
}

pub struct Dispatcher {
    plane: Arc<dyn ControlPlane>,
    runner: Arc<dyn StepRunner>,
    platform: Arc<dyn Platform>,
    config: AgentConfig,
    recent: Mutex<RecentTasks>,
    pulling: AtomicBool,
}

/// Clears the pulling flag when a pull finishes, even by panic
struct PullGuard<'a>(&'a AtomicBool);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Dispatcher {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn StepRunner>,
        platform: Arc<dyn Platform>,
        config: AgentConfig,
    ) -> Self {
        let recent = RecentTasks::new(config.dedup_window);
        Self {
            plane,
            runner,
            platform,
            config,
            recent: Mutex::new(recent),
            pulling: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start the heartbeat and pull loops; both stop once `shutdown` fires
    pub fn spawn(self: &Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let slot = Arc::new(LatestSlot::new());

        let heartbeat = {
            let this = Arc::clone(self);
            let slot = Arc::clone(&slot);
            let shutdown = shutdown.clone();
            thread::spawn(move || this.heartbeat_loop(&slot, &shutdown))
        };
        let pull = {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            thread::spawn(move || this.pull_loop(&slot, &shutdown))
        };
        vec![heartbeat, pull]
    }

    fn heartbeat_loop(&self, slot: &LatestSlot<bool>, shutdown: &Shutdown) {
        loop {
            match self.beat_once() {
                Ok(reply) => slot.put(reply.available_tasks),
                Err(e) => log::warn!("Heartbeat failed: {e}"),
            }
            if shutdown.wait(self.config.heartbeat_interval) {
                log::debug!("Heartbeat loop stopped");
                return;
            }
        }
    }

    fn pull_loop(self: &Arc<Self>, slot: &LatestSlot<bool>, shutdown: &Shutdown) {
        loop {
            let available = slot
                .take_timeout(self.config.pull_interval)
                .unwrap_or(false);
            if shutdown.is_triggered() {
                log::debug!("Pull loop stopped");
                return;
            }
            if !available {
                continue;
            }
            if self.pulling.swap(true, Ordering::SeqCst) {
                log::debug!("Previous pull still running, skipping");
                continue;
            }

            let this = Arc::clone(self);
            thread::spawn(move || {
                let _guard = PullGuard(&this.pulling);
                match this.pull_once() {
                    Ok(outcome) => log::debug!("Pull finished: {outcome:?}"),
                    Err(e) => log::warn!("Task pull failed: {e}"),
                }
            });
        }
    }

    pub fn beat_once(&self) -> taskwire::Result<HeartbeatReply> {
        let beat = HostFacts::collect().heartbeat(&self.config.client_id);
        self.plane.heartbeat(&beat)
    }

    /// Pull one task, claim it, run it and report the result
    pub fn pull_once(&self) -> Result<PullOutcome> {
        let Some(task) = self.plane.get_task(&self.config.client_id)? else {
            return Ok(PullOutcome::Idle);
        };
        let id = task.task_id;
        if self.recent().contains(id) {
            log::info!("Dropping repeated delivery of task {id}");
            return Ok(PullOutcome::Duplicate(id));
        }

        self.plane.inform_task_status(&TaskStatusUpdate::claim(id))?;
        log::info!("Running task {id} ({})", task.command);

        if task.command == TaskCommand::Reboot {
            // Nothing can be reported once the host is down
            self.report(&TaskStatusUpdate::complete(id, ""))?;
            self.recent().record(id);
            self.platform.reboot()?;
            self.platform.halt_after_reboot();
            return Ok(PullOutcome::Rebooting(id));
        }

        let update = match self.runner.run(task.command, &task.args) {
            Ok(output) => TaskStatusUpdate::complete(id, output.combined()),
            Err(e) => {
                log::warn!("Task {id} failed: {e}");
                TaskStatusUpdate::failed(id, e.to_string(), e.output())
            }
        };
        self.recent().record(id);
        self.report(&update)?;
        Ok(PullOutcome::Ran {
            task_id: id,
            status: update.status,
        })
    }

    fn report(&self, update: &TaskStatusUpdate) -> taskwire::Result<()> {
        with_retry(&self.config.report_retry, Some(&LogCallback), || {
            self.plane.inform_task_status(update)
        })
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentTasks> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
