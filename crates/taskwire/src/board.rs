//! Server-side task store.
//!
//! The [`TaskBoard`] queues tasks per host, hands them out to pulling agents
//! in sequence-number order and records the results. It is the state behind
//! the HTTP server and the [`StepDispatcher`] the reconciler talks to.

use crate::error::{Error, Result};
use crate::messages::{Heartbeat, HeartbeatReply, TaskAssignment, TaskStatusUpdate};
use crate::plane::ControlPlane;
use crate::task::{AgentTask, TaskState};
use chrono::{DateTime, Utc};
use plangraph::{
    ProvisionedHost, ProvisionedHostId, ProvisioningStep, ProvisioningStepId, StepDispatcher,
    TaskCommand, TaskId, TaskResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Latest heartbeat seen from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub last_heartbeat: Heartbeat,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BoardData {
    #[serde(default)]
    tasks: BTreeMap<TaskId, AgentTask>,
    /// Last sequence number handed out per host
    #[serde(default)]
    numbers: BTreeMap<ProvisionedHostId, u64>,
    #[serde(default)]
    clients: BTreeMap<String, ClientRecord>,
}

#[derive(Debug, Default)]
pub struct TaskBoard {
    data: Mutex<BoardData>,
}

fn parse_client(client_id: &str) -> Result<ProvisionedHostId> {
    client_id
        .parse()
        .map_err(|_| Error::UnknownClient(client_id.to_string()))
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a task for a host; numbers are strictly increasing per host
    pub fn enqueue(
        &self,
        host: ProvisionedHostId,
        step: Option<ProvisioningStepId>,
        command: TaskCommand,
        args: Vec<String>,
    ) -> TaskId {
        let mut data = self.lock();
        let number = data.numbers.get(&host).map_or(0, |n| n + 1);
        data.numbers.insert(host, number);

        let task = AgentTask::new(host, step, number, command, args);
        let id = task.id;
        log::debug!("Queued {} task #{} ({}) for host {}", command, number, id, host);
        data.tasks.insert(id, task);
        id
    }

    pub fn task(&self, id: TaskId) -> Option<AgentTask> {
        self.lock().tasks.get(&id).cloned()
    }

    /// All tasks of a host ordered by sequence number
    pub fn tasks_for_host(&self, host: ProvisionedHostId) -> Vec<AgentTask> {
        let data = self.lock();
        let mut tasks: Vec<AgentTask> = data
            .tasks
            .values()
            .filter(|t| t.host == host)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.number);
        tasks
    }

    pub fn client(&self, client_id: &str) -> Option<ClientRecord> {
        self.lock().clients.get(client_id).cloned()
    }

    pub fn clients(&self) -> Vec<(String, ClientRecord)> {
        self.lock()
            .clients
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let data: BoardData = serde_json::from_str(&content)?;
        log::debug!(
            "Loaded {} tasks from {}",
            data.tasks.len(),
            path.display()
        );
        Ok(Self {
            data: Mutex::new(data),
        })
    }

    /// Load the board if the file exists, start empty otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Write the board atomically as pretty JSON
    ///
    /// The board stays locked until the file is renamed into place, so
    /// concurrent saves never share the temp file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = self.lock();
        let content = serde_json::to_string_pretty(&*data)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }
}

impl ControlPlane for TaskBoard {
    fn heartbeat(&self, beat: &Heartbeat) -> Result<HeartbeatReply> {
        let host = parse_client(&beat.client_id)?;
        let mut data = self.lock();
        data.clients.insert(
            beat.client_id.clone(),
            ClientRecord {
                last_heartbeat: beat.clone(),
                seen_at: Utc::now(),
            },
        );
        let available_tasks = data
            .tasks
            .values()
            .any(|t| t.host == host && t.state == TaskState::Awaiting);
        Ok(HeartbeatReply { available_tasks })
    }

    /// Hands out the lowest-numbered AWAITING task
    ///
    /// The task stays AWAITING until the agent claims it, so a reply lost on
    /// the way is answered again by the next pull.
    fn get_task(&self, client_id: &str) -> Result<Option<TaskAssignment>> {
        let host = parse_client(client_id)?;
        let data = self.lock();
        let Some(task) = data
            .tasks
            .values()
            .filter(|t| t.host == host && t.state == TaskState::Awaiting)
            .min_by_key(|t| t.number)
        else {
            return Ok(None);
        };

        log::info!(
            "Client {} pulled {} task #{} ({})",
            client_id,
            task.command,
            task.number,
            task.id
        );
        Ok(Some(TaskAssignment {
            task_id: task.id,
            command: task.command,
            args: task.args.clone(),
        }))
    }

    fn inform_task_status(&self, update: &TaskStatusUpdate) -> Result<()> {
        let mut data = self.lock();
        let task = data
            .tasks
            .get_mut(&update.task_id)
            .ok_or(Error::UnknownTask(update.task_id))?;

        if !task.state.can_move_to(update.status) {
            return Err(Error::InvalidTransition {
                task: task.id,
                from: task.state,
                to: update.status,
            });
        }
        if task.state == update.status {
            return Ok(());
        }

        task.state = update.status;
        match update.status {
            TaskState::InProgress => {
                task.started_at.get_or_insert_with(Utc::now);
            }
            TaskState::Complete | TaskState::Failed => {
                task.output.clone_from(&update.output);
                if !update.error_message.is_empty() {
                    task.error = Some(update.error_message.clone());
                }
                task.ended_at = Some(Utc::now());
                log::info!("Task {} ({}) is {}", task.id, task.command, task.state);
            }
            TaskState::Awaiting => {}
        }
        Ok(())
    }
}

impl StepDispatcher for TaskBoard {
    fn dispatch(&self, host: &ProvisionedHost, step: &ProvisioningStep) -> anyhow::Result<TaskId> {
        Ok(self.enqueue(host.id, Some(step.id), step.command, step.args.clone()))
    }

    fn poll(&self, task: TaskId) -> anyhow::Result<Option<TaskResult>> {
        let task = self.task(task).ok_or(Error::UnknownTask(task))?;
        Ok(match task.state {
            TaskState::Complete => Some(TaskResult::Complete),
            TaskState::Failed => Some(TaskResult::Failed {
                error: task
                    .error
                    .unwrap_or_else(|| format!("{} task failed", task.command)),
            }),
            TaskState::Awaiting | TaskState::InProgress => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn beat(client_id: &str) -> Heartbeat {
        Heartbeat {
            client_id: client_id.to_string(),
            hostname: "web".into(),
            uptime: 100,
            boot_time: 1_700_000_000,
            proc_count: 42,
            os: "linux".into(),
            load1: 0.1,
            load5: 0.2,
            load15: 0.3,
            mem_total: 1024,
            mem_free: 512,
            mem_used: 512,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_numbers_increase_per_host() {
        let board = TaskBoard::new();
        let a = ProvisionedHostId::new();
        let b = ProvisionedHostId::new();
        board.enqueue(a, None, TaskCommand::Execute, vec![]);
        board.enqueue(b, None, TaskCommand::Execute, vec![]);
        board.enqueue(a, None, TaskCommand::Reboot, vec![]);

        let numbers: Vec<u64> = board.tasks_for_host(a).iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(board.tasks_for_host(b)[0].number, 0);
    }

    #[test]
    fn test_heartbeat_pull_claim_complete() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let client = host.to_string();

        assert!(!board.heartbeat(&beat(&client)).unwrap().available_tasks);
        let id = board.enqueue(host, None, TaskCommand::Execute, vec!["true".into()]);
        assert!(board.heartbeat(&beat(&client)).unwrap().available_tasks);
        assert_eq!(board.client(&client).unwrap().last_heartbeat.hostname, "web");

        let assignment = board.get_task(&client).unwrap().unwrap();
        assert_eq!(assignment.task_id, id);
        assert_eq!(board.task(id).unwrap().state, TaskState::Awaiting);

        board
            .inform_task_status(&TaskStatusUpdate::claim(id))
            .unwrap();
        assert_eq!(board.task(id).unwrap().state, TaskState::InProgress);
        assert!(board.task(id).unwrap().started_at.is_some());
        assert!(board.get_task(&client).unwrap().is_none());
        assert!(!board.heartbeat(&beat(&client)).unwrap().available_tasks);
        board
            .inform_task_status(&TaskStatusUpdate::complete(id, "done"))
            .unwrap();
        let task = board.task(id).unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert_eq!(task.output, "done");
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn test_tasks_are_served_in_number_order() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let first = board.enqueue(host, None, TaskCommand::Execute, vec![]);
        let second = board.enqueue(host, None, TaskCommand::Delete, vec![]);
        let client = host.to_string();
        assert_eq!(board.get_task(&client).unwrap().unwrap().task_id, first);
        board
            .inform_task_status(&TaskStatusUpdate::claim(first))
            .unwrap();
        assert_eq!(board.get_task(&client).unwrap().unwrap().task_id, second);
    }

    #[test]
    fn test_unclaimed_task_is_delivered_again() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let client = host.to_string();
        let id = board.enqueue(host, None, TaskCommand::Execute, vec!["id".into()]);

        // First reply never reaches the agent
        assert_eq!(board.get_task(&client).unwrap().unwrap().task_id, id);

        assert!(board.heartbeat(&beat(&client)).unwrap().available_tasks);
        let again = board.get_task(&client).unwrap().unwrap();
        assert_eq!(again.task_id, id);
        assert_eq!(again.args, vec!["id".to_string()]);
        assert_eq!(board.task(id).unwrap().state, TaskState::Awaiting);
        assert_eq!(board.poll(id).unwrap(), None);

        board
            .inform_task_status(&TaskStatusUpdate::claim(id))
            .unwrap();
        board
            .inform_task_status(&TaskStatusUpdate::complete(id, "uid=0"))
            .unwrap();
        assert_eq!(board.poll(id).unwrap(), Some(TaskResult::Complete));
    }

    #[test]
    fn test_rejects_illegal_transitions() {
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        let id = board.enqueue(host, None, TaskCommand::Execute, vec![]);

        let err = board
            .inform_task_status(&TaskStatusUpdate::complete(id, ""))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        board
            .inform_task_status(&TaskStatusUpdate::claim(id))
            .unwrap();
        board
            .inform_task_status(&TaskStatusUpdate::failed(id, "exit 2", "oops"))
            .unwrap();
        let err = board
            .inform_task_status(&TaskStatusUpdate::complete(id, ""))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let err = board
            .inform_task_status(&TaskStatusUpdate::claim(TaskId::new()))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTask(_)));
        assert!(matches!(
            board.get_task("not-a-host"),
            Err(Error::UnknownClient(_))
        ));
    }

    #[test]
    fn test_step_dispatcher_reports_terminal_results() {
        let mut state = plangraph::BuildState::new("env", "comp");
        let team = state.add_team(1);
        let net = state.add_network(team, "n", "10.0.0.0/24").unwrap();
        let host_id = state.add_host(net, "h").unwrap();
        let step_id = state
            .add_step(host_id, TaskCommand::Execute, vec!["make".into()])
            .unwrap();

        let board = TaskBoard::new();
        let task = board
            .dispatch(&state.hosts[&host_id], &state.steps[&step_id])
            .unwrap();
        assert_eq!(board.task(task).unwrap().step, Some(step_id));
        assert_eq!(board.poll(task).unwrap(), None);

        board
            .inform_task_status(&TaskStatusUpdate::claim(task))
            .unwrap();
        board
            .inform_task_status(&TaskStatusUpdate::failed(task, "exit 1", ""))
            .unwrap();
        assert_eq!(
            board.poll(task).unwrap(),
            Some(TaskResult::Failed {
                error: "exit 1".into()
            })
        );
        assert!(board.poll(TaskId::new()).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("board.json");
        let board = TaskBoard::new();
        let host = ProvisionedHostId::new();
        board.enqueue(host, None, TaskCommand::Execute, vec!["a".into()]);
        board.heartbeat(&beat(&host.to_string())).unwrap();
        board.save(&path).unwrap();

        let loaded = TaskBoard::load(&path).unwrap();
        assert_eq!(loaded.tasks_for_host(host), board.tasks_for_host(host));
        assert_eq!(loaded.clients().len(), 1);

        // numbering continues after a reload
        loaded.enqueue(host, None, TaskCommand::Execute, vec![]);
        assert_eq!(loaded.tasks_for_host(host)[1].number, 1);

        let missing = TaskBoard::load_or_default(&temp.path().join("none.json")).unwrap();
        assert!(missing.is_empty());
    }
}
