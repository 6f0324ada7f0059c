//! Transport-agnostic control plane seam.
//!
//! Agents talk to a [`ControlPlane`]. The in-process [`crate::TaskBoard`]
//! implements it directly (tests, single-host setups) and
//! [`crate::HttpControlPlane`] implements it over HTTPS.

use crate::error::Result;
use crate::messages::{Heartbeat, HeartbeatReply, TaskAssignment, TaskStatusUpdate};
use std::sync::Arc;

pub trait ControlPlane: Send + Sync {
    /// Report liveness; the reply says whether tasks are queued
    fn heartbeat(&self, beat: &Heartbeat) -> Result<HeartbeatReply>;

    /// Pull the next queued task for a client, if any
    fn get_task(&self, client_id: &str) -> Result<Option<TaskAssignment>>;

    /// Report a claim or terminal result
    fn inform_task_status(&self, update: &TaskStatusUpdate) -> Result<()>;
}

impl<T: ControlPlane + ?Sized> ControlPlane for Arc<T> {
    fn heartbeat(&self, beat: &Heartbeat) -> Result<HeartbeatReply> {
        (**self).heartbeat(beat)
    }

    fn get_task(&self, client_id: &str) -> Result<Option<TaskAssignment>> {
        (**self).get_task(client_id)
    }

    fn inform_task_status(&self, update: &TaskStatusUpdate) -> Result<()> {
        (**self).inform_task_status(update)
    }
}
