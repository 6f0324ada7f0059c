//! # Spanner
//!
//! Broadcasts one ad hoc command across every team's environment of a range
//! build.
//!
//! ```text
//! <base_dir>/
//!   team-1/build.json
//!   team-2/build.json
//!   span-logs/team-1.stdout.log
//! ```
//!
//! In local mode the command runs on the control host inside each team
//! directory. In remote mode it runs on the named host of every team, over
//! `ssh` or `pwsh` remoting depending on the host's transport; the host must
//! be fully provisioned.

pub mod error;
pub mod fanout;
pub mod target;

pub use error::{Error, Result};
pub use fanout::{SpanConfig, SpanProgress, SpanResult, Spanner, TeamWorker};
pub use target::{SNAPSHOT_FILE, SpanMode, Target, resolve_remote, team_dir};
