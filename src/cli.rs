use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rangectl")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Build, provision and operate cyber-range environments", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/rangectl.toml)
    #[arg(long, global = true, env = "RANGECTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the control-plane server and reconcile started commits
    Serve(ServeArgs),

    /// Run the host agent (task puller, step worker, diagnostics)
    Agent(AgentArgs),

    /// Inspect and change the build plan
    Plan(PlanArgs),

    /// Run one command across every team
    Span(SpanArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Serve
// ============================================================================

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    pub listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Serve plain HTTP even when TLS files are configured
    #[arg(long, conflicts_with_all = ["tls_cert", "tls_key"])]
    pub insecure: bool,

    /// Task board file
    #[arg(long)]
    pub board: Option<PathBuf>,

    /// Build snapshot to reconcile
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Args)]
pub struct AgentArgs {
    /// Control-plane base URL
    #[arg(long)]
    pub server: Option<String>,

    /// Pinned server certificate (PEM)
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// This host's ProvisionedHostId
    #[arg(long, env = "RANGECTL_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Host state file loaded into the step worker
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Directory for step logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Address for the diagnostics server
    #[arg(long)]
    pub diag_listen: Option<String>,

    /// Do not start the diagnostics server
    #[arg(long)]
    pub no_diag: bool,
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Build snapshot file (default: <state dir>/build.json)
    #[arg(long, global = true)]
    pub snapshot: Option<PathBuf>,

    #[command(subcommand)]
    pub command: PlanCommand,
}

#[derive(Subcommand)]
pub enum PlanCommand {
    /// Build the plan graph from a build state file
    Init {
        /// Build state (JSON)
        state: PathBuf,

        /// Replace an existing snapshot
        #[arg(long)]
        force: bool,
    },

    /// List plan nodes in execution order
    Show {
        /// Only nodes in this state (e.g. FAILED)
        #[arg(long)]
        state: Option<String>,
    },

    /// Summarize node states and the latest commit
    Status,

    /// Plan a commit against the current graph
    Commit {
        /// Rebuild what changed in this desired build state (JSON)
        #[arg(long, value_name = "STATE", conflicts_with = "delete")]
        rebuild: Option<PathBuf>,

        /// Tear the whole build down
        #[arg(long)]
        delete: bool,
    },

    /// Approve and start the open commit
    Approve {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Cancel the open commit
    Cancel,

    /// Write the state file a host's agent worker loads
    HostState {
        /// Team number
        #[arg(long)]
        team: u32,

        /// Hostname within the team
        #[arg(long)]
        host: String,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

// ============================================================================
// Span
// ============================================================================

#[derive(Args)]
pub struct SpanArgs {
    /// Command to run for every team
    #[arg(required = true, trailing_var_arg = true, num_args = 1..)]
    pub command: Vec<String>,

    /// Number of teams (numbered from 1)
    #[arg(short, long)]
    pub teams: Option<u32>,

    /// Directory holding the team-<n> directories
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Run on this host of every team instead of locally
    #[arg(long)]
    pub host: Option<String>,

    /// Directory for per-team output logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}
