//! `rangectl plan`: build snapshot inspection and commits

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use dialoguer::Confirm;
use hostagent::HostState;
use plangraph::{
    BuildCommit, BuildSnapshot, BuildState, CommitKind, CommitPolicy, CommitState, DiffState,
    PlanBuilder, PlanKind, StatusState,
};
use std::fs;
use std::path::{Path, PathBuf};

use crate::Context;
use crate::cli::{PlanArgs, PlanCommand};
use crate::paths;
use crate::ui;

pub const SNAPSHOT_FILE: &str = "build.json";

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let path = snapshot_path(ctx, args.snapshot)?;
    let policy = ctx.config.server.commit_policy();

    match args.command {
        PlanCommand::Init { state, force } => init(&path, &state, force),
        PlanCommand::Show { state } => show(&path, state.as_deref()),
        PlanCommand::Status => status(&path),
        PlanCommand::Commit { rebuild, delete } => {
            commit(&path, rebuild.as_deref(), delete, &policy).map(|_| ())
        }
        PlanCommand::Approve { yes } => approve(&path, yes, &policy),
        PlanCommand::Cancel => cancel(&path),
        PlanCommand::HostState { team, host, out } => host_state(&path, team, &host, &out),
    }
}

/// `--snapshot`, then `[server] snapshot`, then the state directory
pub fn snapshot_path(ctx: &Context, flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => paths::state_file(ctx.config.server.snapshot.as_deref(), SNAPSHOT_FILE),
    }
}

fn load_snapshot(path: &Path) -> Result<BuildSnapshot> {
    if !path.exists() {
        bail!(
            "No build snapshot at {}. Run 'rangectl plan init <STATE>' first.",
            path.display()
        );
    }
    BuildSnapshot::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn read_state(path: &Path) -> Result<BuildState> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid build state in {}", path.display()))
}

// ============================================================================
// Init
// ============================================================================

fn init(path: &Path, state_file: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "A build snapshot already exists at {}. Use --force to replace it.",
            path.display()
        );
    }

    let state = read_state(state_file)?;
    let graph = PlanBuilder::from_state(&state).context("Failed to build the plan graph")?;
    let nodes = graph.len();
    let (environment, competition) = (
        state.build.environment.clone(),
        state.build.competition.clone(),
    );

    BuildSnapshot::new(state, graph)
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    ui::success(&format!(
        "Planned {} nodes for {} / {}",
        nodes.to_string().bold(),
        environment,
        competition
    ));
    ui::dim(&path.display().to_string());
    Ok(())
}

// ============================================================================
// Show / Status
// ============================================================================

fn parse_state(value: &str) -> Result<StatusState> {
    let state = match value.to_ascii_uppercase().replace(['-', '_'], "").as_str() {
        "AWAITING" => StatusState::Awaiting,
        "INPROGRESS" => StatusState::InProgress,
        "FAILED" => StatusState::Failed,
        "COMPLETE" => StatusState::Complete,
        "TAINTED" => StatusState::Tainted,
        _ => bail!(
            "Unknown state '{value}'. Expected AWAITING, INPROGRESS, FAILED, COMPLETE or TAINTED."
        ),
    };
    Ok(state)
}

/// Human label for the entity a node provisions
fn describe(state: &BuildState, kind: &PlanKind) -> String {
    match kind {
        PlanKind::StartBuild { .. } => format!(
            "{} / {}",
            state.build.environment, state.build.competition
        ),
        PlanKind::StartTeam { team } => state
            .teams
            .get(team)
            .map(|t| format!("team {}", t.team_number))
            .unwrap_or_else(|| format!("team {team}")),
        PlanKind::ProvisionNetwork { network } => state
            .networks
            .get(network)
            .map(|n| format!("{} ({})", n.name, n.cidr))
            .unwrap_or_else(|| format!("network {network}")),
        PlanKind::ProvisionHost { host } => state
            .hosts
            .get(host)
            .map(|h| h.hostname.clone())
            .unwrap_or_else(|| format!("host {host}")),
        PlanKind::ExecuteStep { step } => state
            .steps
            .get(step)
            .map(|s| {
                let hostname = state
                    .hosts
                    .get(&s.host)
                    .map_or("?", |h| h.hostname.as_str());
                format!(
                    "{hostname} #{} {} {}",
                    s.step_number,
                    s.command,
                    s.args.join(" ")
                )
                .trim_end()
                .to_string()
            })
            .unwrap_or_else(|| format!("step {step}")),
    }
}

fn show(path: &Path, filter: Option<&str>) -> Result<()> {
    let snapshot = load_snapshot(path)?;
    let filter = filter.map(parse_state).transpose()?;

    ui::header(&format!(
        "Plan: {} / {} (revision {})",
        snapshot.state.build.environment,
        snapshot.state.build.competition,
        snapshot.state.build.revision
    ));

    let mut shown = 0;
    for id in snapshot.graph.traverse() {
        let node = snapshot.graph.node(id)?;
        if filter.is_some_and(|f| f != node.status.state) {
            continue;
        }
        shown += 1;
        println!(
            "  {:>3}  {:<16} {:<11} {}",
            node.step_number,
            node.kind.plan_type().to_string(),
            ui::status_label(node.status.state),
            describe(&snapshot.state, &node.kind)
        );
        if let Some(error) = &node.status.error {
            ui::dim(&format!("       {error}"));
        }
    }

    if shown == 0 {
        ui::info("No matching nodes.");
    }
    Ok(())
}

fn status(path: &Path) -> Result<()> {
    let snapshot = load_snapshot(path)?;
    let build = &snapshot.state.build;

    ui::header("Build Status");
    ui::kv("Environment", &build.environment);
    ui::kv("Competition", &build.competition);
    ui::kv("Revision", &build.revision.to_string());
    ui::kv("Teams", &snapshot.state.teams.len().to_string());
    ui::kv("Hosts", &snapshot.state.hosts.len().to_string());
    ui::kv(
        "Saved",
        &snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );

    ui::section("Plan");
    for state in [
        StatusState::Awaiting,
        StatusState::InProgress,
        StatusState::Complete,
        StatusState::Failed,
        StatusState::Tainted,
    ] {
        let count = snapshot
            .graph
            .iter()
            .filter(|n| n.status.state == state)
            .count();
        if count > 0 {
            println!("  {:<11} {}", ui::status_label(state), count);
        }
    }

    ui::section("Latest Commit");
    match snapshot.latest_commit() {
        Some(commit) => print_commit(commit),
        None => ui::dim("none"),
    }
    if let Some(open) = snapshot.open_commit()
        && open.state == CommitState::Planning
    {
        println!();
        ui::warn("The open commit needs approval: rangectl plan approve");
    }
    Ok(())
}

fn print_commit(commit: &BuildCommit) {
    ui::kv(
        "Commit",
        &format!("{} r{} ({})", commit.kind, commit.revision, commit.state),
    );
    ui::kv(
        "Created",
        &commit.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );

    let mut states: Vec<DiffState> = Vec::new();
    for diff in &commit.diffs {
        if !states.contains(&diff.new_state) {
            states.push(diff.new_state);
        }
    }
    let summary = states
        .into_iter()
        .map(|s| format!("{} {}", commit.count(s), ui::diff_label(s)))
        .collect::<Vec<_>>()
        .join(", ");
    ui::kv("Diffs", if summary.is_empty() { "none" } else { &summary });
}

// ============================================================================
// Commit / Approve / Cancel
// ============================================================================

/// Every entity of `current` must still exist in `desired` and vice versa
fn ensure_same_shape(current: &BuildState, desired: &BuildState) -> Result<()> {
    if current.build.id != desired.build.id {
        bail!("Desired state belongs to a different build");
    }
    let same = current.teams.keys().eq(desired.teams.keys())
        && current.networks.keys().eq(desired.networks.keys())
        && current.hosts.keys().eq(desired.hosts.keys())
        && current.steps.keys().eq(desired.steps.keys());
    if !same {
        bail!(
            "Desired state adds or removes entities; a rebuild only changes existing ones. \
             Re-run 'rangectl plan init --force' for a new topology."
        );
    }
    Ok(())
}

/// Plan a commit, start it unless the policy gates it, and record it
fn commit(
    path: &Path,
    rebuild: Option<&Path>,
    delete: bool,
    policy: &CommitPolicy,
) -> Result<Option<BuildCommit>> {
    let mut snapshot = load_snapshot(path)?;
    if let Some(open) = snapshot.open_commit() {
        bail!(
            "{} commit r{} is still {}; approve, cancel or let it finish first",
            open.kind,
            open.revision,
            open.state
        );
    }

    let mut commit = if delete {
        BuildCommit::plan_delete(&snapshot.state, &snapshot.graph)
    } else if let Some(desired_file) = rebuild {
        let desired = read_state(desired_file)?;
        ensure_same_shape(&snapshot.state, &desired)?;
        let commit = BuildCommit::plan_rebuild(&snapshot.state, &desired, &snapshot.graph);
        if commit.diffs.is_empty() {
            ui::info("Nothing changed; no commit created.");
            return Ok(None);
        }
        snapshot.state = desired;
        commit
    } else {
        if snapshot
            .commits
            .iter()
            .any(|c| c.state == CommitState::Applied)
        {
            bail!("The build was already applied; use --rebuild or --delete");
        }
        BuildCommit::plan_root(&snapshot.state, &snapshot.graph)
    };

    if !policy.requires_approval(commit.kind) {
        commit.start(policy)?;
    }
    let recorded = commit.clone();
    snapshot.push_commit(commit)?;
    snapshot
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    ui::success(&format!(
        "Planned {} commit r{} with {} diffs",
        recorded.kind,
        recorded.revision,
        recorded.diffs.len()
    ));
    if recorded.state == CommitState::Planning {
        ui::warn(&format!(
            "{} commits need approval: rangectl plan approve",
            recorded.kind
        ));
    }
    Ok(Some(recorded))
}

fn approve(path: &Path, yes: bool, policy: &CommitPolicy) -> Result<()> {
    let mut snapshot = load_snapshot(path)?;
    let Some(open) = snapshot.open_commit() else {
        bail!("No open commit to approve");
    };
    if open.state != CommitState::Planning {
        bail!("{} commit r{} is already {}", open.kind, open.revision, open.state);
    }

    if !yes {
        if !console::user_attended() {
            bail!("Refusing to approve without a terminal; pass --yes");
        }
        print_commit(open);
        let prompt = match open.kind {
            CommitKind::Delete => format!(
                "Tear down all {} nodes of this build?",
                open.count(DiffState::ToDelete)
            ),
            kind => format!("Apply this {kind} commit?"),
        };
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Aborted.");
            return Ok(());
        }
    }

    let id = open.id;
    let commit = snapshot.commit_mut(id)?;
    commit.approve()?;
    commit.start(policy)?;
    let (kind, revision) = (commit.kind, commit.revision);
    snapshot
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    ui::success(&format!("Started {kind} commit r{revision}"));
    Ok(())
}

fn cancel(path: &Path) -> Result<()> {
    let mut snapshot = load_snapshot(path)?;
    let Some(id) = snapshot.open_commit().map(|c| c.id) else {
        bail!("No open commit to cancel");
    };
    let commit = snapshot.commit_mut(id)?;
    commit.cancel()?;
    let (kind, revision) = (commit.kind, commit.revision);
    snapshot
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    ui::success(&format!("Cancelled {kind} commit r{revision}"));
    Ok(())
}

// ============================================================================
// Host State
// ============================================================================

fn host_state(path: &Path, team: u32, hostname: &str, out: &Path) -> Result<()> {
    let snapshot = load_snapshot(path)?;
    let team_entry = snapshot
        .state
        .team_by_number(team)
        .with_context(|| format!("Team {team} is not part of this build"))?;
    let host = snapshot
        .state
        .host_in_team(team_entry.id, hostname)
        .with_context(|| format!("Team {team} has no host named {hostname}"))?;
    let state = HostState::from_build(&snapshot.state, host.id)
        .with_context(|| format!("Build state for {hostname} is incomplete"))?;

    state
        .save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    ui::success(&format!(
        "Wrote {} steps for {hostname} (team {team}, revision {}) to {}",
        state.steps.len(),
        state.build.revision,
        out.display()
    ));
    Ok(())
}
