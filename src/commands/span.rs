//! `rangectl span`: one ad hoc command across every team

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use indicatif::ProgressBar;
use spanner::{SpanConfig, SpanMode, SpanProgress, SpanResult, Spanner};
use std::path::PathBuf;

use crate::Context;
use crate::cli::SpanArgs;
use crate::paths;
use crate::progress;
use crate::ui;

/// Advances the bar as each team finishes
struct BarProgress<'a> {
    pb: &'a ProgressBar,
}

impl SpanProgress for BarProgress<'_> {
    fn on_result(&self, result: &SpanResult) {
        let symbol = if result.success() { "✓" } else { "✗" };
        self.pb.set_message(format!("{symbol} team {}", result.team));
        self.pb.inc(1);
    }
}

pub fn run(ctx: &Context, args: SpanArgs) -> Result<()> {
    let config = span_config(ctx, &args)?;
    let command = args.command.join(" ");

    let spanner = Spanner::new(&config).context("Failed to bind team workers")?;
    log::info!(
        "Spanning '{}' across {} teams, logs in {}",
        command,
        config.teams,
        spanner.log_dir().display()
    );

    let pb = if ctx.quiet {
        progress::hidden()
    } else {
        progress::bar(u64::from(config.teams), "Spanning")
    };
    let results = spanner.run(&command, Some(&BarProgress { pb: &pb }))?;

    let failed = results.iter().filter(|r| !r.success()).count();
    if failed == 0 {
        progress::finish_success(&pb, &format!("All {} teams succeeded", results.len()));
    } else {
        progress::finish_warn(&pb, &format!("{failed} of {} teams failed", results.len()));
    }

    if !ctx.quiet {
        print_results(&results, ctx.verbose > 0);
        ui::dim(&format!("Output logs: {}", spanner.log_dir().display()));
    }

    if failed > 0 {
        bail!("{failed} of {} teams failed", results.len());
    }
    Ok(())
}

/// Flags win over `[spanner]` config; the base directory defaults to the
/// current directory
fn span_config(ctx: &Context, args: &SpanArgs) -> Result<SpanConfig> {
    let config = &ctx.config.spanner;
    let teams = args
        .teams
        .or(config.teams)
        .context("Team count unknown; pass --teams or set [spanner] teams")?;
    let base_dir = match (&args.base_dir, &config.base_dir) {
        (Some(dir), _) => dir.clone(),
        (None, Some(dir)) => paths::expand(dir),
        (None, None) => std::env::current_dir().context("Could not read current directory")?,
    };
    let log_dir: Option<PathBuf> = args
        .log_dir
        .clone()
        .or_else(|| config.log_dir.as_deref().map(paths::expand));
    let mode = match &args.host {
        Some(hostname) => SpanMode::Remote {
            hostname: hostname.clone(),
        },
        None => SpanMode::Local,
    };

    Ok(SpanConfig {
        base_dir,
        log_dir,
        teams,
        mode,
    })
}

fn print_results(results: &[SpanResult], verbose: bool) {
    ui::section("Results");
    for result in results {
        let (symbol, outcome) = match (&result.error, result.exit_code) {
            (Some(error), _) => ("✗".red(), error.clone()),
            (None, Some(0)) => ("✓".green(), "exit 0".to_string()),
            (None, Some(code)) => ("✗".red(), format!("exit {code}")),
            (None, None) => ("✗".red(), "killed by signal".to_string()),
        };
        println!(
            "  {} team {:<3} {:<24} {:<16} {}",
            symbol,
            result.team,
            result.target,
            outcome,
            ui::format_duration(result.elapsed).dimmed()
        );

        let output = if result.success() {
            &result.stdout
        } else {
            &result.stderr
        };
        if verbose {
            for line in output.lines() {
                ui::dim(&format!("    {line}"));
            }
        } else {
            let last = ui::last_line(output, 72);
            if !last.is_empty() {
                ui::dim(&format!("    {last}"));
            }
        }
    }
}
