use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use esxi_patcher::catalog;
use esxi_patcher::patch::{PatchOutcome, PatchStatus};
use esxi_patcher::resolve::resolve_goroot;
use esxi_patcher::runner::{self, PatchReport, RunOptions, RunReport};
use similar::{ChangeTag, TextDiff};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "esxi-patcher")]
#[command(about = "Patch a Go toolchain and client repo for ESXi epoll quirks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the toolchain patches, plus the repository patches when --repo is set
    Apply {
        /// GOROOT path (defaults to the GOROOT env var or 'go env GOROOT')
        #[arg(long)]
        goroot: Option<PathBuf>,

        /// Client repository root to patch and validate
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,
    },

    /// Report patch status without modifying any file
    Status {
        /// GOROOT path (defaults to the GOROOT env var or 'go env GOROOT')
        #[arg(long)]
        goroot: Option<PathBuf>,

        /// Client repository root to check
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { goroot, repo, diff } => cmd_apply(goroot, repo, diff),
        Commands::Status { goroot, repo } => cmd_status(goroot, repo),
    }
}

/// Ambient state is read exactly once, here, and handed to the engine as
/// plain data.
fn build_options(goroot: Option<PathBuf>, repo: Option<PathBuf>) -> RunOptions {
    RunOptions {
        goroot,
        repo,
        goroot_env: env::var("GOROOT").ok(),
        ..RunOptions::default()
    }
}

fn cmd_apply(goroot: Option<PathBuf>, repo: Option<PathBuf>, show_diff: bool) -> Result<()> {
    let options = build_options(goroot, repo);

    // Snapshot target contents up front so --diff can show what changed.
    let before = if show_diff {
        snapshot_targets(&options)?
    } else {
        HashMap::new()
    };

    let report = runner::run(&options)?;

    print_patch_lines(&report.toolchain);
    print_summary(None, &report.toolchain);

    if let Some(repository) = &report.repository {
        println!();
        print_patch_lines(repository);
        print_summary(Some("repo"), repository);
        println!("repo: self-path/forking patch present");
    }

    if show_diff {
        let mut groups: Vec<&[PatchReport]> = vec![&report.toolchain];
        if let Some(repository) = &report.repository {
            groups.push(repository);
        }
        for entry in groups.into_iter().flatten() {
            if !entry.outcome.modified() {
                continue;
            }
            if let (Some(original), Ok(modified)) =
                (before.get(&entry.path), fs::read_to_string(&entry.path))
            {
                display_diff(&entry.path, original, &modified);
            }
        }
    }

    Ok(())
}

fn cmd_status(goroot: Option<PathBuf>, repo: Option<PathBuf>) -> Result<()> {
    let options = build_options(goroot, repo);
    let report = runner::check(&options)?;

    println!("{}", "Patch Status Report".bold());
    println!("GOROOT: {}", report.goroot.display());
    println!();

    let mut groups = vec![report.toolchain];
    if let Some(repository) = report.repository {
        groups.push(repository);
    }

    let mut drifted = 0;
    for check in groups.iter().flatten() {
        match &check.status {
            PatchStatus::Applied => {
                println!("{} {}: applied", "✓".green(), check.id);
            }
            PatchStatus::Pending => {
                println!("{} {}: not applied", "⊙".yellow(), check.id);
            }
            PatchStatus::Drifted { reason } => {
                println!("{} {}: drifted ({})", "✗".red(), check.id, reason.dimmed());
                drifted += 1;
            }
        }
    }

    if drifted > 0 {
        println!();
        println!(
            "{}",
            format!("{drifted} patch(es) no longer match their target files").red()
        );
        std::process::exit(1);
    }

    Ok(())
}

fn print_patch_lines(reports: &[PatchReport]) {
    for report in reports {
        match report.outcome {
            PatchOutcome::Applied => {
                println!(
                    "{} {}: patched {}",
                    "✓".green(),
                    report.id,
                    report.path.display()
                );
            }
            PatchOutcome::AlreadyApplied => {
                println!("{} {}: already patched", "⊙".yellow(), report.id);
            }
        }
    }
}

/// The line-oriented summary contract: `patched:` plus a path list when
/// anything changed, `already patched` otherwise (prefixed for the repo
/// group).
fn print_summary(prefix: Option<&str>, reports: &[PatchReport]) {
    let modified = RunReport::modified(reports);
    let label = match prefix {
        Some(prefix) => format!("{prefix} "),
        None => String::new(),
    };

    if modified.is_empty() {
        println!("{label}already patched");
    } else {
        println!("{label}patched:");
        for path in modified {
            println!("- {}", path.display());
        }
    }
}

/// Capture current contents of every catalog target so diffs can be shown
/// after the run. Resolution here mirrors the runner's (same options).
fn snapshot_targets(options: &RunOptions) -> Result<HashMap<PathBuf, String>> {
    let goroot = resolve_goroot(
        options.goroot.as_deref(),
        options.goroot_env.as_deref(),
        &options.go_binary,
        options.introspect_timeout,
    )?;

    let mut contents = HashMap::new();
    let mut targets: Vec<PathBuf> = catalog::toolchain_patches()
        .iter()
        .map(|patch| patch.target(&goroot))
        .collect();
    if let Some(repo_root) = &options.repo {
        targets.extend(
            catalog::repo_patches()
                .iter()
                .map(|patch| patch.target(repo_root)),
        );
    }

    for path in targets {
        if let Ok(content) = fs::read_to_string(&path) {
            contents.insert(path, content);
        }
    }

    Ok(contents)
}

/// Show a unified diff between original and patched content.
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}
