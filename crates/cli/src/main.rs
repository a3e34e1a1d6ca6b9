use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand, ValueEnum};
use recovereasy_core::{
    classify, collect_doctor_info, diagnose, run_copy_batch, run_remux_batch,
    run_scan_with_callback, BatchControl, BatchReport, Catalog, EngineConfig, Entry, Handle,
    HealthStatus, LocalFsProvider, MediaKind, ProgressEvent, StorageProvider,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "recovereasy",
    version,
    about = "Check, copy and repair photos and videos on damaged SD cards and USB drives."
)]
struct Cli {
    /// Engine configuration (JSON). Flags override individual values.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk a card, classify and health-check every file, and write a JSON catalog.
    Scan(ScanArgs),
    /// Health-check a single file.
    Check(CheckArgs),
    /// Copy entries from a catalog to a destination folder.
    Copy(CopyArgs),
    /// Repair damaged videos from a catalog into a destination folder.
    Repair(RepairArgs),
    /// Show environment and candidate source volumes.
    Doctor,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliStatus {
    Ok,
    Suspect,
    Corrupt,
}

impl From<CliStatus> for HealthStatus {
    fn from(value: CliStatus) -> Self {
        match value {
            CliStatus::Ok => HealthStatus::Ok,
            CliStatus::Suspect => HealthStatus::Suspect,
            CliStatus::Corrupt => HealthStatus::Corrupt,
        }
    }
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Root folder of the card or drive.
    #[arg(long, value_name = "PATH")]
    root: PathBuf,

    /// Output catalog path.
    #[arg(long, default_value = "recovereasy-catalog.json", value_name = "FILE")]
    output: PathBuf,

    /// Maximum directory depth below the root.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Exclude glob patterns or name substrings (repeatable).
    #[arg(long = "exclude", value_name = "GLOB", num_args = 1.., action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Print progress events while scanning.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// File to check.
    path: PathBuf,
}

#[derive(Debug, Args)]
struct SelectionArgs {
    /// Catalog written by `scan`.
    #[arg(long, default_value = "recovereasy-catalog.json", value_name = "FILE")]
    catalog: PathBuf,

    /// Destination folder; must exist and be writable.
    #[arg(long, value_name = "DIR")]
    destination: PathBuf,

    /// Only these identifiers (repeatable). Defaults to the whole catalog.
    #[arg(long = "id", value_name = "ID", num_args = 1.., action = ArgAction::Append)]
    ids: Vec<String>,

    /// Only entries with these health statuses (repeatable).
    #[arg(long = "status", value_name = "STATUS", num_args = 1.., action = ArgAction::Append)]
    statuses: Vec<CliStatus>,

    /// Optional JSON output file for the batch report.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Print progress events while working.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct CopyArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Re-read each copy and compare blake3 digests.
    #[arg(long)]
    verify: bool,
}

#[derive(Debug, Args)]
struct RepairArgs {
    #[command(flatten)]
    selection: SelectionArgs,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    path: String,
    content_type: String,
    kind: MediaKind,
    status: HealthStatus,
    format: Option<String>,
    note: Option<String>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan(args) => run_scan_command(args, config),
        Commands::Check(args) => run_check_command(args, &config),
        Commands::Copy(args) => run_copy_command(args, config),
        Commands::Repair(args) => run_repair_command(args, &config),
        Commands::Doctor => {
            run_doctor_command();
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn run_scan_command(args: ScanArgs, mut config: EngineConfig) -> Result<()> {
    if let Some(max_depth) = args.max_depth {
        config.walk.max_depth = max_depth;
    }
    config.walk.excludes.extend(args.exclude);
    config.validate()?;

    let provider = LocalFsProvider::new();
    let root = Handle::new(args.root.to_string_lossy());
    let catalog = run_scan_with_callback(
        &provider,
        &root,
        &config,
        &BatchControl::default(),
        progress_printer(args.progress),
    )?;

    write_json(&args.output, &catalog, "catalog")?;
    let summary = catalog.summary();
    println!("Catalog written to {}", args.output.display());
    println!(
        "Found {} file(s), {}: {} image(s), {} video(s), {} other.",
        summary.total,
        human_bytes(summary.total_bytes),
        summary.images,
        summary.videos,
        summary.others
    );
    println!(
        "Health: {} ok, {} suspect, {} corrupt. {} warning(s).",
        summary.ok,
        summary.suspect,
        summary.corrupt,
        catalog.warnings.len()
    );
    for entry in catalog
        .entries
        .iter()
        .filter(|entry| entry.status != HealthStatus::Ok)
    {
        println!(
            "- [{}] {}: {}",
            entry.status.label(),
            entry.identifier,
            entry.health_note.as_deref().unwrap_or("no details")
        );
    }
    Ok(())
}

fn run_check_command(args: CheckArgs, config: &EngineConfig) -> Result<()> {
    let provider = LocalFsProvider::new();
    let handle = Handle::new(args.path.to_string_lossy());
    let name = args
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| handle.to_string());
    let declared = provider.declared_type(&handle).unwrap_or_default();
    let classification = classify(&name, &declared);

    let mut stream = provider
        .open_read(&handle)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let diagnosis = diagnose(
        classification.kind,
        &classification.content_type,
        &mut *stream,
        &config.health,
    )
    .with_context(|| format!("failed to read {}", args.path.display()))?;

    let output = CheckOutput {
        path: handle.to_string(),
        content_type: classification.content_type,
        kind: classification.kind,
        status: diagnosis.status,
        format: diagnosis.format.map(|format| format.label().to_string()),
        note: diagnosis.note,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("failed to serialize check result")?
    );
    Ok(())
}

fn run_copy_command(args: CopyArgs, mut config: EngineConfig) -> Result<()> {
    if args.verify {
        config.copy.verify_digest = true;
    }
    config.validate()?;

    let provider = LocalFsProvider::new();
    let selection = &args.selection;
    let entries = select_entries(selection, |_| true)?;
    let destination = Handle::new(selection.destination.to_string_lossy());
    let report = run_copy_batch(
        &provider,
        &entries,
        &destination,
        &config.copy,
        &BatchControl::default(),
        progress_printer(selection.progress),
    )?;
    print_report(&report, selection.report.as_deref())
}

fn run_repair_command(args: RepairArgs, config: &EngineConfig) -> Result<()> {
    let provider = LocalFsProvider::new();
    let selection = &args.selection;
    let entries = select_entries(selection, |entry| entry.kind == MediaKind::Video)?;
    let destination = Handle::new(selection.destination.to_string_lossy());
    let report = run_remux_batch(
        &provider,
        &entries,
        &destination,
        &config.health,
        &config.copy,
        &BatchControl::default(),
        progress_printer(selection.progress),
    )?;
    print_report(&report, selection.report.as_deref())
}

/// Catalog entries matching the selection flags, kept in catalog order.
fn select_entries(
    selection: &SelectionArgs,
    eligible: impl Fn(&Entry) -> bool,
) -> Result<Vec<Entry>> {
    let data = fs::read_to_string(&selection.catalog)
        .with_context(|| format!("failed to read {}", selection.catalog.display()))?;
    let catalog: Catalog = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", selection.catalog.display()))?;

    for id in &selection.ids {
        if catalog.find(&Handle::new(id.as_str())).is_none() {
            bail!("{id} is not in catalog {}", selection.catalog.display());
        }
    }
    let statuses = selection
        .statuses
        .iter()
        .map(|status| HealthStatus::from(*status))
        .collect::<Vec<_>>();

    let entries = catalog
        .entries
        .into_iter()
        .filter(|entry| {
            selection.ids.is_empty() || selection.ids.iter().any(|id| id == entry.identifier.as_str())
        })
        .filter(|entry| statuses.is_empty() || statuses.contains(&entry.status))
        .filter(|entry| eligible(entry))
        .collect::<Vec<_>>();
    if entries.is_empty() {
        bail!("nothing selected from {}", selection.catalog.display());
    }
    Ok(entries)
}

fn print_report(report: &BatchReport, output: Option<&Path>) -> Result<()> {
    for result in &report.results {
        if result.succeeded {
            println!(
                "- ok {} -> {} ({}{})",
                result.identifier,
                result
                    .destination
                    .as_ref()
                    .map(|handle| handle.to_string())
                    .unwrap_or_default(),
                human_bytes(result.bytes_written),
                result
                    .repair
                    .map(|method| format!(", {method:?}"))
                    .unwrap_or_default()
            );
        } else {
            println!(
                "- failed {}: {} {}",
                result.identifier,
                result
                    .failure
                    .map(|reason| reason.to_string())
                    .unwrap_or_default(),
                result.detail.as_deref().unwrap_or("")
            );
        }
    }
    println!(
        "{:?} batch {}: {} succeeded, {} failed, {} not attempted.",
        report.kind,
        report.batch_id,
        report.succeeded(),
        report.failed(),
        report.not_attempted.len()
    );

    if let Some(path) = output {
        write_json(path, report, "batch report")?;
        println!("Batch report written to {}", path.display());
    }
    Ok(())
}

fn progress_printer(enabled: bool) -> impl FnMut(ProgressEvent) {
    move |event| {
        if enabled {
            eprintln!(
                "[{:>3}%] {:?} {}/{} {}",
                event.percent,
                event.phase,
                event.completed,
                event.total,
                event.current.unwrap_or_default()
            );
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    let payload =
        serde_json::to_string_pretty(value).with_context(|| format!("failed to serialize {what}"))?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write {what} to {}", path.display()))
}

fn run_doctor_command() {
    let info = collect_doctor_info();
    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    println!("Detected volumes: {}", info.volumes.len());
    for volume in info.volumes {
        println!(
            "- {} [{}] fs={} total={} free={} removable={}{}",
            volume.name,
            volume.mount_point,
            volume.file_system,
            human_bytes(volume.total_space_bytes),
            human_bytes(volume.free_space_bytes),
            volume.is_removable,
            if volume.candidate_source {
                " (candidate source)"
            } else {
                ""
            }
        );
    }
    for note in info.notes {
        println!("Note: {}", note);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{human_bytes, Cli, Commands};

    #[test]
    fn human_bytes_scales_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512.0 B");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn parses_repair_selection() {
        let cli = Cli::try_parse_from([
            "recovereasy",
            "repair",
            "--destination",
            "/tmp/out",
            "--id",
            "/card/a.mp4",
            "--status",
            "suspect",
            "corrupt",
        ])
        .expect("parse");
        match cli.command {
            Commands::Repair(args) => {
                assert_eq!(args.selection.ids, vec!["/card/a.mp4".to_string()]);
                assert_eq!(args.selection.statuses.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
