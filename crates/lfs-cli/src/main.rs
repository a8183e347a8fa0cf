#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use lfs::{GcLevels, Geometry};
use lfs_harness::{WorkloadConfig, WorkloadReport, run_workload};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// `LFS_LOG` takes an env-filter directive; warnings only by default.
fn init_logging() {
    let filter = EnvFilter::try_from_env("LFS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "simulate" => simulate(&rest),
        "levels" => levels(&rest),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("lfs\n");
    println!("USAGE:");
    println!("  lfs simulate [--config <workload.json>] [--seed <n>] [--ops <n>] [--json]");
    println!("  lfs levels [--config <workload.json>] [--bad-sections <n>]");
    println!();
    println!("Set LFS_LOG (e.g. LFS_LOG=lfs::gc=debug) to see component logs.");
}

// ── Argument parsing ────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
struct Flags {
    config: Option<String>,
    seed: Option<u64>,
    ops: Option<u64>,
    bad_sections: u32,
    json: bool,
}

fn parse_flags(args: &[String]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--config" => flags.config = Some(value("--config")?),
            "--seed" => flags.seed = Some(parse_u64(&value("--seed")?)?),
            "--ops" => flags.ops = Some(parse_u64(&value("--ops")?)?),
            "--bad-sections" => {
                flags.bad_sections = value("--bad-sections")?
                    .parse()
                    .context("--bad-sections expects a count")?;
            }
            "--json" => flags.json = true,
            other => bail!("unknown flag: {other}"),
        }
    }
    Ok(flags)
}

/// Decimal, or hex with a `0x` prefix.
fn parse_u64(raw: &str) -> Result<u64> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("invalid number: {raw}"))
}

fn load_config(path: Option<&str>) -> Result<WorkloadConfig> {
    let Some(path) = path else {
        return Ok(WorkloadConfig::default());
    };
    read_config(Path::new(path))
}

fn read_config(path: &Path) -> Result<WorkloadConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

// ── Commands ────────────────────────────────────────────────────────────────

fn simulate(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let mut config = load_config(flags.config.as_deref())?;
    if let Some(seed) = flags.seed {
        config.seed = seed;
    }
    if let Some(ops) = flags.ops {
        config.operations = ops;
    }
    config
        .volume
        .validate(&config.geometry)
        .context("invalid volume configuration")?;

    let report = run_workload(&config)?;
    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print_report(&report);
    }
    if !report.passed {
        bail!("workload failed with seed {:#x}", report.seed);
    }
    Ok(())
}

fn print_report(report: &WorkloadReport) {
    let verdict = if report.passed { "PASS" } else { "FAIL" };
    println!("workload seed {:#x}: {verdict}", report.seed);
    println!(
        "  operations   {} of {} requested",
        report.operations_executed, report.operations
    );
    for (op, count) in &report.op_mix {
        println!("    {op:<12} {count}");
    }
    println!("  live objects {}", report.live_objects);
    println!("  no space     {}", report.enospc);
    println!("  busy         {}", report.busy);
    let usage = &report.stats.usage;
    println!(
        "  sections     {} free, {} dirty, {} prefree",
        usage.free_sections, usage.dirty_sections, usage.prefree_sections
    );
    let totals = &report.totals;
    println!("  mounts       {}", totals.mounts);
    println!(
        "  gc           {} runs, {} sections freed, {} blocks moved",
        totals.gc_runs, totals.sections_freed, totals.blocks_moved
    );
    println!(
        "  checkpoints  {} committed, {} segments freed",
        totals.checkpoints, totals.freed_segments
    );
    println!("  trimmed      {} blocks", totals.trimmed_blocks);
    println!("  elapsed      {} us", report.duration_us);
    if let Some(failure) = &report.failure {
        println!("  failure      {failure}");
    }
}

#[derive(Debug, Serialize)]
struct LevelsOutput {
    geometry: Geometry,
    bad_sections: u32,
    levels: GcLevels,
}

fn levels(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let config = load_config(flags.config.as_deref())?;
    let levels = GcLevels::compute(&config.geometry, flags.bad_sections)
        .context("compute GC thresholds")?;
    let output = LevelsOutput {
        geometry: config.geometry,
        bad_sections: flags.bad_sections,
        levels,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("serialize levels")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn flags_parse_numbers_and_switches() {
        let flags =
            parse_flags(&strings(&["--seed", "0x10", "--ops", "500", "--json"])).expect("parse");
        assert_eq!(flags.seed, Some(16));
        assert_eq!(flags.ops, Some(500));
        assert!(flags.json);
        assert_eq!(flags.config, None);
    }

    #[test]
    fn flags_reject_missing_values_and_unknown_switches() {
        assert!(parse_flags(&strings(&["--seed"])).is_err());
        assert!(parse_flags(&strings(&["--seed", "abc"])).is_err());
        assert!(parse_flags(&strings(&["--frobnicate"])).is_err());
    }

    #[test]
    fn config_file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"seed": 42, "operations": 900, "volume": {{"emergency_gc": false}}}}"#
        )
        .expect("write");
        let config = read_config(file.path()).expect("load");
        assert_eq!(config.seed, 42);
        assert_eq!(config.operations, 900);
        assert!(!config.volume.emergency_gc);
        assert_eq!(config.block_size, WorkloadConfig::default().block_size);
    }

    #[test]
    fn malformed_config_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{ not json").expect("write");
        let err = read_config(file.path()).expect_err("parse");
        assert!(format!("{err:#}").contains("failed to parse"));
    }
}
