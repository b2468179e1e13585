#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs_core::{FormatOptions, Inspection, MountOptions, NodeFs, RecoveryReport, mkfs};
use cfs_types::{ObjectId, SlotNumber};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct OrphanOutput {
    identity: u64,
    generation: u32,
    name: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "mkfs" => {
            let Some(image) = rest.first() else {
                bail!("mkfs requires <image>");
            };
            let options = format_options(&rest[1..])?;
            mkfs_cmd(Path::new(image), &options)
        }
        "inspect" => {
            let [image, identity, ..] = rest.as_slice() else {
                bail!("inspect requires <image> <identity>");
            };
            let id = ObjectId(parse_number(identity, "identity")?);
            inspect_cmd(Path::new(image), id, has_flag(&rest, "--json"))
        }
        "orphans" => {
            let [image, slot, ..] = rest.as_slice() else {
                bail!("orphans requires <image> <slot>");
            };
            let slot = SlotNumber(parse_number(slot, "slot")?);
            orphans_cmd(Path::new(image), slot, has_flag(&rest, "--json"))
        }
        "recover" => {
            let [image, slot, ..] = rest.as_slice() else {
                bail!("recover requires <image> <slot>");
            };
            let slot = SlotNumber(parse_number(slot, "slot")?);
            recover_cmd(Path::new(image), slot, has_flag(&rest, "--json"))
        }
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
    println!("cfs-cli\n");
    println!("USAGE:");
    println!(
        "  cfs-cli mkfs <image> [--blocks N] [--slots N] [--block-size N] [--clusters N]"
    );
    println!("  cfs-cli inspect <image> <identity> [--json]");
    println!("  cfs-cli orphans <image> <slot> [--json]");
    println!("  cfs-cli recover <image> <slot> [--json]");
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn parse_number<T: FromStr>(raw: &str, what: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse()
        .with_context(|| format!("invalid {what}: {raw:?}"))
}

/// Value following `flag`, if present.
fn flag_value<T: FromStr>(args: &[String], flag: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(pos + 1) else {
        bail!("{flag} requires a value");
    };
    parse_number(raw, flag).map(Some)
}

fn format_options(args: &[String]) -> Result<FormatOptions> {
    let defaults = FormatOptions::default();
    Ok(FormatOptions {
        block_size: flag_value(args, "--block-size")?.unwrap_or(defaults.block_size),
        block_count: flag_value(args, "--blocks")?.unwrap_or(defaults.block_count),
        slot_count: flag_value(args, "--slots")?.unwrap_or(defaults.slot_count),
        total_clusters: flag_value(args, "--clusters")?.unwrap_or(defaults.total_clusters),
        ..defaults
    })
}

fn open(path: &Path) -> Result<std::sync::Arc<NodeFs>> {
    NodeFs::open_image(path, MountOptions::default())
        .with_context(|| format!("failed to open image {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn mkfs_cmd(path: &Path, options: &FormatOptions) -> Result<()> {
    let sb = mkfs(path, options)
        .with_context(|| format!("failed to format {}", path.display()))?;
    println!("formatted {}", path.display());
    println!("block_size: {}", sb.block_size);
    println!("block_count: {}", sb.block_count);
    println!("slot_count: {}", sb.slot_count);
    println!("root: {}", sb.root);
    println!("total_clusters: {}", sb.total_clusters);
    Ok(())
}

fn inspect_cmd(path: &Path, id: ObjectId, json: bool) -> Result<()> {
    let fs = open(path)?;
    let inspection: Inspection = fs
        .inspect(id)
        .with_context(|| format!("failed to read object {id}"))?;
    if json {
        return print_json(&inspection);
    }
    let record = &inspection.record;
    println!("object: {}", record.identity);
    match &inspection.problem {
        None => println!("status: valid"),
        Some(problem) => println!("status: rejected ({problem})"),
    }
    println!("flags: {:#x}", record.flags);
    println!("dynamic_flags: {:#x}", record.dynamic_flags);
    println!("mode: {:o}", record.mode);
    println!("link_count: {}", record.link_count);
    println!("size: {}", record.size);
    println!("clusters: {}", record.cluster_count);
    println!("generation: {}", record.generation);
    println!("owning_slot: {}", record.owning_slot);
    if record.is_orphaned() {
        println!("orphaned_slot: {}", record.orphaned_slot);
    }
    if record.deletion_time != 0 {
        println!("deletion_time: {}", record.deletion_time);
    }
    Ok(())
}

fn orphans_cmd(path: &Path, slot: SlotNumber, json: bool) -> Result<()> {
    let fs = open(path)?;
    let entries: Vec<OrphanOutput> = fs
        .scan_orphans(slot)
        .with_context(|| format!("failed to scan orphan directory of slot {slot}"))?
        .into_iter()
        .map(|entry| OrphanOutput {
            identity: entry.identity.0,
            generation: entry.generation,
            name: entry.name(),
        })
        .collect();
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("slot {slot}: no orphans");
    }
    for entry in &entries {
        println!("{}", entry.name);
    }
    Ok(())
}

fn recover_cmd(path: &Path, slot: SlotNumber, json: bool) -> Result<()> {
    let fs = open(path)?;
    let report: RecoveryReport = fs
        .recover_orphans(slot)
        .with_context(|| format!("failed to recover slot {slot}"))?;
    if json {
        print_json(&report)?;
    } else {
        println!("slot {slot}: {} orphans scanned", report.scanned);
        println!("deleted: {}", report.deleted.len());
        println!("deferred: {}", report.deferred.len());
        println!("skipped: {}", report.skipped.len());
        for (id, error) in &report.failed {
            println!("failed: {id}: {error}");
        }
    }
    if !report.is_clean() {
        bail!("{} orphans could not be deleted", report.failed.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn format_flags_override_defaults() {
        let options =
            format_options(&args(&["--blocks", "1024", "--slots", "2"])).expect("options");
        assert_eq!(options.block_count, 1024);
        assert_eq!(options.slot_count, 2);
        assert_eq!(options.block_size, FormatOptions::default().block_size);
    }

    #[test]
    fn bad_flag_values_are_reported() {
        assert!(format_options(&args(&["--blocks"])).is_err());
        assert!(format_options(&args(&["--slots", "many"])).is_err());
        assert!(format_options(&args(&["--slots", "70000"])).is_err());
    }

    #[test]
    fn json_flag_is_found_anywhere() {
        assert!(has_flag(&args(&["img", "4", "--json"]), "--json"));
        assert!(!has_flag(&args(&["img", "4"]), "--json"));
    }
}
