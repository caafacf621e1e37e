use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use holdfast::config::{self, HoldfastConfig};
use holdfast::ui::{self, Icons, Spinner};
use holdfast::Database;

use crate::{emit_success, OutputMode};

fn open(root: &Path, config: HoldfastConfig) -> anyhow::Result<Database> {
    Database::open(root, config).with_context(|| format!("failed to open database at {}", root.display()))
}

pub fn run_init(mode: OutputMode, path: &Path, force: bool) -> anyhow::Result<()> {
    config::write_config(path, &HoldfastConfig::default(), force)?;
    if mode.is_human() {
        ui::success(&format!("Wrote default configuration to {}", path.display()));
    }
    emit_success(mode, "init", serde_json::json!({ "path": path.display().to_string() }))
}

pub fn run_stats(mode: OutputMode, root: &Path, config: HoldfastConfig) -> anyhow::Result<()> {
    let db = open(root, config)?;
    let stats = db.stats()?;
    let size = std::fs::metadata(config::database_path(root)).map(|m| m.len()).unwrap_or(0);

    if mode.is_human() {
        ui::header(&format!("Holdfast database at {}", root.display()));
        if stats.tables.is_empty() {
            ui::summary_row("tables", "none");
        } else {
            println!("{}", ui::tables_table(&stats));
        }
        ui::section("Storage");
        println!(
            "{}",
            ui::metrics_table(&[
                ("Database file", ui::human_bytes(size)),
                ("Large-object files", stats.lob_files.to_string()),
                ("Referenced large objects", stats.referenced_lobs.to_string()),
                ("Pending deletions", stats.pending_deletions.to_string()),
                ("Max connections", db.config().max_connections.to_string()),
                ("Open connections", stats.pool.open.to_string()),
            ])
        );
    }
    let tables: Vec<_> = stats
        .tables
        .iter()
        .map(|(name, rows)| serde_json::json!({ "table": name, "rows": rows }))
        .collect();
    emit_success(
        mode,
        "stats",
        serde_json::json!({
            "tables": tables,
            "database_bytes": size,
            "lob_files": stats.lob_files,
            "referenced_lobs": stats.referenced_lobs,
            "pending_deletions": stats.pending_deletions,
        }),
    )?;
    db.close()?;
    Ok(())
}

pub fn run_compact(mode: OutputMode, root: &Path, config: HoldfastConfig, force: bool) -> anyhow::Result<()> {
    let db = open(root, config)?;
    let started = Instant::now();
    let spinner = Spinner::new("Compacting");
    // A due compaction already ran when the database was opened.
    let report = match db.compaction_at_open() {
        Some(report) => Ok(Some(report)),
        None => db.compact(force),
    };
    spinner.finish();
    let report = report?;

    if mode.is_human() {
        match &report {
            Some(r) => {
                ui::success("Compaction complete");
                ui::status(
                    Icons::SHRINK,
                    "size",
                    &format!("{} -> {}", ui::human_bytes(r.size_before), ui::human_bytes(r.size_after)),
                );
                ui::timing(started.elapsed());
            }
            None => ui::info(
                "compaction",
                &format!(
                    "not due (interval {} days); use --force",
                    db.config().compaction_interval_days
                ),
            ),
        }
    }
    emit_success(
        mode,
        "compact",
        serde_json::json!({
            "compacted": report.is_some(),
            "size_before": report.map(|r| r.size_before),
            "size_after": report.map(|r| r.size_after),
        }),
    )?;
    db.close()?;
    Ok(())
}

pub fn run_recover(mode: OutputMode, root: &Path, config: HoldfastConfig) -> anyhow::Result<()> {
    let db = open(root, config)?;
    let report = db.recovery_report().clone();
    let stats = db.stats()?;

    if mode.is_human() {
        ui::header("Journal recovery");
        ui::status(Icons::ERASE, "replayed deletions", &report.replayed.to_string());
        ui::status(Icons::JOURNAL, "discarded (still referenced)", &report.discarded.to_string());
        if report.skipped > 0 {
            ui::warn(&format!("{} corrupt journal records skipped", report.skipped));
        }
        ui::status(
            Icons::BLOB,
            "large objects",
            &format!("{} files, {} referenced", stats.lob_files, stats.referenced_lobs),
        );
    }
    emit_success(
        mode,
        "recover",
        serde_json::json!({
            "replayed": report.replayed,
            "discarded": report.discarded,
            "skipped": report.skipped,
            "lob_files": stats.lob_files,
        }),
    )?;
    db.close()?;
    Ok(())
}

pub fn run_erase(mode: OutputMode, root: &Path, config: HoldfastConfig) -> anyhow::Result<()> {
    let db = open(root, config)?;
    let before = db.stats()?;
    db.erase()?;
    if mode.is_human() {
        ui::success(&format!(
            "Erased {} tables and {} large objects",
            before.tables.len(),
            before.lob_files
        ));
    }
    emit_success(
        mode,
        "erase",
        serde_json::json!({ "tables": before.tables.len(), "lob_files": before.lob_files }),
    )?;
    db.close()?;
    Ok(())
}
