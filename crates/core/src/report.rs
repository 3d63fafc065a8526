//! Run totals and their presentation.
//!
//! Totals are computed once, after every worker has returned its spec.
//! Presentation is either a table or a log summary, chosen by
//! configuration.

use std::io::Write;
use std::time::Duration;

use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use tracing::info;

use crate::config::MirrorConfig;
use crate::models::{ItemStatus, MirrorSpec, Outcome};

const HEADER: [&str; 4] = ["Source Image", "Destination", "Tag", "Status"];

/// Counters of one run. `processed` is always `succeeded + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunTotals {
    pub fn tally(specs: &[MirrorSpec]) -> Self {
        let mut totals = Self {
            total: specs.len(),
            ..Self::default()
        };
        for status in specs.iter().filter_map(|s| s.status.as_ref()) {
            match status.outcome() {
                Outcome::Succeeded => totals.succeeded += 1,
                Outcome::Failed => totals.failed += 1,
                Outcome::Skipped => {}
            }
        }
        totals.processed = totals.succeeded + totals.failed;
        totals
    }
}

/// Finished specs of a run, in dispatch order, with their totals.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub specs: Vec<MirrorSpec>,
    pub totals: RunTotals,
    pub elapsed: Duration,
}

/// How results are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    Table,
    Log,
}

impl ReportMode {
    pub fn from_config(config: &MirrorConfig) -> Self {
        if config.sync.render_table {
            Self::Table
        } else {
            Self::Log
        }
    }
}

impl SyncReport {
    pub fn new(specs: Vec<MirrorSpec>, elapsed: Duration) -> Self {
        let totals = RunTotals::tally(&specs);
        Self {
            specs,
            totals,
            elapsed,
        }
    }

    /// Result table with one row per spec and a footer row per total.
    pub fn table(&self) -> Table {
        let mut table = new_table();
        for spec in &self.specs {
            table.add_row(vec![
                Cell::new(&spec.upstream_image),
                Cell::new(&spec.destination_repository),
                Cell::new(&spec.upstream_tag),
                status_cell(spec.status.as_ref()),
            ]);
        }
        let t = &self.totals;
        footer(&mut table, "Total Images Processed", t.processed);
        footer(&mut table, "Total Succeeded", t.succeeded);
        footer(&mut table, "Total Failed", t.failed);
        footer(&mut table, "Total", t.total);
        table
    }

    pub fn log_summary(&self) {
        let t = &self.totals;
        info!("Total Images: {}", t.total);
        info!("Total Images Processed: {}", t.processed);
        info!("Total Mirrors Succeeded: {}", t.succeeded);
        info!("Total Mirrors Failed: {}", t.failed);
    }

    /// Present the report in `mode`. Tables go to `out`; the log summary
    /// goes through `tracing`.
    pub fn present<W: Write>(&self, mode: ReportMode, out: &mut W) -> std::io::Result<()> {
        match mode {
            ReportMode::Table => writeln!(out, "{}", self.table()),
            ReportMode::Log => {
                self.log_summary();
                Ok(())
            }
        }
    }
}

/// Table of a discovered catalog, for `list`.
pub fn catalog_table(specs: &[MirrorSpec]) -> Table {
    let mut table = new_table();
    for spec in specs {
        table.add_row(vec![
            Cell::new(&spec.upstream_image),
            Cell::new(&spec.destination_repository),
            Cell::new(&spec.upstream_tag),
            Cell::new(""),
        ]);
    }
    footer(&mut table, "Total Images to Mirror", specs.len());
    table
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(HEADER.to_vec());
    table
}

fn footer(table: &mut Table, label: &str, value: usize) {
    table.add_row(vec![
        Cell::new(label).add_attribute(Attribute::Bold),
        Cell::new(value),
    ]);
}

fn status_cell(status: Option<&ItemStatus>) -> Cell {
    let Some(status) = status else {
        return Cell::new("");
    };
    let cell = Cell::new(status.to_string());
    match status {
        ItemStatus::Success => cell.fg(Color::Green),
        ItemStatus::DryRun | ItemStatus::DigestUnknown => cell.fg(Color::Yellow),
        ItemStatus::AlreadyMirrored => cell,
        ItemStatus::RepositoryMissing(_)
        | ItemStatus::InvalidParameter(_)
        | ItemStatus::Failed(_) => cell.fg(Color::Red),
    }
}
