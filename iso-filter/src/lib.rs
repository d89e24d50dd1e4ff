pub mod cli;
pub mod core;
pub mod utils;

use anyhow::Context;

use crate::core::FilterSummary;

pub fn lib_iso_filter(args: Vec<String>) -> anyhow::Result<FilterSummary> {
    let args = cli::Args::from(args);
    let summary =
        crate::core::filter_isoforms(args.command).context("ERROR: Failed to filter isoforms")?;

    Ok(summary)
}
