//! Rendering of run reports and segment layouts.

pub mod json;
pub mod plain;
pub mod table;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::partition::{WorkerPartition, partition_table};
use crate::shm::layout::Layout;
use crate::shm::segment_name;
use crate::pipeline::RunReport;
use clap::ValueEnum;
use serde::Serialize;

/// Output format options.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored table output
    #[default]
    Table,
    Json,
    /// Plain text, no colors
    Plain,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions {
    /// Use ASCII borders instead of Unicode.
    pub ascii: bool,
}

/// Everything `pixelpipe layout` shows about a configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutSummary {
    pub segment: String,
    pub shm_key: u32,
    pub queue_len: u32,
    pub universes: u32,
    pub nodes_per_universe: u32,
    pub workers: u32,
    pub all_ready: u64,
    pub header_bytes: usize,
    pub control_offset: usize,
    pub control_bytes: usize,
    pub pixel_offset: usize,
    pub slot_bytes: usize,
    pub total_bytes: usize,
    pub partitions: Vec<WorkerPartition>,
}

impl LayoutSummary {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let overflow = || PipelineError::InvalidConfig("segment size overflows".into());
        Ok(Self {
            segment: segment_name(config.shm_key),
            shm_key: config.shm_key,
            queue_len: layout.queue_len,
            universes: layout.universes,
            nodes_per_universe: layout.nodes_per_universe,
            workers: layout.worker_count,
            all_ready: layout.all_ready(),
            header_bytes: Layout::HEADER_BYTES,
            control_offset: layout.control_offset(),
            control_bytes: layout.control_bytes(),
            pixel_offset: layout.pixel_offset(),
            slot_bytes: layout.slot_bytes().ok_or_else(overflow)?,
            total_bytes: layout.total_bytes().ok_or_else(overflow)?,
            partitions: partition_table(config.universes, config.workers)?,
        })
    }
}

pub fn print_report(report: &RunReport, format: OutputFormat, options: TableOptions) {
    let text = match format {
        OutputFormat::Table => table::report_table(report, options),
        OutputFormat::Json => json::to_json(report),
        OutputFormat::Plain => plain::report_plain(report),
    };
    println!("{}", text);
}

pub fn print_layout(summary: &LayoutSummary, format: OutputFormat, options: TableOptions) {
    let text = match format {
        OutputFormat::Table => table::layout_table(summary, options),
        OutputFormat::Json => json::to_json(summary),
        OutputFormat::Plain => plain::layout_plain(summary),
    };
    println!("{}", text);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_summary_scenario() {
        let config = PipelineConfig {
            universes: 24,
            nodes_per_universe: 1136,
            queue_len: 4,
            workers: 3,
            shm_key: 0xfeed_0470,
            ..PipelineConfig::default()
        };
        let summary = LayoutSummary::new(&config).unwrap();
        assert_eq!(summary.segment, "/pixelpipe-feed0470");
        assert_eq!(summary.all_ready, 0b111);
        assert_eq!(summary.slot_bytes, 24 * 1136 * 4);
        assert_eq!(summary.pixel_offset, 64 + 4 * 64);
        assert_eq!(summary.total_bytes, summary.pixel_offset + 4 * summary.slot_bytes);
        let ranges: Vec<_> = summary.partitions.iter().map(|p| p.universes()).collect();
        assert_eq!(ranges, vec![0..8, 8..16, 16..24]);
    }

    #[test]
    fn test_layout_summary_rejects_invalid_config() {
        let config = PipelineConfig {
            queue_len: 1,
            ..PipelineConfig::default()
        };
        assert!(LayoutSummary::new(&config).is_err());
    }
}
