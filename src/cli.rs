//! Command-line interface definitions using clap.

use crate::backend::BackendChoice;
use crate::config::{
    DEFAULT_FPS, DEFAULT_FRAMES, DEFAULT_NODES_PER_UNIVERSE, DEFAULT_QUEUE_LEN, DEFAULT_UNIVERSES,
    PipelineConfig, default_shm_key, default_worker_count,
};
use crate::output::{OutputFormat, TableOptions};
use crate::render::PatternKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::num::ParseIntError;
use std::path::PathBuf;

/// Render pixel frames in parallel worker processes and stream them to an
/// output device through shared memory.
#[derive(Parser, Debug)]
#[command(name = "pixelpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`, if any.
    pub fn log_filter(&self) -> Option<String> {
        if self.quiet {
            return Some("error".into());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".into()),
            2 => Some("debug".into()),
            _ => Some("trace".into()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream a frame sequence through worker processes.
    Run(RunArgs),

    /// Show the shared-memory layout and worker partitions for a configuration.
    Layout(LayoutArgs),

    /// Internal: run as a worker process (started by `run`).
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "pixelpipe",
            &mut std::io::stdout(),
        );
    }
}

/// Accept segment keys in decimal or `0x` hex.
fn parse_key(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Options that determine the shared segment's shape.
#[derive(Args, Debug, Clone)]
pub struct LayoutOptions {
    /// Number of output universes.
    #[arg(short, long, env = "PIXELPIPE_UNIVERSES", default_value_t = DEFAULT_UNIVERSES)]
    pub universes: u32,

    /// Maximum nodes per universe.
    #[arg(short, long, env = "PIXELPIPE_NODES", default_value_t = DEFAULT_NODES_PER_UNIVERSE)]
    pub nodes: u32,

    /// Frame slots in the shared ring.
    #[arg(long, env = "PIXELPIPE_QUEUE_LEN", default_value_t = DEFAULT_QUEUE_LEN)]
    pub queue_len: u32,

    /// Worker processes; 0 renders inline on the master (default: cores - 1).
    #[arg(short, long, env = "PIXELPIPE_WORKERS")]
    pub workers: Option<u32>,

    /// Shared segment key, decimal or 0x-prefixed hex (default: derived from --nodes).
    #[arg(long, env = "PIXELPIPE_SHM_KEY", value_parser = parse_key)]
    pub shm_key: Option<u32>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Use ASCII table borders instead of Unicode.
    #[arg(long)]
    pub ascii: bool,
}

impl LayoutOptions {
    fn apply(&self, config: &mut PipelineConfig) {
        config.universes = self.universes;
        config.nodes_per_universe = self.nodes;
        config.queue_len = self.queue_len;
        config.workers = self.workers.unwrap_or_else(default_worker_count);
        config.shm_key = self.shm_key.unwrap_or_else(|| default_shm_key(self.nodes));
    }

    pub fn table_options(&self) -> TableOptions {
        TableOptions { ascii: self.ascii }
    }
}

#[derive(Parser, Debug)]
pub struct LayoutArgs {
    #[command(flatten)]
    pub layout: LayoutOptions,
}

impl LayoutArgs {
    pub fn to_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        self.layout.apply(&mut config);
        config
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub layout: LayoutOptions,

    /// Sequence length in frames.
    #[arg(long, env = "PIXELPIPE_FRAMES", default_value_t = DEFAULT_FRAMES)]
    pub frames: u32,

    /// Target frame rate.
    #[arg(long, env = "PIXELPIPE_FPS", default_value_t = DEFAULT_FPS)]
    pub fps: f64,

    /// Content generator.
    #[arg(
        short,
        long,
        value_enum,
        env = "PIXELPIPE_PATTERN",
        default_value_t = PatternKind::PinFinder
    )]
    pub pattern: PatternKind,

    /// Write per-frame digests to this file instead of the headless output.
    #[arg(long, env = "PIXELPIPE_DUMP")]
    pub dump: Option<PathBuf>,

    /// Make the output close on its own after N frames.
    #[arg(long, value_name = "N")]
    pub close_after: Option<u32>,

    /// Give up if a frame is not ready after this many polls.
    #[arg(long, env = "PIXELPIPE_STALL_LIMIT", value_name = "POLLS")]
    pub stall_limit: Option<u32>,
}

impl RunArgs {
    pub fn to_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        self.layout.apply(&mut config);
        config.frames = self.frames;
        config.fps = self.fps;
        config.pattern = self.pattern;
        config.stall_limit = self.stall_limit;
        config
    }

    pub fn backend_choice(&self) -> BackendChoice {
        match &self.dump {
            Some(path) => BackendChoice::Dump(path.clone()),
            None => BackendChoice::Headless,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("0xfeed0470").unwrap(), 0xfeed_0470);
        assert_eq!(parse_key("0XFF").unwrap(), 255);
        assert_eq!(parse_key("1234").unwrap(), 1234);
        assert!(parse_key("0xzz").is_err());
    }

    #[test]
    fn test_run_args_to_config() {
        let cli = Cli::try_parse_from([
            "pixelpipe", "run", "--workers", "3", "--frames", "10", "--fps", "60", "--universes",
            "12", "--nodes", "100", "--queue-len", "8", "--shm-key", "0x1234", "--pattern",
            "checker", "--stall-limit", "50",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.to_config();
        assert_eq!(config.workers, 3);
        assert_eq!(config.frames, 10);
        assert_eq!(config.fps, 60.0);
        assert_eq!(config.universes, 12);
        assert_eq!(config.nodes_per_universe, 100);
        assert_eq!(config.queue_len, 8);
        assert_eq!(config.shm_key, 0x1234);
        assert_eq!(config.pattern, PatternKind::Checker);
        assert_eq!(config.stall_limit, Some(50));
        assert_eq!(args.backend_choice(), BackendChoice::Headless);
    }

    #[test]
    fn test_default_key_follows_nodes() {
        let cli = Cli::try_parse_from(["pixelpipe", "layout", "--nodes", "300"]).unwrap();
        let Commands::Layout(args) = cli.command else {
            panic!("expected layout");
        };
        assert_eq!(args.to_config().shm_key, 0xfeed_012c);
    }

    #[test]
    fn test_dump_selects_dump_backend() {
        let cli = Cli::try_parse_from(["pixelpipe", "run", "--dump", "/tmp/frames.jsonl"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            args.backend_choice(),
            BackendChoice::Dump(PathBuf::from("/tmp/frames.jsonl"))
        );
    }

    #[test]
    fn test_verbosity_filters() {
        let cli = Cli::try_parse_from(["pixelpipe", "-vv", "layout"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("debug"));
        let cli = Cli::try_parse_from(["pixelpipe", "layout", "-q"]).unwrap();
        assert_eq!(cli.log_filter().as_deref(), Some("error"));
        let cli = Cli::try_parse_from(["pixelpipe", "layout"]).unwrap();
        assert_eq!(cli.log_filter(), None);
        assert!(Cli::try_parse_from(["pixelpipe", "-q", "-v", "layout"]).is_err());
    }
}
