use clap::{ArgAction, Args, Parser, Subcommand};
use fanout_source::{Depth, EnumerateOptions, Source};
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fanout", version, about = "Run one command per work item, a few at a time")]
pub struct Cli {
    /// More logging (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Less logging: only warnings and errors.
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
    /// Configuration file (TOML, YAML or JSON) layered over the user's.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a command template once per item.
    ///
    /// Arguments after `--` are the command; each is a template in which
    /// `{{ item }}` is the item and `{{ args.N }}` the N-th `--arg`.
    Run {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        pool: PoolArgs,
        /// Positional parameter, available as `{{ args.0 }}`, `{{ args.1 }}`...
        #[arg(long = "arg", value_name = "VALUE")]
        args: Vec<String>,
        /// Named parameter, available as `{{ NAME }}`.
        #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Working directory for every invocation.
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
        /// Accept a command that never mentions `{{ item }}`.
        #[arg(long)]
        allow_no_item: bool,
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Run a named preset once per item.
    Preset {
        name: String,
        #[command(flatten)]
        source: SourceArgs,
        /// Values for the preset's parameters, in order.
        params: Vec<String>,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// List the available presets.
    Presets,
    /// Remove files whose content duplicates an earlier file.
    Dedup {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        pool: PoolArgs,
        /// `blake3`, `auto`, or a hashing command such as `sha256sum`.
        #[arg(long)]
        hasher: Option<String>,
        /// Report duplicates without removing anything.
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Keep the fingerprint index in this directory while running.
        #[arg(long, value_name = "DIR")]
        scratch_dir: Option<PathBuf>,
        /// Write the duplicate groups to this file as JSON.
        #[arg(long, value_name = "FILE")]
        manifest: Option<PathBuf>,
    },
    /// Remove adjacent duplicate lines from sorted text files, in place.
    Uniq {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        pool: PoolArgs,
    },
}

#[derive(Args)]
pub struct SourceArgs {
    /// A directory, a glob pattern, `@FILE` (one item per line) or `-` (stdin).
    #[arg(value_name = "SOURCE")]
    pub source: String,
    /// Walk directories recursively.
    #[arg(short = 'r', long, conflicts_with = "depth")]
    pub recursive: bool,
    /// Walk directories at most this many levels deep.
    #[arg(long, value_name = "N")]
    pub depth: Option<NonZeroUsize>,
    /// Include directories themselves as items.
    #[arg(long)]
    pub dirs: bool,
    /// Skip hidden entries.
    #[arg(long)]
    pub no_hidden: bool,
}

impl SourceArgs {
    pub fn source(&self) -> Source {
        let depth = match (self.recursive, self.depth) {
            (true, _) => Depth::Recursive,
            (false, Some(n)) => Depth::Limit(n),
            (false, None) => Depth::Children,
        };
        Source::parse(&self.source, depth)
    }

    pub fn options(&self) -> EnumerateOptions {
        EnumerateOptions { include_dirs: self.dirs, include_hidden: !self.no_hidden }
    }
}

#[derive(Args)]
pub struct PoolArgs {
    /// Maximum number of items processed at once [default: number of CPUs].
    #[arg(short = 'j', long, value_name = "K")]
    pub jobs: Option<NonZeroUsize>,
    /// Stop any single item after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Keep at most this many bytes of each item's stdout and stderr [default: 65536].
    #[arg(long, value_name = "BYTES")]
    pub output_limit: Option<usize>,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}
