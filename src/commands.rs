use crate::cli::{Command, PoolArgs, SourceArgs};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use fanout_config::{Config, Loader, Overrides};
use fanout_dedup::{DedupOptions, Fingerprinter};
use fanout_dispatch::{Aggregator, CancellationToken, CommandTask, DispatchEvent, Dispatcher, JobResult, RunReport, RunStatus};
use fanout_source::WorkItem;
use fanout_template::CommandSpec;
use futures::StreamExt;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// How a command finished, as far as the caller's exit status is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Success,
    ItemsFailed,
    Setup,
    NoItems,
    Cancelled,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(match exit {
            Exit::Success => 0,
            Exit::ItemsFailed => 1,
            Exit::Setup => 2,
            Exit::NoItems => 3,
            Exit::Cancelled => 130,
        })
    }
}

impl<O> From<&RunReport<O>> for Exit {
    fn from(report: &RunReport<O>) -> Self {
        if report.status == RunStatus::Cancelled {
            Exit::Cancelled
        } else if report.failed() > 0 {
            Exit::ItemsFailed
        } else {
            Exit::Success
        }
    }
}

/// Everything a subcommand needs besides its own arguments.
pub struct Context {
    pub config_file: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl Context {
    fn config(&self, overrides: Overrides) -> Result<Config> {
        let mut loader = Loader::new();
        if let Some(path) = &self.config_file {
            loader = loader.with_file(path);
        }
        loader.load(&overrides).or_raise(|| ErrorKind::Config)
    }

    fn pool_config(&self, pool: &PoolArgs, hasher: Option<String>) -> Result<Config> {
        self.config(Overrides {
            concurrency: pool.jobs,
            timeout: pool.timeout,
            output_limit: pool.output_limit,
            hasher,
        })
    }

    fn dispatcher(&self, config: &Config, concurrency: NonZeroUsize) -> Dispatcher {
        let dispatcher =
            Dispatcher::new(concurrency).with_timeout(config.timeout()).with_cancellation(self.cancel.clone());
        match config.output_limit {
            Some(bytes) => dispatcher.with_output_limit(bytes),
            None => dispatcher,
        }
    }
}

pub async fn execute(command: Command, context: &Context) -> Result<Exit> {
    match command {
        Command::Run { source, pool, args, vars, cwd, allow_no_item, command } => {
            let config = context.pool_config(&pool, None)?;
            let mut spec = CommandSpec::new(command).or_raise(|| ErrorKind::Template)?.with_args(args);
            for (name, value) in vars {
                spec = spec.with_var(name, value);
            }
            if let Some(cwd) = cwd {
                spec = spec.with_cwd(cwd);
            }
            if !allow_no_item {
                spec = spec.require_item().or_raise(|| ErrorKind::Template)?;
            }
            run_commands(spec, &source, &config, context).await
        },
        Command::Preset { name, source, params, pool } => {
            let config = context.pool_config(&pool, None)?;
            let spec = config.preset(&name).and_then(|p| p.spec(&name, &params)).or_raise(|| ErrorKind::Config)?;
            run_commands(spec, &source, &config, context).await
        },
        Command::Presets => {
            let config = context.config(Overrides::default())?;
            list_presets(&config);
            Ok(Exit::Success)
        },
        Command::Dedup { source, pool, hasher, dry_run, scratch_dir, manifest } => {
            let config = context.pool_config(&pool, hasher)?;
            let options = DedupOptions { dry_run, scratch_dir, manifest };
            dedup(&source, &config, options, context).await
        },
        Command::Uniq { source, pool } => {
            let config = context.pool_config(&pool, None)?;
            uniq(&source, &config, context).await
        },
    }
}

async fn enumerate(source: &SourceArgs) -> Result<Option<Vec<WorkItem>>> {
    let items = fanout_source::enumerate(&source.source(), &source.options()).await.or_raise(|| ErrorKind::Source)?;
    if items.is_empty() {
        eprintln!("fanout: no items found in {}", source.source);
        return Ok(None);
    }
    tracing::debug!(count = items.len(), "Enumerated items");
    Ok(Some(items))
}

async fn run_commands(spec: CommandSpec, source: &SourceArgs, config: &Config, context: &Context) -> Result<Exit> {
    let Some(items) = enumerate(source).await? else {
        return Ok(Exit::NoItems);
    };
    let spec = spec.with_concurrency(config.concurrency());
    let jobs = spec.resolve_all(&items).or_raise(|| ErrorKind::Template)?;
    let dispatcher = context.dispatcher(config, spec.concurrency());

    let mut aggregator = Aggregator::new();
    let mut events = std::pin::pin!(dispatcher.stream(jobs, Arc::new(CommandTask)));
    while let Some(event) = events.next().await {
        if let DispatchEvent::Finished(result) = &event {
            warn_if_truncated(result);
        }
        match &event {
            DispatchEvent::Started { total, workers } => tracing::info!(total, workers, "Dispatching"),
            DispatchEvent::Finished(result) if result.outcome.is_success() => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = stdout.write_all(&result.stdout.bytes).and_then(|()| stdout.flush()) {
                    tracing::debug!(error = %e, "Could not forward job output");
                }
            },
            DispatchEvent::Finished(result) => {
                if !result.stderr.is_empty() {
                    tracing::warn!(item = %result.item, stderr = %result.stderr.lossy().trim_end(), "Job stderr");
                }
            },
            DispatchEvent::Complete { .. } => {},
        }
        aggregator.record(event);
    }
    let report = aggregator.finish();
    summarize(&report);
    Ok(Exit::from(&report))
}

fn warn_if_truncated<O>(result: &JobResult<O>) {
    if result.stdout.truncated || result.stderr.truncated {
        tracing::warn!(
            item = %result.item,
            stdout = result.stdout.truncated,
            stderr = result.stderr.truncated,
            "Job output truncated; raise --output-limit to keep all of it"
        );
    }
}

fn summarize<O>(report: &RunReport<O>) {
    for failure in &report.failures {
        if let Some(kind) = failure.outcome.failure() {
            eprintln!("fanout: {}: {kind}", failure.item);
        }
    }
    eprintln!("fanout: {report}");
}

fn list_presets(config: &Config) {
    let width = config.presets.keys().map(String::len).max().unwrap_or(0);
    let mut stdout = std::io::stdout().lock();
    for (name, preset) in &config.presets {
        let params: String = preset.params.iter().map(|p| format!(" <{p}>")).collect();
        let description = preset.description.as_deref().unwrap_or_default();
        let _ = writeln!(stdout, "{name:width$}  {}{params}", preset.command.join(" "));
        if !description.is_empty() {
            let _ = writeln!(stdout, "{:width$}  {description}", "");
        }
    }
}

async fn dedup(source: &SourceArgs, config: &Config, options: DedupOptions, context: &Context) -> Result<Exit> {
    let fingerprinter = Fingerprinter::select(&config.hasher).or_raise(|| ErrorKind::Hasher)?;
    let Some(items) = enumerate(source).await? else {
        return Ok(Exit::NoItems);
    };
    let dispatcher = context.dispatcher(config, config.concurrency());
    let report = fanout_dedup::dedup_content(&items, &fingerprinter, &dispatcher, &options)
        .await
        .or_raise(|| ErrorKind::Dedup)?;

    let verb = if report.dry_run { "would remove" } else { "remove" };
    let mut stdout = std::io::stdout().lock();
    for group in &report.groups {
        let _ = writeln!(stdout, "{}\n  keep          {}", group.fingerprint, group.keeper);
        for duplicate in &group.duplicates {
            let _ = writeln!(stdout, "  {verb:12}  {duplicate}");
        }
    }
    drop(stdout);
    for failure in &report.removal_failures {
        eprintln!("fanout: {}", failure.error);
    }
    if let Some(error) = &report.manifest_error {
        eprintln!("fanout: {error}");
    }
    summarize(&report.fingerprinting);
    eprintln!("fanout: {report}");

    Ok(if report.fingerprinting.status == RunStatus::Cancelled || context.cancel.is_cancelled() {
        Exit::Cancelled
    } else if report.success() {
        Exit::Success
    } else {
        Exit::ItemsFailed
    })
}

async fn uniq(source: &SourceArgs, config: &Config, context: &Context) -> Result<Exit> {
    let Some(items) = enumerate(source).await? else {
        return Ok(Exit::NoItems);
    };
    let report = fanout_dedup::dedup_sorted_lines(&items, &context.dispatcher(config, config.concurrency())).await;
    for (item, removed) in report.outputs().filter(|(_, n)| **n > 0) {
        tracing::info!(item = %item, removed, "Removed duplicate lines");
    }
    summarize(&report);
    Ok(Exit::from(&report))
}
