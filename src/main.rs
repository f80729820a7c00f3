// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use podqueue::{
    Activity, Config, Episode, FilesystemDevice, NoopReporter, ProgressEvent, ProgressReporter,
    QueueManager, ResumableTransfer, SharedConfig, SharedProgressReporter, SyncTarget, Task,
    TaskId, TaskQueue, TaskStatus, Transferer,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static DEVICE: Emoji<'_, '_> = Emoji("🎧 ", "[>] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[~] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Download podcast episodes with resume, retries and bandwidth limiting
#[derive(Parser, Debug)]
#[command(name = "podqueue")]
#[command(about = "Download podcast episodes with resume, retries and bandwidth limiting")]
#[command(version)]
struct Args {
    /// Episode media URLs
    #[arg(required = true)]
    urls: Vec<String>,

    /// Output directory for downloaded episodes
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long)]
    concurrent: Option<usize>,

    /// Bandwidth cap in KiB/s
    #[arg(long)]
    limit_rate: Option<f64>,

    /// Retry budget for failed requests and short reads
    #[arg(long)]
    retries: Option<u32>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Copy finished downloads into this folder, one subfolder per podcast
    #[arg(long, value_name = "DIR")]
    sync_to: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Log more (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(concurrent) = self.concurrent {
            config.max_downloads_enabled = true;
            config.max_downloads = concurrent;
        }
        if let Some(kbps) = self.limit_rate {
            config.limit_rate_enabled = true;
            config.limit_rate_kbps = kbps;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        Ok(config)
    }
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
}

impl IndicatifReporter {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, task: TaskId) -> ProgressBar {
        let mut bars = self.bars.lock();
        if let Some(bar) = bars.get(&task) {
            return bar.clone();
        }

        let bar = self.multi.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar().template(
            "  {prefix}[{bar:30.cyan/blue}] {bytes}/{total_bytes} {binary_bytes_per_sec} {wide_msg}",
        ) {
            bar.set_style(style.progress_chars("█▓░"));
        }
        bars.insert(task, bar.clone());
        bar
    }

    fn finish(&self, task: TaskId, message: String, success: bool) {
        let bar = self.bars.lock().remove(&task);
        if let Some(bar) = bar {
            if success {
                bar.finish_with_message(message);
            } else {
                bar.abandon_with_message(message);
            }
        }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::TaskQueued { .. } => {}

            ProgressEvent::TaskStarted {
                task,
                activity,
                title,
                total_bytes,
            } => {
                let bar = self.bar(task);
                bar.set_prefix(match activity {
                    Activity::Download => DOWNLOAD.to_string(),
                    Activity::Synchronize => DEVICE.to_string(),
                });
                bar.set_length(total_bytes.unwrap_or(0));
                bar.set_message(truncate_title(&title, 40));
            }

            ProgressEvent::TaskProgress {
                task,
                progress,
                total_bytes,
                ..
            } => {
                let bar = self.bar(task);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                    bar.set_position((total as f64 * progress) as u64);
                }
            }

            ProgressEvent::TransferRetrying {
                task,
                title,
                attempt,
                error,
            } => {
                self.bar(task).set_message(format!(
                    "{RETRY}{} (attempt {}: {})",
                    truncate_title(&title, 30),
                    (attempt + 1).to_string().yellow(),
                    error.dimmed()
                ));
            }

            ProgressEvent::Finalizing { task, title } => {
                self.bar(task)
                    .set_message(format!("{} {}", truncate_title(&title, 40), "finalizing".dimmed()));
            }

            ProgressEvent::TaskCompleted { task, title, .. } => {
                self.finish(
                    task,
                    format!("{SUCCESS}{}", truncate_title(&title, 40).green()),
                    true,
                );
            }

            ProgressEvent::TaskFailed { task, title, error } => {
                self.finish(
                    task,
                    format!(
                        "{FAILURE}{} - {}",
                        truncate_title(&title, 30).red(),
                        error.red()
                    ),
                    false,
                );
            }

            ProgressEvent::TaskPaused { task, title } => {
                self.finish(task, format!("{} {}", truncate_title(&title, 40), "paused".yellow()), false);
            }

            ProgressEvent::TaskCancelled { task, title } => {
                self.finish(task, format!("{} {}", truncate_title(&title, 40), "cancelled".yellow()), false);
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "podqueue=debug",
        (false, _) => "podqueue=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_failures(tasks: &[Arc<Task>]) {
    let failed: Vec<_> = tasks
        .iter()
        .filter(|t| t.status() == TaskStatus::Failed)
        .collect();
    if failed.is_empty() {
        return;
    }

    println!("\n{}", "Failed episodes:".red().bold());
    for task in failed {
        println!(
            "  {}{} - {}",
            CROSS,
            task.title().yellow(),
            task.error_message().unwrap_or_default().dimmed()
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podqueue".bold().magenta(),
            "- Podcast Episode Downloader".dimmed()
        );
    }

    let config = SharedConfig::new(args.config()?);
    let transferer: Arc<dyn Transferer> =
        Arc::new(ResumableTransfer::from_config(&config).context("Failed to create HTTP client")?);

    let reporter: SharedProgressReporter = if args.quiet {
        NoopReporter::shared()
    } else {
        Arc::new(IndicatifReporter::new())
    };

    let manager = QueueManager::new(config.clone(), Arc::new(TaskQueue::new()));
    let downloads: Vec<Arc<Task>> = args
        .urls
        .iter()
        .map(|url| {
            Task::download(
                Episode::from_url(url),
                &args.output_dir,
                transferer.clone(),
                config.clone(),
                reporter.clone(),
            )
        })
        .collect();

    let downloads = manager.queue_tasks(downloads);
    manager.wait_idle(None);

    let mut synced = Vec::new();
    if let Some(root) = &args.sync_to {
        let device: Arc<dyn SyncTarget> = Arc::new(FilesystemDevice::new(root));
        let syncs: Vec<Arc<Task>> = downloads
            .iter()
            .filter(|t| t.status() == TaskStatus::Done)
            .filter_map(|t| {
                let source = t.final_path()?;
                Some(Task::sync(
                    t.episode().clone(),
                    source,
                    device.clone(),
                    config.clone(),
                    reporter.clone(),
                ))
            })
            .collect();

        synced = manager.queue_tasks(syncs);
        manager.wait_idle(None);
    }

    let finished = downloads
        .iter()
        .filter(|t| t.status() == TaskStatus::Done)
        .count();
    let failed = downloads.len() - finished;

    if !args.quiet {
        print_failures(&downloads);
        print_failures(&synced);

        println!(
            "\n{PARTY}{} {} downloaded, {} failed",
            "Done:".bold().green(),
            finished.to_string().green().bold(),
            if failed > 0 {
                failed.to_string().red().bold()
            } else {
                failed.to_string().green()
            }
        );
        println!(
            "{FOLDER}Output: {}\n",
            args.output_dir.display().to_string().cyan()
        );
    }

    if failed > 0 && finished == 0 {
        std::process::exit(1);
    }

    Ok(())
}
