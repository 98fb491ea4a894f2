use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use conductor::config::Config;
use conductor::core::Pipeline;
use conductor::orchestration::{
    CacheMode, ExecutionMode, PromptRenderer, RunCoordinator, RunRequest, TmuxWorker,
};
use conductor::state::{default_snapshot_path, ResumeManager, RunningRegistry, RunningSnapshot};
use conductor::tmux::Tmux;
use conductor::Result;

/// Conductor - run a DAG of tasks, one external worker per task
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG=<filter>  Override the log filter (tracing EnvFilter syntax)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run tasks and everything they depend on
    Run(RunArgs),

    /// Print the dependency levels a run would execute
    Plan {
        /// Tasks to plan (default: all)
        tasks: Vec<String>,

        /// Pipeline definition file
        #[arg(long, short = 'p', default_value = "pipeline.toml")]
        pipeline: PathBuf,
    },

    /// Show tasks of the run currently in flight
    Status,

    /// Clear resume state and optionally leftover worker sessions
    Clean {
        /// Output directory whose resume state is cleared
        #[arg(long, short = 'o', default_value = "output")]
        output_dir: PathBuf,

        /// Also kill leftover conductor tmux sessions
        #[arg(long)]
        sessions: bool,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Tasks to run (default: all)
    pub tasks: Vec<String>,

    /// Run each dependency level concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Skip tasks whose recorded output is still up to date
    #[arg(long, conflicts_with = "force")]
    pub resume: bool,

    /// Discard resume state and run every task
    #[arg(long)]
    pub force: bool,

    /// Per-task timeout in seconds (0 = none)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory task outputs are written to
    #[arg(long, short = 'o', default_value = "output")]
    pub output_dir: PathBuf,

    /// Pipeline definition file
    #[arg(long, short = 'p', default_value = "pipeline.toml")]
    pub pipeline: PathBuf,

    /// Input file hashed into the resume state (repeatable)
    #[arg(long = "input", short = 'i')]
    pub inputs: Vec<PathBuf>,
}

impl RunArgs {
    fn cache_mode(&self) -> CacheMode {
        if self.resume {
            CacheMode::Resume
        } else if self.force {
            CacheMode::Force
        } else {
            CacheMode::Normal
        }
    }

    fn execution_mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    info!(debug = conductor::log::is_debug(), "Conductor starting");

    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Plan { tasks, pipeline } => run_plan(&tasks, &pipeline),
        Command::Status => run_status(),
        Command::Clean {
            output_dir,
            sessions,
        } => run_clean(&output_dir, sessions),
    }
}

/// Prompt paths in the pipeline file are relative to the file itself.
fn pipeline_base_dir(pipeline: &Path) -> PathBuf {
    match pipeline.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = Config::load()?;
    let pipeline = Pipeline::load(&args.pipeline)?;
    let cwd = std::env::current_dir()?;
    let worker = TmuxWorker::from_config(&config, &cwd)?;
    let running = Arc::new(RunningRegistry::new(
        config.effective_base_port(),
        Some(default_snapshot_path()),
    ));

    let coordinator = RunCoordinator::new(
        pipeline.registry,
        worker,
        PromptRenderer::new(pipeline_base_dir(&args.pipeline)),
    )
    .with_settings(pipeline.settings)
    .with_lifecycle(config.lifecycle())
    .with_running_registry(running);

    let mut request = RunRequest::new(&args.output_dir)
        .with_tasks(&args.tasks)
        .with_mode(args.execution_mode())
        .with_cache(args.cache_mode())
        .with_inputs(&cwd, args.inputs.clone());
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let rt = tokio::runtime::Runtime::new()?;
    let signal = {
        let _guard = rt.enter();
        shutdown_signal()?
    };
    let summary = rt.block_on(async {
        let cancel = coordinator.cancellation_token();
        tokio::spawn(async move {
            let name = signal.await;
            eprintln!("Interrupted, stopping workers...");
            warn!(signal = name, "Signal received, cancelling run");
            cancel.cancel();
        });
        coordinator.run(request).await
    })?;

    println!("{}", summary);
    if !summary.success {
        if let Some(path) = conductor::log::log_path() {
            eprintln!("Details in {}", path.display());
        }
        std::process::exit(1);
    }
    Ok(())
}

/// Resolves with the signal's name on SIGINT or SIGTERM.
///
/// Handlers are installed before this returns, so a signal arriving before
/// the future is first polled is not lost.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(_) => std::future::pending().await,
        }
    })
}

fn run_plan(tasks: &[String], pipeline_path: &Path) -> Result<()> {
    let pipeline = Pipeline::load(pipeline_path)?;
    let dag = conductor::core::TaskDag::new(&pipeline.registry);
    let expanded = if tasks.is_empty() {
        dag.expand_with_dependencies(pipeline.registry.names())?
    } else {
        dag.expand_with_dependencies(tasks)?
    };
    let levels = dag.dependency_levels(&expanded)?;

    println!("{} tasks in {} levels", expanded.len(), levels.len());
    for (index, level) in levels.iter().enumerate() {
        println!("  Level {}: {}", index, level.join(", "));
    }
    Ok(())
}

fn run_status() -> Result<()> {
    let path = default_snapshot_path();
    match RunningSnapshot::read(&path)? {
        None => println!("No run in progress."),
        Some(snapshot) => {
            println!(
                "Run {} (pid {}), updated {}",
                snapshot.run_id,
                snapshot.pid,
                snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if snapshot.tasks.is_empty() {
                println!("  No tasks running.");
            }
            for task in &snapshot.tasks {
                let elapsed = (Utc::now() - task.started_at).num_seconds().max(0);
                println!("  {:<24} port {:<5}  running {}s", task.name, task.port, elapsed);
            }
        }
    }

    if Tmux::is_available() {
        let sessions = Tmux::list_conductor_sessions()?;
        if !sessions.is_empty() {
            println!();
            println!("Worker sessions:");
            for session in sessions {
                println!("  {}", session);
            }
        }
    }
    Ok(())
}

fn run_clean(output_dir: &Path, sessions: bool) -> Result<()> {
    let mut resume = ResumeManager::load(output_dir);
    let recorded = resume.state().task_outputs.len();
    resume.clear()?;
    println!(
        "Cleared resume state for {} task(s) at {}",
        recorded,
        resume.path().display()
    );

    if sessions && Tmux::is_available() {
        let leftover = Tmux::list_conductor_sessions()?;
        for session in &leftover {
            if let Err(e) = Tmux::kill_session(session) {
                warn!(%session, error = %e, "Failed to kill session");
                eprintln!("  Failed to kill {}: {}", session, e);
            }
        }
        println!("Killed {} worker session(s)", leftover.len());
    }
    Ok(())
}
