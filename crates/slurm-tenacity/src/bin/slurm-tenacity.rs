use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use tokio::signal::ctrl_c;

use slurm_tenacity::common::setup::setup_logging;
use slurm_tenacity::common::utils::time::{format_slurm_duration, parse_slurm_or_human_time};
use slurm_tenacity::{
    AllocationCache, Error, Executor, JobHandle, JobId, JobSpec, LocalExecutor, SshExecutor,
    TenacityConfig, TenacitySubmitter,
};

/// Exit code of a process ended by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct RootOptions {
    #[clap(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
struct CommonOpts {
    /// Run Slurm commands on this host through SSH instead of locally
    #[arg(long, global = true, env = "SLURM_TENACITY_REMOTE")]
    remote: Option<String>,

    /// Path to a TOML configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "SLURM_TENACITY_CONFIG"
    )]
    config: Option<PathBuf>,

    /// Enables more detailed log output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Submit a job and resubmit it with more resources until it succeeds
    Submit(SubmitOpts),
    /// Show the status of a job
    Status(JobIdOpts),
    /// Cancel a job
    Cancel(JobIdOpts),
}

#[derive(Parser)]
struct SubmitOpts {
    /// Distinguishes runs of the same command with different resource needs
    #[arg(long)]
    key: Option<String>,

    /// Time limit of the first attempt (`[D-]HH:MM:SS` or humantime, e.g. `2h`)
    #[arg(long, value_parser = parse_slurm_or_human_time)]
    walltime: Option<Duration>,

    /// Memory limit of the first attempt (e.g. `4GiB`)
    #[arg(long)]
    memory: Option<ByteSize>,

    #[arg(long, default_value_t = 1)]
    ntasks: u32,

    #[arg(long, default_value_t = 1)]
    cpus_per_task: u32,

    #[arg(long, default_value_t = 0)]
    gpus_per_task: u32,

    #[arg(long)]
    partition: Option<String>,

    #[arg(long)]
    account: Option<String>,

    #[arg(long)]
    job_name: Option<String>,

    /// Working directory of the job
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    cwd: Option<PathBuf>,

    /// Stdout file, `%j` is replaced with the job id
    #[arg(long)]
    stdout: Option<PathBuf>,

    /// Stderr file, `%j` is replaced with the job id
    #[arg(long)]
    stderr: Option<PathBuf>,

    /// Command to execute
    #[arg(required = true, trailing_var_arg(true), allow_hyphen_values(true))]
    command: Vec<String>,
}

#[derive(Parser)]
struct JobIdOpts {
    job_id: JobId,
}

fn create_executor(common: &CommonOpts) -> Arc<dyn Executor> {
    match &common.remote {
        Some(host) => Arc::new(SshExecutor::new(host)),
        None => Arc::new(LocalExecutor),
    }
}

fn load_config(common: &CommonOpts) -> anyhow::Result<TenacityConfig> {
    Ok(match &common.config {
        Some(path) => TenacityConfig::load(path)
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => TenacityConfig::default(),
    })
}

fn build_job_spec(opts: SubmitOpts) -> anyhow::Result<JobSpec> {
    let mut builder = JobSpec::builder(opts.command)
        .ntasks(opts.ntasks)
        .cpus_per_task(opts.cpus_per_task)
        .gpus_per_task(opts.gpus_per_task);
    if let Some(walltime) = opts.walltime {
        builder = builder.walltime(walltime);
    }
    if let Some(memory) = opts.memory {
        builder = builder.memory(memory);
    }
    if let Some(cwd) = opts.cwd {
        builder = builder.cwd(cwd);
    }
    if let Some(partition) = opts.partition {
        builder = builder.partition(partition);
    }
    if let Some(account) = opts.account {
        builder = builder.account(account);
    }
    if let Some(job_name) = opts.job_name {
        builder = builder.job_name(job_name);
    }
    if let Some(stdout) = opts.stdout {
        builder = builder.stdout(stdout);
    }
    if let Some(stderr) = opts.stderr {
        builder = builder.stderr(stderr);
    }
    Ok(builder.build()?)
}

/// Returns a future that completes on the first SIGINT.
///
/// The signal handler is installed before this returns, so an interrupt that arrives
/// while the job is being submitted is not lost.
async fn interrupt_signal() -> impl Future<Output = ()> {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match ctrl_c().await {
            Ok(()) => {
                eprintln!("SIGINT received, canceling the current job");
                let _ = sender.send(());
            }
            Err(error) => {
                log::warn!("Cannot listen for SIGINT: {error}");
                std::future::pending::<()>().await;
            }
        }
    });
    tokio::task::yield_now().await;
    async move {
        let _ = receiver.await;
    }
}

async fn command_submit(common: &CommonOpts, opts: SubmitOpts) -> anyhow::Result<()> {
    let config = load_config(common)?;
    let cache = AllocationCache::open(&config.cache_path).with_context(|| {
        format!(
            "Cannot open allocation cache at {}",
            config.cache_path.display()
        )
    })?;
    let key = opts.key.clone();
    let spec = build_job_spec(opts)?;

    let submitter = TenacitySubmitter::new(create_executor(common), Arc::new(cache), config);
    let interrupt = interrupt_signal().await;
    let job = submitter
        .submit_until(&spec, key.as_deref(), interrupt)
        .await?;

    let walltime = job.walltime().await?;
    let memory = job.memory().await?;
    println!("Job {} succeeded", job.id());
    println!("walltime: {}", format_slurm_duration(&walltime));
    match memory {
        Some(memory) => println!("memory: {memory}"),
        None => println!("memory: unknown"),
    }
    Ok(())
}

async fn command_status(common: &CommonOpts, opts: JobIdOpts) -> anyhow::Result<()> {
    let job = JobHandle::attach(opts.job_id, create_executor(common));
    let status = job.status().await?;
    println!("{}: {status}", job.id());
    Ok(())
}

async fn command_cancel(common: &CommonOpts, opts: JobIdOpts) -> anyhow::Result<()> {
    let job = JobHandle::attach(opts.job_id, create_executor(common));
    job.cancel().await?;
    println!("Job {} canceled", job.id());
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let top_opts = RootOptions::parse();
    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Submit(opts) => command_submit(&top_opts.common, opts).await,
        SubCommand::Status(opts) => command_status(&top_opts.common, opts).await,
        SubCommand::Cancel(opts) => command_cancel(&top_opts.common, opts).await,
    };

    if let Err(e) = result {
        if let Some(Error::Interrupted) = e.downcast_ref::<Error>() {
            log::warn!("{e}");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
