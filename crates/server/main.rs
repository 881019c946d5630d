use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drover_core::{Job, JobStatus, JobTarget};
use drover_server::{shutdown_signal, Orchestrator, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "Background job execution for data pipelines")]
#[command(propagate_version = true)]
struct Args {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler loop in this process
    Scheduler,

    /// Keep one scheduler process alive and report its memory usage
    Supervise,

    /// Enqueue a single job and wait for it to finish
    Run {
        /// Job id, used for idempotency
        id: String,

        /// Poll interval while waiting, in milliseconds
        #[arg(long, default_value = "200")]
        poll_ms: u64,

        /// Environment passed to the job as KEY=VALUE
        #[arg(long = "kwarg", short = 'k', value_parser = parse_kwarg)]
        kwargs: Vec<(String, String)>,

        /// Program followed by its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run jobs published to the Redis broker
    Consume,
}

fn parse_kwarg(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let orchestrator = Orchestrator::init(config)
        .await
        .context("failed to initialize orchestrator")?;

    let result = run(&orchestrator, args.command).await;

    if let Err(e) = orchestrator.shutdown().await {
        tracing::warn!(error = %e, "Shutdown did not finish cleanly");
    }
    result
}

async fn run(orchestrator: &Orchestrator, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Scheduler => {
            orchestrator.run_scheduler(shutdown_signal()).await?;
        }
        Commands::Supervise => {
            let exe = std::env::current_exe().context("cannot locate the drover executable")?;
            let target = JobTarget::new(exe.display().to_string()).arg("scheduler");
            orchestrator.supervise(target, shutdown_signal()).await?;
        }
        Commands::Run {
            id,
            poll_ms,
            kwargs,
            command,
        } => {
            let mut parts = command.into_iter();
            let program = parts.next().context("missing program")?;
            let mut target = JobTarget::new(program).args(parts);
            for (key, value) in kwargs {
                target = target.kwarg(key, value);
            }

            let job = Job::new(id.as_str(), target);
            let status = orchestrator
                .run_job(job, Duration::from_millis(poll_ms.max(1)))
                .await?;
            match status {
                JobStatus::Completed => tracing::info!(job_id = %id, "Job completed"),
                other => anyhow::bail!("job {} ended as {:?}", id, other),
            }
        }
        Commands::Consume => {
            orchestrator.consume(shutdown_signal()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let args = Args::try_parse_from([
            "drover", "run", "block_run_7", "-k", "PIPELINE=daily", "--", "echo", "hi",
        ])
        .unwrap();
        match args.command {
            Commands::Run {
                id,
                kwargs,
                command,
                poll_ms,
            } => {
                assert_eq!(id, "block_run_7");
                assert_eq!(kwargs, vec![("PIPELINE".to_string(), "daily".to_string())]);
                assert_eq!(command, vec!["echo", "hi"]);
                assert_eq!(poll_ms, 200);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_program() {
        assert!(Args::try_parse_from(["drover", "run", "block_run_7"]).is_err());
    }

    #[test]
    fn test_parse_kwarg() {
        assert_eq!(
            parse_kwarg("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_kwarg("=x").is_err());
        assert!(parse_kwarg("novalue").is_err());
    }
}
