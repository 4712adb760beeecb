mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lavastorm_engine::{start_driver, DriverConfig};
use lavastorm_sched::{
    OpenLavaCli, OpenLavaCliConfig, OpenLavaWeb, OpenLavaWebConfig, Scheduler, SgeCli,
    SgeCliConfig,
};

use crate::cli::{Cli, SchedulerKind};
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController};

async fn build_scheduler(cli: &Cli) -> anyhow::Result<Scheduler> {
    match cli.scheduler {
        SchedulerKind::OpenlavaCli => Ok(OpenLavaCli::new(OpenLavaCliConfig {
            bsub_command: cli.bsub_command.clone(),
            bjobs_command: cli.bjobs_command.clone(),
            bhist_command: cli.bhist_command.clone(),
            bkill_command: cli.bkill_command.clone(),
            unknown_is_failed: cli.treat_unknown_as_failed,
            ..Default::default()
        })
        .into()),
        SchedulerKind::SgeCli => Ok(SgeCli::new(SgeCliConfig {
            qsub_command: cli.qsub_command.clone(),
            qstat_command: cli.qstat_command.clone(),
            qacct_command: cli.qacct_command.clone(),
            qdel_command: cli.qdel_command.clone(),
            pe_type: cli.qsub_pe_type.clone(),
            ..Default::default()
        })
        .into()),
        SchedulerKind::OpenlavaWeb | SchedulerKind::OpenlavaClusterApi => {
            let url = cli.url.clone().context("--url is required for the web bridge")?;
            let username = cli
                .username
                .clone()
                .context("--username is required for the web bridge")?;
            let password = cli
                .password
                .clone()
                .context("--password is required for the web bridge")?;
            let backend = OpenLavaWeb::connect(OpenLavaWebConfig {
                url,
                username,
                password,
                unknown_is_failed: cli.treat_unknown_as_failed,
            })
            .await?;
            Ok(backend.into())
        }
        SchedulerKind::OpenlavaCApi => {
            anyhow::bail!("scheduler openlava_c_api is not available in this build")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let workload = cli.workload().map_err(|err| anyhow::anyhow!(err))?;
    let profile = cli.profile_config().map_err(|err| anyhow::anyhow!(err))?;
    let scheduler = build_scheduler(&cli).await?;

    let config = DriverConfig {
        tick: Duration::from_secs(cli.delay_time),
        workload,
        profile,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        scheduler = ?cli.scheduler,
        "lavastorm starting"
    );

    let driver = start_driver(config, scheduler);
    spawn_ctrl_c_handler(Arc::new(ShutdownController::new()), driver.stopper());

    let summary = driver.wait().await?;
    info!(
        submitted_jobs = summary.total_submitted_jobs,
        tasks = summary.total_task_count,
        completed = summary.completed_task_count,
        failed = summary.failed_task_count,
        killed = summary.killed_task_count,
        rejected = summary.rejected_submission_count,
        "run finished"
    );
    Ok(())
}
