//! Worker that runs an external program for each packet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{WorkContext, Worker};
use crate::error::{Error, Result};
use crate::model::WorkPacket;
use crate::progress::ProgressInfo;
use crate::telemetry::metrics;

/// Runs `program args...` in a fresh scratch folder.
///
/// The packet is passed through the environment: `LABPIPE_TASK_ID`,
/// `LABPIPE_WORK_TYPE`, `LABPIPE_INPUT`, `LABPIPE_OUTPUT`, `LABPIPE_PARAMS`
/// and, when present, `LABPIPE_DATABASE`. The program's stdout and stderr go
/// to a child log of the request.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: PathBuf,
    args: Vec<String>,
    scratch_base: PathBuf,
}

impl CommandWorker {
    pub fn new(program: impl Into<PathBuf>, scratch_base: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            scratch_base: scratch_base.into(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn run(&self, work: &WorkPacket, ctx: &WorkContext) -> Result<()> {
        // Relative programs are resolved against our working directory, not
        // the scratch folder the child runs in.
        let program = if self.program.is_relative() && self.program.components().count() > 1 {
            std::env::current_dir()?.join(&self.program)
        } else {
            self.program.clone()
        };

        // Everything fallible happens before the scratch folder exists.
        let log = ctx.log.create_child_log()?;
        metrics::log_nodes_created().add(1, &[]);
        let handle = log.open_handle()?;
        let (stdout, stderr) = handle.stdio()?;

        let input = work.input.require_path()?;
        let output = work.output.require_path()?;
        let database = work.database.as_ref().map(|d| d.require_path()).transpose()?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let scratch = self.scratch_base.join(Uuid::new_v4().to_string());
        {
            let guard = log.start_logging()?;
            guard.span().in_scope(|| {
                info!(
                    program = %program.display(),
                    task_id = %work.task_id,
                    scratch = %scratch.display(),
                    "running command"
                );
            });
        }

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .current_dir(&scratch)
            .env("LABPIPE_TASK_ID", &work.task_id)
            .env("LABPIPE_WORK_TYPE", &work.work_type)
            .env("LABPIPE_INPUT", input)
            .env("LABPIPE_OUTPUT", output)
            .env("LABPIPE_PARAMS", &work.params)
            .stdout(stdout)
            .stderr(stderr);
        if let Some(database) = database {
            command.env("LABPIPE_DATABASE", database);
        }

        tokio::fs::create_dir_all(&scratch).await?;
        let status = command.status().await;
        drop(handle);
        cleanup(&scratch).await;

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Worker(format!(
                "{} exited with status {}",
                program.display(),
                status.code().unwrap_or(-1)
            )))
        }
    }
}

async fn cleanup(scratch: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
        warn!(scratch = %scratch.display(), "cleanup error: {e}");
    } else {
        debug!(scratch = %scratch.display(), "scratch folder removed");
    }
}

#[async_trait]
impl Worker<WorkPacket> for CommandWorker {
    async fn process_request(&self, work: WorkPacket, ctx: WorkContext) {
        let start = Instant::now();
        let result = self.run(&work, &ctx).await;
        let duration_ms = start.elapsed().as_millis() as f64;
        metrics::operation_duration_ms().record(duration_ms, &[KeyValue::new("operation", "command")]);

        match result {
            Ok(()) => {
                info!(task_id = %work.task_id, duration_ms, "command completed");
                ctx.reporter
                    .report_progress(ProgressInfo::PercentDone { percent: 100.0 });
                ctx.reporter.report_success();
            }
            Err(e) => {
                warn!(task_id = %work.task_id, duration_ms, error = %e, "command failed");
                ctx.reporter.report_failure(Arc::new(e));
            }
        }
    }
}
