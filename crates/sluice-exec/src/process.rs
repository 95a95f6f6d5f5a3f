//! One-shot subprocess execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use sluice_workflow::QueueLogger;

use crate::error::ExecError;
use crate::manager::ExecutionManager;
use crate::signal;

/// How long a politely terminated process gets before it is killed.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Runs one subprocess to completion, draining its pipes into the logger.
pub struct ProcessExecutionManager {
  logger: QueueLogger,
  program: String,
  args: Vec<String>,
  workdir: Option<PathBuf>,
  pid: Arc<Mutex<Option<i32>>>,
}

impl ProcessExecutionManager {
  pub fn new(
    logger: QueueLogger,
    program: impl Into<String>,
    args: Vec<String>,
    workdir: Option<PathBuf>,
  ) -> Self {
    Self {
      logger,
      program: program.into(),
      args,
      workdir,
      pid: Arc::new(Mutex::new(None)),
    }
  }
}

#[async_trait]
impl ExecutionManager for ProcessExecutionManager {
  async fn run_until_complete(&mut self) -> Result<i32, ExecError> {
    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .stdin(Stdio::null());
    if let Some(workdir) = &self.workdir {
      command.current_dir(workdir);
    }
    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(err) => {
        self
          .logger
          .msg_standard_execution(json!({
            "type": "execution_failed_to_start",
            "program": self.program,
            "error": err.to_string(),
          }))
          .await;
        return Ok(-1);
      }
    };
    *self.pid.lock().unwrap() = child.id().map(|pid| pid as i32);
    self
      .logger
      .msg_standard_execution(json!({
        "type": "execution_started",
        "program": self.program,
        "args": self.args.join(" "),
      }))
      .await;
    info!(program = %self.program, "process started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_logger = self.logger.clone();
    let stdout_task = tokio::spawn(async move {
      if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
          out_logger.msg_proc(line).await;
        }
      }
    });
    let err_logger = self.logger.clone();
    let stderr_task = tokio::spawn(async move {
      if let Some(stderr) = stderr {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
          err_logger.msg_proc_error(line).await;
        }
      }
    });

    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    *self.pid.lock().unwrap() = None;
    match status {
      Ok(status) => Ok(status.code().unwrap_or(-1)),
      Err(err) => {
        warn!(program = %self.program, error = %err, "waiting on process failed");
        Ok(-1)
      }
    }
  }

  fn stop_execution(&self) {
    let pid = self.pid.clone();
    tokio::spawn(async move {
      let target = *pid.lock().unwrap();
      let Some(target) = target else {
        return;
      };
      signal::terminate(target);
      tokio::time::sleep(TERMINATION_GRACE).await;
      if pid.lock().unwrap().is_some() {
        signal::kill(target);
      }
    });
  }
}
