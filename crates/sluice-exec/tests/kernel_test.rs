//! Kernel manager pool tests with scripted channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sluice_exec::{
  ConnectionInfo, ExecError, ExecutionManager, KernelChannels, KernelChannelsFactory,
  KernelExecutionManager, KernelIoMessage, KernelLaunchOptions, KernelManagerPool,
  KernelReplyStatus, KernelSpec, KernelSpecProvider,
};
use sluice_workflow::{Event, PromptBroker, QueueLogger};
use tokio::sync::mpsc;

/// Channels whose behavior is scripted per test.
struct ScriptedChannels {
  ready: bool,
  io: Vec<KernelIoMessage>,
  status: KernelReplyStatus,
}

#[async_trait]
impl KernelChannels for ScriptedChannels {
  async fn wait_for_ready(&self, timeout: Duration) -> Result<(), ExecError> {
    if self.ready {
      return Ok(());
    }
    tokio::time::sleep(timeout).await;
    Err(ExecError::KernelStartupTimeout {
      kernel_name: "scripted".to_string(),
      timeout,
    })
  }

  async fn execute(
    &self,
    _code: &str,
    io: mpsc::UnboundedSender<KernelIoMessage>,
  ) -> Result<KernelReplyStatus, ExecError> {
    for message in &self.io {
      let _ = io.send(KernelIoMessage {
        msg_type: message.msg_type.clone(),
        content: message.content.clone(),
      });
    }
    Ok(self.status)
  }

  async fn shutdown(&self) {}
}

fn scripted_factory(
  ready: bool,
  io: Vec<KernelIoMessage>,
  status: KernelReplyStatus,
) -> KernelChannelsFactory {
  Arc::new(move |_connection: &ConnectionInfo| {
    Arc::new(ScriptedChannels {
      ready,
      io: io
        .iter()
        .map(|m| KernelIoMessage {
          msg_type: m.msg_type.clone(),
          content: m.content.clone(),
        })
        .collect(),
      status,
    }) as Arc<dyn KernelChannels>
  })
}

/// A spec whose process stays alive long enough to be reused.
struct SleeperSpec;

#[async_trait]
impl KernelSpecProvider for SleeperSpec {
  async fn find(&self, kernel_name: &str) -> Option<KernelSpec> {
    if kernel_name == "missing" {
      return None;
    }
    Some(KernelSpec {
      name: kernel_name.to_string(),
      display_name: format!("Sleeper ({})", kernel_name),
      language: "python".to_string(),
      argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
      resource_dir: None,
    })
  }
}

fn logger() -> (QueueLogger, mpsc::Receiver<Event>) {
  let (tx, rx) = mpsc::channel(64);
  (QueueLogger::new(tx, "Tool", PromptBroker::new()), rx)
}

fn pool(factory: KernelChannelsFactory) -> KernelManagerPool {
  KernelManagerPool::new(factory).with_spec_provider(Arc::new(SleeperSpec))
}

#[cfg(unix)]
#[tokio::test]
async fn pool_reuses_by_kernel_and_group() {
  let pool = pool(scripted_factory(true, vec![], KernelReplyStatus::Ok));
  let (logger, _rx) = logger();
  let options = KernelLaunchOptions::default();

  let first = pool
    .manager(&logger, "python3", Some("group-1"), &options)
    .await
    .expect("first kernel");
  let second = pool
    .manager(&logger, "python3", Some("group-1"), &options)
    .await
    .expect("second kernel");
  assert!(Arc::ptr_eq(&first, &second));

  let other_group = pool
    .manager(&logger, "python3", Some("group-2"), &options)
    .await
    .expect("other group");
  assert!(!Arc::ptr_eq(&first, &other_group));
  let other_kernel = pool
    .manager(&logger, "julia-1.8", Some("group-1"), &options)
    .await
    .expect("other kernel");
  assert!(!Arc::ptr_eq(&first, &other_kernel));

  pool.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn connection_file_lookup_restart_and_shutdown() {
  let pool = pool(scripted_factory(true, vec![], KernelReplyStatus::Ok));
  let (logger, _rx) = logger();
  let options = KernelLaunchOptions::default();

  let manager = pool
    .manager(&logger, "python3", Some("group-1"), &options)
    .await
    .expect("kernel");
  let connection_file = manager.connection_file().to_path_buf();
  assert!(connection_file.exists());
  let found = pool
    .get_by_connection_file(&connection_file)
    .expect("lookup by connection file");
  assert!(Arc::ptr_eq(&manager, &found));

  // Restart keeps the key but produces a fresh connection file.
  let restarted = pool
    .restart_by_connection_file(&logger, &connection_file, &options)
    .await
    .expect("restart");
  assert!(!Arc::ptr_eq(&manager, &restarted));
  assert_ne!(restarted.connection_file(), connection_file.as_path());
  assert!(pool.get_by_connection_file(&connection_file).is_none());
  let reused = pool
    .manager(&logger, "python3", Some("group-1"), &options)
    .await
    .expect("reuse after restart");
  assert!(Arc::ptr_eq(&restarted, &reused));

  let new_file = restarted.connection_file().to_path_buf();
  assert!(pool.shutdown_by_connection_file(&new_file).await);
  assert!(pool.get_by_connection_file(&new_file).is_none());
  assert!(!new_file.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn missing_spec_is_reported() {
  let pool = pool(scripted_factory(true, vec![], KernelReplyStatus::Ok));
  let (logger, mut rx) = logger();
  let err = pool
    .manager(&logger, "missing", Some("group-1"), &KernelLaunchOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, ExecError::KernelSpecNotFound { .. }));
  let event = rx.recv().await.expect("spec-not-found event");
  match event {
    Event::KernelExecutionMsg { payload, .. } => {
      assert_eq!(payload["type"], "kernel_spec_not_found");
    }
    other => panic!("unexpected event {:?}", other),
  }
}

#[cfg(unix)]
#[tokio::test]
async fn execution_manager_relays_iopub_output() {
  let io = vec![KernelIoMessage {
    msg_type: "stream".to_string(),
    content: json!({"name": "stdout", "text": "hi\n"}),
  }];
  let pool = Arc::new(pool(scripted_factory(true, io, KernelReplyStatus::Ok)));
  let (logger, mut rx) = logger();
  let mut manager = KernelExecutionManager::new(
    logger,
    pool.clone(),
    "python3",
    vec!["print(\"hi\")".to_string()],
    Some("group-1".to_string()),
    KernelLaunchOptions::default(),
  );
  assert_eq!(manager.run_until_complete().await.unwrap(), 0);
  pool.shutdown_all().await;

  let mut saw_started = false;
  let mut saw_output = false;
  while let Ok(event) = rx.try_recv() {
    if let Event::KernelExecutionMsg { payload, .. } = event {
      match payload["type"].as_str() {
        Some("execution_started") => saw_started = true,
        Some("kernel_output") => {
          saw_output = true;
          assert_eq!(payload["msg_type"], "stream");
        }
        _ => {}
      }
    }
  }
  assert!(saw_started);
  assert!(saw_output);
}

#[cfg(unix)]
#[tokio::test]
async fn error_iopub_message_fails_the_command() {
  let io = vec![KernelIoMessage {
    msg_type: "error".to_string(),
    content: json!({"ename": "RuntimeError"}),
  }];
  let pool = Arc::new(pool(scripted_factory(true, io, KernelReplyStatus::Ok)));
  let (logger, _rx) = logger();
  let mut manager = KernelExecutionManager::new(
    logger,
    pool.clone(),
    "python3",
    vec!["boom".to_string()],
    Some("group-1".to_string()),
    KernelLaunchOptions::default(),
  );
  assert_eq!(manager.run_until_complete().await.unwrap(), -1);
  pool.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn startup_timeout_fails_the_execution() {
  let pool = Arc::new(pool(scripted_factory(false, vec![], KernelReplyStatus::Ok)));
  let (logger, mut rx) = logger();
  let options = KernelLaunchOptions {
    startup_timeout: Duration::from_millis(50),
    ..KernelLaunchOptions::default()
  };
  let mut manager = KernelExecutionManager::new(
    logger,
    pool.clone(),
    "python3",
    vec!["print(1)".to_string()],
    Some("group-1".to_string()),
    options,
  );
  assert_eq!(manager.run_until_complete().await.unwrap(), -1);
  pool.shutdown_all().await;

  let mut saw_failure = false;
  while let Ok(event) = rx.try_recv() {
    if let Event::KernelExecutionMsg { payload, .. } = event {
      if payload["type"] == "execution_failed_to_start" {
        saw_failure = true;
      }
    }
  }
  assert!(saw_failure);
}
