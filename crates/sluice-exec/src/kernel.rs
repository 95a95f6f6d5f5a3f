//! Kernel execution managers.
//!
//! A [`KernelManager`] launches a Jupyter-style kernel from its installed
//! spec, owns its connection file and process, and hands out a
//! [`KernelChannels`] client for the message channels. Managers are pooled by
//! `(kernel name, group id)`; restart and shutdown are addressable by
//! connection-file path so remote clients need not know the group key.
//!
//! The channel wire protocol itself is an external collaborator: the pool is
//! constructed with a factory that builds the [`KernelChannels`] client for a
//! connection file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sluice_workflow::QueueLogger;

use crate::error::ExecError;
use crate::manager::ExecutionManager;
use crate::signal;

/// Default kernel startup timeout.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// An installed (or synthesized) kernel spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
  pub name: String,
  pub display_name: String,
  pub language: String,
  /// Launch argv; `{connection_file}` is substituted before spawning.
  pub argv: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct KernelSpecFile {
  argv: Vec<String>,
  display_name: String,
  language: String,
}

/// Scans the standard jupyter kernel locations for `kernel.json` specs.
pub fn find_kernel_specs() -> BTreeMap<String, KernelSpec> {
  let mut specs = BTreeMap::new();
  for dir in jupyter_kernel_dirs() {
    let Ok(entries) = std::fs::read_dir(&dir) else {
      continue;
    };
    for entry in entries.flatten() {
      let resource_dir = entry.path();
      let Some(name) = resource_dir.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      let Ok(raw) = std::fs::read_to_string(resource_dir.join("kernel.json")) else {
        continue;
      };
      let Ok(file) = serde_json::from_str::<KernelSpecFile>(&raw) else {
        warn!(kernel = name, "skipping malformed kernel.json");
        continue;
      };
      // Earlier locations shadow later ones, like jupyter itself.
      specs.entry(name.to_string()).or_insert(KernelSpec {
        name: name.to_string(),
        display_name: file.display_name,
        language: file.language,
        argv: file.argv,
        resource_dir: Some(resource_dir),
      });
    }
  }
  specs
}

fn jupyter_kernel_dirs() -> Vec<PathBuf> {
  let mut dirs = Vec::new();
  if let Ok(jupyter_path) = std::env::var("JUPYTER_PATH") {
    for dir in std::env::split_paths(&jupyter_path) {
      dirs.push(dir.join("kernels"));
    }
  }
  if let Some(home) = std::env::var_os("HOME") {
    dirs.push(
      PathBuf::from(home)
        .join(".local/share/jupyter")
        .join("kernels"),
    );
  }
  if let Some(appdata) = std::env::var_os("APPDATA") {
    dirs.push(PathBuf::from(appdata).join("jupyter").join("kernels"));
  }
  dirs.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
  dirs.push(PathBuf::from("/usr/share/jupyter/kernels"));
  dirs
}

/// The contents of a kernel connection file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
  pub transport: String,
  pub ip: String,
  pub shell_port: u16,
  pub iopub_port: u16,
  pub stdin_port: u16,
  pub control_port: u16,
  pub hb_port: u16,
  pub key: String,
  pub signature_scheme: String,
}

impl ConnectionInfo {
  /// Builds a loopback connection with five OS-assigned free ports.
  pub async fn new_local() -> std::io::Result<Self> {
    let mut ports = [0u16; 5];
    for port in &mut ports {
      let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
      *port = listener.local_addr()?.port();
    }
    Ok(Self {
      transport: "tcp".to_string(),
      ip: "127.0.0.1".to_string(),
      shell_port: ports[0],
      iopub_port: ports[1],
      stdin_port: ports[2],
      control_port: ports[3],
      hb_port: ports[4],
      key: uuid::Uuid::new_v4().to_string(),
      signature_scheme: "hmac-sha256".to_string(),
    })
  }
}

/// Status of an `execute_request` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelReplyStatus {
  Ok,
  Error,
  Aborted,
}

/// One message relayed from the io-pub channel.
#[derive(Debug, Clone)]
pub struct KernelIoMessage {
  pub msg_type: String,
  pub content: serde_json::Value,
}

/// The kernel message channels, as the managers consume them.
#[async_trait]
pub trait KernelChannels: Send + Sync {
  /// Blocks until the kernel answers on its channels, or the timeout lapses.
  async fn wait_for_ready(&self, timeout: Duration) -> Result<(), ExecError>;

  /// Executes one command, streaming io-pub output into `io`.
  async fn execute(
    &self,
    code: &str,
    io: mpsc::UnboundedSender<KernelIoMessage>,
  ) -> Result<KernelReplyStatus, ExecError>;

  /// Asks the kernel to shut down cleanly.
  async fn shutdown(&self);
}

/// Builds a channels client for a freshly launched kernel.
pub type KernelChannelsFactory =
  Arc<dyn Fn(&ConnectionInfo) -> Arc<dyn KernelChannels> + Send + Sync>;

/// Owns one kernel process and its connection file.
pub struct KernelManager {
  kernel_name: String,
  connection_file: PathBuf,
  channels: Arc<dyn KernelChannels>,
  pid: Mutex<Option<i32>>,
  alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for KernelManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KernelManager")
      .field("kernel_name", &self.kernel_name)
      .field("connection_file", &self.connection_file)
      .field("pid", &self.pid)
      .field("alive", &self.alive)
      .finish()
  }
}

impl KernelManager {
  async fn launch(
    kernel_name: &str,
    spec: &KernelSpec,
    workdir: Option<&Path>,
    extra_switches: &[String],
    factory: &KernelChannelsFactory,
  ) -> Result<Arc<Self>, ExecError> {
    let connection = ConnectionInfo::new_local()
      .await
      .map_err(|source| ExecError::ConnectionFile {
        path: String::new(),
        source,
      })?;
    let dir = std::env::temp_dir().join("sluice-kernels");
    let connection_file = dir.join(format!("kernel-{}.json", uuid::Uuid::new_v4()));
    let write = std::fs::create_dir_all(&dir).and_then(|_| {
      std::fs::write(
        &connection_file,
        serde_json::to_vec_pretty(&connection).unwrap_or_default(),
      )
    });
    write.map_err(|source| ExecError::ConnectionFile {
      path: connection_file.to_string_lossy().into_owned(),
      source,
    })?;

    let mut argv: Vec<String> = spec
      .argv
      .iter()
      .map(|arg| arg.replace("{connection_file}", &connection_file.to_string_lossy()))
      .collect();
    if !extra_switches.is_empty() {
      // Switches go right after the program, before the launcher arguments.
      argv.splice(1..1, extra_switches.iter().cloned());
    }
    let (program, rest) = argv.split_first().ok_or_else(|| ExecError::Spawn {
      program: String::new(),
      source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty kernel argv"),
    })?;
    let mut command = Command::new(program);
    command
      .args(rest)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null());
    if let Some(workdir) = workdir {
      command.current_dir(workdir);
    }
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
      program: program.clone(),
      source,
    })?;
    info!(kernel = kernel_name, connection_file = %connection_file.display(), "kernel started");

    let alive = Arc::new(AtomicBool::new(true));
    let pid = child.id().map(|pid| pid as i32);
    let alive_flag = Arc::clone(&alive);
    tokio::spawn(async move {
      let _ = child.wait().await;
      alive_flag.store(false, Ordering::SeqCst);
    });

    let channels = factory(&connection);
    Ok(Arc::new(Self {
      kernel_name: kernel_name.to_string(),
      connection_file,
      channels,
      pid: Mutex::new(pid),
      alive,
    }))
  }

  pub fn kernel_name(&self) -> &str {
    &self.kernel_name
  }

  pub fn connection_file(&self) -> &Path {
    &self.connection_file
  }

  pub fn channels(&self) -> Arc<dyn KernelChannels> {
    Arc::clone(&self.channels)
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  /// Interrupts the command in flight.
  pub fn interrupt(&self) {
    if let Some(pid) = *self.pid.lock().unwrap() {
      signal::interrupt(pid);
    }
  }

  /// Clean shutdown through the channels, escalating to a kill, and removes
  /// the connection file.
  pub async fn shutdown(&self) {
    self.channels.shutdown().await;
    if self.is_alive() {
      if let Some(pid) = *self.pid.lock().unwrap() {
        signal::kill(pid);
      }
    }
    if let Err(err) = std::fs::remove_file(&self.connection_file) {
      if err.kind() != std::io::ErrorKind::NotFound {
        warn!(path = %self.connection_file.display(), error = %err, "connection file not removed");
      }
    }
  }
}

/// Resolves kernel names to launchable specs.
#[async_trait]
pub trait KernelSpecProvider: Send + Sync {
  async fn find(&self, kernel_name: &str) -> Option<KernelSpec>;
}

/// The specs installed under the jupyter kernel directories.
pub struct InstalledKernelSpecs;

#[async_trait]
impl KernelSpecProvider for InstalledKernelSpecs {
  async fn find(&self, kernel_name: &str) -> Option<KernelSpec> {
    find_kernel_specs().remove(kernel_name)
  }
}

/// Key of a pooled kernel manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
  pub kernel_name: String,
  pub group_id: String,
}

/// Launch knobs for one kernel execution.
#[derive(Debug, Clone)]
pub struct KernelLaunchOptions {
  pub workdir: Option<PathBuf>,
  /// Extra interpreter switches, inserted before the launcher arguments.
  pub extra_switches: Vec<String>,
  pub startup_timeout: Duration,
}

impl Default for KernelLaunchOptions {
  fn default() -> Self {
    Self {
      workdir: None,
      extra_switches: Vec::new(),
      startup_timeout: DEFAULT_STARTUP_TIMEOUT,
    }
  }
}

#[derive(Default)]
struct KernelPoolInner {
  managers: HashMap<KernelKey, Arc<KernelManager>>,
  isolated: Vec<Arc<KernelManager>>,
  key_by_connection_file: HashMap<PathBuf, KernelKey>,
}

/// Keyed cache of kernel managers with connection-file reverse lookup.
pub struct KernelManagerPool {
  inner: Mutex<KernelPoolInner>,
  spec_provider: Arc<dyn KernelSpecProvider>,
  channels_factory: KernelChannelsFactory,
}

impl KernelManagerPool {
  pub fn new(channels_factory: KernelChannelsFactory) -> Self {
    Self {
      inner: Mutex::new(KernelPoolInner::default()),
      spec_provider: Arc::new(InstalledKernelSpecs),
      channels_factory,
    }
  }

  /// Replaces the spec provider (e.g. with a conda-backed one).
  pub fn with_spec_provider(mut self, provider: Arc<dyn KernelSpecProvider>) -> Self {
    self.spec_provider = provider;
    self
  }

  /// Returns the pooled manager for `(kernel_name, group_id)`, launching one
  /// if needed. Dead kernels are evicted and replaced.
  pub async fn manager(
    &self,
    logger: &QueueLogger,
    kernel_name: &str,
    group_id: Option<&str>,
    options: &KernelLaunchOptions,
  ) -> Result<Arc<KernelManager>, ExecError> {
    let key = group_id.map(|group_id| KernelKey {
      kernel_name: kernel_name.to_string(),
      group_id: group_id.to_string(),
    });
    if let Some(key) = &key {
      let inner = self.inner.lock().unwrap();
      if let Some(existing) = inner.managers.get(key) {
        if existing.is_alive() {
          return Ok(Arc::clone(existing));
        }
      }
    }

    let Some(spec) = self.spec_provider.find(kernel_name).await else {
      logger
        .msg_kernel_execution(json!({
          "type": "kernel_spec_not_found",
          "kernel_name": kernel_name,
        }))
        .await;
      return Err(ExecError::KernelSpecNotFound {
        kernel_name: kernel_name.to_string(),
      });
    };
    if let Some(program) = spec.argv.first() {
      let path = Path::new(program);
      if path.is_absolute() && !path.exists() {
        logger
          .msg_kernel_execution(json!({
            "type": "kernel_spec_exe_not_found",
            "kernel_name": kernel_name,
            "kernel_exe_path": program,
          }))
          .await;
        return Err(ExecError::KernelExecutableNotFound {
          kernel_name: kernel_name.to_string(),
          path: program.clone(),
        });
      }
    }

    let manager = KernelManager::launch(
      kernel_name,
      &spec,
      options.workdir.as_deref(),
      &options.extra_switches,
      &self.channels_factory,
    )
    .await?;
    {
      let mut inner = self.inner.lock().unwrap();
      match &key {
        Some(key) => {
          if let Some(replaced) = inner.managers.insert(key.clone(), Arc::clone(&manager)) {
            inner.key_by_connection_file.remove(replaced.connection_file());
          }
          inner
            .key_by_connection_file
            .insert(manager.connection_file().to_path_buf(), key.clone());
        }
        None => inner.isolated.push(Arc::clone(&manager)),
      }
    }
    logger
      .msg_kernel_execution(json!({
        "type": "kernel_started",
        "kernel_name": kernel_name,
        "connection_file": manager.connection_file().to_string_lossy(),
      }))
      .await;
    Ok(manager)
  }

  /// The pooled manager behind a connection file, if any.
  pub fn get_by_connection_file(&self, connection_file: &Path) -> Option<Arc<KernelManager>> {
    let inner = self.inner.lock().unwrap();
    let key = inner.key_by_connection_file.get(connection_file)?;
    inner.managers.get(key).cloned()
  }

  /// Restarts the kernel behind a connection file. The key survives; the
  /// connection file changes.
  pub async fn restart_by_connection_file(
    &self,
    logger: &QueueLogger,
    connection_file: &Path,
    options: &KernelLaunchOptions,
  ) -> Result<Arc<KernelManager>, ExecError> {
    let key = {
      let mut inner = self.inner.lock().unwrap();
      let key = inner
        .key_by_connection_file
        .remove(connection_file)
        .ok_or_else(|| ExecError::KernelSpecNotFound {
          kernel_name: connection_file.to_string_lossy().into_owned(),
        })?;
      inner.managers.remove(&key).map(|old| (key, old))
    };
    let Some((key, old)) = key else {
      return Err(ExecError::NotRunning);
    };
    old.shutdown().await;
    self
      .manager(logger, &key.kernel_name, Some(&key.group_id), options)
      .await
  }

  /// Shuts the kernel behind a connection file down and forgets it.
  pub async fn shutdown_by_connection_file(&self, connection_file: &Path) -> bool {
    let manager = {
      let mut inner = self.inner.lock().unwrap();
      match inner.key_by_connection_file.remove(connection_file) {
        Some(key) => inner.managers.remove(&key),
        None => None,
      }
    };
    match manager {
      Some(manager) => {
        manager.shutdown().await;
        true
      }
      None => false,
    }
  }

  /// Shuts every pooled and isolated kernel down.
  pub async fn shutdown_all(&self) {
    let managers: Vec<Arc<KernelManager>> = {
      let mut inner = self.inner.lock().unwrap();
      inner.key_by_connection_file.clear();
      let mut managers: Vec<Arc<KernelManager>> =
        inner.managers.drain().map(|(_, manager)| manager).collect();
      managers.extend(inner.isolated.drain(..));
      managers
    };
    for manager in managers {
      manager.shutdown().await;
    }
  }
}

/// Runs a list of commands on a pooled kernel, relaying io-pub output as
/// `kernel_execution_msg` events.
pub struct KernelExecutionManager {
  logger: QueueLogger,
  pool: Arc<KernelManagerPool>,
  kernel_name: String,
  commands: Vec<String>,
  group_id: Option<String>,
  options: KernelLaunchOptions,
  manager: Mutex<Option<Arc<KernelManager>>>,
}

impl KernelExecutionManager {
  pub fn new(
    logger: QueueLogger,
    pool: Arc<KernelManagerPool>,
    kernel_name: impl Into<String>,
    commands: Vec<String>,
    group_id: Option<String>,
    options: KernelLaunchOptions,
  ) -> Self {
    Self {
      logger,
      pool,
      kernel_name: kernel_name.into(),
      commands,
      group_id,
      options,
      manager: Mutex::new(None),
    }
  }
}

#[async_trait]
impl ExecutionManager for KernelExecutionManager {
  async fn run_until_complete(&mut self) -> Result<i32, ExecError> {
    let manager = match self
      .pool
      .manager(
        &self.logger,
        &self.kernel_name,
        self.group_id.as_deref(),
        &self.options,
      )
      .await
    {
      Ok(manager) => manager,
      // The pool already reported the reason on the event stream.
      Err(_) => return Ok(-1),
    };
    *self.manager.lock().unwrap() = Some(Arc::clone(&manager));

    let channels = manager.channels();
    if let Err(err) = channels.wait_for_ready(self.options.startup_timeout).await {
      self
        .logger
        .msg_kernel_execution(json!({
          "type": "execution_failed_to_start",
          "kernel_name": self.kernel_name,
          "error": err.to_string(),
        }))
        .await;
      return Ok(-1);
    }
    self
      .logger
      .msg_kernel_execution(json!({
        "type": "execution_started",
        "kernel_name": self.kernel_name,
      }))
      .await;

    for cmd in &self.commands {
      let (io_tx, mut io_rx) = mpsc::unbounded_channel::<KernelIoMessage>();
      let logger = self.logger.clone();
      let relay = tokio::spawn(async move {
        let mut failed = false;
        while let Some(message) = io_rx.recv().await {
          if message.msg_type == "error" {
            failed = true;
          }
          logger
            .msg_kernel_execution(json!({
              "type": "kernel_output",
              "msg_type": message.msg_type,
              "content": message.content,
            }))
            .await;
        }
        failed
      });
      let status = channels.execute(cmd, io_tx).await;
      let command_failed = relay.await.unwrap_or(true);
      match status {
        Ok(KernelReplyStatus::Ok) if !command_failed => {}
        _ => return Ok(-1),
      }
    }
    Ok(0)
  }

  fn stop_execution(&self) {
    if let Some(manager) = self.manager.lock().unwrap().as_ref() {
      manager.interrupt();
    }
  }
}
