//! Persistent REPL managers.
//!
//! A [`PersistentManager`] owns a long-running interactive interpreter whose
//! bootstrap loads a helper module implementing a small request protocol over
//! a loopback socket. Command completion is detected with a sentinel: after
//! the user command, a ping command is written to stdin; when the interpreter
//! becomes idle it connects back to a driver-chosen port and reports `ok` or
//! `error`.
//!
//! ```text
//!   driver                                child interpreter
//!     │  stdin: <wrapped command>            │
//!     │  stdin: ping("127.0.0.1", port) ────▶│ runs command, then ping
//!     │◀── stdout/stderr reader tasks ───────│
//!     │◀── "ok" / "error" on sentinel port ──│
//!     │                                      │
//!     │── completions / history / is_complete│ (helper server, port from a
//!     │            per-request TCP ─────────▶│  marker line on stdout)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::signal;

/// Marker the child helper prints on stdout to report its server port.
pub const REPL_PORT_MARKER: &str = "sluice-repl-port:";

/// Request/argument framing of the helper protocol.
const UNIT_SEPARATOR: char = '\u{1f}';
const ARGS_SEPARATOR: char = '\u{91}';

const HELPER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_millis(20);
const HELPER_CONNECT_RETRIES: usize = 5;

/// Where a [`ReplMessage`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplMessageKind {
  Stdin,
  Stdout,
  Stderr,
}

/// One line of interpreter traffic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplMessage {
  #[serde(rename = "type")]
  pub kind: ReplMessageKind,
  pub data: String,
}

impl ReplMessage {
  pub fn stdin(data: impl Into<String>) -> Self {
    Self {
      kind: ReplMessageKind::Stdin,
      data: data.into(),
    }
  }

  pub fn stdout(data: impl Into<String>) -> Self {
    Self {
      kind: ReplMessageKind::Stdout,
      data: data.into(),
    }
  }

  pub fn stderr(data: impl Into<String>) -> Self {
    Self {
      kind: ReplMessageKind::Stderr,
      data: data.into(),
    }
  }

  /// The `{type, data}` payload form used on execution events.
  pub fn to_payload(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or_default()
  }
}

/// Language-specific launch and wrapping rules for a persistent interpreter.
pub trait PersistentLanguage: Send + Sync {
  fn language(&self) -> &'static str;

  /// Switches appended to the interpreter argv: interactive mode plus the
  /// bootstrap that loads the helper module and starts its server.
  fn interactive_args(&self) -> Vec<String>;

  /// Rewrites a command so the helper records whether it raised.
  fn wrap_command(&self, cmd: &str) -> String;

  /// The command that makes the child report idleness to the sentinel port.
  fn ping_command(&self, host: &str, port: u16) -> String;
}

/// Python: `-i -u -c` with the helper module on `sys.path`.
pub struct PythonLanguage {
  pub helper_dir: PathBuf,
}

impl PersistentLanguage for PythonLanguage {
  fn language(&self) -> &'static str {
    "python"
  }

  fn interactive_args(&self) -> Vec<String> {
    let helper_dir = self.helper_dir.to_string_lossy().replace('\\', "/");
    vec![
      "-i".to_string(),
      "-u".to_string(),
      "-c".to_string(),
      format!(
        "import sys; sys.ps1 = sys.ps2 = ''; sys.path.append('{}'); \
         import sluice_repl; sluice_repl.start_server()",
        helper_dir
      ),
    ]
  }

  fn wrap_command(&self, cmd: &str) -> String {
    let cmd_lines: Vec<&str> = cmd.lines().collect();
    let indent = if cmd_lines.iter().any(|line| line.starts_with('\t')) {
      "\t"
    } else {
      "  "
    };
    let mut lines = vec!["try:".to_string()];
    lines.push(format!("{}sluice_repl.set_exception(False)", indent));
    for line in &cmd_lines {
      lines.push(format!("{}{}", indent, line));
    }
    lines.push("except:".to_string());
    lines.push(format!("{}sluice_repl.set_exception(True)", indent));
    lines.push(format!("{}raise", indent));
    lines.join("\n")
  }

  fn ping_command(&self, host: &str, port: u16) -> String {
    format!("sluice_repl.ping(\"{}\", {})", host, port)
  }
}

/// Julia: `-i -e` including the helper script.
pub struct JuliaLanguage {
  pub helper_script: PathBuf,
  pub project: Option<String>,
}

impl PersistentLanguage for JuliaLanguage {
  fn language(&self) -> &'static str {
    "julia"
  }

  fn interactive_args(&self) -> Vec<String> {
    let script = self.helper_script.to_string_lossy().replace('\\', "/");
    let mut args = vec![
      "-i".to_string(),
      "-e".to_string(),
      format!("include(\"{}\"); SluiceREPL.start_server()", script),
      "--color=yes".to_string(),
      "--banner=no".to_string(),
    ];
    if let Some(project) = &self.project {
      args.push(format!("--project={}", project));
    }
    args
  }

  fn wrap_command(&self, cmd: &str) -> String {
    format!(
      "try SluiceREPL.set_exception(false); @eval {} catch; \
       SluiceREPL.set_exception(true); rethrow() end",
      cmd
    )
  }

  fn ping_command(&self, host: &str, port: u16) -> String {
    format!("SluiceREPL.ping(\"{}\", {})", host, port)
  }
}

/// Owns one persistent interpreter subprocess.
///
/// At most one command is in flight at a time; concurrent callers queue on an
/// internal lock. The manager survives interpreter restarts, so pools can
/// keep handing out the same instance.
pub struct PersistentManager {
  args: Vec<String>,
  language: Arc<dyn PersistentLanguage>,
  stdin: tokio::sync::Mutex<Option<ChildStdin>>,
  queue_tx: mpsc::UnboundedSender<ReplMessage>,
  queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReplMessage>>,
  helper_tx: watch::Sender<Option<SocketAddr>>,
  helper_rx: watch::Receiver<Option<SocketAddr>>,
  alive_tx: watch::Sender<bool>,
  alive_rx: watch::Receiver<bool>,
  command_lock: tokio::sync::Mutex<()>,
  command_successful: AtomicBool,
  pid: Mutex<Option<i32>>,
}

impl std::fmt::Debug for PersistentManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PersistentManager")
      .field("args", &self.args)
      .field("command_successful", &self.command_successful)
      .field("pid", &self.pid)
      .finish()
  }
}

impl PersistentManager {
  /// Spawns the interpreter and waits for its helper to come up.
  pub async fn start(
    args: Vec<String>,
    language: Arc<dyn PersistentLanguage>,
  ) -> Result<Arc<Self>, ExecError> {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let (helper_tx, helper_rx) = watch::channel(None);
    let (alive_tx, alive_rx) = watch::channel(false);
    let manager = Arc::new(Self {
      args,
      language,
      stdin: tokio::sync::Mutex::new(None),
      queue_tx,
      queue_rx: tokio::sync::Mutex::new(queue_rx),
      helper_tx,
      helper_rx,
      alive_tx,
      alive_rx,
      command_lock: tokio::sync::Mutex::new(()),
      command_successful: AtomicBool::new(false),
      pid: Mutex::new(None),
    });
    manager.spawn_child().await?;
    manager.wait_for_helper().await?;
    Ok(manager)
  }

  pub fn language(&self) -> &'static str {
    self.language.language()
  }

  pub fn args(&self) -> &[String] {
    &self.args
  }

  /// The port of the in-child helper server, once reported.
  pub fn helper_port(&self) -> Option<u16> {
    (*self.helper_rx.borrow()).map(|addr| addr.port())
  }

  pub fn is_persistent_alive(&self) -> bool {
    *self.alive_rx.borrow()
  }

  /// Whether the last issued command finished without error.
  pub fn command_successful(&self) -> bool {
    self.command_successful.load(Ordering::SeqCst)
  }

  async fn spawn_child(&self) -> Result<(), ExecError> {
    let mut argv = self.args.clone();
    argv.extend(self.language.interactive_args());
    let (program, rest) = argv.split_first().ok_or_else(|| ExecError::Spawn {
      program: String::new(),
      source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;
    let mut child = Command::new(program)
      .args(rest)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
      })?;
    *self.pid.lock().unwrap() = child.id().map(|pid| pid as i32);
    *self.stdin.lock().await = child.stdin.take();
    let _ = self.helper_tx.send(None);
    let _ = self.alive_tx.send(true);
    info!(program = %program, language = self.language.language(), "persistent interpreter started");

    let stdout = child.stdout.take();
    let queue_tx = self.queue_tx.clone();
    let helper_tx = self.helper_tx.clone();
    tokio::spawn(async move {
      let Some(stdout) = stdout else {
        return;
      };
      let mut lines = BufReader::new(stdout).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        if let Some(port) = line.trim().strip_prefix(REPL_PORT_MARKER) {
          match port.trim().parse::<u16>() {
            Ok(port) => {
              let addr = SocketAddr::from(([127, 0, 0, 1], port));
              let _ = helper_tx.send(Some(addr));
              continue;
            }
            Err(_) => warn!(line = %line, "unparseable helper port marker"),
          }
        }
        let _ = queue_tx.send(ReplMessage::stdout(line));
      }
    });

    let stderr = child.stderr.take();
    let queue_tx = self.queue_tx.clone();
    tokio::spawn(async move {
      let Some(stderr) = stderr else {
        return;
      };
      let mut lines = BufReader::new(stderr).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let _ = queue_tx.send(ReplMessage::stderr(line));
      }
    });

    let queue_tx = self.queue_tx.clone();
    let alive_tx = self.alive_tx.clone();
    let helper_tx = self.helper_tx.clone();
    tokio::spawn(async move {
      let status = child.wait().await;
      let description = match status {
        Ok(status) => match status.code() {
          Some(code) => format!("persistent process exited with code {}", code),
          None => "persistent process was terminated by a signal".to_string(),
        },
        Err(err) => format!("waiting on persistent process failed: {}", err),
      };
      let _ = queue_tx.send(ReplMessage::stderr(description));
      let _ = helper_tx.send(None);
      let _ = alive_tx.send(false);
    });
    Ok(())
  }

  async fn wait_for_helper(&self) -> Result<SocketAddr, ExecError> {
    let mut helper_rx = self.helper_rx.clone();
    let mut alive_rx = self.alive_rx.clone();
    let wait = async {
      loop {
        if let Some(addr) = *helper_rx.borrow_and_update() {
          return Ok(addr);
        }
        if !*alive_rx.borrow_and_update() {
          return Err(ExecError::NotRunning);
        }
        tokio::select! {
          changed = helper_rx.changed() => {
            if changed.is_err() {
              return Err(ExecError::NotRunning);
            }
          }
          _ = alive_rx.changed() => {}
        }
      }
    };
    tokio::time::timeout(HELPER_STARTUP_TIMEOUT, wait)
      .await
      .map_err(|_| ExecError::HelperStartupTimeout {
        timeout: HELPER_STARTUP_TIMEOUT,
      })?
  }

  /// Issues a command and returns the stream of its messages.
  ///
  /// The stream carries the echoed stdin line, then stdout/stderr as they
  /// arrive, and ends when the sentinel fires or the interpreter dies. Query
  /// [`PersistentManager::command_successful`] afterwards for the verdict.
  pub fn issue_command(
    self: &Arc<Self>,
    cmd: &str,
    add_history: bool,
  ) -> mpsc::UnboundedReceiver<ReplMessage> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let manager = Arc::clone(self);
    let cmd = cmd.to_string();
    tokio::spawn(async move {
      manager.issue_command_inner(cmd, add_history, out_tx).await;
    });
    out_rx
  }

  async fn issue_command_inner(
    &self,
    cmd: String,
    add_history: bool,
    out_tx: mpsc::UnboundedSender<ReplMessage>,
  ) {
    let _guard = self.command_lock.lock().await;
    self.command_successful.store(false, Ordering::SeqCst);
    if !self.is_persistent_alive() {
      let _ = out_tx.send(ReplMessage::stderr("persistent process is not running"));
      return;
    }
    let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
      Ok(listener) => listener,
      Err(err) => {
        let _ = out_tx.send(ReplMessage::stderr(format!(
          "could not open sentinel port: {}",
          err
        )));
        return;
      }
    };
    let port = match listener.local_addr() {
      Ok(addr) => addr.port(),
      Err(err) => {
        let _ = out_tx.send(ReplMessage::stderr(format!(
          "could not open sentinel port: {}",
          err
        )));
        return;
      }
    };
    let _ = out_tx.send(ReplMessage::stdin(cmd.clone()));
    let wrapped = self.language.wrap_command(&cmd);
    let ping = self.language.ping_command("127.0.0.1", port);
    // The blank line terminates a compound statement in line-based REPLs.
    let written = self.write_line(&wrapped).await.is_ok()
      && self.write_line("").await.is_ok()
      && self.write_line(&ping).await.is_ok();
    if !written {
      let _ = out_tx.send(ReplMessage::stderr("writing to interpreter stdin failed"));
      return;
    }

    let sentinel = read_sentinel(listener);
    tokio::pin!(sentinel);
    let mut alive_rx = self.alive_rx.clone();
    let mut queue = self.queue_rx.lock().await;
    let verdict = loop {
      if !*alive_rx.borrow_and_update() {
        break None;
      }
      tokio::select! {
        verdict = &mut sentinel => break verdict,
        message = queue.recv() => match message {
          Some(message) => {
            let _ = out_tx.send(message);
          }
          None => break None,
        },
        _ = alive_rx.changed() => {
          if !*alive_rx.borrow() {
            break None;
          }
        }
      }
    };
    // Late output: the pipes may still hold lines produced before the ping.
    while let Ok(Some(message)) =
      tokio::time::timeout(QUEUE_DRAIN_TIMEOUT, queue.recv()).await
    {
      let _ = out_tx.send(message);
    }
    drop(queue);

    let successful = verdict.unwrap_or(false);
    self.command_successful.store(successful, Ordering::SeqCst);
    debug!(successful, "command finished");
    if successful && add_history {
      if let Err(err) = self.helper_request("add_history", &[&cmd]).await {
        warn!(error = %err, "recording history failed");
      }
    }
  }

  async fn write_line(&self, line: &str) -> std::io::Result<()> {
    let mut stdin = self.stdin.lock().await;
    let stdin = stdin
      .as_mut()
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
  }

  /// Drains whatever the interpreter printed outside a command (banners,
  /// restart noise).
  pub async fn drain_queue(&self) -> Vec<ReplMessage> {
    let mut drained = Vec::new();
    let mut queue = self.queue_rx.lock().await;
    while let Ok(Some(message)) =
      tokio::time::timeout(QUEUE_DRAIN_TIMEOUT, queue.recv()).await
    {
      drained.push(message);
    }
    drained
  }

  /// Sends one request to the in-child helper and returns the response line.
  pub async fn helper_request(&self, request: &str, args: &[&str]) -> Result<String, ExecError> {
    let addr = (*self.helper_rx.borrow()).ok_or(ExecError::NotRunning)?;
    let mut stream = connect_with_retries(addr).await.map_err(|source| {
      ExecError::HelperRequest {
        request: request.to_string(),
        source,
      }
    })?;
    let message = format!(
      "{}{}{}",
      request,
      UNIT_SEPARATOR,
      args.join(&ARGS_SEPARATOR.to_string())
    );
    let io_error = |source| ExecError::HelperRequest {
      request: request.to_string(),
      source,
    };
    stream.write_all(message.as_bytes()).await.map_err(io_error)?;
    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await.map_err(io_error)?;
    Ok(response.trim_end_matches(['\r', '\n']).to_string())
  }

  /// Autocompletion options for the given text.
  pub async fn get_completions(&self, text: &str) -> Result<Vec<String>, ExecError> {
    let response = self.helper_request("completions", &[text]).await?;
    Ok(
      response
        .split_whitespace()
        .map(str::to_string)
        .collect(),
    )
  }

  /// History item by one-based index from the most recent.
  pub async fn get_history_item(&self, index: usize) -> Result<String, ExecError> {
    self
      .helper_request("history_item", &[&index.to_string()])
      .await
  }

  /// Whether the text forms a complete command in the underlying language.
  pub async fn is_complete(&self, cmd: &str) -> Result<bool, ExecError> {
    let response = self.helper_request("is_complete", &[cmd]).await?;
    Ok(response.trim() == "true")
  }

  /// Interrupts the command in flight; never kills the interpreter.
  pub fn interrupt_persistent(&self) {
    if let Some(pid) = *self.pid.lock().unwrap() {
      signal::interrupt(pid);
    }
  }

  /// Kills and re-spawns the interpreter. Returns the output drained during
  /// the restart (banner lines and the exit notice of the old process).
  pub async fn restart_persistent(&self) -> Result<Vec<ReplMessage>, ExecError> {
    let _guard = self.command_lock.lock().await;
    self.kill_process();
    let mut alive_rx = self.alive_rx.clone();
    while *alive_rx.borrow_and_update() {
      if alive_rx.changed().await.is_err() {
        break;
      }
    }
    self.spawn_child().await?;
    self.wait_for_helper().await?;
    Ok(self.drain_queue().await)
  }

  /// Forceful kill. The manager is dead until restarted.
  pub fn kill_process(&self) {
    if let Some(pid) = *self.pid.lock().unwrap() {
      signal::kill(pid);
    }
  }
}

async fn connect_with_retries(addr: SocketAddr) -> std::io::Result<TcpStream> {
  let mut last_error = None;
  for _ in 0..HELPER_CONNECT_RETRIES {
    match TcpStream::connect(addr).await {
      Ok(stream) => return Ok(stream),
      Err(err) => {
        last_error = Some(err);
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
    }
  }
  Err(last_error.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "unreachable")))
}

/// Accepts one sentinel connection and reads the verdict.
async fn read_sentinel(listener: TcpListener) -> Option<bool> {
  let (mut connection, _) = listener.accept().await.ok()?;
  let mut data = Vec::new();
  let mut buffer = [0u8; 64];
  loop {
    match connection.read(&mut buffer).await {
      Ok(0) | Err(_) => break,
      Ok(n) => {
        data.extend_from_slice(&buffer[..n]);
        let text = String::from_utf8_lossy(&data);
        if text.contains("error") {
          return Some(false);
        }
        if text.contains("ok") {
          return Some(true);
        }
      }
    }
  }
  Some(String::from_utf8_lossy(&data).trim() == "ok")
}

/// Key of a pooled persistent manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentKey {
  pub args: Vec<String>,
  pub group_id: String,
}

#[derive(Default)]
struct PoolInner {
  managers: HashMap<PersistentKey, Arc<PersistentManager>>,
  isolated: Vec<Arc<PersistentManager>>,
  open: bool,
}

/// Keyed cache of persistent managers.
///
/// Managers are shared by `(argv, group id)`; callers without a group id get
/// an isolated manager that is still tracked for shutdown. A closed pool
/// creates no new managers.
pub struct PersistentManagerPool {
  inner: Mutex<PoolInner>,
}

impl Default for PersistentManagerPool {
  fn default() -> Self {
    Self::new()
  }
}

impl PersistentManagerPool {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(PoolInner {
        open: true,
        ..PoolInner::default()
      }),
    }
  }

  /// Returns the pooled manager for the key, starting one if needed. Dead
  /// managers are evicted and replaced.
  pub async fn manager(
    &self,
    language: Arc<dyn PersistentLanguage>,
    args: Vec<String>,
    group_id: Option<&str>,
  ) -> Result<Arc<PersistentManager>, ExecError> {
    let key = group_id.map(|group_id| PersistentKey {
      args: args.clone(),
      group_id: group_id.to_string(),
    });
    {
      let inner = self.inner.lock().unwrap();
      if !inner.open {
        return Err(ExecError::PoolClosed);
      }
      if let Some(key) = &key {
        if let Some(existing) = inner.managers.get(key) {
          if existing.is_persistent_alive() {
            return Ok(Arc::clone(existing));
          }
        }
      }
    }
    let manager = PersistentManager::start(args, language).await?;
    let mut inner = self.inner.lock().unwrap();
    if !inner.open {
      manager.kill_process();
      return Err(ExecError::PoolClosed);
    }
    match key {
      Some(key) => {
        // A racing caller may have inserted first; the earlier one wins.
        if let Some(existing) = inner.managers.get(&key) {
          if existing.is_persistent_alive() {
            manager.kill_process();
            return Ok(Arc::clone(existing));
          }
        }
        inner.managers.insert(key, Arc::clone(&manager));
      }
      None => inner.isolated.push(Arc::clone(&manager)),
    }
    Ok(manager)
  }

  /// The pooled manager for a key, if any.
  pub fn get(&self, key: &PersistentKey) -> Option<Arc<PersistentManager>> {
    self.inner.lock().unwrap().managers.get(key).cloned()
  }

  /// Stops creating new managers.
  pub fn close(&self) {
    self.inner.lock().unwrap().open = false;
  }

  /// Allows creating managers again.
  pub fn open(&self) {
    self.inner.lock().unwrap().open = true;
  }

  /// Kills every pooled and isolated interpreter and forgets them.
  pub fn kill_all(&self) {
    let mut inner = self.inner.lock().unwrap();
    for manager in inner.managers.values() {
      manager.kill_process();
    }
    for manager in &inner.isolated {
      manager.kill_process();
    }
    inner.managers.clear();
    inner.isolated.clear();
  }
}

/// Runs a list of commands on a pooled persistent interpreter, relaying the
/// traffic as `persistent_execution_msg` events.
pub struct PersistentExecutionManager {
  logger: sluice_workflow::QueueLogger,
  pool: Arc<PersistentManagerPool>,
  language: Arc<dyn PersistentLanguage>,
  args: Vec<String>,
  commands: Vec<String>,
  alias: String,
  group_id: Option<String>,
  manager: Mutex<Option<Arc<PersistentManager>>>,
}

impl PersistentExecutionManager {
  pub fn new(
    logger: sluice_workflow::QueueLogger,
    pool: Arc<PersistentManagerPool>,
    language: Arc<dyn PersistentLanguage>,
    args: Vec<String>,
    commands: Vec<String>,
    alias: impl Into<String>,
    group_id: Option<String>,
  ) -> Self {
    Self {
      logger,
      pool,
      language,
      args,
      commands,
      alias: alias.into(),
      group_id,
      manager: Mutex::new(None),
    }
  }
}

#[async_trait::async_trait]
impl crate::manager::ExecutionManager for PersistentExecutionManager {
  async fn run_until_complete(&mut self) -> Result<i32, ExecError> {
    let manager = match self
      .pool
      .manager(
        Arc::clone(&self.language),
        self.args.clone(),
        self.group_id.as_deref(),
      )
      .await
    {
      Ok(manager) => manager,
      Err(err) => {
        self
          .logger
          .msg_persistent_execution(json!({
            "type": "persistent_failed_to_start",
            "args": self.args.join(" "),
            "error": err.to_string(),
          }))
          .await;
        return Ok(-1);
      }
    };
    *self.manager.lock().unwrap() = Some(Arc::clone(&manager));
    self
      .logger
      .msg_persistent_execution(json!({
        "type": "persistent_started",
        "language": manager.language(),
        "port": manager.helper_port(),
      }))
      .await;
    self
      .logger
      .msg_persistent_execution(json!({
        "type": "execution_started",
        "args": self.args.join(" "),
      }))
      .await;
    self
      .logger
      .msg_persistent_execution(
        ReplMessage::stdin(format!("# Running {}", self.alias.trim_end())).to_payload(),
      )
      .await;
    for message in manager.drain_queue().await {
      self.logger.msg_persistent_execution(message.to_payload()).await;
    }

    for cmd in &self.commands {
      let mut messages = manager.issue_command(cmd, false);
      while let Some(message) = messages.recv().await {
        if message.kind != ReplMessageKind::Stdin {
          self
            .logger
            .msg_persistent_execution(message.to_payload())
            .await;
        }
      }
      if !manager.command_successful() {
        return Ok(-1);
      }
    }
    Ok(0)
  }

  fn stop_execution(&self) {
    if let Some(manager) = self.manager.lock().unwrap().as_ref() {
      manager.interrupt_persistent();
    }
  }
}
