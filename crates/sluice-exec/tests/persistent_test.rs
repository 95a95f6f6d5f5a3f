//! Persistent manager integration tests against a real Python interpreter.
//!
//! Every test locates `python3` on `PATH` and returns early when none is
//! available. The helper module is written to a scratch directory; it speaks
//! the same wire protocol as the production helpers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sluice_exec::{
  PersistentKey, PersistentLanguage, PersistentManager, PersistentManagerPool, PythonLanguage,
  ReplMessage, ReplMessageKind,
};
use sluice_workflow::find_in_path;
use tempfile::TempDir;

const HELPER_MODULE: &str = r#"
import socket
import threading

_exception = False
_history = []


def set_exception(value):
    global _exception
    _exception = value


def ping(host, port):
    with socket.socket(socket.AF_INET, socket.SOCK_STREAM) as s:
        s.connect((host, port))
        s.sendall(b"error" if _exception else b"ok")


def _handle(conn):
    data = conn.recv(1000000).decode("utf8")
    request, _, raw_args = data.partition("\u001f")
    args = raw_args.split("\u0091") if raw_args else []
    if request == "completions":
        names = ("print", "property", "pow")
        response = " ".join(sorted(n for n in names if n.startswith(args[0])))
    elif request == "add_history":
        _history.append(args[0])
        response = ""
    elif request == "history_item":
        index = int(args[0])
        response = _history[-index] if 0 < index <= len(_history) else ""
    elif request == "is_complete":
        response = "true"
    else:
        response = ""
    conn.sendall((response + "\n").encode("utf8"))


def _serve(server):
    while True:
        conn, _ = server.accept()
        with conn:
            _handle(conn)


def start_server():
    server = socket.socket(socket.AF_INET, socket.SOCK_STREAM)
    server.bind(("127.0.0.1", 0))
    server.listen()
    print("sluice-repl-port: %d" % server.getsockname()[1], flush=True)
    threading.Thread(target=_serve, args=(server,), daemon=True).start()
"#;

fn python() -> Option<PathBuf> {
  find_in_path("python3")
}

fn helper_dir() -> TempDir {
  let dir = tempfile::tempdir().expect("scratch dir");
  std::fs::write(dir.path().join("sluice_repl.py"), HELPER_MODULE).expect("helper module");
  dir
}

fn language(dir: &TempDir) -> Arc<dyn PersistentLanguage> {
  Arc::new(PythonLanguage {
    helper_dir: dir.path().to_path_buf(),
  })
}

async fn collect(
  mut messages: tokio::sync::mpsc::UnboundedReceiver<ReplMessage>,
) -> Vec<ReplMessage> {
  let mut collected = Vec::new();
  while let Some(message) = messages.recv().await {
    collected.push(message);
  }
  collected
}

fn stdout_lines(messages: &[ReplMessage]) -> Vec<&str> {
  messages
    .iter()
    .filter(|m| m.kind == ReplMessageKind::Stdout)
    .map(|m| m.data.as_str())
    .collect()
}

#[tokio::test]
async fn sentinel_terminates_each_command() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let manager = PersistentManager::start(
    vec![python.to_string_lossy().into_owned()],
    language(&dir),
  )
  .await
  .expect("interpreter starts");

  let messages = collect(manager.issue_command("print(\"hi\")", false)).await;
  assert_eq!(stdout_lines(&messages), vec!["hi"]);
  assert!(manager.command_successful());

  let messages = collect(manager.issue_command("print(\"bye\")", false)).await;
  assert_eq!(stdout_lines(&messages), vec!["bye"]);
  assert!(manager.command_successful());
  assert!(manager.is_persistent_alive());
  manager.kill_process();
}

#[tokio::test]
async fn raising_command_reports_error() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let manager = PersistentManager::start(
    vec![python.to_string_lossy().into_owned()],
    language(&dir),
  )
  .await
  .expect("interpreter starts");

  let messages = collect(manager.issue_command("raise RuntimeError(\"boom\")", false)).await;
  assert!(!manager.command_successful());
  assert!(messages
    .iter()
    .any(|m| m.kind == ReplMessageKind::Stderr && m.data.contains("RuntimeError")));

  // The interpreter survives a failed command.
  let messages = collect(manager.issue_command("print(1 + 1)", false)).await;
  assert_eq!(stdout_lines(&messages), vec!["2"]);
  assert!(manager.command_successful());
  manager.kill_process();
}

#[tokio::test]
async fn helper_answers_completions_history_and_completeness() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let manager = PersistentManager::start(
    vec![python.to_string_lossy().into_owned()],
    language(&dir),
  )
  .await
  .expect("interpreter starts");

  let completions = manager.get_completions("pr").await.expect("completions");
  assert_eq!(completions, vec!["print", "property"]);
  assert!(manager.is_complete("print(1)").await.expect("is_complete"));

  let _ = collect(manager.issue_command("x = 41", true)).await;
  assert!(manager.command_successful());
  assert_eq!(
    manager.get_history_item(1).await.expect("history"),
    "x = 41"
  );
  manager.kill_process();
}

#[tokio::test]
async fn dying_interpreter_ends_the_command_stream() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let manager = PersistentManager::start(
    vec![python.to_string_lossy().into_owned()],
    language(&dir),
  )
  .await
  .expect("interpreter starts");

  let messages = collect(manager.issue_command("import os; os._exit(5)", false)).await;
  assert!(!manager.command_successful());
  assert!(messages
    .iter()
    .any(|m| m.kind == ReplMessageKind::Stderr && m.data.contains("exited with code 5")));

  // Give the exit watcher a moment to settle.
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(!manager.is_persistent_alive());
}

#[tokio::test]
async fn pool_reuses_and_evicts_by_key() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let pool = PersistentManagerPool::new();
  let args = vec![python.to_string_lossy().into_owned()];

  let first = pool
    .manager(language(&dir), args.clone(), Some("group-1"))
    .await
    .expect("first manager");
  let second = pool
    .manager(language(&dir), args.clone(), Some("group-1"))
    .await
    .expect("second manager");
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(
    pool
      .get(&PersistentKey {
        args: args.clone(),
        group_id: "group-1".to_string(),
      })
      .map(|m| Arc::as_ptr(&m)),
    Some(Arc::as_ptr(&first))
  );

  // A dead manager is replaced on the next lookup.
  first.kill_process();
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(!first.is_persistent_alive());
  let replacement = pool
    .manager(language(&dir), args.clone(), Some("group-1"))
    .await
    .expect("replacement manager");
  assert!(!Arc::ptr_eq(&first, &replacement));

  // A closed pool refuses new managers.
  pool.close();
  let err = pool
    .manager(language(&dir), args.clone(), Some("group-2"))
    .await
    .unwrap_err();
  assert!(matches!(err, sluice_exec::ExecError::PoolClosed));
  pool.kill_all();
}

#[tokio::test]
async fn restart_keeps_the_manager_usable() {
  let Some(python) = python() else {
    return;
  };
  let dir = helper_dir();
  let manager = PersistentManager::start(
    vec![python.to_string_lossy().into_owned()],
    language(&dir),
  )
  .await
  .expect("interpreter starts");

  let _ = collect(manager.issue_command("x = 1", false)).await;
  manager.restart_persistent().await.expect("restart");
  assert!(manager.is_persistent_alive());

  // State is gone after the restart, so x is undefined again.
  let messages = collect(manager.issue_command("print(\"x\" in dir())", false)).await;
  assert_eq!(stdout_lines(&messages), vec!["False"]);
  manager.kill_process();
}
