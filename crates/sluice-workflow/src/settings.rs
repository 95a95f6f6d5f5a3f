//! Engine settings and interpreter discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Relative path of the interpreter bundled with a frozen install.
#[cfg(windows)]
pub const EMBEDDED_PYTHON: &str = "Tools/python.exe";
#[cfg(not(windows))]
pub const EMBEDDED_PYTHON: &str = "Tools/python";

/// Key/value execution settings handed to the engine by the workbench.
///
/// Known keys (non-exhaustive): `pythonPath`, `juliaPath`, `juliaProjectPath`,
/// `gamsPath`, `condaPath`. All may be empty; the resolvers below fall back to
/// `PATH`.
#[derive(Debug, Clone, Default)]
pub struct AppSettings {
  values: HashMap<String, String>,
}

impl AppSettings {
  pub fn new(values: HashMap<String, String>) -> Self {
    Self { values }
  }

  /// The value for `key`, or `default` when unset or empty.
  pub fn value_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
    match self.values.get(key) {
      Some(value) if !value.is_empty() => value,
      _ => default,
    }
  }

  pub fn value(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.values.insert(key.into(), value.into());
  }
}

/// Full path to the Python interpreter: explicit setting, then `PATH`, then
/// the embedded fallback.
pub fn resolve_python_interpreter(settings: &AppSettings) -> PathBuf {
  if let Some(path) = settings.value("pythonPath") {
    return PathBuf::from(path);
  }
  if let Some(found) = find_in_path(python_program()) {
    return found;
  }
  PathBuf::from(EMBEDDED_PYTHON)
}

/// The Julia command: executable plus `--project=` switch.
///
/// Returns `None` when no Julia executable can be found.
pub fn resolve_julia_command(settings: &AppSettings) -> Option<Vec<String>> {
  let julia = match settings.value("juliaPath") {
    Some(path) => PathBuf::from(path),
    None => find_in_path(julia_program())?,
  };
  let project = settings.value_or("juliaProjectPath", "");
  Some(vec![
    julia.to_string_lossy().into_owned(),
    format!("--project={}", project),
  ])
}

pub fn resolve_conda_executable(settings: &AppSettings) -> Option<PathBuf> {
  match settings.value("condaPath") {
    Some(path) => Some(PathBuf::from(path)),
    None => find_in_path(conda_program()),
  }
}

pub fn resolve_gams_executable(settings: &AppSettings) -> Option<PathBuf> {
  match settings.value("gamsPath") {
    Some(path) => Some(PathBuf::from(path)),
    None => find_in_path(gams_program()),
  }
}

fn python_program() -> &'static str {
  if cfg!(windows) {
    "python.exe"
  } else {
    "python3"
  }
}

fn julia_program() -> &'static str {
  if cfg!(windows) {
    "julia.exe"
  } else {
    "julia"
  }
}

fn conda_program() -> &'static str {
  if cfg!(windows) {
    "conda.exe"
  } else {
    "conda"
  }
}

fn gams_program() -> &'static str {
  if cfg!(windows) {
    "gams.exe"
  } else {
    "gams"
  }
}

/// Scans the `PATH` environment variable for an executable.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
  let path_var = std::env::var_os("PATH")?;
  for dir in std::env::split_paths(&path_var) {
    let candidate = dir.join(program);
    if is_executable(&candidate) {
      return Some(candidate);
    }
  }
  None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}
