//! Conda environment discovery and on-the-fly kernel specs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::ExecError;
use crate::kernel::{KernelSpec, KernelSpecProvider};

/// How long one `conda env list` result is reused.
pub const CONDA_SPEC_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct CondaEnvList {
  envs: Vec<PathBuf>,
}

struct CacheEntry {
  created: Instant,
  specs: BTreeMap<String, KernelSpec>,
}

/// Discovers conda environments and synthesizes ipykernel specs for them.
///
/// Environment listing is cached for [`CONDA_SPEC_CACHE_TTL`] because the
/// conda CLI is slow and kernels of one run typically start together.
pub struct CondaKernelSpecManager {
  conda_exe: PathBuf,
  cache: Mutex<Option<CacheEntry>>,
}

impl CondaKernelSpecManager {
  pub fn new(conda_exe: impl Into<PathBuf>) -> Self {
    Self {
      conda_exe: conda_exe.into(),
      cache: Mutex::new(None),
    }
  }

  /// All synthesized specs, keyed `conda-env-<name>-py`.
  pub async fn kernel_specs(&self) -> Result<BTreeMap<String, KernelSpec>, ExecError> {
    {
      let cache = self.cache.lock().unwrap();
      if let Some(entry) = cache.as_ref() {
        if entry.created.elapsed() < CONDA_SPEC_CACHE_TTL {
          return Ok(entry.specs.clone());
        }
      }
    }
    let output = tokio::process::Command::new(&self.conda_exe)
      .args(["env", "list", "--json"])
      .output()
      .await
      .map_err(|err| ExecError::CondaDiscovery {
        message: format!("running '{}' failed: {}", self.conda_exe.display(), err),
      })?;
    if !output.status.success() {
      return Err(ExecError::CondaDiscovery {
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    let env_list: CondaEnvList =
      serde_json::from_slice(&output.stdout).map_err(|err| ExecError::CondaDiscovery {
        message: format!("unparseable env listing: {}", err),
      })?;

    let mut specs = BTreeMap::new();
    for env in env_list.envs {
      let Some(env_name) = env.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      let python = if cfg!(windows) {
        env.join("python.exe")
      } else {
        env.join("bin").join("python")
      };
      let name = format!("conda-env-{}-py", env_name);
      specs.insert(
        name.clone(),
        KernelSpec {
          name,
          display_name: format!("Python [conda env: {}]", env_name),
          language: "python".to_string(),
          argv: vec![
            python.to_string_lossy().into_owned(),
            "-m".to_string(),
            "ipykernel_launcher".to_string(),
            "-f".to_string(),
            "{connection_file}".to_string(),
          ],
          resource_dir: None,
        },
      );
    }
    *self.cache.lock().unwrap() = Some(CacheEntry {
      created: Instant::now(),
      specs: specs.clone(),
    });
    Ok(specs)
  }

  pub async fn spec(&self, kernel_name: &str) -> Option<KernelSpec> {
    match self.kernel_specs().await {
      Ok(mut specs) => specs.remove(kernel_name),
      Err(err) => {
        warn!(error = %err, "conda kernel spec lookup failed");
        None
      }
    }
  }
}

#[async_trait]
impl KernelSpecProvider for CondaKernelSpecManager {
  async fn find(&self, kernel_name: &str) -> Option<KernelSpec> {
    self.spec(kernel_name).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(unix)]
  fn fake_conda(dir: &std::path::Path, envs_json: &str, counter: &std::path::Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("conda");
    std::fs::write(
      &script,
      format!(
        "#!/bin/sh\necho run >> {}\nprintf '%s' '{}'\n",
        counter.display(),
        envs_json
      ),
    )
    .unwrap();
    let mut permissions = std::fs::metadata(&script).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&script, permissions).unwrap();
    script
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn synthesizes_specs_and_caches_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("calls");
    let conda = fake_conda(
      dir.path(),
      r#"{"envs": ["/opt/conda", "/opt/conda/envs/science"]}"#,
      &counter,
    );
    let manager = CondaKernelSpecManager::new(conda);

    let specs = manager.kernel_specs().await.unwrap();
    assert_eq!(specs.len(), 2);
    let science = &specs["conda-env-science-py"];
    assert_eq!(science.language, "python");
    assert_eq!(science.argv[0], "/opt/conda/envs/science/bin/python");
    assert_eq!(science.argv[1..3], ["-m".to_string(), "ipykernel_launcher".to_string()]);
    assert!(science.argv.contains(&"{connection_file}".to_string()));

    // The second lookup is served from the cache.
    let again = manager.spec("conda-env-science-py").await.unwrap();
    assert_eq!(again, *science);
    let calls = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(calls.lines().count(), 1);
  }

  #[tokio::test]
  async fn missing_conda_is_a_discovery_error() {
    let manager = CondaKernelSpecManager::new("/definitely/not/conda");
    let err = manager.kernel_specs().await.unwrap_err();
    assert!(matches!(err, ExecError::CondaDiscovery { .. }));
  }
}
