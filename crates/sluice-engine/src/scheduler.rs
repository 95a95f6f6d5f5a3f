//! In-house topological task executor.
//!
//! Admits tasks whose dependencies have completed, up to a concurrency limit.
//! When several tasks are ready at once the highest priority wins, ties broken
//! by insertion order. Cancellation stops admission; in-flight tasks run to
//! completion (they observe the token themselves).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap, HashMap};
use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of concurrently running tasks.
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 100;

/// Per-task state while the executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
  Waiting,
  Ready,
  Running,
  Done,
  Failed,
  Skipped,
}

/// What a task reports back when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
  Done,
  Failed,
  Skipped,
}

/// One schedulable unit.
pub(crate) struct TaskSpec {
  pub id: String,
  pub priority: i64,
  pub dependencies: Vec<String>,
}

/// Executor tuning knobs.
pub(crate) struct ExecutorOptions {
  pub max_concurrent: usize,
  /// Whether a failed (or skipped) dependency marks dependents skipped
  /// without running them. The forward sweep wants this; the backward sweep
  /// does not.
  pub skip_on_failed_dependency: bool,
}

impl Default for ExecutorOptions {
  fn default() -> Self {
    Self {
      max_concurrent: DEFAULT_MAX_CONCURRENT,
      skip_on_failed_dependency: true,
    }
  }
}

#[derive(PartialEq, Eq)]
struct ReadyEntry {
  priority: i64,
  sequence: usize,
  index: usize,
}

impl Ord for ReadyEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    // Higher priority first; earlier insertion breaks ties.
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

impl PartialOrd for ReadyEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Runs the task set to completion and returns the final state per task.
///
/// `run` is invoked once per admitted task on its own spawned tokio task.
/// Tasks not admitted (cancelled, or skipped through a failed dependency)
/// finish as [`TaskState::Skipped`] without `run` being called.
pub(crate) async fn run_tasks<F, Fut>(
  specs: Vec<TaskSpec>,
  options: ExecutorOptions,
  cancel: CancellationToken,
  run: F,
) -> HashMap<String, TaskState>
where
  F: Fn(String) -> Fut,
  Fut: Future<Output = TaskOutcome> + Send + 'static,
{
  let index_by_id: HashMap<String, usize> = specs
    .iter()
    .enumerate()
    .map(|(i, spec)| (spec.id.clone(), i))
    .collect();
  let mut states: Vec<TaskState> = vec![TaskState::Waiting; specs.len()];
  let mut pending_deps: Vec<usize> = vec![0; specs.len()];
  let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
  for (i, spec) in specs.iter().enumerate() {
    for dep in &spec.dependencies {
      // Dependencies outside the task set are considered satisfied.
      if let Some(&dep_index) = index_by_id.get(dep) {
        pending_deps[i] += 1;
        dependents[dep_index].push(i);
      }
    }
  }

  let mut ready: BinaryHeap<ReadyEntry> = BinaryHeap::new();
  for (i, spec) in specs.iter().enumerate() {
    if pending_deps[i] == 0 {
      states[i] = TaskState::Ready;
      ready.push(ReadyEntry {
        priority: spec.priority,
        sequence: i,
        index: i,
      });
    }
  }

  let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, TaskOutcome)>();
  let mut running = 0usize;

  loop {
    while running < options.max_concurrent && !cancel.is_cancelled() {
      let Some(entry) = ready.pop() else {
        break;
      };
      let index = entry.index;
      states[index] = TaskState::Running;
      running += 1;
      let future = run(specs[index].id.clone());
      let done_tx = done_tx.clone();
      tokio::spawn(async move {
        let outcome = future.await;
        let _ = done_tx.send((index, outcome));
      });
    }
    if running == 0 {
      break;
    }

    let Some((index, outcome)) = done_rx.recv().await else {
      break;
    };
    running -= 1;
    states[index] = match outcome {
      TaskOutcome::Done => TaskState::Done,
      TaskOutcome::Failed => TaskState::Failed,
      TaskOutcome::Skipped => TaskState::Skipped,
    };
    debug!(task = %specs[index].id, state = ?states[index], "task finished");

    // Release dependents; cascade skips through failed dependencies.
    let mut worklist = vec![index];
    while let Some(finished) = worklist.pop() {
      let failed_dep = matches!(states[finished], TaskState::Failed | TaskState::Skipped);
      for &dependent in &dependents[finished] {
        if states[dependent] != TaskState::Waiting {
          continue;
        }
        if failed_dep && options.skip_on_failed_dependency {
          states[dependent] = TaskState::Skipped;
          worklist.push(dependent);
          continue;
        }
        pending_deps[dependent] -= 1;
        if pending_deps[dependent] == 0 {
          states[dependent] = TaskState::Ready;
          ready.push(ReadyEntry {
            priority: specs[dependent].priority,
            sequence: dependent,
            index: dependent,
          });
        }
      }
    }
  }

  // Whatever never got admitted (cancellation, unsatisfiable deps) is skipped.
  for state in states.iter_mut() {
    if matches!(*state, TaskState::Waiting | TaskState::Ready) {
      *state = TaskState::Skipped;
    }
  }

  specs
    .into_iter()
    .zip(states)
    .map(|(spec, state)| (spec.id, state))
    .collect()
}

/// Checks an adjacency mapping for cycles by iterated leaf-stripping.
pub(crate) fn is_acyclic(successors: &BTreeMap<String, Vec<String>>) -> bool {
  let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
  for (node, targets) in successors {
    indegree.entry(node.as_str()).or_insert(0);
    for target in targets {
      *indegree.entry(target.as_str()).or_insert(0) += 1;
    }
  }
  let mut leaves: Vec<&str> = indegree
    .iter()
    .filter(|(_, degree)| **degree == 0)
    .map(|(node, _)| *node)
    .collect();
  let mut stripped = 0usize;
  while let Some(leaf) = leaves.pop() {
    stripped += 1;
    if let Some(targets) = successors.get(leaf) {
      for target in targets {
        let degree = indegree.get_mut(target.as_str()).unwrap();
        *degree -= 1;
        if *degree == 0 {
          leaves.push(target.as_str());
        }
      }
    }
  }
  stripped == indegree.len()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  fn spec(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
      id: id.to_string(),
      priority: 0,
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
  }

  #[tokio::test]
  async fn runs_in_dependency_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let specs = vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])];
    let states = run_tasks(
      specs,
      ExecutorOptions::default(),
      CancellationToken::new(),
      |id| {
        let order = order.clone();
        async move {
          order.lock().unwrap().push(id);
          TaskOutcome::Done
        }
      },
    )
    .await;
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert!(states.values().all(|s| *s == TaskState::Done));
  }

  #[tokio::test]
  async fn failure_skips_transitive_dependents_only() {
    let specs = vec![
      spec("a", &[]),
      spec("b", &["a"]),
      spec("c", &["a"]),
      spec("d", &["b", "c"]),
    ];
    let states = run_tasks(
      specs,
      ExecutorOptions::default(),
      CancellationToken::new(),
      |id| async move {
        if id == "b" {
          TaskOutcome::Failed
        } else {
          TaskOutcome::Done
        }
      },
    )
    .await;
    assert_eq!(states["a"], TaskState::Done);
    assert_eq!(states["b"], TaskState::Failed);
    assert_eq!(states["c"], TaskState::Done);
    assert_eq!(states["d"], TaskState::Skipped);
  }

  #[tokio::test]
  async fn failed_dependency_does_not_skip_when_disabled() {
    let specs = vec![spec("a", &[]), spec("b", &["a"])];
    let options = ExecutorOptions {
      skip_on_failed_dependency: false,
      ..ExecutorOptions::default()
    };
    let states = run_tasks(specs, options, CancellationToken::new(), |id| async move {
      if id == "a" {
        TaskOutcome::Failed
      } else {
        TaskOutcome::Done
      }
    })
    .await;
    assert_eq!(states["a"], TaskState::Failed);
    assert_eq!(states["b"], TaskState::Done);
  }

  #[tokio::test]
  async fn priority_orders_ready_tasks() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let specs = vec![
      TaskSpec {
        id: "low".into(),
        priority: 1,
        dependencies: vec![],
      },
      TaskSpec {
        id: "high".into(),
        priority: 10,
        dependencies: vec![],
      },
      TaskSpec {
        id: "also-high".into(),
        priority: 10,
        dependencies: vec![],
      },
    ];
    let options = ExecutorOptions {
      max_concurrent: 1,
      ..ExecutorOptions::default()
    };
    run_tasks(specs, options, CancellationToken::new(), |id| {
      let order = order.clone();
      async move {
        order.lock().unwrap().push(id);
        TaskOutcome::Done
      }
    })
    .await;
    assert_eq!(*order.lock().unwrap(), vec!["high", "also-high", "low"]);
  }

  #[tokio::test]
  async fn cancellation_prevents_admission() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let specs = vec![spec("a", &[]), spec("b", &["a"])];
    let states = run_tasks(specs, ExecutorOptions::default(), cancel, |_| async {
      TaskOutcome::Done
    })
    .await;
    assert_eq!(states["a"], TaskState::Skipped);
    assert_eq!(states["b"], TaskState::Skipped);
  }

  #[test]
  fn detects_cycles() {
    let mut adjacency = BTreeMap::new();
    adjacency.insert("a".to_string(), vec!["b".to_string()]);
    adjacency.insert("b".to_string(), vec!["a".to_string()]);
    assert!(!is_acyclic(&adjacency));

    let mut acyclic = BTreeMap::new();
    acyclic.insert("a".to_string(), vec!["b".to_string(), "c".to_string()]);
    acyclic.insert("b".to_string(), vec!["c".to_string()]);
    assert!(is_acyclic(&acyclic));
  }
}
