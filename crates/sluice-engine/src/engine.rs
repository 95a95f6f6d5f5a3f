//! The sluice engine: validates the DAG, runs the backward and forward
//! sweeps, and publishes the event stream.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use sluice_workflow::{
  AppSettings, Connection, EngineState, Event, ExecutableItem, ExecutionDirection, FinishState,
  ItemContext, ItemRegistry, PromptBroker, QueueLogger, Resource, Specification,
};

use crate::error::EngineError;
use crate::fanout::{filter_combinations, ForwardStack, SubExecutionInput};
use crate::scheduler::{
  is_acyclic, run_tasks, ExecutorOptions, TaskSpec, TaskState, DEFAULT_MAX_CONCURRENT,
};

/// Capacity of the event channel between workers and the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Construction inputs for an [`Engine`].
pub struct EngineSetup {
  /// Item name to item definition; the definition carries at least a `type`
  /// field and optionally a `specification` name.
  pub items: BTreeMap<String, serde_json::Value>,
  /// Item type to specification definitions.
  pub specifications: BTreeMap<String, Vec<serde_json::Value>>,
  pub connections: Vec<Connection>,
  /// Node to direct successors; nodes without outgoing edges may be absent
  /// from the keys.
  pub successors: BTreeMap<String, Vec<String>>,
  /// Item name to execution permit; missing names default to permitted.
  pub execution_permits: BTreeMap<String, bool>,
  pub settings: AppSettings,
  pub project_dir: PathBuf,
  pub debug: bool,
  pub max_concurrent: usize,
}

impl Default for EngineSetup {
  fn default() -> Self {
    Self {
      items: BTreeMap::new(),
      specifications: BTreeMap::new(),
      connections: Vec::new(),
      successors: BTreeMap::new(),
      execution_permits: BTreeMap::new(),
      settings: AppSettings::default(),
      project_dir: PathBuf::from("."),
      debug: false,
      max_concurrent: DEFAULT_MAX_CONCURRENT,
    }
  }
}

/// The consumer's end of the event stream.
///
/// Yields `None` after the terminal `dag_exec_finished` event.
pub struct EventStream {
  receiver: mpsc::Receiver<Event>,
  finished: bool,
}

impl EventStream {
  /// The next event, or `None` once the stream has ended.
  pub async fn next(&mut self) -> Option<Event> {
    if self.finished {
      return None;
    }
    let event = self.receiver.recv().await?;
    if event.is_terminal() {
      self.finished = true;
    }
    Some(event)
  }

  /// Drains the stream to completion.
  pub async fn collect(mut self) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = self.next().await {
      events.push(event);
    }
    events
  }
}

/// An engine for executing one workflow DAG.
pub struct Engine {
  inner: Arc<EngineInner>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
  setup: EngineSetup,
  registry: Arc<ItemRegistry>,
  state: Mutex<EngineState>,
  stop_requested: AtomicBool,
  cancel: CancellationToken,
  event_tx: mpsc::Sender<Event>,
  prompts: PromptBroker,
  timestamp: String,
  /// All DAG nodes: keys of the adjacency plus every edge target.
  nodes: Vec<String>,
  predecessors: BTreeMap<String, Vec<String>>,
  /// Connections wrapped for mutation during execution, with source and
  /// destination indices.
  connections: Vec<Mutex<Connection>>,
  connections_by_source: HashMap<String, Vec<usize>>,
  connections_by_destination: HashMap<String, Vec<usize>>,
  specifications: OnceLock<HashMap<String, HashMap<String, Specification>>>,
  running_items: Mutex<Vec<Arc<dyn ExecutableItem>>>,
  backward_outputs: Mutex<HashMap<String, Vec<Resource>>>,
  backward_gathered: Mutex<HashMap<String, Vec<Resource>>>,
  forward_outputs: Mutex<HashMap<String, Vec<Vec<Resource>>>>,
  finish_states: Mutex<HashMap<String, FinishState>>,
}

impl Engine {
  /// Creates an engine and the event stream its run will feed.
  pub fn new(setup: EngineSetup, registry: Arc<ItemRegistry>) -> (Self, EventStream) {
    let (event_tx, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut nodes: Vec<String> = Vec::new();
    for (node, targets) in &setup.successors {
      if !nodes.contains(node) {
        nodes.push(node.clone());
      }
      for target in targets {
        if !nodes.contains(target) {
          nodes.push(target.clone());
        }
      }
    }
    for node in setup.items.keys() {
      if !nodes.contains(node) {
        nodes.push(node.clone());
      }
    }
    let mut predecessors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (node, targets) in &setup.successors {
      for target in targets {
        predecessors
          .entry(target.clone())
          .or_default()
          .push(node.clone());
      }
    }
    let mut connections_by_source: HashMap<String, Vec<usize>> = HashMap::new();
    let mut connections_by_destination: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, connection) in setup.connections.iter().enumerate() {
      connections_by_source
        .entry(connection.source().to_string())
        .or_default()
        .push(index);
      connections_by_destination
        .entry(connection.destination().to_string())
        .or_default()
        .push(index);
    }
    let connections = setup.connections.iter().cloned().map(Mutex::new).collect();
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    let inner = Arc::new(EngineInner {
      setup,
      registry,
      state: Mutex::new(EngineState::Sleeping),
      stop_requested: AtomicBool::new(false),
      cancel: CancellationToken::new(),
      event_tx,
      prompts: PromptBroker::new(),
      timestamp,
      nodes,
      predecessors,
      connections,
      connections_by_source,
      connections_by_destination,
      specifications: OnceLock::new(),
      running_items: Mutex::new(Vec::new()),
      backward_outputs: Mutex::new(HashMap::new()),
      backward_gathered: Mutex::new(HashMap::new()),
      forward_outputs: Mutex::new(HashMap::new()),
      finish_states: Mutex::new(HashMap::new()),
    });
    (
      Self {
        inner,
        handle: Mutex::new(None),
      },
      EventStream {
        receiver,
        finished: false,
      },
    )
  }

  /// Starts the run. Returns immediately; progress is observable through the
  /// event stream. Calling `run` more than once is a no-op.
  pub fn run(&self) {
    {
      let mut state = self.inner.state.lock().unwrap();
      if *state != EngineState::Sleeping {
        return;
      }
      *state = EngineState::Running;
    }
    let inner = Arc::clone(&self.inner);
    let handle = tokio::spawn(async move { inner.run_all().await });
    *self.handle.lock().unwrap() = Some(handle);
  }

  /// Waits for the run to finish.
  pub async fn wait(&self) {
    let handle = self.handle.lock().unwrap().take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
  }

  /// Requests cooperative termination. Idempotent and non-blocking.
  pub fn stop(&self) {
    if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
      return;
    }
    info!("engine stop requested");
    {
      let mut state = self.inner.state.lock().unwrap();
      if !state.is_terminal() {
        *state = EngineState::UserStopped;
      }
    }
    self.inner.cancel.cancel();
    self.inner.prompts.decline_all();
    let running = self.inner.running_items.lock().unwrap().clone();
    for item in running {
      item.stop_execution();
    }
  }

  /// Resolves an outstanding prompt emitted by an item.
  pub fn answer_prompt(&self, item_name: &str, accepted: bool) {
    self.inner.prompts.answer(item_name, accepted);
  }

  pub fn state(&self) -> EngineState {
    *self.inner.state.lock().unwrap()
  }
}

impl EngineInner {
  #[instrument(name = "engine_run", skip(self), fields(nodes = self.nodes.len()))]
  async fn run_all(self: Arc<Self>) {
    if let Err(err) = self.validate() {
      error!(error = %err, "workflow validation failed");
      self
        .emit(Event::EventMsg {
          author: String::new(),
          kind: sluice_workflow::MessageKind::Error,
          text: err.to_string(),
          filter_id: String::new(),
        })
        .await;
      self.set_state(EngineState::Failed);
      self.finish(EngineState::Failed).await;
      return;
    }

    info!(timestamp = %self.timestamp, "workflow started");
    self.run_backward_sweep().await;
    if !self.cancel.is_cancelled() {
      self.run_forward_sweep().await;
    }

    let outcome = self.final_outcome();
    self.set_state(outcome);
    self.finish(outcome).await;
  }

  fn validate(&self) -> Result<(), EngineError> {
    if !is_acyclic(&self.setup.successors) {
      return Err(EngineError::InvalidDag {
        message: "the workflow graph contains a cycle".to_string(),
      });
    }
    let mut specifications: HashMap<String, HashMap<String, Specification>> = HashMap::new();
    for (item_type, defs) in &self.setup.specifications {
      if !self.registry.contains(item_type) {
        continue;
      }
      let by_name = specifications.entry(item_type.clone()).or_default();
      for def in defs {
        match self
          .registry
          .make_specification(item_type, def, &self.setup.settings)
        {
          Ok(Some(specification)) => {
            by_name.insert(specification.name.clone(), specification);
          }
          Ok(None) => {}
          Err(err) => {
            return Err(EngineError::Setup {
              message: err.to_string(),
            })
          }
        }
      }
    }
    for node in &self.nodes {
      let definition = self
        .setup
        .items
        .get(node)
        .ok_or_else(|| EngineError::Setup {
          message: format!("item '{}' has no definition", node),
        })?;
      let item_type = item_type_of(node, definition)?;
      if !self.registry.contains(item_type) {
        return Err(EngineError::Setup {
          message: format!("unknown item type '{}' for item '{}'", item_type, node),
        });
      }
      if let Some(spec_name) = definition.get("specification").and_then(|v| v.as_str()) {
        let known = specifications
          .get(item_type)
          .is_some_and(|by_name| by_name.contains_key(spec_name));
        if !known {
          return Err(EngineError::Setup {
            message: format!(
              "item '{}' references missing specification '{}'",
              node, spec_name
            ),
          });
        }
      }
    }
    let _ = self.specifications.set(specifications);
    Ok(())
  }

  async fn run_backward_sweep(self: &Arc<Self>) {
    let specs: Vec<TaskSpec> = self
      .nodes
      .iter()
      .map(|node| TaskSpec {
        id: node.clone(),
        priority: 0,
        // A backward node gathers from its DAG-successors, so they run first.
        dependencies: self
          .setup
          .successors
          .get(node)
          .cloned()
          .unwrap_or_default(),
      })
      .collect();
    let options = ExecutorOptions {
      max_concurrent: self.setup.max_concurrent,
      skip_on_failed_dependency: false,
    };
    let inner = Arc::clone(self);
    run_tasks(specs, options, self.cancel.clone(), move |node| {
      let inner = Arc::clone(&inner);
      async move { inner.execute_node_backward(&node).await }
    })
    .await;
  }

  async fn run_forward_sweep(self: &Arc<Self>) {
    let specs: Vec<TaskSpec> = self
      .nodes
      .iter()
      .map(|node| TaskSpec {
        id: node.clone(),
        priority: 0,
        dependencies: self.predecessors.get(node).cloned().unwrap_or_default(),
      })
      .collect();
    let options = ExecutorOptions {
      max_concurrent: self.setup.max_concurrent,
      skip_on_failed_dependency: true,
    };
    let inner = Arc::clone(self);
    let states = run_tasks(specs, options, self.cancel.clone(), move |node| {
      let inner = Arc::clone(&inner);
      async move { inner.execute_node_forward(&node).await }
    })
    .await;

    if self.cancel.is_cancelled() {
      return;
    }
    // Nodes the executor short-circuited still get their event pair.
    for node in &self.nodes {
      if states.get(node) == Some(&TaskState::Skipped) {
        self.record_finish_state(node, FinishState::Skipped);
        self
          .emit(Event::ExecStarted {
            item_name: node.clone(),
            direction: ExecutionDirection::Forward,
          })
          .await;
        self.emit_exec_finished(node, FinishState::Skipped).await;
      }
    }
  }

  async fn execute_node_backward(self: Arc<Self>, node: &str) -> crate::scheduler::TaskOutcome {
    use crate::scheduler::TaskOutcome;
    if self.cancel.is_cancelled() {
      return TaskOutcome::Skipped;
    }
    let gathered: Vec<Resource> = {
      let outputs = self.backward_outputs.lock().unwrap();
      self
        .setup
        .successors
        .get(node)
        .into_iter()
        .flatten()
        .filter_map(|successor| outputs.get(successor))
        .flatten()
        .cloned()
        .collect()
    };
    self
      .backward_gathered
      .lock()
      .unwrap()
      .insert(node.to_string(), gathered);

    let item = match self.make_item(node, ExecutionDirection::Backward, None) {
      Ok(item) => item,
      Err(err) => {
        // Degrades only this node; the forward sweep still runs.
        warn!(item = node, error = %err, "backward execution degraded");
        return TaskOutcome::Failed;
      }
    };
    let mut resources = item.output_resources(ExecutionDirection::Backward);
    for resource in &mut resources {
      resource.metadata.extras.insert(
        "timestamp".to_string(),
        serde_json::Value::String(self.timestamp.clone()),
      );
    }
    self
      .backward_outputs
      .lock()
      .unwrap()
      .insert(node.to_string(), resources);
    TaskOutcome::Done
  }

  async fn execute_node_forward(self: Arc<Self>, node: &str) -> crate::scheduler::TaskOutcome {
    use crate::scheduler::TaskOutcome;
    if self.cancel.is_cancelled() {
      return TaskOutcome::Skipped;
    }
    self
      .emit(Event::ExecStarted {
        item_name: node.to_string(),
        direction: ExecutionDirection::Forward,
      })
      .await;

    let permitted = self
      .setup
      .execution_permits
      .get(node)
      .copied()
      .unwrap_or(true);

    let combinations = match self.build_combinations(node) {
      Ok(combinations) => combinations,
      Err(err) => {
        self.logger(node, None).msg_error(err.to_string()).await;
        self.record_finish_state(node, FinishState::Failure);
        self.emit_exec_finished(node, FinishState::Failure).await;
        return TaskOutcome::Failed;
      }
    };
    if self.setup.debug {
      tracing::debug!(item = node, combinations = combinations.len(), "fan-out computed");
    }

    // Readiness is probed once, before any sub-execution runs.
    match self.make_item(node, ExecutionDirection::Forward, None) {
      Ok(probe) => {
        if !probe.ready_to_execute() {
          if !permitted {
            self.record_finish_state(node, FinishState::Excluded);
            self.emit_exec_finished(node, FinishState::Excluded).await;
            return TaskOutcome::Done;
          }
          self
            .logger(node, None)
            .msg_error("not ready for forward execution")
            .await;
          self.record_finish_state(node, FinishState::Failure);
          self.emit_exec_finished(node, FinishState::Failure).await;
          return TaskOutcome::Failed;
        }
      }
      Err(err) => {
        self.logger(node, None).msg_error(err.to_string()).await;
        self.record_finish_state(node, FinishState::Failure);
        self.emit_exec_finished(node, FinishState::Failure).await;
        return TaskOutcome::Failed;
      }
    }

    let mut handles = Vec::with_capacity(combinations.len());
    for combination in combinations {
      let inner = Arc::clone(&self);
      let node = node.to_string();
      handles.push(tokio::spawn(async move {
        inner.run_sub_execution(&node, permitted, combination).await
      }));
    }
    let results = join_all(handles).await;

    let mut item_state = FinishState::NeverFinished;
    let mut output_stacks: Vec<Vec<Resource>> = Vec::new();
    let mut any_failure = false;
    let mut any_stopped = false;
    let mut finished = 0usize;
    for result in results {
      match result {
        Ok((state, outputs)) => {
          finished += 1;
          match state {
            FinishState::Failure => any_failure = true,
            FinishState::Stopped => any_stopped = true,
            _ => {}
          }
          output_stacks.push(outputs);
        }
        Err(err) => {
          error!(item = node, error = %err, "sub-execution task failed");
          any_failure = true;
        }
      }
    }
    if any_failure {
      item_state = FinishState::Failure;
    } else if any_stopped {
      item_state = FinishState::Stopped;
    } else if finished > 0 {
      item_state = if permitted {
        FinishState::Success
      } else {
        FinishState::Excluded
      };
    }

    // Advertise outputs through the outgoing connections.
    if let Some(indices) = self.connections_by_source.get(node) {
      for &index in indices {
        let mut connection = self.connections[index].lock().unwrap();
        for stack in &output_stacks {
          connection.receive_resources_from_source(stack.iter());
        }
      }
    }
    self
      .forward_outputs
      .lock()
      .unwrap()
      .insert(node.to_string(), output_stacks);

    self.record_finish_state(node, item_state);
    self.emit_exec_finished(node, item_state).await;
    match item_state {
      FinishState::Success | FinishState::Excluded => TaskOutcome::Done,
      _ => TaskOutcome::Failed,
    }
  }

  async fn run_sub_execution(
    self: &Arc<Self>,
    node: &str,
    permitted: bool,
    combination: SubExecutionInput,
  ) -> (FinishState, Vec<Resource>) {
    let item = match self.make_item(node, ExecutionDirection::Forward, Some(&combination.filter_id))
    {
      Ok(item) => item,
      Err(err) => {
        error!(item = node, error = %err, "item construction failed");
        return (FinishState::Failure, Vec::new());
      }
    };
    self.running_items.lock().unwrap().push(Arc::clone(&item));

    let state = if permitted {
      tokio::select! {
        state = item.execute(&combination.forward, &combination.backward) => state,
        _ = self.cancel.cancelled() => {
          item.stop_execution();
          FinishState::Stopped
        }
      }
    } else {
      item
        .exclude_execution(&combination.forward, &combination.backward)
        .await;
      FinishState::Excluded
    };

    let mut combined_stack = sluice_workflow::FilterStack::default();
    for resource in &combination.forward {
      for filter in resource.metadata.filter_stack.filters() {
        combined_stack.push(filter.clone());
      }
    }
    let mut outputs = item.output_resources(ExecutionDirection::Forward);
    for resource in &mut outputs {
      resource.metadata.filter_stack = combined_stack.clone();
      resource.metadata.filter_id = Some(combination.filter_id.clone());
    }

    let mut running = self.running_items.lock().unwrap();
    if let Some(position) = running.iter().position(|r| Arc::ptr_eq(r, &item)) {
      running.remove(position);
    }
    drop(running);
    (state, outputs)
  }

  /// Collects the predecessors' output stacks, converts them along the
  /// connecting edges and fans them out into filter combinations.
  fn build_combinations(
    self: &Arc<Self>,
    node: &str,
  ) -> Result<Vec<SubExecutionInput>, EngineError> {
    let mut forward_stacks: Vec<ForwardStack> = Vec::new();
    let predecessor_names = self.predecessors.get(node).cloned().unwrap_or_default();
    {
      let outputs = self.forward_outputs.lock().unwrap();
      for predecessor in &predecessor_names {
        let stacks = outputs.get(predecessor).cloned().unwrap_or_default();
        for resources in stacks {
          let converted = match self.connection_index(predecessor, node) {
            Some(index) => self.connections[index]
              .lock()
              .unwrap()
              .convert_resources(resources)
              .map_err(|err| EngineError::Setup {
                message: err.to_string(),
              })?,
            None => resources,
          };
          forward_stacks.push(ForwardStack {
            predecessor: predecessor.clone(),
            resources: converted,
          });
        }
      }
    }
    let backward = self
      .backward_gathered
      .lock()
      .unwrap()
      .get(node)
      .cloned()
      .unwrap_or_default();

    let inner = Arc::clone(self);
    let destination = node.to_string();
    Ok(filter_combinations(
      forward_stacks,
      &backward,
      move |predecessor, label| match inner.connection_index(predecessor, &destination) {
        Some(index) => inner.connections[index].lock().unwrap().filter_stacks(label),
        None => Vec::new(),
      },
    ))
  }

  fn connection_index(&self, source: &str, destination: &str) -> Option<usize> {
    self
      .connections_by_destination
      .get(destination)?
      .iter()
      .copied()
      .find(|&index| {
        self.connections[index].lock().unwrap().source() == source
      })
  }

  fn make_item(
    &self,
    node: &str,
    direction: ExecutionDirection,
    filter_id: Option<&str>,
  ) -> Result<Arc<dyn ExecutableItem>, EngineError> {
    let definition = self
      .setup
      .items
      .get(node)
      .ok_or_else(|| EngineError::Setup {
        message: format!("item '{}' has no definition", node),
      })?;
    let item_type = item_type_of(node, definition)?;
    let specification = definition
      .get("specification")
      .and_then(|v| v.as_str())
      .and_then(|name| {
        self
          .specifications
          .get()
          .and_then(|specs| specs.get(item_type))
          .and_then(|by_name| by_name.get(name))
      });
    let logger = self.logger(node, filter_id);
    let logger = if direction == ExecutionDirection::Backward {
      logger.silenced()
    } else {
      logger
    };
    let context = ItemContext {
      name: node,
      definition,
      project_dir: &self.setup.project_dir,
      settings: &self.setup.settings,
      specification,
      logger,
    };
    self
      .registry
      .make_item(item_type, context)
      .map_err(|err| EngineError::Setup {
        message: err.to_string(),
      })
  }

  fn logger(&self, node: &str, filter_id: Option<&str>) -> QueueLogger {
    let logger = QueueLogger::new(self.event_tx.clone(), node, self.prompts.clone());
    match filter_id {
      Some(filter_id) => logger.for_filter(filter_id),
      None => logger,
    }
  }

  fn record_finish_state(&self, node: &str, state: FinishState) {
    self
      .finish_states
      .lock()
      .unwrap()
      .insert(node.to_string(), state);
    if state == FinishState::Failure {
      let mut engine_state = self.state.lock().unwrap();
      if *engine_state == EngineState::Running {
        *engine_state = EngineState::Failed;
      }
    }
  }

  fn final_outcome(&self) -> EngineState {
    if self.stop_requested.load(Ordering::SeqCst) {
      return EngineState::UserStopped;
    }
    let finish_states = self.finish_states.lock().unwrap();
    let all_clean = self.nodes.iter().all(|node| {
      matches!(
        finish_states.get(node),
        Some(FinishState::Success | FinishState::Skipped | FinishState::Excluded)
      )
    });
    if all_clean {
      EngineState::Completed
    } else {
      EngineState::Failed
    }
  }

  fn set_state(&self, state: EngineState) {
    let mut current = self.state.lock().unwrap();
    if !current.is_terminal() || *current == state {
      *current = state;
    } else if *current == EngineState::Failed && state == EngineState::UserStopped {
      // A stop request wins over an earlier failure for the final outcome.
      *current = state;
    }
  }

  async fn emit_exec_finished(&self, node: &str, item_state: FinishState) {
    let state = *self.state.lock().unwrap();
    self
      .emit(Event::ExecFinished {
        item_name: node.to_string(),
        direction: ExecutionDirection::Forward,
        state,
        item_state,
      })
      .await;
  }

  async fn emit(&self, event: Event) {
    let _ = self.event_tx.send(event).await;
  }

  async fn finish(&self, outcome: EngineState) {
    info!(outcome = %outcome, "workflow finished");
    self.emit(Event::DagExecFinished { outcome }).await;
  }
}

fn item_type_of<'a>(node: &str, definition: &'a serde_json::Value) -> Result<&'a str, EngineError> {
  definition
    .get("type")
    .and_then(|v| v.as_str())
    .ok_or_else(|| EngineError::Setup {
      message: format!("item '{}' has no type", node),
    })
}
