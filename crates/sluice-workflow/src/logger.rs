//! Item-scoped logging into the engine's event channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::event::{Event, MessageKind};

/// Multiplexes item-scoped messages into a single event queue.
///
/// Every message carries the item name and the filter id of the current
/// sub-execution so the consumer can stitch fanned-out output back together.
/// Cloning is cheap; [`QueueLogger::for_filter`] derives a logger for one
/// sub-execution.
#[derive(Clone)]
pub struct QueueLogger {
  author: String,
  filter_id: String,
  events: mpsc::Sender<Event>,
  prompts: PromptBroker,
  silent: bool,
}

impl QueueLogger {
  pub fn new(events: mpsc::Sender<Event>, author: impl Into<String>, prompts: PromptBroker) -> Self {
    Self {
      author: author.into(),
      filter_id: String::new(),
      events,
      prompts,
      silent: false,
    }
  }

  /// A silenced logger drops every message; used for the backward sweep.
  pub fn silenced(mut self) -> Self {
    self.silent = true;
    self
  }

  /// Derives a logger whose messages carry the given filter id.
  pub fn for_filter(&self, filter_id: impl Into<String>) -> Self {
    let mut logger = self.clone();
    logger.filter_id = filter_id.into();
    logger
  }

  pub fn author(&self) -> &str {
    &self.author
  }

  pub fn filter_id(&self) -> &str {
    &self.filter_id
  }

  async fn send(&self, event: Event) {
    if self.silent {
      return;
    }
    // The receiver going away just means nobody is watching any more.
    let _ = self.events.send(event).await;
  }

  async fn log(&self, kind: MessageKind, text: impl Into<String>) {
    self
      .send(Event::EventMsg {
        author: self.author.clone(),
        kind,
        text: text.into(),
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn msg(&self, text: impl Into<String>) {
    self.log(MessageKind::Msg, text).await;
  }

  pub async fn msg_success(&self, text: impl Into<String>) {
    self.log(MessageKind::Success, text).await;
  }

  pub async fn msg_warning(&self, text: impl Into<String>) {
    self.log(MessageKind::Warning, text).await;
  }

  pub async fn msg_error(&self, text: impl Into<String>) {
    self.log(MessageKind::Error, text).await;
  }

  pub async fn msg_proc(&self, text: impl Into<String>) {
    self
      .send(Event::ProcessMsg {
        author: self.author.clone(),
        kind: MessageKind::Msg,
        text: text.into(),
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn msg_proc_error(&self, text: impl Into<String>) {
    self
      .send(Event::ProcessMsg {
        author: self.author.clone(),
        kind: MessageKind::Error,
        text: text.into(),
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn msg_standard_execution(&self, payload: serde_json::Value) {
    self
      .send(Event::StandardExecutionMsg {
        author: self.author.clone(),
        payload,
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn msg_kernel_execution(&self, payload: serde_json::Value) {
    self
      .send(Event::KernelExecutionMsg {
        author: self.author.clone(),
        payload,
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn msg_persistent_execution(&self, payload: serde_json::Value) {
    self
      .send(Event::PersistentExecutionMsg {
        author: self.author.clone(),
        payload,
        filter_id: self.filter_id.clone(),
      })
      .await;
  }

  pub async fn flash(&self) {
    self
      .send(Event::Flash {
        author: self.author.clone(),
      })
      .await;
  }

  /// Publishes a prompt and suspends until it is answered (or declined by a
  /// stop). The wait is unbounded.
  pub async fn prompt(&self, prompt: serde_json::Value) -> bool {
    self
      .send(Event::Prompt {
        author: self.author.clone(),
        prompt,
        filter_id: self.filter_id.clone(),
      })
      .await;
    self.prompts.wait(&self.author).await
  }
}

/// Routes prompt answers back to the suspended sub-executions.
///
/// Workers park on [`PromptBroker::wait`]; `Engine::answer_prompt` resolves
/// the oldest outstanding prompt of an item. Once declined (by a stop), all
/// current and future waits resolve to `false` immediately.
#[derive(Clone, Default)]
pub struct PromptBroker {
  inner: Arc<Mutex<BrokerInner>>,
}

#[derive(Default)]
struct BrokerInner {
  pending: HashMap<String, VecDeque<oneshot::Sender<bool>>>,
  declined: bool,
}

impl PromptBroker {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn wait(&self, item_name: &str) -> bool {
    let receiver = {
      let mut inner = self.inner.lock().unwrap();
      if inner.declined {
        return false;
      }
      let (tx, rx) = oneshot::channel();
      inner
        .pending
        .entry(item_name.to_string())
        .or_default()
        .push_back(tx);
      rx
    };
    receiver.await.unwrap_or(false)
  }

  /// Answers the oldest outstanding prompt of the item. Returns whether a
  /// prompt was waiting.
  pub fn answer(&self, item_name: &str, accepted: bool) -> bool {
    let sender = {
      let mut inner = self.inner.lock().unwrap();
      inner
        .pending
        .get_mut(item_name)
        .and_then(|queue| queue.pop_front())
    };
    match sender {
      Some(tx) => tx.send(accepted).is_ok(),
      None => false,
    }
  }

  /// Declines every outstanding prompt and all future ones.
  pub fn decline_all(&self) {
    let drained: Vec<oneshot::Sender<bool>> = {
      let mut inner = self.inner.lock().unwrap();
      inner.declined = true;
      inner
        .pending
        .drain()
        .flat_map(|(_, queue)| queue)
        .collect()
    };
    for tx in drained {
      let _ = tx.send(false);
    }
  }
}
