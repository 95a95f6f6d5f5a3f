//! Observable execution events.
//!
//! Events are what the workbench consumes: one `exec_started`/`exec_finished`
//! pair per item, item-scoped messages tagged with a filter id for fan-out
//! correlation, and a terminal `dag_exec_finished`.

use serde::{Deserialize, Serialize};

use crate::item::{ExecutionDirection, FinishState};

/// Engine lifecycle state. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
  Sleeping,
  Running,
  UserStopped,
  Failed,
  Completed,
}

impl EngineState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      EngineState::UserStopped | EngineState::Failed | EngineState::Completed
    )
  }
}

impl std::fmt::Display for EngineState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      EngineState::Sleeping => "SLEEPING",
      EngineState::Running => "RUNNING",
      EngineState::UserStopped => "USER_STOPPED",
      EngineState::Failed => "FAILED",
      EngineState::Completed => "COMPLETED",
    };
    write!(f, "{}", name)
  }
}

/// Severity of a log-style message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
  #[serde(rename = "msg")]
  Msg,
  #[serde(rename = "msg_success")]
  Success,
  #[serde(rename = "msg_warning")]
  Warning,
  #[serde(rename = "msg_error")]
  Error,
}

/// One event in the execution stream.
///
/// The serialized form is internally tagged with `event_type`, matching the
/// wire names consumers dispatch on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
  ExecStarted {
    item_name: String,
    direction: ExecutionDirection,
  },
  ExecFinished {
    item_name: String,
    direction: ExecutionDirection,
    state: EngineState,
    item_state: FinishState,
  },
  /// Item-scoped log message.
  EventMsg {
    author: String,
    kind: MessageKind,
    text: String,
    filter_id: String,
  },
  /// Output captured from a subprocess owned by an item.
  ProcessMsg {
    author: String,
    kind: MessageKind,
    text: String,
    filter_id: String,
  },
  StandardExecutionMsg {
    author: String,
    payload: serde_json::Value,
    filter_id: String,
  },
  KernelExecutionMsg {
    author: String,
    payload: serde_json::Value,
    filter_id: String,
  },
  PersistentExecutionMsg {
    author: String,
    payload: serde_json::Value,
    filter_id: String,
  },
  /// A question to the user; resolved through `Engine::answer_prompt`.
  Prompt {
    author: String,
    prompt: serde_json::Value,
    filter_id: String,
  },
  /// A transient attention ping for the item.
  Flash { author: String },
  /// Terminal event; nothing follows it.
  DagExecFinished { outcome: EngineState },
}

impl Event {
  /// The wire tag of this event.
  pub fn event_type(&self) -> &'static str {
    match self {
      Event::ExecStarted { .. } => "exec_started",
      Event::ExecFinished { .. } => "exec_finished",
      Event::EventMsg { .. } => "event_msg",
      Event::ProcessMsg { .. } => "process_msg",
      Event::StandardExecutionMsg { .. } => "standard_execution_msg",
      Event::KernelExecutionMsg { .. } => "kernel_execution_msg",
      Event::PersistentExecutionMsg { .. } => "persistent_execution_msg",
      Event::Prompt { .. } => "prompt",
      Event::Flash { .. } => "flash",
      Event::DagExecFinished { .. } => "dag_exec_finished",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Event::DagExecFinished { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn events_serialize_with_wire_tags() {
    let event = Event::ExecFinished {
      item_name: "Importer".into(),
      direction: ExecutionDirection::Forward,
      state: EngineState::Running,
      item_state: FinishState::Success,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event_type"], "exec_finished");
    assert_eq!(json["direction"], "FORWARD");
    assert_eq!(json["item_state"], "SUCCESS");
    assert_eq!(event.event_type(), "exec_finished");
  }

  #[test]
  fn terminal_event_is_dag_exec_finished() {
    let event = Event::DagExecFinished {
      outcome: EngineState::Completed,
    };
    assert!(event.is_terminal());
    assert_eq!(
      serde_json::to_value(&event).unwrap()["event_type"],
      "dag_exec_finished"
    );
  }
}
