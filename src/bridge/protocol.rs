//! Wire protocol between the session and its worker.
//!
//! Messages are JSON objects, one per line. Every message names the task it
//! belongs to; the message type sits next to it:
//!
//! ```text
//! {"task":"6f1c…","requestType":"EXECUTE","script":"…","inputs":{…}}
//! {"task":"6f1c…","responseType":"LAUNCH"}
//! {"task":"6f1c…","responseType":"COMPLETION","outputs":{…}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::{Inputs, Outputs};
use crate::error::{BridgeError, Result, TaskFailureKind};
use crate::script::ScriptText;

/// Request from the session to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: String,
    #[serde(flatten)]
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// Run `script` with `inputs` bound in its namespace.
    Execute { script: String, inputs: Inputs },
    /// Ask the running task to stop at its next cancellation check.
    Cancel,
    /// Leave the main loop after the current task.
    Exit,
}

/// Response from the worker about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub task: String,
    #[serde(flatten)]
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "responseType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    /// The script started executing.
    Launch,
    /// Progress report from inside the script.
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<u64>,
    },
    /// The script returned normally.
    Completion {
        #[serde(default)]
        outputs: Outputs,
    },
    /// The script raised.
    Failure {
        #[serde(default)]
        error: String,
    },
    /// The script stopped after a cancel request.
    Cancelation,
    /// The worker itself is going down.
    Crash {
        #[serde(default)]
        error: String,
    },
}

impl WorkerRequest {
    pub fn execute(task: impl Into<String>, script: impl Into<String>, inputs: Inputs) -> Self {
        Self {
            task: task.into(),
            kind: RequestKind::Execute {
                script: script.into(),
                inputs,
            },
        }
    }

    pub fn cancel(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind: RequestKind::Cancel,
        }
    }

    pub fn exit() -> Self {
        Self {
            task: new_task_id(),
            kind: RequestKind::Exit,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerResponse {
    pub fn new(task: impl Into<String>, kind: ResponseKind) -> Self {
        Self {
            task: task.into(),
            kind,
        }
    }

    pub fn completion(task: impl Into<String>, outputs: Outputs) -> Self {
        Self::new(task, ResponseKind::Completion { outputs })
    }

    pub fn failure(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            task,
            ResponseKind::Failure {
                error: error.into(),
            },
        )
    }

    pub fn crash(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            task,
            ResponseKind::Crash {
                error: error.into(),
            },
        )
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Parse a line read from the worker's stdout.
    ///
    /// An object naming both a task and a response type belongs to that task
    /// even when its body does not decode: it becomes a FAILURE carrying the
    /// decode error. Anything else is returned as an error and is not part of
    /// the protocol.
    pub fn from_worker_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw: serde_json::Value = serde_json::from_str(line.trim())?;
        let field = |key: &str| {
            raw.get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        };
        let addressed = field("task").zip(field("responseType"));

        match serde_json::from_value(raw) {
            Ok(response) => Ok(response),
            Err(e) => match addressed {
                Some((task, kind)) => Ok(Self::failure(
                    task,
                    format!("malformed {} message from worker: {}", kind, e),
                )),
                None => Err(e),
            },
        }
    }
}

pub(crate) fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Submitted,
    Running,
    Complete,
    Failed,
    Crashed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }

    /// The error kind for unsuccessful terminal states.
    pub fn failure_kind(self) -> Option<TaskFailureKind> {
        match self {
            Self::Failed => Some(TaskFailureKind::Failed),
            Self::Crashed => Some(TaskFailureKind::Crashed),
            Self::Canceled => Some(TaskFailureKind::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// One unit of work: a script, its inputs, and what came back.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub script: ScriptText,
    pub inputs: Inputs,
    status: TaskStatus,
    outputs: Outputs,
    error: Option<String>,
}

impl Task {
    pub fn new(script: ScriptText, inputs: Inputs) -> Self {
        Self {
            id: new_task_id(),
            script,
            inputs,
            status: TaskStatus::Submitted,
            outputs: Outputs::new(),
            error: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The EXECUTE request for this task.
    pub fn request(&self) -> WorkerRequest {
        WorkerRequest::execute(&self.id, &self.script.text, self.inputs.clone())
    }

    /// Required output keys absent from `outputs`.
    pub fn missing_outputs(&self, outputs: &Outputs) -> Vec<String> {
        self.script
            .required_outputs
            .iter()
            .filter(|key| !outputs.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    /// Advance the state machine with a worker response.
    ///
    /// The first response of any kind implies Running. Responses after a
    /// terminal state, and a second LAUNCH, are protocol violations.
    pub fn apply(&mut self, response: ResponseKind) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BridgeError::Protocol(format!(
                "task {} received a response after reaching {}",
                self.id, self.status
            )));
        }

        match response {
            ResponseKind::Launch => {
                if self.status == TaskStatus::Running {
                    return Err(BridgeError::Protocol(format!(
                        "task {} launched twice",
                        self.id
                    )));
                }
                self.status = TaskStatus::Running;
            }
            ResponseKind::Update { .. } => self.status = TaskStatus::Running,
            ResponseKind::Completion { outputs } => {
                let missing = self.missing_outputs(&outputs);
                if missing.is_empty() {
                    self.status = TaskStatus::Complete;
                } else {
                    self.status = TaskStatus::Failed;
                    self.error = Some(format!(
                        "{} task completed without required outputs: {}",
                        self.script.kind,
                        missing.join(", ")
                    ));
                }
                self.outputs = outputs;
            }
            ResponseKind::Failure { error } => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
            ResponseKind::Cancelation => {
                self.status = TaskStatus::Canceled;
                self.error = Some("task canceled".into());
            }
            ResponseKind::Crash { error } => {
                self.status = TaskStatus::Crashed;
                self.error = Some(error);
            }
        }
        Ok(())
    }

    /// Force a terminal state from outside the protocol (process death,
    /// abandoned cancellation).
    pub fn abandon(&mut self, status: TaskStatus, message: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = status;
            self.error = Some(message.into());
        }
    }

    /// Consume a terminal task into its outputs or a typed error.
    pub fn into_result(self) -> Result<Outputs> {
        match self.status.failure_kind() {
            None if self.status == TaskStatus::Complete => Ok(self.outputs),
            None => Err(BridgeError::Protocol(format!(
                "task {} is still {}",
                self.id, self.status
            ))),
            Some(kind) => Err(BridgeError::task(
                kind,
                self.error.unwrap_or_else(|| kind.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::value::Value;
    use crate::script::{OperationKind, ScriptText};

    fn script(required: &[&str]) -> ScriptText {
        ScriptText::new(
            OperationKind::PointPrompt,
            "pass\n".into(),
            required.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_execute_request_wire_format() {
        let mut inputs = Inputs::new();
        inputs.insert("box".into(), Value::IntList(vec![1, 2, 3, 4]));
        let line = WorkerRequest::execute("abc", "x = 1", inputs).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["task"], "abc");
        assert_eq!(json["requestType"], "EXECUTE");
        assert_eq!(json["script"], "x = 1");
        assert_eq!(json["inputs"]["box"], serde_json::json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_cancel_and_exit_round_trip() {
        let cancel = WorkerRequest::cancel("t1");
        let parsed = WorkerRequest::from_line(&cancel.to_line().unwrap()).unwrap();
        assert_eq!(parsed, cancel);
        assert!(cancel.to_line().unwrap().contains(r#""requestType":"CANCEL""#));

        let exit = WorkerRequest::exit();
        assert!(matches!(
            WorkerRequest::from_line(&exit.to_line().unwrap()).unwrap().kind,
            RequestKind::Exit
        ));
    }

    #[test]
    fn test_response_parsing() {
        let r = WorkerResponse::from_line(r#"{"task":"t","responseType":"LAUNCH"}"#).unwrap();
        assert_eq!(r.kind, ResponseKind::Launch);

        let r = WorkerResponse::from_line(
            r#"{"task":"t","responseType":"UPDATE","message":"loading","current":1,"maximum":3}"#,
        )
        .unwrap();
        assert_eq!(
            r.kind,
            ResponseKind::Update {
                message: Some("loading".into()),
                current: Some(1),
                maximum: Some(3)
            }
        );

        let r = WorkerResponse::from_line(
            r#"{"task":"t","responseType":"COMPLETION","outputs":{"contours_x":[[1,2]]}}"#,
        )
        .unwrap();
        match r.kind {
            ResponseKind::Completion { outputs } => {
                assert_eq!(
                    outputs["contours_x"],
                    Value::NestedList(vec![Value::IntList(vec![1, 2])])
                );
            }
            other => panic!("Expected Completion, got {:?}", other),
        }

        let r = WorkerResponse::from_line(r#"{"task":"t","responseType":"COMPLETION"}"#).unwrap();
        assert_eq!(
            r.kind,
            ResponseKind::Completion {
                outputs: Outputs::new()
            }
        );
    }

    #[test]
    fn test_unknown_response_type_rejected() {
        assert!(WorkerResponse::from_line(r#"{"task":"t","responseType":"BOGUS"}"#).is_err());
        assert!(WorkerResponse::from_line("not json").is_err());
    }

    #[test]
    fn test_malformed_message_fails_its_task() {
        let line =
            r#"{"task":"t9","responseType":"COMPLETION","outputs":{"contours_x":[[1,null]]}}"#;
        let r = WorkerResponse::from_worker_line(line).unwrap();
        assert_eq!(r.task, "t9");
        match r.kind {
            ResponseKind::Failure { error } => {
                assert!(error.starts_with("malformed COMPLETION message"), "{}", error)
            }
            other => panic!("Expected Failure, got {:?}", other),
        }

        let bogus = r#"{"task":"t9","responseType":"BOGUS"}"#;
        let r = WorkerResponse::from_worker_line(bogus).unwrap();
        assert!(matches!(r.kind, ResponseKind::Failure { .. }));
    }

    #[test]
    fn test_worker_line_noise_is_rejected() {
        assert!(WorkerResponse::from_worker_line("Loading checkpoint...").is_err());
        assert!(WorkerResponse::from_worker_line(r#"{"progress": 0.5}"#).is_err());
        assert!(WorkerResponse::from_worker_line(r#"{"task":"t9"}"#).is_err());
        assert!(WorkerResponse::from_worker_line("[1, 2]").is_err());
    }

    #[test]
    fn test_status_happy_path() {
        let mut task = Task::new(script(&["contours_x"]), Inputs::new());
        assert_eq!(task.status(), TaskStatus::Submitted);
        task.apply(ResponseKind::Launch).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        task.apply(ResponseKind::Update {
            message: None,
            current: None,
            maximum: None,
        })
        .unwrap();

        let mut outputs = Outputs::new();
        outputs.insert("contours_x".into(), Value::IntList(vec![]));
        task.apply(ResponseKind::Completion { outputs }).unwrap();
        assert_eq!(task.status(), TaskStatus::Complete);
        assert!(task.into_result().is_ok());
    }

    #[test]
    fn test_first_response_implies_running() {
        let mut task = Task::new(script(&[]), Inputs::new());
        task.apply(ResponseKind::Crash {
            error: "segfault".into(),
        })
        .unwrap();
        assert_eq!(task.status(), TaskStatus::Crashed);
        let err = task.into_result().unwrap_err();
        assert_eq!(err.task_failure(), Some(TaskFailureKind::Crashed));
        assert!(err.to_string().contains("segfault"));
    }

    #[test]
    fn test_duplicate_launch_is_protocol_error() {
        let mut task = Task::new(script(&[]), Inputs::new());
        task.apply(ResponseKind::Launch).unwrap();
        assert!(matches!(
            task.apply(ResponseKind::Launch),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut task = Task::new(script(&[]), Inputs::new());
        task.apply(ResponseKind::Cancelation).unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.apply(ResponseKind::Launch).is_err());

        task.abandon(TaskStatus::Crashed, "late");
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[test]
    fn test_missing_required_output_fails_task() {
        let mut task = Task::new(script(&["contours_x", "contours_y"]), Inputs::new());
        let mut outputs = Outputs::new();
        outputs.insert("contours_x".into(), Value::IntList(vec![]));
        task.apply(ResponseKind::Completion { outputs }).unwrap();

        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().contains("contours_y"));
        assert_eq!(
            task.into_result().unwrap_err().task_failure(),
            Some(TaskFailureKind::Failed)
        );
    }

    #[test]
    fn test_non_terminal_into_result_is_error() {
        let task = Task::new(script(&[]), Inputs::new());
        assert!(matches!(task.into_result(), Err(BridgeError::Protocol(_))));
    }
}
