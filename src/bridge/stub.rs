//! In-process worker for tests and dry runs.
//!
//! Executes the same scripts the Python worker would, keyed on their
//! `# segbridge task:` header, against a stand-in model:
//!
//! - a box prompt predicts the filled box;
//! - point prompts predict the filled bounding box of the positive points,
//!   with every negative point cleared;
//! - contours come from the reference tracer.
//!
//! Buffers are read through the same [`BufferChannel`] the caller allocated
//! them from, so resource accounting covers the consumer side too. Failures
//! can be scheduled per operation.

use std::collections::VecDeque;
use std::time::Duration;

use super::protocol::{RequestKind, ResponseKind, WorkerRequest, WorkerResponse};
use super::value::{Inputs, Outputs, Value};
use super::worker::{ProgressEvent, ProgressSink, Received, Worker};
use crate::array::NdArray;
use crate::channel::{BufferChannel, BufferDescriptor};
use crate::contour::{self, BinaryMask, DEFAULT_MIN_CONTOUR_SIZE, extract_polygons};
use crate::error::{BridgeError, Result, TaskFailureKind};
use crate::script::{NegativePolicy, OperationKind, header_value};

/// A scripted misbehaviour for the next task of some operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubFailure {
    /// Report FAILURE with this message without running the task.
    Fail(String),
    /// Die after LAUNCH.
    Crash,
    /// Run the task but leave this key out of the outputs.
    OmitOutput(String),
    /// Never finish; acknowledge CANCEL only if the flag is set.
    Hang { acknowledge_cancel: bool },
}

struct Hanging {
    task: String,
    acknowledge_cancel: bool,
}

/// Deterministic worker that runs tasks in-process.
pub struct StubWorker<C: BufferChannel> {
    channel: C,
    responses: VecDeque<WorkerResponse>,
    failures: Vec<(OperationKind, StubFailure)>,
    alive: bool,
    crashed: bool,
    model_loaded: bool,
    image: Option<(usize, usize)>,
    hanging: Option<Hanging>,
    progress: Option<ProgressSink>,
    executed: Vec<OperationKind>,
}

impl<C: BufferChannel> StubWorker<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            responses: VecDeque::new(),
            failures: Vec::new(),
            alive: true,
            crashed: false,
            model_loaded: false,
            image: None,
            hanging: None,
            progress: None,
            executed: Vec::new(),
        }
    }

    /// Misbehave on the next task of kind `kind`.
    pub fn fail_next(mut self, kind: OperationKind, failure: StubFailure) -> Self {
        self.failures.push((kind, failure));
        self
    }

    /// Operations executed so far, in order.
    pub fn executed(&self) -> &[OperationKind] {
        &self.executed
    }

    fn take_failure(&mut self, kind: OperationKind) -> Option<StubFailure> {
        let pos = self.failures.iter().position(|(k, _)| *k == kind)?;
        Some(self.failures.remove(pos).1)
    }

    fn push(&mut self, task: &str, kind: ResponseKind) {
        self.responses.push_back(WorkerResponse::new(task, kind));
    }

    fn log(&self, line: &str) {
        tracing::debug!(target: "segbridge::worker", "{}", line);
        if let Some(sink) = &self.progress {
            sink(&ProgressEvent::Log(line.to_string()));
        }
    }

    fn execute(&mut self, task: &str, script: &str, inputs: &Inputs) {
        let kind = match header_value(script, "task").map(str::parse::<OperationKind>) {
            Some(Ok(kind)) => kind,
            _ => {
                self.push(task, ResponseKind::Launch);
                self.push(
                    task,
                    ResponseKind::Failure {
                        error: "stub worker cannot run scripts without a task header".into(),
                    },
                );
                return;
            }
        };
        self.executed.push(kind);
        self.push(task, ResponseKind::Launch);

        let mut omit = None;
        match self.take_failure(kind) {
            Some(StubFailure::Fail(error)) => {
                self.push(task, ResponseKind::Failure { error });
                return;
            }
            Some(StubFailure::Crash) => {
                self.alive = false;
                self.crashed = true;
                return;
            }
            Some(StubFailure::Hang { acknowledge_cancel }) => {
                self.hanging = Some(Hanging {
                    task: task.to_string(),
                    acknowledge_cancel,
                });
                return;
            }
            Some(StubFailure::OmitOutput(key)) => omit = Some(key),
            None => {}
        }

        let min_size = header_value(script, "min-contour-size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIN_CONTOUR_SIZE);
        let result = match kind {
            OperationKind::Bootstrap => self.bootstrap(task),
            OperationKind::EmbedImage => self.embed(inputs),
            OperationKind::PointPrompt => self.points(inputs, min_size),
            OperationKind::BoxPrompt => self.boxed(inputs, min_size),
            OperationKind::MaskPrompt => {
                let policy = header_value(script, "negatives")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default();
                self.mask(inputs, policy, min_size)
            }
        };

        match result {
            Ok(mut outputs) => {
                if let Some(key) = omit {
                    outputs.remove(&key);
                }
                self.push(task, ResponseKind::Completion { outputs });
            }
            Err(e) => self.push(
                task,
                ResponseKind::Failure {
                    error: e.to_string(),
                },
            ),
        }
    }

    fn bootstrap(&mut self, task: &str) -> Result<Outputs> {
        self.log("loading stand-in model");
        self.push(
            task,
            ResponseKind::Update {
                message: Some("model ready".into()),
                current: Some(1),
                maximum: Some(1),
            },
        );
        self.model_loaded = true;
        Ok(Outputs::new())
    }

    fn require_model(&self) -> Result<()> {
        if self.model_loaded {
            Ok(())
        } else {
            Err(BridgeError::InvalidInput("name 'predictor' is not defined".into()))
        }
    }

    fn read_buffer(&self, inputs: &Inputs, key: &str) -> Result<NdArray> {
        let descriptor: &BufferDescriptor = match inputs.get(key) {
            Some(Value::BufferRef(d)) => d,
            _ => {
                return Err(BridgeError::InvalidInput(format!(
                    "input '{}' must reference a shared buffer",
                    key
                )));
            }
        };
        let bytes = self.channel.consume(descriptor)?;
        let needed = descriptor.byte_size();
        let bytes = &bytes[..needed.min(bytes.len())];
        NdArray::from_le_bytes(bytes, &descriptor.shape, descriptor.dtype)
    }

    fn embed(&mut self, inputs: &Inputs) -> Result<Outputs> {
        self.require_model()?;
        let image = self.read_buffer(inputs, "image")?;
        let shape = image.shape().to_vec();
        if shape.len() != 3 || shape[2] != 3 {
            return Err(BridgeError::InvalidInput(format!(
                "expected an RGB image, got shape {:?}",
                shape
            )));
        }
        self.image = Some((shape[0], shape[1]));
        let mut outputs = Outputs::new();
        outputs.insert(
            "image_shape".into(),
            Value::IntList(shape.iter().map(|d| *d as i64).collect()),
        );
        Ok(outputs)
    }

    fn image_size(&self) -> Result<(usize, usize)> {
        self.require_model()?;
        self.image
            .ok_or_else(|| BridgeError::InvalidInput("predictor has no image set".into()))
    }

    fn points(&self, inputs: &Inputs, min_size: usize) -> Result<Outputs> {
        let (height, width) = self.image_size()?;
        let positive = point_list(inputs, "positive")?;
        let negative = point_list(inputs, "negative")?;
        let mask = predict(width, height, &positive, &negative);
        Ok(contour::encode(&extract_polygons(&mask, min_size)))
    }

    fn boxed(&self, inputs: &Inputs, min_size: usize) -> Result<Outputs> {
        let (height, width) = self.image_size()?;
        let corners = inputs
            .get("box")
            .and_then(Value::as_integers)
            .filter(|v| v.len() == 4)
            .ok_or_else(|| BridgeError::InvalidInput("input 'box' must hold 4 integers".into()))?;
        let mask = predict(
            width,
            height,
            &[(corners[0], corners[1]), (corners[2], corners[3])],
            &[],
        );
        Ok(contour::encode(&extract_polygons(&mask, min_size)))
    }

    fn mask(&self, inputs: &Inputs, policy: NegativePolicy, min_size: usize) -> Result<Outputs> {
        let (height, width) = self.image_size()?;
        let labels = self.read_buffer(inputs, "labels")?;
        let values = labels
            .integer_values()
            .ok_or_else(|| BridgeError::InvalidInput("label map must be integer".into()))?;
        if values.len() != height * width {
            return Err(BridgeError::InvalidInput(format!(
                "label map has {} pixels, image has {}",
                values.len(),
                height * width
            )));
        }

        let mut distinct: Vec<i64> = values.iter().copied().filter(|v| *v >= 1).collect();
        distinct.sort_unstable();
        distinct.dedup();

        let pixel = |i: usize| ((i % width) as i64, (i / width) as i64);
        let mut polygons = Vec::new();
        for label in distinct {
            let positive: Vec<(i64, i64)> = (0..values.len())
                .filter(|i| values[*i] == label)
                .map(pixel)
                .collect();
            let negative: Vec<(i64, i64)> = (0..values.len())
                .filter(|i| {
                    let v = values[*i];
                    v != label
                        && (v != 0 || policy == NegativePolicy::IncludeBackground)
                })
                .map(pixel)
                .collect();
            let mask = predict(width, height, &positive, &negative);
            polygons.extend(extract_polygons(&mask, min_size));
        }
        Ok(contour::encode(&polygons))
    }
}

fn point_list(inputs: &Inputs, key: &str) -> Result<Vec<(i64, i64)>> {
    let Some(value) = inputs.get(key) else {
        return Ok(Vec::new());
    };
    let rows = value
        .as_rows()
        .ok_or_else(|| BridgeError::InvalidInput(format!("input '{}' must be a point list", key)))?;
    rows.iter()
        .map(|row| match row.as_integers().as_deref() {
            Some([x, y]) => Ok((*x, *y)),
            _ => Err(BridgeError::InvalidInput(format!(
                "input '{}' holds a malformed point",
                key
            ))),
        })
        .collect()
}

/// Stand-in model: filled bounding box of the positives, negatives cleared.
fn predict(
    width: usize,
    height: usize,
    positive: &[(i64, i64)],
    negative: &[(i64, i64)],
) -> BinaryMask {
    let mut mask = BinaryMask::new(width, height);
    if positive.is_empty() || width == 0 || height == 0 {
        return mask;
    }
    let clamp_x = |v: i64| v.clamp(0, width as i64 - 1) as usize;
    let clamp_y = |v: i64| v.clamp(0, height as i64 - 1) as usize;
    let (x0, x1) = positive
        .iter()
        .fold((i64::MAX, i64::MIN), |(lo, hi), (x, _)| (lo.min(*x), hi.max(*x)));
    let (y0, y1) = positive
        .iter()
        .fold((i64::MAX, i64::MIN), |(lo, hi), (_, y)| (lo.min(*y), hi.max(*y)));
    if x1 < 0 || y1 < 0 || x0 >= width as i64 || y0 >= height as i64 {
        return mask;
    }
    for y in clamp_y(y0)..=clamp_y(y1) {
        for x in clamp_x(x0)..=clamp_x(x1) {
            mask.set(x, y, true);
        }
    }
    for (x, y) in negative {
        if let (Ok(x), Ok(y)) = (usize::try_from(*x), usize::try_from(*y)) {
            mask.set(x, y, false);
        }
    }
    mask
}

impl<C: BufferChannel> Worker for StubWorker<C> {
    fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        if !self.alive {
            return Err(BridgeError::task(
                TaskFailureKind::Crashed,
                "stub worker is not running",
            ));
        }
        match &request.kind {
            RequestKind::Execute { script, inputs } => self.execute(&request.task, script, inputs),
            RequestKind::Cancel => {
                if let Some(hanging) = &self.hanging
                    && hanging.task == request.task
                    && hanging.acknowledge_cancel
                {
                    self.push(&request.task, ResponseKind::Cancelation);
                    self.hanging = None;
                }
            }
            RequestKind::Exit => self.alive = false,
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Received> {
        if let Some(response) = self.responses.pop_front() {
            return Ok(Received::Response(response));
        }
        if !self.alive {
            let how = if self.crashed {
                "stub worker crashed"
            } else {
                "stub worker exited"
            };
            return Ok(Received::Disconnected(how.into()));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(Received::Pending)
    }

    fn set_progress(&mut self, sink: Option<ProgressSink>) {
        self.progress = sink;
    }

    fn shutdown(&mut self, _timeout: Duration) -> Result<()> {
        self.alive = false;
        self.hanging = None;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.shutdown(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_box_is_filled_and_clipped() {
        let mask = predict(10, 8, &[(-3, 2), (4, 20)], &[]);
        assert_eq!(mask.count(), 5 * 6);
        assert!(mask.get(0, 2));
        assert!(mask.get(4, 7));
        assert!(!mask.get(5, 2));
    }

    #[test]
    fn test_predict_clears_negatives() {
        let mask = predict(10, 10, &[(2, 2), (4, 4)], &[(3, 3), (9, 9)]);
        assert_eq!(mask.count(), 8);
        assert!(!mask.get(3, 3));
    }

    #[test]
    fn test_predict_outside_image_is_empty() {
        assert_eq!(predict(5, 5, &[(10, 10), (12, 12)], &[]).count(), 0);
        assert_eq!(predict(5, 5, &[], &[(1, 1)]).count(), 0);
    }

    #[test]
    fn test_point_list_parsing() {
        let mut inputs = Inputs::new();
        inputs.insert("positive".into(), Value::points([(1, 2), (3, 4)]));
        inputs.insert("negative".into(), Value::IntList(vec![]));
        assert_eq!(point_list(&inputs, "positive").unwrap(), vec![(1, 2), (3, 4)]);
        assert!(point_list(&inputs, "negative").unwrap().is_empty());
        assert!(point_list(&inputs, "missing").unwrap().is_empty());

        inputs.insert("bad".into(), Value::NestedList(vec![Value::IntList(vec![1])]));
        assert!(point_list(&inputs, "bad").is_err());
    }
}
