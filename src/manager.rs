//! High-level segmentation session: embed an image once, then query it.
//!
//! The manager turns typed calls into assembled scripts plus task inputs,
//! moves bulk arrays through a [`BufferChannel`], and decodes contour
//! outputs into polygons. It tracks whether the worker currently holds a
//! valid image embedding and refuses prompt queries until it does.

use crate::array::NdArray;
use crate::bridge::{
    CancelToken, EnvironmentDescriptor, Inputs, Outputs, Proc, Value, Worker, WorkerSession,
    spawn_worker,
};
use crate::channel::{self, BufferChannel, BufferDescriptor, SharedBuffer, ShmChannel};
use crate::config::SessionConfig;
use crate::contour;
use crate::error::{BridgeError, Result};
use crate::geometry::{Point, Polygon};
use crate::script::{ModelSpec, NegativePolicy, OperationRequest, ScriptAssembler};

/// The image the worker's predictor currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Embedding {
    pub height: usize,
    pub width: usize,
}

/// A worker session plus the embedding state and buffer channel it needs.
pub struct SessionManager<W: Worker = Proc, C: BufferChannel = ShmChannel> {
    session: WorkerSession<W>,
    channel: C,
    assembler: ScriptAssembler,
    negative_policy: NegativePolicy,
    embedding: Option<Embedding>,
}

/// Spawn a worker from `descriptor`, load `model`, and embed `image`.
///
/// On any failure the worker is shut down before the error is returned.
pub fn initialize_session(
    descriptor: &EnvironmentDescriptor,
    model: &ModelSpec,
    config: SessionConfig,
    image: &NdArray,
) -> Result<SessionManager> {
    let worker = spawn_worker(descriptor)?;
    let mut manager = SessionManager::start(worker, ShmChannel::new(), model, config)?;
    if let Err(e) = manager.add_image(image) {
        if let Err(close_err) = manager.close() {
            tracing::warn!(error = %close_err, "Failed to close session after embedding failed");
        }
        return Err(e);
    }
    Ok(manager)
}

impl<W: Worker, C: BufferChannel> SessionManager<W, C> {
    /// Bootstrap `model` on an already spawned worker.
    pub fn start(worker: W, channel: C, model: &ModelSpec, config: SessionConfig) -> Result<Self> {
        let assembler = ScriptAssembler::new(config.min_contour_size);
        let negative_policy = config.negative_policy;
        let bootstrap = assembler.assemble(&OperationRequest::Bootstrap(model.clone()));
        let session = WorkerSession::start(worker, bootstrap, config)?;
        Ok(Self {
            session,
            channel,
            assembler,
            negative_policy,
            embedding: None,
        })
    }

    pub fn session(&self) -> &WorkerSession<W> {
        &self.session
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn embedding(&self) -> Option<Embedding> {
        self.embedding
    }

    pub fn negative_policy(&self) -> NegativePolicy {
        self.negative_policy
    }

    pub fn set_negative_policy(&mut self, policy: NegativePolicy) {
        self.negative_policy = policy;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.session.cancel_token()
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// Embed an `[h, w, 3]` image.
    pub fn add_image(&mut self, image: &NdArray) -> Result<Embedding> {
        let (height, width) = match image.shape() {
            [h, w, 3] if *h > 0 && *w > 0 => (*h, *w),
            shape => {
                return Err(BridgeError::InvalidInput(format!(
                    "image must have shape [height, width, 3], got {:?}",
                    shape
                )));
            }
        };
        self.ensure_ready()?;
        self.embedding = None;

        let outputs =
            self.transfer(image, "image", |image| OperationRequest::EmbedImage { image })?;
        if let Some(reported) = outputs.get("image_shape").and_then(Value::as_integers)
            && reported != [height as i64, width as i64, 3]
        {
            tracing::warn!(?reported, height, width, "Worker reported a different image shape");
        }

        let embedding = Embedding { height, width };
        tracing::debug!(height, width, "Image embedded");
        self.embedding = Some(embedding);
        Ok(embedding)
    }

    /// Replace the embedded image. The previous embedding is invalid from the
    /// moment this is called, even if the new one fails.
    pub fn update_image(&mut self, image: &NdArray) -> Result<Embedding> {
        self.embedding = None;
        self.add_image(image)
    }

    /// Segment from positive and negative click points.
    pub fn process_points(
        &mut self,
        positive: &[Point],
        negative: &[Point],
    ) -> Result<Vec<Polygon>> {
        self.require_embedding()?;
        if positive.is_empty() && negative.is_empty() {
            return Err(BridgeError::InvalidInput(
                "point query needs at least one point".into(),
            ));
        }

        let as_pairs = |points: &[Point]| {
            Value::points(points.iter().map(|p| (i64::from(p.x), i64::from(p.y))))
        };
        let mut inputs = Inputs::new();
        inputs.insert("positive".into(), as_pairs(positive));
        inputs.insert("negative".into(), as_pairs(negative));
        self.query(OperationRequest::PointPrompt, inputs)
    }

    /// Segment the object inside `[x0, y0, x1, y1]`.
    pub fn process_box(&mut self, corners: [i32; 4]) -> Result<Vec<Polygon>> {
        self.require_embedding()?;
        let [x0, y0, x1, y1] = corners;
        if x1 < x0 || y1 < y0 {
            return Err(BridgeError::InvalidInput(format!(
                "box corners are reversed: [{}, {}, {}, {}]",
                x0, y0, x1, y1
            )));
        }

        let mut inputs = Inputs::new();
        inputs.insert(
            "box".into(),
            Value::IntList(corners.iter().map(|v| i64::from(*v)).collect()),
        );
        self.query(OperationRequest::BoxPrompt, inputs)
    }

    /// Segment every labelled region of an `[h, w]` or `[h, w, 1]` label map.
    ///
    /// Polygons come back grouped by label in ascending order.
    pub fn process_mask(&mut self, labels: &NdArray) -> Result<Vec<Polygon>> {
        let embedding = self.require_embedding()?;
        if !labels.dtype().is_integer() {
            return Err(BridgeError::InvalidInput(format!(
                "label map must have an integer type, got {}",
                labels.dtype()
            )));
        }
        let matches = match labels.shape() {
            [h, w] | [h, w, 1] => *h == embedding.height && *w == embedding.width,
            _ => false,
        };
        if !matches {
            return Err(BridgeError::InvalidInput(format!(
                "label map shape {:?} does not match the embedded image ({}x{})",
                labels.shape(),
                embedding.height,
                embedding.width
            )));
        }

        let negatives = self.negative_policy;
        let outputs = self.transfer(labels, "labels", |labels| OperationRequest::MaskPrompt {
            labels,
            negatives,
        })?;
        contour::decode(&outputs)
    }

    /// Shut the worker down. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.embedding = None;
        self.session.close()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.session.is_ready() {
            Ok(())
        } else {
            Err(BridgeError::NotReady(self.session.state()))
        }
    }

    fn require_embedding(&self) -> Result<Embedding> {
        self.ensure_ready()?;
        self.embedding.ok_or_else(|| {
            BridgeError::InvalidInput("no image embedded; call add_image first".into())
        })
    }

    fn query(&mut self, request: OperationRequest, inputs: Inputs) -> Result<Vec<Polygon>> {
        let script = self.assembler.assemble(&request);
        let outputs = self.session.submit(script, inputs)?;
        contour::decode(&outputs)
    }

    /// Submit a task whose bulk input travels through one shared buffer.
    ///
    /// The local handle is closed on every path; on failure the segment is
    /// also unlinked in case the worker never consumed it.
    fn transfer(
        &mut self,
        array: &NdArray,
        key: &str,
        request: impl FnOnce(BufferDescriptor) -> OperationRequest,
    ) -> Result<Outputs> {
        let mut buffer = self.channel.allocate(array.shape(), array.dtype())?;
        let result = buffer.write_from(array).and_then(|()| {
            let descriptor = buffer.descriptor().clone();
            let script = self.assembler.assemble(&request(descriptor.clone()));
            let mut inputs = Inputs::new();
            inputs.insert(key.to_string(), Value::BufferRef(descriptor));
            self.session.submit(script, inputs)
        });
        let cleanup = channel::release(buffer, result.is_err());
        BridgeError::with_cleanup(result, cleanup)
    }
}
