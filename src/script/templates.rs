//! Script bodies for each operation.

use std::fmt::Write as _;

use super::{HELPERS, ModelFamily, ModelSpec, NegativePolicy};
use crate::channel::BufferDescriptor;

/// A Python string literal. JSON string escaping is valid Python.
fn py_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn py_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

fn attach(var: &str, buffer: &BufferDescriptor) -> String {
    format!(
        "{} = attach_array({}, {}, {})\n",
        var,
        py_str(&buffer.name),
        py_str(buffer.dtype.numpy_code()),
        py_shape(&buffer.shape)
    )
}

const SELECT_DEVICE: &str = r#"import torch


def _select_device(requested):
    if requested != "auto":
        return requested
    if torch.cuda.is_available():
        return "cuda"
    mps = getattr(torch.backends, "mps", None)
    if mps is not None and mps.is_available():
        return "mps"
    return "cpu"

"#;

pub(super) fn bootstrap(model: &ModelSpec) -> String {
    let checkpoint = model.checkpoint.to_string_lossy();
    let mut text = String::new();
    text.push_str(HELPERS);
    text.push('\n');
    text.push_str(SELECT_DEVICE);
    let _ = writeln!(text, "device = _select_device({})", py_str(&model.device.to_string()));
    text.push_str("task.update(message=\"loading model on \" + device, current=0, maximum=1)\n");

    match &model.family {
        ModelFamily::Sam { variant } => {
            text.push_str("from segment_anything import SamPredictor, sam_model_registry\n\n");
            let _ = writeln!(
                text,
                "model = sam_model_registry[{}](checkpoint={})",
                py_str(variant),
                py_str(&checkpoint)
            );
            text.push_str("model.to(device=device)\n");
            text.push_str("predictor = SamPredictor(model)\n");
        }
        ModelFamily::Sam2 { config } => {
            text.push_str("from sam2.build_sam import build_sam2\n");
            text.push_str("from sam2.sam2_image_predictor import SAM2ImagePredictor\n\n");
            let _ = writeln!(
                text,
                "model = build_sam2({}, {}, device=device)",
                py_str(config),
                py_str(&checkpoint)
            );
            text.push_str("predictor = SAM2ImagePredictor(model)\n");
        }
    }

    text.push_str("task.update(message=\"model ready\", current=1, maximum=1)\n");
    text
}

pub(super) fn embed_image(image: &BufferDescriptor) -> String {
    let mut text = attach("image", image);
    text.push_str(
        r#"if image.dtype != np.uint8:
    image = np.clip(image, 0, 255).astype(np.uint8)
predictor.set_image(image)
task.outputs["image_shape"] = [int(d) for d in image.shape]
"#,
    );
    text
}

fn emit_contours(min_size: usize) -> String {
    format!(
        "polygons_to_outputs(get_polygons_from_binary_mask(mask, min_size={}), {}, {})\n",
        min_size, "contours_x", "contours_y"
    )
}

const STORE_CONTOURS: &str = r#"task.outputs["contours_x"] = contours_x
task.outputs["contours_y"] = contours_y
"#;

pub(super) fn point_prompt(min_size: usize) -> String {
    let mut text = String::from(
        r#"positive = [[int(v) for v in p] for p in task.inputs.get("positive", [])]
negative = [[int(v) for v in p] for p in task.inputs.get("negative", [])]
coords = positive + negative
labels = [1] * len(positive) + [0] * len(negative)
mask = segment(coords, labels)
contours_x, contours_y = [], []
"#,
    );
    text.push_str(&emit_contours(min_size));
    text.push_str(STORE_CONTOURS);
    text
}

pub(super) fn box_prompt(min_size: usize) -> String {
    let mut text = String::from(
        r#"x0, y0, x1, y1 = [int(v) for v in task.inputs["box"]]
mask = segment([[x0, y0], [x1, y1]], [2, 3])
contours_x, contours_y = [], []
"#,
    );
    text.push_str(&emit_contours(min_size));
    text.push_str(STORE_CONTOURS);
    text
}

pub(super) fn mask_prompt(
    labels: &BufferDescriptor,
    negatives: NegativePolicy,
    min_size: usize,
) -> String {
    let mut text = attach("label_map", labels);
    let include_background = match negatives {
        NegativePolicy::OtherLabels => "False",
        NegativePolicy::IncludeBackground => "True",
    };
    let _ = writeln!(
        text,
        "label_map = label_map.reshape(label_map.shape[0], label_map.shape[1])"
    );
    let _ = writeln!(text, "include_background = {}", include_background);
    text.push_str("contours_x, contours_y = [], []\n");
    text.push_str(
        r#"for value in np.unique(label_map):
    if value < 1:
        continue
    ys, xs = np.nonzero(label_map == value)
    positive = [[int(x), int(y)] for x, y in zip(xs, ys)]
    if include_background:
        others = label_map != value
    else:
        others = (label_map != value) & (label_map != 0)
    ys, xs = np.nonzero(others)
    negative = [[int(x), int(y)] for x, y in zip(xs, ys)]
    mask = segment(positive + negative, [1] * len(positive) + [0] * len(negative))
"#,
    );
    text.push_str("    ");
    text.push_str(&emit_contours(min_size));
    text.push_str(STORE_CONTOURS);
    text
}
