//! Worker-side script generation.
//!
//! Every operation the bridge performs is a short Python script executed in
//! the worker's persistent namespace. Assembly is pure: the same request and
//! settings always produce byte-identical text.
//!
//! Scripts start with comment headers the worker ignores:
//!
//! ```text
//! # segbridge task: mask-prompt
//! # segbridge min-contour-size: 3
//! # segbridge negatives: other-labels
//! ```

mod templates;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channel::BufferDescriptor;
use crate::contour::DEFAULT_MIN_CONTOUR_SIZE;

/// Helper routines bound by the bootstrap script.
pub const HELPERS: &str = include_str!("python/helpers.py");

/// Prefix of the header comment lines.
pub const HEADER_PREFIX: &str = "# segbridge ";

/// Which operation a script performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Bootstrap,
    EmbedImage,
    PointPrompt,
    BoxPrompt,
    MaskPrompt,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        Self::Bootstrap,
        Self::EmbedImage,
        Self::PointPrompt,
        Self::BoxPrompt,
        Self::MaskPrompt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::EmbedImage => "embed-image",
            Self::PointPrompt => "point-prompt",
            Self::BoxPrompt => "box-prompt",
            Self::MaskPrompt => "mask-prompt",
        }
    }

    /// Output keys the template guarantees on completion.
    pub fn required_outputs(self) -> &'static [&'static str] {
        match self {
            Self::Bootstrap => &[],
            Self::EmbedImage => &["image_shape"],
            Self::PointPrompt | Self::BoxPrompt | Self::MaskPrompt => {
                &[crate::contour::CONTOURS_X, crate::contour::CONTOURS_Y]
            }
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation '{}'", s))
    }
}

/// Compute device requested for the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CUDA, then MPS, then CPU, whichever the worker finds first.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Mps,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            other => Err(format!(
                "unknown device '{}' (expected auto, cpu, cuda or mps)",
                other
            )),
        }
    }
}

/// Which model package builds the predictor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelFamily {
    /// `segment_anything`, looked up in `sam_model_registry` by variant
    /// (`vit_b`, `vit_l`, `vit_h`).
    Sam { variant: String },
    /// `sam2`, built from a config name.
    Sam2 { config: String },
}

/// Everything the bootstrap script needs to construct the predictor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub family: ModelFamily,
    pub checkpoint: PathBuf,
    pub device: Device,
}

impl ModelSpec {
    pub fn sam(variant: impl Into<String>, checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            family: ModelFamily::Sam {
                variant: variant.into(),
            },
            checkpoint: checkpoint.into(),
            device: Device::Auto,
        }
    }

    pub fn sam2(config: impl Into<String>, checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            family: ModelFamily::Sam2 {
                config: config.into(),
            },
            checkpoint: checkpoint.into(),
            device: Device::Auto,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

/// Which pixels serve as negative prompts for a mask label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegativePolicy {
    /// Pixels carrying any other nonzero label.
    #[default]
    OtherLabels,
    /// Every pixel not carrying this label, background included.
    IncludeBackground,
}

impl NegativePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OtherLabels => "other-labels",
            Self::IncludeBackground => "include-background",
        }
    }
}

impl fmt::Display for NegativePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NegativePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "other-labels" => Ok(Self::OtherLabels),
            "include-background" => Ok(Self::IncludeBackground),
            other => Err(format!("unknown negative policy '{}'", other)),
        }
    }
}

/// One operation to turn into a script.
///
/// Point and box coordinates travel as task inputs (`positive`, `negative`,
/// `box`); bulk arrays are referenced by their shared buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    Bootstrap(ModelSpec),
    EmbedImage {
        image: BufferDescriptor,
    },
    PointPrompt,
    BoxPrompt,
    MaskPrompt {
        labels: BufferDescriptor,
        negatives: NegativePolicy,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Bootstrap(_) => OperationKind::Bootstrap,
            Self::EmbedImage { .. } => OperationKind::EmbedImage,
            Self::PointPrompt => OperationKind::PointPrompt,
            Self::BoxPrompt => OperationKind::BoxPrompt,
            Self::MaskPrompt { .. } => OperationKind::MaskPrompt,
        }
    }
}

/// Generated script plus what it promises to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptText {
    pub kind: OperationKind,
    pub text: String,
    pub required_outputs: Vec<String>,
}

impl ScriptText {
    pub fn new(kind: OperationKind, text: String, required_outputs: Vec<String>) -> Self {
        Self {
            kind,
            text,
            required_outputs,
        }
    }

    /// Value of a `# segbridge <key>: <value>` header line.
    pub fn header(&self, key: &str) -> Option<&str> {
        header_value(&self.text, key)
    }
}

/// Read a header value from raw script text.
pub fn header_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .take_while(|line| line.starts_with(HEADER_PREFIX))
        .find_map(|line| {
            let rest = &line[HEADER_PREFIX.len()..];
            let (k, v) = rest.split_once(':')?;
            (k.trim() == key).then(|| v.trim())
        })
}

/// Builds scripts for operation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptAssembler {
    min_contour_size: usize,
}

impl Default for ScriptAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONTOUR_SIZE)
    }
}

impl ScriptAssembler {
    pub fn new(min_contour_size: usize) -> Self {
        Self { min_contour_size }
    }

    pub fn min_contour_size(&self) -> usize {
        self.min_contour_size
    }

    pub fn assemble(&self, request: &OperationRequest) -> ScriptText {
        let kind = request.kind();
        let body = match request {
            OperationRequest::Bootstrap(model) => templates::bootstrap(model),
            OperationRequest::EmbedImage { image } => templates::embed_image(image),
            OperationRequest::PointPrompt => templates::point_prompt(self.min_contour_size),
            OperationRequest::BoxPrompt => templates::box_prompt(self.min_contour_size),
            OperationRequest::MaskPrompt { labels, negatives } => {
                templates::mask_prompt(labels, *negatives, self.min_contour_size)
            }
        };

        let mut text = format!("{}task: {}\n", HEADER_PREFIX, kind);
        if matches!(
            kind,
            OperationKind::PointPrompt | OperationKind::BoxPrompt | OperationKind::MaskPrompt
        ) {
            text.push_str(&format!(
                "{}min-contour-size: {}\n",
                HEADER_PREFIX, self.min_contour_size
            ));
        }
        if let OperationRequest::MaskPrompt { negatives, .. } = request {
            text.push_str(&format!("{}negatives: {}\n", HEADER_PREFIX, negatives));
        }
        text.push_str(&body);

        ScriptText::new(
            kind,
            text,
            kind.required_outputs().iter().map(|s| s.to_string()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    fn labels_buffer() -> BufferDescriptor {
        BufferDescriptor::new("sgbfeedfacecafebeef_2".into(), DType::Int32, vec![4, 6])
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let assembler = ScriptAssembler::default();
        let requests = [
            OperationRequest::Bootstrap(ModelSpec::sam("vit_b", "/models/sam_vit_b.pth")),
            OperationRequest::EmbedImage {
                image: BufferDescriptor::new("sgbabc_0".into(), DType::Uint8, vec![8, 8, 3]),
            },
            OperationRequest::PointPrompt,
            OperationRequest::BoxPrompt,
            OperationRequest::MaskPrompt {
                labels: labels_buffer(),
                negatives: NegativePolicy::OtherLabels,
            },
        ];
        for request in &requests {
            assert_eq!(assembler.assemble(request), assembler.assemble(request));
        }
    }

    #[test]
    fn test_header_and_required_outputs() {
        let assembler = ScriptAssembler::new(5);
        let script = assembler.assemble(&OperationRequest::BoxPrompt);
        assert!(script.text.starts_with("# segbridge task: box-prompt\n"));
        assert_eq!(script.header("task"), Some("box-prompt"));
        assert_eq!(script.header("min-contour-size"), Some("5"));
        assert_eq!(script.required_outputs, vec!["contours_x", "contours_y"]);

        let embed = assembler.assemble(&OperationRequest::EmbedImage {
            image: BufferDescriptor::new("sgbabc_0".into(), DType::Uint8, vec![8, 8, 3]),
        });
        assert_eq!(embed.required_outputs, vec!["image_shape"]);
        assert_eq!(embed.header("min-contour-size"), None);
    }

    #[test]
    fn test_embed_references_buffer_textually() {
        let script = ScriptAssembler::default().assemble(&OperationRequest::EmbedImage {
            image: BufferDescriptor::new("sgb0011_7".into(), DType::Float32, vec![480, 640, 3]),
        });
        assert!(
            script
                .text
                .contains(r#"attach_array("sgb0011_7", "<f4", [480, 640, 3])"#)
        );
        assert!(script.text.contains("predictor.set_image"));
    }

    #[test]
    fn test_bootstrap_escapes_paths() {
        let model = ModelSpec::sam2("configs/sam2.1_hiera_s.yaml", "/weights/it's \"here\".pt")
            .with_device(Device::Cpu);
        let script = ScriptAssembler::default()
            .assemble(&OperationRequest::Bootstrap(model));
        assert!(script.text.contains(r#""/weights/it's \"here\".pt""#));
        assert!(script.text.contains("build_sam2("));
        assert!(script.text.contains(r#"_select_device("cpu")"#));
        assert!(script.text.contains("def get_polygons_from_binary_mask"));
        assert!(script.required_outputs.is_empty());
    }

    #[test]
    fn test_sam_bootstrap_uses_registry() {
        let script = ScriptAssembler::default().assemble(&OperationRequest::Bootstrap(
            ModelSpec::sam("vit_h", "/w/sam_vit_h.pth"),
        ));
        assert!(script.text.contains(r#"sam_model_registry["vit_h"]"#));
        assert!(script.text.contains("SamPredictor("));
    }

    #[test]
    fn test_point_template_order_and_labels() {
        let script = ScriptAssembler::default().assemble(&OperationRequest::PointPrompt);
        let text = &script.text;
        let pos = text.find("positive + negative").unwrap();
        assert!(text[pos..].contains("[1] * len(positive) + [0] * len(negative)"));
        assert!(text.contains("min_size=3"));
    }

    #[test]
    fn test_box_template_corner_labels() {
        let script = ScriptAssembler::default().assemble(&OperationRequest::BoxPrompt);
        assert!(script.text.contains("[[x0, y0], [x1, y1]], [2, 3]"));
    }

    #[test]
    fn test_mask_negative_policy() {
        let assembler = ScriptAssembler::default();
        let other = assembler.assemble(&OperationRequest::MaskPrompt {
            labels: labels_buffer(),
            negatives: NegativePolicy::OtherLabels,
        });
        let all = assembler.assemble(&OperationRequest::MaskPrompt {
            labels: labels_buffer(),
            negatives: NegativePolicy::IncludeBackground,
        });
        assert_eq!(other.header("negatives"), Some("other-labels"));
        assert_eq!(all.header("negatives"), Some("include-background"));
        assert!(other.text.contains("include_background = False"));
        assert!(all.text.contains("include_background = True"));
        assert!(other.text.contains(r#"attach_array("sgbfeedfacecafebeef_2", "<i4", [4, 6])"#));
        assert_ne!(other.text, all.text);
    }

    #[test]
    fn test_kind_and_device_parsing() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("segment".parse::<OperationKind>().is_err());
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda);
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(
            "include-background".parse::<NegativePolicy>().unwrap(),
            NegativePolicy::IncludeBackground
        );
    }

    #[test]
    fn test_header_value_stops_at_body() {
        let text = "# segbridge task: box-prompt\nx = 1\n# segbridge task: bootstrap\n";
        assert_eq!(header_value(text, "task"), Some("box-prompt"));
        assert_eq!(header_value(text, "negatives"), None);
    }
}
