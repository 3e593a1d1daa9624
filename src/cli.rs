//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};

use crate::array::DType;
use crate::geometry::Point;
use crate::logging::LogFormat;
use crate::output::OutputFormat;
use crate::paths;
use crate::script::{Device, ModelSpec, NegativePolicy};

/// Drive a segmentation model in a long-lived worker process.
#[derive(Parser, Debug)]
#[command(name = "segbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log format.
    #[arg(long, env = "SEGBRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, env = "SEGBRIDGE_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the worker script generated for an operation.
    Script(ScriptArgs),

    /// Embed an image and run one prompt query against it.
    Segment(SegmentArgs),
}

/// Operation selector for `script`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    Bootstrap,
    Embed,
    Points,
    Box,
    Mask,
}

/// Model family selector.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FamilyArg {
    /// segment-anything
    #[default]
    Sam,
    /// SAM 2
    Sam2,
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormatArg {
    /// One line per polygon.
    #[default]
    Plain,
    /// JSON array of polygons.
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Plain => OutputFormat::Plain,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

/// Which model to load.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model family.
    #[arg(long, value_enum, default_value_t = FamilyArg::Sam)]
    pub family: FamilyArg,

    /// SAM registry variant.
    #[arg(long, default_value = "vit_h")]
    pub variant: String,

    /// SAM 2 model config.
    #[arg(long, default_value = "configs/sam2.1/sam2.1_hiera_l.yaml")]
    pub model_config: String,

    /// Model checkpoint file.
    #[arg(long, env = "SEGBRIDGE_CHECKPOINT", default_value = "sam_vit_h_4b8939.pth")]
    pub checkpoint: PathBuf,

    /// Compute device: auto, cpu, cuda or mps.
    #[arg(long, default_value_t = Device::Auto)]
    pub device: Device,
}

impl ModelArgs {
    pub fn model_spec(&self) -> ModelSpec {
        let checkpoint = paths::expand_tilde(&self.checkpoint);
        let spec = match self.family {
            FamilyArg::Sam => ModelSpec::sam(self.variant.clone(), checkpoint),
            FamilyArg::Sam2 => ModelSpec::sam2(self.model_config.clone(), checkpoint),
        };
        spec.with_device(self.device)
    }
}

/// Settings shared by everything that assembles scripts.
#[derive(Args, Debug, Clone)]
pub struct ContourArgs {
    /// Smallest region, in pixels, that is traced.
    #[arg(long, env = "SEGBRIDGE_MIN_CONTOUR_SIZE")]
    pub min_contour_size: Option<usize>,

    /// Negatives for mask prompts: other-labels or include-background.
    #[arg(long, env = "SEGBRIDGE_NEGATIVES")]
    pub negatives: Option<NegativePolicy>,
}

/// Arguments for the script command.
#[derive(Parser, Debug)]
pub struct ScriptArgs {
    /// Operation to generate.
    #[arg(value_enum)]
    pub kind: ScriptKind,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub contour: ContourArgs,

    /// Shape of the example buffer for embed and mask scripts.
    #[arg(long, value_delimiter = ',', default_values_t = [480usize, 640, 3])]
    pub shape: Vec<usize>,

    /// Element type of the example buffer.
    #[arg(long, default_value_t = DType::Uint8)]
    pub dtype: DType,
}

/// Arguments for the segment command.
#[derive(Parser, Debug)]
#[command(group(
    ArgGroup::new("prompt")
        .required(true)
        .multiple(false)
        .args(["bbox", "point", "mask"])
))]
pub struct SegmentArgs {
    /// Worker environment root (contains bin/python).
    #[arg(long, env = "SEGBRIDGE_ENV_ROOT", default_value_os_t = paths::default_env_root())]
    pub env_root: PathBuf,

    /// Ignore PYTHONPATH and user site-packages in the worker.
    #[arg(long)]
    pub isolated: bool,

    /// Use the in-process stub worker instead of Python.
    #[arg(long)]
    pub stub: bool,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub contour: ContourArgs,

    /// Raw row-major image file.
    #[arg(long)]
    pub image: PathBuf,

    /// Image shape as H,W,3.
    #[arg(long, value_delimiter = ',', required = true)]
    pub shape: Vec<usize>,

    /// Image element type.
    #[arg(long, default_value_t = DType::Uint8)]
    pub dtype: DType,

    /// Box prompt as x0,y0,x1,y1.
    #[arg(
        long = "box",
        id = "bbox",
        value_delimiter = ',',
        num_args = 1,
        allow_negative_numbers = true
    )]
    pub bbox: Option<Vec<i32>>,

    /// Positive point as x,y (repeatable).
    #[arg(long, allow_hyphen_values = true)]
    pub point: Vec<Point>,

    /// Negative point as x,y (repeatable, with --point).
    #[arg(long, requires = "point", allow_hyphen_values = true)]
    pub negative: Vec<Point>,

    /// Raw label map file for a mask prompt.
    #[arg(long, requires = "mask_shape")]
    pub mask: Option<PathBuf>,

    /// Label map shape as H,W.
    #[arg(long, value_delimiter = ',')]
    pub mask_shape: Option<Vec<usize>>,

    /// Label map element type.
    #[arg(long, default_value_t = DType::Uint8)]
    pub mask_dtype: DType,

    /// Abandon tasks running longer than this many seconds.
    #[arg(long, env = "SEGBRIDGE_TASK_TIMEOUT_SECS")]
    pub timeout: Option<u64>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Plain)]
    pub format: OutputFormatArg,
}

impl SegmentArgs {
    /// The box corners, when exactly four were given.
    pub fn box_corners(&self) -> Option<Result<[i32; 4], String>> {
        self.bbox.as_ref().map(|values| {
            <[i32; 4]>::try_from(values.as_slice())
                .map_err(|_| format!("--box takes 4 values, got {}", values.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_script_command() {
        let args = Cli::try_parse_from(["segbridge", "script", "points"]).unwrap();
        match args.command {
            Commands::Script(script) => {
                assert_eq!(script.kind, ScriptKind::Points);
                assert_eq!(script.shape, vec![480, 640, 3]);
                assert_eq!(script.model.family, FamilyArg::Sam);
            }
            _ => panic!("Expected Script command"),
        }
    }

    #[test]
    fn test_segment_box() {
        let args = Cli::try_parse_from([
            "segbridge", "segment", "--stub", "--image", "img.raw", "--shape", "50,50,3", "--box",
            "0,5,10,26",
        ])
        .unwrap();
        match args.command {
            Commands::Segment(segment) => {
                assert!(segment.stub);
                assert_eq!(segment.shape, vec![50, 50, 3]);
                assert_eq!(segment.box_corners(), Some(Ok([0, 5, 10, 26])));
                assert!(segment.point.is_empty());
            }
            _ => panic!("Expected Segment command"),
        }
    }

    #[test]
    fn test_segment_box_arity() {
        let args = Cli::try_parse_from([
            "segbridge", "segment", "--image", "i", "--shape", "1,1,3", "--box", "1,2,3",
        ])
        .unwrap();
        match args.command {
            Commands::Segment(segment) => assert!(matches!(segment.box_corners(), Some(Err(_)))),
            _ => panic!("Expected Segment command"),
        }
    }

    #[test]
    fn test_segment_points() {
        let args = Cli::try_parse_from([
            "segbridge", "segment", "--image", "i", "--shape", "8,8,3", "--point", "1,2", "--point",
            "3,4", "--negative", "5,6", "--format", "json",
        ])
        .unwrap();
        match args.command {
            Commands::Segment(segment) => {
                assert_eq!(segment.point, vec![Point::new(1, 2), Point::new(3, 4)]);
                assert_eq!(segment.negative, vec![Point::new(5, 6)]);
                assert!(matches!(segment.format, OutputFormatArg::Json));
            }
            _ => panic!("Expected Segment command"),
        }
    }

    #[test]
    fn test_segment_requires_exactly_one_prompt() {
        let base = ["segbridge", "segment", "--image", "i", "--shape", "8,8,3"];
        assert!(Cli::try_parse_from(base).is_err());

        let mut both = base.to_vec();
        both.extend(["--box", "0,0,1,1", "--point", "1,1"]);
        assert!(Cli::try_parse_from(both).is_err());

        let mut negative_only = base.to_vec();
        negative_only.extend(["--negative", "1,1"]);
        assert!(Cli::try_parse_from(negative_only).is_err());
    }

    #[test]
    fn test_mask_requires_shape() {
        let result = Cli::try_parse_from([
            "segbridge", "segment", "--image", "i", "--shape", "8,8,3", "--mask", "labels.raw",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_model_spec_from_flags() {
        let args = Cli::try_parse_from([
            "segbridge", "script", "bootstrap", "--family", "sam2", "--checkpoint", "/m/sam2.pt",
            "--device", "cpu",
        ])
        .unwrap();
        match args.command {
            Commands::Script(script) => {
                let spec = script.model.model_spec();
                assert_eq!(spec.device, Device::Cpu);
                assert_eq!(spec.checkpoint, PathBuf::from("/m/sam2.pt"));
            }
            _ => panic!("Expected Script command"),
        }
    }

    #[test]
    fn test_global_options() {
        let args =
            Cli::try_parse_from(["segbridge", "-vv", "--no-color", "script", "box"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["segbridge", "-v", "-q", "script", "box"]).is_err());
    }
}
