//! segbridge - out-of-process segmentation bridge

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use segbridge::array::NdArray;
use segbridge::bridge::{
    CancelToken, EnvironmentDescriptor, ProgressEvent, ProgressSink, StubWorker, Worker,
};
use segbridge::channel::{BufferChannel, BufferDescriptor, MemoryChannel};
use segbridge::cli::{Cli, Commands, ScriptArgs, ScriptKind, SegmentArgs};
use segbridge::config::SessionConfig;
use segbridge::geometry::Polygon;
use segbridge::logging::{self, LogConfig};
use segbridge::manager::{SessionManager, initialize_session};
use segbridge::output;
use segbridge::paths;
use segbridge::script::{OperationRequest, ScriptAssembler};
use segbridge::theme::{self, Themed};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Script(args) => cmd_script(args),
        Commands::Segment(args) => cmd_segment(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::for_verbosity(cli.verbose, cli.quiet);
    // Explicit -v/-q beat SEGBRIDGE_LOG and RUST_LOG.
    if cli.verbose > 0 || cli.quiet {
        let level = config.level.to_string().to_lowercase();
        config = config.with_filter(level);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(paths::expand_tilde(path));
    }
    logging::init(config.with_env_overrides());
}

fn assembler_for(min_contour_size: Option<usize>, config: &SessionConfig) -> ScriptAssembler {
    ScriptAssembler::new(min_contour_size.unwrap_or(config.min_contour_size))
}

/// Print the script one operation would send to the worker.
fn cmd_script(args: &ScriptArgs) -> Result<()> {
    let config = SessionConfig::default().with_env_overrides();
    let assembler = assembler_for(args.contour.min_contour_size, &config);
    let example = BufferDescriptor::new("sgbexample".to_string(), args.dtype, args.shape.clone());

    let request = match args.kind {
        ScriptKind::Bootstrap => OperationRequest::Bootstrap(args.model.model_spec()),
        ScriptKind::Embed => OperationRequest::EmbedImage { image: example },
        ScriptKind::Points => OperationRequest::PointPrompt,
        ScriptKind::Box => OperationRequest::BoxPrompt,
        ScriptKind::Mask => OperationRequest::MaskPrompt {
            labels: example,
            negatives: args.contour.negatives.unwrap_or(config.negative_policy),
        },
    };

    print!("{}", assembler.assemble(&request).text);
    Ok(())
}

fn read_array(path: &Path, shape: &[usize], dtype: segbridge::array::DType) -> Result<NdArray> {
    let bytes = std::fs::read(paths::expand_tilde(path))
        .with_context(|| format!("Failed to read {}", path.display()))?;
    NdArray::from_le_bytes(&bytes, shape, dtype)
        .with_context(|| {
            format!("{} does not hold a {} array of shape {:?}", path.display(), dtype, shape)
        })
}

fn progress_printer() -> ProgressSink {
    Arc::new(|event: &ProgressEvent| match event {
        ProgressEvent::Log(line) => eprintln!("{} {}", "worker".muted(), line),
        ProgressEvent::Heartbeat { .. } => eprintln!("{}", event.to_string().warning()),
        ProgressEvent::Update { .. } => eprintln!("{} {}", "progress".label(), event),
    })
}

/// Embed the image and run the requested prompt.
fn cmd_segment(cli: &Cli, args: &SegmentArgs) -> Result<()> {
    let image = read_array(&args.image, &args.shape, args.dtype)?;
    let labels = match (&args.mask, &args.mask_shape) {
        (Some(path), Some(shape)) => Some(read_array(path, shape, args.mask_dtype)?),
        _ => None,
    };
    let corners = args.box_corners().transpose().map_err(anyhow::Error::msg)?;

    let mut config = SessionConfig::default().with_env_overrides();
    if let Some(size) = args.contour.min_contour_size {
        config = config.with_min_contour_size(size);
    }
    if let Some(policy) = args.contour.negatives {
        config = config.with_negative_policy(policy);
    }
    if let Some(secs) = args.timeout {
        config = config.with_task_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    if cli.verbose > 0 && !cli.quiet {
        config = config.with_progress(progress_printer());
    }

    // Ctrl+C cancels the task in flight, so its shared buffer is still released.
    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, canceling the running task...");
        interrupt.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;
    config = config.with_cancel_token(cancel);

    let model = args.model.model_spec();
    let polygons = if args.stub {
        let channel = MemoryChannel::new();
        let worker = StubWorker::new(channel.clone());
        let mut manager = SessionManager::start(worker, channel, &model, config)
            .context("Failed to start stub session")?;
        manager.add_image(&image).context("Failed to embed image")?;
        query(&mut manager, args, corners, labels.as_ref())?
    } else {
        let root = paths::expand_tilde(&args.env_root);
        let descriptor = EnvironmentDescriptor::new(root, args.isolated);
        let mut manager = initialize_session(&descriptor, &model, config, &image)
            .with_context(|| format!("Failed to start worker in {}", descriptor.root.display()))?;
        query(&mut manager, args, corners, labels.as_ref())?
    };

    if !cli.quiet {
        eprintln!("Found {} polygon(s)", polygons.len().count());
    }
    output::print_polygons(&polygons, args.format.into())?;
    Ok(())
}

fn query<W: Worker, C: BufferChannel>(
    manager: &mut SessionManager<W, C>,
    args: &SegmentArgs,
    corners: Option<[i32; 4]>,
    labels: Option<&NdArray>,
) -> Result<Vec<Polygon>> {
    let result = if let Some(corners) = corners {
        manager.process_box(corners)
    } else if let Some(labels) = labels {
        manager.process_mask(labels)
    } else if !args.point.is_empty() {
        manager.process_points(&args.point, &args.negative)
    } else {
        bail!("No prompt given");
    };
    let polygons = result.context("Segmentation query failed")?;
    manager.close().context("Failed to shut down worker")?;
    Ok(polygons)
}
