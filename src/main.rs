use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use astroyolo::{config, labels, record, Detector};
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "astroyolo")]
#[command(version, about = "YOLO post-processing and label assignment for sky surveys")]
struct Cli {
    /// Config file (defaults to the per-user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode raw model outputs into detections
    Detect {
        /// JSON file holding the per-scale raw outputs
        #[arg(short, long)]
        input: PathBuf,
        /// Original image height; boxes stay in input space when omitted
        #[arg(long, requires = "width")]
        height: Option<usize>,
        /// Original image width
        #[arg(long, requires = "height")]
        width: Option<usize>,
        /// Override the confidence threshold
        #[arg(long)]
        conf: Option<f32>,
        /// Override the NMS IoU threshold
        #[arg(long)]
        nms: Option<f32>,
    },
    /// Assign ground-truth boxes of annotation lines to anchors
    Assign {
        /// An annotation line, or a file of them
        #[arg(short, long)]
        annotation: String,
    },
    /// Print or edit the config file
    Config {
        /// Print the effective config instead of opening an editor
        #[arg(long)]
        show: bool,
    },
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Detect {
            input,
            height,
            width,
            conf,
            nms,
        } => {
            let mut cfg = cfg;
            if let Some(conf) = conf {
                cfg.detector.conf_threshold = conf;
            }
            if let Some(nms) = nms {
                cfg.detector.nms_threshold = nms;
            }
            let shape = height.zip(width);
            detect(&cfg, &input, shape)
        }
        Commands::Assign { annotation } => assign(&cfg, &annotation),
        Commands::Config { show } => {
            if show {
                print!("{}", toml::to_string_pretty(&cfg)?);
                Ok(())
            } else {
                open_config(cli.config.as_deref())
            }
        }
    }
}

fn detect(cfg: &config::Config, input: &Path, shape: Option<(usize, usize)>) -> Result<()> {
    let detector =
        Detector::new(cfg.detector.clone()).context("Invalid detector configuration")?;
    let raw = record::RawOutputs::load(input)?;
    info!("Loaded {} output tensor(s) from {}", raw.outputs.len(), input.display());

    let boxes = match shape {
        Some(shape) => detector.detect_raw(&raw.as_refs(), shape)?,
        None => {
            let predictions =
                astroyolo::yolo::parse_raw_outputs(&raw.as_refs(), detector.config())?;
            detector.decode_and_suppress(&predictions)?
        }
    };
    info!("{} detection(s)", boxes.len());

    let detections = record::Detection::from_boxes(&boxes, Some(detector.config()));
    println!("{}", record::to_json(&detections, cfg.pretty_json)?);
    Ok(())
}

fn assign(cfg: &config::Config, annotation: &str) -> Result<()> {
    let detector =
        Detector::new(cfg.detector.clone()).context("Invalid detector configuration")?;

    let path = Path::new(annotation);
    let lines: Vec<String> = if path.is_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![annotation.to_string()]
    };

    let mut summaries = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        let parsed = labels::parse_annotation_line(line)
            .with_context(|| format!("annotation line {}", n + 1))?;
        if parsed.boxes.is_empty() {
            warn!("{}: no boxes", parsed.image);
        }
        let assignment = detector
            .assign_labels(&parsed.boxes)
            .with_context(|| format!("assigning {}", parsed.image))?;
        info!(
            "{}: {} box(es), {} positive cell(s)",
            parsed.image,
            parsed.boxes.len(),
            assignment.positive_count()
        );
        summaries.push(record::AssignmentSummary::new(
            &parsed.image,
            parsed.boxes.len(),
            &assignment,
        ));
    }

    println!("{}", record::to_json(&summaries, cfg.pretty_json)?);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
