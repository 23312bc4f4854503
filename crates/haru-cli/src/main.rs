use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use haru_core::backend;
use haru_core::decoder::LevelPolicy;
use haru_core::features::{NormalizationMode, Vectorizer};
use haru_core::history::{self, EmotionLog};
use haru_core::landmarks::{FaceMeshLandmarker, LandmarkProvider};
use haru_core::upload::EmotionUpload;
use haru_core::{Emotion, LandmarkRetention};
use haru_engine::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "haru", about = "오늘:하루: read today's emotion from a selfie")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a photo and draw the matching sticker onto it
    Analyze {
        /// Photo to analyze (JPEG, PNG, ...)
        image: PathBuf,
        /// Where to write the composited PNG
        #[arg(short, long, default_value = "haru.png")]
        out: PathBuf,
        /// Also write the upload record as JSON
        #[arg(long)]
        record: Option<PathBuf>,
        /// Date for the record (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print the composite as a data URL
        #[arg(long)]
        data_url: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run only the landmark model and print what the classifier would see
    Inspect {
        image: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Summarize a month of saved logs (JSON array of {date, emotion, level})
    Summary {
        logs: PathBuf,
        /// Month as YYYY-MM (default: current month)
        #[arg(long)]
        month: Option<String>,
    },
    /// Print the effective configuration
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line overrides on top of `HARU_*` and the config file.
#[derive(Args)]
struct Overrides {
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    sticker_dir: Option<PathBuf>,
    /// Comma-separated backends in preference order (cuda,coreml,directml,cpu)
    #[arg(long)]
    backends: Option<String>,
    /// raw, bbox or center
    #[arg(long)]
    normalization: Option<NormalizationMode>,
    /// probability-thirds or logit-ladder
    #[arg(long)]
    level_policy: Option<LevelPolicy>,
    /// per-image or persistent
    #[arg(long)]
    retention: Option<LandmarkRetention>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(dir) = self.model_dir {
            config.model_dir = dir;
        }
        if let Some(dir) = self.sticker_dir {
            config.sticker_dir = dir;
        }
        if let Some(list) = self.backends {
            config.backends = backend::parse_backends(&list).map_err(anyhow::Error::msg)?;
        }
        if let Some(mode) = self.normalization {
            config.normalization = mode;
        }
        if let Some(policy) = self.level_policy {
            config.level_policy = policy;
        }
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        Ok(())
    }
}

fn load_config(overrides: Overrides) -> Result<Config> {
    let mut config = Config::load()?;
    overrides.apply(&mut config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            image,
            out,
            record,
            date,
            data_url,
            overrides,
        } => {
            let config = load_config(overrides)?;
            let photo = image::open(&image).with_context(|| format!("opening {}", image.display()))?;

            let load_timeout = config.load_timeout();
            let engine = haru_engine::spawn_engine(config)?;
            engine.wait_ready(load_timeout).await?;

            let analysis = match engine.analyze(photo).await {
                Ok(analysis) => analysis,
                Err(err) => {
                    if let Some(reason) = err.failure_reason().filter(|r| r.is_retake()) {
                        bail!("{reason}: no face found, try another photo");
                    }
                    return Err(err.into());
                }
            };

            let c = &analysis.classification;
            println!("emotion:    {} ({})", c.emotion, c.emotion.korean());
            println!("level:      {}", c.level);
            println!("confidence: {:.3}", c.confidence());
            for (emotion, p) in Emotion::ALL.iter().zip(c.probabilities) {
                println!("  {:<8} {p:.3}", emotion.as_str());
            }

            analysis.composed.save(&out)?;
            println!("composite:  {}", out.display());

            if data_url {
                println!("{}", analysis.composed.to_data_url()?);
            }

            if let Some(path) = record {
                let date = date.unwrap_or_else(|| Local::now().date_naive());
                let upload = EmotionUpload::from_analysis(date, &analysis)?;
                std::fs::write(&path, serde_json::to_string_pretty(&upload)?)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("record:     {}", path.display());
            }
        }
        Commands::Inspect { image, overrides } => {
            let config = load_config(overrides)?;
            let photo = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?
                .to_rgb8();

            let backends = backend::effective_backends(&config.backends);
            let mut landmarker = FaceMeshLandmarker::load(
                &config.detector_model_path(),
                &config.landmark_model_path(),
                config.landmark_count,
                &backends,
            )?;
            let detection = landmarker.detect(&photo)?;
            landmarker.release();

            let Some(keypoints) = detection else {
                println!("no face detected");
                return Ok(());
            };

            println!("landmarks:  {}", keypoints.len());
            if let Some(bbox) = keypoints.bounding_box(0.0) {
                println!(
                    "face box:   x={:.3} y={:.3} w={:.3} h={:.3}",
                    bbox.x, bbox.y, bbox.width, bbox.height
                );
            }

            let features = Vectorizer::new(config.normalization)
                .with_landmark_count(config.landmark_count)
                .vectorize(&keypoints)?;
            let (min, max) = features
                .values
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            println!(
                "features:   {} ({}), range [{min:.4}, {max:.4}]",
                features.len(),
                config.normalization.as_str()
            );
        }
        Commands::Summary { logs, month } => {
            let text = std::fs::read_to_string(&logs).with_context(|| format!("reading {}", logs.display()))?;
            let entries: Vec<EmotionLog> = serde_json::from_str(&text)?;

            let (year, month) = match month {
                Some(m) => parse_month(&m)?,
                None => {
                    let today = Local::now().date_naive();
                    (today.year(), today.month())
                }
            };

            let summary = history::summarize_month(&entries, year, month);
            println!("{year}-{month:02}");
            match summary.representative {
                Some(emotion) => println!("representative: {} ({}) x{}", emotion, emotion.korean(), summary.count),
                None if summary.count > 0 => println!("representative: mixed (top count {})", summary.count),
                None => println!("representative: none"),
            }
            println!("{}", summary.comment);
        }
        Commands::Config { overrides } => {
            let config = load_config(overrides)?;
            println!("model dir:      {}", config.model_dir.display());
            println!("face detector:  {}", config.detector_model_path().display());
            println!("landmark model: {}", config.landmark_model_path().display());
            println!("emotion model:  {}", config.emotion_model_path().display());
            println!("scaler:         {}", config.scaler_path().display());
            println!("stickers:       {}", config.sticker_dir.display());
            println!("normalization:  {}", config.normalization.as_str());
            println!("level policy:   {:?}", config.level_policy);
            println!("retention:      {:?}", config.retention);
            println!(
                "backends:       {}",
                backend::effective_backends(&config.backends)
                    .iter()
                    .map(|b| b.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            println!("output:         {}x{}", config.output_width, config.output_height);
            for p in &config.placements {
                println!(
                    "  sticker {:<6} anchor {:>3} {}x{} offset ({}, {})",
                    p.name, p.anchor, p.width, p.height, p.offset_x, p.offset_y
                );
            }
        }
    }

    Ok(())
}

fn parse_month(s: &str) -> Result<(i32, u32)> {
    let date = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
        .with_context(|| format!("month must be YYYY-MM, got {s}"))?;
    Ok((date.year(), date.month()))
}
