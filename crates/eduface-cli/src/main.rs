use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "eduface", version, about = "Face verification, recognition, analysis and attendance CLI")]
struct Cli {
    /// Base URL of a running edufaced
    #[arg(long, global = true, env = "EDUFACE_URL", default_value = "http://127.0.0.1:8000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether two images show the same person
    Verify {
        image1: PathBuf,
        image2: PathBuf,
        #[command(flatten)]
        options: MatchArgs,
    },
    /// Search the reference database for the face in an image
    Recognize {
        image: PathBuf,
        #[command(flatten)]
        options: MatchArgs,
    },
    /// Predict age, gender, emotion and race for every face in an image
    Analyze {
        image: PathBuf,
        /// Comma-separated subset of age,gender,emotion,race
        #[arg(long)]
        actions: Option<String>,
        #[arg(long)]
        detector: Option<String>,
        /// Fall back to the whole image when no face is found
        #[arg(long)]
        no_enforce: bool,
    },
    /// Mark attendance or list today's and recent attendance
    #[command(subcommand)]
    Attendance(AttendanceCommand),
    /// Show daemon status and loaded models
    Status,
}

#[derive(Subcommand)]
enum AttendanceCommand {
    /// Identify the student in an image and mark them present today
    Mark {
        image: PathBuf,
        /// Maximum distance for the closest reference face
        #[arg(long)]
        max_distance: Option<f32>,
        /// Required separation between the best and the next person
        #[arg(long)]
        min_margin: Option<f32>,
    },
    /// Attendance recorded today
    Today,
    /// Latest attendance records
    Recent {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Args)]
struct MatchArgs {
    /// cosine, euclidean or euclidean_l2
    #[arg(long)]
    metric: Option<String>,
    /// Maximum distance counted as a match
    #[arg(long)]
    threshold: Option<f32>,
    /// scrfd or skip
    #[arg(long)]
    detector: Option<String>,
    /// Fall back to the whole image when no face is found
    #[arg(long)]
    no_enforce: bool,
}

impl MatchArgs {
    fn apply(self, mut form: Form) -> Form {
        if let Some(metric) = self.metric {
            form = form.text("distance_metric", metric);
        }
        if let Some(threshold) = self.threshold {
            form = form.text("threshold", threshold.to_string());
        }
        if let Some(detector) = self.detector {
            form = form.text("detector_backend", detector);
        }
        if self.no_enforce {
            form = form.text("enforce_detection", "false");
        }
        form
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let base = cli.url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let request = match cli.command {
        Commands::Verify { image1, image2, options } => {
            let form = Form::new()
                .part("image1", image_part(&image1).await?)
                .part("image2", image_part(&image2).await?);
            client.post(format!("{base}/verify")).multipart(options.apply(form))
        }
        Commands::Recognize { image, options } => {
            let form = Form::new().part("image", image_part(&image).await?);
            client.post(format!("{base}/recognize")).multipart(options.apply(form))
        }
        Commands::Analyze { image, actions, detector, no_enforce } => {
            let mut form = Form::new().part("image", image_part(&image).await?);
            if let Some(actions) = actions {
                form = form.text("actions", actions);
            }
            if let Some(detector) = detector {
                form = form.text("detector_backend", detector);
            }
            if no_enforce {
                form = form.text("enforce_detection", "false");
            }
            client.post(format!("{base}/analyze")).multipart(form)
        }
        Commands::Attendance(AttendanceCommand::Mark { image, max_distance, min_margin }) => {
            let mut form = Form::new().part("image", image_part(&image).await?);
            if let Some(max_distance) = max_distance {
                form = form.text("max_distance", max_distance.to_string());
            }
            if let Some(min_margin) = min_margin {
                form = form.text("min_margin", min_margin.to_string());
            }
            client.post(format!("{base}/attendance/mark")).multipart(form)
        }
        Commands::Attendance(AttendanceCommand::Today) => client.get(format!("{base}/attendance/today")),
        Commands::Attendance(AttendanceCommand::Recent { limit }) => {
            let request = client.get(format!("{base}/attendance/recent"));
            match limit {
                Some(limit) => request.query(&[("limit", limit)]),
                None => request,
            }
        }
        Commands::Status => client.get(format!("{base}/")),
    };

    tracing::debug!(url = %base, "sending request");
    let response = request
        .send()
        .await
        .with_context(|| format!("could not reach edufaced at {base}"))?;

    let status = response.status();
    let text = response.text().await.context("failed to read edufaced response")?;

    if !status.is_success() {
        bail!("edufaced returned {status}: {}", error_detail(&text));
    }

    let body: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("edufaced returned a non-JSON response ({status})"))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// The `detail` of a JSON error body, or the raw body when a proxy or the
/// server answered with something else.
fn error_detail(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "empty body".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(detail) => detail.to_string(),
            None => body.to_string(),
        },
        Err(_) => body.to_string(),
    }
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}
