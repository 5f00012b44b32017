use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::wire::{
    encode_image_payload, AnalyzeResponse, ErrorBody, RecognizeResponse, RegisterResponse,
    UsersResponse,
};
use facegate_env::{CondaBackend, ProvisionReport, Provisioner, Registry};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face recognition gateway CLI")]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "FACEGATE_GATEWAY_URL", default_value = "http://localhost:5000")]
    gateway: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List environments and their readiness on this host
    Envs {
        #[command(flatten)]
        host: HostArgs,
    },
    /// Create or complete environments on this host (all when NAME is omitted)
    Setup {
        name: Option<String>,
        #[command(flatten)]
        host: HostArgs,
    },
    /// Show environment and worker status as seen by the gateway
    Status,
    /// List registered people
    Users,
    /// Register a face image for a person
    Register {
        /// Person name (e.g., "alice")
        #[arg(short, long)]
        name: String,
        /// Image file (jpg/png)
        image: PathBuf,
    },
    /// Identify the faces in an image
    Recognize { image: PathBuf },
    /// Estimate age, gender, emotion and race for the face in an image
    Analyze { image: PathBuf },
}

#[derive(clap::Args)]
struct HostArgs {
    /// Environment manager executable
    #[arg(long, env = "FACEGATE_ENV_MANAGER", default_value = "conda")]
    manager: String,
    /// Registry file replacing the built-in environment list
    #[arg(long, env = "FACEGATE_ENVIRONMENTS_FILE")]
    environments_file: Option<PathBuf>,
}

impl HostArgs {
    fn provisioner(&self) -> Result<Provisioner> {
        let registry = match &self.environments_file {
            Some(path) => Registry::load(path)
                .with_context(|| format!("loading environment registry {}", path.display()))?,
            None => Registry::builtin().clone(),
        };
        Ok(Provisioner::new(
            registry,
            Arc::new(CondaBackend::new(self.manager.clone())),
        ))
    }
}

struct GatewayClient {
    base: String,
    http: reqwest::Client,
}

impl GatewayClient {
    fn new(base: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .with_context(|| format!("contacting gateway at {}", self.base))?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await
            .with_context(|| format!("contacting gateway at {}", self.base))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await.context("reading gateway response")?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        bail!("gateway returned {status}: {message}");
    }
    serde_json::from_slice(&bytes).context("unexpected gateway response")
}

fn image_payload(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(encode_image_payload(&bytes))
}

fn print_report(report: &ProvisionReport) {
    let mark = if report.ready { "ready" } else { "NOT READY" };
    println!("{}: {mark}", report.name);
    if report.created {
        println!("  created environment");
    }
    for package in &report.installed {
        println!("  installed {package}");
    }
    for line in &report.diagnostics {
        println!("  ! {line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = || GatewayClient::new(&cli.gateway, Duration::from_secs(cli.timeout));

    match &cli.command {
        Commands::Envs { host } => {
            let provisioner = host.provisioner()?;
            let states = tokio::task::spawn_blocking(move || {
                provisioner
                    .registry()
                    .environments()
                    .iter()
                    .map(|spec| (spec.clone(), provisioner.status(&spec.name)))
                    .collect::<Vec<_>>()
            })
            .await?;
            for (spec, state) in states {
                let state = state?;
                let label = match (state.exists, state.ready) {
                    (false, _) => "missing",
                    (true, false) => "incomplete",
                    (true, true) => "ready",
                };
                println!("{} (python {}): {label}", spec.name, spec.python);
                for package in state.missing.manager.iter().chain(&state.missing.dependency) {
                    println!("  missing {package}");
                }
            }
        }
        Commands::Setup { name, host } => {
            let provisioner = host.provisioner()?;
            let name = name.clone();
            let reports = tokio::task::spawn_blocking(move || match name {
                Some(name) => provisioner.ensure_environment(&name).map(|r| vec![r]),
                None => Ok(provisioner.ensure_all()),
            })
            .await??;
            reports.iter().for_each(print_report);
            if reports.iter().any(|r| !r.ready) {
                bail!("some environments are not ready");
            }
        }
        Commands::Status => {
            let status: Value = client()?.get("/api/check-environments").await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Users => {
            let users: UsersResponse = client()?.get("/api/get-registered-users").await?;
            if users.users.is_empty() {
                println!("No people registered");
            }
            for user in users.users {
                println!("{} ({} images)", user.name, user.image_count);
            }
        }
        Commands::Register { name, image } => {
            let body = json!({ "name": name, "image": image_payload(image)? });
            let response: RegisterResponse = client()?
                .post("/api/face-recognition/register", &body)
                .await?;
            println!("{} (now {} images)", response.message, response.count);
        }
        Commands::Recognize { image } => {
            let body = json!({ "image": image_payload(image)? });
            let response: RecognizeResponse = client()?
                .post("/api/face-recognition/recognize", &body)
                .await?;
            for face in &response.faces {
                let l = face.location;
                println!(
                    "{} ({:.2}%) at top={} right={} bottom={} left={}",
                    face.name, face.confidence, l.top, l.right, l.bottom, l.left
                );
            }
            println!(
                "{} face(s) in {:.2}s",
                response.total_faces, response.processing_time_seconds
            );
        }
        Commands::Analyze { image } => {
            let body = json!({ "image": image_payload(image)? });
            let response: AnalyzeResponse = client()?.post("/api/deepface/analyze", &body).await?;
            println!("age:     {}", response.age);
            println!("gender:  {} ({:.1}%)", response.gender, response.gender_confidence);
            println!("emotion: {} ({:.1}%)", response.emotion, response.emotion_confidence);
            println!("race:    {} ({:.1}%)", response.race, response.race_confidence);
        }
    }

    Ok(())
}
