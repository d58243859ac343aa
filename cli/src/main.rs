// cli/src/main.rs

use app_core::config::RuntimeConfig;
use app_core::contracts::EngineResult;
use app_core::data_models::profile::ProfileView;
use app_core::data_models::session::AuthIdentity;
use app_core::orchestration::batch::BatchRequest;
use app_core::orchestration::runtime::{ProfileProvider, ResumeResolver, Runtime};
use app_core::orchestration::service::SessionService;
use app_core::utils::logger;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(name = "applyflow", author, version, about = "Automated job-application sessions", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply to one or more job URLs and watch progress until done
    Apply {
        /// Path to the profile JSON file
        #[clap(short, long)]
        profile: PathBuf,
        /// User id the session runs as
        #[clap(short, long, default_value = "local-user")]
        user: String,
        /// Email attached to the identity
        #[clap(short, long, default_value = "local-user@example.com")]
        email: String,
        /// Target application URLs (up to the configured batch bound)
        urls: Vec<String>,
    },
    /// List live VNC sessions for a user
    Sessions {
        #[clap(short, long, default_value = "local-user")]
        user: String,
    },
    /// Recover sessions recorded before the last restart
    Recover,
    /// Close sessions past the idle horizon and remove their homes
    Sweep,
    /// Validate a profile file and show what the engine would see
    Profile {
        #[clap(short, long)]
        path: PathBuf,
    },
}

/// Profile provider reading one JSON file from disk.
struct FileProfileProvider {
    path: PathBuf,
}

#[async_trait]
impl ProfileProvider for FileProfileProvider {
    async fn get_profile(&self, _user_id: &str) -> EngineResult<ProfileView> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            app_core::contracts::EngineError::validation(format!(
                "profile file unreadable: {e}"
            ))
        })?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| app_core::contracts::EngineError::validation(e.to_string()))?;
        Ok(ProfileView::from_json(&value))
    }
}

/// Resume resolver treating the blob ref as a local file path.
struct FileResumeResolver;

#[async_trait]
impl ResumeResolver for FileResumeResolver {
    async fn resolve(&self, blob_ref: &str) -> EngineResult<(String, Vec<u8>)> {
        let path = PathBuf::from(blob_ref);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            app_core::contracts::EngineError::resource(format!("resume unreadable: {e}"))
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "resume.pdf".to_string());
        Ok((name, bytes))
    }
}

fn runtime_for(profile_path: PathBuf) -> Runtime {
    let config = RuntimeConfig::from_env();
    Runtime::production(
        config,
        Arc::new(FileProfileProvider { path: profile_path }),
        Arc::new(FileResumeResolver),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = logger::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            profile,
            user,
            email,
            urls,
        } => {
            run_apply(profile, user, email, urls).await?;
        }
        Commands::Sessions { user } => {
            let runtime = runtime_for(PathBuf::from("profile.json"));
            let service = SessionService::new(runtime);
            let identity = AuthIdentity::new(user, "cli@local");
            let sessions = service.list_sessions(&identity).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Commands::Recover => {
            let config = RuntimeConfig::from_env();
            let fleet = app_core::vnc::fleet::VncFleet::new(config);
            let recovered = fleet.recover().await?;
            println!("Recovered {recovered} session(s).");
        }
        Commands::Sweep => {
            let config = RuntimeConfig::from_env();
            let fleet = app_core::vnc::fleet::VncFleet::new(config);
            let closed = fleet.cleanup_sweep().await?;
            println!("Closed {closed} stale session(s).");
        }
        Commands::Profile { path } => {
            let provider = FileProfileProvider { path };
            let view = provider.get_profile("inspect").await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}

async fn run_apply(
    profile: PathBuf,
    user: String,
    email: String,
    urls: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if urls.is_empty() {
        return Err("at least one job URL is required".into());
    }
    let runtime = runtime_for(profile);
    let service = SessionService::new(runtime);
    let identity = AuthIdentity::new(user, email);

    let submission = service.start_jobs(
        &identity,
        BatchRequest {
            job_urls: urls,
            tailor_resume: None,
        },
    )?;
    let batch_id = submission["batch_id"]
        .as_str()
        .ok_or("missing batch id")?
        .to_string();
    println!("Batch {batch_id} started.");

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = service.batch_status(&identity, &batch_id)?;
        let completed = status["completed"].as_u64().unwrap_or(0);
        let review = status["ready_for_review"].as_u64().unwrap_or(0);
        let failed = status["failed"].as_u64().unwrap_or(0);
        let total = status["total"].as_u64().unwrap_or(0);
        println!(
            "progress: {completed} completed, {review} awaiting review, {failed} failed of {total}"
        );

        if let Some(slots) = status["slots"].as_array() {
            for slot in slots {
                if let Some(viewer) = slot["vnc_viewer_url"].as_str() {
                    println!(
                        "  review {} at {}",
                        slot["job_url"].as_str().unwrap_or("?"),
                        viewer
                    );
                }
            }
        }

        if status["status"] == "completed" || status["status"] == "closed" {
            println!("{}", serde_json::to_string_pretty(&status)?);
            break;
        }
    }
    Ok(())
}
