use std::time::Duration;

use clap::{Parser, Subcommand};
use corelms_gateway::jobs::{JobPoller, PollState, Timeline, TimelineEntry, TimelineView};
use corelms_gateway::model::entity::{
    JobKind, JobList, JobRecord, MAX_JOB_LIST_LIMIT, SessionUser, is_valid_id,
};
use corelms_gateway::model::{ApiClient, ModelManager, UpstreamError};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(about = "CLI tool for inspecting CoreLMS jobs", long_about = None)]
pub struct Cli {
    /// CoreLMS API base URL
    #[arg(long, env = "CORE_API_BASE_URL", default_value = "http://localhost:8000")]
    pub api: String,

    /// Access token of an admin account
    #[arg(long, env = "CORE_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Upstream timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the user behind the token
    Me,

    /// Import and regeneration jobs
    Jobs {
        #[command(subcommand)]
        action: JobCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Print the merged timeline
    List {
        /// Show finished jobs instead of running ones
        #[arg(long, default_value_t = false)]
        history: bool,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Poll the queues and print status changes until Ctrl+C
    Watch {
        #[arg(long, default_value_t = 3000)]
        interval_ms: u64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Queue a failed import again
    Retry { job_id: String },
    /// Ask the worker to stop a job
    Cancel { job_id: String },
    /// Regenerate the quizzes of every lesson in a module
    RegenModule { module_id: String },
    /// Regenerate the quiz of a single lesson
    RegenLesson { submodule_id: String },
}

fn require_id(id: &str) {
    if !is_valid_id(id) {
        eprintln!("malformed id: {id:?}");
        std::process::exit(2);
    }
}

fn print_entry(entry: &TimelineEntry) {
    let when = entry
        .timestamp
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| String::from("-"));
    let stage = entry.stage_label.as_deref().unwrap_or("-");

    println!(
        "{when}  {:<6} {:<36} {:<18} {:<28} {}",
        entry.kind, entry.job_id, entry.badge_label, stage, entry.title
    );
    if let Some(failure) = &entry.failure {
        println!("        {failure}");
    }
}

async fn watch(mm: ModelManager, token: String, interval: Duration, limit: u32) {
    let cancel = CancellationToken::new();
    let mut rx = JobPoller::new(mm, token, interval, limit).spawn(cancel.clone());

    let stop = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.cancel();
    });

    let mut first = true;
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        match state {
            PollState::Pending => {}
            PollState::Ready {
                timeline,
                transitions,
            } => {
                if first {
                    timeline
                        .view(TimelineView::Active, limit as usize)
                        .iter()
                        .for_each(print_entry);
                    first = false;
                }
                for t in transitions {
                    let from = t.from.map(|b| b.label()).unwrap_or("new");
                    println!("{} {} {}: {} -> {}", t.kind, t.job_id, t.title, from, t.to);
                }
            }
            PollState::Failed { message } => eprintln!("poll failed: {message}"),
            PollState::SessionExpired => {
                eprintln!("token rejected, stopping");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> corelms_gateway::error::AppResult<()> {
    let _ = dotenvy::dotenv();
    let args = Cli::parse();

    let client = ApiClient::connect(&args.api, Duration::from_secs(args.timeout_secs))?;
    let mm = ModelManager::new(client);
    let token = args.token;

    match args.command {
        Commands::Me => {
            let user = SessionUser::fetch(&mm, &token).await?;
            println!("{} ({}), role: {}", user.name(), user.id(), user.role());
            if user.must_change_password() {
                println!("password change required");
            }
        }

        Commands::Jobs { action } => match action {
            JobCommands::List { history, limit } => {
                let limit = limit.clamp(1, MAX_JOB_LIST_LIMIT);
                let (imports, regens) = tokio::try_join!(
                    JobList::fetch(&mm, &token, JobKind::Import, limit, history),
                    JobList::fetch(&mm, &token, JobKind::Regen, limit, history),
                )?;

                let view = if history {
                    TimelineView::History
                } else {
                    TimelineView::Active
                };
                let entries = Timeline::reconcile(&imports, &regens).view(view, limit as usize);
                if entries.is_empty() {
                    println!("no jobs");
                }
                entries.iter().for_each(print_entry);
            }

            JobCommands::Watch { interval_ms, limit } => {
                let limit = limit.clamp(1, MAX_JOB_LIST_LIMIT);
                watch(mm, token, Duration::from_millis(interval_ms.max(250)), limit).await;
            }

            JobCommands::Retry { job_id } => {
                require_id(&job_id);
                let resp = JobRecord::retry(&mm, &token, &job_id).await?;
                println!("Retry queued: {resp}");
            }

            JobCommands::Cancel { job_id } => {
                require_id(&job_id);
                match JobRecord::cancel(&mm, &token, &job_id).await {
                    Ok(resp) => println!("Cancel requested: {resp}"),
                    Err(UpstreamError::Rejected { status, message, .. }) => {
                        eprintln!("cancel refused ({status}): {message}");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            JobCommands::RegenModule { module_id } => {
                require_id(&module_id);
                let resp = JobRecord::regenerate_module(&mm, &token, &module_id).await?;
                println!("Regeneration queued: {resp}");
            }

            JobCommands::RegenLesson { submodule_id } => {
                require_id(&submodule_id);
                let resp = JobRecord::regenerate_submodule(&mm, &token, &submodule_id).await?;
                println!("Regeneration queued: {resp}");
            }
        },
    }

    Ok(())
}
