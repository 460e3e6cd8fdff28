//! audit-loop: drive a judge-scored audit loop from the shell
//!
//! Each invocation is one operation on a session persisted under the state
//! directory. Replies go to stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convergence::{
    classify_any, AuditController, ControllerConfig, FileSessionStore, Language, SessionConfig,
    Submission, SubprocessJudge,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session record directory (overrides the config file and AUDIT_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Judge one candidate and print the reply
    Submit {
        #[arg(long)]
        session: String,

        /// 1-based loop index; defaults to the session's next loop
        #[arg(long = "loop")]
        loop_index: Option<u32>,

        /// Task description, used when the session is created
        #[arg(long)]
        task: Option<String>,

        /// Candidate file; read from stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Source language; inferred from --file when omitted
        #[arg(long)]
        language: Option<String>,

        /// External context id passed through to the judge
        #[arg(long)]
        context_id: Option<String>,
    },

    /// Print the persisted state of a session
    Status {
        #[arg(long)]
        session: String,
    },

    /// Stop a session manually
    Terminate {
        #[arg(long)]
        session: String,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Print complexity metrics and the audit depth plan for a file
    Analyze {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the JSON reply
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let classified = classify_any(&e);
            eprintln!("{}", classified.to_json());
            if classified.recoverable {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> Result<String> {
    let mut config = ControllerConfig::load_or_default(args.config.as_deref());
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    debug!(state_dir = %config.state_dir.display(), judge = %config.judge.program, "Configuration resolved");

    let store = Arc::new(FileSessionStore::new(&config.state_dir));
    let judge = Arc::new(SubprocessJudge::from_config(&config.judge));
    let controller = AuditController::new(store, judge, config);

    let reply = match args.command {
        Command::Submit {
            session,
            loop_index,
            task,
            file,
            language,
            context_id,
        } => {
            let candidate = read_candidate(file.as_deref()).await?;
            let language = resolve_language(language.as_deref(), file.as_deref());

            let mut submission = Submission::new(session, candidate)
                .with_config(SessionConfig::for_task(task.unwrap_or_default()))
                .with_language(language);
            submission.loop_index = loop_index;
            submission.context_id = context_id;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; abandoning the in-flight judge call");
                    on_signal.cancel();
                }
            });

            controller.submit_with_cancel(submission, cancel).await?
        }
        Command::Status { session } => controller.status(&session).await?,
        Command::Terminate { session, reason } => {
            let reply = controller.terminate(&session, &reason).await?;
            info!(session_id = %session, "Session terminated");
            reply
        }
        Command::Analyze { file, language } => {
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let language = resolve_language(language.as_deref(), Some(&file));
            let (profile, plan) = controller.analyze(&source, language);
            let out = serde_json::json!({ "profile": profile, "plan": plan });
            return Ok(serde_json::to_string_pretty(&out)?);
        }
    };

    Ok(reply.to_json())
}

async fn read_candidate(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("failed to read candidate from stdin")?;
            Ok(buf)
        }
    }
}

fn resolve_language(name: Option<&str>, file: Option<&Path>) -> Language {
    match (name, file) {
        (Some(name), _) => Language::from_name(name),
        (None, Some(path)) => Language::from_path(path),
        (None, None) => Language::default(),
    }
}
