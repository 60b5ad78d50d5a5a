//! taskq CLI: submit queues, claim and report tasks, inspect progress.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde::Serialize;
use taskq::config::Config;
use taskq::db::Db;
use taskq::engine::TaskQueueEngine;
use taskq::error::Error;
use taskq::model::{QueueId, ResetScope, TaskId, TaskState};
use taskq::notify::{NoopDispatcher, NotificationDispatcher, PushDispatcher};
use taskq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskq", about = "Distribute batches of tasks to independent workers")]
struct Cli {
    /// Bearer token of the calling user
    #[arg(long, env = "TASKQ_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// User administration
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Create a queue from "<label> <token>" lines (file or stdin)
    Submit { file: Option<PathBuf> },
    /// Add new tokens to an existing queue; known tokens are skipped
    Append {
        queue: QueueId,
        file: Option<PathBuf>,
    },
    /// Take the next waiting task
    Claim {
        queue: QueueId,
        /// Identifier recorded as the task's last caller
        #[arg(long)]
        caller: Option<String>,
    },
    /// Report a task's outcome (done, error, waiting)
    Report {
        queue: QueueId,
        token: String,
        state: TaskState,
    },
    /// Give a task back; it is requeued behind all waiting tasks
    PutBack { queue: QueueId, token: String },
    /// Return assigned and/or errored tasks to waiting
    Reset {
        queue: QueueId,
        /// assigned, error or all
        #[arg(long, default_value = "all")]
        scope: ResetScope,
    },
    /// Delete a queue and all its tasks
    Delete { queue: QueueId },
    /// Return one task to waiting
    ResetTask { task: TaskId },
    /// Delete one task
    DeleteTask { task: TaskId },
    /// List your queues with per-state counts
    Queues,
    /// List the tasks of a queue in claim order
    Tasks { queue: QueueId },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user and print its token
    Add {
        name: String,
        /// Password for interactive sign-in
        #[arg(long, env = "TASKQ_USER_SECRET", hide_env_values = true, default_value = "")]
        secret: String,
        /// Push destination for completion notices
        #[arg(long)]
        notify: Option<String>,
    },
    /// Set or clear where your completion notices go
    Notify { target: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            match e.downcast_ref::<Error>() {
                Some(err) if err.is_client_error() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let notifier: Arc<dyn NotificationDispatcher> = match config.push_url {
        Some(ref url) => Arc::new(PushDispatcher::new(url, config.push_token.clone())),
        None => Arc::new(NoopDispatcher),
    };
    let engine = TaskQueueEngine::with_token_auth(Arc::new(db), notifier, config.engine());
    let token = cli.token.clone().unwrap_or_default();
    let out = Output { json: cli.json };

    match cli.command {
        Command::Migrate => println!("migrations applied"),
        Command::User { action } => match action {
            UserAction::Add {
                name,
                secret,
                notify,
            } => {
                let user = engine
                    .register_user(&name, &secret, notify.as_deref())
                    .await?;
                out.line(&user, || format!("{} {}", user.name, user.token))?;
            }
            UserAction::Notify { target } => {
                engine
                    .set_notification_target(&token, target.as_deref())
                    .await?;
            }
        },
        Command::Submit { file } => {
            let queue = engine.submit(&token, &read_input(file)?).await?;
            out.line(&queue, || queue.id.to_string())?;
        }
        Command::Append { queue, file } => {
            let added = engine.append(&token, queue, &read_input(file)?).await?;
            out.line(&added, || format!("{added} task(s) appended"))?;
        }
        Command::Claim { queue, caller } => {
            let task = engine.claim(&token, queue, caller.as_deref()).await?;
            out.line(&task, || format!("{} {}", task.label, task.token))?;
        }
        Command::Report {
            queue,
            token: task,
            state,
        } => engine.report(&token, queue, &task, state).await?,
        Command::PutBack { queue, token: task } => engine.put_back(&token, queue, &task).await?,
        Command::Reset { queue, scope } => {
            let moved = engine.reset(&token, queue, scope).await?;
            out.line(&moved, || format!("{moved} task(s) reset"))?;
        }
        Command::Delete { queue } => engine.delete(&token, queue).await?,
        Command::ResetTask { task } => engine.reset_task(&token, task).await?,
        Command::DeleteTask { task } => engine.delete_task(&token, task).await?,
        Command::Queues => cmd_queues(&engine, &token, out).await?,
        Command::Tasks { queue } => cmd_tasks(&engine, &token, queue, out).await?,
    }
    engine.flush_notifications().await;
    Ok(())
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn line<T: Serialize>(self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

fn read_input(file: Option<PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

async fn cmd_queues(engine: &TaskQueueEngine, token: &str, out: Output) -> anyhow::Result<()> {
    let queues = engine.list_queues(token).await?;
    if out.json {
        println!("{}", serde_json::to_string_pretty(&queues)?);
        return Ok(());
    }
    if queues.is_empty() {
        println!("No queues found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:>7}  {:>8}  {:>6}  {:>6}  {:<16}  CHANGED",
        "QUEUE", "WAITING", "ASSIGNED", "DONE", "ERROR", "CREATED"
    );
    println!("{}", "-".repeat(80));
    for q in &queues {
        println!(
            "{:<8}  {:>7}  {:>8}  {:>6}  {:>6}  {:<16}  {}",
            q.queue_id,
            q.counts.waiting,
            q.counts.assigned,
            q.counts.done,
            q.counts.error,
            q.created_at.format("%Y-%m-%d %H:%M"),
            q.changed_at.format("%Y-%m-%d %H:%M"),
        );
    }
    println!("\n{} queue(s)", queues.len());
    Ok(())
}

async fn cmd_tasks(
    engine: &TaskQueueEngine,
    token: &str,
    queue: QueueId,
    out: Output,
) -> anyhow::Result<()> {
    let tasks = engine.list_tasks(token, queue).await?;
    if out.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<20}  {:<8}  {:<16}  CALLER",
        "ID", "LABEL", "TOKEN", "STATE", "CHANGED"
    );
    println!("{}", "-".repeat(96));
    for t in &tasks {
        println!(
            "{:<8}  {:<20}  {:<20}  {:<8}  {:<16}  {}",
            t.id,
            t.label,
            t.token,
            t.state,
            t.changed_at.format("%Y-%m-%d %H:%M"),
            t.caller.as_deref().unwrap_or("-"),
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}
