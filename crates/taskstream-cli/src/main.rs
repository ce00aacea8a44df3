//! Command-line front end for the task stream reconciler.

mod cli;
mod render;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser as _;
use taskstream::observability::init_observability;
use taskstream::prelude::*;
use tracing::{info, warn};

use crate::cli::{Cli, Command};
use crate::render::{StepPrinter, print_snapshot, task_line};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_observability();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, TaskStreamError> {
    let client = Arc::new(HttpTaskClient::new(cli.client_config()?)?);
    match cli.cmd {
        Command::Run(args) => {
            let session_config = args.session.resolve()?;
            let task_id = client.create_task(&args.prompt).await?;
            println!("task {task_id}");
            watch(client, task_id, session_config).await
        }
        Command::Watch(args) => {
            let session_config = args.session.resolve()?;
            watch(client, TaskId::new(args.task_id), session_config).await
        }
        Command::List => {
            for task in client.list_tasks().await? {
                println!("{}", task_line(&task));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { task_id } => {
            let snapshot = client.get_task(&TaskId::new(task_id)).await?;
            print_snapshot(&snapshot);
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { task_id } => {
            let task_id = TaskId::new(task_id);
            client.delete_task(&task_id).await?;
            println!("deleted {task_id}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn watch(
    client: Arc<HttpTaskClient>,
    task_id: TaskId,
    config: SessionConfig,
) -> Result<ExitCode, TaskStreamError> {
    let mut manager = SessionManager::new(client, config)?;
    let mut session = manager.start_session(task_id);
    let mut views = session.subscribe_view();
    let mut printer = StepPrinter::default();
    info!(task_id = %session.task_id(), session_id = %session.session_id(), "watching task");

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                printer.render(&view);
            }
            state = session.next_state_change() => {
                let Some(state) = state else { break };
                printer.state(state);
                if state.is_settled() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(task_id = %session.task_id(), "interrupted, closing stream");
                manager.stop();
                break;
            }
        }
    }

    let view = session.view();
    printer.render(&view);
    printer.summary(&view);
    Ok(exit_code(session.state(), &view))
}

fn exit_code(state: SessionState, view: &TaskView) -> ExitCode {
    match (state, &view.failure) {
        (SessionState::Closed, None) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

