use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use taskstream::{ClientConfig, SessionConfig, TaskStreamError};

#[derive(Parser, Debug)]
#[command(version, about = "Submit tasks and follow their live progress")]
pub struct Cli {
    /// Task server base URL (overrides TASKSTREAM_BASE_URL)
    #[arg(long = "base-url", global = true, value_name = "URL")]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a prompt and follow the new task until it finishes
    Run(RunArgs),
    /// Follow an existing task
    Watch(WatchArgs),
    /// List tasks known to the server
    List,
    /// Print a task snapshot without opening the live stream
    Show {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },
    /// Delete a task
    Delete {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(value_name = "PROMPT")]
    pub prompt: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Session overrides applied on top of `TASKSTREAM_*` settings.
#[derive(Debug, Args, Default)]
pub struct SessionArgs {
    /// Consecutive connection failures before giving up
    #[arg(long = "max-retries", value_name = "N")]
    pub max_retries: Option<u32>,

    /// Delay between reconnection attempts
    #[arg(long = "retry-delay-ms", value_name = "MS")]
    pub retry_delay_ms: Option<u64>,

    /// Idle time before a heartbeat dot is shown
    #[arg(long = "heartbeat-ms", value_name = "MS")]
    pub heartbeat_ms: Option<u64>,
}

impl SessionArgs {
    pub fn resolve(&self) -> Result<SessionConfig, TaskStreamError> {
        let mut config = SessionConfig::from_env()?;
        if let Some(max_retries) = self.max_retries {
            config = config.max_retries(max_retries);
        }
        if let Some(delay_ms) = self.retry_delay_ms {
            config = config.retry_delay(Duration::from_millis(delay_ms));
        }
        if let Some(heartbeat_ms) = self.heartbeat_ms {
            config = config.heartbeat(Duration::from_millis(heartbeat_ms));
        }
        config.validate()?;
        Ok(config)
    }
}

impl Cli {
    pub fn client_config(&self) -> Result<ClientConfig, TaskStreamError> {
        let config = ClientConfig::from_env()?;
        Ok(match &self.base_url {
            Some(url) => config.base_url(url.trim()),
            None => config,
        })
    }
}
