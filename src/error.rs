use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid script {}: {reason}", path.display())]
    InvalidScript { path: PathBuf, reason: String },

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote command `{command}` failed with {}", exit_description(*code))]
    RemoteCommand { command: String, code: Option<i32> },

    #[error("Failed to clean up remote workspace {workspace}: {source}")]
    Cleanup {
        workspace: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "no exit status (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
