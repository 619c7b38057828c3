//! CLI error types and exit codes

use dirstore_core::DirectoryError;
use dirstore_db::DbError;
use thiserror::Error;

use crate::config::ConfigError;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: General error
/// - 3: Database unreachable
/// - 4: Rejected by the directory (bad DN, missing entry, ...)
/// - 5: Storage failure
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("{0}")]
    Directory(#[from] DirectoryError),

    #[error("Output error: {0}")]
    Output(String),
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Output(_) => 1,
            CliError::Database(err) if err.is_connection_error() => 3,
            CliError::Database(_) => 5,
            CliError::Directory(err) if err.is_classified() => 4,
            CliError::Directory(_) => 5,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();
        let message = match self {
            CliError::Directory(err) => err.report(),
            other => other.to_string(),
        };

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {}", message);
        } else {
            eprintln!("Error: {}", message);
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {}", suggestion);
            } else {
                eprintln!("\nSuggestion: {}", suggestion);
            }
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::Config(ConfigError::MissingVar(_)) => {
                Some("Set DATABASE_URL in the environment or in a .env file.")
            }
            CliError::Database(err) if err.is_connection_error() => {
                Some("Check that PostgreSQL is running and DATABASE_URL is correct.")
            }
            CliError::Database(err) if err.is_query_error() => {
                Some("Run 'dirstore-ctl migrate' to bring the schema up to date.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Output(format!("JSON error: {}", e))
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Output(format!("I/O error: {}", e))
    }
}
