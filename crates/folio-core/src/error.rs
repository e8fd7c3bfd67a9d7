//! Error types for Folio core

use thiserror::Error;

/// Result type alias using Folio's core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Plugin '{0}' not found. Run `folio plugins list` to see installed plugins.")]
    PluginNotFound(String),

    // Database errors (E100-E199)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E200-E299)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E300-E399)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::PluginNotFound(_) => "E001",
            Self::DatabaseError(_) => "E100",
            Self::ConfigError(_) => "E200",
            Self::InvalidInput(_) => "E300",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::PluginNotFound(_) => Some("folio plugins list".to_string()),
            Self::ConfigError(_) => Some("folio config path".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::PluginNotFound("x".into()).code(), "E001");
        assert_eq!(Error::ConfigError("bad".into()).code(), "E200");
        assert_eq!(Error::InvalidInput("bad".into()).code(), "E300");
    }

    #[test]
    fn not_found_suggests_list_command() {
        let err = Error::PluginNotFound("translator".into());
        assert!(err.to_string().contains("translator"));
        assert_eq!(err.suggestion().as_deref(), Some("folio plugins list"));
    }
}
