/// Unified error type for the optimization agent
/// Provides structured error handling with categories for different failure modes
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// Database errors: connection failures, statement errors, timeouts
    #[error("Database error: {message}")]
    Database {
        message: String,
        statement: Option<String>,
    },

    /// Planning errors: LLM call failures, unparseable responses
    #[error("Planning error: {message}")]
    Planning {
        message: String,
        context: Option<String>,
    },

    /// Analysis errors: EXPLAIN retrieval or plan parsing failures
    #[error("Analysis error: {message}")]
    Analysis {
        message: String,
        query: Option<String>,
    },

    /// Budget errors: iteration ceiling or wall-clock timeout reached
    #[error("Budget exhausted: {message}")]
    Budget { message: String },

    /// Configuration errors: bad paths, invalid templates, malformed task files
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO errors: task file loading, result persistence
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<String>,
    },
}

impl AgentError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            statement: None,
        }
    }

    pub fn database_with_statement(
        message: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            statement: Some(statement.into()),
        }
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
            context: None,
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis {
            message: message.into(),
            query: None,
        }
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self::Budget {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            path: None,
        }
    }

    pub fn io_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<tokio_postgres::Error> for AgentError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            statement: None,
        }
    }
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
