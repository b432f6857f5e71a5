//! Engine-error taxonomy
//!
//! Maps raw PostgreSQL error text onto the handful of categories the
//! controller and planner actually react to. Matching is substring-based on
//! the lowercased message, which is how the server phrases these errors
//! regardless of locale-independent SQLSTATE details we do not get through
//! the text protocol.

/// Categories of database errors with distinct handling policies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid SQL; only a rewrite can help
    Syntax,
    /// Unknown table, column or type
    MissingObject,
    /// Aggregate function used in WHERE, or a column name shadowing one
    AggregateInWhere,
    /// Index or relation already exists; benign for idempotent setup
    AlreadyExists,
    /// Statement timeout fired
    Timeout,
    /// Deadlock or lock-wait conflict
    LockConflict,
    /// Insufficient privileges
    PermissionDenied,
    /// Connection-level failure; worth one retry
    Connection,
    Unknown,
}

impl ErrorCategory {
    /// Transient errors are retried once before failing the iteration
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Connection | ErrorCategory::LockConflict)
    }

    /// Errors that demand a query rewrite rather than DDL
    pub fn requires_rewrite(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Syntax | ErrorCategory::MissingObject | ErrorCategory::AggregateInWhere
        )
    }
}

/// Classify a PostgreSQL error message
pub fn classify(message: &str) -> ErrorCategory {
    let msg = message.to_lowercase();

    if msg.contains("aggregate functions are not allowed in where") {
        ErrorCategory::AggregateInWhere
    } else if msg.contains("already exists") {
        ErrorCategory::AlreadyExists
    } else if msg.contains("syntax error") {
        ErrorCategory::Syntax
    } else if msg.contains("does not exist") {
        ErrorCategory::MissingObject
    } else if msg.contains("statement timeout") || msg.contains("canceling statement") {
        ErrorCategory::Timeout
    } else if msg.contains("deadlock detected") || msg.contains("lock timeout") {
        ErrorCategory::LockConflict
    } else if msg.contains("permission denied") {
        ErrorCategory::PermissionDenied
    } else if msg.contains("connection") && (msg.contains("closed") || msg.contains("refused") || msg.contains("reset"))
    {
        ErrorCategory::Connection
    } else {
        ErrorCategory::Unknown
    }
}

/// The object name PostgreSQL quotes in a missing-object error, when present
pub fn missing_object_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    Some(message[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_errors() {
        assert_eq!(classify("syntax error at or near \"FORM\""), ErrorCategory::Syntax);
        assert_eq!(
            classify("column \"budget.count\" does not exist"),
            ErrorCategory::MissingObject
        );
        assert_eq!(
            classify("aggregate functions are not allowed in WHERE"),
            ErrorCategory::AggregateInWhere
        );
        assert_eq!(
            classify("relation \"idx_users_email\" already exists"),
            ErrorCategory::AlreadyExists
        );
        assert_eq!(
            classify("canceling statement due to statement timeout"),
            ErrorCategory::Timeout
        );
        assert_eq!(classify("deadlock detected"), ErrorCategory::LockConflict);
    }

    #[test]
    fn transient_categories_retry() {
        assert!(ErrorCategory::Connection.is_transient());
        assert!(ErrorCategory::LockConflict.is_transient());
        assert!(!ErrorCategory::Syntax.is_transient());
    }

    #[test]
    fn extracts_quoted_object_name() {
        assert_eq!(
            missing_object_name("column \"user_email\" does not exist").as_deref(),
            Some("user_email")
        );
        assert_eq!(missing_object_name("no quotes here"), None);
    }
}
