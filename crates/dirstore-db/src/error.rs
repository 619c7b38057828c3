//! Error types for the dirstore-db crate.
//!
//! Wraps `SQLx` errors with the context the storage layer needs, and converts
//! them into the classified [`DirectoryError`] kinds at the repository
//! boundary.

use dirstore_core::DirectoryError;
use thiserror::Error;

/// Database operation errors.
///
/// # Example
///
/// ```rust
/// use dirstore_db::DbError;
///
/// fn handle_error(err: DbError) {
///     match err {
///         DbError::ConnectionFailed(e) => eprintln!("Cannot connect: {}", e),
///         DbError::MigrationFailed(e) => eprintln!("Migration error: {}", e),
///         DbError::QueryFailed { context, .. } => eprintln!("Query error: {}", context),
///         DbError::InvalidStatement(msg) => eprintln!("Bad statement: {}", msg),
///         DbError::MissingParameter { name, .. } => eprintln!("Unbound :{}", name),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish or acquire a database connection.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A database migration failed to apply.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed to execute.
    #[error("Query failed: {context}")]
    QueryFailed {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// Statement text that cannot be compiled.
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    /// A compiled statement references a parameter the caller did not bind.
    #[error("Statement parameter :{name} is not bound ({sql})")]
    MissingParameter { name: String, sql: String },
}

impl DbError {
    pub fn query_failed(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::QueryFailed {
            context: context.into(),
            source,
        }
    }

    /// Check if this error indicates a connection problem.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_))
    }

    /// Check if this error indicates a migration problem.
    #[must_use]
    pub fn is_migration_error(&self) -> bool {
        matches!(self, DbError::MigrationFailed(_))
    }

    /// Check if this error indicates a query problem.
    #[must_use]
    pub fn is_query_error(&self) -> bool {
        matches!(self, DbError::QueryFailed { .. })
    }

    /// Check if this error is a uniqueness violation reported by the server.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::QueryFailed { source, .. } => is_unique_violation(source),
            _ => false,
        }
    }
}

impl From<DbError> for DirectoryError {
    fn from(err: DbError) -> Self {
        let context = match &err {
            DbError::ConnectionFailed(_) => "database unavailable".to_string(),
            DbError::MigrationFailed(_) => "schema migration failed".to_string(),
            DbError::QueryFailed { context, .. } => context.clone(),
            DbError::InvalidStatement(_) | DbError::MissingParameter { .. } => {
                "statement compilation failed".to_string()
            }
        };
        DirectoryError::internal_with_source(context, err)
    }
}

/// SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Map a failed write to `AlreadyExists` when it collided on `dn`.
pub(crate) fn map_write_error(err: sqlx::Error, context: &str, dn: &str) -> DirectoryError {
    if is_unique_violation(&err) {
        DirectoryError::AlreadyExists { dn: dn.to_string() }
    } else {
        DbError::query_failed(context, err).into()
    }
}

/// Map a failed read or unconditional write to an unclassified error.
pub(crate) fn query_error(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> DirectoryError {
    let context = context.into();
    move |err| DbError::query_failed(context, err).into()
}
