//! Error types for entgraph operations.
//!
//! Errors fall into four families:
//!
//! - **Modeling** errors are bugs in the entity metadata or in the cascade
//!   graph it produces (a dependency cycle, an unknown target type). They are
//!   detected while expanding an operation and never retried.
//! - **Conflict** errors report an optimistic-lock version mismatch. Callers
//!   may reload and retry the whole save/delete call.
//! - **Storage** errors come verbatim from the statement executor.
//! - **Invalid-state** errors report a value that is required but absent
//!   (an identity that was never assigned, a relation that is not loaded).

use std::fmt;

/// The primary error type for all entgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Statement execution errors reported by the storage layer
    Query(QueryError),
    /// Invalid entity metadata or cascade graph
    Modeling(ModelingError),
    /// Optimistic-lock version mismatch
    Conflict(ConflictError),
    /// A required value or relation is not available
    InvalidState(InvalidStateError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ModelingError {
    pub kind: ModelingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelingErrorKind {
    /// Two requests would have to wait for each other
    DependencyCycle,
    /// An entity type name is not registered
    UnknownEntity,
    /// A property name is not declared on its entity type
    UnknownProperty,
    /// A relationship declaration does not resolve consistently
    InvalidRelationship,
    /// A predicate or reference over a composite identity is not supported
    UnsupportedCompositeKey,
}

/// An optimistic-lock failure: a versioned UPDATE matched no row.
#[derive(Debug, Clone)]
pub struct ConflictError {
    /// Entity type name
    pub entity: &'static str,
    /// Table the UPDATE was issued against
    pub table: &'static str,
    /// Identity of the row, rendered for display
    pub identity: String,
    /// Version the in-memory instance was loaded with
    pub expected_version: i64,
}

#[derive(Debug)]
pub struct InvalidStateError {
    pub kind: InvalidStateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidStateErrorKind {
    /// An identity value was needed but the entity has none
    MissingIdentity,
    /// A relation was read or mutated before being loaded
    RelationNotLoaded,
    /// A property was accessed through an accessor for another kind
    WrongPropertyKind,
    /// An operation kept producing work past its cycle budget
    NotConverged,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a modeling error.
    pub fn modeling(kind: ModelingErrorKind, message: impl Into<String>) -> Self {
        Error::Modeling(ModelingError {
            kind,
            message: message.into(),
        })
    }

    /// Build an invalid-state error.
    pub fn invalid_state(kind: InvalidStateErrorKind, message: impl Into<String>) -> Self {
        Error::InvalidState(InvalidStateError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a retryable storage error (deadlock, serialization, timeouts)?
    ///
    /// Version conflicts are deliberately not included: retrying them only
    /// makes sense after the caller reloads its data.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this an optimistic-lock conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Is this a modeling error (bad metadata or cyclic cascade)?
    pub fn is_modeling_error(&self) -> bool {
        matches!(self, Error::Modeling(_))
    }

    /// The modeling error kind, if this is a modeling error.
    pub fn modeling_kind(&self) -> Option<ModelingErrorKind> {
        match self {
            Error::Modeling(m) => Some(m.kind),
            _ => None,
        }
    }

    /// The invalid-state error kind, if this is an invalid-state error.
    pub fn invalid_state_kind(&self) -> Option<InvalidStateErrorKind> {
        match self {
            Error::InvalidState(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Get SQLSTATE if available (e.g., "23503" for foreign key violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Modeling(e) => write!(f, "Modeling error: {}", e),
            Error::Conflict(e) => write!(f, "Version conflict: {}", e),
            Error::InvalidState(e) => write!(f, "Invalid state: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ModelingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in \"{}\" was modified concurrently (expected version {})",
            self.entity, self.identity, self.table, self.expected_version
        )
    }
}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ModelingError> for Error {
    fn from(err: ModelingError) -> Self {
        Error::Modeling(err)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::Conflict(err)
    }
}

impl From<InvalidStateError> for Error {
    fn from(err: InvalidStateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for entgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
