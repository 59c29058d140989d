/// Unified error handling for the reparto proxy
///
/// Every error the relay can surface to a client maps onto a PostgreSQL
/// severity and SQLSTATE so that clients only ever see well-formed
/// ErrorResponse messages, never implementation detail.
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for proxy operations.
#[derive(Debug, Error)]
pub enum RepartoError {
    /// Shard pool hit its cap and the acquire deadline elapsed.
    #[error("connection pool for shard {shard} exhausted")]
    PoolExhausted { shard: String },

    /// Dialing or backend startup failed for every endpoint of a shard.
    #[error("shard {shard} unreachable: {reason}")]
    ShardUnreachable { shard: String, reason: String },

    /// A ConnManager route callback failed for a reason other than the two
    /// above (e.g. the shard vanished from the registry mid-session).
    #[error("routing to shard {shard} failed: {reason}")]
    RouteFailed { shard: String, reason: String },

    /// A statement targeted a different shard while a transaction held
    /// state on the current one.
    #[error("cannot access shard {target} inside a transaction bound to {bound}")]
    CrossShardInTx { bound: String, target: String },

    /// The router proved a statement touches more than one shard.
    #[error("statement spans multiple shards: {0}")]
    MultiShardQuery(String),

    /// Malformed or out-of-order wire traffic on either side.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// I/O failure on the frontend wire.
    #[error("client i/o error: {0}")]
    ClientIo(#[source] io::Error),

    /// I/O failure on the backend wire.
    #[error("backend i/o error: {0}")]
    BackendIo(#[source] io::Error),

    /// Frontend authentication failed.
    #[error("authentication failed for user {user}")]
    AuthFailure { user: String },

    /// No configured rule matched the client's startup parameters.
    #[error("no matching rule for user {user} database {database}")]
    NoMatchingRule { user: String, database: String },

    /// Router could not classify a statement (parse error and the like).
    #[error("router error: {0}")]
    Router(String),

    /// Proxy is draining for shutdown.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Internal invariant breakage (should not happen in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations.
pub type RepartoResult<T> = Result<T, RepartoError>;

/// ErrorResponse severity the client observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

impl RepartoError {
    pub fn pool_exhausted<S: Into<String>>(shard: S) -> Self {
        RepartoError::PoolExhausted {
            shard: shard.into(),
        }
    }

    pub fn unreachable<S: Into<String>, R: Into<String>>(shard: S, reason: R) -> Self {
        RepartoError::ShardUnreachable {
            shard: shard.into(),
            reason: reason.into(),
        }
    }

    pub fn route_failed<S: Into<String>, R: Into<String>>(shard: S, reason: R) -> Self {
        RepartoError::RouteFailed {
            shard: shard.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RepartoError::ProtocolViolation(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        RepartoError::Internal(message.into())
    }

    /// Severity of the ErrorResponse sent for this kind.
    pub fn severity(&self) -> Severity {
        match self {
            RepartoError::CrossShardInTx { .. }
            | RepartoError::ProtocolViolation(_)
            | RepartoError::ClientIo(_)
            | RepartoError::BackendIo(_)
            | RepartoError::AuthFailure { .. }
            | RepartoError::NoMatchingRule { .. }
            | RepartoError::ShuttingDown
            | RepartoError::Internal(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Whether the relay must terminate the session after reporting.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// SQLSTATE carried in the ErrorResponse.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            RepartoError::PoolExhausted { .. } => "53300",
            RepartoError::ShardUnreachable { .. } => "08001",
            RepartoError::RouteFailed { .. } => "08000",
            RepartoError::CrossShardInTx { .. } => "25001",
            RepartoError::MultiShardQuery(_) => "0A000",
            RepartoError::ProtocolViolation(_) => "08P01",
            RepartoError::ClientIo(_) | RepartoError::BackendIo(_) => "08006",
            RepartoError::AuthFailure { .. } => "28P01",
            RepartoError::NoMatchingRule { .. } => "28000",
            RepartoError::Router(_) => "0A000",
            RepartoError::ShuttingDown => "57P01",
            RepartoError::Config(_) | RepartoError::Internal(_) => "XX000",
        }
    }

    /// Whether the client may simply retry the failed command.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RepartoError::PoolExhausted { .. }
                | RepartoError::ShardUnreachable { .. }
                | RepartoError::RouteFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            RepartoError::pool_exhausted("sh1").severity(),
            Severity::Error
        );
        assert_eq!(
            RepartoError::CrossShardInTx {
                bound: "sh1".into(),
                target: "sh2".into()
            }
            .severity(),
            Severity::Fatal
        );
        assert_eq!(
            RepartoError::protocol("bad tag").severity(),
            Severity::Fatal
        );
        assert_eq!(
            RepartoError::MultiShardQuery("t1, t2".into()).severity(),
            Severity::Error
        );
    }

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(RepartoError::pool_exhausted("sh1").sqlstate(), "53300");
        assert_eq!(
            RepartoError::unreachable("sh1", "refused").sqlstate(),
            "08001"
        );
        assert_eq!(
            RepartoError::NoMatchingRule {
                user: "x".into(),
                database: "y".into()
            }
            .sqlstate(),
            "28000"
        );
        assert_eq!(
            RepartoError::CrossShardInTx {
                bound: "a".into(),
                target: "b".into()
            }
            .sqlstate(),
            "25001"
        );
        assert_eq!(RepartoError::ShuttingDown.sqlstate(), "57P01");
    }

    #[test]
    fn test_recoverability() {
        assert!(RepartoError::pool_exhausted("sh1").is_recoverable());
        assert!(RepartoError::unreachable("sh1", "x").is_recoverable());
        assert!(!RepartoError::protocol("x").is_recoverable());
        assert!(!RepartoError::MultiShardQuery("t".into()).is_recoverable());
    }

    #[test]
    fn test_fatal_terminates() {
        assert!(RepartoError::BackendIo(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "gone"
        ))
        .is_fatal());
        assert!(!RepartoError::pool_exhausted("sh1").is_fatal());
    }

    #[test]
    fn test_display_never_leaks_internals() {
        let err = RepartoError::unreachable("sh1", "connection refused");
        assert_eq!(
            err.to_string(),
            "shard sh1 unreachable: connection refused"
        );
        assert_eq!(Severity::Fatal.to_string(), "FATAL");
    }
}
