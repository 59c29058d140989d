/// Core abstractions shared across the proxy: shard descriptors, client
/// matching rules, and the pooling disciplines they select.
pub mod cancel;
pub mod frontend;
pub mod manager;
pub mod pool;
pub mod relay;
pub mod route;

use serde::{Deserialize, Serialize};

/// Pooling discipline a rule assigns to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    /// Backend is pinned for the lifetime of the client session.
    Session,
    /// Backend is held only for the duration of a transaction.
    Transaction,
}

impl std::fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolingMode::Session => write!(f, "session"),
            PoolingMode::Transaction => write!(f, "transaction"),
        }
    }
}

/// How a frontend client proves itself under a rule, and how the dialer
/// answers a backend's challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Trust,
    Password,
}

/// A logical backend database instance. Immutable after load; the admin
/// console swaps whole descriptors rather than mutating one in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    /// Stable name the router and pools key on.
    pub name: String,
    /// Backend endpoint addresses, tried in order by the dialer.
    pub hosts: Vec<String>,
    /// Credentials presented to the backend.
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Database to open on the backend.
    pub database: String,
    /// TLS policy for backend connections (descriptor completeness; the
    /// dialer currently connects plaintext).
    #[serde(default)]
    pub tls: TlsPolicy,
    /// Pool cap for this shard.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    #[default]
    Disable,
    Prefer,
    Require,
}

/// A client-matching rule: predicate over startup parameters plus the
/// pooling discipline and limits for matched sessions. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Match any user when absent.
    #[serde(default)]
    pub user: Option<String>,
    /// Match any database when absent.
    #[serde(default)]
    pub database: Option<String>,
    pub pooling_mode: PoolingMode,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default)]
    pub password: Option<String>,
    /// Shard used for unclassifiable statements when no backend is bound.
    #[serde(default)]
    pub default_shard: Option<String>,
    /// Cap on concurrent client sessions admitted under this rule.
    #[serde(default = "default_connection_limit")]
    pub connection_limit: usize,
}

fn default_connection_limit() -> usize {
    1000
}

impl Rule {
    /// First-match predicate over the client's startup parameters.
    pub fn matches(&self, user: &str, database: &str) -> bool {
        self.user.as_deref().map_or(true, |u| u == user)
            && self.database.as_deref().map_or(true, |d| d == database)
    }

    /// Stable identity used as the routing-key component for routes shared
    /// by this rule's clients.
    pub fn ident(&self) -> String {
        format!(
            "{}/{}",
            self.user.as_deref().unwrap_or("*"),
            self.database.as_deref().unwrap_or("*")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(user: Option<&str>, database: Option<&str>) -> Rule {
        Rule {
            user: user.map(str::to_string),
            database: database.map(str::to_string),
            pooling_mode: PoolingMode::Session,
            auth: AuthMethod::Trust,
            password: None,
            default_shard: None,
            connection_limit: 10,
        }
    }

    #[test]
    fn test_rule_matches_exact() {
        let r = rule(Some("app"), Some("orders"));
        assert!(r.matches("app", "orders"));
        assert!(!r.matches("app", "billing"));
        assert!(!r.matches("admin", "orders"));
    }

    #[test]
    fn test_rule_matches_wildcards() {
        assert!(rule(None, None).matches("anyone", "anything"));
        assert!(rule(Some("app"), None).matches("app", "anything"));
        assert!(!rule(Some("app"), None).matches("other", "anything"));
    }

    #[test]
    fn test_rule_ident() {
        assert_eq!(rule(Some("app"), Some("orders")).ident(), "app/orders");
        assert_eq!(rule(None, None).ident(), "*/*");
    }

    #[test]
    fn test_pooling_mode_display() {
        assert_eq!(PoolingMode::Session.to_string(), "session");
        assert_eq!(PoolingMode::Transaction.to_string(), "transaction");
    }
}
