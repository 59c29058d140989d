/// Pooling disciplines: when a relay acquires and releases backends
///
/// The relay invokes a `ConnManager` at precisely defined boundaries:
/// `route` when a shard has been selected and a backend is needed,
/// `unroute` when the binding ends, `tx_begin`/`tx_end` at transaction
/// boundaries observed on ReadyForQuery, and `validate_reroute` before any
/// attempt to switch shards. `SessionPooler` pins one backend for the
/// session; `TransactionPooler` holds one only for the transaction.
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::core::cancel::CancelHandle;
use crate::core::pool::{BackendConn, PoolRegistry};
use crate::core::route::{Route, RouteKey, RouteTable};
use crate::core::{PoolingMode, Rule};
use crate::error::{RepartoError, RepartoResult};
use crate::protocol::startup::StartupParams;

/// Per-client relay state. Field transitions happen only inside
/// ConnManager callbacks or the relay loop itself, never concurrently
/// with message forwarding.
///
/// Invariants: `active_backend` is set only when `active_shard` is set;
/// `tx_active` implies `active_backend` is set.
#[derive(Default)]
pub struct RelayState {
    pub tx_active: bool,
    pub active_shard: Option<String>,
    pub active_backend: Option<BackendConn>,
    pub route: Option<Arc<Route>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invariants_hold(&self) -> bool {
        (self.active_backend.is_none() || self.active_shard.is_some())
            && (!self.tx_active || self.active_backend.is_some())
    }
}

/// Everything a manager callback needs besides the relay state: the
/// client's identity and the shared routing structures.
pub struct ClientCtx {
    pub id: u64,
    pub rule: Arc<Rule>,
    pub params: StartupParams,
    pub route_table: Arc<RouteTable>,
    pub pools: Arc<PoolRegistry>,
    pub cancel: CancelHandle,
}

impl ClientCtx {
    pub fn user(&self) -> &str {
        self.params.user().unwrap_or("")
    }

    pub fn database(&self) -> &str {
        self.params.database().unwrap_or("")
    }
}

#[async_trait]
pub trait ConnManager: Send + Sync {
    /// Populate `rst.active_backend` for the already-selected
    /// `rst.active_shard`.
    async fn route(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()>;

    /// End the binding, releasing any backend to its pool. Idempotent.
    async fn unroute(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()>;

    /// The relay observed the first message of a new transaction block.
    async fn tx_begin(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()>;

    /// The relay observed a transaction-terminating ReadyForQuery.
    async fn tx_end(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()>;

    /// Whether switching to a different shard is presently safe.
    fn validate_reroute(&self, rst: &RelayState) -> bool;

    /// Routing-key component for routes created on this discipline.
    fn routing_ident(&self, client: &ClientCtx) -> String;
}

/// Acquire a backend from the selected shard's pool and attach the route.
async fn route_to_active_shard(
    manager: &dyn ConnManager,
    client: &ClientCtx,
    rst: &mut RelayState,
) -> RepartoResult<()> {
    let shard = rst
        .active_shard
        .clone()
        .ok_or_else(|| RepartoError::internal("route called with no active shard"))?;

    let pool = client.pools.pool_for(&shard).await?;
    let conn = pool.acquire().await?;

    let key = RouteKey::new(&shard, &manager.routing_ident(client));
    let route = client
        .route_table
        .attach_route(key, Arc::clone(&pool), client.id)
        .await;

    client.cancel.bind(conn.cancel_target()).await;
    rst.route = Some(route);
    rst.active_backend = Some(conn);
    debug!(client = client.id, shard = %shard, "routed");
    Ok(())
}

/// Release the bound backend (clean only when no transaction state can
/// remain on it) and detach from the route. Safe to call repeatedly.
async fn release_binding(client: &ClientCtx, rst: &mut RelayState) {
    if let Some(conn) = rst.active_backend.take() {
        let clean = !rst.tx_active && !conn.is_dirty();
        if let Some(route) = &rst.route {
            route.release(conn, clean).await;
        }
    }
    if let Some(route) = rst.route.take() {
        route.detach(client.id).await;
    }
    client.cancel.bind(None).await;
    rst.active_shard = None;
}

/// Backend pinned for the lifetime of the client session.
pub struct SessionPooler;

#[async_trait]
impl ConnManager for SessionPooler {
    async fn route(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()> {
        route_to_active_shard(self, client, rst).await
    }

    async fn unroute(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()> {
        release_binding(client, rst).await;
        Ok(())
    }

    async fn tx_begin(&self, _client: &ClientCtx, _rst: &mut RelayState) -> RepartoResult<()> {
        Ok(())
    }

    async fn tx_end(&self, _client: &ClientCtx, _rst: &mut RelayState) -> RepartoResult<()> {
        Ok(())
    }

    fn validate_reroute(&self, rst: &RelayState) -> bool {
        // No switch mid-session: only an unbound session may route.
        rst.active_shard.is_none()
    }

    fn routing_ident(&self, client: &ClientCtx) -> String {
        format!("{}/{}", client.user(), client.database())
    }
}

/// Backend held only for the duration of a transaction.
pub struct TransactionPooler;

#[async_trait]
impl ConnManager for TransactionPooler {
    async fn route(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()> {
        route_to_active_shard(self, client, rst).await
    }

    async fn unroute(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()> {
        release_binding(client, rst).await;
        Ok(())
    }

    async fn tx_begin(&self, _client: &ClientCtx, _rst: &mut RelayState) -> RepartoResult<()> {
        // Binding is already in place from route.
        Ok(())
    }

    async fn tx_end(&self, client: &ClientCtx, rst: &mut RelayState) -> RepartoResult<()> {
        release_binding(client, rst).await;
        Ok(())
    }

    fn validate_reroute(&self, rst: &RelayState) -> bool {
        rst.active_shard.is_none() || !rst.tx_active
    }

    fn routing_ident(&self, client: &ClientCtx) -> String {
        client.rule.ident()
    }
}

/// Select the discipline for a freshly accepted client from its rule.
pub fn manager_for(rule: &Rule) -> Box<dyn ConnManager> {
    match rule.pooling_mode {
        PoolingMode::Session => Box::new(SessionPooler),
        PoolingMode::Transaction => Box::new(TransactionPooler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::test_support::{test_shard, MockDialer};
    use crate::core::pool::BackendDialer;
    use crate::core::AuthMethod;
    use std::time::Duration;

    fn make_ctx(mode: PoolingMode) -> (ClientCtx, Arc<MockDialer>) {
        let dialer = Arc::new(MockDialer::new());
        let pools = Arc::new(PoolRegistry::new(
            vec![test_shard("sh1", 4), test_shard("sh2", 4)],
            dialer.clone() as Arc<dyn BackendDialer>,
            Duration::from_millis(100),
        ));
        let rule = Arc::new(Rule {
            user: Some("app".to_string()),
            database: Some("orders".to_string()),
            pooling_mode: mode,
            auth: AuthMethod::Trust,
            password: None,
            default_shard: None,
            connection_limit: 10,
        });
        let mut params = StartupParams::new();
        params.set("user", "app");
        params.set("database", "orders");
        let ctx = ClientCtx {
            id: 1,
            rule,
            params,
            route_table: Arc::new(RouteTable::new(Duration::from_secs(60))),
            pools,
            cancel: CancelHandle::new(),
        };
        (ctx, dialer)
    }

    #[tokio::test]
    async fn test_session_route_binds_backend() {
        let (ctx, _) = make_ctx(PoolingMode::Session);
        let manager = SessionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("sh1".to_string());

        manager.route(&ctx, &mut rst).await.unwrap();
        assert!(rst.active_backend.is_some());
        assert!(rst.route.is_some());
        assert!(rst.invariants_hold());
        assert!(ctx.cancel.target().await.is_some());
    }

    #[tokio::test]
    async fn test_session_no_reroute_once_bound() {
        let (ctx, _) = make_ctx(PoolingMode::Session);
        let manager = SessionPooler;
        let mut rst = RelayState::new();

        assert!(manager.validate_reroute(&rst));
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();
        assert!(!manager.validate_reroute(&rst));
    }

    #[tokio::test]
    async fn test_session_tx_end_keeps_backend() {
        let (ctx, _) = make_ctx(PoolingMode::Session);
        let manager = SessionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();

        manager.tx_end(&ctx, &mut rst).await.unwrap();
        assert!(rst.active_backend.is_some());
        assert_eq!(rst.active_shard.as_deref(), Some("sh1"));
    }

    #[tokio::test]
    async fn test_session_unroute_releases_to_pool() {
        let (ctx, _) = make_ctx(PoolingMode::Session);
        let manager = SessionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();

        let pool = ctx.pools.pool_for("sh1").await.unwrap();
        manager.unroute(&ctx, &mut rst).await.unwrap();

        assert!(rst.active_backend.is_none());
        assert!(rst.active_shard.is_none());
        assert_eq!(pool.stats().await.idle, 1);
        assert!(ctx.cancel.target().await.is_none());

        // Idempotent.
        manager.unroute(&ctx, &mut rst).await.unwrap();
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test]
    async fn test_tx_pooler_releases_at_tx_end() {
        let (ctx, _) = make_ctx(PoolingMode::Transaction);
        let manager = TransactionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();

        let pool = ctx.pools.pool_for("sh1").await.unwrap();
        manager.tx_end(&ctx, &mut rst).await.unwrap();

        assert!(rst.active_backend.is_none());
        assert!(rst.active_shard.is_none());
        assert_eq!(pool.stats().await.idle, 1);
        assert!(rst.invariants_hold());
    }

    #[tokio::test]
    async fn test_tx_pooler_reroute_rules() {
        let (ctx, _) = make_ctx(PoolingMode::Transaction);
        let manager = TransactionPooler;
        let mut rst = RelayState::new();

        assert!(manager.validate_reroute(&rst));

        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();
        // Bound but idle: a switch is safe.
        assert!(manager.validate_reroute(&rst));

        rst.tx_active = true;
        // Bound inside a transaction: forbidden.
        assert!(!manager.validate_reroute(&rst));
    }

    #[tokio::test]
    async fn test_unroute_mid_transaction_is_dirty() {
        let (ctx, dialer) = make_ctx(PoolingMode::Transaction);
        let manager = TransactionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();
        rst.tx_active = true;

        let pool = ctx.pools.pool_for("sh1").await.unwrap();
        manager.unroute(&ctx, &mut rst).await.unwrap();

        // Released mid-transaction: closed, not re-pooled.
        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(pool.stats().await.outstanding, 0);

        // A later acquire dials fresh.
        rst.tx_active = false;
        rst.active_shard = Some("sh1".to_string());
        manager.route(&ctx, &mut rst).await.unwrap();
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_route_unknown_shard_fails() {
        let (ctx, _) = make_ctx(PoolingMode::Transaction);
        let manager = TransactionPooler;
        let mut rst = RelayState::new();
        rst.active_shard = Some("ghost".to_string());

        let err = manager.route(&ctx, &mut rst).await.unwrap_err();
        assert!(matches!(err, RepartoError::RouteFailed { .. }));
        assert!(rst.active_backend.is_none());
    }

    #[tokio::test]
    async fn test_routing_idents_differ_by_mode() {
        let (ctx, _) = make_ctx(PoolingMode::Session);
        assert_eq!(SessionPooler.routing_ident(&ctx), "app/orders");
        // Transaction-pooled clients share the rule-wide route.
        assert_eq!(TransactionPooler.routing_ident(&ctx), ctx.rule.ident());
    }

    #[test]
    fn test_manager_for_selects_by_mode() {
        let rule = Rule {
            user: None,
            database: None,
            pooling_mode: PoolingMode::Session,
            auth: AuthMethod::Trust,
            password: None,
            default_shard: None,
            connection_limit: 1,
        };
        let m = manager_for(&rule);
        let rst = RelayState::new();
        assert!(m.validate_reroute(&rst));
    }
}
