/// Route table: bindings between client populations and shards
///
/// A `Route` ties one (shard, routing-key) pair to the shard's pool and
/// tracks the clients currently attached to it. Routes are created on
/// first use with a check-then-insert under the writer lock, so creation
/// races converge on one winner; empty routes are reaped once a
/// configured idle deadline elapses.
use fnv::FnvHashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::core::pool::{BackendConn, ShardPool};
use crate::error::RepartoResult;

/// Identity of a route. The routing key is mode-dependent: session-pooled
/// clients key on their own (user, database) identity, transaction-pooled
/// clients share a per-rule key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub shard: String,
    pub ident: String,
}

impl RouteKey {
    pub fn new(shard: &str, ident: &str) -> Self {
        Self {
            shard: shard.to_string(),
            ident: ident.to_string(),
        }
    }
}

struct RouteInner {
    clients: HashSet<u64>,
    empty_since: Option<Instant>,
}

/// One binding between a set of clients and a shard pool.
pub struct Route {
    key: RouteKey,
    pool: Arc<ShardPool>,
    inner: Mutex<RouteInner>,
}

impl Route {
    fn new(key: RouteKey, pool: Arc<ShardPool>) -> Self {
        Self {
            key,
            pool,
            inner: Mutex::new(RouteInner {
                clients: HashSet::new(),
                empty_since: Some(Instant::now()),
            }),
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    pub async fn attach(&self, client_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.clients.insert(client_id);
        inner.empty_since = None;
    }

    pub async fn detach(&self, client_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(&client_id);
        if inner.clients.is_empty() {
            inner.empty_since = Some(Instant::now());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    async fn reapable(&self, idle_deadline: Duration) -> bool {
        let inner = self.inner.lock().await;
        matches!(inner.empty_since, Some(since) if since.elapsed() >= idle_deadline)
    }

    pub async fn acquire(&self) -> RepartoResult<BackendConn> {
        self.pool.acquire().await
    }

    pub async fn release(&self, conn: BackendConn, clean: bool) {
        self.pool.release(conn, clean).await
    }

    pub fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }
}

/// Concurrent index from RouteKey to Route.
pub struct RouteTable {
    routes: RwLock<FnvHashMap<RouteKey, Arc<Route>>>,
    idle_deadline: Duration,
}

impl RouteTable {
    pub fn new(idle_deadline: Duration) -> Self {
        Self {
            routes: RwLock::new(FnvHashMap::default()),
            idle_deadline,
        }
    }

    /// Look up or create the route for `key`, attaching `client_id` to it.
    pub async fn attach_route(
        &self,
        key: RouteKey,
        pool: Arc<ShardPool>,
        client_id: u64,
    ) -> Arc<Route> {
        if let Some(route) = self.routes.read().await.get(&key) {
            let route = Arc::clone(route);
            route.attach(client_id).await;
            return route;
        }

        let route = {
            let mut routes = self.routes.write().await;
            // Losers of the creation race reuse the winner's route.
            if let Some(existing) = routes.get(&key) {
                Arc::clone(existing)
            } else {
                let route = Arc::new(Route::new(key.clone(), pool));
                routes.insert(key, Arc::clone(&route));
                route
            }
        };
        route.attach(client_id).await;
        route
    }

    pub async fn get(&self, key: &RouteKey) -> Option<Arc<Route>> {
        self.routes.read().await.get(key).cloned()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Remove routes that have been empty past the idle deadline.
    pub async fn reap_idle(&self) -> usize {
        let candidates: Vec<(RouteKey, Arc<Route>)> = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut reaped = 0;
        for (key, route) in candidates {
            if route.reapable(self.idle_deadline).await {
                let mut routes = self.routes.write().await;
                // Re-check under the writer lock: a client may have
                // attached between the scan and now.
                if route.client_count().await == 0 {
                    routes.remove(&key);
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            debug!(reaped, "reaped idle routes");
        }
        reaped
    }

    /// Background sweep, run as a detached task.
    pub async fn run_reaper(self: Arc<Self>) {
        let period = self.idle_deadline.max(Duration::from_secs(1)) / 4;
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.reap_idle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::test_support::{test_shard, MockDialer};
    use crate::core::pool::BackendDialer;

    fn make_pool() -> Arc<ShardPool> {
        Arc::new(ShardPool::new(
            test_shard("sh1", 4),
            Arc::new(MockDialer::new()) as Arc<dyn BackendDialer>,
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn test_attach_creates_route_once() {
        let table = RouteTable::new(Duration::from_secs(60));
        let pool = make_pool();
        let key = RouteKey::new("sh1", "app/orders");

        let r1 = table.attach_route(key.clone(), Arc::clone(&pool), 1).await;
        let r2 = table.attach_route(key.clone(), Arc::clone(&pool), 2).await;

        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(table.route_count().await, 1);
        assert_eq!(r1.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_distinct_routes() {
        let table = RouteTable::new(Duration::from_secs(60));
        let pool = make_pool();

        table
            .attach_route(RouteKey::new("sh1", "a/x"), Arc::clone(&pool), 1)
            .await;
        table
            .attach_route(RouteKey::new("sh1", "b/y"), Arc::clone(&pool), 2)
            .await;

        assert_eq!(table.route_count().await, 2);
    }

    #[tokio::test]
    async fn test_detach_then_reap() {
        let table = RouteTable::new(Duration::from_millis(10));
        let pool = make_pool();
        let key = RouteKey::new("sh1", "app/orders");

        let route = table.attach_route(key.clone(), pool, 7).await;
        route.detach(7).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.reap_idle().await, 1);
        assert_eq!(table.route_count().await, 0);
    }

    #[tokio::test]
    async fn test_occupied_route_not_reaped() {
        let table = RouteTable::new(Duration::from_millis(10));
        let pool = make_pool();
        let key = RouteKey::new("sh1", "app/orders");

        let _route = table.attach_route(key.clone(), pool, 7).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(table.reap_idle().await, 0);
        assert_eq!(table.route_count().await, 1);
    }

    #[tokio::test]
    async fn test_fresh_empty_route_not_reaped() {
        let table = RouteTable::new(Duration::from_secs(60));
        let pool = make_pool();
        let route = table
            .attach_route(RouteKey::new("sh1", "a/x"), pool, 1)
            .await;
        route.detach(1).await;

        // Empty, but the idle deadline has not elapsed.
        assert_eq!(table.reap_idle().await, 0);
    }

    #[tokio::test]
    async fn test_route_acquire_release() {
        let table = RouteTable::new(Duration::from_secs(60));
        let pool = make_pool();
        let route = table
            .attach_route(RouteKey::new("sh1", "a/x"), pool, 1)
            .await;

        let conn = route.acquire().await.unwrap();
        assert_eq!(conn.shard(), "sh1");
        route.release(conn, true).await;
        assert_eq!(route.pool().stats().await.idle, 1);
    }
}
