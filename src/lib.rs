pub mod admin;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
/// Reparto - a sharding proxy for the PostgreSQL wire protocol
///
/// Clients connect to reparto as if it were a single database server. The
/// proxy authenticates them against configured rules, classifies each
/// statement, chooses a backend shard, and relays protocol messages
/// until the session (or transaction, depending on the pooling mode)
/// ends. A second listener serves an administrative console over the
/// same wire protocol.
pub mod protocol;
pub mod router;
pub mod utils;

use async_trait::async_trait;
use std::error::Error;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Pingora framework imports for the server frame and TCP services
use pingora::apps::ServerApp;
use pingora_core::listeners::Listeners;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::{background_service, BackgroundService};
use pingora_core::services::listening::Service;
use pingora_core::protocols::Stream;

use crate::admin::AdminState;
use crate::config::Config;
use crate::core::cancel::CancelRegistry;
use crate::core::frontend::{self, SessionCounter};
use crate::core::manager::{manager_for, ClientCtx};
use crate::core::pool::{PgDialer, PoolRegistry};
use crate::core::relay::Relay;
use crate::core::route::RouteTable;
use crate::core::Rule;
use crate::error::RepartoError;
use crate::health::{HealthMonitor, TcpHealthChecker};
use crate::protocol::messages::error_response;
use crate::router::{QueryRouter, ShardKeyRouter};

/// Everything the per-connection apps share.
struct SharedState {
    rules: Vec<Arc<Rule>>,
    pools: Arc<PoolRegistry>,
    router: Arc<ShardKeyRouter>,
    route_table: Arc<RouteTable>,
    cancels: Arc<CancelRegistry>,
    sessions: Arc<SessionCounter>,
    config: Config,
}

impl SharedState {
    fn build(config: Config) -> Self {
        let timeouts = config.timeouts.clone();
        let dialer = Arc::new(PgDialer::new(timeouts.dial()));
        let pools = Arc::new(PoolRegistry::new(
            config.shards.clone(),
            dialer,
            timeouts.pool_acquire(),
        ));
        let router = Arc::new(ShardKeyRouter::from_config(&config.routes));
        let rules = config.rules.iter().cloned().map(Arc::new).collect();
        Self {
            rules,
            pools,
            router,
            route_table: Arc::new(RouteTable::new(timeouts.route_idle())),
            cancels: Arc::new(CancelRegistry::new()),
            sessions: Arc::new(SessionCounter::new()),
            config,
        }
    }

    fn admin_state(&self) -> AdminState {
        AdminState {
            pools: Arc::clone(&self.pools),
            router: Arc::clone(&self.router),
        }
    }
}

/// Proxy listener app: one handshake + relay per inbound connection.
struct ProxyApp {
    state: Arc<SharedState>,
    next_client_id: AtomicU64,
}

#[async_trait]
impl ServerApp for ProxyApp {
    async fn process_new(
        self: &Arc<Self>,
        client_stream: Stream,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let state = &self.state;
        let timeouts = &state.config.timeouts;

        let session = match frontend::establish(
            client_stream,
            &state.rules,
            &state.cancels,
            timeouts.dial(),
        )
        .await
        {
            Ok(Some(session)) => session,
            Ok(None) => return None, // out-of-band cancel, handled
            Err(err) => {
                log::debug!("handshake failed: {}", err);
                return None;
            }
        };

        let rule = Arc::clone(&session.rule);
        if !state.sessions.try_admit(&rule).await {
            let err = RepartoError::pool_exhausted(&rule.ident());
            let mut wire = session.stream;
            let _ = wire
                .send(&error_response(
                    "FATAL",
                    err.sqlstate(),
                    "too many connections for rule",
                ))
                .await;
            state.cancels.unregister(session.cancel_key).await;
            return None;
        }

        let ctx = ClientCtx {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            rule: Arc::clone(&rule),
            params: session.params,
            route_table: Arc::clone(&state.route_table),
            pools: Arc::clone(&state.pools),
            cancel: session.cancel,
        };
        let client_id = ctx.id;
        log::info!(
            "client {} accepted (user {}, database {}, {} pooling)",
            client_id,
            ctx.user(),
            ctx.database(),
            rule.pooling_mode
        );

        let relay = Relay::new(
            session.stream,
            ctx,
            manager_for(&rule),
            Arc::clone(&state.router) as Arc<dyn QueryRouter>,
            timeouts.shutdown_deadline(),
            timeouts.backend_read(),
        );
        relay.run(shutdown.clone()).await;

        state.sessions.depart(&rule).await;
        state.cancels.unregister(session.cancel_key).await;
        log::info!("client {} closed", client_id);
        None
    }
}

/// Console listener app.
struct AdminApp {
    state: Arc<SharedState>,
}

#[async_trait]
impl ServerApp for AdminApp {
    async fn process_new(
        self: &Arc<Self>,
        client_stream: Stream,
        _shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let admin = self.state.admin_state();
        if let Err(err) = admin::serve_console(client_stream, &admin).await {
            log::debug!("console session ended with error: {}", err);
        }
        None
    }
}

/// Background route reaping and shard health probing.
struct Janitor {
    state: Arc<SharedState>,
}

#[async_trait]
impl BackgroundService for Janitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let health_cfg = &self.state.config.health;
        let monitor = HealthMonitor::new(
            Box::new(TcpHealthChecker::new(std::time::Duration::from_secs(
                health_cfg.timeout_sec,
            ))),
            Arc::clone(&self.state.pools),
            std::time::Duration::from_secs(health_cfg.interval_sec),
        );
        let mut last_health = std::collections::HashMap::new();
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(health_cfg.interval_sec));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("janitor stopping");
                    return;
                }
                _ = interval.tick() => {
                    monitor.probe_once(&mut last_health).await;
                    self.state.route_table.reap_idle().await;
                }
            }
        }
    }
}

/// Main reparto instance built on the Pingora server frame.
pub struct Reparto {
    config: Config,
    server: Option<Server>,
}

impl Reparto {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            server: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize the Pingora server.
    pub fn initialize(&mut self, opt: Option<Opt>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let server = Server::new(opt)?;
        self.server = Some(server);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.server.is_some()
    }

    /// Build the shared state and run the proxy, console, and janitor
    /// services until shutdown.
    pub fn run(mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut server = self
            .server
            .take()
            .ok_or("Server not initialized. Call initialize() first.")?;
        server.bootstrap();

        let state = Arc::new(SharedState::build(self.config));

        if let Some(init_sql) = state.config.server.init_sql.clone() {
            let admin = state.admin_state();
            futures::executor::block_on(admin::replay_init_sql(Path::new(&init_sql), &admin))
                .map_err(|e| format!("init_sql replay failed: {}", e))?;
        }

        let proxy_service = Service::with_listeners(
            "reparto proxy".to_string(),
            Listeners::tcp(&state.config.server.listen_addr),
            ProxyApp {
                state: Arc::clone(&state),
                next_client_id: AtomicU64::new(1),
            },
        );
        let admin_service = Service::with_listeners(
            "reparto console".to_string(),
            Listeners::tcp(&state.config.server.admin_addr),
            AdminApp {
                state: Arc::clone(&state),
            },
        );
        let janitor = background_service(
            "reparto-janitor",
            Janitor {
                state: Arc::clone(&state),
            },
        );

        log::info!(
            "reparto listening on {} (console {}), {} shards, {} rules, shutdown grace {}",
            state.config.server.listen_addr,
            state.config.server.admin_addr,
            state.config.shards.len(),
            state.config.rules.len(),
            crate::utils::format_duration(state.config.timeouts.shutdown_deadline()),
        );

        server.add_service(proxy_service);
        server.add_service(admin_service);
        server.add_service(janitor);

        server.run_forever();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reparto_creation() {
        let reparto = Reparto::new(Config::example());
        assert!(!reparto.is_initialized());
        assert_eq!(reparto.config().server.listen_addr, "0.0.0.0:6432");
    }

    #[test]
    fn test_run_without_initialization() {
        let reparto = Reparto::new(Config::example());
        let result = reparto.run();
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "Server not initialized. Call initialize() first."
        );
    }

    #[test]
    fn test_shared_state_build() {
        let state = SharedState::build(Config::example());
        assert_eq!(state.rules.len(), 1);
        // Routing entries came from config.
        futures::executor::block_on(async {
            assert_eq!(state.router.entries().await.len(), 1);
            assert!(state.pools.has_shard("sh1").await);
            assert!(state.pools.has_shard("sh2").await);
        });
    }

    #[test]
    fn test_initialize() {
        let mut reparto = Reparto::new(Config::example());
        reparto.initialize(None).unwrap();
        assert!(reparto.is_initialized());
    }
}
