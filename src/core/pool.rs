/// Per-shard backend connection pooling
///
/// A `ShardPool` is a bounded pool of live wire connections to one shard:
/// an idle FIFO plus a counting semaphore. A permit is held (forgotten)
/// for every checked-out connection and returned whenever one is released
/// or closed, so `idle + outstanding <= max` holds at all times. Dialing
/// is lazy: capacity accounting is separate from connection creation.
///
/// Ownership is exclusive: a `BackendConn` is either in the idle FIFO or
/// held by exactly one relay, never both.
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::{AuthMethod, Shard};
use crate::error::{RepartoError, RepartoResult};
use crate::protocol::messages::{
    authentication_code, parse_backend_key_data, parse_error_response, password_message,
    ready_for_query_status, AUTH_CLEARTEXT, AUTH_OK,
};
use crate::protocol::startup::{encode_startup, StartupParams};
use crate::protocol::{backend_tags, Message, WireStream};

/// Object-safe async byte stream, so the pool can hold TCP sockets in
/// production and duplex pipes in tests behind one type.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Cancel coordinates captured from a backend's BackendKeyData.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub endpoint: String,
    pub pid: i32,
    pub secret: i32,
}

/// One live, authenticated wire connection to a shard.
pub struct BackendConn {
    shard: String,
    endpoint: String,
    stream: WireStream<BoxedStream>,
    generation: u64,
    dirty: bool,
    key_data: Option<(i32, i32)>,
}

impl BackendConn {
    pub fn new(
        shard: &str,
        endpoint: &str,
        stream: BoxedStream,
        key_data: Option<(i32, i32)>,
    ) -> Self {
        Self {
            shard: shard.to_string(),
            endpoint: endpoint.to_string(),
            stream: WireStream::new(stream),
            generation: 0,
            dirty: false,
            key_data,
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Set whenever a transaction was active at release time without a
    /// clean COMMIT/ROLLBACK; dirty conns are closed, never re-pooled.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cancel_target(&self) -> Option<CancelTarget> {
        self.key_data.map(|(pid, secret)| CancelTarget {
            endpoint: self.endpoint.clone(),
            pid,
            secret,
        })
    }

    pub async fn read_message(&mut self) -> RepartoResult<Message> {
        match self.stream.read_message().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(RepartoError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ))),
            Err(e) => Err(RepartoError::BackendIo(e)),
        }
    }

    pub async fn send(&mut self, msg: &Message) -> RepartoResult<()> {
        self.stream.send(msg).await.map_err(RepartoError::BackendIo)
    }

    pub fn queue(&mut self, msg: &Message) {
        self.stream.queue(msg);
    }

    pub async fn flush(&mut self) -> RepartoResult<()> {
        self.stream.flush().await.map_err(RepartoError::BackendIo)
    }
}

impl fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConn")
            .field("shard", &self.shard)
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// Factory for live backend connections, injected so tests can pool
/// in-memory pipes instead of real sockets.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial(&self, shard: &Shard) -> RepartoResult<BackendConn>;
}

/// Production dialer: TCP connect with timeout, then the v3 startup
/// handshake using the shard's credentials.
pub struct PgDialer {
    dial_timeout: Duration,
}

impl PgDialer {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    async fn dial_endpoint(&self, shard: &Shard, endpoint: &str) -> RepartoResult<BackendConn> {
        let stream = match timeout(self.dial_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RepartoError::unreachable(&shard.name, e.to_string())),
            Err(_) => {
                return Err(RepartoError::unreachable(
                    &shard.name,
                    format!("dial timeout connecting to {}", endpoint),
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for {}: {}", endpoint, e);
        }

        let mut wire = WireStream::new(Box::new(stream) as BoxedStream);

        let mut params = StartupParams::new();
        params.set("user", &shard.user);
        params.set("database", &shard.database);
        params.set("application_name", "reparto");
        wire.queue_raw(&encode_startup(&params));
        wire.flush()
            .await
            .map_err(|e| RepartoError::unreachable(&shard.name, e.to_string()))?;

        // Drive the backend's startup sequence to the first ReadyForQuery.
        // A backend that fails its own handshake counts as a dial failure.
        let mut key_data = None;
        loop {
            let msg = match wire.read_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    return Err(RepartoError::unreachable(
                        &shard.name,
                        "backend closed during startup",
                    ))
                }
                Err(e) => return Err(RepartoError::unreachable(&shard.name, e.to_string())),
            };
            match msg.tag {
                backend_tags::AUTHENTICATION => match authentication_code(&msg) {
                    Some(AUTH_OK) => {}
                    Some(AUTH_CLEARTEXT) => {
                        let password = shard.password.as_deref().ok_or_else(|| {
                            RepartoError::unreachable(
                                &shard.name,
                                "backend requested a password but none is configured",
                            )
                        })?;
                        wire.send(&password_message(password))
                            .await
                            .map_err(|e| RepartoError::unreachable(&shard.name, e.to_string()))?;
                    }
                    Some(code) => {
                        return Err(RepartoError::unreachable(
                            &shard.name,
                            format!("unsupported backend auth method {}", code),
                        ))
                    }
                    None => {
                        return Err(RepartoError::unreachable(
                            &shard.name,
                            "malformed authentication message",
                        ))
                    }
                },
                backend_tags::PARAMETER_STATUS => {}
                backend_tags::BACKEND_KEY_DATA => {
                    key_data = parse_backend_key_data(&msg);
                }
                backend_tags::READY_FOR_QUERY => {
                    if ready_for_query_status(&msg).is_none() {
                        return Err(RepartoError::unreachable(
                            &shard.name,
                            "malformed ReadyForQuery during startup",
                        ));
                    }
                    break;
                }
                backend_tags::ERROR_RESPONSE => {
                    let detail = parse_error_response(&msg)
                        .map(|f| f.message)
                        .unwrap_or_else(|| "backend rejected startup".to_string());
                    return Err(RepartoError::unreachable(&shard.name, detail));
                }
                other => {
                    return Err(RepartoError::unreachable(
                        &shard.name,
                        format!("unexpected startup message {:?}", other as char),
                    ))
                }
            }
        }

        Ok(BackendConn {
            shard: shard.name.clone(),
            endpoint: endpoint.to_string(),
            stream: wire,
            generation: 0,
            dirty: false,
            key_data,
        })
    }
}

#[async_trait]
impl BackendDialer for PgDialer {
    async fn dial(&self, shard: &Shard) -> RepartoResult<BackendConn> {
        let mut last_err = None;
        for endpoint in &shard.hosts {
            match self.dial_endpoint(shard, endpoint).await {
                Ok(conn) => {
                    debug!(shard = %shard.name, endpoint = %endpoint, "dialed backend");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(shard = %shard.name, endpoint = %endpoint, "dial failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| RepartoError::unreachable(&shard.name, "shard has no hosts")))
    }
}

/// Snapshot of one pool's accounting, for the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub shard: String,
    pub idle: usize,
    pub outstanding: usize,
    pub max: usize,
}

/// Bounded pool of backend connections for one shard.
pub struct ShardPool {
    shard: Shard,
    dialer: Arc<dyn BackendDialer>,
    idle: Mutex<VecDeque<BackendConn>>,
    semaphore: Arc<Semaphore>,
    outstanding: AtomicUsize,
    /// Bumped by invalidate_all; idle conns from older generations are
    /// silently replaced on their next acquire or release.
    generation: AtomicU64,
    acquire_timeout: Duration,
}

impl ShardPool {
    pub fn new(shard: Shard, dialer: Arc<dyn BackendDialer>, acquire_timeout: Duration) -> Self {
        let max = shard.max_connections;
        Self {
            shard,
            dialer,
            idle: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(max)),
            outstanding: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            acquire_timeout,
        }
    }

    pub fn shard_name(&self) -> &str {
        &self.shard.name
    }

    pub fn descriptor(&self) -> &Shard {
        &self.shard
    }

    /// Check out a backend: idle FIFO first, lazily dialed otherwise,
    /// blocking up to the acquire deadline when the pool is at capacity.
    pub async fn acquire(self: &Arc<Self>) -> RepartoResult<BackendConn> {
        let permit = match timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(RepartoError::internal("pool semaphore closed"));
            }
            Err(_) => return Err(RepartoError::pool_exhausted(&self.shard.name)),
        };

        let current_gen = self.generation.load(Ordering::Acquire);
        loop {
            let reusable = {
                let mut idle = self.idle.lock().await;
                idle.pop_front()
            };
            match reusable {
                Some(conn) if conn.generation == current_gen => {
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    permit.forget();
                    debug!(shard = %self.shard.name, "reused idle backend");
                    return Ok(conn);
                }
                Some(conn) => {
                    // Stale generation: silent replacement.
                    debug!(
                        shard = %self.shard.name,
                        generation = conn.generation,
                        "discarded stale idle backend"
                    );
                    drop(conn);
                }
                None => break,
            }
        }

        // Idle FIFO empty: dial. The permit drops (returns) on failure.
        let mut conn = self.dialer.dial(&self.shard).await?;
        conn.generation = current_gen;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        permit.forget();
        Ok(conn)
    }

    /// Check a backend in. Clean, current-generation conns return to the
    /// idle FIFO; dirty or stale ones are closed. Never fails.
    pub async fn release(&self, conn: BackendConn, clean: bool) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.semaphore.add_permits(1);

        let current_gen = self.generation.load(Ordering::Acquire);
        if clean && !conn.dirty && conn.generation == current_gen {
            let mut idle = self.idle.lock().await;
            idle.push_back(conn);
        } else {
            debug!(shard = %self.shard.name, clean, dirty = conn.dirty, "closed backend on release");
            drop(conn);
        }
    }

    /// Forcibly close a checked-out backend after an I/O error.
    pub fn invalidate(&self, conn: BackendConn) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.semaphore.add_permits(1);
        warn!(shard = %self.shard.name, "invalidated backend connection");
        drop(conn);
    }

    /// Drop every idle connection and fence out still-checked-out ones:
    /// anything from an older generation is closed instead of re-pooled.
    pub async fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut idle = self.idle.lock().await;
        let dropped = idle.len();
        idle.clear();
        if dropped > 0 {
            warn!(shard = %self.shard.name, dropped, "cleared idle backends");
        }
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            shard: self.shard.name.clone(),
            idle: self.idle.lock().await.len(),
            outstanding: self.outstanding.load(Ordering::Acquire),
            max: self.shard.max_connections,
        }
    }
}

impl fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardPool")
            .field("shard", &self.shard.name)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Registry of shard descriptors and their pools. Pools are created on
/// first use; the admin console mutates the descriptor set at runtime.
pub struct PoolRegistry {
    shards: RwLock<HashMap<String, Shard>>,
    pools: RwLock<HashMap<String, Arc<ShardPool>>>,
    dialer: Arc<dyn BackendDialer>,
    acquire_timeout: Duration,
}

impl PoolRegistry {
    pub fn new(
        shards: Vec<Shard>,
        dialer: Arc<dyn BackendDialer>,
        acquire_timeout: Duration,
    ) -> Self {
        let shards = shards
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect::<HashMap<_, _>>();
        Self {
            shards: RwLock::new(shards),
            pools: RwLock::new(HashMap::new()),
            dialer,
            acquire_timeout,
        }
    }

    pub async fn pool_for(&self, shard_name: &str) -> RepartoResult<Arc<ShardPool>> {
        if let Some(pool) = self.pools.read().await.get(shard_name) {
            return Ok(Arc::clone(pool));
        }
        let descriptor = {
            let shards = self.shards.read().await;
            shards.get(shard_name).cloned()
        }
        .ok_or_else(|| RepartoError::route_failed(shard_name, "unknown shard"))?;

        let mut pools = self.pools.write().await;
        // Lost the creation race: reuse the winner's pool.
        if let Some(pool) = pools.get(shard_name) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ShardPool::new(
            descriptor,
            Arc::clone(&self.dialer),
            self.acquire_timeout,
        ));
        pools.insert(shard_name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub async fn add_shard(&self, shard: Shard) -> bool {
        let mut shards = self.shards.write().await;
        if shards.contains_key(&shard.name) {
            return false;
        }
        shards.insert(shard.name.clone(), shard);
        true
    }

    pub async fn drop_shard(&self, name: &str) -> bool {
        let removed = self.shards.write().await.remove(name).is_some();
        if removed {
            if let Some(pool) = self.pools.write().await.remove(name) {
                pool.invalidate_all().await;
            }
        }
        removed
    }

    pub async fn has_shard(&self, name: &str) -> bool {
        self.shards.read().await.contains_key(name)
    }

    pub async fn shard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn shard_descriptor(&self, name: &str) -> Option<Shard> {
        self.shards.read().await.get(name).cloned()
    }

    pub async fn all_stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<ShardPool>> = self.pools.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats.sort_by(|a, b| a.shard.cmp(&b.shard));
        stats
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex as TokioMutex;

    /// Dialer backed by in-memory pipes. The server halves are parked so
    /// the conns stay open; tests can take them to script backend traffic.
    pub struct MockDialer {
        pub dial_count: AtomicU32,
        pub fail: std::sync::atomic::AtomicBool,
        pub server_halves: TokioMutex<Vec<DuplexStream>>,
    }

    impl MockDialer {
        pub fn new() -> Self {
            Self {
                dial_count: AtomicU32::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                server_halves: TokioMutex::new(Vec::new()),
            }
        }

        pub fn dials(&self) -> u32 {
            self.dial_count.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl BackendDialer for MockDialer {
        async fn dial(&self, shard: &Shard) -> RepartoResult<BackendConn> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(RepartoError::unreachable(&shard.name, "mock dial failure"));
            }
            self.dial_count.fetch_add(1, Ordering::Relaxed);
            let (client, server) = tokio::io::duplex(65536);
            self.server_halves.lock().await.push(server);
            Ok(BackendConn::new(
                &shard.name,
                "mock:5432",
                Box::new(client),
                Some((1000 + self.dials() as i32, 42)),
            ))
        }
    }

    pub fn test_shard(name: &str, max_connections: usize) -> Shard {
        Shard {
            name: name.to_string(),
            hosts: vec!["127.0.0.1:5432".to_string()],
            user: "reparto".to_string(),
            password: None,
            database: "app".to_string(),
            tls: Default::default(),
            max_connections,
        }
    }
}
