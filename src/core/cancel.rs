/// Out-of-band query cancellation
///
/// The proxy issues its own BackendKeyData to every client. A later
/// CancelRequest arrives on a fresh connection carrying that key; the
/// acceptor resolves it here against whichever backend the target session
/// has bound at that instant and forwards a CancelRequest with the
/// backend's real key. A session with no bound backend drops the request
/// silently. Pooling state is never disturbed.
use fnv::FnvHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::pool::CancelTarget;
use crate::protocol::startup::encode_cancel;

/// A session's slot for "the backend presently bound to me". The relay
/// rebinds it on every route/unroute; the cancel path only reads it.
#[derive(Clone, Default)]
pub struct CancelHandle {
    target: Arc<Mutex<Option<CancelTarget>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, target: Option<CancelTarget>) {
        *self.target.lock().await = target;
    }

    pub async fn target(&self) -> Option<CancelTarget> {
        self.target.lock().await.clone()
    }
}

/// Registry from proxy-issued cancel keys to session handles.
#[derive(Default)]
pub struct CancelRegistry {
    entries: RwLock<FnvHashMap<(i32, i32), CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh (pid, secret) key and register the session's handle.
    pub async fn register(&self, handle: CancelHandle) -> (i32, i32) {
        let mut entries = self.entries.write().await;
        loop {
            let pid = (rand::random::<u32>() % i32::MAX as u32) as i32 + 1;
            let secret = rand::random::<i32>();
            if !entries.contains_key(&(pid, secret)) {
                entries.insert((pid, secret), handle);
                return (pid, secret);
            }
        }
    }

    pub async fn unregister(&self, key: (i32, i32)) {
        self.entries.write().await.remove(&key);
    }

    pub async fn resolve(&self, key: (i32, i32)) -> Option<CancelTarget> {
        let handle = self.entries.read().await.get(&key).cloned()?;
        handle.target().await
    }

    /// Resolve a CancelRequest and relay it to the bound backend, if any.
    pub async fn dispatch(&self, key: (i32, i32), dial_timeout: Duration) {
        let Some(target) = self.resolve(key).await else {
            debug!(pid = key.0, "cancel request with no bound backend, dropped");
            return;
        };
        match timeout(dial_timeout, TcpStream::connect(&target.endpoint)).await {
            Ok(Ok(mut stream)) => {
                let packet = encode_cancel(target.pid, target.secret);
                if let Err(e) = stream.write_all(&packet).await {
                    warn!(endpoint = %target.endpoint, "failed to send cancel: {}", e);
                } else {
                    debug!(endpoint = %target.endpoint, backend_pid = target.pid, "relayed cancel");
                }
            }
            Ok(Err(e)) => warn!(endpoint = %target.endpoint, "cancel dial failed: {}", e),
            Err(_) => warn!(endpoint = %target.endpoint, "cancel dial timed out"),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(pid: i32) -> CancelTarget {
        CancelTarget {
            endpoint: "127.0.0.1:5432".to_string(),
            pid,
            secret: 99,
        }
    }

    #[tokio::test]
    async fn test_register_issues_unique_keys() {
        let registry = CancelRegistry::new();
        let k1 = registry.register(CancelHandle::new()).await;
        let k2 = registry.register(CancelHandle::new()).await;
        assert_ne!(k1, k2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_resolve_follows_rebinding() {
        let registry = CancelRegistry::new();
        let handle = CancelHandle::new();
        let key = registry.register(handle.clone()).await;

        // Unbound session: nothing to cancel.
        assert!(registry.resolve(key).await.is_none());

        handle.bind(Some(target(10))).await;
        assert_eq!(registry.resolve(key).await.unwrap().pid, 10);

        // Rebound to a different backend mid-session.
        handle.bind(Some(target(20))).await;
        assert_eq!(registry.resolve(key).await.unwrap().pid, 20);

        handle.bind(None).await;
        assert!(registry.resolve(key).await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_forgets_key() {
        let registry = CancelRegistry::new();
        let handle = CancelHandle::new();
        handle.bind(Some(target(1))).await;
        let key = registry.register(handle).await;

        registry.unregister(key).await;
        assert!(registry.resolve(key).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_key_resolves_none() {
        let registry = CancelRegistry::new();
        assert!(registry.resolve((123, 456)).await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_sends_backend_key() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = CancelRegistry::new();
        let handle = CancelHandle::new();
        handle
            .bind(Some(CancelTarget {
                endpoint: addr.to_string(),
                pid: 777,
                secret: -5,
            }))
            .await;
        let key = registry.register(handle).await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        registry.dispatch(key, Duration::from_secs(1)).await;

        let buf = server.await.unwrap();
        assert_eq!(&buf, &encode_cancel(777, -5)[..]);
    }
}
