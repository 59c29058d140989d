/// The relay state machine: one task per client session
///
/// The relay copies protocol messages between one frontend wire and one
/// backend wire while invoking the ConnManager at discipline boundaries.
/// Each cycle: read a frontend message, classify it, validate and perform
/// any (re)route, forward it, then pump backend responses until
/// ReadyForQuery, whose status byte drives `tx_begin`/`tx_end`. COPY
/// streams verbatim in a sub-mode where re-routing is impossible;
/// extended-protocol pipelines fix their routing at the first Parse and
/// pump at Sync. The serialized pump never holds a frontend read while
/// draining backend responses, so out-of-band cancels stay interceptable.
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::manager::{ClientCtx, ConnManager, RelayState};
use crate::error::{RepartoError, RepartoResult};
use crate::protocol::messages::{
    error_response, parse_statement_text, query_text, ready_for_query, ready_for_query_status,
    TxStatus,
};
use crate::protocol::{backend_tags, tags, Message, WireStream};
use crate::router::{classify_sql, QueryRouter, RouteDecision};

/// Flush the staging buffer once it grows past this.
const FLUSH_THRESHOLD: usize = 16 * 1024;

pub struct Relay<S> {
    client: WireStream<S>,
    ctx: ClientCtx,
    rst: RelayState,
    manager: Box<dyn ConnManager>,
    router: Arc<dyn QueryRouter>,
    /// Session-local statements buffered before the first route, replayed
    /// onto the first bound backend.
    replay: Vec<Message>,
    /// Last transaction status relayed to the client, used when the proxy
    /// must synthesize a ReadyForQuery itself.
    last_status: TxStatus,
    /// Set once the shutdown watch fires; the relay finishes the current
    /// transaction (bounded by the drain deadline) and exits at idle.
    drain_deadline: Option<Instant>,
    shutdown_grace: Duration,
    /// Ceiling on a single backend read; a stalled backend terminates the
    /// session instead of wedging it forever.
    backend_read_timeout: Option<Duration>,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Relay<S> {
    pub fn new(
        client: WireStream<S>,
        ctx: ClientCtx,
        manager: Box<dyn ConnManager>,
        router: Arc<dyn QueryRouter>,
        shutdown_grace: Duration,
        backend_read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            ctx,
            rst: RelayState::new(),
            manager,
            router,
            replay: Vec::new(),
            last_status: TxStatus::Idle,
            drain_deadline: None,
            shutdown_grace,
            backend_read_timeout,
            closed: false,
        }
    }

    /// Drive the session to completion. Always unroutes before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.serve(&mut shutdown).await {
            Ok(()) => debug!(client = self.ctx.id, "session ended"),
            Err(err) => info!(client = self.ctx.id, "session terminated: {}", err),
        }
        // An unroute while tx_active releases the backend as dirty.
        let _ = self.manager.unroute(&self.ctx, &mut self.rst).await;
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> RepartoResult<()> {
        loop {
            if self.closed {
                return Ok(());
            }

            let msg = match self.next_frontend_message(shutdown).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(err @ RepartoError::ShuttingDown) => {
                    // Drain deadline elapsed with the transaction open.
                    let _ = self.send_error(&err).await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            if let Err(err) = self.dispatch(msg).await {
                self.report(err).await?;
            }

            if self.drain_deadline.is_some() && !self.rst.tx_active {
                let _ = self.send_error(&RepartoError::ShuttingDown).await;
                return Ok(());
            }
        }
    }

    /// Read the next frontend message, watching for the shutdown signal
    /// between commands. `None` means the client disconnected cleanly.
    async fn next_frontend_message(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RepartoResult<Option<Message>> {
        loop {
            if let Some(deadline) = self.drain_deadline {
                // Already draining: bounded by the shutdown deadline.
                return match tokio::time::timeout_at(deadline, self.client.read_message()).await
                {
                    Ok(res) => res.map_err(RepartoError::ClientIo),
                    Err(_) => Err(RepartoError::ShuttingDown),
                };
            }

            tokio::select! {
                res = self.client.read_message() => {
                    return res.map_err(RepartoError::ClientIo);
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && !*shutdown.borrow() {
                        // Spurious wake; keep serving.
                        continue;
                    }
                    self.drain_deadline = Some(Instant::now() + self.shutdown_grace);
                    if !self.rst.tx_active {
                        let _ = self.send_error(&RepartoError::ShuttingDown).await;
                        return Ok(None);
                    }
                    debug!(client = self.ctx.id, "draining: finishing open transaction");
                    // Loop around into the deadline-bounded read.
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) -> RepartoResult<()> {
        match msg.tag {
            tags::TERMINATE => {
                self.closed = true;
                Ok(())
            }
            tags::QUERY => self.on_simple_query(msg).await,
            tags::PARSE => self.on_parse(msg).await,
            tags::SYNC
            | tags::BIND
            | tags::EXECUTE
            | tags::DESCRIBE
            | tags::CLOSE
            | tags::FLUSH => {
                // Continuation of extended-protocol state established
                // earlier (named statements, error recovery Sync).
                if self.rst.active_backend.is_some() {
                    self.run_pipeline(msg).await
                } else if msg.tag == tags::SYNC {
                    // Nothing bound: answer the Sync ourselves.
                    self.client
                        .send(&ready_for_query(self.last_status))
                        .await
                        .map_err(RepartoError::ClientIo)
                } else {
                    self.fail_pipeline(RepartoError::Router(
                        "extended-protocol message with no bound backend".to_string(),
                    ))
                    .await
                }
            }
            tags::COPY_DATA | tags::COPY_DONE | tags::COPY_FAIL => Err(RepartoError::protocol(
                "COPY message outside a COPY operation",
            )),
            tags::PASSWORD => Err(RepartoError::protocol(
                "unexpected password message after startup",
            )),
            _ => {
                // Unknown frontend messages forward verbatim so protocol
                // extensions keep working through the proxy.
                if self.rst.active_backend.is_some() {
                    self.forward_to_backend(&msg, true).await
                } else {
                    Err(RepartoError::protocol(format!(
                        "unknown message {:?} with no bound backend",
                        msg.tag as char
                    )))
                }
            }
        }
    }

    async fn on_simple_query(&mut self, msg: Message) -> RepartoResult<()> {
        let sql = query_text(&msg)
            .ok_or_else(|| RepartoError::protocol("malformed Query message"))?
            .to_string();

        match self.classify(&sql).await? {
            RouteDecision::Shard(target) => {
                self.ensure_routed(&target).await?;
            }
            RouteDecision::SessionLocal | RouteDecision::NoShard => {
                if self.rst.active_backend.is_none() {
                    // No binding yet: hold the statement for replay on the
                    // first route and acknowledge it right away.
                    self.buffer_for_replay(msg, &sql).await?;
                    return Ok(());
                }
            }
            RouteDecision::MultiShard(detail) => {
                return Err(RepartoError::MultiShardQuery(detail));
            }
        }

        self.forward_to_backend(&msg, true).await?;
        let status = self.pump_until_ready().await?;
        self.observe_tx(status).await
    }

    async fn on_parse(&mut self, msg: Message) -> RepartoResult<()> {
        let sql = parse_statement_text(&msg)
            .ok_or_else(|| RepartoError::protocol("malformed Parse message"))?
            .to_string();

        // Routing is fixed at the first Parse of a pipeline.
        match self.classify(&sql).await {
            Ok(RouteDecision::Shard(target)) => {
                if let Err(err) = self.ensure_routed(&target).await {
                    return if err.is_fatal() {
                        Err(err)
                    } else {
                        self.fail_pipeline(err).await
                    };
                }
            }
            Ok(RouteDecision::SessionLocal) | Ok(RouteDecision::NoShard) => {
                if self.rst.active_backend.is_none() {
                    // An unbound pipeline has no safe synthetic reply.
                    return self
                        .fail_pipeline(RepartoError::Router(
                            "cannot infer target shard for extended-protocol statement"
                                .to_string(),
                        ))
                        .await;
                }
            }
            Ok(RouteDecision::MultiShard(detail)) => {
                return self
                    .fail_pipeline(RepartoError::MultiShardQuery(detail))
                    .await;
            }
            Err(err) => {
                return if err.is_fatal() {
                    Err(err)
                } else {
                    self.fail_pipeline(err).await
                };
            }
        }

        self.run_pipeline(msg).await
    }

    /// Forward pipeline messages to the bound backend until the matching
    /// Sync, then pump responses. Transaction transitions are observed
    /// only on the ReadyForQuery after Sync.
    async fn run_pipeline(&mut self, first: Message) -> RepartoResult<()> {
        let mut msg = first;
        loop {
            let is_sync = msg.tag == tags::SYNC;
            let force_flush = is_sync || msg.tag == tags::FLUSH;
            self.forward_to_backend(&msg, force_flush).await?;

            if is_sync {
                let status = self.pump_until_ready().await?;
                return self.observe_tx(status).await;
            }

            msg = match self.client.read_message().await.map_err(RepartoError::ClientIo)? {
                Some(msg) => msg,
                None => {
                    return Err(RepartoError::ClientIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "client closed mid-pipeline",
                    )))
                }
            };
            if msg.tag == tags::TERMINATE {
                self.closed = true;
                return Ok(());
            }
        }
    }

    /// Report a non-fatal pipeline error, then discard frontend messages
    /// up to the Sync and answer it, keeping the session alive.
    async fn fail_pipeline(&mut self, err: RepartoError) -> RepartoResult<()> {
        self.send_error(&err).await.map_err(RepartoError::ClientIo)?;
        loop {
            let msg = match self.client.read_message().await.map_err(RepartoError::ClientIo)? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            match msg.tag {
                tags::SYNC => {
                    return self
                        .client
                        .send(&ready_for_query(self.last_status))
                        .await
                        .map_err(RepartoError::ClientIo);
                }
                tags::TERMINATE => {
                    self.closed = true;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn classify(&mut self, sql: &str) -> RepartoResult<RouteDecision> {
        let decision = classify_sql(self.router.as_ref(), sql).await?;
        if matches!(decision, RouteDecision::NoShard) && self.rst.active_backend.is_none() {
            if let Some(default) = &self.ctx.rule.default_shard {
                return Ok(RouteDecision::Shard(default.clone()));
            }
        }
        Ok(decision)
    }

    /// Bind to `target`, re-routing when legal. No-op when already bound
    /// to the right shard.
    async fn ensure_routed(&mut self, target: &str) -> RepartoResult<()> {
        if self.rst.active_shard.as_deref() == Some(target) && self.rst.active_backend.is_some()
        {
            return Ok(());
        }

        if !self.manager.validate_reroute(&self.rst) {
            return Err(RepartoError::CrossShardInTx {
                bound: self.rst.active_shard.clone().unwrap_or_default(),
                target: target.to_string(),
            });
        }

        if self.rst.active_backend.is_some() || self.rst.route.is_some() {
            self.manager.unroute(&self.ctx, &mut self.rst).await?;
        }

        self.rst.active_shard = Some(target.to_string());
        if let Err(err) = self.manager.route(&self.ctx, &mut self.rst).await {
            self.rst.active_shard = None;
            return Err(err);
        }
        self.replay_buffered().await
    }

    /// Acknowledge a session-local statement the proxy cannot yet place
    /// and keep it for replay on the first route.
    async fn buffer_for_replay(&mut self, msg: Message, sql: &str) -> RepartoResult<()> {
        let tag = sql
            .split_whitespace()
            .next()
            .unwrap_or("SET")
            .to_uppercase();
        self.replay.push(msg);

        self.client
            .queue(&crate::protocol::messages::command_complete(&tag));
        self.client.queue(&ready_for_query(self.last_status));
        self.client.flush().await.map_err(RepartoError::ClientIo)
    }

    /// Replay buffered session-local statements onto a freshly bound
    /// backend, consuming their responses (the client was already
    /// acknowledged when they were buffered).
    async fn replay_buffered(&mut self) -> RepartoResult<()> {
        if self.replay.is_empty() {
            return Ok(());
        }
        let msgs = std::mem::take(&mut self.replay);
        debug!(client = self.ctx.id, count = msgs.len(), "replaying buffered statements");
        for msg in msgs {
            self.forward_to_backend(&msg, true).await?;
            loop {
                let resp = self.read_backend_message().await?;
                if resp.tag == backend_tags::READY_FOR_QUERY {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn forward_to_backend(&mut self, msg: &Message, flush: bool) -> RepartoResult<()> {
        let backend = self
            .rst
            .active_backend
            .as_mut()
            .ok_or_else(|| RepartoError::internal("forward with no bound backend"))?;
        backend.queue(msg);
        if flush {
            backend.flush().await?;
        }
        Ok(())
    }

    async fn read_backend_message(&mut self) -> RepartoResult<Message> {
        let limit = self.backend_read_timeout;
        let backend = self
            .rst
            .active_backend
            .as_mut()
            .ok_or_else(|| RepartoError::internal("pump with no bound backend"))?;
        match limit {
            Some(limit) => match tokio::time::timeout(limit, backend.read_message()).await {
                Ok(res) => res,
                Err(_) => Err(RepartoError::BackendIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "backend read timed out",
                ))),
            },
            None => backend.read_message().await,
        }
    }

    /// Relay backend responses to the client until ReadyForQuery, entering
    /// the COPY sub-mode when the backend requests input.
    async fn pump_until_ready(&mut self) -> RepartoResult<TxStatus> {
        loop {
            let msg = self.read_backend_message().await?;
            match msg.tag {
                backend_tags::READY_FOR_QUERY => {
                    let status = ready_for_query_status(&msg).ok_or_else(|| {
                        RepartoError::protocol("malformed ReadyForQuery from backend")
                    })?;
                    self.client.queue(&msg);
                    self.client.flush().await.map_err(RepartoError::ClientIo)?;
                    self.last_status = status;
                    return Ok(status);
                }
                backend_tags::COPY_IN_RESPONSE | backend_tags::COPY_BOTH_RESPONSE => {
                    self.client.queue(&msg);
                    self.client.flush().await.map_err(RepartoError::ClientIo)?;
                    self.copy_in().await?;
                }
                _ => {
                    // Includes CopyOut traffic: data flows backend→client
                    // until CopyDone, then the pump continues as usual.
                    self.client.queue(&msg);
                    if self.client.buffered_len() >= FLUSH_THRESHOLD {
                        self.client.flush().await.map_err(RepartoError::ClientIo)?;
                    }
                }
            }
        }
    }

    /// COPY IN streaming sub-mode: client data flows verbatim to the
    /// backend until CopyDone or CopyFail. Re-routing cannot happen here.
    async fn copy_in(&mut self) -> RepartoResult<()> {
        loop {
            let msg = match self.client.read_message().await.map_err(RepartoError::ClientIo)? {
                Some(msg) => msg,
                None => {
                    return Err(RepartoError::ClientIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "client closed during COPY",
                    )))
                }
            };
            match msg.tag {
                tags::COPY_DATA | tags::FLUSH | tags::SYNC => {
                    self.forward_to_backend(&msg, true).await?;
                }
                tags::COPY_DONE | tags::COPY_FAIL => {
                    return self.forward_to_backend(&msg, true).await;
                }
                other => {
                    return Err(RepartoError::protocol(format!(
                        "unexpected message {:?} during COPY",
                        other as char
                    )))
                }
            }
        }
    }

    /// Apply the ReadyForQuery status byte to the transaction flag and
    /// fire the discipline callbacks at the boundaries.
    async fn observe_tx(&mut self, status: TxStatus) -> RepartoResult<()> {
        match status {
            TxStatus::Idle => {
                self.rst.tx_active = false;
                // Covers both explicit COMMIT/ROLLBACK and the implicit
                // end of an autocommit statement.
                if self.rst.active_backend.is_some() {
                    self.manager.tx_end(&self.ctx, &mut self.rst).await?;
                }
            }
            TxStatus::InTransaction | TxStatus::Failed => {
                // 'E' counts as still-in-transaction for binding purposes.
                if !self.rst.tx_active {
                    self.manager.tx_begin(&self.ctx, &mut self.rst).await?;
                    self.rst.tx_active = true;
                }
            }
        }
        debug_assert!(self.rst.invariants_hold());
        Ok(())
    }

    /// Report an error per policy: non-fatal errors keep the session and
    /// synthesize the ReadyForQuery the client is waiting for; fatal
    /// errors are reported and terminate the session. A dead backend is
    /// invalidated rather than released.
    async fn report(&mut self, err: RepartoError) -> RepartoResult<()> {
        if matches!(err, RepartoError::BackendIo(_)) {
            self.invalidate_backend().await;
        }
        match &err {
            RepartoError::ClientIo(_) => Err(err),
            e if e.is_fatal() => {
                let _ = self.send_error(e).await;
                Err(err)
            }
            e => {
                self.send_error(e).await.map_err(RepartoError::ClientIo)?;
                self.client
                    .send(&ready_for_query(self.last_status))
                    .await
                    .map_err(RepartoError::ClientIo)?;
                Ok(())
            }
        }
    }

    async fn invalidate_backend(&mut self) {
        if let Some(conn) = self.rst.active_backend.take() {
            if let Some(route) = &self.rst.route {
                route.pool().invalidate(conn);
            }
        }
        self.rst.tx_active = false;
        let _ = self.manager.unroute(&self.ctx, &mut self.rst).await;
    }

    async fn send_error(&mut self, err: &RepartoError) -> std::io::Result<()> {
        let msg = error_response(&err.severity().to_string(), err.sqlstate(), &err.to_string());
        self.client.send(&msg).await
    }
}
