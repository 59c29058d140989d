/// Frontend acceptance: startup negotiation, rule matching, authentication
///
/// For every inbound socket the acceptor answers SSLRequest/GSSENCRequest
/// with 'N' (certificate handling lives outside the proxy), dispatches
/// CancelRequest packets out-of-band, parses the StartupMessage, matches
/// the client against the rule set, authenticates per the matched rule,
/// and sends the session greeting. The outcome carries everything the
/// relay needs to take over the wire.
use fnv::FnvHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::cancel::{CancelHandle, CancelRegistry};
use crate::core::{AuthMethod, Rule};
use crate::error::{RepartoError, RepartoResult};
use crate::protocol::messages::{
    authentication_cleartext, authentication_ok, backend_key_data, error_response,
    parameter_status, parse_password, ready_for_query, TxStatus,
};
use crate::protocol::startup::{read_startup_packet, StartupPacket, StartupParams};
use crate::protocol::{tags, WireStream};

/// Parameters the proxy reports for itself in the greeting.
const SERVER_PARAMS: &[(&str, &str)] = &[
    ("server_version", "14.5"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("standard_conforming_strings", "on"),
];

/// A fully accepted client session, ready for the relay.
pub struct EstablishedSession<S> {
    pub stream: WireStream<S>,
    pub params: StartupParams,
    pub rule: Arc<Rule>,
    pub cancel: CancelHandle,
    pub cancel_key: (i32, i32),
}

/// Run the startup handshake. `Ok(None)` means the packet was an
/// out-of-band cancel that has been dispatched; there is no session.
pub async fn establish<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    rules: &[Arc<Rule>],
    cancels: &CancelRegistry,
    cancel_dial_timeout: Duration,
) -> RepartoResult<Option<EstablishedSession<S>>> {
    let mut wire = WireStream::new(stream);

    // A client may probe TLS and GSS before sending its real startup.
    let mut attempts = 0;
    let params = loop {
        match read_startup_packet(&mut wire)
            .await
            .map_err(|e| RepartoError::protocol(e.to_string()))?
        {
            StartupPacket::TlsRequest => {
                attempts += 1;
                if attempts > 4 {
                    return Err(RepartoError::protocol("startup negotiation loop"));
                }
                wire.queue_raw(b"N");
                wire.flush().await.map_err(RepartoError::ClientIo)?;
            }
            StartupPacket::Cancel { pid, secret } => {
                cancels.dispatch((pid, secret), cancel_dial_timeout).await;
                return Ok(None);
            }
            StartupPacket::Startup(params) => break params,
        }
    };

    let user = params
        .user()
        .ok_or_else(|| RepartoError::protocol("startup message without user"))?
        .to_string();
    let database = params.database().unwrap_or(&user).to_string();

    let Some(rule) = rules.iter().find(|r| r.matches(&user, &database)).cloned() else {
        let err = RepartoError::NoMatchingRule {
            user: user.clone(),
            database: database.clone(),
        };
        reject(&mut wire, &err).await?;
        return Err(err);
    };

    authenticate(&mut wire, &rule, &user).await?;

    let cancel = CancelHandle::new();
    let cancel_key = cancels.register(cancel.clone()).await;

    wire.queue(&authentication_ok());
    for &(key, value) in SERVER_PARAMS {
        wire.queue(&parameter_status(key, value));
    }
    wire.queue(&backend_key_data(cancel_key.0, cancel_key.1));
    wire.queue(&ready_for_query(TxStatus::Idle));
    wire.flush().await.map_err(RepartoError::ClientIo)?;

    debug!(user = %user, database = %database, "client accepted");
    Ok(Some(EstablishedSession {
        stream: wire,
        params,
        rule,
        cancel,
        cancel_key,
    }))
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    wire: &mut WireStream<S>,
    rule: &Rule,
    user: &str,
) -> RepartoResult<()> {
    match rule.auth {
        AuthMethod::Trust => Ok(()),
        AuthMethod::Password => {
            wire.send(&authentication_cleartext())
                .await
                .map_err(RepartoError::ClientIo)?;

            let msg = wire
                .read_message()
                .await
                .map_err(RepartoError::ClientIo)?
                .ok_or_else(|| RepartoError::protocol("client closed during auth"))?;
            if msg.tag != tags::PASSWORD {
                return Err(RepartoError::protocol("expected password message"));
            }
            let offered = parse_password(&msg)
                .ok_or_else(|| RepartoError::protocol("malformed password message"))?;

            if rule.password.as_deref() == Some(offered) {
                Ok(())
            } else {
                let err = RepartoError::AuthFailure {
                    user: user.to_string(),
                };
                reject(wire, &err).await?;
                Err(err)
            }
        }
    }
}

async fn reject<S: AsyncRead + AsyncWrite + Unpin>(
    wire: &mut WireStream<S>,
    err: &RepartoError,
) -> RepartoResult<()> {
    warn!("rejecting client: {}", err);
    wire.send(&error_response(
        &err.severity().to_string(),
        err.sqlstate(),
        &err.to_string(),
    ))
    .await
    .map_err(RepartoError::ClientIo)
}

/// Per-rule cap on concurrently admitted sessions.
#[derive(Default)]
pub struct SessionCounter {
    counts: RwLock<FnvHashMap<String, usize>>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session under the rule, unless its limit is reached.
    pub async fn try_admit(&self, rule: &Rule) -> bool {
        let mut counts = self.counts.write().await;
        let count = counts.entry(rule.ident()).or_insert(0);
        if *count >= rule.connection_limit {
            return false;
        }
        *count += 1;
        true
    }

    pub async fn depart(&self, rule: &Rule) {
        let mut counts = self.counts.write().await;
        if let Some(count) = counts.get_mut(&rule.ident()) {
            *count = count.saturating_sub(1);
        }
    }

    pub async fn active(&self, rule: &Rule) -> usize {
        self.counts
            .read()
            .await
            .get(&rule.ident())
            .copied()
            .unwrap_or(0)
    }
}
