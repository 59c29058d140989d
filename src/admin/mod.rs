/// Administrative console
///
/// A second listener speaks the same wire protocol and executes a small
/// SQL-like DDL against the shared shard set and routing entries:
///
///   SHOW SHARDS | SHOW ROUTES | SHOW POOLS
///   ADD SHARD <name> HOSTS <h1,h2,...> [USER <u>] [PASSWORD <p>] [DATABASE <d>]
///   DROP SHARD <name>
///   ADD ROUTE TABLE <t> SHARD <s>
///   ADD ROUTE TABLE <t> COLUMN <c> RANGE <low> <high> SHARD <s>
///   DROP ROUTE TABLE <t>
///
/// Mutations become visible to new client connections only; relays keep
/// the rules they were created with. The optional init_sql file replays
/// through the same command processor before the listeners start.
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::core::pool::PoolRegistry;
use crate::core::{Shard, TlsPolicy};
use crate::error::{RepartoError, RepartoResult};
use crate::protocol::messages::{
    authentication_ok, command_complete, data_row, error_response, query_text, ready_for_query,
    row_description, TxStatus,
};
use crate::protocol::startup::{read_startup_packet, StartupPacket};
use crate::protocol::{tags, WireStream};
use crate::router::{KeyRange, RouteTarget, ShardKeyRouter};

/// Shared structures the console mutates.
pub struct AdminState {
    pub pools: Arc<PoolRegistry>,
    pub router: Arc<ShardKeyRouter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ShowShards,
    ShowRoutes,
    ShowPools,
    AddShard(Shard),
    DropShard(String),
    AddRoute { table: String, target: RouteTarget },
    DropRoute(String),
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminResponse {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Complete(String),
}

/// Tokenize and parse one console command.
pub fn parse_command(line: &str) -> Result<AdminCommand, String> {
    let line = line.trim().trim_end_matches(';');
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();

    match upper.as_slice() {
        [s, obj] if s == "SHOW" => match obj.as_str() {
            "SHARDS" => Ok(AdminCommand::ShowShards),
            "ROUTES" => Ok(AdminCommand::ShowRoutes),
            "POOLS" => Ok(AdminCommand::ShowPools),
            other => Err(format!("unknown SHOW target: {}", other)),
        },
        [a, s, ..] if a == "ADD" && s == "SHARD" => parse_add_shard(&tokens, &upper),
        [d, s, _] if d == "DROP" && s == "SHARD" => {
            Ok(AdminCommand::DropShard(tokens[2].to_string()))
        }
        [a, r, t, ..] if a == "ADD" && r == "ROUTE" && t == "TABLE" => {
            parse_add_route(&tokens, &upper)
        }
        [d, r, t, _] if d == "DROP" && r == "ROUTE" && t == "TABLE" => {
            Ok(AdminCommand::DropRoute(tokens[3].to_string()))
        }
        [] => Err("empty command".to_string()),
        _ => Err(format!("unrecognized command: {}", line)),
    }
}

fn parse_add_shard(tokens: &[&str], upper: &[String]) -> Result<AdminCommand, String> {
    if tokens.len() < 5 {
        return Err("usage: ADD SHARD <name> HOSTS <h1,h2,...>".to_string());
    }
    let name = tokens[2].to_string();
    if upper[3] != "HOSTS" {
        return Err("expected HOSTS after shard name".to_string());
    }
    let hosts: Vec<String> = tokens[4].split(',').map(str::to_string).collect();
    for host in &hosts {
        host.parse::<std::net::SocketAddr>()
            .map_err(|_| format!("invalid host address: {}", host))?;
    }

    let mut user = "postgres".to_string();
    let mut password = None;
    let mut database = "postgres".to_string();
    let mut i = 5;
    while i < tokens.len() {
        match upper[i].as_str() {
            "USER" => {
                user = tokens.get(i + 1).ok_or("USER needs a value")?.to_string();
            }
            "PASSWORD" => {
                password = Some(tokens.get(i + 1).ok_or("PASSWORD needs a value")?.to_string());
            }
            "DATABASE" => {
                database = tokens
                    .get(i + 1)
                    .ok_or("DATABASE needs a value")?
                    .to_string();
            }
            other => return Err(format!("unexpected token: {}", other)),
        }
        i += 2;
    }

    Ok(AdminCommand::AddShard(Shard {
        name,
        hosts,
        user,
        password,
        database,
        tls: TlsPolicy::Disable,
        max_connections: 20,
    }))
}

fn parse_add_route(tokens: &[&str], upper: &[String]) -> Result<AdminCommand, String> {
    // ADD ROUTE TABLE <t> SHARD <s>
    // ADD ROUTE TABLE <t> COLUMN <c> RANGE <low> <high> SHARD <s>
    let table = tokens
        .get(3)
        .ok_or("usage: ADD ROUTE TABLE <table> ...")?
        .to_string();
    match upper.get(4).map(String::as_str) {
        Some("SHARD") => {
            let shard = tokens.get(5).ok_or("SHARD needs a value")?.to_string();
            Ok(AdminCommand::AddRoute {
                table,
                target: RouteTarget::Shard(shard),
            })
        }
        Some("COLUMN") => {
            let column = tokens.get(5).ok_or("COLUMN needs a value")?.to_lowercase();
            if upper.get(6).map(String::as_str) != Some("RANGE") {
                return Err("expected RANGE after column".to_string());
            }
            let low: i64 = tokens
                .get(7)
                .ok_or("RANGE needs a low bound")?
                .parse()
                .map_err(|_| "low bound must be an integer".to_string())?;
            let high: i64 = tokens
                .get(8)
                .ok_or("RANGE needs a high bound")?
                .parse()
                .map_err(|_| "high bound must be an integer".to_string())?;
            if low > high {
                return Err(format!("inverted range {}..{}", low, high));
            }
            if upper.get(9).map(String::as_str) != Some("SHARD") {
                return Err("expected SHARD after range".to_string());
            }
            let shard = tokens.get(10).ok_or("SHARD needs a value")?.to_string();
            Ok(AdminCommand::AddRoute {
                table,
                target: RouteTarget::KeyRanges {
                    column,
                    ranges: vec![KeyRange { low, high, shard }],
                },
            })
        }
        _ => Err("expected SHARD or COLUMN after table name".to_string()),
    }
}

/// Execute a parsed command against the shared state.
pub async fn execute(state: &AdminState, cmd: AdminCommand) -> Result<AdminResponse, String> {
    match cmd {
        AdminCommand::ShowShards => {
            let mut rows = Vec::new();
            for name in state.pools.shard_names().await {
                if let Some(shard) = state.pools.shard_descriptor(&name).await {
                    rows.push(vec![
                        shard.name.clone(),
                        shard.hosts.join(","),
                        shard.database.clone(),
                        shard.max_connections.to_string(),
                    ]);
                }
            }
            Ok(AdminResponse::Rows {
                columns: vec![
                    "shard".to_string(),
                    "hosts".to_string(),
                    "database".to_string(),
                    "max_connections".to_string(),
                ],
                rows,
            })
        }
        AdminCommand::ShowRoutes => {
            let rows = state
                .router
                .entries()
                .await
                .into_iter()
                .map(|(table, target)| vec![table, target.to_string()])
                .collect();
            Ok(AdminResponse::Rows {
                columns: vec!["table".to_string(), "target".to_string()],
                rows,
            })
        }
        AdminCommand::ShowPools => {
            let rows = state
                .pools
                .all_stats()
                .await
                .into_iter()
                .map(|s| {
                    vec![
                        s.shard,
                        s.idle.to_string(),
                        s.outstanding.to_string(),
                        s.max.to_string(),
                    ]
                })
                .collect();
            Ok(AdminResponse::Rows {
                columns: vec![
                    "shard".to_string(),
                    "idle".to_string(),
                    "outstanding".to_string(),
                    "max".to_string(),
                ],
                rows,
            })
        }
        AdminCommand::AddShard(shard) => {
            let name = shard.name.clone();
            if state.pools.add_shard(shard).await {
                info!(shard = %name, "shard added");
                Ok(AdminResponse::Complete("ADD SHARD".to_string()))
            } else {
                Err(format!("shard {} already exists", name))
            }
        }
        AdminCommand::DropShard(name) => {
            if state.pools.drop_shard(&name).await {
                info!(shard = %name, "shard dropped");
                Ok(AdminResponse::Complete("DROP SHARD".to_string()))
            } else {
                Err(format!("unknown shard {}", name))
            }
        }
        AdminCommand::AddRoute { table, target } => {
            if let RouteTarget::Shard(shard) = &target {
                if !state.pools.has_shard(shard).await {
                    return Err(format!("unknown shard {}", shard));
                }
            }
            if let RouteTarget::KeyRanges { ranges, .. } = &target {
                for range in ranges {
                    if !state.pools.has_shard(&range.shard).await {
                        return Err(format!("unknown shard {}", range.shard));
                    }
                }
            }
            if state.router.add_entry(&table, target).await {
                info!(table = %table, "route added");
                Ok(AdminResponse::Complete("ADD ROUTE".to_string()))
            } else {
                Err(format!("route for table {} already exists", table))
            }
        }
        AdminCommand::DropRoute(table) => {
            if state.router.drop_entry(&table).await {
                info!(table = %table, "route dropped");
                Ok(AdminResponse::Complete("DROP ROUTE".to_string()))
            } else {
                Err(format!("no route for table {}", table))
            }
        }
    }
}

/// Serve one console connection: trust-accept the startup, then execute
/// Query messages until the client terminates.
pub async fn serve_console<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    state: &AdminState,
) -> RepartoResult<()> {
    let mut wire = WireStream::new(stream);

    loop {
        match read_startup_packet(&mut wire)
            .await
            .map_err(|e| RepartoError::protocol(e.to_string()))?
        {
            StartupPacket::TlsRequest => {
                wire.queue_raw(b"N");
                wire.flush().await.map_err(RepartoError::ClientIo)?;
            }
            StartupPacket::Cancel { .. } => return Ok(()),
            StartupPacket::Startup(_) => break,
        }
    }

    wire.queue(&authentication_ok());
    wire.queue(&ready_for_query(TxStatus::Idle));
    wire.flush().await.map_err(RepartoError::ClientIo)?;

    loop {
        let msg = match wire.read_message().await.map_err(RepartoError::ClientIo)? {
            Some(msg) => msg,
            None => return Ok(()),
        };
        match msg.tag {
            tags::TERMINATE => return Ok(()),
            tags::QUERY => {
                let line = query_text(&msg).unwrap_or("").to_string();
                match parse_command(&line) {
                    Ok(cmd) => match execute(state, cmd).await {
                        Ok(response) => queue_response(&mut wire, response),
                        Err(detail) => {
                            wire.queue(&error_response("ERROR", "42601", &detail));
                        }
                    },
                    Err(detail) => {
                        wire.queue(&error_response("ERROR", "42601", &detail));
                    }
                }
                wire.queue(&ready_for_query(TxStatus::Idle));
                wire.flush().await.map_err(RepartoError::ClientIo)?;
            }
            tags::SYNC => {
                wire.send(&ready_for_query(TxStatus::Idle))
                    .await
                    .map_err(RepartoError::ClientIo)?;
            }
            _ => {
                wire.queue(&error_response(
                    "ERROR",
                    "0A000",
                    "console only accepts simple queries",
                ));
                wire.queue(&ready_for_query(TxStatus::Idle));
                wire.flush().await.map_err(RepartoError::ClientIo)?;
            }
        }
    }
}

fn queue_response<S: AsyncRead + AsyncWrite + Unpin>(
    wire: &mut WireStream<S>,
    response: AdminResponse,
) {
    match response {
        AdminResponse::Rows { columns, rows } => {
            let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
            wire.queue(&row_description(&cols));
            let count = rows.len();
            for row in rows {
                let values: Vec<&str> = row.iter().map(String::as_str).collect();
                wire.queue(&data_row(&values));
            }
            wire.queue(&command_complete(&format!("SELECT {}", count)));
        }
        AdminResponse::Complete(tag) => {
            wire.queue(&command_complete(&tag));
        }
    }
}

/// Replay an init file through the command processor: one command per
/// line, '--' comments and blank lines skipped. Any failure aborts
/// startup, matching the strictness of config validation.
pub async fn replay_init_sql(path: &Path, state: &AdminState) -> RepartoResult<()> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RepartoError::Config(crate::config::ConfigError::IoError(format!(
            "init_sql {}: {}",
            path.display(),
            e
        )))
    })?;

    let mut executed = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            continue;
        }
        let cmd = parse_command(line)
            .map_err(|e| RepartoError::Config(crate::config::ConfigError::ValidationError(e)))?;
        if let Err(e) = execute(state, cmd).await {
            warn!(line = %line, "init_sql command failed: {}", e);
            return Err(RepartoError::Config(
                crate::config::ConfigError::ValidationError(e),
            ));
        }
        executed += 1;
    }
    info!(executed, path = %path.display(), "replayed init_sql");
    Ok(())
}
