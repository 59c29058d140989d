/// Startup-phase packets
///
/// Before a session is established the wire carries untagged packets: a
/// four-byte length (inclusive) followed by a four-byte request code. The
/// three codes the proxy answers are the v3 StartupMessage, SSLRequest, and
/// CancelRequest; GSSENCRequest gets the same 'N' refusal as SSLRequest.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use super::WireStream;

pub const PROTOCOL_V3: u32 = 196608; // 3.0
pub const SSL_REQUEST: u32 = 80877103;
pub const GSS_ENC_REQUEST: u32 = 80877104;
pub const CANCEL_REQUEST: u32 = 80877102;

/// Sane ceiling for a startup packet; parameter lists are small.
const MAX_STARTUP_LEN: usize = 16 * 1024;

/// A decoded startup-phase packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPacket {
    /// v3 StartupMessage with its key/value parameters (user, database, ...).
    Startup(StartupParams),
    /// SSLRequest or GSSENCRequest; the proxy answers 'N' to both.
    TlsRequest,
    /// Out-of-band cancel carrying the key data issued at session start.
    Cancel { pid: i32, secret: i32 },
}

/// Startup parameters sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams {
    params: FnvHashMap<String, String>,
}

impl StartupParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn database(&self) -> Option<&str> {
        // Postgres defaults the database to the user name when absent.
        self.get("database").or_else(|| self.get("user"))
    }

    pub fn application_name(&self) -> Option<&str> {
        self.get("application_name")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Read one startup-phase packet off the stream.
pub async fn read_startup_packet<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut WireStream<S>,
) -> io::Result<StartupPacket> {
    let header = stream.read_exact_raw(4).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len < 8 || len > MAX_STARTUP_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid startup packet length {}", len),
        ));
    }
    let mut body = stream.read_exact_raw(len - 4).await?;
    let code = body.get_u32();

    match code {
        SSL_REQUEST | GSS_ENC_REQUEST => Ok(StartupPacket::TlsRequest),
        CANCEL_REQUEST => {
            if body.remaining() < 8 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated cancel request",
                ));
            }
            let pid = body.get_i32();
            let secret = body.get_i32();
            Ok(StartupPacket::Cancel { pid, secret })
        }
        PROTOCOL_V3 => Ok(StartupPacket::Startup(parse_params(&body)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported protocol request code {}", other),
        )),
    }
}

fn parse_params(body: &Bytes) -> io::Result<StartupParams> {
    let mut params = StartupParams::new();
    let mut rest = &body[..];
    loop {
        let Some(key_end) = rest.iter().position(|&b| b == 0) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated startup parameter key",
            ));
        };
        if key_end == 0 {
            // Final terminator.
            break;
        }
        let key = std::str::from_utf8(&rest[..key_end])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 startup key"))?;
        rest = &rest[key_end + 1..];

        let Some(val_end) = rest.iter().position(|&b| b == 0) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated startup parameter value",
            ));
        };
        let value = std::str::from_utf8(&rest[..val_end])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 startup value"))?;
        rest = &rest[val_end + 1..];

        params.set(key, value);
    }
    Ok(params)
}

/// Serialize a v3 StartupMessage, as the backend dialer sends it.
pub fn encode_startup(params: &StartupParams) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(PROTOCOL_V3);
    let mut entries: Vec<(&str, &str)> = params.iter().collect();
    entries.sort(); // deterministic wire image
    for (key, value) in entries {
        body.extend_from_slice(key.as_bytes());
        body.put_u8(0);
        body.extend_from_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut packet = BytesMut::with_capacity(body.len() + 4);
    packet.put_u32(body.len() as u32 + 4);
    packet.extend_from_slice(&body);
    packet.freeze()
}

/// Serialize a CancelRequest packet for relaying to a backend.
pub fn encode_cancel(pid: i32, secret: i32) -> Bytes {
    let mut packet = BytesMut::with_capacity(16);
    packet.put_u32(16);
    packet.put_u32(CANCEL_REQUEST);
    packet.put_i32(pid);
    packet.put_i32(secret);
    packet.freeze()
}
