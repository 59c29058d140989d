/// Typed views of the messages the proxy originates or inspects
///
/// The relay forwards almost everything opaquely; these helpers cover the
/// few messages the proxy must build itself (errors, auth, the greeting,
/// console result sets) or peek into (ReadyForQuery status, backend auth
/// requests, BackendKeyData).
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{backend_tags, tags, Message};

/// Transaction status byte carried by ReadyForQuery.
/// 'I' idle, 'T' inside a transaction block, 'E' inside a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TxStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TxStatus::Idle),
            b'T' => Some(TxStatus::InTransaction),
            b'E' => Some(TxStatus::Failed),
            _ => None,
        }
    }

    pub fn wire_byte(self) -> u8 {
        match self {
            TxStatus::Idle => b'I',
            TxStatus::InTransaction => b'T',
            TxStatus::Failed => b'E',
        }
    }
}

/// Extract the status byte from a ReadyForQuery message.
pub fn ready_for_query_status(msg: &Message) -> Option<TxStatus> {
    if msg.tag != backend_tags::READY_FOR_QUERY || msg.payload.len() != 1 {
        return None;
    }
    TxStatus::from_byte(msg.payload[0])
}

pub fn ready_for_query(status: TxStatus) -> Message {
    Message::new(
        backend_tags::READY_FOR_QUERY,
        Bytes::copy_from_slice(&[status.wire_byte()]),
    )
}

/// Build an ErrorResponse with severity, SQLSTATE, and message fields.
pub fn error_response(severity: &str, sqlstate: &str, message: &str) -> Message {
    let mut payload = BytesMut::new();
    for (field, value) in [
        (b'S', severity),
        (b'V', severity),
        (b'C', sqlstate),
        (b'M', message),
    ] {
        payload.put_u8(field);
        payload.extend_from_slice(value.as_bytes());
        payload.put_u8(0);
    }
    payload.put_u8(0);
    Message::new(backend_tags::ERROR_RESPONSE, payload.freeze())
}

/// Decoded fields of an ErrorResponse / NoticeResponse payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub sqlstate: String,
    pub message: String,
}

pub fn parse_error_response(msg: &Message) -> Option<ErrorFields> {
    if msg.tag != backend_tags::ERROR_RESPONSE {
        return None;
    }
    let mut fields = ErrorFields::default();
    let mut rest = &msg.payload[..];
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0)?;
        let value = std::str::from_utf8(&tail[..end]).ok()?;
        match field {
            b'S' => fields.severity = value.to_string(),
            b'C' => fields.sqlstate = value.to_string(),
            b'M' => fields.message = value.to_string(),
            _ => {}
        }
        rest = &tail[end + 1..];
    }
    Some(fields)
}

// ── Authentication ──────────────────────────────────────────────────

pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT: i32 = 3;
pub const AUTH_MD5: i32 = 5;
pub const AUTH_SASL: i32 = 10;

pub fn authentication_ok() -> Message {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_i32(AUTH_OK);
    Message::new(backend_tags::AUTHENTICATION, payload.freeze())
}

pub fn authentication_cleartext() -> Message {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_i32(AUTH_CLEARTEXT);
    Message::new(backend_tags::AUTHENTICATION, payload.freeze())
}

/// Auth request code from a backend Authentication message.
pub fn authentication_code(msg: &Message) -> Option<i32> {
    if msg.tag != backend_tags::AUTHENTICATION || msg.payload.len() < 4 {
        return None;
    }
    let mut p = msg.payload.clone();
    Some(p.get_i32())
}

/// Client PasswordMessage ('p') carrying a NUL-terminated password.
pub fn password_message(password: &str) -> Message {
    let mut payload = BytesMut::with_capacity(password.len() + 1);
    payload.extend_from_slice(password.as_bytes());
    payload.put_u8(0);
    Message::new(tags::PASSWORD, payload.freeze())
}

pub fn parse_password(msg: &Message) -> Option<&str> {
    if msg.tag != tags::PASSWORD {
        return None;
    }
    let bytes = msg.payload.strip_suffix(&[0u8]).unwrap_or(&msg.payload);
    std::str::from_utf8(bytes).ok()
}

// ── Session greeting ────────────────────────────────────────────────

pub fn parameter_status(key: &str, value: &str) -> Message {
    let mut payload = BytesMut::new();
    payload.extend_from_slice(key.as_bytes());
    payload.put_u8(0);
    payload.extend_from_slice(value.as_bytes());
    payload.put_u8(0);
    Message::new(backend_tags::PARAMETER_STATUS, payload.freeze())
}

pub fn backend_key_data(pid: i32, secret: i32) -> Message {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_i32(pid);
    payload.put_i32(secret);
    Message::new(backend_tags::BACKEND_KEY_DATA, payload.freeze())
}

pub fn parse_backend_key_data(msg: &Message) -> Option<(i32, i32)> {
    if msg.tag != backend_tags::BACKEND_KEY_DATA || msg.payload.len() != 8 {
        return None;
    }
    let mut p = msg.payload.clone();
    Some((p.get_i32(), p.get_i32()))
}

// ── Query / result-set messages (console and replay paths) ──────────

pub fn query(sql: &str) -> Message {
    let mut payload = BytesMut::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.put_u8(0);
    Message::new(tags::QUERY, payload.freeze())
}

/// SQL text of a simple Query message, without the trailing NUL.
pub fn query_text(msg: &Message) -> Option<&str> {
    if msg.tag != tags::QUERY {
        return None;
    }
    let bytes = msg.payload.strip_suffix(&[0u8]).unwrap_or(&msg.payload);
    std::str::from_utf8(bytes).ok()
}

/// Query text of a Parse message: name NUL query NUL param-count...
pub fn parse_statement_text(msg: &Message) -> Option<&str> {
    if msg.tag != tags::PARSE {
        return None;
    }
    let name_end = msg.payload.iter().position(|&b| b == 0)?;
    let rest = &msg.payload[name_end + 1..];
    let query_end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..query_end]).ok()
}

pub fn command_complete(tag: &str) -> Message {
    let mut payload = BytesMut::with_capacity(tag.len() + 1);
    payload.extend_from_slice(tag.as_bytes());
    payload.put_u8(0);
    Message::new(backend_tags::COMMAND_COMPLETE, payload.freeze())
}

/// Minimal RowDescription for all-text columns, as the console emits.
pub fn row_description(columns: &[&str]) -> Message {
    let mut payload = BytesMut::new();
    payload.put_i16(columns.len() as i16);
    for name in columns {
        payload.extend_from_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_i32(0); // table oid
        payload.put_i16(0); // attnum
        payload.put_i32(25); // text oid
        payload.put_i16(-1); // typlen
        payload.put_i32(-1); // atttypmod
        payload.put_i16(0); // text format
    }
    Message::new(backend_tags::ROW_DESCRIPTION, payload.freeze())
}

pub fn data_row(values: &[&str]) -> Message {
    let mut payload = BytesMut::new();
    payload.put_i16(values.len() as i16);
    for value in values {
        payload.put_i32(value.len() as i32);
        payload.extend_from_slice(value.as_bytes());
    }
    Message::new(backend_tags::DATA_ROW, payload.freeze())
}

pub fn terminate() -> Message {
    Message::new(tags::TERMINATE, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_status_bytes() {
        assert_eq!(TxStatus::from_byte(b'I'), Some(TxStatus::Idle));
        assert_eq!(TxStatus::from_byte(b'T'), Some(TxStatus::InTransaction));
        assert_eq!(TxStatus::from_byte(b'E'), Some(TxStatus::Failed));
        assert_eq!(TxStatus::from_byte(b'X'), None);
        assert_eq!(TxStatus::InTransaction.wire_byte(), b'T');
    }

    #[test]
    fn test_ready_for_query_roundtrip() {
        let msg = ready_for_query(TxStatus::Failed);
        assert_eq!(ready_for_query_status(&msg), Some(TxStatus::Failed));

        let bogus = Message::new(backend_tags::READY_FOR_QUERY, Bytes::from_static(b"TT"));
        assert_eq!(ready_for_query_status(&bogus), None);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let msg = error_response("FATAL", "25001", "cannot switch shard in transaction");
        let fields = parse_error_response(&msg).unwrap();
        assert_eq!(fields.severity, "FATAL");
        assert_eq!(fields.sqlstate, "25001");
        assert_eq!(fields.message, "cannot switch shard in transaction");
    }

    #[test]
    fn test_authentication_codes() {
        assert_eq!(authentication_code(&authentication_ok()), Some(AUTH_OK));
        assert_eq!(
            authentication_code(&authentication_cleartext()),
            Some(AUTH_CLEARTEXT)
        );
    }

    #[test]
    fn test_password_roundtrip() {
        let msg = password_message("hunter2");
        assert_eq!(parse_password(&msg), Some("hunter2"));
    }

    #[test]
    fn test_backend_key_data_roundtrip() {
        let msg = backend_key_data(77, 123456);
        assert_eq!(parse_backend_key_data(&msg), Some((77, 123456)));
    }

    #[test]
    fn test_query_text() {
        let msg = query("SELECT * FROM t");
        assert_eq!(query_text(&msg), Some("SELECT * FROM t"));
    }

    #[test]
    fn test_parse_statement_text() {
        // name "s1", query "SELECT 1", zero parameter types
        let mut payload = BytesMut::new();
        payload.extend_from_slice(b"s1\0SELECT 1\0");
        payload.put_i16(0);
        let msg = Message::new(tags::PARSE, payload.freeze());
        assert_eq!(parse_statement_text(&msg), Some("SELECT 1"));
    }

    #[test]
    fn test_row_description_column_count() {
        let msg = row_description(&["shard", "hosts"]);
        assert_eq!(msg.tag, backend_tags::ROW_DESCRIPTION);
        assert_eq!(&msg.payload[..2], &[0, 2]);
    }

    #[test]
    fn test_data_row_values() {
        let msg = data_row(&["sh1", "10.0.0.1:5432"]);
        assert_eq!(msg.tag, backend_tags::DATA_ROW);
        assert_eq!(&msg.payload[..2], &[0, 2]);
    }
}
