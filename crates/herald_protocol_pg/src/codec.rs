use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use herald_common::error::ProtocolError;

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196608;
const SSL_REQUEST_CODE: i32 = 80877103;
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest accepted startup packet, matching the upstream server's limit.
const MAX_STARTUP_PACKET_SIZE: usize = 10_000;
/// Largest accepted tagged frame. Every message the proxy handles is tiny;
/// anything bigger is a protocol violation.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Write buffer size. Multi-frame responses coalesce into one system call.
const WRITE_BUFFER_SIZE: usize = 128;

/// Raw PG frontend (client→server) message types the proxy consumes.
#[derive(Debug)]
pub enum FrontendMessage {
    /// Initial startup message (no type byte).
    Startup {
        version: i32,
        params: HashMap<String, String>,
    },
    /// SSL request (special startup message).
    SslRequest,
    /// Cancel request (special startup message); closed silently.
    CancelRequest,
    /// Password response during auth ('p'). Raw payload, trailing NUL
    /// included, so MD5 answers compare byte-for-byte.
    Password(Vec<u8>),
    /// Simple query ('Q'). Raw bytes; UTF-8 validation belongs to the
    /// query parser.
    Query(Vec<u8>),
    /// Parse ('P'), extended query.
    Parse {
        statement: String,
        query: Vec<u8>,
        param_types: Vec<i32>,
    },
    /// Bind ('B'), extended query.
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
    },
    /// Describe ('D').
    Describe { kind: u8, name: String },
    /// Execute ('E').
    Execute { portal: String, max_rows: i32 },
    /// Sync ('S').
    Sync,
    /// Terminate ('X').
    Terminate,
}

impl FrontendMessage {
    /// Message name for diagnostics. Never includes payload data, so it is
    /// safe to echo into logs and error responses.
    pub fn name(&self) -> &'static str {
        match self {
            FrontendMessage::Startup { .. } => "StartupMessage",
            FrontendMessage::SslRequest => "SSLRequest",
            FrontendMessage::CancelRequest => "CancelRequest",
            FrontendMessage::Password(_) => "PasswordMessage",
            FrontendMessage::Query(_) => "Query",
            FrontendMessage::Parse { .. } => "Parse",
            FrontendMessage::Bind { .. } => "Bind",
            FrontendMessage::Describe { .. } => "Describe",
            FrontendMessage::Execute { .. } => "Execute",
            FrontendMessage::Sync => "Sync",
            FrontendMessage::Terminate => "Terminate",
        }
    }
}

/// Raw PG backend (server→client) message types the proxy emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationMd5Password {
        salt: [u8; 4],
    },
    /// Parameter status ('S').
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Ready for query ('Z'). The proxy has no transactions; status is
    /// always idle.
    ReadyForQuery,
    /// Empty query response ('I').
    EmptyQueryResponse,
    /// Row description ('T').
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    /// Data row ('D').
    DataRow {
        values: Vec<Option<Vec<u8>>>,
    },
    /// Command complete ('C').
    CommandComplete {
        tag: String,
    },
    ParseComplete,
    BindComplete,
    NoData,
    /// Asynchronous notification ('A').
    NotificationResponse {
        pid: i32,
        channel: String,
        payload: String,
    },
    /// Error response ('E').
    ErrorResponse {
        severity: &'static str,
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format_code: i16,
}

/// Encode a backend message into bytes.
pub fn encode_message(msg: &BackendMessage) -> BytesMut {
    let mut buf = BytesMut::new();

    match msg {
        BackendMessage::AuthenticationOk => {
            buf.put_u8(b'R');
            buf.put_i32(8);
            buf.put_i32(0);
        }
        BackendMessage::AuthenticationMd5Password { salt } => {
            buf.put_u8(b'R');
            buf.put_i32(12);
            buf.put_i32(5);
            buf.put_slice(salt);
        }
        BackendMessage::ParameterStatus { name, value } => {
            let len = 4 + name.len() + 1 + value.len() + 1;
            buf.put_u8(b'S');
            buf.put_i32(len as i32);
            write_cstring(&mut buf, name);
            write_cstring(&mut buf, value);
        }
        BackendMessage::ReadyForQuery => {
            buf.put_u8(b'Z');
            buf.put_i32(5);
            buf.put_u8(b'I');
        }
        BackendMessage::EmptyQueryResponse => {
            buf.put_u8(b'I');
            buf.put_i32(4);
        }
        BackendMessage::RowDescription { fields } => {
            let mut body = BytesMut::new();
            body.put_i16(fields.len() as i16);
            for field in fields {
                write_cstring(&mut body, &field.name);
                body.put_i32(field.table_oid);
                body.put_i16(field.column_attr);
                body.put_i32(field.type_oid);
                body.put_i16(field.type_len);
                body.put_i32(field.type_modifier);
                body.put_i16(field.format_code);
            }
            buf.put_u8(b'T');
            buf.put_i32(4 + body.len() as i32);
            buf.extend_from_slice(&body);
        }
        BackendMessage::DataRow { values } => {
            let mut body = BytesMut::new();
            body.put_i16(values.len() as i16);
            for val in values {
                match val {
                    Some(bytes) => {
                        body.put_i32(bytes.len() as i32);
                        body.put_slice(bytes);
                    }
                    None => body.put_i32(-1),
                }
            }
            buf.put_u8(b'D');
            buf.put_i32(4 + body.len() as i32);
            buf.extend_from_slice(&body);
        }
        BackendMessage::CommandComplete { tag } => {
            let len = 4 + tag.len() + 1;
            buf.put_u8(b'C');
            buf.put_i32(len as i32);
            write_cstring(&mut buf, tag);
        }
        BackendMessage::ParseComplete => {
            buf.put_u8(b'1');
            buf.put_i32(4);
        }
        BackendMessage::BindComplete => {
            buf.put_u8(b'2');
            buf.put_i32(4);
        }
        BackendMessage::NoData => {
            buf.put_u8(b'n');
            buf.put_i32(4);
        }
        BackendMessage::NotificationResponse {
            pid,
            channel,
            payload,
        } => {
            let body_len = 4 + channel.len() + 1 + payload.len() + 1;
            buf.put_u8(b'A');
            buf.put_i32(4 + body_len as i32);
            buf.put_i32(*pid);
            write_cstring(&mut buf, channel);
            write_cstring(&mut buf, payload);
        }
        BackendMessage::ErrorResponse {
            severity,
            code,
            message,
        } => {
            let mut body = BytesMut::new();
            body.put_u8(b'S');
            write_cstring(&mut body, severity);
            body.put_u8(b'C');
            write_cstring(&mut body, code);
            body.put_u8(b'M');
            write_cstring(&mut body, message);
            body.put_u8(0);

            buf.put_u8(b'E');
            buf.put_i32(4 + body.len() as i32);
            buf.extend_from_slice(&body);
        }
    }

    buf
}

/// Reads one frame at a time from the client half of the connection.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one handshake frame: a bare 4-byte length with no type tag.
    pub async fn next_startup(&mut self) -> Result<FrontendMessage, ProtocolError> {
        let len = match self.inner.read_i32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        if !(8..=MAX_STARTUP_PACKET_SIZE).contains(&len) {
            return Err(ProtocolError::InvalidMessage(format!(
                "invalid startup packet length {}",
                len
            )));
        }
        let mut payload = self.read_payload(len - 4).await?;

        let version = payload.get_i32();
        match version {
            SSL_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
            CANCEL_REQUEST_CODE => Ok(FrontendMessage::CancelRequest),
            PROTOCOL_VERSION => {
                let mut params = HashMap::new();
                while payload.has_remaining() {
                    let key = read_cstring(&mut payload)?;
                    if key.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut payload)?;
                    params.insert(key, value);
                }
                Ok(FrontendMessage::Startup { version, params })
            }
            other => Err(ProtocolError::InvalidMessage(format!(
                "unsupported protocol version {}",
                other
            ))),
        }
    }

    /// Read one tagged frame.
    pub async fn next(&mut self) -> Result<FrontendMessage, ProtocolError> {
        let (tag, mut payload) = self.next_frame().await?;

        match tag {
            b'Q' => Ok(FrontendMessage::Query(read_cstring_bytes(&mut payload)?)),
            b'p' => Ok(FrontendMessage::Password(payload.to_vec())),
            b'P' => {
                let statement = read_cstring(&mut payload)?;
                let query = read_cstring_bytes(&mut payload)?;
                let num_types = read_i16(&mut payload)?;
                let mut param_types = Vec::new();
                for _ in 0..num_types {
                    param_types.push(read_i32(&mut payload)?);
                }
                Ok(FrontendMessage::Parse {
                    statement,
                    query,
                    param_types,
                })
            }
            b'B' => {
                let portal = read_cstring(&mut payload)?;
                let statement = read_cstring(&mut payload)?;
                let num_formats = read_i16(&mut payload)?;
                let mut param_formats = Vec::new();
                for _ in 0..num_formats {
                    param_formats.push(read_i16(&mut payload)?);
                }
                let num_values = read_i16(&mut payload)?;
                let mut param_values = Vec::new();
                for _ in 0..num_values {
                    let vlen = read_i32(&mut payload)?;
                    if vlen < 0 {
                        param_values.push(None);
                    } else {
                        if payload.remaining() < vlen as usize {
                            return Err(truncated());
                        }
                        let mut val = vec![0u8; vlen as usize];
                        payload.copy_to_slice(&mut val);
                        param_values.push(Some(val));
                    }
                }
                Ok(FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    param_values,
                })
            }
            b'D' => {
                if !payload.has_remaining() {
                    return Err(truncated());
                }
                let kind = payload.get_u8();
                let name = read_cstring(&mut payload)?;
                Ok(FrontendMessage::Describe { kind, name })
            }
            b'E' => {
                let portal = read_cstring(&mut payload)?;
                let max_rows = read_i32(&mut payload)?;
                Ok(FrontendMessage::Execute { portal, max_rows })
            }
            b'S' => Ok(FrontendMessage::Sync),
            b'X' => Ok(FrontendMessage::Terminate),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Consume frames of any type until a `Sync` has been read. Used after
    /// a failed `Parse` to resynchronize with the client.
    pub async fn discard_until_sync(&mut self) -> Result<(), ProtocolError> {
        loop {
            let (tag, _) = self.next_frame().await?;
            if tag == b'S' {
                return Ok(());
            }
        }
    }

    async fn next_frame(&mut self) -> Result<(u8, BytesMut), ProtocolError> {
        let tag = match self.inner.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        let len = self.inner.read_i32().await? as usize;
        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(ProtocolError::InvalidMessage(format!(
                "invalid message length {}",
                len
            )));
        }
        let payload = self.read_payload(len - 4).await?;
        Ok((tag, payload))
    }

    async fn read_payload(&mut self, len: usize) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::zeroed(len);
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}

/// Writes frames through a small buffered writer so that multi-frame
/// responses coalesce into one system call.
pub struct MessageWriter<W: AsyncWrite + Unpin> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(WRITE_BUFFER_SIZE, inner),
        }
    }

    pub async fn send(&mut self, msg: &BackendMessage) -> std::io::Result<()> {
        self.inner.write_all(&encode_message(msg)).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    /// The single-byte response rejecting an `SSLRequest`.
    pub async fn send_ssl_reject(&mut self) -> std::io::Result<()> {
        self.inner.write_all(b"N").await
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

fn read_cstring(buf: &mut BytesMut) -> Result<String, ProtocolError> {
    let bytes = read_cstring_bytes(buf)?;
    String::from_utf8(bytes)
        .map_err(|e| ProtocolError::InvalidMessage(format!("invalid UTF-8 in string: {}", e)))
}

fn read_cstring_bytes(buf: &mut BytesMut) -> Result<Vec<u8>, ProtocolError> {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => {
            let bytes = buf[..pos].to_vec();
            buf.advance(pos + 1);
            Ok(bytes)
        }
        None => Err(ProtocolError::InvalidMessage(
            "no null terminator in string".to_string(),
        )),
    }
}

fn read_i16(buf: &mut BytesMut) -> Result<i16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut BytesMut) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn truncated() -> ProtocolError {
    ProtocolError::InvalidMessage("message payload truncated".to_string())
}

fn write_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
