//! Vyx control-stream protocol: frame model, binary codec.
//!
//! Every message between agent and exchange server travels on a single
//! bidirectional stream as a length-prefixed binary frame:
//!
//! ```text
//! [1 byte: type][2 bytes: id len][id][2 bytes: addr len][addr][4 bytes: data len][data]
//! ```
//!
//! All integers are big-endian. `id` and `addr` are UTF-8 and may be empty;
//! `data` is raw bytes. Unknown type codes are parsed like any other frame
//! (the format is self-delimiting) and left to the dispatch layer, which
//! warns and continues.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame type codes (1 byte on the wire).
pub const TYPE_AUTH: u8 = 0;
pub const TYPE_AUTH_SUCCESS: u8 = 1;
pub const TYPE_ERROR: u8 = 2;
pub const TYPE_CONNECT: u8 = 3;
pub const TYPE_CONNECTED: u8 = 4;
pub const TYPE_DATA: u8 = 5;
pub const TYPE_CLOSE: u8 = 6;
pub const TYPE_PING: u8 = 7;
pub const TYPE_PONG: u8 = 8;
/// Reserved; never emitted by the agent.
pub const TYPE_ADDRESS: u8 = 9;
/// One-shot out-of-band user linkage, sent by the local auth receiver.
pub const TYPE_UID_REGISTER: u8 = 10;

/// Maximum accepted `data` length. Anything larger is a stream error, not
/// a frame: the server's flow control keeps real payloads far below this.
pub const MAX_DATA_LEN: u32 = 64 * 1024 * 1024;

/// A single control-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub id: String,
    pub addr: String,
    pub data: Vec<u8>,
}

impl Frame {
    /// Frame with only a type and id (CONNECTED, CLOSE, PING, PONG).
    pub fn control(frame_type: u8, id: impl Into<String>) -> Self {
        Self {
            frame_type,
            id: id.into(),
            addr: String::new(),
            data: Vec::new(),
        }
    }

    pub fn auth(token: impl Into<String>, metadata: Vec<u8>) -> Self {
        Self {
            frame_type: TYPE_AUTH,
            id: token.into(),
            addr: String::new(),
            data: metadata,
        }
    }

    pub fn connected(id: impl Into<String>) -> Self {
        Self::control(TYPE_CONNECTED, id)
    }

    pub fn data(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            frame_type: TYPE_DATA,
            id: id.into(),
            addr: String::new(),
            data,
        }
    }

    pub fn close(id: impl Into<String>) -> Self {
        Self::control(TYPE_CLOSE, id)
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::control(TYPE_PONG, id)
    }

    pub fn uid_register(user_id: impl Into<String>) -> Self {
        Self::control(TYPE_UID_REGISTER, user_id)
    }

    /// Human-readable type name, for logs only. The wire format is the
    /// byte code; strings never leave the logging boundary.
    pub fn type_name(&self) -> &'static str {
        type_name(self.frame_type)
    }
}

/// Log label for a frame type byte.
pub fn type_name(frame_type: u8) -> &'static str {
    match frame_type {
        TYPE_AUTH => "auth",
        TYPE_AUTH_SUCCESS => "auth_success",
        TYPE_ERROR => "error",
        TYPE_CONNECT => "connect",
        TYPE_CONNECTED => "connected",
        TYPE_DATA => "data",
        TYPE_CLOSE => "close",
        TYPE_PING => "ping",
        TYPE_PONG => "pong",
        TYPE_ADDRESS => "address",
        TYPE_UID_REGISTER => "uid-register",
        _ => "unknown",
    }
}

/// Errors that can occur when writing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// `id` exceeds the u16 length prefix.
    IdTooLong(usize),
    /// `addr` exceeds the u16 length prefix.
    AddrTooLong(usize),
    /// `data` exceeds [`MAX_DATA_LEN`].
    DataTooLarge(usize),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdTooLong(n) => write!(f, "frame id too long: {n} bytes"),
            Self::AddrTooLong(n) => write!(f, "frame addr too long: {n} bytes"),
            Self::DataTooLarge(n) => write!(f, "frame data too large: {n} bytes"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Errors that can occur when reading a frame from a stream.
#[derive(Debug)]
pub enum ReadError {
    Io(std::io::Error),
    /// Declared data length exceeds [`MAX_DATA_LEN`]; the stream is
    /// desynchronized or hostile and must be torn down.
    DataTooLarge(u32),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "frame read: {e}"),
            Self::DataTooLarge(n) => write!(f, "frame data length {n} exceeds limit"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::DataTooLarge(_) => None,
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Encode a frame into `buf`.
///
/// # Errors
/// Field length overflow; the buffer is left untouched on error.
#[allow(clippy::cast_possible_truncation)]
pub fn write_frame(buf: &mut BytesMut, frame: &Frame) -> Result<(), WriteError> {
    if frame.id.len() > u16::MAX as usize {
        return Err(WriteError::IdTooLong(frame.id.len()));
    }
    if frame.addr.len() > u16::MAX as usize {
        return Err(WriteError::AddrTooLong(frame.addr.len()));
    }
    if frame.data.len() > MAX_DATA_LEN as usize {
        return Err(WriteError::DataTooLarge(frame.data.len()));
    }

    buf.reserve(1 + 2 + frame.id.len() + 2 + frame.addr.len() + 4 + frame.data.len());
    buf.put_u8(frame.frame_type);
    buf.put_u16(frame.id.len() as u16);
    buf.put_slice(frame.id.as_bytes());
    buf.put_u16(frame.addr.len() as u16);
    buf.put_slice(frame.addr.as_bytes());
    buf.put_u32(frame.data.len() as u32);
    buf.put_slice(&frame.data);
    Ok(())
}

/// Encode a frame into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Result<BytesMut, WriteError> {
    let mut buf = BytesMut::new();
    write_frame(&mut buf, frame)?;
    Ok(buf)
}

/// Result of incremental parsing from an accumulation buffer.
///
/// `Incomplete(n)` carries the **minimum total bytes** needed (not the
/// additional bytes); the caller accumulates more data and retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// One frame parsed; `consumed` bytes of the buffer were used.
    Complete { frame: Frame, consumed: usize },
    Incomplete(usize),
    /// Declared data length exceeds [`MAX_DATA_LEN`]; stream is broken.
    Oversize(u32),
}

/// Try to parse one frame from the front of `buf` without consuming it.
///
/// The synchronous counterpart of [`read_frame`], for readers that must
/// interleave decoding with per-read deadlines: a read timeout can fire
/// mid-frame and the accumulated prefix stays intact for the next pass.
pub fn parse_frame(buf: &[u8]) -> ParseResult {
    // type + id_len
    if buf.len() < 3 {
        return ParseResult::Incomplete(3);
    }
    let frame_type = buf[0];
    let id_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;

    let addr_len_at = 3 + id_len;
    if buf.len() < addr_len_at + 2 {
        return ParseResult::Incomplete(addr_len_at + 2);
    }
    let addr_len = u16::from_be_bytes([buf[addr_len_at], buf[addr_len_at + 1]]) as usize;

    let data_len_at = addr_len_at + 2 + addr_len;
    if buf.len() < data_len_at + 4 {
        return ParseResult::Incomplete(data_len_at + 4);
    }
    let data_len = u32::from_be_bytes([
        buf[data_len_at],
        buf[data_len_at + 1],
        buf[data_len_at + 2],
        buf[data_len_at + 3],
    ]);
    if data_len > MAX_DATA_LEN {
        return ParseResult::Oversize(data_len);
    }

    let total = data_len_at + 4 + data_len as usize;
    if buf.len() < total {
        return ParseResult::Incomplete(total);
    }

    let id = String::from_utf8_lossy(&buf[3..3 + id_len]).into_owned();
    let addr =
        String::from_utf8_lossy(&buf[addr_len_at + 2..addr_len_at + 2 + addr_len]).into_owned();
    let data = buf[data_len_at + 4..total].to_vec();

    ParseResult::Complete {
        frame: Frame {
            frame_type,
            id,
            addr,
            data,
        },
        consumed: total,
    }
}

/// Read one frame from an async stream.
///
/// Blocks until a full frame is available. EOF mid-frame surfaces as
/// `ReadError::Io(UnexpectedEof)`; EOF on the type byte does too — the
/// control stream has no clean in-band close.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ReadError>
where
    R: AsyncRead + Unpin,
{
    let frame_type = reader.read_u8().await?;

    let id_len = reader.read_u16().await? as usize;
    let mut id_bytes = vec![0u8; id_len];
    reader.read_exact(&mut id_bytes).await?;
    let id = String::from_utf8_lossy(&id_bytes).into_owned();

    let addr_len = reader.read_u16().await? as usize;
    let mut addr_bytes = vec![0u8; addr_len];
    reader.read_exact(&mut addr_bytes).await?;
    let addr = String::from_utf8_lossy(&addr_bytes).into_owned();

    let data_len = reader.read_u32().await?;
    if data_len > MAX_DATA_LEN {
        return Err(ReadError::DataTooLarge(data_len));
    }
    let mut data = vec![0u8; data_len as usize];
    reader.read_exact(&mut data).await?;

    Ok(Frame {
        frame_type,
        id,
        addr,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: &Frame) -> Frame {
        let encoded = encode_frame(frame).unwrap();
        let mut cursor: &[u8] = &encoded;
        read_frame(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn roundtrip_all_type_codes() {
        for frame_type in TYPE_AUTH..=TYPE_UID_REGISTER {
            let frame = Frame {
                frame_type,
                id: format!("id-{frame_type}"),
                addr: "example.com:443".into(),
                data: vec![frame_type; 17],
            };
            assert_eq!(roundtrip(&frame).await, frame);
        }
    }

    #[tokio::test]
    async fn roundtrip_empty_fields() {
        let frame = Frame {
            frame_type: TYPE_CLOSE,
            id: String::new(),
            addr: String::new(),
            data: Vec::new(),
        };
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn roundtrip_large_payload() {
        let frame = Frame::data("conn-1", vec![0xabu8; 256 * 1024]);
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn roundtrip_unknown_type_code() {
        // The codec is agnostic to type codes; unknown values survive a
        // round trip and are rejected at the dispatch layer instead.
        let frame = Frame {
            frame_type: 0x7f,
            id: "x".into(),
            addr: String::new(),
            data: b"future".to_vec(),
        };
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn wire_layout_is_big_endian() {
        let frame = Frame {
            frame_type: TYPE_DATA,
            id: "ab".into(),
            addr: "cd".into(),
            data: vec![0x01, 0x02, 0x03],
        };
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(
            &encoded[..],
            &[
                TYPE_DATA, // type
                0x00, 0x02, b'a', b'b', // id
                0x00, 0x02, b'c', b'd', // addr
                0x00, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03, // data
            ]
        );
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let encoded = encode_frame(&Frame::data("conn", vec![0u8; 32])).unwrap();
        let mut cursor: &[u8] = &encoded[..encoded.len() - 5];
        match read_frame(&mut cursor).await {
            Err(ReadError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_data_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(TYPE_DATA);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u32(MAX_DATA_LEN + 1);
        let mut cursor: &[u8] = &buf;
        match read_frame(&mut cursor).await {
            Err(ReadError::DataTooLarge(n)) => assert_eq!(n, MAX_DATA_LEN + 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn write_rejects_oversize_fields() {
        let mut buf = BytesMut::new();
        let frame = Frame {
            frame_type: TYPE_DATA,
            id: "a".repeat(u16::MAX as usize + 1),
            addr: String::new(),
            data: Vec::new(),
        };
        assert_eq!(
            write_frame(&mut buf, &frame),
            Err(WriteError::IdTooLong(u16::MAX as usize + 1))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_preserves_incomplete_prefixes() {
        let frame = Frame {
            frame_type: TYPE_CONNECT,
            id: "sub-1".into(),
            addr: "dest.example:80".into(),
            data: b"initial".to_vec(),
        };
        let encoded = encode_frame(&frame).unwrap();

        // Feed the encoding byte by byte; every prefix must report
        // Incomplete until the full frame is present.
        for cut in 0..encoded.len() {
            match parse_frame(&encoded[..cut]) {
                ParseResult::Incomplete(needed) => assert!(needed > cut),
                other => panic!("prefix of {cut} bytes parsed as {other:?}"),
            }
        }

        match parse_frame(&encoded) {
            ParseResult::Complete { frame: parsed, consumed } => {
                assert_eq!(parsed, frame);
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_leaves_trailing_bytes() {
        let first = Frame::close("a");
        let second = Frame::pong("b");
        let mut buf = encode_frame(&first).unwrap();
        buf.extend_from_slice(&encode_frame(&second).unwrap());

        let ParseResult::Complete { frame, consumed } = parse_frame(&buf) else {
            panic!("first frame should parse");
        };
        assert_eq!(frame, first);

        let ParseResult::Complete { frame, consumed: rest } = parse_frame(&buf[consumed..])
        else {
            panic!("second frame should parse");
        };
        assert_eq!(frame, second);
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn parse_rejects_oversize_data_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(TYPE_DATA);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u32(MAX_DATA_LEN + 1);
        assert_eq!(parse_frame(&buf), ParseResult::Oversize(MAX_DATA_LEN + 1));
    }

    #[test]
    fn type_names_cover_known_codes() {
        assert_eq!(type_name(TYPE_AUTH), "auth");
        assert_eq!(type_name(TYPE_UID_REGISTER), "uid-register");
        assert_eq!(type_name(0xff), "unknown");
    }
}
