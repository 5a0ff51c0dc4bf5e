//! Message encoder/decoder (C2): request/response head, chunk, and end
//! frame payloads, in both protocol v1 (literal header names) and protocol
//! v2 (tokenized header names via the static table below).

use crate::error::FramingError;
use crate::frame::{ByteReader, ByteWriter};

/// Protocol version carried as the first payload byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// Literal header names.
    V1 = 1,
    /// Tokenized header names via [`HEADER_NAME_TABLE`].
    V2 = 2,
}

impl ProtocolVersion {
    pub fn from_byte(byte: u8) -> Result<Self, FramingError> {
        match byte {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(FramingError::UnsupportedVersion(other)),
        }
    }

    fn is_tokenized(self) -> bool {
        matches!(self, ProtocolVersion::V2)
    }
}

/// Frame type codes, identical in meaning for both protocol versions — only
/// header-name encoding differs between v1 and v2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    ReqFull = 1,
    ReqChunk = 2,
    ReqEnd = 3,
    RespFull = 4,
    RespChunk = 5,
    RespEnd = 6,
    TunChunk = 7,
    TunClose = 8,
    ReqStart = 10,
    RespStart = 11,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Result<Self, FramingError> {
        Ok(match byte {
            1 => FrameType::ReqFull,
            2 => FrameType::ReqChunk,
            3 => FrameType::ReqEnd,
            4 => FrameType::RespFull,
            5 => FrameType::RespChunk,
            6 => FrameType::RespEnd,
            7 => FrameType::TunChunk,
            8 => FrameType::TunClose,
            10 => FrameType::ReqStart,
            11 => FrameType::RespStart,
            other => return Err(FramingError::UnknownFrameType(other)),
        })
    }
}

/// Token used in v2 header-name encoding to mean "a literal name follows".
pub const HEADER_NAME_LITERAL_TOKEN: u16 = 0xFFFF;

/// Frozen, wire-contract order of common header names (§3, §9). Appending
/// entries is forward-compatible; reordering or removing one is not.
pub const HEADER_NAME_TABLE: &[&str] = &[
    "host",                     // 0
    "connection",                // 1
    "user-agent",                 // 2
    "accept",                     // 3
    "accept-encoding",            // 4
    "accept-language",            // 5
    "content-type",               // 6
    "content-length",             // 7
    "transfer-encoding",          // 8
    "cookie",                     // 9
    "set-cookie",                 // 10
    "cache-control",              // 11
    "pragma",                     // 12
    "upgrade",                    // 13
    "authorization",              // 14
    "origin",                     // 15
    "referer",                    // 16
    "location",                   // 17
    "server",                     // 18
    "date",                       // 19
    "x-forwarded-for",            // 20
    "x-forwarded-proto",          // 21
    "x-forwarded-host",           // 22
    "x-forwarded-port",           // 23
    "x-request-id",               // 24
    "sec-websocket-key",          // 25
    "sec-websocket-version",      // 26
    "sec-websocket-protocol",     // 27
    "sec-websocket-extensions",   // 28
];

/// Looks up the static token for a lowercase header name.
pub fn header_token(name: &str) -> Option<u16> {
    HEADER_NAME_TABLE
        .iter()
        .position(|candidate| *candidate == name)
        .map(|index| index as u16)
}

/// Resolves a table token back to its canonical header name.
pub fn header_name_for_token(token: u16) -> Option<&'static str> {
    HEADER_NAME_TABLE.get(token as usize).copied()
}

/// A header name as recorded by [`decode_head_offsets`]: either a table
/// token or a byte range into the payload for a literal name. Neither case
/// has validated UTF-8 yet.
#[derive(Debug, Clone, Copy)]
enum HeaderNameSlot {
    Token(u16),
    Literal(usize, usize),
}

#[derive(Debug, Clone, Copy)]
struct HeaderSlot {
    name: HeaderNameSlot,
    value: (usize, usize),
}

/// A decoded request or response head: scalar fields are resolved eagerly
/// (they are cheap and almost always read), the header list is recorded as
/// offsets only and materialised lazily on indexing or lookup (§3, §4.2,
/// §4.5, §8 "no more than a constant number of heap objects... when the
/// handler accesses no fields").
pub struct HeaderListView<'a> {
    payload: &'a [u8],
    slots: Vec<HeaderSlot>,
}

impl<'a> HeaderListView<'a> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Materialises the `(name, value)` pair at `index`, allocating nothing
    /// beyond the two borrowed `&str` slices themselves.
    pub fn get(&self, index: usize) -> Option<(&'a str, &'a str)> {
        let slot = self.slots.get(index)?;
        let name = match slot.name {
            HeaderNameSlot::Token(token) => header_name_for_token(token)?,
            HeaderNameSlot::Literal(start, end) => {
                std::str::from_utf8(&self.payload[start..end]).ok()?
            }
        };
        let value = std::str::from_utf8(&self.payload[slot.value.0..slot.value.1]).ok()?;
        Some((name, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        (0..self.slots.len()).filter_map(move |index| self.get(index))
    }

    /// ASCII-case-insensitive lookup without materialising the whole list.
    pub fn find(&self, name: &str) -> Option<&'a str> {
        self.iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }
}

pub struct RequestHead<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub authority: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub protocol: &'a str,
    pub headers: HeaderListView<'a>,
    /// `Some(body)` only for `FrameType::ReqFull`; `REQ_START` carries no
    /// inline body, it arrives as subsequent `REQ_CHUNK`/`REQ_END` frames.
    pub inline_body: Option<&'a [u8]>,
}

pub struct ResponseHead<'a> {
    pub status: u16,
    pub headers: HeaderListView<'a>,
    /// `Some(body)` only for `FrameType::RespFull`.
    pub inline_body: Option<&'a [u8]>,
}

fn decode_header_slots(
    reader: &mut ByteReader<'_>,
    tokenized: bool,
) -> Result<Vec<HeaderSlot>, FramingError> {
    let header_count = reader.get_u32()? as usize;
    let mut slots = Vec::with_capacity(header_count);
    for _ in 0..header_count {
        let name = if tokenized {
            let token = reader.get_u16()?;
            if token == HEADER_NAME_LITERAL_TOKEN {
                let (start, end) = reader.get_bytes_range()?;
                HeaderNameSlot::Literal(start, end)
            } else {
                if header_name_for_token(token).is_none() {
                    return Err(FramingError::InvalidHeaderToken(token));
                }
                HeaderNameSlot::Token(token)
            }
        } else {
            let (start, end) = reader.get_bytes_range()?;
            HeaderNameSlot::Literal(start, end)
        };
        let value = reader.get_bytes_range()?;
        slots.push(HeaderSlot { name, value });
    }
    Ok(slots)
}

/// Decodes a REQ_FULL or REQ_START payload (everything up to, but not
/// including, the inline body on REQ_FULL).
pub fn decode_request_head(payload: &[u8]) -> Result<(ProtocolVersion, FrameType, RequestHead<'_>), FramingError> {
    let mut reader = ByteReader::new(payload);
    let version = ProtocolVersion::from_byte(reader.get_u8()?)?;
    let frame_type = FrameType::from_byte(reader.get_u8()?)?;
    if !matches!(frame_type, FrameType::ReqFull | FrameType::ReqStart) {
        return Err(FramingError::UnexpectedFrameType {
            expected: "REQ_FULL or REQ_START",
            got: frame_type as u8,
        });
    }
    let method = reader.get_str()?;
    let scheme = reader.get_str()?;
    let authority = reader.get_str()?;
    let path = reader.get_str()?;
    let query = reader.get_str()?;
    let protocol = reader.get_str()?;
    let slots = decode_header_slots(&mut reader, version.is_tokenized())?;
    let headers = HeaderListView { payload, slots };
    let inline_body = if frame_type == FrameType::ReqFull {
        let body = reader.get_bytes()?;
        reader.ensure_done()?;
        Some(body)
    } else {
        reader.ensure_done()?;
        None
    };
    Ok((version, frame_type, RequestHead {
        method,
        scheme,
        authority,
        path,
        query,
        protocol,
        headers,
        inline_body,
    }))
}

/// Decodes a RESP_FULL or RESP_START payload.
pub fn decode_response_head(payload: &[u8]) -> Result<(ProtocolVersion, FrameType, ResponseHead<'_>), FramingError> {
    let mut reader = ByteReader::new(payload);
    let version = ProtocolVersion::from_byte(reader.get_u8()?)?;
    let frame_type = FrameType::from_byte(reader.get_u8()?)?;
    if !matches!(frame_type, FrameType::RespFull | FrameType::RespStart) {
        return Err(FramingError::UnexpectedFrameType {
            expected: "RESP_FULL or RESP_START",
            got: frame_type as u8,
        });
    }
    let status = reader.get_u16()?;
    let slots = decode_header_slots(&mut reader, version.is_tokenized())?;
    let headers = HeaderListView { payload, slots };
    let inline_body = if frame_type == FrameType::RespFull {
        let body = reader.get_bytes()?;
        reader.ensure_done()?;
        Some(body)
    } else {
        reader.ensure_done()?;
        None
    };
    Ok((version, frame_type, ResponseHead { status, headers, inline_body }))
}

/// Decodes a REQ_CHUNK, RESP_CHUNK, or TUN_CHUNK payload; returns the chunk
/// bytes borrowed from `payload`.
pub fn decode_chunk<'a>(payload: &'a [u8], expected: FrameType) -> Result<&'a [u8], FramingError> {
    let mut reader = ByteReader::new(payload);
    let _version = ProtocolVersion::from_byte(reader.get_u8()?)?;
    let frame_type = FrameType::from_byte(reader.get_u8()?)?;
    if frame_type != expected {
        return Err(FramingError::UnexpectedFrameType {
            expected: "matching chunk frame type",
            got: frame_type as u8,
        });
    }
    let chunk = reader.get_bytes()?;
    reader.ensure_done()?;
    Ok(chunk)
}

/// Decodes a REQ_END, RESP_END, or TUN_CLOSE payload (header-only sentinel).
pub fn decode_end(payload: &[u8], expected: FrameType) -> Result<(), FramingError> {
    let mut reader = ByteReader::new(payload);
    let _version = ProtocolVersion::from_byte(reader.get_u8()?)?;
    let frame_type = FrameType::from_byte(reader.get_u8()?)?;
    if frame_type != expected {
        return Err(FramingError::UnexpectedFrameType {
            expected: "matching end frame type",
            got: frame_type as u8,
        });
    }
    reader.ensure_done()
}

/// Peeks the frame type of a payload after validating the version byte,
/// without decoding the rest.
pub fn peek_frame_type(payload: &[u8]) -> Result<FrameType, FramingError> {
    if payload.len() < 2 {
        return Err(FramingError::TruncatedFrame);
    }
    ProtocolVersion::from_byte(payload[0])?;
    FrameType::from_byte(payload[1])
}

fn write_header_name(writer: &mut ByteWriter, version: ProtocolVersion, name: &str) -> Result<(), crate::error::BridgeError> {
    if version.is_tokenized() {
        if let Some(token) = header_token(name) {
            writer.put_u16(token);
            return Ok(());
        }
        writer.put_u16(HEADER_NAME_LITERAL_TOKEN);
        writer.put_string(name)
    } else {
        writer.put_string(name)
    }
}

fn write_headers<'h>(
    writer: &mut ByteWriter,
    version: ProtocolVersion,
    headers: impl Iterator<Item = (&'h str, &'h str)>,
) -> Result<(), crate::error::BridgeError> {
    let count_pos = writer.reserve_u32();
    let mut count: u32 = 0;
    for (name, value) in headers {
        count = count
            .checked_add(1)
            .ok_or(FramingError::OversizeFrame(u32::MAX as usize, u32::MAX as usize))?;
        write_header_name(writer, version, name)?;
        writer.put_string(value)?;
    }
    writer.patch_u32(count_pos, count);
    Ok(())
}

/// Encodes a REQ_FULL payload (unary request with inline body).
pub fn encode_request_full<'h>(
    version: ProtocolVersion,
    method: &str,
    scheme: &str,
    authority: &str,
    path: &str,
    query: &str,
    protocol: &str,
    headers: impl Iterator<Item = (&'h str, &'h str)>,
    body: &[u8],
) -> Result<Vec<u8>, crate::error::BridgeError> {
    let mut writer = ByteWriter::new();
    writer.reserve(256 + body.len());
    writer.put_u8(version as u8);
    writer.put_u8(FrameType::ReqFull as u8);
    writer.put_string(method)?;
    writer.put_string(scheme)?;
    writer.put_string(authority)?;
    writer.put_string(path)?;
    writer.put_string(query)?;
    writer.put_string(protocol)?;
    write_headers(&mut writer, version, headers)?;
    writer.put_bytes(body)?;
    Ok(writer.into_inner())
}

/// Encodes a REQ_START payload (streaming request head, no body bytes).
pub fn encode_request_start<'h>(
    version: ProtocolVersion,
    method: &str,
    scheme: &str,
    authority: &str,
    path: &str,
    query: &str,
    protocol: &str,
    headers: impl Iterator<Item = (&'h str, &'h str)>,
) -> Result<Vec<u8>, crate::error::BridgeError> {
    let mut writer = ByteWriter::new();
    writer.reserve(256);
    writer.put_u8(version as u8);
    writer.put_u8(FrameType::ReqStart as u8);
    writer.put_string(method)?;
    writer.put_string(scheme)?;
    writer.put_string(authority)?;
    writer.put_string(path)?;
    writer.put_string(query)?;
    writer.put_string(protocol)?;
    write_headers(&mut writer, version, headers)?;
    Ok(writer.into_inner())
}

pub fn encode_request_end(version: ProtocolVersion) -> Vec<u8> {
    vec![version as u8, FrameType::ReqEnd as u8]
}

/// Encodes a RESP_FULL payload.
pub fn encode_response_full<'h>(
    version: ProtocolVersion,
    status: u16,
    headers: impl Iterator<Item = (&'h str, &'h str)>,
    body: &[u8],
) -> Result<Vec<u8>, crate::error::BridgeError> {
    let mut writer = ByteWriter::new();
    writer.reserve(64 + body.len());
    writer.put_u8(version as u8);
    writer.put_u8(FrameType::RespFull as u8);
    writer.put_u16(status);
    write_headers(&mut writer, version, headers)?;
    writer.put_bytes(body)?;
    Ok(writer.into_inner())
}

/// Encodes a RESP_START payload.
pub fn encode_response_start<'h>(
    version: ProtocolVersion,
    status: u16,
    headers: impl Iterator<Item = (&'h str, &'h str)>,
) -> Result<Vec<u8>, crate::error::BridgeError> {
    let mut writer = ByteWriter::new();
    writer.reserve(64);
    writer.put_u8(version as u8);
    writer.put_u8(FrameType::RespStart as u8);
    writer.put_u16(status);
    write_headers(&mut writer, version, headers)?;
    Ok(writer.into_inner())
}

pub fn encode_response_end(version: ProtocolVersion) -> Vec<u8> {
    vec![version as u8, FrameType::RespEnd as u8]
}

pub fn encode_chunk_payload(version: ProtocolVersion, frame_type: FrameType, chunk: &[u8]) -> Result<Vec<u8>, crate::error::BridgeError> {
    let mut writer = ByteWriter::new();
    writer.reserve(6 + chunk.len());
    writer.put_u8(version as u8);
    writer.put_u8(frame_type as u8);
    writer.put_bytes(chunk)?;
    Ok(writer.into_inner())
}

pub fn encode_tunnel_close(version: ProtocolVersion) -> Vec<u8> {
    vec![version as u8, FrameType::TunClose as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_request_round_trips_with_literal_headers() {
        let headers = vec![("host", "example.com"), ("x-custom", "yes")];
        let payload = encode_request_full(
            ProtocolVersion::V1,
            "GET",
            "http",
            "example.com",
            "/ping",
            "",
            "1.1",
            headers.iter().map(|(n, v)| (*n, *v)),
            b"",
        )
        .unwrap();

        let (version, frame_type, head) = decode_request_head(&payload).unwrap();
        assert!(matches!(version, ProtocolVersion::V1));
        assert_eq!(frame_type, FrameType::ReqFull);
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/ping");
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers.find("host"), Some("example.com"));
        assert_eq!(head.headers.find("HOST"), Some("example.com"));
    }

    #[test]
    fn v2_request_tokenizes_known_header_names() {
        let headers = vec![("host", "example.com"), ("x-custom", "yes")];
        let payload = encode_request_full(
            ProtocolVersion::V2,
            "POST",
            "https",
            "example.com",
            "/upload",
            "a=1",
            "2",
            headers.iter().map(|(n, v)| (*n, *v)),
            b"body",
        )
        .unwrap();

        let (version, frame_type, head) = decode_request_head(&payload).unwrap();
        assert!(matches!(version, ProtocolVersion::V2));
        assert_eq!(frame_type, FrameType::ReqFull);
        assert_eq!(head.headers.find("host"), Some("example.com"));
        assert_eq!(head.headers.find("x-custom"), Some("yes"));
    }

    #[test]
    fn unknown_header_token_is_fatal() {
        // Hand-build a RESP_START payload with an out-of-range token.
        let mut writer = ByteWriter::new();
        writer.put_u8(ProtocolVersion::V2 as u8);
        writer.put_u8(FrameType::RespStart as u8);
        writer.put_u16(200);
        writer.put_u32(1);
        writer.put_u16(9999);
        writer.put_string("value").unwrap();
        let payload = writer.into_inner();
        let error = decode_response_head(&payload).unwrap_err();
        assert!(matches!(error, FramingError::InvalidHeaderToken(9999)));
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let payload = vec![3_u8, FrameType::ReqEnd as u8];
        let error = decode_end(&payload, FrameType::ReqEnd).unwrap_err();
        assert!(matches!(error, FramingError::UnsupportedVersion(3)));
    }

    #[test]
    fn chunk_payload_round_trips() {
        let payload = encode_chunk_payload(ProtocolVersion::V1, FrameType::ReqChunk, b"abc").unwrap();
        let chunk = decode_chunk(&payload, FrameType::ReqChunk).unwrap();
        assert_eq!(chunk, b"abc");
    }

    #[test]
    fn mixed_v1_request_v2_response_both_decode() {
        let request = encode_request_full(
            ProtocolVersion::V1,
            "GET",
            "http",
            "h",
            "/",
            "",
            "1.1",
            std::iter::empty(),
            b"",
        )
        .unwrap();
        let response = encode_response_full(
            ProtocolVersion::V2,
            200,
            vec![("content-type", "text/plain")].into_iter(),
            b"pong",
        )
        .unwrap();

        decode_request_head(&request).unwrap();
        let (_, _, head) = decode_response_head(&response).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.find("content-type"), Some("text/plain"));
    }
}
