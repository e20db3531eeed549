//! Redis RESP codec: value model, incremental decode, canonical encode, the
//! proxy-side request model with multi-key splitting, and MOVED/ASK
//! redirection parsing.

use bytes::Bytes;

use crate::bufio::{find_crlf, RecvBuffer, SendBuffer};
use crate::error::ProxyError;
use crate::message::{Message, Reply, Request};

/// Maximum RESP array nesting accepted from a peer. Commands are depth-2;
/// anything deeper is a malformed or hostile stream.
const MAX_DEPTH: usize = 32;

/// One RESP protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+...` without the marker or CRLF.
    Simple(Bytes),
    /// `-...` error payload.
    Error(Bytes),
    /// `:n`
    Integer(i64),
    /// `$n` bulk payload.
    Bulk(Bytes),
    /// `$-1`
    NullBulk,
    /// `*n`
    Array(Vec<RespValue>),
    /// `*-1`
    NullArray,
}

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::Simple(Bytes::from_static(b"OK"))
    }

    pub fn error(text: &str) -> RespValue {
        RespValue::Error(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Scan for one complete value starting at `pos`; returns the end offset.
fn check_value(buf: &[u8], pos: usize, depth: usize) -> Result<Option<usize>, ProxyError> {
    if depth > MAX_DEPTH {
        return Err(ProxyError::Protocol("resp nesting too deep".into()));
    }
    if pos >= buf.len() {
        return Ok(None);
    }
    match buf[pos] {
        b'+' | b'-' | b':' => find_crlf(buf, pos),
        b'$' => {
            let Some(line_end) = find_crlf(buf, pos)? else {
                return Ok(None);
            };
            let len = parse_int(&buf[pos + 1..line_end - 2])?;
            if len < 0 {
                return Ok(Some(line_end));
            }
            let end = line_end + len as usize + 2;
            if buf.len() < end {
                return Ok(None);
            }
            Ok(Some(end))
        }
        b'*' => {
            let Some(line_end) = find_crlf(buf, pos)? else {
                return Ok(None);
            };
            let count = parse_int(&buf[pos + 1..line_end - 2])?;
            if count < 0 {
                return Ok(Some(line_end));
            }
            let mut cursor = line_end;
            for _ in 0..count {
                match check_value(buf, cursor, depth + 1)? {
                    Some(end) => cursor = end,
                    None => return Ok(None),
                }
            }
            Ok(Some(cursor))
        }
        other => Err(ProxyError::Protocol(format!(
            "unexpected resp type byte {other:#04x}"
        ))),
    }
}

/// Parse one value out of a complete frame. `check_value` must have
/// succeeded on the same bytes.
fn parse_value(frame: &Bytes, pos: usize) -> Result<(RespValue, usize), ProxyError> {
    let buf = frame.as_ref();
    let malformed = || ProxyError::Protocol("truncated resp frame".into());
    let line_end = find_crlf(buf, pos)?.ok_or_else(malformed)?;
    match buf[pos] {
        b'+' => Ok((RespValue::Simple(frame.slice(pos + 1..line_end - 2)), line_end)),
        b'-' => Ok((RespValue::Error(frame.slice(pos + 1..line_end - 2)), line_end)),
        b':' => Ok((
            RespValue::Integer(parse_int(&buf[pos + 1..line_end - 2])?),
            line_end,
        )),
        b'$' => {
            let len = parse_int(&buf[pos + 1..line_end - 2])?;
            if len < 0 {
                return Ok((RespValue::NullBulk, line_end));
            }
            let data_end = line_end + len as usize;
            if buf.len() < data_end + 2 || &buf[data_end..data_end + 2] != b"\r\n" {
                return Err(malformed());
            }
            Ok((RespValue::Bulk(frame.slice(line_end..data_end)), data_end + 2))
        }
        b'*' => {
            let count = parse_int(&buf[pos + 1..line_end - 2])?;
            if count < 0 {
                return Ok((RespValue::NullArray, line_end));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = line_end;
            for _ in 0..count {
                let (item, next) = parse_value(frame, cursor)?;
                items.push(item);
                cursor = next;
            }
            Ok((RespValue::Array(items), cursor))
        }
        other => Err(ProxyError::Protocol(format!(
            "unexpected resp type byte {other:#04x}"
        ))),
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, ProxyError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| ProxyError::Protocol("non-ascii resp integer".into()))?;
    text.trim()
        .parse::<i64>()
        .map_err(|_| ProxyError::Protocol(format!("bad resp integer {text:?}")))
}

/// Decode one reply value if a complete frame is buffered.
pub fn decode_value(rb: &mut RecvBuffer) -> Result<Option<RespValue>, ProxyError> {
    let Some(end) = check_value(rb.as_slice(), 0, 0)? else {
        return Ok(None);
    };
    let frame = rb.take(end);
    let (value, consumed) = parse_value(&frame, 0)?;
    debug_assert_eq!(consumed, frame.len());
    Ok(Some(value))
}

/// Canonical encode.
pub fn encode_value(value: &RespValue, out: &mut SendBuffer) {
    match value {
        RespValue::Simple(data) => {
            out.put(b"+");
            out.put(data);
            out.put(b"\r\n");
        }
        RespValue::Error(data) => {
            out.put(b"-");
            out.put(data);
            out.put(b"\r\n");
        }
        RespValue::Integer(v) => {
            out.put(b":");
            out.put_int(*v);
            out.put(b"\r\n");
        }
        RespValue::Bulk(data) => {
            out.put(b"$");
            out.put_int(data.len() as i64);
            out.put(b"\r\n");
            out.put(data);
            out.put(b"\r\n");
        }
        RespValue::NullBulk => out.put(b"$-1\r\n"),
        RespValue::Array(items) => {
            out.put(b"*");
            out.put_int(items.len() as i64);
            out.put(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        RespValue::NullArray => out.put(b"*-1\r\n"),
    }
}

/// A parsed Redis command: flat argument list plus the uppercased verb.
#[derive(Debug)]
pub struct RedisRequest {
    args: Vec<Bytes>,
    verb: Vec<u8>,
}

impl RedisRequest {
    fn new(args: Vec<Bytes>) -> Result<Self, ProxyError> {
        let verb = args
            .first()
            .ok_or_else(|| ProxyError::Protocol("empty command".into()))?
            .to_ascii_uppercase();
        Ok(Self { args, verb })
    }

    pub fn from_parts(verb: &[u8], rest: &[&[u8]]) -> Self {
        let mut args = Vec::with_capacity(rest.len() + 1);
        args.push(Bytes::copy_from_slice(verb));
        args.extend(rest.iter().map(|a| Bytes::copy_from_slice(a)));
        Self {
            args,
            verb: verb.to_ascii_uppercase(),
        }
    }

    pub fn verb(&self) -> &[u8] {
        &self.verb
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The argument this command hashes on. Key-less commands hash the
    /// empty key and land on an arbitrary but stable node.
    pub fn key(&self) -> &[u8] {
        let idx = match self.verb.as_slice() {
            b"EVAL" | b"EVALSHA" => 3,
            _ => 1,
        };
        self.args.get(idx).map(Bytes::as_ref).unwrap_or_default()
    }

    pub fn is_quit(&self) -> bool {
        self.verb == b"QUIT"
    }

    /// Canonical wire form: an array of bulk strings.
    pub fn encode_into(&self, out: &mut SendBuffer) {
        out.put(b"*");
        out.put_int(self.args.len() as i64);
        out.put(b"\r\n");
        for arg in &self.args {
            out.put(b"$");
            out.put_int(arg.len() as i64);
            out.put(b"\r\n");
            out.put(arg);
            out.put(b"\r\n");
        }
    }
}

/// The `ASKING` command sent ahead of an ASK-redirected message.
pub fn asking_request() -> RedisRequest {
    RedisRequest::from_parts(b"ASKING", &[])
}

/// Decode one client request: a RESP array of bulks, or an inline command
/// line. Returns `None` until a complete request is buffered.
pub fn decode_request(rb: &mut RecvBuffer) -> Result<Option<Message>, ProxyError> {
    loop {
        let buf = rb.as_slice();
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] == b'*' {
            let Some(end) = check_value(buf, 0, 0)? else {
                return Ok(None);
            };
            let frame = rb.take(end);
            let (value, _) = parse_value(&frame, 0)?;
            let args = command_args(value)?;
            return Ok(Some(build_message(RedisRequest::new(args)?)));
        }
        // Inline command: one whitespace-separated line.
        let Some(end) = rb.find_line(0)? else {
            return Ok(None);
        };
        let frame = rb.take(end);
        let line = &frame[..frame.len() - 2];
        let args: Vec<Bytes> = line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|part| !part.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        if args.is_empty() {
            // Bare CRLF between commands; keep scanning.
            continue;
        }
        return Ok(Some(build_message(RedisRequest::new(args)?)));
    }
}

fn command_args(value: RespValue) -> Result<Vec<Bytes>, ProxyError> {
    let RespValue::Array(items) = value else {
        return Err(ProxyError::Protocol("command must be an array".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(data) => Ok(data),
            other => Err(ProxyError::Protocol(format!(
                "command argument must be bulk, got {other:?}"
            ))),
        })
        .collect()
}

/// Wrap a request in a `Message`, splitting multi-key commands into one
/// child per key (per key/value pair for MSET).
fn build_message(req: RedisRequest) -> Message {
    let args = req.args();
    let subs: Vec<Message> = match req.verb() {
        b"MGET" if args.len() > 2 => args[1..]
            .iter()
            .map(|key| single(b"GET", &[key.clone()]))
            .collect(),
        b"MSET" if args.len() > 3 && args.len() % 2 == 1 => args[1..]
            .chunks(2)
            .map(|pair| single(b"SET", pair))
            .collect(),
        b"DEL" | b"EXISTS" if args.len() > 2 => args[1..]
            .iter()
            .map(|key| single(&req.verb().to_vec(), &[key.clone()]))
            .collect(),
        _ => Vec::new(),
    };
    if subs.is_empty() {
        Message::new(Request::Redis(req))
    } else {
        Message::with_subs(Request::Redis(req), subs)
    }
}

fn single(verb: &[u8], rest: &[Bytes]) -> Message {
    let mut args = Vec::with_capacity(rest.len() + 1);
    args.push(Bytes::copy_from_slice(verb));
    args.extend_from_slice(rest);
    let verb = verb.to_ascii_uppercase();
    Message::new(Request::Redis(RedisRequest { args, verb }))
}

/// Merge completed children back into one client reply.
pub fn merge_reply(parent: &RedisRequest, subs: &[Option<Message>]) -> RespValue {
    for sub in subs {
        match sub {
            Some(m) => {
                if let Some(err) = m.error() {
                    return RespValue::error(&format!("ERR {err}"));
                }
            }
            None => return RespValue::error("ERR backend worker unavailable"),
        }
    }
    match parent.verb() {
        b"MGET" => RespValue::Array(
            subs.iter()
                .map(|m| reply_of(m).unwrap_or(RespValue::NullBulk))
                .collect(),
        ),
        b"MSET" => RespValue::ok(),
        b"DEL" | b"EXISTS" => {
            let mut total = 0i64;
            for m in subs {
                match reply_of(m) {
                    Some(RespValue::Integer(n)) => total += n,
                    Some(RespValue::Error(e)) => return RespValue::Error(e),
                    _ => {
                        return RespValue::error("ERR unexpected reply from backend");
                    }
                }
            }
            RespValue::Integer(total)
        }
        _ => RespValue::error("ERR cannot merge replies for this command"),
    }
}

fn reply_of(m: &Option<Message>) -> Option<RespValue> {
    match m.as_ref()?.reply()? {
        Reply::Redis(v) => Some(v.clone()),
        _ => None,
    }
}

/// Write one completed message's reply in client-facing form.
pub fn write_reply(msg: &Message, out: &mut SendBuffer) {
    if let Some(err) = msg.error() {
        write_error(err, out);
        return;
    }
    match msg.reply() {
        Some(Reply::Redis(value)) => encode_value(value, out),
        _ => write_error(&ProxyError::Protocol("reply missing".into()), out),
    }
}

/// The protocol's native error form.
pub fn write_error(err: &(impl std::fmt::Display + ?Sized), out: &mut SendBuffer) {
    out.put(b"-ERR ");
    out.put(err.to_string().replace(['\r', '\n'], " ").as_bytes());
    out.put(b"\r\n");
}

/// A MOVED or ASK redirection parsed from a backend error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub ask: bool,
    pub slot: u16,
    pub addr: String,
}

/// Classify a reply as a redirection. Requires exactly three whitespace
/// fields with an integer slot; anything else passes through untouched.
pub fn parse_redirect(value: &RespValue) -> Option<Redirect> {
    let RespValue::Error(data) = value else {
        return None;
    };
    let text = std::str::from_utf8(data).ok()?;
    let mut fields = text.split_ascii_whitespace();
    let tag = fields.next()?;
    let ask = match tag {
        "MOVED" => false,
        "ASK" => true,
        _ => return None,
    };
    let slot: u16 = fields.next()?.parse().ok()?;
    let addr = fields.next()?.to_owned();
    if fields.next().is_some() {
        return None;
    }
    Some(Redirect { ask, slot, addr })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<RespValue> {
        let mut rb = RecvBuffer::new();
        rb.push(bytes);
        let mut out = Vec::new();
        while let Some(v) = decode_value(&mut rb).unwrap() {
            out.push(v);
        }
        out
    }

    fn encoded(value: &RespValue) -> Vec<u8> {
        let mut out = SendBuffer::new();
        encode_value(value, &mut out);
        out.as_slice().to_vec()
    }

    #[test]
    fn encode_decode_roundtrip_identity() {
        let values = vec![
            RespValue::Simple(Bytes::from_static(b"PONG")),
            RespValue::Error(Bytes::from_static(b"ERR boom")),
            RespValue::Integer(-17),
            RespValue::Bulk(Bytes::from_static(b"hello\nworld")),
            RespValue::NullBulk,
            RespValue::NullArray,
            RespValue::Array(vec![
                RespValue::Bulk(Bytes::from_static(b"a")),
                RespValue::Array(vec![RespValue::Integer(1), RespValue::NullBulk]),
                RespValue::Simple(Bytes::from_static(b"x")),
            ]),
            RespValue::Array(Vec::new()),
        ];
        for value in values {
            let bytes = encoded(&value);
            let back = decode_all(&bytes);
            assert_eq!(back, vec![value]);
        }
    }

    #[test]
    fn decode_is_incremental() {
        let mut rb = RecvBuffer::new();
        rb.push(b"$5\r\nhel");
        assert!(decode_value(&mut rb).unwrap().is_none());
        rb.push(b"lo\r\n");
        assert_eq!(
            decode_value(&mut rb).unwrap(),
            Some(RespValue::Bulk(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn decode_pipelined_values() {
        let got = decode_all(b"+PONG\r\n+PONG\r\n:3\r\n");
        assert_eq!(
            got,
            vec![
                RespValue::Simple(Bytes::from_static(b"PONG")),
                RespValue::Simple(Bytes::from_static(b"PONG")),
                RespValue::Integer(3),
            ]
        );
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut rb = RecvBuffer::new();
        rb.push(b"!weird\r\n");
        assert!(decode_value(&mut rb).is_err());
    }

    fn request(bytes: &[u8]) -> Message {
        let mut rb = RecvBuffer::new();
        rb.push(bytes);
        decode_request(&mut rb).unwrap().unwrap()
    }

    #[test]
    fn decode_array_request() {
        let msg = request(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(msg.request().key(), b"foo");
        assert!(!msg.is_composite());
    }

    #[test]
    fn decode_inline_request() {
        let msg = request(b"PING\r\n");
        let Request::Redis(req) = msg.request() else {
            panic!("not a redis request");
        };
        assert_eq!(req.verb(), b"PING");
        assert_eq!(req.key(), b"");
    }

    #[test]
    fn inline_skips_blank_lines() {
        let mut rb = RecvBuffer::new();
        rb.push(b"\r\nPING\r\n");
        let msg = decode_request(&mut rb).unwrap().unwrap();
        let Request::Redis(req) = msg.request() else {
            panic!("not a redis request");
        };
        assert_eq!(req.verb(), b"PING");
    }

    #[test]
    fn mget_splits_per_key_and_merge_preserves_order() {
        let mut msg = request(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        assert!(msg.is_composite());
        assert_eq!(msg.sub_count(), 3);

        let subs = msg.take_subs();
        let keys: Vec<&[u8]> = subs.iter().map(|s| s.request().key()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);

        let mut answered: Vec<Option<Message>> = Vec::new();
        for (i, mut sub) in subs.into_iter().enumerate() {
            sub.set_reply(Reply::Redis(RespValue::Bulk(Bytes::from(format!("v{i}")))));
            sub.finish();
            answered.push(Some(sub));
        }
        let Request::Redis(parent) = msg.request() else {
            panic!("not redis");
        };
        let merged = merge_reply(parent, &answered);
        assert_eq!(
            merged,
            RespValue::Array(vec![
                RespValue::Bulk(Bytes::from_static(b"v0")),
                RespValue::Bulk(Bytes::from_static(b"v1")),
                RespValue::Bulk(Bytes::from_static(b"v2")),
            ])
        );
    }

    #[test]
    fn mset_splits_per_pair() {
        let msg = request(b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$2\r\nv1\r\n$1\r\nb\r\n$2\r\nv2\r\n");
        assert_eq!(msg.sub_count(), 2);
    }

    #[test]
    fn del_merge_sums_integers() {
        let mut msg = request(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
        let subs = msg.take_subs();
        let mut answered: Vec<Option<Message>> = Vec::new();
        for mut sub in subs {
            sub.set_reply(Reply::Redis(RespValue::Integer(1)));
            sub.finish();
            answered.push(Some(sub));
        }
        let Request::Redis(parent) = msg.request() else {
            panic!("not redis");
        };
        assert_eq!(merge_reply(parent, &answered), RespValue::Integer(2));
    }

    #[test]
    fn single_key_commands_do_not_split() {
        assert!(!request(b"*2\r\n$4\r\nMGET\r\n$1\r\na\r\n").is_composite());
        assert!(!request(b"*2\r\n$3\r\nDEL\r\n$1\r\na\r\n").is_composite());
    }

    #[test]
    fn redirect_parsing() {
        let moved = RespValue::Error(Bytes::from_static(b"MOVED 3999 127.0.0.1:7002"));
        assert_eq!(
            parse_redirect(&moved),
            Some(Redirect {
                ask: false,
                slot: 3999,
                addr: "127.0.0.1:7002".into()
            })
        );
        let ask = RespValue::Error(Bytes::from_static(b"ASK 42 10.0.0.9:7000"));
        assert_eq!(parse_redirect(&ask).map(|r| r.ask), Some(true));

        // Not redirections: wrong tag, wrong arity, non-integer slot.
        for text in [
            "WRONGTYPE Operation against a key",
            "MOVED 3999",
            "MOVED 3999 a b",
            "MOVED many 127.0.0.1:7002",
        ] {
            let v = RespValue::error(text);
            assert_eq!(parse_redirect(&v), None, "{text}");
        }
    }

    #[test]
    fn asking_encodes_as_full_command() {
        let mut out = SendBuffer::new();
        asking_request().encode_into(&mut out);
        assert_eq!(out.as_slice(), b"*1\r\n$6\r\nASKING\r\n");
    }
}
