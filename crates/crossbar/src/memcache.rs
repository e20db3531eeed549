//! Memcache text protocol codec.
//!
//! The proxy is transparent at this layer: request lines and data blocks are
//! kept as raw bytes and replayed verbatim to the backend, and responses are
//! forwarded untouched. The only rewriting is multi-key retrieval, which is
//! split into one single-key request per key and merged back into a single
//! `VALUE ... END` block.

use bytes::Bytes;

use crate::bufio::{RecvBuffer, SendBuffer};
use crate::error::ProxyError;
use crate::message::{Message, Reply, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Get,
    Gets,
    Delete,
    Incr,
    Decr,
    Touch,
    Version,
    Quit,
}

impl McVerb {
    fn parse(token: &[u8]) -> Option<McVerb> {
        Some(match token {
            b"set" => McVerb::Set,
            b"add" => McVerb::Add,
            b"replace" => McVerb::Replace,
            b"append" => McVerb::Append,
            b"prepend" => McVerb::Prepend,
            b"cas" => McVerb::Cas,
            b"get" => McVerb::Get,
            b"gets" => McVerb::Gets,
            b"delete" => McVerb::Delete,
            b"incr" => McVerb::Incr,
            b"decr" => McVerb::Decr,
            b"touch" => McVerb::Touch,
            b"version" => McVerb::Version,
            b"quit" => McVerb::Quit,
            _ => return None,
        })
    }

    fn has_data_block(self) -> bool {
        matches!(
            self,
            McVerb::Set
                | McVerb::Add
                | McVerb::Replace
                | McVerb::Append
                | McVerb::Prepend
                | McVerb::Cas
        )
    }

    pub fn is_retrieval(self) -> bool {
        matches!(self, McVerb::Get | McVerb::Gets)
    }

    fn retrieval_text(self) -> &'static [u8] {
        match self {
            McVerb::Gets => b"gets",
            _ => b"get",
        }
    }
}

/// One memcache text request, held as raw wire bytes plus routing metadata.
#[derive(Debug)]
pub struct McRequest {
    verb: McVerb,
    key: Bytes,
    /// Full request line including CRLF.
    line: Bytes,
    /// Data block including its CRLF, for storage commands.
    data: Option<Bytes>,
}

impl McRequest {
    pub fn verb(&self) -> McVerb {
        self.verb
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn is_quit(&self) -> bool {
        self.verb == McVerb::Quit
    }

    /// Replay the request to a backend byte-for-byte.
    pub fn encode_into(&self, out: &mut SendBuffer) {
        out.put(&self.line);
        if let Some(data) = &self.data {
            out.put(data);
        }
    }
}

/// Byte offsets of the space-separated tokens in `line` (CRLF excluded).
fn tokenize(line: &[u8]) -> Vec<(usize, usize)> {
    let body = &line[..line.len().saturating_sub(2)];
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, &b) in body.iter().enumerate() {
        match (b == b' ', start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                tokens.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((s, body.len()));
    }
    tokens
}

/// Decode one client request. Returns `None` until the full request
/// (including any data block) is buffered.
pub fn decode_request(rb: &mut RecvBuffer) -> Result<Option<Message>, ProxyError> {
    let Some(line_end) = rb.find_line(0)? else {
        return Ok(None);
    };
    let (verb, tokens) = {
        let line = &rb.as_slice()[..line_end];
        let tokens = tokenize(line);
        let Some(&(vs, ve)) = tokens.first() else {
            return Err(ProxyError::Protocol("empty command line".into()));
        };
        let Some(verb) = McVerb::parse(&line[vs..ve]) else {
            return Err(ProxyError::Protocol(format!(
                "unsupported command {:?}",
                String::from_utf8_lossy(&line[vs..ve])
            )));
        };
        if let Some(&(s, e)) = tokens.last() {
            // noreply breaks the one-reply-per-request pipelining contract.
            if &line[s..e] == b"noreply" {
                return Err(ProxyError::Protocol("noreply is not supported".into()));
            }
        }
        (verb, tokens)
    };
    let args = &tokens[1..];
    let argc = args.len();
    let tok = |frame: &Bytes, t: (usize, usize)| frame.slice(t.0..t.1);

    if verb.has_data_block() {
        let want = if verb == McVerb::Cas { 5 } else { 4 };
        if argc != want {
            return Err(ProxyError::Protocol("wrong argument count".into()));
        }
        let len = parse_len(&rb.as_slice()[args[3].0..args[3].1])?;
        let total = line_end + len + 2;
        if rb.len() < total {
            return Ok(None);
        }
        let frame = rb.take(total);
        let data = frame.slice(line_end..);
        if !data.ends_with(b"\r\n") {
            return Err(ProxyError::Protocol("data block missing terminator".into()));
        }
        return Ok(Some(Message::new(Request::McText(McRequest {
            verb,
            key: tok(&frame, args[0]),
            line: frame.slice(..line_end),
            data: Some(data),
        }))));
    }

    match verb {
        McVerb::Get | McVerb::Gets => {
            if argc == 0 {
                return Err(ProxyError::Protocol("retrieval without keys".into()));
            }
            let frame = rb.take(line_end);
            if argc == 1 {
                return Ok(Some(Message::new(Request::McText(McRequest {
                    verb,
                    key: tok(&frame, args[0]),
                    line: frame,
                    data: None,
                }))));
            }
            // Multi-key retrieval: one child per key, merged on the way out.
            let subs: Vec<Message> = args
                .iter()
                .map(|&t| {
                    let key = tok(&frame, t);
                    let mut line =
                        Vec::with_capacity(verb.retrieval_text().len() + key.len() + 3);
                    line.extend_from_slice(verb.retrieval_text());
                    line.push(b' ');
                    line.extend_from_slice(&key);
                    line.extend_from_slice(b"\r\n");
                    Message::new(Request::McText(McRequest {
                        verb,
                        key,
                        line: Bytes::from(line),
                        data: None,
                    }))
                })
                .collect();
            let parent = McRequest {
                verb,
                key: Bytes::new(),
                line: frame,
                data: None,
            };
            Ok(Some(Message::with_subs(Request::McText(parent), subs)))
        }
        McVerb::Delete | McVerb::Incr | McVerb::Decr | McVerb::Touch => {
            let want = if verb == McVerb::Delete { 1 } else { 2 };
            if argc != want {
                return Err(ProxyError::Protocol("wrong argument count".into()));
            }
            let frame = rb.take(line_end);
            Ok(Some(Message::new(Request::McText(McRequest {
                verb,
                key: tok(&frame, args[0]),
                line: frame,
                data: None,
            }))))
        }
        McVerb::Version | McVerb::Quit => {
            if argc != 0 {
                return Err(ProxyError::Protocol("wrong argument count".into()));
            }
            let frame = rb.take(line_end);
            Ok(Some(Message::new(Request::McText(McRequest {
                verb,
                key: Bytes::new(),
                line: frame,
                data: None,
            }))))
        }
        McVerb::Set
        | McVerb::Add
        | McVerb::Replace
        | McVerb::Append
        | McVerb::Prepend
        | McVerb::Cas => unreachable!("data-block verbs return above"),
    }
}

fn parse_len(token: &[u8]) -> Result<usize, ProxyError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| ProxyError::Protocol("bad data length".into()))
}

/// Decode one backend response for the given request. The shape of a text
/// response depends on the verb: retrievals stream `VALUE` blocks until
/// `END`, everything else answers with a single line.
pub fn decode_reply(req: &McRequest, rb: &mut RecvBuffer) -> Result<Option<Bytes>, ProxyError> {
    if !req.verb.is_retrieval() {
        let Some(line_end) = rb.find_line(0)? else {
            return Ok(None);
        };
        return Ok(Some(rb.take(line_end)));
    }

    let mut pos = 0usize;
    loop {
        let Some(line_end) = rb.find_line(pos)? else {
            return Ok(None);
        };
        let value_len = {
            let line = &rb.as_slice()[pos..line_end];
            match line.strip_prefix(b"VALUE ") {
                Some(_) => {
                    // VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n
                    let tokens = tokenize(line);
                    if tokens.len() < 4 {
                        return Err(ProxyError::Protocol("short VALUE header".into()));
                    }
                    let (s, e) = tokens[3];
                    Some(parse_len(&line[s..e])?)
                }
                None => None,
            }
        };
        match value_len {
            Some(len) => {
                pos = line_end + len + 2;
                if rb.len() < pos {
                    return Ok(None);
                }
            }
            // END or an error line terminates the response.
            None => return Ok(Some(rb.take(line_end))),
        }
    }
}

/// Write one completed message's reply in client-facing form.
pub fn write_reply(msg: &Message, out: &mut SendBuffer) {
    if let Some(err) = msg.error() {
        write_error(err, out);
        return;
    }
    match msg.reply() {
        Some(Reply::McText(raw)) => out.put(raw),
        _ => write_error(&ProxyError::Protocol("reply missing".into()), out),
    }
}

/// Merge the children of a multi-key retrieval into one response block:
/// each child's `VALUE` section is concatenated and a single `END` closes
/// the stream.
pub fn write_merged_retrieval(subs: &[Option<Message>], out: &mut SendBuffer) {
    let mut sections: Vec<&Bytes> = Vec::with_capacity(subs.len());
    for sub in subs {
        let Some(msg) = sub else {
            return write_error(&ProxyError::Protocol("backend worker unavailable".into()), out);
        };
        if let Some(err) = msg.error() {
            return write_error(err, out);
        }
        match msg.reply() {
            Some(Reply::McText(raw)) if raw.ends_with(b"END\r\n") => {
                sections.push(raw);
            }
            Some(Reply::McText(raw)) => {
                // Backend answered with an error line; surface it once.
                out.put(raw);
                return;
            }
            _ => return write_error(&ProxyError::Protocol("reply missing".into()), out),
        }
    }
    for raw in sections {
        out.put(&raw[..raw.len() - 5]);
    }
    out.put(b"END\r\n");
}

/// The protocol's native error form.
pub fn write_error(err: &(impl std::fmt::Display + ?Sized), out: &mut SendBuffer) {
    out.put(b"SERVER_ERROR ");
    out.put(err.to_string().replace(['\r', '\n'], " ").as_bytes());
    out.put(b"\r\n");
}
