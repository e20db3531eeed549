//! In-flight request objects: messages, per-node batches, and the dispatch
//! bookkeeping a client session uses to reassemble replies in order.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{MsgError, ProxyError};
use crate::memcache::McRequest;
use crate::memcache_bin::McBinRequest;
use crate::resp::RedisRequest;

/// Parsed client request, tagged by protocol.
#[derive(Debug)]
pub enum Request {
    Redis(RedisRequest),
    McText(McRequest),
    McBin(McBinRequest),
}

impl Request {
    /// Routing key for this request. Empty for key-less commands, which
    /// still hash (to an arbitrary but stable node).
    pub fn key(&self) -> &[u8] {
        match self {
            Request::Redis(r) => r.key(),
            Request::McText(r) => r.key(),
            Request::McBin(r) => r.key(),
        }
    }

    /// True when the client asked to end the session.
    pub fn is_quit(&self) -> bool {
        match self {
            Request::Redis(r) => r.is_quit(),
            Request::McText(r) => r.is_quit(),
            Request::McBin(r) => r.is_quit(),
        }
    }
}

/// Decoded backend reply, tagged by protocol.
#[derive(Debug, Clone)]
pub enum Reply {
    Redis(crate::resp::RespValue),
    /// Raw memcache text response bytes, emitted to the client verbatim.
    McText(bytes::Bytes),
    /// Raw memcache binary response packet (header plus body).
    McBin(bytes::Bytes),
}

/// One client request's lifetime: the parsed request, its reply or error
/// slot, lifecycle marks, and sub-messages when the request was split.
#[derive(Debug)]
pub struct Message {
    request: Request,
    subs: Vec<Message>,
    reply: Option<Reply>,
    error: Option<MsgError>,
    done: bool,
    enqueued_at: Option<Instant>,
    written_at: Option<Instant>,
    read_at: Option<Instant>,
    done_at: Option<Instant>,
}

impl Message {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            subs: Vec::new(),
            reply: None,
            error: None,
            done: false,
            enqueued_at: None,
            written_at: None,
            read_at: None,
            done_at: None,
        }
    }

    /// Build a composite message whose children are dispatched individually.
    pub fn with_subs(request: Request, subs: Vec<Message>) -> Self {
        let mut m = Self::new(request);
        m.subs = subs;
        m
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_composite(&self) -> bool {
        !self.subs.is_empty()
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    /// Move the children out for dispatch; the parent stays with the session.
    pub fn take_subs(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.subs)
    }

    pub fn mark_enqueue(&mut self) {
        self.enqueued_at = Some(Instant::now());
    }

    pub fn mark_write(&mut self) {
        self.written_at = Some(Instant::now());
    }

    /// Store the backend reply and mark the read point.
    pub fn set_reply(&mut self, reply: Reply) {
        self.read_at = Some(Instant::now());
        self.reply = Some(reply);
    }

    /// The reply is readable only once the read mark is set.
    pub fn reply(&self) -> Option<&Reply> {
        self.read_at.and(self.reply.as_ref())
    }

    pub fn error(&self) -> Option<&MsgError> {
        self.error.as_ref()
    }

    /// Terminal success. A message takes exactly one terminal transition;
    /// later calls are ignored.
    pub fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.done_at = Some(Instant::now());
    }

    /// Terminal failure.
    pub fn fail(&mut self, err: MsgError) {
        if self.done {
            return;
        }
        self.done = true;
        self.done_at = Some(Instant::now());
        self.error = Some(err);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Where a dispatched message re-attaches in its session window.
#[derive(Debug, Clone, Copy)]
pub struct Origin {
    pub slot: usize,
    /// `None` for a stand-alone message, `Some(i)` for the i-th child of a
    /// composite.
    pub sub: Option<usize>,
}

/// Ordered collection of messages bound for one backend node.
#[derive(Debug)]
pub struct MsgBatch {
    addr: String,
    msgs: Vec<Message>,
    origins: Vec<Origin>,
    done_tx: Option<oneshot::Sender<MsgBatch>>,
}

impl MsgBatch {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            msgs: Vec::new(),
            origins: Vec::new(),
            done_tx: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn count(&self) -> usize {
        self.msgs.len()
    }

    pub fn push(&mut self, origin: Origin, mut msg: Message) {
        msg.mark_enqueue();
        self.msgs.push(msg);
        self.origins.push(origin);
    }

    pub fn msgs(&self) -> &[Message] {
        &self.msgs
    }

    pub fn msgs_mut(&mut self) -> &mut [Message] {
        &mut self.msgs
    }

    /// Arm the completion channel the worker will answer on.
    pub fn arm(&mut self, tx: oneshot::Sender<MsgBatch>) {
        self.done_tx = Some(tx);
    }

    /// Tag every message in the batch with the same failure.
    pub fn fail_all(&mut self, err: ProxyError, cluster: &str) {
        let shared: MsgError = std::sync::Arc::new(err.at_node(cluster, &self.addr));
        for m in &mut self.msgs {
            m.fail(shared.clone());
        }
    }

    /// Finish every message and hand the batch back to its session.
    ///
    /// Dropping the batch without calling this leaves the session's
    /// completion receiver erroring out, which the session treats as a
    /// failed batch.
    pub fn complete(mut self) {
        for m in &mut self.msgs {
            m.finish();
        }
        if let Some(tx) = self.done_tx.take() {
            // The session may have gone away; its replies are then discarded.
            let _ = tx.send(self);
        }
    }

    pub fn into_parts(self) -> (Vec<Origin>, Vec<Message>) {
        (self.origins, self.msgs)
    }
}

/// Per-dispatch-window scratchpad mapping backend address to batch.
#[derive(Debug, Default)]
pub struct MsgBatchAllocator {
    batches: HashMap<String, MsgBatch>,
}

impl MsgBatchAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: &str, origin: Origin, msg: Message) {
        self.batches
            .entry(addr.to_owned())
            .or_insert_with(|| MsgBatch::new(addr))
            .push(origin, msg);
    }

    pub fn into_batches(self) -> impl Iterator<Item = MsgBatch> {
        self.batches.into_values().filter(|mb| mb.count() > 0)
    }
}

/// One window position awaiting its reply material.
#[derive(Debug)]
pub struct Slot {
    /// The client-visible message. `None` while a stand-alone message is out
    /// with its batch; always present for composites.
    pub parent: Option<Message>,
    /// Returned children of a composite, in original argument order.
    pub subs: Vec<Option<Message>>,
}

impl Slot {
    pub fn single() -> Self {
        Slot {
            parent: None,
            subs: Vec::new(),
        }
    }

    pub fn restored(msg: Message) -> Self {
        Slot {
            parent: Some(msg),
            subs: Vec::new(),
        }
    }

    pub fn composite(parent: Message, children: usize) -> Self {
        Slot {
            parent: Some(parent),
            subs: (0..children).map(|_| None).collect(),
        }
    }
}

/// A dispatched window: slots to reassemble plus the completion channels of
/// every batch pushed to a backend queue.
#[derive(Debug)]
pub struct Dispatch {
    slots: Vec<Slot>,
    completions: Vec<oneshot::Receiver<MsgBatch>>,
}

impl Dispatch {
    pub fn new(slots: Vec<Slot>, completions: Vec<oneshot::Receiver<MsgBatch>>) -> Self {
        Self { slots, completions }
    }

    /// Await every batch and re-attach returned messages to their slots.
    ///
    /// Completion order across batches is arbitrary; slot positions keep the
    /// client's submission order. A batch whose worker vanished leaves its
    /// messages missing, which the session reports as a backend failure.
    pub async fn settle(mut self) -> Vec<Slot> {
        for rx in self.completions {
            if let Ok(batch) = rx.await {
                let (origins, msgs) = batch.into_parts();
                for (origin, msg) in origins.into_iter().zip(msgs) {
                    restore(&mut self.slots, origin, msg);
                }
            }
        }
        self.slots
    }
}

/// Dispatch failed before any batch was pushed; the window's messages (where
/// still available) are restored so the session can answer each request.
#[derive(Debug)]
pub struct WindowAbort {
    pub err: ProxyError,
    pub slots: Vec<Slot>,
}

pub(crate) fn restore(slots: &mut [Slot], origin: Origin, msg: Message) {
    match origin.sub {
        None => slots[origin.slot].parent = Some(msg),
        Some(i) => slots[origin.slot].subs[i] = Some(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::RedisRequest;

    fn req(verb: &str, key: &str) -> Request {
        Request::Redis(RedisRequest::from_parts(verb.as_bytes(), &[key.as_bytes()]))
    }

    #[test]
    fn terminal_transition_is_exclusive() {
        let mut m = Message::new(req("GET", "k"));
        m.finish();
        assert!(m.is_done());
        m.fail(std::sync::Arc::new(ProxyError::NoRoute));
        assert!(m.error().is_none(), "failure after success is ignored");

        let mut m = Message::new(req("GET", "k"));
        m.fail(std::sync::Arc::new(ProxyError::NoRoute));
        m.finish();
        assert!(m.error().is_some(), "success after failure is ignored");
    }

    #[test]
    fn reply_visible_only_after_read_mark() {
        let mut m = Message::new(req("GET", "k"));
        assert!(m.reply().is_none());
        m.set_reply(Reply::Redis(crate::resp::RespValue::NullBulk));
        assert!(m.reply().is_some());
    }

    #[test]
    fn batch_completion_returns_messages_to_origin_slots() {
        let mut slots = vec![Slot::single(), Slot::composite(Message::new(req("MGET", "")), 2)];
        let mut mb = MsgBatch::new("127.0.0.1:6379");
        mb.push(Origin { slot: 0, sub: None }, Message::new(req("GET", "a")));
        mb.push(
            Origin {
                slot: 1,
                sub: Some(1),
            },
            Message::new(req("GET", "c")),
        );
        let (origins, msgs) = mb.into_parts();
        for (o, m) in origins.into_iter().zip(msgs) {
            restore(&mut slots, o, m);
        }
        assert!(slots[0].parent.is_some());
        assert!(slots[1].subs[1].is_some());
        assert!(slots[1].subs[0].is_none());
    }

    #[test]
    fn fail_all_tags_cluster_and_addr() {
        let mut mb = MsgBatch::new("10.1.1.1:11211");
        mb.push(Origin { slot: 0, sub: None }, Message::new(req("GET", "a")));
        mb.fail_all(ProxyError::NoRoute, "test-pool");
        let err = mb.msgs()[0].error().unwrap();
        let text = err.to_string();
        assert!(text.contains("10.1.1.1:11211") && text.contains("test-pool"));
    }
}
