//! Incremental RESP decoder and encoder.
//!
//! The decoder is a stack of per-tag sub-parsers. The top of the stack
//! consumes bytes from the shared input buffer, removing exactly what it
//! used; if its value isn't complete yet it leaves its partial state in
//! place and waits for the next [`Decoder::feed`]. An array frame sits
//! beneath the child frame currently being parsed and only receives a
//! bubbled-up value when that child completes — this is what lets
//! fragmentation (even a split length digit, a split CRLF, or a half-written
//! bulk body) resume without re-scanning or re-buffering anything beyond the
//! single value still in flight.

use crate::error::RedisError;
use crate::reply::Reply;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
enum LineKind {
    Simple,
    Error,
    Integer,
    BulkLen,
    ArrayLen,
}

enum Frame {
    /// Waiting for the one-byte tag that starts a value.
    Tag,
    /// Accumulating bytes up to a CRLF terminator.
    Line { kind: LineKind, acc: Vec<u8> },
    /// Accumulating a bulk string's declared-length body.
    BulkBody { remaining: usize, data: Vec<u8> },
    /// Body fully read; waiting for the trailing CRLF.
    BulkTrailingCrlf { data: Vec<u8> },
    /// An array awaiting `remaining` more child values.
    Array { remaining: usize, items: Vec<Reply> },
}

/// Feeds unframed byte chunks in and yields a lazy sequence of decoded
/// replies out. See [`Decoder::feed`] / [`Decoder::pop`].
pub struct Decoder {
    buf: BytesMut,
    stack: Vec<Frame>,
    ready: VecDeque<Reply>,
    poisoned: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder {
            buf: BytesMut::new(),
            stack: Vec::new(),
            ready: VecDeque::new(),
            poisoned: false,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of freshly-read bytes. Decodes as many complete replies
    /// as the buffer now allows; fetch them with [`Decoder::pop`].
    ///
    /// On a malformed frame this returns `Err` and the decoder is poisoned:
    /// no further bytes can be fed. The caller (the [`crate::Connection`])
    /// must tear the connection down; replies already queued before the
    /// error remain available via `pop`.
    pub fn feed(&mut self, bytes: &[u8]) -> crate::Result<()> {
        if self.poisoned {
            return Err(RedisError::Protocol(
                "decoder is poisoned after a prior protocol error".into(),
            ));
        }
        self.buf.extend_from_slice(bytes);
        if let Err(e) = self.run() {
            self.poisoned = true;
            return Err(e);
        }
        Ok(())
    }

    /// Pop the next fully-decoded reply, if any.
    pub fn pop(&mut self) -> Option<Reply> {
        self.ready.pop_front()
    }

    /// Resets all in-progress parse state. Called by the connection after a
    /// disconnect; a fresh decoder always starts with no partial value.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stack.clear();
        self.ready.clear();
        self.poisoned = false;
    }

    fn run(&mut self) -> crate::Result<()> {
        loop {
            if self.stack.is_empty() {
                if self.buf.is_empty() {
                    return Ok(());
                }
                self.stack.push(Frame::Tag);
            }

            match self.advance_top()? {
                Some(value) => self.bubble(value),
                None => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Makes one step of progress on the top-of-stack frame. Returns
    /// `Ok(Some(reply))` when that frame just completed a value (the frame
    /// has already been popped), `Ok(None)` if it needs more input (or made
    /// partial progress without completing), or `Err` on a malformed frame.
    fn advance_top(&mut self) -> crate::Result<Option<Reply>> {
        match self.stack.last_mut().expect("stack is non-empty") {
            Frame::Tag => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let tag = self.buf.split_to(1)[0];
                let kind = match tag {
                    b'+' => LineKind::Simple,
                    b'-' => LineKind::Error,
                    b':' => LineKind::Integer,
                    b'$' => LineKind::BulkLen,
                    b'*' => LineKind::ArrayLen,
                    other => {
                        return Err(RedisError::Protocol(format!(
                            "invalid frame type byte '{}'",
                            other as char
                        )))
                    }
                };
                *self.stack.last_mut().unwrap() = Frame::Line {
                    kind,
                    acc: Vec::new(),
                };
                Ok(None)
            }

            Frame::Line { .. } => self.advance_line(),

            Frame::BulkBody { .. } => {
                let (remaining, data) = match self.stack.last_mut().unwrap() {
                    Frame::BulkBody { remaining, data } => (remaining, data),
                    _ => unreachable!(),
                };
                if *remaining > 0 {
                    let take = (*remaining).min(self.buf.len());
                    if take == 0 {
                        return Ok(None);
                    }
                    data.extend_from_slice(&self.buf.split_to(take));
                    *remaining -= take;
                }
                if *remaining == 0 {
                    let data = std::mem::take(data);
                    *self.stack.last_mut().unwrap() = Frame::BulkTrailingCrlf { data };
                }
                Ok(None)
            }

            Frame::BulkTrailingCrlf { .. } => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                let terminator = self.buf.split_to(2);
                if &terminator[..] != b"\r\n" {
                    return Err(RedisError::Protocol(
                        "wrong CRLF terminator after bulk body".into(),
                    ));
                }
                let data = match self.stack.pop().unwrap() {
                    Frame::BulkTrailingCrlf { data } => data,
                    _ => unreachable!(),
                };
                Ok(Some(Reply::BulkString(Some(Bytes::from(data)))))
            }

            Frame::Array { .. } => {
                // An array frame never sits at the top by itself: it gets a
                // child `Tag` frame pushed on creation and is only touched
                // again via `bubble`. Reaching here would be a bug.
                unreachable!("array frames never self-advance")
            }
        }
    }

    fn advance_line(&mut self) -> crate::Result<Option<Reply>> {
        if !self.buf.is_empty() {
            let drained = self.buf.split_to(self.buf.len());
            match self.stack.last_mut().unwrap() {
                Frame::Line { acc, .. } => acc.extend_from_slice(&drained),
                _ => unreachable!(),
            }
        }

        let pos = match self.stack.last().unwrap() {
            Frame::Line { acc, .. } => find_crlf(acc),
            _ => unreachable!(),
        };

        let Some(idx) = pos else {
            return Ok(None);
        };

        let (kind, line, remainder) = match self.stack.pop().unwrap() {
            Frame::Line { kind, mut acc } => {
                let remainder = acc.split_off(idx + 2);
                acc.truncate(idx);
                (kind, acc, remainder)
            }
            _ => unreachable!(),
        };
        self.buf = BytesMut::from(&remainder[..]);

        match kind {
            LineKind::Simple => {
                let s = String::from_utf8(line)
                    .map_err(|_| RedisError::Protocol("invalid utf-8 in simple string".into()))?;
                Ok(Some(Reply::SimpleString(s)))
            }
            LineKind::Error => {
                let s = String::from_utf8(line)
                    .map_err(|_| RedisError::Protocol("invalid utf-8 in error string".into()))?;
                Ok(Some(Reply::Error(s)))
            }
            LineKind::Integer => {
                let n = parse_signed(&line)
                    .ok_or_else(|| RedisError::Protocol("invalid integer frame".into()))?;
                Ok(Some(Reply::Integer(n)))
            }
            LineKind::BulkLen => {
                let n = parse_signed(&line)
                    .ok_or_else(|| RedisError::Protocol("invalid bulk length".into()))?;
                if n == -1 {
                    Ok(Some(Reply::BulkString(None)))
                } else if n < 0 {
                    Err(RedisError::Protocol("invalid bulk length".into()))
                } else {
                    self.stack.push(Frame::BulkBody {
                        remaining: n as usize,
                        data: Vec::with_capacity(n as usize),
                    });
                    Ok(None)
                }
            }
            LineKind::ArrayLen => {
                let n = parse_signed(&line)
                    .ok_or_else(|| RedisError::Protocol("invalid array length".into()))?;
                if n == -1 {
                    Ok(Some(Reply::Array(None)))
                } else if n < 0 {
                    Err(RedisError::Protocol("invalid array length".into()))
                } else if n == 0 {
                    Ok(Some(Reply::Array(Some(Vec::new()))))
                } else {
                    self.stack.push(Frame::Array {
                        remaining: n as usize,
                        items: Vec::with_capacity(n as usize),
                    });
                    self.stack.push(Frame::Tag);
                    Ok(None)
                }
            }
        }
    }

    /// Delivers a completed value either to the caller's ready queue (if
    /// the stack is now empty) or to the array frame waiting beneath it,
    /// recursing if that delivery completes the array in turn.
    fn bubble(&mut self, mut value: Reply) {
        loop {
            match self.stack.last_mut() {
                None => {
                    self.ready.push_back(value);
                    return;
                }
                Some(Frame::Array { remaining, items }) => {
                    items.push(value);
                    *remaining -= 1;
                    if *remaining == 0 {
                        let items = match self.stack.pop().unwrap() {
                            Frame::Array { items, .. } => items,
                            _ => unreachable!(),
                        };
                        value = Reply::Array(Some(items));
                        continue;
                    }
                    self.stack.push(Frame::Tag);
                    return;
                }
                Some(_) => unreachable!("only array frames await bubbled values"),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses an ASCII-decimal integer allowing a leading `-` but never a
/// leading `+`. `atoi` accepts only a leading minus for signed types, so
/// the explicit `+` check is all that's needed on top.
fn parse_signed(buf: &[u8]) -> Option<i64> {
    if buf.first() == Some(&b'+') {
        return None;
    }
    atoi::atoi::<i64>(buf)
}

/// Encodes an argv as a RESP array of bulk strings.
pub fn encode_command(argv: &[Bytes]) -> BytesMut {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", argv.len()).as_bytes());
    for arg in argv {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}
