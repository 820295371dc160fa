// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Dynamic value tree, and the bounded-depth walker that builds or
//! flattens one against the token codec.
//!
//! Both directions use an explicit stack rather than native recursion,
//! so a pathological nesting depth fails with a recoverable status
//! instead of blowing the call stack.

use crate::codec::{encode_token_owned, read_token, Status, Token, Tokbuf};

/// Caps the initial capacity reserved for a length-prefixed container
/// or payload, so a forged huge length header can't force a large
/// up-front allocation before any bytes back it up.
const PREALLOC_CAP: usize = 4096;

fn sane_capacity(n: u32) -> usize {
    (n as usize).min(PREALLOC_CAP)
}

/// A MessagePack value. Maps are ordered pairs, not a hash map, since
/// the wire format allows duplicate or non-hashable keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    UInt(u64),
    SInt(i64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Ext(i8, Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Why `parse_value`/`encode_value` didn't finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    /// Input ran out before the value was complete; the caller hasn't
    /// consumed anything as far as it can tell, and should retry with
    /// more bytes appended (see the stream adapter for how callers
    /// accumulate them).
    Eof,
    /// A malformed token prefix; terminal for this parse.
    Error,
    /// Nesting exceeded the configured depth. Retry with a larger
    /// `max_depth`; since the walker never mutates the caller's
    /// original slice reference, retrying reparses from the same spot.
    NoMem,
}

impl From<Status> for WalkStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Ok => unreachable!("Ok is not an error status"),
            Status::Eof => WalkStatus::Eof,
            Status::Error => WalkStatus::Error,
        }
    }
}

enum BytesKind {
    Str,
    Bin,
    Ext(i8),
}

enum Frame {
    Array {
        items: Vec<Value>,
        remaining: u32,
    },
    Map {
        pairs: Vec<(Value, Value)>,
        remaining_pairs: u32,
        key: Option<Value>,
    },
    Bytes {
        buf: Vec<u8>,
        remaining: u32,
        kind: BytesKind,
    },
}

fn finish_bytes(kind: BytesKind, buf: Vec<u8>) -> Value {
    match kind {
        BytesKind::Str => Value::Str(String::from_utf8_lossy(&buf).into_owned()),
        BytesKind::Bin => Value::Bin(buf),
        BytesKind::Ext(ty) => Value::Ext(ty, buf),
    }
}

/// Attach a completed child value to its parent frame, cascading the
/// completion upward through any parents that become complete as a
/// result. Returns the root value once the whole tree is done.
fn attach(stack: &mut Vec<Frame>, mut v: Value) -> Option<Value> {
    loop {
        match stack.last_mut() {
            None => return Some(v),
            Some(Frame::Array { items, remaining }) => {
                items.push(v);
                *remaining -= 1;
                if *remaining != 0 {
                    return None;
                }
                let Some(Frame::Array { items, .. }) = stack.pop() else {
                    unreachable!()
                };
                v = Value::Array(items);
            }
            Some(Frame::Map {
                pairs,
                remaining_pairs,
                key,
            }) => {
                if key.is_none() {
                    *key = Some(v);
                    return None;
                }
                let k = key.take().unwrap();
                pairs.push((k, v));
                *remaining_pairs -= 1;
                if *remaining_pairs != 0 {
                    return None;
                }
                let Some(Frame::Map { pairs, .. }) = stack.pop() else {
                    unreachable!()
                };
                v = Value::Map(pairs);
            }
            Some(Frame::Bytes { .. }) => {
                unreachable!("a bytes frame completes via Chunk, never via attach")
            }
        }
    }
}

/// Parse one complete `Value` from the front of `buf`.
///
/// On success, returns the value and the number of bytes of `buf` it
/// consumed. `buf` itself is never mutated; a `WalkStatus::Eof` or
/// `WalkStatus::NoMem` can simply be retried against the same slice
/// (with more bytes appended, or a larger `max_depth`, respectively).
pub fn parse_value(buf: &[u8], max_depth: usize) -> Result<(Value, usize), WalkStatus> {
    let mut tokbuf = Tokbuf::new();
    let mut cursor: &[u8] = buf;
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let (status, tok) = read_token(&mut tokbuf, &mut cursor);
        if status != Status::Ok {
            return Err(status.into());
        }
        let tok = tok.expect("Status::Ok always carries a token");

        let value: Option<Value> = match tok {
            Token::Nil => Some(Value::Nil),
            Token::Bool(b) => Some(Value::Bool(b)),
            Token::UInt(n) => Some(Value::UInt(n)),
            Token::SInt(n) => Some(Value::SInt(n)),
            Token::Float(f) => Some(Value::Float(f)),
            Token::Array(n) => {
                if n == 0 {
                    Some(Value::Array(Vec::new()))
                } else {
                    if stack.len() >= max_depth {
                        return Err(WalkStatus::NoMem);
                    }
                    stack.push(Frame::Array {
                        items: Vec::with_capacity(sane_capacity(n)),
                        remaining: n,
                    });
                    None
                }
            }
            Token::Map(n) => {
                if n == 0 {
                    Some(Value::Map(Vec::new()))
                } else {
                    if stack.len() >= max_depth {
                        return Err(WalkStatus::NoMem);
                    }
                    stack.push(Frame::Map {
                        pairs: Vec::with_capacity(sane_capacity(n)),
                        remaining_pairs: n,
                        key: None,
                    });
                    None
                }
            }
            Token::Str(0) => Some(Value::Str(String::new())),
            Token::Bin(0) => Some(Value::Bin(Vec::new())),
            Token::Ext(ty, 0) => Some(Value::Ext(ty, Vec::new())),
            Token::Str(n) => {
                if stack.len() >= max_depth {
                    return Err(WalkStatus::NoMem);
                }
                stack.push(Frame::Bytes {
                    buf: Vec::with_capacity(sane_capacity(n)),
                    remaining: n,
                    kind: BytesKind::Str,
                });
                None
            }
            Token::Bin(n) => {
                if stack.len() >= max_depth {
                    return Err(WalkStatus::NoMem);
                }
                stack.push(Frame::Bytes {
                    buf: Vec::with_capacity(sane_capacity(n)),
                    remaining: n,
                    kind: BytesKind::Bin,
                });
                None
            }
            Token::Ext(ty, n) => {
                if stack.len() >= max_depth {
                    return Err(WalkStatus::NoMem);
                }
                stack.push(Frame::Bytes {
                    buf: Vec::with_capacity(sane_capacity(n)),
                    remaining: n,
                    kind: BytesKind::Ext(ty),
                });
                None
            }
            Token::Chunk(data) => {
                let Some(Frame::Bytes { buf, remaining, .. }) = stack.last_mut() else {
                    unreachable!("a Chunk always follows an open Bytes frame")
                };
                buf.extend_from_slice(data);
                *remaining -= data.len() as u32;
                if *remaining != 0 {
                    None
                } else {
                    let Some(Frame::Bytes { buf, kind, .. }) = stack.pop() else {
                        unreachable!()
                    };
                    Some(finish_bytes(kind, buf))
                }
            }
        };

        if let Some(v) = value {
            if let Some(root) = attach(&mut stack, v) {
                let consumed = buf.len() - cursor.len();
                return Ok((root, consumed));
            }
        }
    }
}

enum EncodeFrame<'v> {
    Array(std::slice::Iter<'v, Value>),
    Map(std::slice::Iter<'v, (Value, Value)>, Option<&'v Value>),
}

/// Flatten `value` into MessagePack bytes appended to `out`.
///
/// `out` is a growable sink (built for an in-memory message buffer,
/// not a fixed-size transport window), so there is no `Eof` case here:
/// the only failure is exceeding `max_depth`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>, max_depth: usize) -> Result<(), WalkStatus> {
    let mut stack: Vec<EncodeFrame> = Vec::new();
    let mut current: Option<&Value> = Some(value);

    loop {
        if let Some(v) = current.take() {
            match v {
                Value::Nil => out.extend(encode_token_owned(&Token::Nil)),
                Value::Bool(b) => out.extend(encode_token_owned(&Token::Bool(*b))),
                Value::UInt(n) => out.extend(encode_token_owned(&Token::UInt(*n))),
                Value::SInt(n) => out.extend(encode_token_owned(&Token::SInt(*n))),
                Value::Float(f) => out.extend(encode_token_owned(&Token::Float(*f))),
                Value::Str(s) => {
                    out.extend(encode_token_owned(&Token::Str(s.len() as u32)));
                    out.extend_from_slice(s.as_bytes());
                }
                Value::Bin(b) => {
                    out.extend(encode_token_owned(&Token::Bin(b.len() as u32)));
                    out.extend_from_slice(b);
                }
                Value::Ext(ty, b) => {
                    out.extend(encode_token_owned(&Token::Ext(*ty, b.len() as u32)));
                    out.extend_from_slice(b);
                }
                Value::Array(items) => {
                    if stack.len() >= max_depth {
                        return Err(WalkStatus::NoMem);
                    }
                    out.extend(encode_token_owned(&Token::Array(items.len() as u32)));
                    stack.push(EncodeFrame::Array(items.iter()));
                }
                Value::Map(pairs) => {
                    if stack.len() >= max_depth {
                        return Err(WalkStatus::NoMem);
                    }
                    out.extend(encode_token_owned(&Token::Map(pairs.len() as u32)));
                    stack.push(EncodeFrame::Map(pairs.iter(), None));
                }
            }
        }

        loop {
            match stack.last_mut() {
                None => return Ok(()),
                Some(EncodeFrame::Array(it)) => match it.next() {
                    Some(v) => {
                        current = Some(v);
                        break;
                    }
                    None => {
                        stack.pop();
                    }
                },
                Some(EncodeFrame::Map(it, pending)) => {
                    if let Some(v) = pending.take() {
                        current = Some(v);
                        break;
                    }
                    match it.next() {
                        Some((k, v)) => {
                            *pending = Some(v);
                            current = Some(k);
                            break;
                        }
                        None => {
                            stack.pop();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        for v in [
            Value::Nil,
            Value::Bool(true),
            Value::UInt(9001),
            Value::SInt(-9001),
            Value::Float(3.5),
            Value::Str("hello".into()),
            Value::Bin(vec![1, 2, 3]),
        ] {
            let mut out = Vec::new();
            encode_value(&v, &mut out, 32).unwrap();
            let (back, consumed) = parse_value(&out, 32).unwrap();
            assert_eq!(consumed, out.len());
            assert_eq!(back, v);
        }
    }

    #[test]
    fn nested_array_and_map() {
        let v = Value::Array(vec![
            Value::Map(vec![
                (Value::Str("a".into()), Value::UInt(1)),
                (Value::Str("b".into()), Value::SInt(-2)),
            ]),
            Value::Array(vec![Value::Nil, Value::Bool(false)]),
        ]);
        let mut out = Vec::new();
        encode_value(&v, &mut out, 32).unwrap();
        let (back, _) = parse_value(&out, 32).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn empty_containers() {
        let v = Value::Array(vec![Value::Map(vec![]), Value::Array(vec![])]);
        let mut out = Vec::new();
        encode_value(&v, &mut out, 32).unwrap();
        let (back, _) = parse_value(&out, 32).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn depth_limit_is_recoverable() {
        let mut v = Value::Nil;
        for _ in 0..10 {
            v = Value::Array(vec![v]);
        }
        let mut out = Vec::new();
        encode_value(&v, &mut out, 32).unwrap();

        assert_eq!(parse_value(&out, 3), Err(WalkStatus::NoMem));
        let (back, _) = parse_value(&out, 32).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn truncated_input_is_eof() {
        let v = Value::Array(vec![Value::UInt(1), Value::UInt(2), Value::UInt(3)]);
        let mut out = Vec::new();
        encode_value(&v, &mut out, 32).unwrap();
        assert_eq!(parse_value(&out[..out.len() - 1], 32), Err(WalkStatus::Eof));
    }

    #[test]
    fn extra_trailing_bytes_are_not_consumed() {
        let v = Value::UInt(7);
        let mut out = Vec::new();
        encode_value(&v, &mut out, 32).unwrap();
        out.push(0xff); // a second, unrelated value follows
        let (back, consumed) = parse_value(&out, 32).unwrap();
        assert_eq!(back, v);
        assert_eq!(consumed, out.len() - 1);
    }
}
