// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! RPC framing on top of the token codec: encodes/decodes the
//! 3-/4-element arrays MessagePack-RPC wraps every message in, and
//! tracks outstanding requests so responses can be matched back to
//! their caller's data.

use crate::codec::{read_token, Status, Token, Tokbuf};
use crate::message::Message;
use crate::value::{parse_value, Value, WalkStatus};
use crate::ProtocolError;

pub const DEFAULT_IN_FLIGHT_CAPACITY: usize = 32;
pub const DEFAULT_MAX_DEPTH: usize = 32;

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFICATION: u64 = 2;

/// Slot state for the in-flight request table. `Tombstone` marks a
/// popped slot without breaking the probe chain for entries that were
/// displaced past it.
enum Slot<U> {
    Empty,
    Tombstone,
    Occupied(u32, U),
}

enum PutResult<U> {
    Inserted,
    Duplicate(U),
    Full(U),
}

/// Fixed-size open-addressed table mapping outstanding request ids to
/// caller-supplied correlator data, probed in reverse (hash, hash-1,
/// hash-2, ... wrapping).
struct InFlightTable<U> {
    slots: Vec<Slot<U>>,
    len: usize,
}

impl<U> InFlightTable<U> {
    fn new(capacity: usize) -> Self {
        let cap = capacity.max(1).next_power_of_two();
        InFlightTable {
            slots: (0..cap).map(|_| Slot::Empty).collect(),
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn probe(&self, id: u32) -> impl Iterator<Item = usize> + '_ {
        let cap = self.slots.len();
        let hash = (id as usize) % cap;
        (0..cap).map(move |i| (hash + cap - i) % cap)
    }

    fn contains(&self, id: u32) -> bool {
        for idx in self.probe(id) {
            match &self.slots[idx] {
                Slot::Occupied(existing, _) if *existing == id => return true,
                Slot::Empty => return false,
                _ => continue,
            }
        }
        false
    }

    fn put(&mut self, id: u32, value: U) -> PutResult<U> {
        let mut first_tombstone = None;
        for idx in self.probe(id) {
            match &self.slots[idx] {
                Slot::Occupied(existing, _) if *existing == id => {
                    return PutResult::Duplicate(value)
                }
                Slot::Occupied(_, _) => continue,
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Empty => {
                    let target = first_tombstone.unwrap_or(idx);
                    self.slots[target] = Slot::Occupied(id, value);
                    self.len += 1;
                    return PutResult::Inserted;
                }
            }
        }
        if let Some(target) = first_tombstone {
            self.slots[target] = Slot::Occupied(id, value);
            self.len += 1;
            return PutResult::Inserted;
        }
        PutResult::Full(value)
    }

    fn pop(&mut self, id: u32) -> Option<U> {
        for idx in self.probe(id) {
            match &self.slots[idx] {
                Slot::Occupied(existing, _) if *existing == id => {
                    let Slot::Occupied(_, v) = std::mem::replace(&mut self.slots[idx], Slot::Tombstone)
                    else {
                        unreachable!()
                    };
                    self.len -= 1;
                    return Some(v);
                }
                Slot::Empty => return None,
                _ => continue,
            }
        }
        None
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, (0..new_cap).map(|_| Slot::Empty).collect());
        self.len = 0;
        for slot in old {
            if let Slot::Occupied(id, v) = slot {
                match self.put(id, v) {
                    PutResult::Inserted => {}
                    _ => unreachable!("a freshly doubled table always has room"),
                }
            }
        }
    }
}

/// A message as delivered by [`Session::receive`]. For responses, the
/// id has already been matched against the in-flight table and
/// replaced with the caller's original correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Received<U> {
    Request { id: u32, method: String, args: Value },
    Response { userdata: U, error: Value, result: Value },
    Notification { method: String, args: Value },
}

/// Terminal or recoverable outcome of [`Session::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Eof,
    NoMem,
    Error,
    Protocol(ProtocolError),
}

impl From<Status> for ReceiveStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Ok => unreachable!(),
            Status::Eof => ReceiveStatus::Eof,
            Status::Error => ReceiveStatus::Error,
        }
    }
}

impl From<WalkStatus> for ReceiveStatus {
    fn from(s: WalkStatus) -> Self {
        match s {
            WalkStatus::Eof => ReceiveStatus::Eof,
            WalkStatus::NoMem => ReceiveStatus::NoMem,
            WalkStatus::Error => ReceiveStatus::Error,
        }
    }
}

/// Advances `next_id` modulo 2^32-1, the range request ids wrap
/// within (§4.3): `u32::MAX` is never issued.
fn wrapping_next_id(id: u32) -> u32 {
    let modulus = u32::MAX as u64;
    (((id as u64) + 1) % modulus) as u32
}

/// One endpoint's half of an RPC conversation: allocates request ids,
/// tracks which are outstanding, and frames/deframes the wire arrays.
/// Not internally synchronized — one session belongs to one owner at
/// a time (see the endpoint modules for how concurrent access is
/// serialized).
pub struct Session<U> {
    next_id: u32,
    table: InFlightTable<U>,
    max_depth: usize,
}

impl<U> Session<U> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_IN_FLIGHT_CAPACITY, DEFAULT_MAX_DEPTH)
    }

    pub fn with_capacity(in_flight_capacity: usize, max_depth: usize) -> Self {
        Session {
            next_id: 0,
            table: InFlightTable::new(in_flight_capacity),
            max_depth,
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.table.len()
    }

    /// Encode a request, allocating a fresh id and recording `userdata`
    /// under it before returning. On failure, `userdata` is handed
    /// back untouched and no id is consumed.
    pub fn encode_request(
        &mut self,
        method: &str,
        args: &Value,
        userdata: U,
    ) -> Result<(u32, Vec<u8>), (U, WalkStatus)> {
        let mut id = self.next_id;
        let mut probes = 0usize;
        while self.table.contains(id) {
            id = wrapping_next_id(id);
            probes += 1;
            if probes > self.table.capacity() {
                return Err((userdata, WalkStatus::NoMem));
            }
        }

        let userdata = match self.table.put(id, userdata) {
            PutResult::Inserted => None,
            PutResult::Duplicate(_) => unreachable!("contains() already ruled out this id"),
            PutResult::Full(u) => {
                self.table.grow();
                match self.table.put(id, u) {
                    PutResult::Inserted => None,
                    _ => unreachable!("a freshly grown table always has room"),
                }
            }
        };
        debug_assert!(userdata.is_none());

        self.next_id = wrapping_next_id(id);

        let message = Message::request(id, method, args.clone());
        match self.encode_growing(&message) {
            Ok(bytes) => Ok((id, bytes)),
            Err(status) => Err((self.table.pop(id).expect("just inserted"), status)),
        }
    }

    pub fn encode_notification(&mut self, method: &str, args: &Value) -> Result<Vec<u8>, WalkStatus> {
        self.encode_growing(&Message::notification(method, args.clone()))
    }

    pub fn encode_response(
        &mut self,
        id: u32,
        error: &Value,
        result: &Value,
    ) -> Result<Vec<u8>, WalkStatus> {
        self.encode_growing(&Message::Response {
            id,
            error: error.clone(),
            result: result.clone(),
        })
    }

    /// Encodes `message` against the session's configured depth,
    /// doubling it and retrying whenever the nesting runs past the
    /// current budget, so `NoMem` never escapes to the caller (the
    /// symmetric treatment to [`InFlightTable::grow`]).
    fn encode_growing(&mut self, message: &Message) -> Result<Vec<u8>, WalkStatus> {
        loop {
            match message.encode(self.max_depth) {
                Err(WalkStatus::NoMem) => self.max_depth *= 2,
                other => return other,
            }
        }
    }

    /// Parses one value from the front of `buf` against the session's
    /// configured depth, growing and reparsing on `NoMem` the same way
    /// `encode_growing` does for the write side.
    fn parse_growing(&mut self, buf: &[u8]) -> Result<(Value, usize), WalkStatus> {
        loop {
            match parse_value(buf, self.max_depth) {
                Err(WalkStatus::NoMem) => self.max_depth *= 2,
                other => return other,
            }
        }
    }

    /// Cancels a request that will never see its response (e.g. the
    /// transport died), releasing its id and returning the stashed
    /// userdata so the caller can report it as cancelled.
    pub fn cancel_request(&mut self, id: u32) -> Option<U> {
        self.table.pop(id)
    }

    /// Empties the in-flight table, returning every stashed userdata
    /// so the caller can report cancellation to each waiter. Used
    /// when an endpoint is torn down with requests still outstanding.
    pub fn drain_in_flight(&mut self) -> Vec<U> {
        let cap = self.table.capacity();
        let old = std::mem::replace(&mut self.table, InFlightTable::new(cap));
        old.slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(_, v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Decode one message from the front of `buf`.
    ///
    /// `buf` is never mutated, so a returned `Eof` can be retried
    /// verbatim once more bytes are available. A body nested past the
    /// configured depth is absorbed internally by `parse_growing`
    /// doubling the budget and reparsing; `NoMem` never reaches the
    /// caller from here.
    pub fn receive(&mut self, buf: &[u8]) -> Result<(Received<U>, usize), ReceiveStatus> {
        let mut tokbuf = Tokbuf::new();
        let mut cursor: &[u8] = buf;

        let array_len = match read_token(&mut tokbuf, &mut cursor) {
            (Status::Ok, Some(Token::Array(n))) => n,
            (Status::Ok, Some(_)) => return Err(ReceiveStatus::Protocol(ProtocolError::EArray)),
            (status, _) => return Err(status.into()),
        };
        if array_len != 3 && array_len != 4 {
            return Err(ReceiveStatus::Protocol(ProtocolError::EArrayLen));
        }

        let type_code = match read_token(&mut tokbuf, &mut cursor) {
            (Status::Ok, Some(Token::UInt(v))) if v <= 2 => v,
            (Status::Ok, Some(_)) => return Err(ReceiveStatus::Protocol(ProtocolError::EType)),
            (status, _) => return Err(status.into()),
        };

        let expected_len = if type_code == TYPE_NOTIFICATION { 3 } else { 4 };
        if array_len != expected_len {
            return Err(ReceiveStatus::Protocol(ProtocolError::EArrayLen));
        }

        let id = if type_code != TYPE_NOTIFICATION {
            match read_token(&mut tokbuf, &mut cursor) {
                (Status::Ok, Some(Token::UInt(v))) if v <= u32::MAX as u64 => v as u32,
                (Status::Ok, Some(_)) => return Err(ReceiveStatus::Protocol(ProtocolError::EMsgId)),
                (status, _) => return Err(status.into()),
            }
        } else {
            0
        };

        if type_code == TYPE_RESPONSE && !self.table.contains(id) {
            return Err(ReceiveStatus::Protocol(ProtocolError::EResId));
        }

        let (first, used1) = self.parse_growing(cursor)?;
        cursor = &cursor[used1..];
        let (second, used2) = self.parse_growing(cursor)?;
        cursor = &cursor[used2..];
        let consumed = buf.len() - cursor.len();

        let received = match type_code {
            TYPE_REQUEST => Received::Request {
                id,
                method: first
                    .as_str()
                    .ok_or(ReceiveStatus::Protocol(ProtocolError::EType))?
                    .to_owned(),
                args: second,
            },
            TYPE_RESPONSE => Received::Response {
                userdata: self.table.pop(id).expect("checked contains() above"),
                error: first,
                result: second,
            },
            TYPE_NOTIFICATION => Received::Notification {
                method: first
                    .as_str()
                    .ok_or(ReceiveStatus::Protocol(ProtocolError::EType))?
                    .to_owned(),
                args: second,
            },
            _ => unreachable!("type code validated to be in {{0,1,2}} above"),
        };

        Ok((received, consumed))
    }
}

impl<U> Default for Session<U> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_token_owned;

    #[test]
    fn request_then_response_roundtrip() {
        let mut client = Session::<&'static str>::new();
        let (id, bytes) = client
            .encode_request("REQ", &Value::Array(vec![Value::SInt(-1), Value::UInt(u64::MAX)]), "call-1")
            .unwrap();
        assert_eq!(client.in_flight_len(), 1);

        let mut server = Session::<()>::new();
        let (received, consumed) = server.receive(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        match received {
            Received::Request { id: rid, method, args } => {
                assert_eq!(rid, id);
                assert_eq!(method, "REQ");
                assert_eq!(
                    args,
                    Value::Array(vec![Value::SInt(-1), Value::UInt(u64::MAX)])
                );
            }
            _ => panic!("expected a request"),
        }

        let reply_bytes = server.encode_response(id, &Value::Nil, &Value::UInt(42)).unwrap();
        let (received, _) = client.receive(&reply_bytes).unwrap();
        match received {
            Received::Response { userdata, error, result } => {
                assert_eq!(userdata, "call-1");
                assert!(error.is_nil());
                assert_eq!(result, Value::UInt(42));
            }
            _ => panic!("expected a response"),
        }
        assert_eq!(client.in_flight_len(), 0);
    }

    #[test]
    fn notification_roundtrip() {
        let mut session = Session::<()>::new();
        let args = Value::Array(vec![Value::from("init"), Value::from("finished")]);
        let bytes = session.encode_notification("NOTIFY", &args).unwrap();

        let mut receiver = Session::<()>::new();
        let (received, consumed) = receiver.receive(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(
            received,
            Received::Notification {
                method: "NOTIFY".to_owned(),
                args
            }
        );
    }

    #[test]
    fn out_of_order_responses_resolve_by_id() {
        let mut client = Session::<u32>::new();
        let (id_a, _) = client.encode_request("a", &Value::Array(vec![]), 100).unwrap();
        let (id_b, _) = client.encode_request("b", &Value::Array(vec![]), 200).unwrap();
        assert_eq!(client.in_flight_len(), 2);

        let reply_b = client.encode_response(id_b, &Value::Nil, &Value::Nil).unwrap();
        let reply_a = client.encode_response(id_a, &Value::Nil, &Value::Nil).unwrap();

        let (first, _) = client.receive(&reply_b).unwrap();
        assert!(matches!(first, Received::Response { userdata: 200, .. }));
        let (second, _) = client.receive(&reply_a).unwrap();
        assert!(matches!(second, Received::Response { userdata: 100, .. }));
        assert_eq!(client.in_flight_len(), 0);
    }

    #[test]
    fn unmatched_response_id_is_rejected() {
        let mut session = Session::<()>::new();
        let bytes = session.encode_response(999, &Value::Nil, &Value::Nil).unwrap();
        assert_eq!(
            session.receive(&bytes),
            Err(ReceiveStatus::Protocol(ProtocolError::EResId))
        );
    }

    #[test]
    fn wrong_array_length_is_rejected() {
        let mut session = Session::<()>::new();
        let mut bytes = Vec::new();
        bytes.extend(encode_token_owned(&Token::Array(2)));
        bytes.extend(encode_token_owned(&Token::UInt(0)));
        bytes.extend(encode_token_owned(&Token::UInt(1)));
        assert_eq!(
            session.receive(&bytes),
            Err(ReceiveStatus::Protocol(ProtocolError::EArrayLen))
        );
    }

    #[test]
    fn split_bytes_are_recoverable_eof() {
        let mut session_out = Session::<()>::new();
        let bytes = session_out
            .encode_notification("NOTIFY", &Value::Array(vec![Value::UInt(1)]))
            .unwrap();

        let mut session = Session::<()>::new();
        assert_eq!(session.receive(&bytes[..bytes.len() - 1]), Err(ReceiveStatus::Eof));
        let (received, consumed) = session.receive(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(matches!(received, Received::Notification { .. }));
    }

    #[test]
    fn nesting_past_the_configured_depth_grows_and_succeeds() {
        let mut args = Value::Nil;
        for _ in 0..10 {
            args = Value::Array(vec![args]);
        }

        let mut sender = Session::<()>::with_capacity(DEFAULT_IN_FLIGHT_CAPACITY, 2);
        let bytes = sender.encode_notification("NOTIFY", &args).unwrap();

        let mut receiver = Session::<()>::with_capacity(DEFAULT_IN_FLIGHT_CAPACITY, 2);
        let (received, consumed) = receiver.receive(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(received, Received::Notification { method: "NOTIFY".to_owned(), args });
    }
}
