// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The three MessagePack-RPC message shapes, independent of how a
//! session dispatches or correlates them. [`Session`](crate::session::Session)
//! builds these to get its wire bytes rather than duplicating the
//! array-header-then-two-values framing itself.

use crate::codec::{encode_token_owned, Token};
use crate::value::{encode_value, Value, WalkStatus};

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFICATION: u64 = 2;

/// A fully materialized RPC message, ready to send or just received.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { id: u32, method: String, args: Value },
    Response { id: u32, error: Value, result: Value },
    Notification { method: String, args: Value },
}

impl Message {
    pub fn request(id: u32, method: impl Into<String>, args: Value) -> Self {
        Message::Request {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn response_ok(id: u32, result: Value) -> Self {
        Message::Response {
            id,
            error: Value::Nil,
            result,
        }
    }

    pub fn response_err(id: u32, error: Value) -> Self {
        Message::Response {
            id,
            error,
            result: Value::Nil,
        }
    }

    pub fn notification(method: impl Into<String>, args: Value) -> Self {
        Message::Notification {
            method: method.into(),
            args,
        }
    }

    /// The message's wire bytes: an array header sized for its shape
    /// (3 for a notification, 4 otherwise), the type code, an id
    /// where applicable, then its two body values.
    pub fn encode(&self, max_depth: usize) -> Result<Vec<u8>, WalkStatus> {
        let mut out = Vec::new();
        match self {
            Message::Request { id, method, args } => {
                out.extend(encode_token_owned(&Token::Array(4)));
                out.extend(encode_token_owned(&Token::UInt(TYPE_REQUEST)));
                out.extend(encode_token_owned(&Token::UInt(*id as u64)));
                encode_value(&Value::from(method.as_str()), &mut out, max_depth)?;
                encode_value(args, &mut out, max_depth)?;
            }
            Message::Response { id, error, result } => {
                out.extend(encode_token_owned(&Token::Array(4)));
                out.extend(encode_token_owned(&Token::UInt(TYPE_RESPONSE)));
                out.extend(encode_token_owned(&Token::UInt(*id as u64)));
                encode_value(error, &mut out, max_depth)?;
                encode_value(result, &mut out, max_depth)?;
            }
            Message::Notification { method, args } => {
                out.extend(encode_token_owned(&Token::Array(3)));
                out.extend(encode_token_owned(&Token::UInt(TYPE_NOTIFICATION)));
                encode_value(&Value::from(method.as_str()), &mut out, max_depth)?;
                encode_value(args, &mut out, max_depth)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_array_header_is_four_long() {
        let bytes = Message::request(7, "ping", Value::Array(vec![])).encode(32).unwrap();
        // fixarray(4), fixint type 0, fixint id 7, fixstr "ping", fixarray(0)
        assert_eq!(bytes[0], 0x94);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[2], 0x07);
    }

    #[test]
    fn notification_array_header_is_three_long() {
        let bytes = Message::notification("go", Value::Nil).encode(32).unwrap();
        assert_eq!(bytes[0], 0x93);
        assert_eq!(bytes[1], 0x02);
    }

    #[test]
    fn response_err_leaves_result_nil() {
        let msg = Message::response_err(1, Value::from("boom"));
        let Message::Response { error, result, .. } = &msg else {
            panic!("expected a response")
        };
        assert_eq!(*result, Value::Nil);
        assert_ne!(*error, Value::Nil);
    }
}
