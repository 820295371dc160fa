// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Pulls bytes from a transport, buffers whatever a session couldn't
//! yet turn into a message, and hands back completed messages in wire
//! order.

use std::io::Read;

use log::{debug, trace};

use crate::session::{ReceiveStatus, Received, Session};
use crate::Error;

/// Default single-read block size (§6 configuration knobs).
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Buffers partial reads against one transport and decodes completed
/// messages against a [`Session`] as soon as enough bytes are in hand.
pub struct ReadLoop<R> {
    reader: R,
    block_size: usize,
    pending: Vec<u8>,
}

impl<R: Read> ReadLoop<R> {
    pub fn new(reader: R) -> Self {
        Self::with_block_size(reader, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(reader: R, block_size: usize) -> Self {
        ReadLoop {
            reader,
            block_size,
            pending: Vec::new(),
        }
    }

    /// Blocks until at least one message is decoded, then returns all
    /// messages that became available in the same pass (FIFO, wire
    /// order). Returns an empty read (`Ok(None)`) only when the
    /// transport hit EOF with no partial message pending.
    pub fn next_messages<U>(
        &mut self,
        session: &mut Session<U>,
    ) -> Result<Option<Vec<Received<U>>>, Error> {
        loop {
            let mut completed = Vec::new();
            loop {
                match session.receive(&self.pending) {
                    Ok((msg, consumed)) => {
                        trace!("decoded one message, {consumed} bytes");
                        self.pending.drain(..consumed);
                        completed.push(msg);
                    }
                    Err(ReceiveStatus::Eof) => break,
                    Err(other) => {
                        debug!("dropping transport after framing error: {other:?}");
                        return Err(other.into());
                    }
                }
            }
            if !completed.is_empty() {
                return Ok(Some(completed));
            }

            let mut block = vec![0u8; self.block_size];
            let n = self.reader.read(&mut block)?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed mid-message",
                )));
            }
            self.pending.extend_from_slice(&block[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn split_reads_yield_one_message() {
        let mut sender = Session::<()>::new();
        let bytes = sender
            .encode_notification("NOTIFY", &Value::Array(vec![Value::UInt(7)]))
            .unwrap();

        // A reader that yields one byte at a time, matching scenario 5
        // of the end-to-end test suite.
        struct OneByteAtATime {
            data: Vec<u8>,
            pos: usize,
        }
        impl Read for OneByteAtATime {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pos >= self.data.len() {
                    return Ok(0);
                }
                buf[0] = self.data[self.pos];
                self.pos += 1;
                Ok(1)
            }
        }

        let mut loop_ = ReadLoop::with_block_size(
            OneByteAtATime {
                data: bytes,
                pos: 0,
            },
            1,
        );
        let mut receiver = Session::<()>::new();
        let messages = loop_.next_messages(&mut receiver).unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Received::Notification { .. }));
    }

    #[test]
    fn clean_eof_with_no_pending_bytes_is_none() {
        let mut loop_ = ReadLoop::new(&[][..]);
        let mut session = Session::<()>::new();
        assert!(loop_.next_messages(&mut session).unwrap().is_none());
    }

    #[test]
    fn eof_mid_message_is_an_error() {
        let mut sender = Session::<()>::new();
        let bytes = sender
            .encode_notification("NOTIFY", &Value::Array(vec![]))
            .unwrap();
        let mut loop_ = ReadLoop::new(&bytes[..bytes.len() - 1]);
        let mut session = Session::<()>::new();
        assert!(loop_.next_messages(&mut session).is_err());
    }
}
