// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The client side of an RPC conversation: a blocking `request`, a
//! non-blocking `request_async`, and one-way `notify`. Blocking and
//! async calls never mix on the same client (§4.5).

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::session::{ReceiveStatus, Received, Session};
use crate::stream::ReadLoop;
use crate::value::Value;
use crate::{DuplexTransport, Error};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unset,
    /// A blocking `request` is currently in flight; a second
    /// concurrent blocking call, or any `request_async`, is rejected
    /// rather than left to race on the same response stream.
    BlockingBusy,
    Async,
}

/// What to do with a request's outcome once its response arrives.
enum Waiter {
    /// The calling thread is parked in `request`, polling for this.
    Blocking,
    /// Run on whichever thread discovers the response (the async
    /// read-loop thread).
    Async(Box<dyn FnOnce(Result<Value, Value>) + Send>),
}

/// One RPC client bound to a single duplex transport.
pub struct Client<S: DuplexTransport> {
    session: Mutex<Session<Waiter>>,
    writer: Mutex<S>,
    reader: Mutex<Option<ReadLoop<S>>>,
    mode: Mutex<Mode>,
    async_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: DuplexTransport> Client<S> {
    pub fn new(transport: S) -> std::io::Result<Arc<Self>> {
        let reader_half = transport.try_clone()?;
        Ok(Arc::new(Client {
            session: Mutex::new(Session::new()),
            writer: Mutex::new(transport),
            reader: Mutex::new(Some(ReadLoop::new(reader_half))),
            mode: Mutex::new(Mode::Unset),
            async_thread: Mutex::new(None),
        }))
    }

    fn begin_blocking(&self) -> Result<(), Error> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Unset => {
                *mode = Mode::BlockingBusy;
                Ok(())
            }
            _ => Err(Error::ModeMixed),
        }
    }

    fn end_blocking(&self) {
        let mut mode = self.mode.lock().unwrap();
        if *mode == Mode::BlockingBusy {
            *mode = Mode::Unset;
        }
    }

    fn commit_async(&self) -> Result<(), Error> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Unset => {
                *mode = Mode::Async;
                Ok(())
            }
            Mode::Async => Ok(()),
            Mode::BlockingBusy => Err(Error::ModeMixed),
        }
    }

    /// Send a request and block until its response arrives (or the
    /// transport errors out). Rejected if another blocking call is
    /// already in flight, or once `request_async` has run once.
    pub fn request(&self, method: &str, args: &Value) -> Result<Value, Error> {
        self.begin_blocking()?;
        let result = self.request_blocking_inner(method, args);
        self.end_blocking();
        result
    }

    fn request_blocking_inner(&self, method: &str, args: &Value) -> Result<Value, Error> {
        self.send_request(method, args, Waiter::Blocking)?;

        loop {
            let mut reader_guard = self.reader.lock().unwrap();
            let reader = reader_guard
                .as_mut()
                .expect("blocking mode never hands the reader to the async thread");
            let mut session = self.session.lock().unwrap();
            let messages = reader
                .next_messages(&mut session)?
                .ok_or_else(closed_while_waiting)?;
            drop(session);
            drop(reader_guard);

            for msg in messages {
                match msg {
                    Received::Response {
                        userdata: Waiter::Blocking,
                        error,
                        result,
                    } => {
                        return if error.is_nil() {
                            Ok(result)
                        } else {
                            Err(Error::Handler(error))
                        }
                    }
                    Received::Response { .. } => {
                        unreachable!("only Waiter::Blocking entries exist while in blocking mode")
                    }
                    other => debug!("client dropping unrelated message while blocked: {other:?}"),
                }
            }
        }
    }

    /// Send a request and return immediately; `callback` runs (on the
    /// client's background read-loop thread) once the response
    /// arrives.
    pub fn request_async<F>(self: &Arc<Self>, method: &str, args: &Value, callback: F) -> Result<u32, Error>
    where
        F: FnOnce(Result<Value, Value>) + Send + 'static,
    {
        self.commit_async()?;
        let id = self.send_request(method, args, Waiter::Async(Box::new(callback)))?;
        self.ensure_async_loop_running();
        Ok(id)
    }

    /// Send a one-way notification; no response is expected.
    pub fn notify(&self, method: &str, args: &Value) -> Result<(), Error> {
        let bytes = {
            let mut session = self.session.lock().unwrap();
            session
                .encode_notification(method, args)
                .map_err(|_| Error::DepthExceeded)?
        };
        self.writer.lock().unwrap().write_all(&bytes)?;
        Ok(())
    }

    fn send_request(&self, method: &str, args: &Value, waiter: Waiter) -> Result<u32, Error> {
        let mut session = self.session.lock().unwrap();
        let (id, bytes) = session
            .encode_request(method, args, waiter)
            .map_err(|(_, status)| Error::from(ReceiveStatus::from(status)))?;
        drop(session);
        self.writer.lock().unwrap().write_all(&bytes)?;
        Ok(id)
    }

    fn ensure_async_loop_running(self: &Arc<Self>) {
        let mut thread = self.async_thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("async loop starts exactly once");
        let client = Arc::clone(self);
        *thread = Some(std::thread::spawn(move || client.run_async_loop(reader)));
    }

    fn run_async_loop(self: Arc<Self>, mut reader: ReadLoop<S>) {
        loop {
            let messages = {
                let mut session = self.session.lock().unwrap();
                match reader.next_messages(&mut session) {
                    Ok(Some(messages)) => messages,
                    Ok(None) => return,
                    Err(e) => {
                        warn!("client read loop exiting: {e}");
                        return;
                    }
                }
            };
            for msg in messages {
                match msg {
                    Received::Response {
                        userdata: Waiter::Async(callback),
                        error,
                        result,
                    } => callback(resolve(error, result)),
                    Received::Response {
                        userdata: Waiter::Blocking,
                        ..
                    } => unreachable!("only Waiter::Async entries exist once async mode started"),
                    other => debug!("client dropping unrelated message on async loop: {other:?}"),
                }
            }
        }
    }
}

fn resolve(error: Value, result: Value) -> Result<Value, Value> {
    if error.is_nil() {
        Ok(result)
    } else {
        Err(error)
    }
}

impl<S: DuplexTransport> Drop for Client<S> {
    /// Reports every still-outstanding async request as cancelled. By
    /// the time a `Client` actually drops, no blocking call can be
    /// in-flight (it holds the `Arc` alive for its own duration), so
    /// only `Waiter::Async` entries can remain.
    fn drop(&mut self) {
        let waiters = self.session.lock().unwrap().drain_in_flight();
        for waiter in waiters {
            if let Waiter::Async(callback) = waiter {
                callback(Err(Value::from("client dropped with request in flight")));
            }
        }
    }
}

fn closed_while_waiting() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "transport closed while awaiting a response",
    ))
}

impl std::fmt::Debug for Received<Waiter> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Received::Request { id, method, .. } => {
                write!(f, "Request {{ id: {id}, method: {method:?}, .. }}")
            }
            Received::Response { .. } => write!(f, "Response {{ .. }}"),
            Received::Notification { method, .. } => {
                write!(f, "Notification {{ method: {method:?}, .. }}")
            }
        }
    }
}
