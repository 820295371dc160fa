// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The server side of an RPC conversation: bind method names to
//! handlers, then hand accepted transports to [`Server::accept`]. Each
//! connection gets a dedicated read-loop thread; each inbound request
//! gets a dedicated worker thread so one slow handler can't stall the
//! rest of the connection (§4.6, §5).

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::session::{Received, Session};
use crate::stream::ReadLoop;
use crate::value::Value;
use crate::DuplexTransport;

/// A bound method: takes the call's argument array, returns the
/// result or an application error, either of which becomes a
/// response's `result`/`error` field. Called from a worker thread, so
/// it must be `Send + Sync`.
pub type Handler = dyn Fn(&Value) -> Result<Value, Value> + Send + Sync;

/// Maps method names to handlers, and handler ids back to names, so
/// re-binding an existing name and unbinding by id are both O(1)
/// instead of scanning every bound method.
struct Registry {
    by_name: HashMap<String, (u32, Arc<Handler>)>,
    by_id: HashMap<u32, String>,
    next_id: u32,
}

impl Registry {
    fn new() -> Self {
        Registry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 0,
        }
    }

    /// Binds `method` to `handler`. Re-binding an already-bound name
    /// replaces the handler in place and returns the id it was first
    /// given, rather than minting a new one.
    fn bind(&mut self, method: String, handler: Arc<Handler>) -> u32 {
        if let Some((id, slot)) = self.by_name.get_mut(&method) {
            *slot = handler;
            return *id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.by_id.insert(id, method.clone());
        self.by_name.insert(method, (id, handler));
        id
    }

    fn unbind(&mut self, id: u32) -> bool {
        match self.by_id.remove(&id) {
            Some(method) => {
                self.by_name.remove(&method);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, method: &str) -> Option<Arc<Handler>> {
        self.by_name.get(method).map(|(_, handler)| Arc::clone(handler))
    }
}

/// One RPC server: a registry of bound methods, shared across however
/// many connections it has accepted.
pub struct Server<S: DuplexTransport> {
    registry: Mutex<Registry>,
    connections: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    _transport: std::marker::PhantomData<S>,
}

impl<S: DuplexTransport> Server<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(Server {
            registry: Mutex::new(Registry::new()),
            connections: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            _transport: std::marker::PhantomData,
        })
    }

    /// Binds `method`. Returns the handler's id, stable across
    /// re-binds, for later use with [`Server::unbind`].
    pub fn bind<F>(&self, method: impl Into<String>, handler: F) -> u32
    where
        F: Fn(&Value) -> Result<Value, Value> + Send + Sync + 'static,
    {
        self.registry.lock().unwrap().bind(method.into(), Arc::new(handler))
    }

    /// Unbinds a previously bound method. Returns `false` if `id` is
    /// unknown (already unbound, or never bound).
    pub fn unbind(&self, id: u32) -> bool {
        self.registry.lock().unwrap().unbind(id)
    }

    /// Hands the server a freshly accepted transport. Spawns a
    /// dedicated read-loop thread for it that runs until the
    /// transport closes or the server is shut down; every inbound
    /// request dispatches to its own worker thread.
    pub fn accept(self: &Arc<Self>, transport: S) -> std::io::Result<()> {
        let reader_half = transport.try_clone()?;
        let writer = Arc::new(Mutex::new(transport));
        let session = Arc::new(Mutex::new(Session::<()>::new()));
        let server = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::spawn(move || {
            let mut reader = ReadLoop::new(reader_half);
            while !shutdown.load(Ordering::Relaxed) {
                let messages = {
                    let mut session = session.lock().unwrap();
                    match reader.next_messages(&mut session) {
                        Ok(Some(messages)) => messages,
                        Ok(None) => return,
                        Err(e) => {
                            warn!("server connection read loop exiting: {e}");
                            return;
                        }
                    }
                };
                for msg in messages {
                    server.dispatch(msg, &session, &writer);
                }
            }
        });

        self.connections.lock().unwrap().push(handle);
        Ok(())
    }

    fn dispatch(
        self: &Arc<Self>,
        msg: Received<()>,
        session: &Arc<Mutex<Session<()>>>,
        writer: &Arc<Mutex<S>>,
    ) {
        match msg {
            Received::Request { id, method, args } => {
                let handler = self.registry.lock().unwrap().lookup(&method);
                let session = Arc::clone(session);
                let writer = Arc::clone(writer);
                std::thread::spawn(move || {
                    let outcome = match handler {
                        Some(handler) => handler(&args),
                        None => {
                            debug!("request for unbound method {method:?}");
                            Err(Value::from("unbound method"))
                        }
                    };
                    let (error, result) = match outcome {
                        Ok(result) => (Value::Nil, result),
                        Err(error) => (error, Value::Nil),
                    };
                    let bytes = session.lock().unwrap().encode_response(id, &error, &result);
                    match bytes {
                        Ok(bytes) => {
                            if let Err(e) = writer.lock().unwrap().write_all(&bytes) {
                                warn!("failed to write response for request {id}: {e}");
                            }
                        }
                        Err(_) => warn!("reply to request {id} exceeded the configured depth"),
                    }
                });
            }
            Received::Notification { method, args } => {
                let handler = self.registry.lock().unwrap().lookup(&method);
                match handler {
                    Some(handler) => {
                        let _ = handler(&args);
                    }
                    None => debug!("notification for unbound method {method:?}"),
                }
            }
            Received::Response { .. } => {
                warn!("dropping unsolicited response received on a server connection");
            }
        }
    }

    /// Signals every accepted connection's read loop to stop, then
    /// joins each one. A connection blocked in a read only notices
    /// the flag once its transport produces more bytes or closes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles = std::mem::take(&mut *self.connections.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl<S: DuplexTransport> Drop for Server<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::pipe;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn request_dispatches_to_bound_handler() {
        init_logging();
        let (client_end, server_end) = pipe::pipe().unwrap();
        let server = Server::new();
        server.bind("add", |args| {
            let items = args.as_array().unwrap();
            let (Value::UInt(a), Value::UInt(b)) = (items[0].clone(), items[1].clone()) else {
                return Err(Value::from("bad args"));
            };
            Ok(Value::UInt(a + b))
        });
        server.accept(server_end).unwrap();

        let client = Client::new(client_end).unwrap();
        let args = Value::Array(vec![Value::UInt(2), Value::UInt(40)]);
        let result = client.request("add", &args).unwrap();
        assert_eq!(result, Value::UInt(42));
    }

    #[test]
    fn unbound_method_returns_an_error_response() {
        init_logging();
        let (client_end, server_end) = pipe::pipe().unwrap();
        let server = Server::new();
        server.accept(server_end).unwrap();

        let client = Client::new(client_end).unwrap();
        let err = client.request("nope", &Value::Array(vec![])).unwrap_err();
        assert!(matches!(err, crate::Error::Handler(_)));
    }

    #[test]
    fn rebinding_a_method_reuses_its_id() {
        let server: Arc<Server<pipe::Endpoint>> = Server::new();
        let first = server.bind("ping", |_| Ok(Value::Nil));
        let second = server.bind("ping", |_| Ok(Value::Bool(true)));
        assert_eq!(first, second);
        assert!(server.unbind(first));
        assert!(!server.unbind(first));
    }

    #[test]
    fn notification_invokes_handler_without_a_reply() {
        init_logging();
        let (client_end, server_end) = pipe::pipe().unwrap();
        let server = Server::new();
        let (tx, rx) = std::sync::mpsc::channel();
        server.bind("ping", move |_| {
            tx.send(()).unwrap();
            Ok(Value::Nil)
        });
        server.accept(server_end).unwrap();

        let client = Client::new(client_end).unwrap();
        client.notify("ping", &Value::Array(vec![])).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
}
