//! Tokio-backed [`Endpoint`] over a `TcpStream`.
//!
//! The adapter bridges the driver's callback-style readiness contract onto
//! Tokio's readiness model: `fill`/`flush` use the non-blocking
//! `try_read`/`try_write` calls, and a spawned readiness loop awaits socket
//! readability (bounded by the idle timeout) whenever the driver arms
//! `fill_interested`, invoking the registered listener from the runtime.

use std::{
    io,
    net::{Shutdown, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use log::{debug, trace};
use tokio::{net::TcpStream, sync::Notify, time::timeout};
use tokio_util::sync::CancellationToken;

use super::{Endpoint, EndpointListener, Fill};

struct Shared {
    listener: Option<Weak<dyn EndpointListener>>,
    idle_timeout: Duration,
}

/// An [`Endpoint`] over a connected Tokio `TcpStream`.
pub struct TcpEndpoint {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    shared: Mutex<Shared>,
    read_armed: Notify,
    handle: tokio::runtime::Handle,
    shutdown: CancellationToken,
    weak_self: Weak<TcpEndpoint>,
}

impl TcpEndpoint {
    /// Wrap a connected stream. `handle` is the runtime that hosts the
    /// readiness loop and write-readiness wakeups.
    ///
    /// # Errors
    ///
    /// Returns the error from querying the socket addresses.
    pub fn new(stream: TcpStream, handle: tokio::runtime::Handle) -> io::Result<Arc<Self>> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Arc::new_cyclic(|weak| Self {
            stream,
            local,
            remote,
            shared: Mutex::new(Shared {
                listener: None,
                idle_timeout: Duration::ZERO,
            }),
            read_armed: Notify::new(),
            handle,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        }))
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn EndpointListener>> {
        self.shared().listener.clone().and_then(|weak| weak.upgrade())
    }

    /// Spawn the readiness loop. Call once, after the connection has
    /// registered its listener.
    pub fn start(self: &Arc<Self>) {
        let endpoint = Arc::clone(self);
        self.handle.spawn(async move { endpoint.readiness_loop().await });
    }

    async fn readiness_loop(self: Arc<Self>) {
        loop {
            // wait for the driver to arm read interest
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.read_armed.notified() => {}
            }

            // then wait for readability, bounded by the idle timeout
            loop {
                let idle = self.shared().idle_timeout;
                let ready = async {
                    if idle > Duration::ZERO {
                        timeout(idle, self.stream.readable()).await
                    } else {
                        Ok(self.stream.readable().await)
                    }
                };
                tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    result = ready => match result {
                        Ok(outcome) => {
                            if let Err(error) = outcome {
                                // let the driver's fill surface the failure
                                debug!("readability wait failed: {error}");
                            }
                            if let Some(listener) = self.listener() {
                                listener.on_readable();
                            }
                            break;
                        }
                        Err(_elapsed) => {
                            trace!("idle timeout on {}", self.remote);
                            // absorbed or not, keep servicing reads: either
                            // the connection is terminal and awaiting
                            // teardown, or its close reply may still arrive
                            let _ = self
                                .listener()
                                .is_none_or(|listener| listener.on_read_timeout());
                        }
                    },
                }
            }
        }
        if let Some(listener) = self.listener() {
            listener.on_closed();
        }
    }
}

impl Endpoint for TcpEndpoint {
    fn fill(&self, buffer: &mut BytesMut) -> io::Result<Fill> {
        match self.stream.try_read_buf(buffer) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => Ok(Fill::Bytes(n)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(Fill::Empty),
            Err(error) => Err(error),
        }
    }

    fn flush(&self, buffer: &mut BytesMut) -> io::Result<bool> {
        while !buffer.is_empty() {
            match self.stream.try_write(buffer) {
                Ok(n) => buffer.advance(n),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }

    fn fill_interested(&self) { self.read_armed.notify_one(); }

    fn flush_interested(&self, wakeup: Box<dyn FnOnce() + Send>) {
        let Some(endpoint) = self.weak_self.upgrade() else {
            return;
        };
        let token = self.shutdown.clone();
        self.handle.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                result = endpoint.stream.writable() => {
                    if let Err(error) = result {
                        debug!("writability wait failed: {error}");
                    }
                }
            }
            wakeup();
        });
    }

    fn shutdown_output(&self) {
        debug!("shutting down output to {}", self.remote);
        if let Err(error) = socket2::SockRef::from(&self.stream).shutdown(Shutdown::Write) {
            debug!("output shutdown failed: {error}");
        }
    }

    fn close(&self) {
        debug!("closing transport to {}", self.remote);
        if let Err(error) = socket2::SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            debug!("transport close failed: {error}");
        }
        self.shutdown.cancel();
    }

    fn set_idle_timeout(&self, timeout: Duration) { self.shared().idle_timeout = timeout; }

    fn register(&self, listener: Weak<dyn EndpointListener>) {
        self.shared().listener = Some(listener);
    }

    fn local_address(&self) -> SocketAddr { self.local }

    fn remote_address(&self) -> SocketAddr { self.remote }
}
