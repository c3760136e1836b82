/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::io::{self, Read};
use std::mem::size_of;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libc::{
    c_int, c_void, sockaddr, sockaddr_in, socklen_t, AF_INET, INADDR_ANY, SHUT_RDWR,
    SOCK_CLOEXEC, SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR,
};
use tracing::{instrument, Span};

use crate::error::LoaderError::{AcceptFailure, BindFailure, EmptyPayload};
use crate::Result;

/// The socket shared between the accept loop and any shutdown caller,
/// together with the sentinel saying whether it may still be used.
#[derive(Debug)]
struct ListenerShared {
    listener: TcpListener,
    open: AtomicBool,
}

impl ListenerShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// A bound, listening TCP socket that hands out one payload per connection.
///
/// The socket is long-lived: it stays open until `close` is called, or until
/// a `ServerHandle` obtained from `handle` is used to shut it down from
/// another thread.
#[derive(Debug)]
pub struct PayloadServer {
    shared: Arc<ListenerShared>,
    local_addr: SocketAddr,
}

/// A cloneable handle used to stop a `PayloadServer`, typically from a
/// thread other than the one parked in `accept_one`.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<ListenerShared>,
}

impl ServerHandle {
    /// Mark the server closed and shut the socket down, waking any thread
    /// blocked in `accept_one`. Returns `true` if this call performed the
    /// shutdown and `false` if the server was already closed.
    ///
    /// The descriptor itself is closed once the server and every handle
    /// have been dropped.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn shutdown(&self) -> bool {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            log::debug!("payload server already shut down");
            return false;
        }
        let fd = self.shared.listener.as_raw_fd();
        if unsafe { libc::shutdown(fd, SHUT_RDWR) } != 0 {
            // the sentinel is already cleared so the accept loop still stops
            // at its next check
            log::warn!(
                "shutdown of payload server fd {} failed: {}",
                fd,
                io::Error::last_os_error()
            );
        } else {
            log::debug!("payload server fd {} shut down", fd);
        }
        true
    }

    /// Whether the server still accepts connections
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }
}

impl PayloadServer {
    /// Bind `0.0.0.0:port` and start listening.
    ///
    /// Binding is attempted `retry_count` times (at least once), sleeping
    /// `retry_delay` after each failed attempt, which covers a socket still
    /// settling from a previous run. Port `0` binds an ephemeral port.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn listen(
        port: u16,
        backlog: i32,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let attempts = retry_count.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match bind_listener(port, backlog.max(1)) {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    log::info!(
                        "payload server fd {} listening on {}",
                        listener.as_raw_fd(),
                        local_addr
                    );
                    return Ok(Self {
                        shared: Arc::new(ListenerShared {
                            listener,
                            open: AtomicBool::new(true),
                        }),
                        local_addr,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "binding port {} failed (attempt {}/{}): {}",
                        port,
                        attempt,
                        attempts,
                        e
                    );
                    thread::sleep(retry_delay);
                    if attempt >= attempts {
                        log::error!("giving up on port {} after {} attempts", port, attempts);
                        return Err(BindFailure {
                            port,
                            attempts,
                            source: e,
                        });
                    }
                }
            }
        }
    }

    /// The address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that can shut this server down from another thread
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the server still accepts connections
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Block until a client connects.
    ///
    /// Fails with `AcceptFailure` if the server has been shut down, before or
    /// while waiting.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn accept_one(&self) -> Result<TcpStream> {
        if !self.shared.is_open() {
            return Err(AcceptFailure(None));
        }
        match self.shared.listener.accept() {
            Ok((stream, peer)) => {
                if !self.shared.is_open() {
                    log::debug!("dropping connection from {}, server shut down", peer);
                    return Err(AcceptFailure(None));
                }
                log::debug!("accepted connection from {} (fd {})", peer, stream.as_raw_fd());
                Ok(stream)
            }
            Err(e) => {
                if self.shared.is_open() {
                    log::error!("accept on payload server failed: {}", e);
                } else {
                    log::debug!("accept interrupted by shutdown: {}", e);
                }
                Err(AcceptFailure(Some(e)))
            }
        }
    }

    /// Read a whole payload from `stream` until the peer closes its write
    /// side. The connection is closed once consumed, whatever the outcome.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn receive_payload(mut stream: TcpStream) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let read = stream.read_to_end(&mut payload);
        drop(stream);
        let len = read?;
        if len == 0 {
            return Err(EmptyPayload);
        }
        log::debug!("received payload of {} bytes", len);
        Ok(payload)
    }

    /// Shut the server down and release this owner's reference to the
    /// socket.
    pub fn close(self) {
        self.handle().shutdown();
    }
}

fn bind_listener(port: u16, backlog: c_int) -> io::Result<TcpListener> {
    let raw = unsafe { libc::socket(AF_INET, SOCK_STREAM | SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let reuse: c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEADDR,
            &reuse as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: sockaddr_in is plain old data, all zeroes is a valid value
    let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = INADDR_ANY.to_be();
    let res = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const sockaddr_in as *const sockaddr,
            size_of::<sockaddr_in>() as socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Shutdown, SocketAddr, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::PayloadServer;
    use crate::error::LoaderError;
    use crate::Result;

    fn listen_ephemeral() -> Result<PayloadServer> {
        PayloadServer::listen(0, 4, 1, Duration::from_millis(10))
    }

    fn loopback(server: &PayloadServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
    }

    #[test]
    fn receives_until_peer_closes() -> Result<()> {
        let server = listen_ephemeral()?;
        let addr = loopback(&server);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello ").unwrap();
            stream.write_all(b"payload").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
        });

        let stream = server.accept_one()?;
        let payload = PayloadServer::receive_payload(stream)?;
        assert_eq!(payload, b"hello payload");
        client.join().unwrap();
        server.close();
        Ok(())
    }

    #[test]
    fn empty_payload() -> Result<()> {
        let server = listen_ephemeral()?;
        let addr = loopback(&server);
        let client = thread::spawn(move || drop(TcpStream::connect(addr).unwrap()));

        let stream = server.accept_one()?;
        assert!(matches!(
            PayloadServer::receive_payload(stream),
            Err(LoaderError::EmptyPayload)
        ));
        client.join().unwrap();
        Ok(())
    }

    #[test]
    fn shutdown_wakes_blocked_accept() -> Result<()> {
        let server = listen_ephemeral()?;
        let handle = server.handle();
        let acceptor = thread::spawn(move || server.accept_one().map(|_| ()));

        thread::sleep(Duration::from_millis(100));
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(!handle.is_open());

        let res = acceptor.join().unwrap();
        assert!(matches!(res, Err(LoaderError::AcceptFailure(_))));
        Ok(())
    }

    #[test]
    fn accept_after_close_fails() -> Result<()> {
        let server = listen_ephemeral()?;
        let handle = server.handle();
        handle.shutdown();
        assert!(!server.is_open());
        assert!(matches!(
            server.accept_one(),
            Err(LoaderError::AcceptFailure(None))
        ));
        Ok(())
    }

    #[test]
    fn bind_retries_then_fails() -> Result<()> {
        let held = listen_ephemeral()?;
        let port = held.local_addr().port();

        let delay = Duration::from_millis(50);
        let start = Instant::now();
        let res = PayloadServer::listen(port, 4, 3, delay);
        let elapsed = start.elapsed();

        match res {
            Err(LoaderError::BindFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected BindFailure, got {:?}", other),
        }
        assert!(elapsed >= delay * 3, "retried too quickly: {:?}", elapsed);
        assert!(elapsed < delay * 3 + Duration::from_secs(2));
        held.close();
        Ok(())
    }
}
