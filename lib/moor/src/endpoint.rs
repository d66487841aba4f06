use crate::error::{NetError, NetResult};
use crate::session::Session;
use mio;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

// Listener tokens occupy the low range; session tokens start here.
const SESSION_TOKEN_BASE: usize = 0x1000;

/// One readiness observation out of a poll tick.
#[derive(Debug, Copy, Clone)]
pub enum Readiness {
    /// A listening socket may have connections to accept.
    Accept { listener: usize },
    /// A session socket became readable and/or writable.
    Session {
        slot: usize,
        readable: bool,
        writable: bool,
    },
}

/// Readiness multiplexer shared by every daemon loop: a set of listeners,
/// registered sessions and a poll that feeds one tick at a time.
///
/// The endpoint does not own sessions; services keep them in slot tables and
/// register them here under their slot index. Disconnect harvesting is the
/// service's job at end-of-tick (collect first, remove after the iteration).
pub struct Endpoint {
    poll: mio::Poll,
    events: mio::Events,
    listeners: Vec<TcpListener>,
}

impl Endpoint {
    pub fn new() -> NetResult<Endpoint> {
        Ok(Endpoint {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(8192),
            listeners: Vec::new(),
        })
    }

    /// Binds and registers a listener, returning its index. Callers key
    /// per-listener context (the client variant) off that index.
    pub fn add_listener(&mut self, addr: &SocketAddr) -> NetResult<usize> {
        let listener = TcpListener::bind(addr)?;
        let idx = self.listeners.len();

        assert!(idx < SESSION_TOKEN_BASE, "Listener token range exhausted");

        self.poll.register(
            &listener,
            mio::Token(idx),
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        self.listeners.push(listener);
        Ok(idx)
    }

    pub fn listener_addr(&self, listener: usize) -> NetResult<SocketAddr> {
        self.listeners[listener].local_addr().map_err(Into::into)
    }

    /// Accepts one pending connection, or `None` once the backlog is
    /// drained. Edge-triggered listeners must call this until `None`.
    pub fn accept(&self, listener: usize) -> NetResult<Option<(TcpStream, SocketAddr)>> {
        match self.listeners[listener].accept() {
            Ok(pair) => Ok(Some(pair)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn register_session(&self, slot: usize, session: &Session) -> NetResult<()> {
        session.register(mio::Token(SESSION_TOKEN_BASE + slot), &self.poll)
    }

    pub fn deregister_session(&self, session: &Session) -> NetResult<()> {
        session.deregister(&self.poll)
    }

    /// Waits for readiness, up to `timeout`. A long timeout is fine; all
    /// housekeeping is keyed off the tick that follows.
    pub fn poll(&mut self, timeout: Duration) -> NetResult<Vec<Readiness>> {
        self.poll
            .poll(&mut self.events, Some(timeout))
            .map_err(NetError::from)?;

        let mut ready = Vec::with_capacity(self.events.iter().count());

        for event in &self.events {
            let token = event.token().0;

            if token >= SESSION_TOKEN_BASE {
                ready.push(Readiness::Session {
                    slot: token - SESSION_TOKEN_BASE,
                    readable: event.readiness().is_readable(),
                    writable: event.readiness().is_writable(),
                });
            } else {
                ready.push(Readiness::Accept { listener: token });
            }
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderForm;
    use std::net;
    use std::time::Instant;

    fn ephemeral() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_accept_on_idle_listener() {
        let mut endpoint = Endpoint::new().unwrap();
        let listener = endpoint.add_listener(&ephemeral()).unwrap();

        assert!(endpoint.accept(listener).unwrap().is_none());
    }

    #[test]
    fn test_accept_and_session_readiness() {
        let mut endpoint = Endpoint::new().unwrap();
        let listener = endpoint.add_listener(&ephemeral()).unwrap();
        let addr = endpoint.listener_addr(listener).unwrap();

        let mut client = net::TcpStream::connect(addr).unwrap();

        // Poll until the accept shows up.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut accepted = None;

        while accepted.is_none() && Instant::now() < deadline {
            for readiness in endpoint.poll(Duration::from_millis(50)).unwrap() {
                if let Readiness::Accept { listener: l } = readiness {
                    if let Some((stream, peer)) = endpoint.accept(l).unwrap() {
                        accepted = Some(Session::open(HeaderForm::Dc, stream, peer));
                    }
                }
            }
        }

        let mut session = accepted.expect("No connection accepted before the deadline");
        endpoint.register_session(0, &session).unwrap();

        // Push one plaintext packet through the socket and wait for it to
        // surface on the session.
        use std::io::Write;
        client.write_all(&[0x60, 0x00, 0x08, 0x00, 1, 2, 3, 4]).unwrap();

        let mut packet = None;

        while packet.is_none() && Instant::now() < deadline {
            for readiness in endpoint.poll(Duration::from_millis(50)).unwrap() {
                if let Readiness::Session { slot: 0, readable: true, .. } = readiness {
                    // A spurious wakeup with nothing buffered is fine.
                    match session.receive(Instant::now()) {
                        Ok(_) | Err(NetError::Wait) => (),
                        Err(err) => panic!("Receive failed: {:?}", err),
                    }

                    if let Ok(pkt) = session.next_packet() {
                        packet = Some(pkt);
                    }
                }
            }
        }

        assert_eq!(
            packet.expect("No packet received before the deadline"),
            vec![0x60, 0x00, 0x08, 0x00, 1, 2, 3, 4]
        );
    }
}
