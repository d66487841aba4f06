use keel::version::ClientVersion;
use moor::session::Session;
use std::net::Ipv4Addr;

/// Where a login connection stands in its short life.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoginState {
    /// Welcome sent, waiting on credentials.
    AwaitingLogin,
    /// Redirect queued; the connection closes once it flushes.
    Redirected,
}

/// One client going through the login flow. These connections live for a
/// handful of packets and are closed right after the redirect.
pub struct LoginClient {
    pub session: Session,
    pub version: ClientVersion,
    pub addr: Ipv4Addr,
    pub state: LoginState,
    pub guildcard: u32,
}

impl LoginClient {
    pub fn new(session: Session, version: ClientVersion, addr: Ipv4Addr) -> LoginClient {
        LoginClient {
            session,
            version,
            addr,
            state: LoginState::AwaitingLogin,
            guildcard: 0,
        }
    }
}
