//! Contract of the network-proxy collaborator that carries client↔guest
//! data connections.

use std::net::IpAddr;

/// Severs client↔guest sessions on enforcement.
///
/// Kill requests are fire-and-forget from the monitor's point of view:
/// enforcement proceeds whether or not the proxy still holds a session, so
/// implementations report their own failures and return.
pub trait SessionProxy: Send + Sync {
    /// Sever the session between a client and a guest.
    fn kill(&self, client: IpAddr, guest: IpAddr);
}
