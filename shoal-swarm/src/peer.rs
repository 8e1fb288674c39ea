use std::net::IpAddr;

/// Abstract peer connection. The wire protocol, handshakes and socket
/// plumbing live outside the engine; implementations turn these intents
/// into protocol messages.
pub trait PeerLink: Send {
    fn addr(&self) -> IpAddr;

    fn peer_id(&self) -> &[u8];

    fn send_request(&mut self, piece: u32, offset: u32, length: u32);

    fn send_cancel(&mut self, piece: u32, offset: u32, length: u32);

    fn send_interested(&mut self);

    fn send_not_interested(&mut self);

    fn close(&mut self);
}
