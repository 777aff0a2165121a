use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing - and, in tests, for injecting
///  deterministic loss.
///
/// Send errors are handled (i.e. logged) behind this seam: a datagram handed to
///  `send_datagram` counts as transmitted for ref-counting and pool purposes whether
///  or not the socket accepted it - the retransmission protocol covers the loss.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
