//! UDP-over-QUIC session demultiplexing
// (c) 2024 Ross Younger

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quinn::Connection;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::session::UdpDatagram;

/// Per-session inbound backlog. Beyond this, datagrams are dropped, as UDP
/// semantics permit; a slow consumer must never stall the demux loop.
const SESSION_BACKLOG: usize = 128;

type Registry = Arc<Mutex<HashMap<u32, mpsc::Sender<(Bytes, String)>>>>;

/// Routes inbound QUIC datagrams to their sessions by session id.
/// One background task per connection runs [`UdpDemux::run`].
#[derive(Debug, Clone, Default)]
pub(super) struct UdpDemux {
    registry: Registry,
}

impl UdpDemux {
    /// Registers a session, returning its receive side
    pub(super) fn register(&self, session_id: u32) -> mpsc::Receiver<(Bytes, String)> {
        let (tx, rx) = mpsc::channel(SESSION_BACKLOG);
        let _ = self.registry.lock().unwrap().insert(session_id, tx);
        rx
    }

    /// Forgets a session. Its receiver sees end-of-stream.
    pub(super) fn unregister(&self, session_id: u32) {
        let _ = self.registry.lock().unwrap().remove(&session_id);
    }

    /// Demultiplexes inbound datagrams until the connection dies.
    pub(super) async fn run(self, connection: Connection) {
        loop {
            let frame = match connection.read_datagram().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("datagram demux finished: {e}");
                    break;
                }
            };
            let datagram = match UdpDatagram::decode(frame) {
                Ok(d) => d,
                Err(e) => {
                    trace!("dropping malformed datagram: {e}");
                    continue;
                }
            };
            let sender = self
                .registry
                .lock()
                .unwrap()
                .get(&datagram.session_id)
                .cloned();
            match sender {
                Some(tx) => {
                    let _ = tx.try_send((datagram.payload, datagram.addr));
                }
                None => trace!("datagram for unknown session {}", datagram.session_id),
            }
        }
        // Dropping the senders wakes every session reader with end-of-stream.
        self.registry.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unregister_ends_the_stream() {
        let demux = UdpDemux::default();
        let mut rx = demux.register(1);
        demux.unregister(1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn registered_sessions_receive() {
        let demux = UdpDemux::default();
        let mut rx = demux.register(7);
        let tx = demux.registry.lock().unwrap().get(&7).cloned().unwrap();
        tx.try_send((Bytes::from_static(b"hi"), "9.9.9.9:53".into()))
            .unwrap();
        let (payload, addr) = rx.recv().await.unwrap();
        assert_eq!(&payload[..], b"hi");
        assert_eq!(addr, "9.9.9.9:53");
    }
}
