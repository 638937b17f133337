//! Transport channel contract.
//!
//! Every transport hands the session two endpoints: an inbound receiver of
//! decoded frames and an outbound sender of messages. The transport keeps the
//! opposite ends and runs the pumps that move data between them and the wire.

use crate::error::McpResult;
use crate::framing::Frame;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of each direction. Small so a slow consumer pushes back on the pump.
pub const CHANNEL_CAPACITY: usize = 16;

/// The session's side of a transport.
#[derive(Debug)]
pub struct SessionChannels {
    /// Messages (or in-band errors) from the server.
    pub inbound: mpsc::Receiver<Frame>,
    /// Messages to the server.
    pub outbound: mpsc::Sender<JsonRpcMessage>,
}

/// The transport's side: it writes inbound and reads outbound.
///
/// Also useful on its own as an in-memory peer for a session.
#[derive(Debug)]
pub struct PumpChannels {
    pub inbound: mpsc::Sender<Frame>,
    pub outbound: mpsc::Receiver<JsonRpcMessage>,
}

/// Create a linked pair of channel endpoints.
pub fn channel_pair() -> (SessionChannels, PumpChannels) {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        SessionChannels {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        PumpChannels {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

/// A running transport.
#[async_trait]
pub trait Transport: Send {
    /// Tear the transport down and release everything it owns.
    ///
    /// Calling this more than once is a no-op.
    async fn close(&mut self) -> McpResult<()>;

    /// Whether the pumps are still running.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;

    #[tokio::test]
    async fn test_channel_pair_is_linked() {
        let (mut session, mut pumps) = channel_pair();

        let note: JsonRpcMessage = JsonRpcNotification::new("ping", None).into();
        session.outbound.send(note.clone()).await.unwrap();
        assert_eq!(pumps.outbound.recv().await, Some(note.clone()));

        pumps.inbound.send(Ok(note.clone())).await.unwrap();
        assert_eq!(session.inbound.recv().await.unwrap().unwrap(), note);
    }

    #[tokio::test]
    async fn test_dropping_producer_ends_consumer() {
        let (session, mut pumps) = channel_pair();
        drop(session);
        assert!(pumps.outbound.recv().await.is_none());
        assert!(pumps.inbound.is_closed());
    }
}
