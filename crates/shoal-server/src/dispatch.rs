//! Relay dispatcher: routes an established connection's envelope to its
//! peer on the same path.
//!
//! The dispatcher never decrypts relayed payloads and never reorders
//! frames: envelopes are enqueued in receipt order onto the destination's
//! outbound queue, which only the destination's own task drains. An absent
//! peer or a closed queue surfaces immediately as
//! [`SignalingError::PeerUnreachable`]; delivery onto the stream itself is
//! confirmed by an ack watched on the side, so the sender's task keeps
//! draining its own queue and two peers relaying at each other cannot
//! deadlock. Either way the sender ends up with a `send-error` naming the
//! failed envelope — addressed traffic is never silently dropped.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::SignalingError;
use crate::registry::{Outbound, Path};
use shoal_core::message::ControlMessage;
use shoal_core::ClientId;

/// Forward a relayed envelope to `destination` within the same path.
///
/// On success the frame is queued in order; if the destination then fails
/// to write it within `deadline`, a `send-error` for `message_id` is
/// enqueued onto `source` asynchronously.
pub async fn relay(
    path: &Path,
    destination: ClientId,
    frame: Bytes,
    source: mpsc::UnboundedSender<Outbound>,
    message_id: [u8; 8],
    deadline: Duration,
) -> Result<(), SignalingError> {
    let handle = path
        .lookup(destination)
        .await
        .ok_or(SignalingError::PeerUnreachable(destination))?;

    let (ack_tx, ack_rx) = oneshot::channel();
    handle
        .tx
        .send(Outbound::Relay(frame, ack_tx))
        .map_err(|_| SignalingError::PeerUnreachable(destination))?;

    tokio::spawn(async move {
        let delivered = matches!(tokio::time::timeout(deadline, ack_rx).await, Ok(Ok(())));
        if !delivered {
            debug!(destination = %destination, "relayed message not delivered in time");
            let _ = source.send(Outbound::Control(ControlMessage::SendError { id: message_id }));
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, PathRegistry};
    use std::sync::Arc;
    use uuid::Uuid;

    const DEADLINE: Duration = Duration::from_millis(100);

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                serial: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    async fn path_with_initiator(
        registry: &PathRegistry,
    ) -> (Arc<Path>, mpsc::UnboundedReceiver<Outbound>) {
        let (h, rx) = handle();
        let (path, _) = registry.register_initiator([0x0a; 32], h).await;
        (path, rx)
    }

    #[tokio::test]
    async fn test_absent_peer_is_unreachable() {
        let registry = PathRegistry::new();
        let (path, _dest_rx) = path_with_initiator(&registry).await;
        let (source_tx, _source_rx) = mpsc::unbounded_channel();

        let result = relay(
            &path,
            ClientId(0x05),
            Bytes::from_static(b"x"),
            source_tx,
            [0u8; 8],
            DEADLINE,
        )
        .await;
        assert!(matches!(
            result,
            Err(SignalingError::PeerUnreachable(ClientId(0x05)))
        ));
    }

    #[tokio::test]
    async fn test_acked_delivery_reports_nothing() {
        let registry = PathRegistry::new();
        let (path, mut dest_rx) = path_with_initiator(&registry).await;
        let (source_tx, mut source_rx) = mpsc::unbounded_channel();

        // Destination task: "write" the frame, then ack.
        tokio::spawn(async move {
            if let Some(Outbound::Relay(frame, ack)) = dest_rx.recv().await {
                assert_eq!(&frame[..], b"payload");
                let _ = ack.send(());
            }
        });

        relay(
            &path,
            ClientId::INITIATOR,
            Bytes::from_static(b"payload"),
            source_tx,
            [1u8; 8],
            DEADLINE,
        )
        .await
        .unwrap();

        tokio::time::sleep(DEADLINE * 2).await;
        assert!(source_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missed_deadline_enqueues_send_error() {
        let registry = PathRegistry::new();
        let (path, _dest_rx) = path_with_initiator(&registry).await;
        let (source_tx, mut source_rx) = mpsc::unbounded_channel();

        // Destination queue stays undrained; the ack never fires.
        relay(
            &path,
            ClientId::INITIATOR,
            Bytes::from_static(b"x"),
            source_tx,
            [7u8; 8],
            DEADLINE,
        )
        .await
        .unwrap();

        match source_rx.recv().await {
            Some(Outbound::Control(ControlMessage::SendError { id })) => assert_eq!(id, [7u8; 8]),
            _ => panic!("expected a send-error on the source queue"),
        }
    }
}
