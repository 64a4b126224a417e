use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::Envelope;

/// Capacity of each connection's outbound queue. Routing to a full queue
/// drops that envelope only.
pub const OUTBOUND_QUEUE: usize = 64;

/// How an envelope fared against the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Queue full; the envelope was dropped.
    Dropped,
    /// No connection holds the target identity.
    UnknownTarget,
}

/// A registered connection: the sending side of its outbound queue.
struct RegistryEntry {
    tx: mpsc::Sender<Envelope>,
}

/// Identity -> connection registry shared by every relay connection.
///
/// Mutations go through DashMap's sharded entry locks; no guard is ever
/// held across an await point.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a connection. Fails when the identity is already
    /// held; the incumbent is never evicted.
    pub fn claim(&self, id: &str, tx: mpsc::Sender<Envelope>) -> Result<(), ClaimError> {
        if id.is_empty() {
            return Err(ClaimError::EmptyId);
        }
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(ClaimError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry { tx });
                debug!(id, "identity registered");
                Ok(())
            }
        }
    }

    /// Drop the entry for `id`. Called by the owning connection on close.
    pub fn release(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            debug!(id, "identity released");
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Enqueue `envelope` for its target. The payload and addressing
    /// fields are forwarded untouched.
    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let Some(entry) = self.entries.get(&envelope.target_id) else {
            return RouteOutcome::UnknownTarget;
        };
        match entry.tx.try_send(envelope) {
            Ok(()) => RouteOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    target_id = %dropped.target_id,
                    sender_id = %dropped.sender_id,
                    "outbound queue full, dropping envelope"
                );
                RouteOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => RouteOutcome::UnknownTarget,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("identity is empty")]
    EmptyId,
    #[error("identity is already registered")]
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeKind;

    fn offer_to(target: &str) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Offer,
            sender_id: "c1".to_string(),
            target_id: target.to_string(),
            payload: serde_json::json!({"sdp": "stub"}),
            message_id: None,
        }
    }

    #[test]
    fn at_most_one_entry_per_identity() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx_b, _rx_b) = mpsc::channel(OUTBOUND_QUEUE);

        registry.claim("h1", tx_a).expect("first claim");
        assert_eq!(registry.claim("h1", tx_b), Err(ClaimError::Duplicate));

        // The incumbent still receives traffic.
        assert_eq!(registry.route(offer_to("h1")), RouteOutcome::Delivered);
        assert_eq!(rx_a.try_recv().expect("delivered").target_id, "h1");
    }

    #[test]
    fn empty_identity_is_rejected() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        assert_eq!(registry.claim("", tx), Err(ClaimError::EmptyId));
    }

    #[test]
    fn release_then_reclaim_succeeds() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        registry.claim("h1", tx).expect("claim");
        registry.release("h1");
        assert!(!registry.contains("h1"));

        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        registry.claim("h1", tx).expect("reclaim after release");
    }

    #[test]
    fn unknown_target_is_reported() {
        let registry = Registry::new();
        assert_eq!(registry.route(offer_to("nobody")), RouteOutcome::UnknownTarget);
    }

    #[test]
    fn full_queue_drops_only_the_new_envelope() {
        let registry = Registry::new();
        let (tx, mut rx) = mpsc::channel(2);
        registry.claim("h1", tx).expect("claim");

        assert_eq!(registry.route(offer_to("h1")), RouteOutcome::Delivered);
        assert_eq!(registry.route(offer_to("h1")), RouteOutcome::Delivered);
        assert_eq!(registry.route(offer_to("h1")), RouteOutcome::Dropped);

        // Earlier envelopes are intact and in order.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
