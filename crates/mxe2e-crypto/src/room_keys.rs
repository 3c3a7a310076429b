//! Handling of received `m.room_key` and `m.forwarded_room_key` events.
//!
//! Each event is validated and then either stored as an inbound group
//! session or rejected. Rejections never reach the caller as errors: they
//! are logged and reported in the returned [`RoomKeyOutcome`], so a hostile
//! or buggy peer cannot stall event processing.

use std::sync::Arc;

use mxe2e_protocol::messages::{ForwardedRoomKeyContent, KeySharingEvent, RoomKeyContent};
use mxe2e_protocol::types::MEGOLM_V1_ALGORITHM;
use tracing::{debug, info, warn};

use crate::engine::CryptoEngine;
use crate::error::{E2eError, Result};
use crate::group::{GroupSessionManager, InboundGroupSession};
use crate::stores::InboundInsert;

/// The device a key-sharing event came from, as authenticated by the Olm
/// layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySender {
    pub curve25519: Option<String>,
    /// Ed25519 key the sender claimed inside the Olm payload.
    pub ed25519: Option<String>,
}

#[derive(Debug)]
pub enum RoomKeyOutcome {
    Stored {
        room_id: String,
        session_id: String,
        insert: InboundInsert,
    },
    Rejected(E2eError),
}

impl RoomKeyOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

pub struct RoomKeyProtocol<E: CryptoEngine> {
    engine: Arc<E>,
    groups: Arc<GroupSessionManager<E>>,
}

impl<E: CryptoEngine> RoomKeyProtocol<E> {
    pub fn new(engine: Arc<E>, groups: Arc<GroupSessionManager<E>>) -> Self {
        Self { engine, groups }
    }

    pub fn room_key_received(&self, content: RoomKeyContent, sender: &KeySender) -> RoomKeyOutcome {
        self.handle(KeySharingEvent::RoomKey(content), sender)
    }

    /// `forwarder` is the device that re-shared the key, not the one that
    /// created the session.
    pub fn forwarded_room_key_received(
        &self,
        content: ForwardedRoomKeyContent,
        forwarder: &KeySender,
    ) -> RoomKeyOutcome {
        self.handle(KeySharingEvent::ForwardedRoomKey(content), forwarder)
    }

    pub fn handle(&self, event: KeySharingEvent, sender: &KeySender) -> RoomKeyOutcome {
        debug!(
            event_type = event.event_type(),
            room_id = event.room_id(),
            "validating room key"
        );
        let result = self.validate(&event, sender).and_then(|session| {
            let room_id = session.room_id().to_string();
            let session_id = session.session_id().to_string();
            let insert = self.groups.add_inbound_group_session(session)?;
            Ok(RoomKeyOutcome::Stored {
                room_id,
                session_id,
                insert,
            })
        });

        match result {
            Ok(outcome) => {
                if let RoomKeyOutcome::Stored {
                    room_id,
                    session_id,
                    insert,
                } = &outcome
                {
                    info!(%room_id, %session_id, ?insert, event_type = event.event_type(), "room key stored");
                }
                outcome
            }
            Err(e) => {
                warn!(
                    event_type = event.event_type(),
                    room_id = event.room_id(),
                    sender_key = sender.curve25519.as_deref().unwrap_or("unknown"),
                    "room key rejected: {e}"
                );
                RoomKeyOutcome::Rejected(e)
            }
        }
    }

    fn validate(&self, event: &KeySharingEvent, sender: &KeySender) -> Result<InboundGroupSession<E>> {
        if event.algorithm() != MEGOLM_V1_ALGORITHM {
            return Err(E2eError::UnsupportedAlgorithm(event.algorithm().to_string()));
        }
        if event.room_id().is_empty() {
            return Err(E2eError::State("room key without room id".into()));
        }

        let session = match event {
            KeySharingEvent::RoomKey(content) => InboundGroupSession::from_session_key(
                self.engine.clone(),
                content.room_id.as_str(),
                &content.session_key,
                sender.curve25519.clone(),
                sender.ed25519.clone(),
            )?,
            KeySharingEvent::ForwardedRoomKey(content) => {
                let mut chain = content.forwarding_curve25519_key_chain.clone();
                chain.extend(sender.curve25519.clone());
                InboundGroupSession::import(
                    self.engine.clone(),
                    content.room_id.as_str(),
                    &content.session_key,
                    Some(content.sender_key.clone()),
                    Some(content.sender_claimed_ed25519_key.clone()),
                    chain,
                )?
            }
        };

        if let Some(claimed) = event.claimed_session_id() {
            if claimed != session.session_id() {
                return Err(E2eError::RoomKeyMismatch {
                    claimed: claimed.to_string(),
                    derived: session.session_id().to_string(),
                });
            }
        }
        Ok(session)
    }
}
