// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Gatekeeping for inbound messages.
//!
//! The router decides, for every inbound message, whether it goes to the
//! current round, waits for a later round, or is dropped.

use crate::{
    errors::MessageError,
    messages::{Message, MessageKind},
    protocol::ParticipantIdentifier,
    round::RoundNumber,
    session::SessionIdentity,
};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

/// How many rounds ahead of the current one a message may be and still get
/// buffered. Honest peers are never more than one round ahead.
pub(crate) const FUTURE_ROUND_WINDOW: RoundNumber = 2;

/// Where an inbound message goes.
#[derive(Debug)]
pub(crate) enum Routing {
    /// Hand to the current round.
    Deliver(Message),
    /// Held until its round becomes current.
    Buffered,
    /// The round already passed. Dropped.
    Stale,
}

type DeliveryKey = (RoundNumber, ParticipantIdentifier, MessageKind);

#[derive(Debug, Default)]
pub(crate) struct MessageRouter {
    /// Messages for later rounds, in arrival order.
    future: BTreeMap<RoundNumber, Vec<Message>>,
    /// Digest of every message accepted so far.
    delivered: HashMap<DeliveryKey, [u8; 32]>,
}

fn content_digest(message: &Message) -> [u8; 32] {
    Sha3_256::digest(message.content()).into()
}

fn key(message: &Message) -> DeliveryKey {
    (message.round(), message.from(), message.kind())
}

impl MessageRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Classify `message` against the handler's `current` round (0 before
    /// the handler starts).
    pub(crate) fn route(
        &mut self,
        session: &SessionIdentity,
        current: RoundNumber,
        message: Message,
    ) -> Result<Routing, MessageError> {
        if message.session_hash() != session.hash() {
            return Err(MessageError::ForeignSession);
        }
        let from = message.from();
        if from == session.self_id() || !session.contains(&from) {
            return Err(MessageError::UnknownSender(from));
        }
        if let Some(recipient) = message.to() {
            if recipient != session.self_id() {
                return Err(MessageError::WrongRecipient(recipient));
            }
        }

        let round = message.round();
        if round == 0 || round > current.saturating_add(FUTURE_ROUND_WINDOW) {
            return Err(MessageError::WrongRound {
                expected: current,
                got: round,
            });
        }

        if round == current {
            Ok(Routing::Deliver(message))
        } else if round > current {
            let queue = self.future.entry(round).or_default();
            if queue
                .iter()
                .any(|queued| queued.from() == from && queued.kind() == message.kind())
            {
                return Err(MessageError::DuplicateSender(from));
            }
            debug!("Buffering round {round} message from {from} while in round {current}");
            queue.push(message);
            Ok(Routing::Buffered)
        } else {
            match self.delivered.get(&key(&message)) {
                Some(digest) if *digest == content_digest(&message) => {
                    trace!("Dropping retransmitted round {round} message from {from}");
                }
                _ => {
                    warn!(
                        "Dropping unexpected round {round} message from {from} after the round completed; possible replay"
                    );
                }
            }
            Ok(Routing::Stale)
        }
    }

    /// Remember that the current round accepted `message`.
    pub(crate) fn record_delivery(&mut self, message: &Message) {
        let _ = self.delivered.insert(key(message), content_digest(message));
    }

    /// Remove and return the messages buffered for `round`, in arrival order.
    /// Anything buffered for earlier rounds is dropped.
    pub(crate) fn take_buffered(&mut self, round: RoundNumber) -> Vec<Message> {
        let later = self.future.split_off(&round.saturating_add(1));
        let mut current_and_earlier = std::mem::replace(&mut self.future, later);
        current_and_earlier.remove(&round).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn buffered_count(&self) -> usize {
        self.future.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::ParticipantConfig, utils::testing::init_testing};

    struct Fixture {
        sessions: Vec<SessionIdentity>,
        router: MessageRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let mut rng = init_testing();
            let pids = ParticipantConfig::random(3, &mut rng).all_participants();
            let sessions = pids
                .iter()
                .map(|pid| SessionIdentity::new("router", pids.clone(), *pid, 1, &[]).unwrap())
                .collect();
            Self {
                sessions,
                router: MessageRouter::new(),
            }
        }

        fn local(&self) -> &SessionIdentity {
            &self.sessions[0]
        }

        fn message(&self, sender: usize, round: RoundNumber, content: &[u8]) -> Message {
            let session = &self.sessions[sender];
            Message::new(
                session.hash(),
                round,
                MessageKind::Primary,
                session.self_id(),
                None,
                content.to_vec(),
            )
        }

        fn route(&mut self, current: RoundNumber, message: Message) -> Result<Routing, MessageError> {
            let session = self.sessions[0].clone();
            self.router.route(&session, current, message)
        }
    }

    #[test]
    fn foreign_session_is_rejected() {
        let mut fixture = Fixture::new();
        let other = Fixture::new();
        let message = fixture
            .message(1, 1, b"hi")
            .with_session_hash(other.local().hash());
        assert_eq!(
            fixture.route(1, message).unwrap_err(),
            MessageError::ForeignSession
        );
        assert_eq!(fixture.router.buffered_count(), 0);
    }

    #[test]
    fn self_and_outsiders_are_unknown_senders() {
        let mut fixture = Fixture::new();
        let own = fixture.message(0, 1, b"me");
        let own_id = own.from();
        assert_eq!(
            fixture.route(1, own).unwrap_err(),
            MessageError::UnknownSender(own_id)
        );

        let mut rng = init_testing();
        let stranger = ParticipantIdentifier::random(&mut rng);
        let message = Message::new(
            fixture.local().hash(),
            1,
            MessageKind::Primary,
            stranger,
            None,
            vec![],
        );
        assert_eq!(
            fixture.route(1, message).unwrap_err(),
            MessageError::UnknownSender(stranger)
        );
    }

    #[test]
    fn messages_for_someone_else_are_rejected() {
        let mut fixture = Fixture::new();
        let sender = fixture.sessions[1].self_id();
        let bystander = fixture.sessions[2].self_id();
        let message = Message::new(
            fixture.local().hash(),
            1,
            MessageKind::Primary,
            sender,
            Some(bystander),
            vec![],
        );
        assert_eq!(
            fixture.route(1, message).unwrap_err(),
            MessageError::WrongRecipient(bystander)
        );
    }

    #[test]
    fn current_round_is_delivered() {
        let mut fixture = Fixture::new();
        let message = fixture.message(1, 2, b"now");
        assert!(matches!(fixture.route(2, message), Ok(Routing::Deliver(_))));
    }

    #[test]
    fn future_rounds_are_buffered_once_per_sender() {
        let mut fixture = Fixture::new();
        let early = fixture.message(1, 2, b"early");
        assert!(matches!(fixture.route(1, early.clone()), Ok(Routing::Buffered)));
        assert_eq!(
            fixture.route(1, fixture.message(1, 2, b"again")).unwrap_err(),
            MessageError::DuplicateSender(early.from())
        );
        assert!(matches!(
            fixture.route(1, fixture.message(2, 2, b"other")),
            Ok(Routing::Buffered)
        ));
        assert!(matches!(
            fixture.route(1, fixture.message(2, 3, b"later")),
            Ok(Routing::Buffered)
        ));

        let replay = fixture.router.take_buffered(2);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0], early);
        assert_eq!(fixture.router.buffered_count(), 1);
    }

    #[test]
    fn rounds_beyond_the_window_are_rejected() {
        let mut fixture = Fixture::new();
        let too_far = fixture.message(1, 1 + FUTURE_ROUND_WINDOW + 1, b"far");
        assert_eq!(
            fixture.route(1, too_far).unwrap_err(),
            MessageError::WrongRound {
                expected: 1,
                got: 1 + FUTURE_ROUND_WINDOW + 1
            }
        );
        assert_eq!(
            fixture.route(1, fixture.message(1, 0, b"zero")).unwrap_err(),
            MessageError::WrongRound {
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn messages_before_start_are_buffered_for_round_one() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.route(0, fixture.message(1, 1, b"first")),
            Ok(Routing::Buffered)
        ));
        assert_eq!(fixture.router.take_buffered(1).len(), 1);
    }

    #[test]
    fn stale_messages_are_dropped() {
        let mut fixture = Fixture::new();
        let accepted = fixture.message(1, 1, b"done");
        fixture.router.record_delivery(&accepted);
        assert!(matches!(fixture.route(2, accepted), Ok(Routing::Stale)));
        assert!(matches!(
            fixture.route(2, fixture.message(1, 1, b"replayed")),
            Ok(Routing::Stale)
        ));
    }

    #[test]
    fn buffers_for_passed_rounds_are_dropped() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.route(1, fixture.message(1, 2, b"two")),
            Ok(Routing::Buffered)
        ));
        assert!(matches!(
            fixture.route(1, fixture.message(1, 3, b"three")),
            Ok(Routing::Buffered)
        ));
        assert_eq!(fixture.router.take_buffered(3).len(), 1);
        assert_eq!(fixture.router.buffered_count(), 0);
    }
}
