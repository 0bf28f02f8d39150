// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The contract between the engine and protocol rounds.
//!
//! A protocol is a chain of types implementing [`Round`], numbered from 1.
//! Each round declares the payload type it expects from its peers
//! ([`Round::Content`]), produces its own payloads when it becomes current,
//! and, once a payload from every expected sender has arrived, consumes them
//! in [`Round::finalize`] to yield the next round, the protocol output, or an
//! [`Abort`].
//!
//! Rounds never see raw messages. The engine checks the session, the
//! sender, the round number, and single delivery, decodes the payload into
//! the round's content type, and runs the broadcast cross-confirmation for
//! [`RoundKind::Broadcast`] rounds before the round body is finalized.

use crate::{
    broadcast::BroadcastRecord,
    errors::{Abort, AbortReason, InternalError, MessageError, Result},
    messages::{Message, MessageKind},
    pool::WorkerPool,
    protocol::ParticipantIdentifier,
    session::SessionIdentity,
};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, warn};

/// Position of a round within its protocol. The first round is 1.
pub type RoundNumber = u16;

/// How a round's payloads travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundKind {
    /// Point-to-point payloads, or multicasts that do not need to be observed
    /// identically by everyone.
    Direct,
    /// A single payload per participant that every participant must observe
    /// identically. Cross-confirmed by an echo sub-phase.
    Broadcast,
}

/// A payload produced by a round, along with its destination.
#[derive(Clone, Debug)]
pub struct Outgoing<C> {
    to: Option<ParticipantIdentifier>,
    content: C,
}

impl<C> Outgoing<C> {
    /// Send `content` to every other participant.
    pub fn to_all(content: C) -> Self {
        Self { to: None, content }
    }

    /// Send `content` to `recipient` only.
    pub fn to(recipient: ParticipantIdentifier, content: C) -> Self {
        Self {
            to: Some(recipient),
            content,
        }
    }
}

/// What finalizing a round leads to.
pub enum Transition<O> {
    /// Continue with the next round.
    NextRound(BoxedRound<O>),
    /// The protocol completed with an output.
    Finished(O),
    /// The protocol stopped because of attributable misbehavior.
    Aborted(Abort),
}

impl<O: Send + 'static> Transition<O> {
    /// Continue with `round`.
    pub fn next_round<R: Round<Output = O>>(round: R) -> Self {
        Self::NextRound(BoxedRound::new(round))
    }

    /// Stop and blame `culprit`.
    pub fn abort(culprit: ParticipantIdentifier, reason: AbortReason) -> Self {
        Self::Aborted(Abort::blame(culprit, reason))
    }
}

/// One round of a protocol.
///
/// Rounds must be deterministic given their inputs. All randomness should be
/// sampled when the protocol's first round is created, so that a broadcast
/// payload does not change if it is produced again.
pub trait Round: Send + 'static {
    /// Output of the protocol this round belongs to.
    type Output: Send + 'static;
    /// The payload this round sends and expects from its peers.
    type Content: Serialize + DeserializeOwned + Send + 'static;

    /// Position of this round. Must be one more than the previous round.
    fn number(&self) -> RoundNumber;

    /// Whether the round's payloads must be cross-confirmed.
    fn kind(&self) -> RoundKind;

    /// Senders this round needs a payload from. Defaults to every other
    /// participant.
    ///
    /// Only [`RoundKind::Direct`] rounds may narrow this set. Every party of a
    /// broadcast round sends, and the echo covers all of them.
    fn expected_senders(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier> {
        session.other_ids().collect()
    }

    /// Payloads to send when the round becomes current. May be empty.
    ///
    /// A [`RoundKind::Broadcast`] round must produce exactly one payload, for
    /// all participants.
    fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<Self::Content>>>;

    /// Cheap structural checks on a decoded payload, run on arrival.
    /// Cryptographic checks belong in [`Round::finalize`].
    fn validate(
        &self,
        _from: ParticipantIdentifier,
        _content: &Self::Content,
    ) -> std::result::Result<(), MessageError> {
        Ok(())
    }

    /// Verify the received payloads and move on.
    ///
    /// `received` holds exactly one payload per expected sender. Independent
    /// per-sender checks should be handed to `pool`. Misbehavior must be
    /// reported as [`Transition::Aborted`]; an `Err` means the local party
    /// could not continue for reasons of its own.
    fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, Self::Content>,
    ) -> Result<Transition<Self::Output>>;
}

/// Object-safe view of a [`Round`] with its decoded payloads.
trait ErasedRound: Send {
    type Output;

    fn number(&self) -> RoundNumber;
    fn kind(&self) -> RoundKind;
    fn expected_senders(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier>;
    fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<(Option<ParticipantIdentifier>, Vec<u8>)>>;
    fn accept_content(
        &mut self,
        from: ParticipantIdentifier,
        bytes: &[u8],
    ) -> std::result::Result<(), MessageError>;
    fn finalize(
        self: Box<Self>,
        session: &SessionIdentity,
        pool: &WorkerPool,
    ) -> Result<Transition<Self::Output>>;
}

struct Collector<R: Round> {
    round: R,
    received: BTreeMap<ParticipantIdentifier, R::Content>,
}

impl<R: Round> ErasedRound for Collector<R> {
    type Output = R::Output;

    fn number(&self) -> RoundNumber {
        self.round.number()
    }

    fn kind(&self) -> RoundKind {
        self.round.kind()
    }

    fn expected_senders(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier> {
        self.round.expected_senders(session)
    }

    fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<(Option<ParticipantIdentifier>, Vec<u8>)>> {
        self.round
            .produce_initial_messages(session)?
            .into_iter()
            .map(|outgoing| Ok((outgoing.to, serialize!(&outgoing.content)?)))
            .collect()
    }

    fn accept_content(
        &mut self,
        from: ParticipantIdentifier,
        bytes: &[u8],
    ) -> std::result::Result<(), MessageError> {
        let content: R::Content =
            deserialize!(bytes).map_err(|_| MessageError::MalformedContent(from))?;
        self.round.validate(from, &content)?;
        let _ = self.received.insert(from, content);
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        session: &SessionIdentity,
        pool: &WorkerPool,
    ) -> Result<Transition<R::Output>> {
        let Collector { round, received } = *self;
        round.finalize(session, pool, received)
    }
}

/// A type-erased round, as held by the engine.
pub struct BoxedRound<O>(Box<dyn ErasedRound<Output = O>>);

impl<O: Send + 'static> BoxedRound<O> {
    /// Erase the content type of `round`.
    pub fn new<R: Round<Output = O>>(round: R) -> Self {
        Self(Box::new(Collector {
            round,
            received: BTreeMap::new(),
        }))
    }

    /// Position of the round.
    pub fn number(&self) -> RoundNumber {
        self.0.number()
    }

    /// How the round's payloads travel.
    pub fn kind(&self) -> RoundKind {
        self.0.kind()
    }
}

impl<O> std::fmt::Debug for BoxedRound<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedRound")
            .field("number", &self.0.number())
            .field("kind", &self.0.kind())
            .finish()
    }
}

/// The current round of a handler together with the engine's bookkeeping.
pub(crate) struct RoundState<O> {
    body: BoxedRound<O>,
    number: RoundNumber,
    kind: RoundKind,
    expected_senders: BTreeSet<ParticipantIdentifier>,
    received: BTreeMap<ParticipantIdentifier, Message>,
    broadcast: Option<BroadcastRecord>,
}

impl<O: Send + 'static> RoundState<O> {
    pub(crate) fn new(body: BoxedRound<O>, session: &SessionIdentity) -> Result<Self> {
        let number = body.number();
        let kind = body.kind();
        let expected_senders = body
            .0
            .expected_senders(session)
            .into_iter()
            .collect::<BTreeSet<_>>();
        if kind == RoundKind::Broadcast && !expected_senders.iter().copied().eq(session.other_ids().sorted()) {
            error!("Broadcast round {number} must expect a payload from every other participant");
            return Err(InternalError::InternalInvariantFailed);
        }
        let broadcast = (kind == RoundKind::Broadcast).then(|| BroadcastRecord::new(number));
        Ok(Self {
            body,
            number,
            kind,
            expected_senders,
            received: BTreeMap::new(),
            broadcast,
        })
    }

    pub(crate) fn number(&self) -> RoundNumber {
        self.number
    }

    /// Stamp the round's initial payloads into messages.
    pub(crate) fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<Message>> {
        let payloads = self.body.0.produce_initial_messages(session)?;

        for (to, _) in &payloads {
            if let Some(recipient) = to {
                if *recipient == session.self_id() || !session.contains(recipient) {
                    error!("Round {} addressed a message to {recipient}", self.number);
                    return Err(InternalError::InternalInvariantFailed);
                }
            }
        }
        if let Some(record) = self.broadcast.as_mut() {
            match payloads.as_slice() {
                [(None, content)] => record.observe(session, session.self_id(), content),
                _ => {
                    error!(
                        "Broadcast round {} must produce exactly one payload for everyone",
                        self.number
                    );
                    return Err(InternalError::InternalInvariantFailed);
                }
            }
        }

        Ok(payloads
            .into_iter()
            .map(|(to, content)| {
                Message::new(
                    session.hash(),
                    self.number,
                    MessageKind::Primary,
                    session.self_id(),
                    to,
                    content,
                )
            })
            .collect())
    }

    /// Check a session-matched message against this round and store it.
    pub(crate) fn handle_message(
        &mut self,
        session: &SessionIdentity,
        message: &Message,
    ) -> std::result::Result<(), MessageError> {
        let from = message.from();
        if message.round() != self.number {
            return Err(MessageError::WrongRound {
                expected: self.number,
                got: message.round(),
            });
        }

        if message.kind() == MessageKind::Echo {
            return match self.broadcast.as_mut() {
                Some(record) => record.record_report(session, message),
                None => Err(MessageError::MalformedContent(from)),
            };
        }

        if !self.expected_senders.contains(&from) {
            return Err(MessageError::UnknownSender(from));
        }
        if let Some(previous) = self.received.get(&from) {
            if previous.content() != message.content() {
                warn!(
                    "Participant {from} sent a second, different message for round {}",
                    self.number
                );
            }
            return Err(MessageError::DuplicateSender(from));
        }
        if self.kind == RoundKind::Broadcast && !message.is_broadcast() {
            return Err(MessageError::MalformedContent(from));
        }

        self.body.0.accept_content(from, message.content())?;
        if let Some(record) = self.broadcast.as_mut() {
            record.observe(session, from, message.content());
        }
        let _ = self.received.insert(from, message.clone());
        Ok(())
    }

    /// Our echo, once every broadcast payload of the round has arrived.
    pub(crate) fn echo_if_ready(&mut self, session: &SessionIdentity) -> Result<Option<Message>> {
        match self.broadcast.as_mut() {
            Some(record) if self.expected_senders.iter().all(|pid| self.received.contains_key(pid)) => {
                record.echo(session)
            }
            _ => Ok(None),
        }
    }

    /// Senders this round is still waiting on, in session order.
    pub(crate) fn waiting_on(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier> {
        let missing_echoes = self
            .broadcast
            .as_ref()
            .map(|record| record.missing_reports(session))
            .unwrap_or_default();
        session
            .participant_ids()
            .iter()
            .filter(|pid| {
                (self.expected_senders.contains(pid) && !self.received.contains_key(pid))
                    || missing_echoes.contains(pid)
            })
            .copied()
            .collect()
    }

    pub(crate) fn can_finalize(&self, session: &SessionIdentity) -> bool {
        let primaries_done = self
            .expected_senders
            .iter()
            .all(|pid| self.received.contains_key(pid));
        let echoes_done = self
            .broadcast
            .as_ref()
            .map_or(true, |record| record.is_complete(session));
        primaries_done && echoes_done
    }

    pub(crate) fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
    ) -> Result<Transition<O>> {
        if let Some(culprit) = self
            .broadcast
            .as_ref()
            .and_then(|record| record.find_equivocation(session))
        {
            return Ok(Transition::abort(culprit, AbortReason::Equivocation));
        }
        self.body.0.finalize(session, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::ParticipantConfig, utils::testing::init_testing};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping(u64);

    struct PingRound {
        kind: RoundKind,
        /// Only wait on the first other participant.
        narrow: bool,
    }

    impl Round for PingRound {
        type Output = u64;
        type Content = Ping;

        fn number(&self) -> RoundNumber {
            1
        }

        fn kind(&self) -> RoundKind {
            self.kind
        }

        fn expected_senders(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier> {
            let others = session.other_ids();
            if self.narrow {
                others.take(1).collect()
            } else {
                others.collect()
            }
        }

        fn produce_initial_messages(
            &mut self,
            _session: &SessionIdentity,
        ) -> Result<Vec<Outgoing<Ping>>> {
            Ok(vec![Outgoing::to_all(Ping(7))])
        }

        fn validate(
            &self,
            from: ParticipantIdentifier,
            content: &Ping,
        ) -> std::result::Result<(), MessageError> {
            if content.0 == 0 {
                return Err(MessageError::MalformedContent(from));
            }
            Ok(())
        }

        fn finalize(
            self,
            _session: &SessionIdentity,
            _pool: &WorkerPool,
            received: BTreeMap<ParticipantIdentifier, Ping>,
        ) -> Result<Transition<u64>> {
            Ok(Transition::Finished(received.values().map(|ping| ping.0).sum()))
        }
    }

    fn setup(kind: RoundKind) -> (Vec<SessionIdentity>, Vec<RoundState<u64>>) {
        let mut rng = init_testing();
        let pids = ParticipantConfig::random(3, &mut rng).all_participants();
        let sessions = pids
            .iter()
            .map(|pid| SessionIdentity::new("ping", pids.clone(), *pid, 1, &[]).unwrap())
            .collect::<Vec<_>>();
        let states = sessions
            .iter()
            .map(|session| {
                RoundState::new(BoxedRound::new(PingRound { kind, narrow: false }), session).unwrap()
            })
            .collect();
        (sessions, states)
    }

    #[test]
    fn direct_round_accepts_one_message_per_sender() {
        let (sessions, mut states) = setup(RoundKind::Direct);
        let messages = states
            .iter_mut()
            .zip(&sessions)
            .map(|(state, session)| state.produce_initial_messages(session).unwrap().remove(0))
            .collect::<Vec<_>>();

        let (state, session) = (&mut states[0], &sessions[0]);
        assert!(!state.can_finalize(session));
        state.handle_message(session, &messages[1]).unwrap();
        assert_eq!(
            state.handle_message(session, &messages[1]),
            Err(MessageError::DuplicateSender(messages[1].from()))
        );
        assert_eq!(state.waiting_on(session), vec![messages[2].from()]);
        state.handle_message(session, &messages[2]).unwrap();
        assert!(state.can_finalize(session));
        assert!(state.echo_if_ready(session).unwrap().is_none());

        let pool = WorkerPool::new(1).unwrap();
        match states.remove(0).finalize(&sessions[0], &pool).unwrap() {
            Transition::Finished(sum) => assert_eq!(sum, 14),
            _ => panic!("expected the round to finish"),
        }
    }

    #[test]
    fn content_is_decoded_and_validated_on_arrival() {
        let (sessions, mut states) = setup(RoundKind::Direct);
        let message = states[1].produce_initial_messages(&sessions[1]).unwrap().remove(0);
        let sender = message.from();

        let garbage = message.clone().with_content(vec![1]);
        assert_eq!(
            states[0].handle_message(&sessions[0], &garbage),
            Err(MessageError::MalformedContent(sender))
        );
        let zero = message.clone().with_content(bincode::serialize(&Ping(0)).unwrap());
        assert_eq!(
            states[0].handle_message(&sessions[0], &zero),
            Err(MessageError::MalformedContent(sender))
        );
        // Rejected payloads do not count as the sender's delivery.
        states[0].handle_message(&sessions[0], &message).unwrap();
    }

    #[test]
    fn broadcast_round_waits_for_echoes() {
        let (sessions, mut states) = setup(RoundKind::Broadcast);
        let primaries = states
            .iter_mut()
            .zip(&sessions)
            .map(|(state, session)| state.produce_initial_messages(session).unwrap().remove(0))
            .collect::<Vec<_>>();

        let mut echoes = Vec::new();
        for (index, (state, session)) in states.iter_mut().zip(&sessions).enumerate() {
            for (sender, primary) in primaries.iter().enumerate() {
                if sender != index {
                    state.handle_message(session, primary).unwrap();
                }
            }
            assert!(!state.can_finalize(session));
            echoes.push(state.echo_if_ready(session).unwrap().unwrap());
        }

        let (state, session) = (&mut states[0], &sessions[0]);
        assert_eq!(state.waiting_on(session), vec![echoes[1].from(), echoes[2].from()]);
        state.handle_message(session, &echoes[1]).unwrap();
        state.handle_message(session, &echoes[2]).unwrap();
        assert!(state.can_finalize(session));
        assert!(state.waiting_on(session).is_empty());
    }

    #[test]
    fn echo_is_rejected_in_direct_rounds() {
        let (sessions, mut broadcast_states) = setup(RoundKind::Broadcast);
        let primaries = broadcast_states
            .iter_mut()
            .zip(&sessions)
            .map(|(state, session)| state.produce_initial_messages(session).unwrap().remove(0))
            .collect::<Vec<_>>();
        let state = &mut broadcast_states[1];
        state.handle_message(&sessions[1], &primaries[0]).unwrap();
        state.handle_message(&sessions[1], &primaries[2]).unwrap();
        let echo = state.echo_if_ready(&sessions[1]).unwrap().unwrap();

        let mut direct = RoundState::new(
            BoxedRound::new(PingRound {
                kind: RoundKind::Direct,
                narrow: false,
            }),
            &sessions[0],
        )
        .unwrap();
        assert_eq!(
            direct.handle_message(&sessions[0], &echo),
            Err(MessageError::MalformedContent(echo.from()))
        );
    }

    #[test]
    fn only_direct_rounds_may_narrow_their_senders() {
        let (sessions, _) = setup(RoundKind::Direct);
        let session = &sessions[0];
        let narrow = |kind| BoxedRound::new(PingRound { kind, narrow: true });

        let mut direct = RoundState::new(narrow(RoundKind::Direct), session).unwrap();
        assert_eq!(direct.waiting_on(session), vec![session.other_ids().next().unwrap()]);
        assert!(direct.produce_initial_messages(session).is_ok());

        assert_eq!(
            RoundState::new(narrow(RoundKind::Broadcast), session).err(),
            Some(InternalError::InternalInvariantFailed)
        );
    }
}
