// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The protocol driver.
//!
//! A [`Handler`] runs one session of one protocol for the local participant.
//! It moves through `Created → Running(1) → … → Running(K)` and ends either
//! `Finished` with the protocol output or `Aborted` with the culprit.
//!
//! The handler performs no I/O and is not internally synchronized: the
//! calling application feeds it inbound messages one at a time and transports
//! whatever it returns. Abandoning a session is done by dropping its handler.

use crate::{
    errors::{Abort, CallerError, InternalError, ProtocolError, Result},
    messages::Message,
    pool::WorkerPool,
    protocol::ParticipantIdentifier,
    round::{BoxedRound, RoundNumber, RoundState, Transition},
    router::{MessageRouter, Routing},
    session::SessionIdentity,
};
use tracing::{debug, error, info, instrument, warn};

/// Where a [`Handler`] is in its run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not started yet.
    Created,
    /// Waiting for messages of `round`.
    Running {
        /// The current round.
        round: RoundNumber,
    },
    /// Finished with an output.
    Finished,
    /// Stopped because of misbehavior.
    Aborted(Abort),
    /// Stopped because of an internal error.
    Failed,
}

/// The senders a running round is still waiting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pending {
    /// The current round.
    pub round: RoundNumber,
    /// Participants whose payload or echo has not arrived, in session order.
    pub senders: Vec<ParticipantIdentifier>,
}

enum State<O> {
    Created(BoxedRound<O>),
    Running(RoundState<O>),
    Finished(O),
    Aborted(Abort),
    Failed(InternalError),
    // Only observable while a round is being replaced.
    Transitioning,
}

/// Drives one protocol session for the local participant.
pub struct Handler<O> {
    session: SessionIdentity,
    pool: WorkerPool,
    router: MessageRouter,
    state: State<O>,
    round: RoundNumber,
    rounds_finalized: usize,
}

impl<O: Send + 'static> Handler<O> {
    /// Prepare a run of the protocol whose first round is `first_round`.
    #[instrument(skip_all, err(Debug))]
    pub fn new(session: SessionIdentity, pool: WorkerPool, first_round: BoxedRound<O>) -> Result<Self> {
        if first_round.number() != 1 {
            error!(
                "A protocol must start at round 1, not round {}",
                first_round.number()
            );
            Err(CallerError::BadInput)?
        }
        Ok(Self {
            session,
            pool,
            router: MessageRouter::new(),
            state: State::Created(first_round),
            round: 0,
            rounds_finalized: 0,
        })
    }

    /// The session this handler runs.
    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    /// Where the handler is in its run.
    pub fn status(&self) -> Status {
        match &self.state {
            State::Created(_) => Status::Created,
            State::Running(round) => Status::Running {
                round: round.number(),
            },
            State::Finished(_) => Status::Finished,
            State::Aborted(abort) => Status::Aborted(*abort),
            State::Failed(_) | State::Transitioning => Status::Failed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            State::Finished(_) | State::Aborted(_) | State::Failed(_) | State::Transitioning
        )
    }

    /// Number of rounds finalized so far.
    pub fn rounds_finalized(&self) -> usize {
        self.rounds_finalized
    }

    /// Enter round 1. Returns the messages to send.
    #[instrument(skip_all, err(Debug))]
    pub fn start(&mut self) -> Result<Vec<Message>> {
        if !matches!(self.state, State::Created(_)) {
            error!("Tried to start a protocol that was already started");
            Err(CallerError::ProtocolAlreadyStarted)?
        }
        let State::Created(first) = std::mem::replace(&mut self.state, State::Transitioning) else {
            return Err(InternalError::InternalInvariantFailed);
        };
        info!(
            "Starting {} as {} with {} participants",
            self.session.protocol_name(),
            self.session.self_id(),
            self.session.participant_ids().len()
        );
        let result = self.enter(first).and_then(|outgoing| self.advance(outgoing));
        self.fail_on_error(result)
    }

    /// Process one inbound message. Returns the messages to send in response,
    /// which may be none.
    ///
    /// Messages that do not fit the session or round are logged and dropped.
    /// Messages for later rounds, including ones that arrive before
    /// [`Handler::start`], are held until their round comes up.
    #[instrument(skip_all, err(Debug))]
    pub fn deliver(&mut self, message: Message) -> Result<Vec<Message>> {
        if self.is_terminal() {
            debug!("Ignoring message from {} after termination", message.from());
            Err(CallerError::ProtocolAlreadyTerminated)?
        }
        let message = match self.router.route(&self.session, self.round, message) {
            Ok(Routing::Deliver(message)) => message,
            Ok(Routing::Buffered) | Ok(Routing::Stale) => return Ok(Vec::new()),
            Err(e) => {
                warn!("Dropping message: {e}");
                return Ok(Vec::new());
            }
        };
        let result = self.accept(message).and_then(|outgoing| self.advance(outgoing));
        self.fail_on_error(result)
    }

    /// The protocol output, once the run finished.
    pub fn result(&self) -> std::result::Result<&O, ProtocolError> {
        match &self.state {
            State::Finished(output) => Ok(output),
            State::Aborted(abort) => Err(ProtocolError::Aborted(*abort)),
            State::Failed(e) => Err(ProtocolError::Internal(e.clone())),
            State::Transitioning => Err(ProtocolError::Internal(InternalError::InternalInvariantFailed)),
            State::Created(_) | State::Running(_) => Err(ProtocolError::NotFinished),
        }
    }

    /// Consume the handler and return the protocol output.
    pub fn into_result(self) -> std::result::Result<O, ProtocolError> {
        match self.state {
            State::Finished(output) => Ok(output),
            State::Aborted(abort) => Err(ProtocolError::Aborted(abort)),
            State::Failed(e) => Err(ProtocolError::Internal(e)),
            State::Transitioning => Err(ProtocolError::Internal(InternalError::InternalInvariantFailed)),
            State::Created(_) | State::Running(_) => Err(ProtocolError::NotFinished),
        }
    }

    /// Which senders the current round still needs to hear from. `None`
    /// unless the handler is running.
    pub fn waiting_on(&self) -> Option<Pending> {
        match &self.state {
            State::Running(round) => Some(Pending {
                round: round.number(),
                senders: round.waiting_on(&self.session),
            }),
            _ => None,
        }
    }

    /// The error to report when the calling application gives up waiting.
    pub fn liveness_error(&self) -> Option<ProtocolError> {
        self.waiting_on()
            .map(|pending| ProtocolError::Liveness {
                round: pending.round,
                missing: pending.senders,
            })
    }

    fn fail_on_error(&mut self, result: Result<Vec<Message>>) -> Result<Vec<Message>> {
        if let Err(e) = &result {
            error!("Session failed: {e}");
            self.state = State::Failed(e.clone());
        }
        result
    }

    /// Make `body` the current round and replay whatever was buffered for it.
    fn enter(&mut self, body: BoxedRound<O>) -> Result<Vec<Message>> {
        if body.number() != self.round + 1 {
            error!(
                "Round {} was followed by round {}",
                self.round,
                body.number()
            );
            return Err(InternalError::InternalInvariantFailed);
        }
        self.round = body.number();
        info!("Entering round {}", self.round);

        let mut round = RoundState::new(body, &self.session)?;
        let mut outgoing = round.produce_initial_messages(&self.session)?;
        self.state = State::Running(round);

        for message in self.router.take_buffered(self.round) {
            outgoing.extend(self.accept(message)?);
        }
        if let State::Running(round) = &mut self.state {
            outgoing.extend(round.echo_if_ready(&self.session)?);
        }
        Ok(outgoing)
    }

    /// Hand a message for the current round to it.
    fn accept(&mut self, message: Message) -> Result<Vec<Message>> {
        let State::Running(round) = &mut self.state else {
            error!("Accepted a message while no round is running");
            return Err(InternalError::InternalInvariantFailed);
        };
        if let Err(e) = round.handle_message(&self.session, &message) {
            warn!("Round {} rejected a message: {e}", round.number());
            return Ok(Vec::new());
        }
        self.router.record_delivery(&message);
        Ok(round.echo_if_ready(&self.session)?.into_iter().collect())
    }

    /// Finalize rounds for as long as the current one is ready.
    fn advance(&mut self, mut outgoing: Vec<Message>) -> Result<Vec<Message>> {
        loop {
            match &self.state {
                State::Running(round) if round.can_finalize(&self.session) => {}
                _ => return Ok(outgoing),
            }
            let State::Running(round) = std::mem::replace(&mut self.state, State::Transitioning) else {
                return Err(InternalError::InternalInvariantFailed);
            };

            debug!("Finalizing round {}", round.number());
            self.rounds_finalized += 1;
            match round.finalize(&self.session, &self.pool)? {
                Transition::NextRound(next) => outgoing.extend(self.enter(next)?),
                Transition::Finished(output) => {
                    info!(
                        "{} finished after {} rounds",
                        self.session.protocol_name(),
                        self.rounds_finalized
                    );
                    self.state = State::Finished(output);
                    return Ok(outgoing);
                }
                Transition::Aborted(abort) => {
                    error!("{} aborted: {abort}", self.session.protocol_name());
                    self.state = State::Aborted(abort);
                    return Ok(outgoing);
                }
            }
        }
    }
}
