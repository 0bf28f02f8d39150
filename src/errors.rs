// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Error types for the engine and the protocols built on it.
//!
//! Errors fall into four groups:
//! - [`ConfigurationError`]: the session could not be set up. Nothing ran.
//! - [`MessageError`]: a single inbound message was rejected. These are
//!   logged and absorbed by the [`Handler`](crate::Handler); the session keeps
//!   waiting for valid input.
//! - [`Abort`]: a round found attributable misbehavior while finalizing. The
//!   session is over.
//! - [`InternalError`] / [`CallerError`]: the library was misused or one of
//!   its own invariants broke.
//!
//! [`ProtocolError`] is what [`Handler::result`](crate::Handler::result)
//! reports when no output is available.

use crate::{protocol::ParticipantIdentifier, round::RoundNumber};
use thiserror::Error;

/// Default result type for this crate.
pub type Result<T> = std::result::Result<T, InternalError>;

/// Errors that can occur while constructing a session.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The participant list was empty.
    #[error("the participant set is empty")]
    EmptyParticipantSet,
    /// The local party is not in the participant list.
    #[error("participant {0} is not part of the participant set")]
    SelfNotParticipant(ParticipantIdentifier),
    /// A participant appears more than once.
    #[error("participant {0} appears more than once")]
    DuplicateParticipant(ParticipantIdentifier),
    /// The threshold must be in `[0, participants - 1]`.
    #[error("threshold {threshold} is out of range for {participants} participants")]
    ThresholdOutOfRange {
        /// The requested threshold.
        threshold: usize,
        /// The number of participants.
        participants: usize,
    },
}

/// Reasons for rejecting a single inbound message.
///
/// None of these end the session.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The message belongs to another session.
    #[error("message belongs to a different session")]
    ForeignSession,
    /// The sender is not a participant of this session (or is us).
    #[error("message from unknown sender {0}")]
    UnknownSender(ParticipantIdentifier),
    /// The message is addressed to somebody else.
    #[error("message addressed to {0}")]
    WrongRecipient(ParticipantIdentifier),
    /// The message is for a round we cannot accept it in.
    #[error("message for round {got} cannot be accepted in round {expected}")]
    WrongRound {
        /// The round the handler is in.
        expected: RoundNumber,
        /// The round named in the message.
        got: RoundNumber,
    },
    /// The sender already delivered a message of this kind for this round.
    #[error("sender {0} already delivered a message for this round")]
    DuplicateSender(ParticipantIdentifier),
    /// The content could not be decoded, or does not fit the round.
    #[error("malformed content from {0}")]
    MalformedContent(ParticipantIdentifier),
}

/// The kind of misbehavior behind an [`Abort`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A broadcast was not observed identically by every participant.
    Equivocation,
    /// A proof or share failed verification.
    InvalidProof,
    /// A value contradicts an earlier commitment or the session parameters.
    InconsistentValue,
}

/// Attributable termination of a protocol run.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("protocol aborted ({reason:?}), culprit: {culprit:?}")]
pub struct Abort {
    culprit: Option<ParticipantIdentifier>,
    reason: AbortReason,
}

impl Abort {
    pub(crate) fn new(culprit: Option<ParticipantIdentifier>, reason: AbortReason) -> Self {
        Self { culprit, reason }
    }

    /// Blame `culprit` for `reason`.
    pub fn blame(culprit: ParticipantIdentifier, reason: AbortReason) -> Self {
        Self::new(Some(culprit), reason)
    }

    /// The participant responsible for the abort, if one could be identified.
    pub fn culprit(&self) -> Option<ParticipantIdentifier> {
        self.culprit
    }

    /// What went wrong.
    pub fn reason(&self) -> AbortReason {
        self.reason
    }
}

/// Why a [`Handler`](crate::Handler) has no output to report.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The protocol has not reached a terminal state yet.
    #[error("protocol has not finished")]
    NotFinished,
    /// The protocol aborted.
    #[error(transparent)]
    Aborted(#[from] Abort),
    /// The caller gave up waiting on `missing` in round `round`.
    #[error("round {round} timed out waiting on {missing:?}")]
    Liveness {
        /// The round that stalled.
        round: RoundNumber,
        /// The senders whose messages never arrived.
        missing: Vec<ParticipantIdentifier>,
    },
    /// The handler failed for a reason that is nobody's fault but ours (or
    /// the caller's).
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Errors raised by the library itself.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InternalError {
    /// The calling application made a mistake.
    #[error("the calling application made a mistake: {0}")]
    CallingApplicationMistake(#[from] CallerError),
    /// The session parameters were invalid.
    #[error("invalid session configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    /// Could not serialize a value.
    #[error("serialization failed")]
    Serialization,
    /// The worker pool could not be created.
    #[error("could not create the worker pool")]
    PoolCreation,
    /// Something that should never happen did.
    #[error("internal invariant failed")]
    InternalInvariantFailed,
}

/// Mistakes the calling application can make.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CallerError {
    /// `start` was called twice.
    #[error("the protocol was already started")]
    ProtocolAlreadyStarted,
    /// The protocol already finished or aborted.
    #[error("the protocol already terminated")]
    ProtocolAlreadyTerminated,
    /// An input did not fit the session or protocol.
    #[error("bad input")]
    BadInput,
    /// Bytes handed to the library could not be decoded.
    #[error("deserialization failed")]
    DeserializationFailed,
}

/// Serialize a value with `bincode`, mapping failure to
/// [`InternalError::Serialization`].
macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).map_err(|_| $crate::errors::InternalError::Serialization)
    }};
}

/// Deserialize bytes with `bincode`, mapping failure to
/// [`CallerError::DeserializationFailed`].
macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).map_err(|_| $crate::errors::CallerError::DeserializationFailed)
    }};
}
