// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The message type exchanged between handlers.

use crate::{protocol::ParticipantIdentifier, round::RoundNumber, session::SessionHash};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// What a message carries within its round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    /// The round's protocol payload.
    Primary,
    /// A sender's report of the broadcast digests it observed in a broadcast
    /// round.
    Echo,
}

/// A message produced by one [`Handler`](crate::Handler) for others.
///
/// Messages are opaque to the calling application, which only needs
/// [`Message::to`] to route them. The type implements `serde` traits so the
/// application can pick any wire encoding.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    session_hash: SessionHash,
    round: RoundNumber,
    kind: MessageKind,
    from: ParticipantIdentifier,
    to: Option<ParticipantIdentifier>,
    content: Vec<u8>,
    broadcast_hash: Option<[u8; 32]>,
}

impl Message {
    pub(crate) fn new(
        session_hash: SessionHash,
        round: RoundNumber,
        kind: MessageKind,
        from: ParticipantIdentifier,
        to: Option<ParticipantIdentifier>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            session_hash,
            round,
            kind,
            from,
            to,
            content,
            broadcast_hash: None,
        }
    }

    pub(crate) fn with_broadcast_hash(mut self, hash: [u8; 32]) -> Self {
        self.broadcast_hash = Some(hash);
        self
    }

    /// The session the message belongs to.
    pub fn session_hash(&self) -> SessionHash {
        self.session_hash
    }

    /// The round the message belongs to. Always at least 1.
    pub fn round(&self) -> RoundNumber {
        self.round
    }

    /// Whether this is a protocol payload or a broadcast echo.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The sender.
    pub fn from(&self) -> ParticipantIdentifier {
        self.from
    }

    /// The recipient, or `None` if the message goes to every other
    /// participant.
    pub fn to(&self) -> Option<ParticipantIdentifier> {
        self.to
    }

    /// Whether the message goes to every other participant.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// The serialized payload.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Digest over the content of an echo message.
    pub fn broadcast_hash(&self) -> Option<&[u8; 32]> {
        self.broadcast_hash.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_session_hash(mut self, session_hash: SessionHash) -> Self {
        self.session_hash = session_hash;
        self
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("session_hash", &self.session_hash)
            .field("round", &self.round)
            .field("kind", &self.kind)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("content_len", &self.content.len())
            .finish()
    }
}
