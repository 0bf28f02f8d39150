// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Cross-confirmation of broadcast rounds.
//!
//! The transport is not trusted to hand every participant the same copy of a
//! broadcast. After a party has seen every primary message of a broadcast
//! round, it sends an echo listing the digest of each participant's payload
//! as it observed it. The round only finalizes once every other participant
//! has echoed, and it aborts if any two views of the same sender's payload
//! disagree. The sender whose payload was seen in two versions is the
//! culprit.

use crate::{
    errors::{MessageError, Result},
    messages::{Message, MessageKind},
    protocol::ParticipantIdentifier,
    round::RoundNumber,
    session::{SessionHash, SessionIdentity},
};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Digest of one participant's broadcast payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BroadcastDigest([u8; 32]);

impl BroadcastDigest {
    /// Digest of `content` as sent by `sender` in `round` of the session.
    pub(crate) fn compute(
        session_hash: &SessionHash,
        round: RoundNumber,
        sender: ParticipantIdentifier,
        content: &[u8],
    ) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(b"tss-engine/broadcast");
        hasher.update(session_hash.as_bytes());
        hasher.update(round.to_le_bytes());
        hasher.update(sender.to_bytes());
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
        Self(hasher.finalize().into())
    }
}

/// Payload of an echo message.
#[derive(Debug, Serialize, Deserialize)]
struct EchoContent {
    digests: Vec<(ParticipantIdentifier, BroadcastDigest)>,
}

fn echo_hash(content: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"tss-engine/echo");
    hasher.update(content);
    hasher.finalize().into()
}

/// Everything a party learned about the broadcasts of one round.
#[derive(Debug)]
pub(crate) struct BroadcastRecord {
    round: RoundNumber,
    /// Our own view of each sender's payload.
    observed: BTreeMap<ParticipantIdentifier, BroadcastDigest>,
    /// Each reporter's view, in session order.
    reports: BTreeMap<ParticipantIdentifier, Vec<BroadcastDigest>>,
    echo_sent: bool,
}

impl BroadcastRecord {
    pub(crate) fn new(round: RoundNumber) -> Self {
        Self {
            round,
            observed: BTreeMap::new(),
            reports: BTreeMap::new(),
            echo_sent: false,
        }
    }

    /// Record our view of `sender`'s payload.
    pub(crate) fn observe(&mut self, session: &SessionIdentity, sender: ParticipantIdentifier, content: &[u8]) {
        let digest = BroadcastDigest::compute(&session.hash(), self.round, sender, content);
        self.observed.insert(sender, digest);
    }

    fn observed_all(&self, session: &SessionIdentity) -> bool {
        session
            .participant_ids()
            .iter()
            .all(|pid| self.observed.contains_key(pid))
    }

    /// Produce our echo once every payload of the round has been observed.
    ///
    /// Returns `None` if the echo was already produced, if payloads are still
    /// missing, or if there is nobody to send it to.
    pub(crate) fn echo(&mut self, session: &SessionIdentity) -> Result<Option<Message>> {
        if self.echo_sent || !self.observed_all(session) {
            return Ok(None);
        }
        self.echo_sent = true;
        if session.other_ids().next().is_none() {
            return Ok(None);
        }

        let digests = session
            .participant_ids()
            .iter()
            .filter_map(|pid| self.observed.get(pid).map(|digest| (*pid, *digest)))
            .collect();
        let content = serialize!(&EchoContent { digests })?;
        let hash = echo_hash(&content);
        debug!("Echoing broadcast digests for round {}", self.round);
        let message = Message::new(
            session.hash(),
            self.round,
            MessageKind::Echo,
            session.self_id(),
            None,
            content,
        )
        .with_broadcast_hash(hash);
        Ok(Some(message))
    }

    /// Store another participant's echo.
    pub(crate) fn record_report(
        &mut self,
        session: &SessionIdentity,
        message: &Message,
    ) -> std::result::Result<(), MessageError> {
        let reporter = message.from();
        if self.reports.contains_key(&reporter) {
            return Err(MessageError::DuplicateSender(reporter));
        }
        if !message.is_broadcast() || message.broadcast_hash() != Some(&echo_hash(message.content())) {
            warn!("Echo from {reporter} does not match its broadcast hash");
            return Err(MessageError::MalformedContent(reporter));
        }
        let echo: EchoContent =
            deserialize!(message.content()).map_err(|_| MessageError::MalformedContent(reporter))?;

        let covers_session = echo.digests.len() == session.participant_ids().len()
            && echo
                .digests
                .iter()
                .zip(session.participant_ids())
                .all(|((pid, _), expected)| pid == expected);
        if !covers_session {
            warn!("Echo from {reporter} does not cover the participant set");
            return Err(MessageError::MalformedContent(reporter));
        }

        let digests = echo.digests.into_iter().map(|(_, digest)| digest).collect();
        let _ = self.reports.insert(reporter, digests);
        Ok(())
    }

    /// Other participants whose echo has not arrived.
    pub(crate) fn missing_reports(&self, session: &SessionIdentity) -> Vec<ParticipantIdentifier> {
        session
            .other_ids()
            .filter(|pid| !self.reports.contains_key(pid))
            .collect()
    }

    /// Whether our echo went out and every other participant echoed.
    pub(crate) fn is_complete(&self, session: &SessionIdentity) -> bool {
        self.echo_sent && self.missing_reports(session).is_empty()
    }

    /// The first sender, in session order, whose payload was not seen
    /// identically by everyone.
    pub(crate) fn find_equivocation(&self, session: &SessionIdentity) -> Option<ParticipantIdentifier> {
        for (index, sender) in session.participant_ids().iter().enumerate() {
            let ours = self.observed.get(sender)?;
            for (reporter, report) in &self.reports {
                if report.get(index) != Some(ours) {
                    error!(
                        "Participant {reporter} saw a different round {} broadcast from {sender}",
                        self.round
                    );
                    return Some(*sender);
                }
            }
        }
        None
    }
}
