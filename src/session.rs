// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The identity of one protocol run.
//!
//! A [`SessionIdentity`] binds the protocol name, the ordered participant
//! list, the threshold, and caller-supplied auxiliary data into a
//! [`SessionHash`]. Every message carries the hash of the session it belongs
//! to, and handlers drop anything that does not match their own.

use crate::{errors::ConfigurationError, protocol::ParticipantIdentifier};
use itertools::Itertools;
use merlin::Transcript;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::error;

/// Digest identifying a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHash([u8; 32]);

impl SessionHash {
    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for SessionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHash(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Immutable description of a protocol run from one party's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    protocol_name: String,
    participant_ids: Vec<ParticipantIdentifier>,
    self_id: ParticipantIdentifier,
    threshold: usize,
    aux_info_hash: [u8; 32],
    hash: SessionHash,
}

impl SessionIdentity {
    /// Describe a session.
    ///
    /// `participant_ids` must be given in the same order by every party; the
    /// order is part of the session hash. `threshold` is the number of
    /// corrupt parties tolerated, so at least `threshold + 1` participants are
    /// required.
    pub fn new(
        protocol_name: impl Into<String>,
        participant_ids: Vec<ParticipantIdentifier>,
        self_id: ParticipantIdentifier,
        threshold: usize,
        auxiliary_data: &[u8],
    ) -> Result<Self, ConfigurationError> {
        if participant_ids.is_empty() {
            error!("Tried to create a session without participants");
            return Err(ConfigurationError::EmptyParticipantSet);
        }
        if let Some(duplicate) = participant_ids.iter().duplicates().next() {
            error!("Participant {duplicate} appears twice in the session");
            return Err(ConfigurationError::DuplicateParticipant(*duplicate));
        }
        if !participant_ids.contains(&self_id) {
            error!("Local participant {self_id} is not part of the session");
            return Err(ConfigurationError::SelfNotParticipant(self_id));
        }
        if threshold >= participant_ids.len() {
            error!(
                "Threshold {threshold} needs more than {} participants",
                participant_ids.len()
            );
            return Err(ConfigurationError::ThresholdOutOfRange {
                threshold,
                participants: participant_ids.len(),
            });
        }

        let protocol_name = protocol_name.into();
        let aux_info_hash = hash_aux_info(auxiliary_data);
        let hash = session_hash(&protocol_name, &participant_ids, threshold, &aux_info_hash);
        Ok(Self {
            protocol_name,
            participant_ids,
            self_id,
            threshold,
            aux_info_hash,
            hash,
        })
    }

    /// Name of the protocol this session runs.
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// All participants, in session order.
    pub fn participant_ids(&self) -> &[ParticipantIdentifier] {
        &self.participant_ids
    }

    /// The local participant.
    pub fn self_id(&self) -> ParticipantIdentifier {
        self.self_id
    }

    /// Every participant except the local one, in session order.
    pub fn other_ids(&self) -> impl Iterator<Item = ParticipantIdentifier> + '_ {
        self.participant_ids
            .iter()
            .copied()
            .filter(move |pid| *pid != self.self_id)
    }

    /// Maximum number of corrupt parties tolerated.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Digest of the auxiliary data the session was created with.
    pub fn aux_info_hash(&self) -> &[u8; 32] {
        &self.aux_info_hash
    }

    /// The session hash embedded in every message of this session.
    pub fn hash(&self) -> SessionHash {
        self.hash
    }

    /// Whether `pid` takes part in this session.
    pub fn contains(&self, pid: &ParticipantIdentifier) -> bool {
        self.participant_ids.contains(pid)
    }
}

fn hash_aux_info(auxiliary_data: &[u8]) -> [u8; 32] {
    let mut transcript = Transcript::new(b"tss-engine aux info");
    transcript.append_message(b"aux", auxiliary_data);
    let mut hash = [0u8; 32];
    transcript.challenge_bytes(b"aux info hash", &mut hash);
    hash
}

// The local participant is left out on purpose: every party of a session must
// arrive at the same hash.
fn session_hash(
    protocol_name: &str,
    participant_ids: &[ParticipantIdentifier],
    threshold: usize,
    aux_info_hash: &[u8; 32],
) -> SessionHash {
    let mut transcript = Transcript::new(b"tss-engine session");
    transcript.append_message(b"protocol", protocol_name.as_bytes());
    transcript.append_u64(b"participant count", participant_ids.len() as u64);
    for pid in participant_ids {
        transcript.append_message(b"participant", &pid.to_bytes());
    }
    transcript.append_u64(b"threshold", threshold as u64);
    transcript.append_message(b"aux info hash", aux_info_hash);
    let mut hash = [0u8; 32];
    transcript.challenge_bytes(b"session hash", &mut hash);
    SessionHash(hash)
}
