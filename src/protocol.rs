// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Participant and session identifiers.

use crate::errors::{CallerError, ConfigurationError, InternalError, Result};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt::Display};
use tracing::error;

/// Identifies a participant across every session it takes part in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantIdentifier(u128);

impl ParticipantIdentifier {
    /// Sample a fresh identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// Wrap an externally assigned identifier.
    pub fn from_u128(id: u128) -> Self {
        Self(id)
    }

    /// The identifier as an integer.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The low bytes are plenty to tell participants apart in logs.
        write!(f, "ParticipantId({:08x})", self.0 as u32)
    }
}

/// A nonce shared by the parties of one protocol run.
///
/// The calling application agrees on a fresh `Identifier` for every run and
/// passes it as auxiliary data when building the
/// [`SessionIdentity`](crate::SessionIdentity).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(u128);

impl Identifier {
    /// Sample a fresh identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// The identifier as bytes, for use as session auxiliary data.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({:08x})", self.0 as u32)
    }
}

/// The local participant's view of who takes part in a protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantConfig {
    id: ParticipantIdentifier,
    other_ids: Vec<ParticipantIdentifier>,
}

impl ParticipantConfig {
    /// Build a config, checking that no identifier repeats.
    pub fn new(id: ParticipantIdentifier, other_ids: &[ParticipantIdentifier]) -> Result<Self> {
        let mut seen = HashSet::from([id]);
        if let Some(duplicate) = other_ids.iter().find(|pid| !seen.insert(**pid)) {
            error!("Participant config contains duplicate identifiers");
            Err(ConfigurationError::DuplicateParticipant(*duplicate))?
        }
        Ok(Self {
            id,
            other_ids: other_ids.to_vec(),
        })
    }

    /// A random config with `size` participants.
    pub fn random<R: RngCore + CryptoRng>(size: usize, rng: &mut R) -> Self {
        let id = ParticipantIdentifier::random(rng);
        let other_ids = std::iter::repeat_with(|| ParticipantIdentifier::random(rng))
            .take(size.saturating_sub(1))
            .collect();
        Self { id, other_ids }
    }

    /// One config per member of a fresh random quorum of `size` participants.
    pub fn random_quorum<R: RngCore + CryptoRng>(size: usize, rng: &mut R) -> Result<Vec<Self>> {
        if size == 0 {
            error!("Cannot build an empty quorum");
            Err(CallerError::BadInput)?
        }
        let ids = std::iter::repeat_with(|| ParticipantIdentifier::random(rng))
            .take(size)
            .collect::<Vec<_>>();
        ids.iter()
            .map(|id| {
                let others = ids.iter().filter(|pid| *pid != id).copied().collect::<Vec<_>>();
                Self::new(*id, &others)
            })
            .collect()
    }

    /// Restrict the config to `participants`, which must include us.
    pub fn filter_participants(&self, participants: &[ParticipantIdentifier]) -> Result<Self> {
        if !participants.contains(&self.id) {
            error!("Filtered participant set does not include the local party");
            Err(InternalError::from(ConfigurationError::SelfNotParticipant(self.id)))?
        }
        let others = participants
            .iter()
            .filter(|pid| **pid != self.id)
            .copied()
            .collect::<Vec<_>>();
        Self::new(self.id, &others)
    }

    /// The local participant.
    pub fn id(&self) -> ParticipantIdentifier {
        self.id
    }

    /// Every other participant.
    pub fn other_ids(&self) -> &[ParticipantIdentifier] {
        &self.other_ids
    }

    /// Total number of participants.
    pub fn count(&self) -> usize {
        self.other_ids.len() + 1
    }

    /// All participants, sorted. Every party derives the same order from
    /// this.
    pub fn all_participants(&self) -> Vec<ParticipantIdentifier> {
        let mut all = self.other_ids.clone();
        all.push(self.id);
        all.sort();
        all
    }
}
