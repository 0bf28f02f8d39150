// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    curve::{eval_public, CurvePoint},
    errors::{CallerError, InternalError, Result},
    keygen::{KeySharePrivate, KeySharePublic},
    protocol::ParticipantIdentifier,
};
use std::collections::HashSet;
use tracing::error;

/// Output of key generation or key refresh: the public material shared by
/// every participant, and this participant's private share.
#[derive(Debug, Clone)]
pub struct Output {
    // Feldman commitments to the coefficients of the shared polynomial.
    public_coeffs: Vec<CurvePoint>,
    // Public key share of each participant, in session order.
    public_key_shares: Vec<KeySharePublic>,
    private_key_share: KeySharePrivate,
    // Randomness contributed by all parties.
    rid: [u8; 32],
}

impl Output {
    /// The shared public key.
    pub fn public_key(&self) -> CurvePoint {
        // `from_parts` guarantees at least one coefficient.
        self.public_coeffs
            .first()
            .copied()
            .unwrap_or(CurvePoint::IDENTITY)
    }

    /// Number of corrupt parties tolerated. Any `threshold + 1` shares
    /// determine the key.
    pub fn threshold(&self) -> usize {
        self.public_coeffs.len() - 1
    }

    /// Commitments to the coefficients of the shared polynomial.
    pub fn public_coeffs(&self) -> &[CurvePoint] {
        &self.public_coeffs
    }

    /// Get the individual shares of the public key.
    pub fn public_key_shares(&self) -> &[KeySharePublic] {
        &self.public_key_shares
    }

    /// The public key share of `pid`, if it holds one.
    pub fn public_key_share(&self, pid: ParticipantIdentifier) -> Option<&KeySharePublic> {
        self.public_key_shares
            .iter()
            .find(|share| share.participant() == pid)
    }

    /// Participants holding a share, in session order.
    pub fn participants(&self) -> Vec<ParticipantIdentifier> {
        self.public_key_shares
            .iter()
            .map(KeySharePublic::participant)
            .collect()
    }

    /// Get the private share.
    pub fn private_key_share(&self) -> &KeySharePrivate {
        &self.private_key_share
    }

    /// Get the rid.
    pub fn rid(&self) -> &[u8; 32] {
        &self.rid
    }

    /// Create a new `Output` from its constituent parts.
    ///
    /// The public key shares must come from distinct participants, there must
    /// be more of them than the polynomial has coefficients minus one, and
    /// each must be the evaluation of `public_coeffs` at its participant.
    /// `owner`'s public share must match `private_key_share`.
    pub fn from_parts(
        public_coeffs: Vec<CurvePoint>,
        public_key_shares: Vec<KeySharePublic>,
        owner: ParticipantIdentifier,
        private_key_share: KeySharePrivate,
        rid: [u8; 32],
    ) -> Result<Self> {
        if public_coeffs.is_empty() {
            error!("Tried to create a keygen output without a polynomial");
            Err(CallerError::BadInput)?
        }
        let pids = public_key_shares
            .iter()
            .map(KeySharePublic::participant)
            .collect::<HashSet<_>>();
        if pids.len() != public_key_shares.len() {
            error!("Tried to create a keygen output using a set of public material from non-unique participants");
            Err(CallerError::BadInput)?
        }
        if pids.len() < public_coeffs.len() {
            error!("Not enough participants to support the given polynomial");
            Err(CallerError::BadInput)?
        }
        if public_key_shares
            .iter()
            .any(|share| *share.as_ref() != eval_public(&public_coeffs, share.participant()))
        {
            error!("Public key shares do not lie on the committed polynomial");
            Err(CallerError::BadInput)?
        }

        let own = public_key_shares
            .iter()
            .find(|share| share.participant() == owner)
            .ok_or_else(|| {
                error!("Owner {owner} does not hold a public key share");
                InternalError::from(CallerError::BadInput)
            })?;
        if *own.as_ref() != private_key_share.public_point() {
            error!("Private key share does not match its public key share");
            Err(InternalError::InternalInvariantFailed)?
        }

        Ok(Self {
            public_coeffs,
            public_key_shares,
            private_key_share,
            rid,
        })
    }
}
