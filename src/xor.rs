// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A one-round protocol in which every participant contributes 32 random
//! bytes and everyone outputs the XOR of all contributions.
//!
//! It is not secure against a rushing adversary, who can pick its
//! contribution last. It exists to exercise the engine.

use crate::{
    errors::Result,
    pool::WorkerPool,
    protocol::ParticipantIdentifier,
    round::{BoxedRound, Outgoing, Round, RoundKind, RoundNumber, Transition},
    session::SessionIdentity,
    utils::xor_256_bits,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name to use for sessions of this protocol.
pub const PROTOCOL_NAME: &str = "xor";

#[derive(Debug, Serialize, Deserialize)]
struct Contribution([u8; 32]);

struct XorRound {
    contribution: [u8; 32],
}

impl Round for XorRound {
    type Output = [u8; 32];
    type Content = Contribution;

    fn number(&self) -> RoundNumber {
        1
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Direct
    }

    fn produce_initial_messages(
        &mut self,
        _session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<Contribution>>> {
        Ok(vec![Outgoing::to_all(Contribution(self.contribution))])
    }

    fn finalize(
        self,
        _session: &SessionIdentity,
        _pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, Contribution>,
    ) -> Result<Transition<[u8; 32]>> {
        let output = received
            .values()
            .fold(self.contribution, |acc, contribution| {
                xor_256_bits(&acc, &contribution.0)
            });
        Ok(Transition::Finished(output))
    }
}

/// The first (and only) round, with a fresh contribution drawn from `rng`.
pub fn first_round<R: RngCore + CryptoRng>(rng: &mut R) -> BoxedRound<[u8; 32]> {
    let mut contribution = [0u8; 32];
    rng.fill_bytes(&mut contribution);
    BoxedRound::new(XorRound { contribution })
}
