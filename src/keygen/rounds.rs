// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    curve::{eval_private, eval_public, CurvePoint},
    errors::{AbortReason, Result},
    keygen::{
        keygen_commit::{KeygenCommit, KeygenDecommit},
        KeySharePrivate, KeySharePublic, Output,
    },
    pool::WorkerPool,
    protocol::ParticipantIdentifier,
    round::{Outgoing, Round, RoundKind, RoundNumber, Transition},
    session::SessionIdentity,
    utils::xor_256_bits,
};
use k256::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug};
use tracing::{error, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Everything a party samples up front, carried through all three rounds.
pub(super) struct Setup {
    coefficients: Zeroizing<Vec<Scalar>>,
    decommit: KeygenDecommit,
    prior: Option<Output>,
}

impl Setup {
    pub(super) fn new<R: RngCore + CryptoRng>(
        session: &SessionIdentity,
        coefficients: Vec<Scalar>,
        prior: Option<Output>,
        rng: &mut R,
    ) -> Self {
        let coeff_publics = coefficients
            .iter()
            .map(CurvePoint::scale_generator)
            .collect();
        let decommit = KeygenDecommit::new(rng, session.hash(), session.self_id(), coeff_publics);
        Self {
            coefficients: Zeroizing::new(coefficients),
            decommit,
            prior,
        }
    }
}

/// A point-to-point share of the sender's polynomial.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct ShareDelivery {
    share: Scalar,
}

impl ShareDelivery {
    pub(super) fn new(share: Scalar) -> Self {
        Self { share }
    }
}

impl Debug for ShareDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShareDelivery([redacted])")
    }
}

/// Round 1: commit to the polynomial commitments and randomness.
pub(super) struct CommitRound {
    pub(super) setup: Setup,
}

impl Round for CommitRound {
    type Output = Output;
    type Content = KeygenCommit;

    fn number(&self) -> RoundNumber {
        1
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Broadcast
    }

    fn produce_initial_messages(
        &mut self,
        _session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<KeygenCommit>>> {
        Ok(vec![Outgoing::to_all(self.setup.decommit.commit()?)])
    }

    fn finalize(
        self,
        _session: &SessionIdentity,
        _pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, KeygenCommit>,
    ) -> Result<Transition<Output>> {
        Ok(Transition::next_round(DecommitRound {
            setup: self.setup,
            commitments: received,
        }))
    }
}

/// Round 2: open the commitment.
struct DecommitRound {
    setup: Setup,
    commitments: BTreeMap<ParticipantIdentifier, KeygenCommit>,
}

impl Round for DecommitRound {
    type Output = Output;
    type Content = KeygenDecommit;

    fn number(&self) -> RoundNumber {
        2
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Broadcast
    }

    fn produce_initial_messages(
        &mut self,
        _session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<KeygenDecommit>>> {
        Ok(vec![Outgoing::to_all(self.setup.decommit.clone())])
    }

    fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, KeygenDecommit>,
    ) -> Result<Transition<Output>> {
        let refresh = self.setup.prior.is_some();
        let checks = received.iter().collect::<Vec<_>>();
        let verdict = pool.check_all(checks, |(pid, decommit)| {
            let Some(com) = self.commitments.get(pid) else {
                return Err(*pid);
            };
            decommit
                .verify(session.hash(), *pid, com, session.threshold(), refresh)
                .map_err(|_| *pid)
        });
        if let Err(culprit) = verdict {
            return Ok(Transition::abort(culprit, AbortReason::InconsistentValue));
        }

        let mut decommits = received;
        let _ = decommits.insert(session.self_id(), self.setup.decommit.clone());
        Ok(Transition::next_round(ShareRound {
            setup: self.setup,
            decommits,
        }))
    }
}

/// Round 3: deal shares of our polynomial and check the ones dealt to us.
struct ShareRound {
    setup: Setup,
    decommits: BTreeMap<ParticipantIdentifier, KeygenDecommit>,
}

impl Round for ShareRound {
    type Output = Output;
    type Content = ShareDelivery;

    fn number(&self) -> RoundNumber {
        3
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Direct
    }

    fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<ShareDelivery>>> {
        Ok(session
            .other_ids()
            .map(|pid| Outgoing::to(pid, ShareDelivery::new(eval_private(&self.setup.coefficients, pid))))
            .collect())
    }

    fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, ShareDelivery>,
    ) -> Result<Transition<Output>> {
        let self_id = session.self_id();
        let checks = received.iter().collect::<Vec<_>>();
        let verdict = pool.check_all(checks, |(pid, delivery)| {
            let Some(decommit) = self.decommits.get(pid) else {
                return Err(*pid);
            };
            if CurvePoint::scale_generator(&delivery.share) != eval_public(&decommit.coeff_publics, self_id) {
                error!("Share from {pid} does not match its Feldman commitments");
                return Err(*pid);
            }
            Ok(())
        });
        if let Err(culprit) = verdict {
            return Ok(Transition::abort(culprit, AbortReason::InvalidProof));
        }

        let mut private = Zeroizing::new(
            received
                .values()
                .fold(eval_private(&self.setup.coefficients, self_id), |sum, delivery| {
                    sum + delivery.share
                }),
        );
        let mut coeffs = vec![CurvePoint::IDENTITY; session.threshold() + 1];
        let mut rid = [0u8; 32];
        for decommit in self.decommits.values() {
            for (sum, coeff) in coeffs.iter_mut().zip(&decommit.coeff_publics) {
                *sum = *sum + *coeff;
            }
            rid = xor_256_bits(&rid, &decommit.rid);
        }

        if let Some(prior) = &self.setup.prior {
            *private += prior.private_key_share().as_scalar();
            for (sum, coeff) in coeffs.iter_mut().zip(prior.public_coeffs()) {
                *sum = *sum + *coeff;
            }
        }

        let public_key_shares = session
            .participant_ids()
            .iter()
            .map(|pid| KeySharePublic::new(*pid, eval_public(&coeffs, *pid)))
            .collect();
        let output = Output::from_parts(
            coeffs,
            public_key_shares,
            self_id,
            KeySharePrivate::new(*private),
            rid,
        )?;
        info!(
            "{} produced shares of a key held by {} participants",
            session.protocol_name(),
            session.participant_ids().len()
        );
        Ok(Transition::Finished(output))
    }
}
