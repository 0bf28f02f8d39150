// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    curve::{lagrange_coefficient_at_zero, CurvePoint},
    errors::{AbortReason, InternalError, Result},
    keygen::Output,
    pool::WorkerPool,
    protocol::ParticipantIdentifier,
    round::{BoxedRound, Outgoing, Round, RoundKind, RoundNumber, Transition},
    session::{SessionHash, SessionIdentity},
    sign::{
        presign::Presignature,
        share::{challenge, Signature, SignatureShare},
        Input, PresignInput,
    },
};
use k256::{elliptic_curve::Field, Scalar};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct NonceCommit {
    hash: [u8; 32],
}

impl NonceCommit {
    fn new(sid: SessionHash, sender: ParticipantIdentifier, nonce: &CurvePoint) -> Self {
        let mut transcript = Transcript::new(b"SchnorrR1");
        transcript.append_message(b"sid", sid.as_bytes());
        transcript.append_message(b"sender", &sender.to_bytes());
        transcript.append_message(b"R", &nonce.to_bytes());
        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"hashing r1", &mut hash);
        Self { hash }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(super) struct NonceReveal(CurvePoint);

/// What a signer does once the nonce points of every signer are known.
pub(super) trait AfterNonces: Send + 'static {
    type Output: Send + 'static;

    /// `nonce_points` holds the nonce point of every signer, ours included.
    fn complete(
        self,
        session: &SessionIdentity,
        nonce: Zeroizing<Scalar>,
        nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    ) -> Result<Transition<Self::Output>>;
}

impl AfterNonces for Input {
    type Output = Signature;

    fn complete(
        self,
        session: &SessionIdentity,
        nonce: Zeroizing<Scalar>,
        nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    ) -> Result<Transition<Signature>> {
        let share = ShareRound::new(3, session, self.key, self.message, &nonce, nonce_points)?;
        Ok(Transition::next_round(share))
    }
}

impl AfterNonces for PresignInput {
    type Output = Presignature;

    fn complete(
        self,
        session: &SessionIdentity,
        nonce: Zeroizing<Scalar>,
        nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    ) -> Result<Transition<Presignature>> {
        info!("Presigned with {} participants", nonce_points.len());
        Ok(Transition::Finished(Presignature::new(
            session,
            self.key,
            nonce,
            nonce_points,
        )))
    }
}

/// The signer's secret nonce and what happens after the nonce rounds.
struct Setup<F> {
    next: F,
    nonce: Zeroizing<Scalar>,
    nonce_point: CurvePoint,
}

/// The first round of signing or presigning, with a fresh nonce drawn from
/// `rng`.
pub(super) fn first_round<F: AfterNonces, R: RngCore + CryptoRng>(
    next: F,
    rng: &mut R,
) -> BoxedRound<F::Output> {
    let nonce = Zeroizing::new(Scalar::random(rng));
    let nonce_point = CurvePoint::scale_generator(&nonce);
    BoxedRound::new(NonceCommitRound {
        setup: Setup {
            next,
            nonce,
            nonce_point,
        },
    })
}

/// The single round of online signing with a presignature.
pub(super) fn online_round(
    session: &SessionIdentity,
    presignature: Presignature,
    message: &[u8],
) -> Result<BoxedRound<Signature>> {
    let (key, nonce, nonce_points) = presignature.into_parts();
    let share = ShareRound::new(1, session, key, message.to_vec(), &nonce, nonce_points)?;
    Ok(BoxedRound::new(share))
}

/// Round 1: commit to the nonce point.
struct NonceCommitRound<F> {
    setup: Setup<F>,
}

impl<F: AfterNonces> Round for NonceCommitRound<F> {
    type Output = F::Output;
    type Content = NonceCommit;

    fn number(&self) -> RoundNumber {
        1
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Broadcast
    }

    fn produce_initial_messages(
        &mut self,
        session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<NonceCommit>>> {
        let commit = NonceCommit::new(session.hash(), session.self_id(), &self.setup.nonce_point);
        Ok(vec![Outgoing::to_all(commit)])
    }

    fn finalize(
        self,
        _session: &SessionIdentity,
        _pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, NonceCommit>,
    ) -> Result<Transition<F::Output>> {
        Ok(Transition::next_round(NonceRevealRound {
            setup: self.setup,
            commitments: received,
        }))
    }
}

/// Round 2: reveal the nonce point and check everyone's against their
/// commitment.
struct NonceRevealRound<F> {
    setup: Setup<F>,
    commitments: BTreeMap<ParticipantIdentifier, NonceCommit>,
}

impl<F: AfterNonces> Round for NonceRevealRound<F> {
    type Output = F::Output;
    type Content = NonceReveal;

    fn number(&self) -> RoundNumber {
        2
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Broadcast
    }

    fn produce_initial_messages(
        &mut self,
        _session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<NonceReveal>>> {
        Ok(vec![Outgoing::to_all(NonceReveal(self.setup.nonce_point))])
    }

    fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, NonceReveal>,
    ) -> Result<Transition<F::Output>> {
        let checks = received.iter().collect::<Vec<_>>();
        let verdict = pool.check_all(checks, |(pid, reveal)| {
            match self.commitments.get(pid) {
                Some(com) if *com == NonceCommit::new(session.hash(), *pid, &reveal.0) => Ok(()),
                _ => {
                    error!("Nonce from {pid} does not match its commitment");
                    Err(*pid)
                }
            }
        });
        if let Err(culprit) = verdict {
            return Ok(Transition::abort(culprit, AbortReason::InconsistentValue));
        }

        let mut nonce_points = received
            .into_iter()
            .map(|(pid, reveal)| (pid, reveal.0))
            .collect::<BTreeMap<_, _>>();
        let _ = nonce_points.insert(session.self_id(), self.setup.nonce_point);
        self.setup.next.complete(session, self.setup.nonce, nonce_points)
    }
}

/// Publish our signature share and combine everyone's.
struct ShareRound {
    number: RoundNumber,
    key: Output,
    message: Vec<u8>,
    nonce_point: CurvePoint,
    nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    challenge: Scalar,
    share: SignatureShare,
}

impl ShareRound {
    /// Compute our share `z = k + e·λ·x` of the signature on `message`.
    fn new(
        number: RoundNumber,
        session: &SessionIdentity,
        key: Output,
        message: Vec<u8>,
        nonce: &Scalar,
        nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    ) -> Result<Self> {
        let nonce_point = nonce_points.values().copied().sum::<CurvePoint>();
        let e = challenge(&nonce_point, &key.public_key(), &message);
        let lambda = lagrange_coefficient_at_zero(session.self_id(), session.participant_ids())?;
        let z = *nonce + e * lambda * key.private_key_share().as_scalar();
        Ok(Self {
            number,
            key,
            message,
            nonce_point,
            nonce_points,
            challenge: e,
            share: SignatureShare(z),
        })
    }
}

impl Round for ShareRound {
    type Output = Signature;
    type Content = SignatureShare;

    fn number(&self) -> RoundNumber {
        self.number
    }

    fn kind(&self) -> RoundKind {
        RoundKind::Broadcast
    }

    fn produce_initial_messages(
        &mut self,
        _session: &SessionIdentity,
    ) -> Result<Vec<Outgoing<SignatureShare>>> {
        Ok(vec![Outgoing::to_all(self.share)])
    }

    fn finalize(
        self,
        session: &SessionIdentity,
        pool: &WorkerPool,
        received: BTreeMap<ParticipantIdentifier, SignatureShare>,
    ) -> Result<Transition<Signature>> {
        let signers = session.participant_ids();
        let key = &self.key;
        let checks = received
            .iter()
            .map(|(pid, share)| Ok((*pid, *share, lagrange_coefficient_at_zero(*pid, signers)?)))
            .collect::<Result<Vec<_>>>()?;
        let verdict = pool.check_all(checks, |(pid, share, lambda)| {
            let (Some(nonce), Some(public_share)) = (self.nonce_points.get(&pid), key.public_key_share(pid)) else {
                return Err(pid);
            };
            let expected = *nonce + public_share.as_ref().multiply_by_scalar(&(self.challenge * lambda));
            if CurvePoint::scale_generator(&share.0) != expected {
                error!("Signature share from {pid} does not verify");
                return Err(pid);
            }
            Ok(())
        });
        if let Err(culprit) = verdict {
            return Ok(Transition::abort(culprit, AbortReason::InvalidProof));
        }

        let z = received
            .values()
            .fold(self.share.0, |sum, share| sum + share.0);
        let signature = Signature::new(self.nonce_point, z);
        if !signature.verify(&key.public_key(), &self.message) {
            error!("Combined signature does not verify although every share did");
            return Err(InternalError::InternalInvariantFailed);
        }
        info!("Signed with {} participants", signers.len());
        Ok(Transition::Finished(signature))
    }
}
