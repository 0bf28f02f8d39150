// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Threshold key generation and proactive key refresh.[^cite]
//!
//! Produces a secp256k1 public key whose private key is Shamir-shared among
//! the session participants, so that any `threshold + 1` of them can use it.
//!
//! # High-level protocol description
//! Both protocols run in three rounds:
//! - In the first round, each participant samples a random polynomial of
//!   degree `threshold` and broadcasts a commitment to (1) the Feldman
//!   commitments to its coefficients and (2) a random contribution `rid`.
//! - In the second round, each participant opens its commitment. Once all
//!   openings have been received, each participant checks them against the
//!   commitments.
//! - In the third round, each participant sends every other participant the
//!   evaluation of its polynomial at that participant's point. The receiver
//!   checks the evaluation against the sender's Feldman commitments and sums
//!   up everything it received into its share.
//!
//! A refresh works the same way, except that each polynomial has a zero
//! constant term: the shares change but the key does not.
//!
//! # 🔒 Transport requirements
//! Third-round messages carry private shares and must be sent over a
//! confidential channel.
//!
//! [^cite]: Paul Feldman. A Practical Scheme for Non-interactive Verifiable
//! Secret Sharing. FOCS 1987.

mod keygen_commit;
mod keyshare;
mod output;
mod rounds;

pub use keyshare::{KeySharePrivate, KeySharePublic};
pub use output::Output;

use crate::{
    errors::{CallerError, Result},
    round::BoxedRound,
    session::SessionIdentity,
};
use k256::{elliptic_curve::Field, Scalar};
use rand::{CryptoRng, RngCore};
use rounds::{CommitRound, Setup};
use tracing::error;

/// Name to use for key generation sessions.
pub const KEYGEN_PROTOCOL_NAME: &str = "keygen";
/// Name to use for key refresh sessions.
pub const REFRESH_PROTOCOL_NAME: &str = "key-refresh";

/// First round of a key generation run for `session`.
///
/// The degree of the shared polynomial is the session threshold.
pub fn keygen<R: RngCore + CryptoRng>(session: &SessionIdentity, rng: &mut R) -> BoxedRound<Output> {
    let coefficients = (0..=session.threshold())
        .map(|_| Scalar::random(&mut *rng))
        .collect();
    BoxedRound::new(CommitRound {
        setup: Setup::new(session, coefficients, None, rng),
    })
}

/// First round of a refresh of `prior`.
///
/// `session` must have the same participants and threshold as the run that
/// produced `prior`.
pub fn refresh<R: RngCore + CryptoRng>(
    session: &SessionIdentity,
    prior: &Output,
    rng: &mut R,
) -> Result<BoxedRound<Output>> {
    if prior.participants() != session.participant_ids() || prior.threshold() != session.threshold() {
        error!("A refresh must keep the participants and threshold of the key");
        Err(CallerError::BadInput)?
    }
    let coefficients = std::iter::once(Scalar::ZERO)
        .chain((0..session.threshold()).map(|_| Scalar::random(&mut *rng)))
        .collect();
    Ok(BoxedRound::new(CommitRound {
        setup: Setup::new(session, coefficients, Some(prior.clone()), rng),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        curve::{lagrange_coefficient_at_zero, CurvePoint},
        errors::{AbortReason, InternalError, ProtocolError},
        handler::{Handler, Status},
        pool::WorkerPool,
        protocol::ParticipantIdentifier,
        utils::testing::{init_testing, quorum_sessions, Network},
        Abort,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rounds::ShareDelivery;

    fn keygen_network(sessions: &[SessionIdentity], pool: &WorkerPool, rng: &mut StdRng) -> Network<Output> {
        Network::new(
            sessions
                .iter()
                .map(|session| Handler::new(session.clone(), pool.clone(), keygen(session, rng)).unwrap())
                .collect(),
        )
    }

    /// Interpolate the secret from the outputs of `quorum`, given in the same
    /// order.
    fn reconstruct(holders: &[Output], quorum: &[ParticipantIdentifier]) -> Scalar {
        holders
            .iter()
            .zip(quorum)
            .fold(Scalar::ZERO, |acc, (output, pid)| {
                acc + *output.private_key_share().as_scalar()
                    * lagrange_coefficient_at_zero(*pid, quorum).unwrap()
            })
    }

    fn check_outputs(outputs: &[Output], sessions: &[SessionIdentity]) {
        let first = &outputs[0];
        for (output, session) in outputs.iter().zip(sessions) {
            assert_eq!(output.public_key(), first.public_key());
            assert_eq!(output.public_key_shares(), first.public_key_shares());
            assert_eq!(output.rid(), first.rid());
            assert_eq!(output.threshold(), session.threshold());
            assert_eq!(
                output.private_key_share().public_point(),
                *output.public_key_share(session.self_id()).unwrap().as_ref()
            );
        }
    }

    #[test]
    fn keygen_produces_a_shared_key() {
        let mut rng = init_testing();
        let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 5, 2, &[], &mut rng);
        let pool = WorkerPool::new(2).unwrap();
        let outputs = keygen_network(&sessions, &pool, &mut rng)
            .shuffled(StdRng::seed_from_u64(rng.gen()))
            .run_to_completion()
            .into_outputs();
        check_outputs(&outputs, &sessions);

        // Any three shares recover the same key.
        let pids = sessions[0].participant_ids();
        for quorum in [&pids[..3], &pids[2..], &pids[1..4]] {
            let holders = outputs
                .iter()
                .zip(&sessions)
                .filter(|(_, session)| quorum.contains(&session.self_id()))
                .map(|(output, _)| output.clone())
                .collect::<Vec<_>>();
            let secret = reconstruct(&holders, quorum);
            assert_eq!(CurvePoint::scale_generator(&secret), outputs[0].public_key());
        }
    }

    #[test]
    fn outputs_do_not_depend_on_pool_size() {
        let mut rng = init_testing();
        let seed: u64 = rng.gen();
        let results = [1, 2, 4]
            .into_iter()
            .map(|size| {
                let mut rng = StdRng::seed_from_u64(seed);
                let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 4, 1, &[], &mut rng);
                let pool = WorkerPool::new(size).unwrap();
                keygen_network(&sessions, &pool, &mut rng)
                    .run_to_completion()
                    .into_outputs()
            })
            .collect::<Vec<_>>();

        for outputs in &results[1..] {
            for (output, expected) in outputs.iter().zip(&results[0]) {
                assert_eq!(output.public_key(), expected.public_key());
                assert_eq!(output.private_key_share(), expected.private_key_share());
                assert_eq!(output.rid(), expected.rid());
            }
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let seed: u64 = init_testing().gen();
        let run = || {
            let mut rng = StdRng::seed_from_u64(seed);
            let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 3, 1, &[], &mut rng);
            let pool = WorkerPool::new(2).unwrap();
            let network = keygen_network(&sessions, &pool, &mut rng)
                .shuffled(StdRng::seed_from_u64(seed))
                .run_to_completion();
            let delivered = network.delivered();
            (network.into_outputs(), delivered)
        };

        let (first, first_delivered) = run();
        let (second, second_delivered) = run();
        assert_eq!(first_delivered, second_delivered);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.public_coeffs(), b.public_coeffs());
            assert_eq!(a.public_key_shares(), b.public_key_shares());
            assert_eq!(a.private_key_share(), b.private_key_share());
            assert_eq!(a.rid(), b.rid());
        }
    }

    #[test]
    fn refresh_changes_shares_but_not_the_key() {
        let mut rng = init_testing();
        let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 4, 1, &[], &mut rng);
        let pool = WorkerPool::new(2).unwrap();
        let before = keygen_network(&sessions, &pool, &mut rng)
            .run_to_completion()
            .into_outputs();

        let pids = sessions[0].participant_ids().to_vec();
        let refresh_sessions = pids
            .iter()
            .map(|pid| SessionIdentity::new(REFRESH_PROTOCOL_NAME, pids.clone(), *pid, 1, b"epoch 1").unwrap())
            .collect::<Vec<_>>();
        let handlers = refresh_sessions
            .iter()
            .zip(&before)
            .map(|(session, prior)| {
                let first = refresh(session, prior, &mut rng).unwrap();
                Handler::new(session.clone(), pool.clone(), first).unwrap()
            })
            .collect();
        let after = Network::new(handlers)
            .shuffled(StdRng::seed_from_u64(rng.gen()))
            .run_to_completion()
            .into_outputs();

        check_outputs(&after, &refresh_sessions);
        assert_eq!(after[0].public_key(), before[0].public_key());
        for (old, new) in before.iter().zip(&after) {
            assert_ne!(old.private_key_share(), new.private_key_share());
        }
        let quorum = &pids[1..3];
        let secret = reconstruct(&after[1..3], quorum);
        assert_eq!(CurvePoint::scale_generator(&secret), before[0].public_key());
    }

    #[test]
    fn refresh_requires_the_same_participants() {
        let mut rng = init_testing();
        let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 3, 1, &[], &mut rng);
        let pool = WorkerPool::new(1).unwrap();
        let outputs = keygen_network(&sessions, &pool, &mut rng)
            .run_to_completion()
            .into_outputs();

        let pids = sessions[0].participant_ids().to_vec();
        let smaller = SessionIdentity::new(REFRESH_PROTOCOL_NAME, pids[..2].to_vec(), pids[0], 1, &[]).unwrap();
        assert_eq!(
            refresh(&smaller, &outputs[0], &mut rng).unwrap_err(),
            InternalError::CallingApplicationMistake(CallerError::BadInput)
        );
        let lower = SessionIdentity::new(REFRESH_PROTOCOL_NAME, pids.clone(), pids[0], 0, &[]).unwrap();
        assert!(refresh(&lower, &outputs[0], &mut rng).is_err());
    }

    #[test]
    fn bad_share_is_blamed_on_its_dealer() {
        let mut rng = init_testing();
        let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 4, 1, &[], &mut rng);
        let pids = sessions[0].participant_ids().to_vec();
        let (victim, cheater) = (pids[1], pids[2]);
        let pool = WorkerPool::new(2).unwrap();

        let network = keygen_network(&sessions, &pool, &mut rng)
            .with_tamper(move |recipient, message| {
                if message.from() == cheater && message.round() == 3 && recipient == victim {
                    message.with_content(bincode::serialize(&ShareDelivery::new(Scalar::ONE)).unwrap())
                } else {
                    message
                }
            })
            .run_to_completion();

        assert_eq!(
            network.handler(victim).status(),
            Status::Aborted(Abort::blame(cheater, AbortReason::InvalidProof))
        );
        for pid in pids.iter().filter(|pid| **pid != victim) {
            assert_eq!(network.handler(*pid).status(), Status::Finished);
        }
    }

    #[test]
    fn polynomial_of_the_wrong_degree_aborts() {
        let mut rng = init_testing();
        let sessions = quorum_sessions(KEYGEN_PROTOCOL_NAME, 4, 1, &[], &mut rng);
        let cheater = sessions[3].self_id();
        let pool = WorkerPool::new(2).unwrap();

        let handlers = sessions
            .iter()
            .map(|session| {
                let first = if session.self_id() == cheater {
                    let coefficients = (0..session.threshold() + 2)
                        .map(|_| Scalar::random(&mut rng))
                        .collect();
                    BoxedRound::new(CommitRound {
                        setup: Setup::new(session, coefficients, None, &mut rng),
                    })
                } else {
                    keygen(session, &mut rng)
                };
                Handler::new(session.clone(), pool.clone(), first).unwrap()
            })
            .collect();
        let results = Network::new(handlers).run_to_completion().into_results();

        for (result, session) in results.into_iter().zip(&sessions) {
            if session.self_id() == cheater {
                assert_eq!(result.unwrap_err(), ProtocolError::NotFinished);
            } else {
                assert_eq!(
                    result.unwrap_err(),
                    ProtocolError::Aborted(Abort::blame(cheater, AbortReason::InconsistentValue))
                );
            }
        }
    }
}
