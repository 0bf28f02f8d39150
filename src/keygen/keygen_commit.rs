// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    curve::CurvePoint,
    errors::Result,
    protocol::ParticipantIdentifier,
    session::SessionHash,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

/// Public commitment to a [`KeygenDecommit`], broadcast in round 1.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeygenCommit {
    hash: [u8; 32],
}

/// The opening of a [`KeygenCommit`], broadcast in round 2.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct KeygenDecommit {
    ///`sid` corresponds to a unique session identifier.
    pub sid: SessionHash,
    pub sender: ParticipantIdentifier,
    pub rid: [u8; 32],
    pub u_i: [u8; 32],
    /// Feldman commitments to the sender's polynomial, constant term first.
    pub coeff_publics: Vec<CurvePoint>,
}

/// How a decommitment failed to check out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecommitError {
    Mismatch,
    WrongSession,
    WrongSender,
    WrongDegree,
    NonZeroConstant,
}

impl KeygenDecommit {
    pub(crate) fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        sid: SessionHash,
        sender: ParticipantIdentifier,
        coeff_publics: Vec<CurvePoint>,
    ) -> Self {
        let mut rid = [0u8; 32];
        let mut u_i = [0u8; 32];
        rng.fill_bytes(rid.as_mut_slice());
        rng.fill_bytes(u_i.as_mut_slice());
        Self {
            sid,
            sender,
            rid,
            u_i,
            coeff_publics,
        }
    }

    pub(crate) fn commit(&self) -> Result<KeygenCommit> {
        let mut transcript = Transcript::new(b"KeyGenR1");
        transcript.append_message(b"decom", &serialize!(&self)?);
        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"hashing r1", &mut hash);
        Ok(KeygenCommit { hash })
    }

    /// Verify this decommitment against `com` and what the round expects.
    ///
    /// In a refresh every constant term must be the identity, so the shared
    /// secret does not move.
    #[instrument(skip_all, err(Debug))]
    pub(crate) fn verify(
        &self,
        sid: SessionHash,
        sender: ParticipantIdentifier,
        com: &KeygenCommit,
        threshold: usize,
        refresh: bool,
    ) -> std::result::Result<(), DecommitError> {
        let rebuilt_com = self.commit().map_err(|_| DecommitError::Mismatch)?;
        if &rebuilt_com != com {
            error!("decommitment does not match original commitment");
            return Err(DecommitError::Mismatch);
        }
        if self.sid != sid {
            error!("Incorrect session ID");
            return Err(DecommitError::WrongSession);
        }
        if self.sender != sender {
            error!("Incorrect sender ID");
            return Err(DecommitError::WrongSender);
        }
        if self.coeff_publics.len() != threshold + 1 {
            error!(
                "Expected {} coefficients, got {}",
                threshold + 1,
                self.coeff_publics.len()
            );
            return Err(DecommitError::WrongDegree);
        }
        if refresh && self.coeff_publics.first().map_or(true, |c0| !c0.is_identity()) {
            error!("Refresh polynomial does not have a zero constant term");
            return Err(DecommitError::NonZeroConstant);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::ParticipantConfig, session::SessionIdentity, utils::testing::init_testing};
    use k256::{elliptic_curve::Field, Scalar};

    fn setup(refresh: bool) -> (SessionIdentity, KeygenDecommit) {
        let mut rng = init_testing();
        let pids = ParticipantConfig::random(3, &mut rng).all_participants();
        let session = SessionIdentity::new("keygen", pids.clone(), pids[0], 1, &[]).unwrap();
        let mut coeffs = vec![
            CurvePoint::scale_generator(&Scalar::random(&mut rng)),
            CurvePoint::scale_generator(&Scalar::random(&mut rng)),
        ];
        if refresh {
            coeffs[0] = CurvePoint::IDENTITY;
        }
        let decommit = KeygenDecommit::new(&mut rng, session.hash(), pids[0], coeffs);
        (session, decommit)
    }

    #[test]
    fn honest_decommitment_verifies() {
        let (session, decommit) = setup(false);
        let com = decommit.commit().unwrap();
        assert_eq!(
            decommit.verify(session.hash(), session.self_id(), &com, 1, false),
            Ok(())
        );
        // A keygen polynomial is not a refresh polynomial.
        assert_eq!(
            decommit.verify(session.hash(), session.self_id(), &com, 1, true),
            Err(DecommitError::NonZeroConstant)
        );
        let (session, refresh) = setup(true);
        let com = refresh.commit().unwrap();
        assert_eq!(
            refresh.verify(session.hash(), session.self_id(), &com, 1, true),
            Ok(())
        );
    }

    #[test]
    fn altered_decommitment_is_caught() {
        let (session, decommit) = setup(false);
        let com = decommit.commit().unwrap();

        let mut altered = decommit.clone();
        altered.rid[0] ^= 1;
        assert_eq!(
            altered.verify(session.hash(), session.self_id(), &com, 1, false),
            Err(DecommitError::Mismatch)
        );

        let other = session.participant_ids()[1];
        assert_eq!(
            decommit.verify(session.hash(), other, &com, 1, false),
            Err(DecommitError::WrongSender)
        );
        assert_eq!(
            decommit.verify(session.hash(), session.self_id(), &com, 2, false),
            Err(DecommitError::WrongDegree)
        );
    }
}
