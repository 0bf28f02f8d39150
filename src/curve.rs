// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! secp256k1 points and the polynomial arithmetic used by the threshold
//! protocols.

use crate::{
    errors::{InternalError, Result},
    protocol::ParticipantIdentifier,
};
use k256::{
    elliptic_curve::{group::Group, ops::Reduce, PrimeField},
    AffinePoint, FieldBytes, ProjectivePoint, Scalar, U256,
};
use merlin::Transcript;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::error;
use zeroize::Zeroize;

/// Wrapper around [`k256::ProjectivePoint`] so that we can define our own
/// serialization for it.
///
/// Note that this type derives [`Debug`]; if a [`CurvePoint`] is used in a
/// private type, `Debug` should be manually implemented with the field of this
/// type explicitly redacted!
#[derive(Eq, PartialEq, Debug, Clone, Copy, Zeroize)]
pub struct CurvePoint(ProjectivePoint);

impl CurvePoint {
    /// The standard generator of secp256k1.
    pub const GENERATOR: Self = CurvePoint(ProjectivePoint::GENERATOR);
    /// The identity point, used to initialize sums of points.
    pub const IDENTITY: Self = CurvePoint(ProjectivePoint::IDENTITY);

    pub(crate) fn multiply_by_scalar(&self, scalar: &Scalar) -> Self {
        Self(self.0 * scalar)
    }

    /// `scalar · G`.
    pub(crate) fn scale_generator(scalar: &Scalar) -> Self {
        Self::GENERATOR.multiply_by_scalar(scalar)
    }

    /// Whether this is the point at infinity.
    pub fn is_identity(&self) -> bool {
        bool::from(self.0.is_identity())
    }

    /// Serialize the point as a compressed affine encoding.
    pub fn to_bytes(self) -> Vec<u8> {
        use k256::elliptic_curve::group::GroupEncoding;
        AffinePoint::from(self.0).to_bytes().to_vec()
    }
}

impl std::ops::Add for CurvePoint {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::iter::Sum for CurvePoint {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::IDENTITY, |sum, point| sum + point)
    }
}

impl From<ProjectivePoint> for CurvePoint {
    fn from(p: ProjectivePoint) -> Self {
        Self(p)
    }
}

impl Serialize for CurvePoint {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let afp = AffinePoint::from(self.0);
        afp.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CurvePoint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = AffinePoint::deserialize(deserializer)?;
        Ok(Self(p.into()))
    }
}

/// Assign a non-zero x coordinate to each participant.
pub(crate) fn participant_coordinate(pid: ParticipantIdentifier) -> Scalar {
    Scalar::from_u128(pid.as_u128()) + Scalar::ONE
}

/// Evaluate the polynomial with `coefficients` (constant term first) at the
/// coordinate of `recipient`.
pub(crate) fn eval_private(coefficients: &[Scalar], recipient: ParticipantIdentifier) -> Scalar {
    let x = participant_coordinate(recipient);
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff)
}

/// Feldman VSS evaluation: the image under `G` of the polynomial whose
/// coefficients are committed to in `coefficients`.
pub(crate) fn eval_public(coefficients: &[CurvePoint], recipient: ParticipantIdentifier) -> CurvePoint {
    let x = participant_coordinate(recipient);
    coefficients
        .iter()
        .rev()
        .fold(CurvePoint::IDENTITY, |acc, coeff| acc.multiply_by_scalar(&x) + *coeff)
}

/// Lagrange coefficient at zero of `pid` over the interpolation set
/// `participants`.
pub(crate) fn lagrange_coefficient_at_zero(
    pid: ParticipantIdentifier,
    participants: &[ParticipantIdentifier],
) -> Result<Scalar> {
    let own = participant_coordinate(pid);
    let mut result = Scalar::ONE;
    for other in participants.iter().filter(|other| **other != pid) {
        let point = participant_coordinate(*other);
        let denominator: Option<Scalar> = (own - point).invert().into();
        let Some(inverse) = denominator else {
            error!("Participants {pid} and {other} share an interpolation point");
            return Err(InternalError::InternalInvariantFailed);
        };
        result *= (Scalar::ZERO - point) * inverse;
    }
    Ok(result)
}

/// Draw a scalar from `transcript`.
pub(crate) fn challenge_scalar(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    let mut bytes = [0u8; 32];
    transcript.challenge_bytes(label, &mut bytes);
    let bytes: FieldBytes = bytes.into();
    <Scalar as Reduce<U256>>::reduce_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::ParticipantConfig, utils::testing::init_testing};
    use k256::elliptic_curve::Field;

    #[test]
    fn public_evaluation_matches_private_evaluation() {
        let mut rng = init_testing();
        let coefficients = (0..4).map(|_| Scalar::random(&mut rng)).collect::<Vec<_>>();
        let commitments = coefficients
            .iter()
            .map(CurvePoint::scale_generator)
            .collect::<Vec<_>>();
        for pid in ParticipantConfig::random(5, &mut rng).all_participants() {
            assert_eq!(
                CurvePoint::scale_generator(&eval_private(&coefficients, pid)),
                eval_public(&commitments, pid)
            );
        }
    }

    #[test]
    fn any_quorum_interpolates_the_constant_term() {
        let mut rng = init_testing();
        let threshold = 2;
        let coefficients = (0..=threshold)
            .map(|_| Scalar::random(&mut rng))
            .collect::<Vec<_>>();
        let pids = ParticipantConfig::random(5, &mut rng).all_participants();

        for quorum in [&pids[..3], &pids[1..4], &pids[2..]] {
            let secret = quorum.iter().fold(Scalar::ZERO, |acc, pid| {
                acc + eval_private(&coefficients, *pid)
                    * lagrange_coefficient_at_zero(*pid, quorum).unwrap()
            });
            assert_eq!(secret, coefficients[0]);
        }

        // One share short of the threshold reveals nothing useful.
        let short = &pids[..2];
        let guess = short.iter().fold(Scalar::ZERO, |acc, pid| {
            acc + eval_private(&coefficients, *pid)
                * lagrange_coefficient_at_zero(*pid, short).unwrap()
        });
        assert_ne!(guess, coefficients[0]);
    }

    #[test]
    fn points_survive_serialization() {
        let mut rng = init_testing();
        let point = CurvePoint::scale_generator(&Scalar::random(&mut rng));
        let bytes = bincode::serialize(&point).unwrap();
        let decoded: CurvePoint = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, point);
        assert!(CurvePoint::IDENTITY.is_identity());
        assert!(!point.is_identity());
    }

    #[test]
    fn points_encode_compressed() {
        let mut rng = init_testing();
        let generator = CurvePoint::GENERATOR.to_bytes();
        assert_eq!(generator.len(), 33);
        assert_eq!(generator[..4], [0x02, 0x79, 0xbe, 0x66]);

        let point = CurvePoint::scale_generator(&Scalar::random(&mut rng));
        let bytes = point.to_bytes();
        assert_eq!(bytes.len(), 33);
        assert!(bytes[0] == 0x02 || bytes[0] == 0x03);
        assert_ne!(bytes, generator);
    }

    #[test]
    fn challenges_depend_on_the_transcript() {
        let mut first = Transcript::new(b"challenge test");
        let mut second = Transcript::new(b"challenge test");
        second.append_message(b"extra", b"data");
        assert_ne!(
            challenge_scalar(&mut first, b"e"),
            challenge_scalar(&mut second, b"e")
        );
    }
}
