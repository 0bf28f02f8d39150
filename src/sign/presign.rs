// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    curve::CurvePoint, keygen::Output, protocol::ParticipantIdentifier, session::SessionIdentity,
};
use k256::Scalar;
use std::{collections::BTreeMap, fmt::Debug};
use zeroize::Zeroizing;

/// A signer's share of a nonce agreed with the other signers ahead of the
/// message.
///
/// A presignature signs exactly one message. It cannot be cloned, and
/// [`sign_with_presignature`](crate::sign::sign_with_presignature) consumes
/// it.
pub struct Presignature {
    owner: ParticipantIdentifier,
    signers: Vec<ParticipantIdentifier>,
    key: Output,
    nonce: Zeroizing<Scalar>,
    nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    nonce_point: CurvePoint,
}

impl Debug for Presignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presignature")
            .field("owner", &self.owner)
            .field("signers", &self.signers)
            .field("nonce", &"[redacted]")
            .field("nonce_point", &self.nonce_point)
            .finish()
    }
}

impl Presignature {
    pub(super) fn new(
        session: &SessionIdentity,
        key: Output,
        nonce: Zeroizing<Scalar>,
        nonce_points: BTreeMap<ParticipantIdentifier, CurvePoint>,
    ) -> Self {
        let nonce_point = nonce_points.values().copied().sum();
        Self {
            owner: session.self_id(),
            signers: session.participant_ids().to_vec(),
            key,
            nonce,
            nonce_points,
            nonce_point,
        }
    }

    /// The participant holding this presignature.
    pub fn owner(&self) -> ParticipantIdentifier {
        self.owner
    }

    /// The signers that produced the presignature, in session order.
    pub fn signers(&self) -> &[ParticipantIdentifier] {
        &self.signers
    }

    /// The key the presignature signs with.
    pub fn key(&self) -> &Output {
        &self.key
    }

    /// The aggregated nonce point `R`.
    pub fn nonce_point(&self) -> CurvePoint {
        self.nonce_point
    }

    pub(super) fn into_parts(
        self,
    ) -> (Output, Zeroizing<Scalar>, BTreeMap<ParticipantIdentifier, CurvePoint>) {
        (self.key, self.nonce, self.nonce_points)
    }
}
