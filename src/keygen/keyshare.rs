// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{curve::CurvePoint, protocol::ParticipantIdentifier};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A participant's Shamir share of the private key.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySharePrivate {
    x: Scalar,
}

impl Debug for KeySharePrivate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySharePrivate([redacted])")
    }
}

impl KeySharePrivate {
    pub(crate) fn new(x: Scalar) -> Self {
        Self { x }
    }

    /// The curve point corresponding to this share.
    pub fn public_point(&self) -> CurvePoint {
        CurvePoint::scale_generator(&self.x)
    }

    pub(crate) fn as_scalar(&self) -> &Scalar {
        &self.x
    }
}

/// A participant's share of the public key: `share · G`.
#[allow(non_snake_case)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySharePublic {
    participant: ParticipantIdentifier,
    X: CurvePoint,
}

impl KeySharePublic {
    pub(crate) fn new(participant: ParticipantIdentifier, share: CurvePoint) -> Self {
        Self {
            participant,
            X: share,
        }
    }

    /// The participant this share belongs to.
    pub fn participant(&self) -> ParticipantIdentifier {
        self.participant
    }
}

impl AsRef<CurvePoint> for KeySharePublic {
    fn as_ref(&self) -> &CurvePoint {
        &self.X
    }
}
