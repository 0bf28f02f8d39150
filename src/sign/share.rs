// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::curve::{challenge_scalar, CurvePoint};
use k256::Scalar;
use merlin::Transcript;
use serde::{Deserialize, Serialize};

/// A single participant's share of the signature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(super) struct SignatureShare(pub Scalar);

/// Schnorr signature `(R, z)` with `z·G = R + e·X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    r: CurvePoint,
    z: Scalar,
}

/// The Fiat-Shamir challenge binding the nonce point, the public key and the
/// message.
pub(super) fn challenge(nonce: &CurvePoint, public_key: &CurvePoint, message: &[u8]) -> Scalar {
    let mut transcript = Transcript::new(b"tss-engine/schnorr");
    transcript.append_message(b"R", &nonce.to_bytes());
    transcript.append_message(b"X", &public_key.to_bytes());
    transcript.append_message(b"m", message);
    challenge_scalar(&mut transcript, b"e")
}

impl Signature {
    pub(super) fn new(r: CurvePoint, z: Scalar) -> Self {
        Self { r, z }
    }

    /// The nonce point.
    pub fn r(&self) -> CurvePoint {
        self.r
    }

    /// The response scalar.
    pub fn z(&self) -> Scalar {
        self.z
    }

    /// Check the signature on `message` under `public_key`.
    pub fn verify(&self, public_key: &CurvePoint, message: &[u8]) -> bool {
        let e = challenge(&self.r, public_key, message);
        CurvePoint::scale_generator(&self.z) == self.r + public_key.multiply_by_scalar(&e)
    }
}
