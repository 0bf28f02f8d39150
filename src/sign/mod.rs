// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Threshold Schnorr signing with any `threshold + 1` holders of a key
//! produced by [`keygen`](crate::keygen).
//!
//! [`sign`] runs in three broadcast rounds:
//! - each signer commits to a fresh nonce point `R_i`;
//! - each signer reveals `R_i`. With `R = Σ R_i` and the challenge
//!   `e = H(R, X, m)`, each signer computes its share
//!   `z_i = k_i + e·λ_i·x_i`, where `λ_i` is its Lagrange coefficient over
//!   the signer set;
//! - each signer publishes `z_i`. Every share is checked against the signer's
//!   public key share before they are summed into the signature `(R, Σ z_i)`.
//!
//! [`presign`] runs the two nonce rounds before the message is known and
//! ends with a [`Presignature`]. [`sign_with_presignature`] then signs in a
//! single round.
//!
//! The session binds the key, the message and a per-run instance
//! identifier, so signers that disagree on any of them never end up in the
//! same session, and messages of one run are foreign to every other run.

mod presign;
mod rounds;
mod share;

pub use presign::Presignature;
pub use share::Signature;

use crate::{
    errors::{CallerError, Result},
    keygen::Output,
    protocol::{Identifier, ParticipantIdentifier},
    round::BoxedRound,
    session::SessionIdentity,
};
use rand::{CryptoRng, RngCore};
use tracing::error;

/// Name to use for signing sessions.
pub const PROTOCOL_NAME: &str = "schnorr-sign";

/// Name to use for presigning sessions.
pub const PRESIGN_PROTOCOL_NAME: &str = "schnorr-presign";

/// Name to use for sessions signing with a presignature.
pub const ONLINE_PROTOCOL_NAME: &str = "schnorr-sign-online";

/// What a signer signs, with which key, in which run.
#[derive(Debug, Clone)]
pub struct Input {
    message: Vec<u8>,
    key: Output,
    instance: Identifier,
}

impl Input {
    /// Sign `message` with our share of `key`. Every signer of the run
    /// passes the same fresh `instance`.
    pub fn new(message: &[u8], key: Output, instance: Identifier) -> Self {
        Self {
            message: message.to_vec(),
            key,
            instance,
        }
    }

    /// The message to sign.
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

/// What a signer presigns with, in which run.
#[derive(Debug, Clone)]
pub struct PresignInput {
    key: Output,
    instance: Identifier,
}

impl PresignInput {
    /// Presign with our share of `key`. Every signer of the run passes the
    /// same fresh `instance`.
    pub fn new(key: Output, instance: Identifier) -> Self {
        Self { key, instance }
    }
}

fn check_signers(signers: &[ParticipantIdentifier], key: &Output) -> Result<()> {
    let holders = key.participants();
    if let Some(outsider) = signers.iter().find(|pid| !holders.contains(pid)) {
        error!("Signer {outsider} does not hold a share of the key");
        Err(CallerError::BadInput)?
    }
    if signers.len() <= key.threshold() {
        error!(
            "{} signers cannot use a key with threshold {}",
            signers.len(),
            key.threshold()
        );
        Err(CallerError::BadInput)?
    }
    Ok(())
}

/// The session in which `signers` sign `input`.
///
/// `signers` must be at least `threshold + 1` holders of the key, given in
/// the same order by every signer.
pub fn session(
    signers: Vec<ParticipantIdentifier>,
    self_id: ParticipantIdentifier,
    input: &Input,
) -> Result<SessionIdentity> {
    check_signers(&signers, &input.key)?;
    let aux = serialize!(&(input.key.public_key(), &input.message, input.instance))?;
    Ok(SessionIdentity::new(
        PROTOCOL_NAME,
        signers,
        self_id,
        input.key.threshold(),
        &aux,
    )?)
}

/// First round of signing `input` in `session`.
///
/// `session` must be the one [`session`] returns for the same signers and
/// input.
pub fn sign<R: RngCore + CryptoRng>(
    session: &SessionIdentity,
    input: Input,
    rng: &mut R,
) -> Result<BoxedRound<Signature>> {
    let expected = self::session(session.participant_ids().to_vec(), session.self_id(), &input)?;
    if expected.hash() != session.hash() {
        error!("Session does not match the message and key to sign");
        Err(CallerError::BadInput)?
    }
    Ok(rounds::first_round(input, rng))
}

/// The session in which `signers` presign with `input`.
pub fn presign_session(
    signers: Vec<ParticipantIdentifier>,
    self_id: ParticipantIdentifier,
    input: &PresignInput,
) -> Result<SessionIdentity> {
    check_signers(&signers, &input.key)?;
    let aux = serialize!(&(input.key.public_key(), input.instance))?;
    Ok(SessionIdentity::new(
        PRESIGN_PROTOCOL_NAME,
        signers,
        self_id,
        input.key.threshold(),
        &aux,
    )?)
}

/// First round of presigning with `input` in `session`.
pub fn presign<R: RngCore + CryptoRng>(
    session: &SessionIdentity,
    input: PresignInput,
    rng: &mut R,
) -> Result<BoxedRound<Presignature>> {
    let expected = presign_session(session.participant_ids().to_vec(), session.self_id(), &input)?;
    if expected.hash() != session.hash() {
        error!("Session does not match the key to presign with");
        Err(CallerError::BadInput)?
    }
    Ok(rounds::first_round(input, rng))
}

/// The session in which the holders of `presignature` sign `message`.
///
/// Every signer derives the same session from its own presignature of the
/// same run.
pub fn online_session(presignature: &Presignature, message: &[u8]) -> Result<SessionIdentity> {
    let key = presignature.key();
    let aux = serialize!(&(key.public_key(), presignature.nonce_point(), message))?;
    Ok(SessionIdentity::new(
        ONLINE_PROTOCOL_NAME,
        presignature.signers().to_vec(),
        presignature.owner(),
        key.threshold(),
        &aux,
    )?)
}

/// The single round of signing `message` with `presignature` in `session`.
pub fn sign_with_presignature(
    session: &SessionIdentity,
    presignature: Presignature,
    message: &[u8],
) -> Result<BoxedRound<Signature>> {
    let expected = online_session(&presignature, message)?;
    if expected.hash() != session.hash() {
        error!("Session does not match the presignature and message");
        Err(CallerError::BadInput)?
    }
    rounds::online_round(session, presignature, message)
}
