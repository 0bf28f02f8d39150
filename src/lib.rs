// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A round-based execution engine for threshold signature protocols.
//!
//! Every protocol run by this crate is a chain of rounds. Each party drives
//! its own copy of the protocol through a [`Handler`], which:
//! - rejects traffic from other sessions and from unknown senders;
//! - buffers messages that arrive early and replays them in order;
//! - accepts at most one message per sender and round;
//! - cross-confirms the content of broadcast rounds, so a party that sends
//!   different broadcast payloads to different peers is identified;
//! - hands the per-sender verification work of each round to a shared
//!   [`WorkerPool`].
//!
//! A run ends with the protocol's output, or with an [`Abort`] naming the
//! participant at fault.
//!
//! # Protocols
//! - [`xor`]: a one-round toy protocol in which the parties agree on the XOR
//!   of their random contributions.
//! - [`keygen`]: Feldman verifiable secret sharing key generation over
//!   secp256k1, plus proactive share refresh.
//! - [`sign`]: threshold Schnorr signing with any `t + 1` key holders, in
//!   three rounds or in one round from a presignature.
//!
//! # Driving a protocol
//! The engine does no I/O. The calling application creates a [`Handler`],
//! calls [`Handler::start`], and then pumps every outgoing [`Message`] to its
//! recipients (all other participants when [`Message::to`] is `None`),
//! passing every inbound message to [`Handler::deliver`]. Once
//! [`Handler::result`] returns a value, the run is done.
//!
//! # 🔒 Transport requirements
//! Point-to-point messages of the key generation protocols carry secret
//! shares. The transport must authenticate senders and keep point-to-point
//! messages confidential.

#![warn(missing_docs)]

#[macro_use]
pub mod errors;

mod broadcast;
mod curve;
pub mod handler;
pub mod keygen;
pub mod messages;
pub mod pool;
pub mod protocol;
pub mod round;
mod router;
pub mod session;
pub mod sign;
mod utils;
pub mod xor;

pub use curve::CurvePoint;
pub use errors::{Abort, AbortReason, ConfigurationError, MessageError, ProtocolError};
pub use handler::{Handler, Pending, Status};
pub use messages::{Message, MessageKind};
pub use pool::WorkerPool;
pub use protocol::{Identifier, ParticipantConfig, ParticipantIdentifier};
pub use round::{BoxedRound, Outgoing, Round, RoundKind, RoundNumber, Transition};
pub use session::{SessionHash, SessionIdentity};
