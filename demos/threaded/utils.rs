// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use tss_engine::{messages::Message, ParticipantIdentifier};

/// Sub-protocols the coordinator can ask workers to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubProtocol {
    /// Agree on a shared random value.
    Xor,
    /// Generate a new shared key.
    KeyGeneration,
    /// Refresh the shares of an existing key.
    KeyRefresh,
    /// Sign with a threshold quorum of key holders.
    Sign,
}

/// Message from a worker to the coordinator.
#[derive(Debug)]
pub enum MessageFromWorker {
    /// Messages the worker wants routed to other workers.
    Outgoing(Vec<Message>),
    /// The worker got its output for the current sub-protocol.
    SubProtocolEnded(ParticipantIdentifier),
    /// The worker's run aborted or failed.
    SubProtocolFailed(ParticipantIdentifier, String),
}
