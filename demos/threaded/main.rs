// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! ## Example usage of the [`tss_engine`] crate.
//!
//! Each participant is represented by a worker thread holding one
//! [`Handler`] per running sub-protocol. A main coordinator initiates
//! sub-protocols and routes messages between workers: messages addressed to
//! a single participant go to that participant, and broadcasts go to every
//! other participant of the sub-protocol.
//!
//! The coordinator runs, in order: a shared coin flip, key generation, a key
//! refresh, and a signature by the first `threshold + 1` workers.
//!
//! # Warning: Trust Model
//! This example does not implement sender authentication, which is required
//! for a secure deployment. The coordinator is trusted to route messages
//! correctly, and the workers are trusted to not forge messages from other
//! participants.
mod utils;

use anyhow::{anyhow, bail};
use clap::Parser;
use itertools::Itertools;
use rand::{rngs::StdRng, thread_rng, SeedableRng};
use std::{
    collections::{HashMap, HashSet},
    sync::mpsc::{channel, Receiver, Sender},
    thread,
};
use tracing::{debug, error, info, instrument, span, trace, warn, Level};
use tracing_subscriber::{self, EnvFilter};
use tss_engine::{
    keygen::{self, Output},
    messages::Message,
    sign::{self, Signature},
    xor, Handler, Identifier, ParticipantConfig, ParticipantIdentifier, ProtocolError,
    SessionHash, SessionIdentity, WorkerPool,
};
use utils::{MessageFromWorker, SubProtocol};
use uuid::Uuid;

/// A key ID uniquely identifies a key and all corresponding private and
/// public key material across sub-protocols.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct KeyId(Uuid);

/// Fresh per-run randomness assigned by the coordinator, so that repeated
/// runs of a sub-protocol never share a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct Instance(Identifier);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of participant worker threads to use.
    #[arg(short, long, default_value_t = 3)]
    number_of_workers: usize,
    /// Number of corrupt participants the key tolerates.
    #[arg(short, long, default_value_t = 1)]
    threshold: usize,
    /// Threads in the verification pool shared by all workers. Zero picks
    /// one per core.
    #[arg(short, long, default_value_t = 0)]
    pool_size: usize,
    /// Message to sign.
    #[arg(short, long, default_value = "hello world")]
    message: String,
}

/// Generic storage for outputs of sub-protocols. Indexed by a `KeyId`.
struct StoredOutput<O> {
    stored_output: HashMap<KeyId, O>,
}

impl<O> StoredOutput<O> {
    fn new() -> Self {
        StoredOutput {
            stored_output: Default::default(),
        }
    }

    fn store(&mut self, id: KeyId, store: O) {
        let _ = self.stored_output.insert(id, store);
    }

    fn retrieve(&self, id: &KeyId) -> anyhow::Result<&O> {
        self.stored_output
            .get(id)
            .ok_or_else(|| anyhow!("No output stored for {id:?}"))
    }
}

/// A handler of any of the sub-protocols.
enum RunningHandler {
    Xor(Handler<[u8; 32]>),
    Key(Handler<Output>),
    Sign(Handler<Signature>),
}

/// What a finished handler produced.
enum Completed {
    Xor([u8; 32]),
    Key(Output),
    Signature(Signature),
}

impl RunningHandler {
    fn start(&mut self) -> anyhow::Result<Vec<Message>> {
        Ok(match self {
            RunningHandler::Xor(handler) => handler.start()?,
            RunningHandler::Key(handler) => handler.start()?,
            RunningHandler::Sign(handler) => handler.start()?,
        })
    }

    fn deliver(&mut self, message: Message) -> anyhow::Result<Vec<Message>> {
        Ok(match self {
            RunningHandler::Xor(handler) => handler.deliver(message)?,
            RunningHandler::Key(handler) => handler.deliver(message)?,
            RunningHandler::Sign(handler) => handler.deliver(message)?,
        })
    }

    /// `Ok(None)` while the run is in progress.
    fn outcome(&self) -> Result<Option<Completed>, ProtocolError> {
        fn poll<O: Clone + Send + 'static>(handler: &Handler<O>) -> Result<Option<O>, ProtocolError> {
            match handler.result() {
                Ok(output) => Ok(Some(output.clone())),
                Err(ProtocolError::NotFinished) => Ok(None),
                Err(e) => Err(e),
            }
        }
        Ok(match self {
            RunningHandler::Xor(handler) => poll(handler)?.map(Completed::Xor),
            RunningHandler::Key(handler) => poll(handler)?.map(Completed::Key),
            RunningHandler::Sign(handler) => poll(handler)?.map(Completed::Signature),
        })
    }
}

/// Message from the coordinator instructing the worker on the next action.
enum MessageFromCoordinator {
    /// Message from another worker delivering a protocol message.
    SubProtocolMessage(Message),
    /// Message from coordinator asking worker to start a new sub-protocol
    /// with the given participants.
    NewSubProtocol(SubProtocol, KeyId, Instance, Vec<ParticipantIdentifier>),
}

/// Maps [`ParticipantIdentifier`] to [`Sender`] channels for routing message
/// to the correct participant.
type WorkerChannels = HashMap<ParticipantIdentifier, Sender<MessageFromCoordinator>>;

/// 1) Set up logging.
/// 2) Create MPSC channels for communication between the workers and main
/// thread.
/// 3) Spawn N participant/worker threads sharing one verification pool.
/// 4) Main thread initiates every sub-protocol in turn.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .compact()
        .init();
    let span = span!(Level::INFO, "main");
    let _enter = span.entered();

    let num_workers = cli.number_of_workers;
    if cli.threshold >= num_workers {
        bail!(
            "Number of workers must be > threshold {}.",
            cli.threshold
        );
    }

    let (outgoing_tx, workers_rx) = channel::<MessageFromWorker>();
    let mut worker_messages: WorkerChannels = HashMap::new();
    let pool = WorkerPool::new(cli.pool_size)?;

    let participants: Vec<ParticipantConfig> =
        ParticipantConfig::random_quorum(num_workers, &mut StdRng::from_entropy())?;
    info!(
        "Spawning {num_workers} worker threads sharing a pool of {} threads",
        pool.size()
    );

    for config in participants {
        let (from_coordinator_tx, from_coordinator_rx) = channel::<MessageFromCoordinator>();
        let _ = worker_messages.insert(config.id(), from_coordinator_tx);

        let worker = Worker::new(
            config,
            pool.clone(),
            cli.threshold,
            cli.message.as_bytes().to_vec(),
            outgoing_tx.clone(),
        );
        let _ = thread::spawn(move || participant_worker(worker, from_coordinator_rx));
    }

    let mut coordinator = Coordinator::new(worker_messages, workers_rx, cli.threshold);
    coordinator.run_all()?;

    Ok(())
}

/// Coordinator responsible for initiating sub-protocols.
struct Coordinator {
    /// Channels to send messages to our workers.
    send_to_workers: WorkerChannels,
    /// Receive messages from worker threads to route to other workers.
    from_workers: Receiver<MessageFromWorker>,
    threshold: usize,
}

impl Coordinator {
    fn new(
        send_to_workers: WorkerChannels,
        from_workers: Receiver<MessageFromWorker>,
        threshold: usize,
    ) -> Self {
        Self {
            send_to_workers,
            from_workers,
            threshold,
        }
    }

    /// Initiates all sub-protocols.
    fn run_all(&mut self) -> anyhow::Result<()> {
        let key_id = KeyId(Uuid::new_v4());
        self.initiate_sub_protocol(SubProtocol::Xor, key_id)?;
        self.initiate_sub_protocol(SubProtocol::KeyGeneration, key_id)?;
        self.initiate_sub_protocol(SubProtocol::KeyRefresh, key_id)?;
        self.initiate_sub_protocol(SubProtocol::Sign, key_id)?;
        Ok(())
    }

    /// Initiates and coordinates the specified sub-protocol from start to
    /// finish.
    fn initiate_sub_protocol(
        &mut self,
        sub_protocol: SubProtocol,
        key_id: KeyId,
    ) -> anyhow::Result<()> {
        info!("Starting sub-protocol: {sub_protocol:?} for {key_id:?}.");

        let participants = self.start_new_subprotocol(sub_protocol, key_id)?;
        self.route_worker_messages(&participants)?;

        info!("Finished sub-protocol: {sub_protocol:?}.");
        Ok(())
    }

    /// (Helper Method) Start the specified `sub_protocol` by sending a
    /// message to every worker taking part.
    fn start_new_subprotocol(
        &self,
        sub_protocol: SubProtocol,
        key_id: KeyId,
    ) -> anyhow::Result<Vec<ParticipantIdentifier>> {
        let instance = Instance(Identifier::random(&mut thread_rng()));
        let participants = self.participants(sub_protocol);

        for pid in &participants {
            self.worker(pid)?.send(MessageFromCoordinator::NewSubProtocol(
                sub_protocol,
                key_id,
                instance,
                participants.clone(),
            ))?;
        }

        Ok(participants)
    }

    fn worker(&self, pid: &ParticipantIdentifier) -> anyhow::Result<&Sender<MessageFromCoordinator>> {
        self.send_to_workers
            .get(pid)
            .ok_or_else(|| anyhow!("No worker for {pid}"))
    }

    /// (Helper Method) Receives messages from workers and routes them to
    /// their recipients among `participants`.
    ///
    /// Warning: No sender authentication is done while routing messages!
    /// This function trusts workers not to forge messages.
    fn route_worker_messages(&self, participants: &[ParticipantIdentifier]) -> anyhow::Result<()> {
        let mut ended = HashSet::new();

        for message in &self.from_workers {
            match message {
                MessageFromWorker::Outgoing(messages) => {
                    debug!("Received {} messages from a worker.", messages.len());
                    for m in messages {
                        trace!("Routing message: {:?}", m);
                        let recipients = match m.to() {
                            Some(recipient) => vec![recipient],
                            None => participants
                                .iter()
                                .filter(|pid| **pid != m.from())
                                .copied()
                                .collect_vec(),
                        };
                        for recipient in recipients {
                            self.worker(&recipient)?
                                .send(MessageFromCoordinator::SubProtocolMessage(m.clone()))?;
                        }
                    }
                }
                MessageFromWorker::SubProtocolEnded(pid) => {
                    trace!("Worker {pid} finished sub-protocol.");
                    let _ = ended.insert(pid);
                    if ended.len() == participants.len() {
                        debug!("All workers finished sub-protocol. Entire sub-protocol ended.");
                        return Ok(());
                    }
                }
                MessageFromWorker::SubProtocolFailed(pid, reason) => {
                    error!("Worker {pid} failed: {reason}");
                    bail!("sub-protocol failed at {pid}: {reason}");
                }
            }
        }
        bail!("all workers hung up before the sub-protocol ended")
    }

    /// Select participants to a given protocol: all, or a threshold quorum.
    fn participants(&self, sub_protocol: SubProtocol) -> Vec<ParticipantIdentifier> {
        use SubProtocol::*;

        let pids = self.send_to_workers.keys().copied().sorted().collect_vec();
        match sub_protocol {
            Xor | KeyGeneration | KeyRefresh => pids,
            Sign => threshold_participants(pids, self.threshold),
        }
    }
}

/// Select a threshold quorum of participants.
fn threshold_participants(
    mut pids: Vec<ParticipantIdentifier>,
    threshold: usize,
) -> Vec<ParticipantIdentifier> {
    pids.sort();
    pids.truncate(threshold + 1);
    pids
}

/// Worker participating in the sub-protocols.
struct Worker {
    /// Configuration for this participant.
    config: ParticipantConfig,
    /// Verification pool shared with the other workers.
    pool: WorkerPool,
    threshold: usize,
    /// Message to sign.
    message: Vec<u8>,
    /// Handlers of the runs in progress, with the key they work on.
    running: HashMap<SessionHash, (RunningHandler, KeyId)>,
    /// Runs that already produced an output.
    finished: HashSet<SessionHash>,
    /// Outputs of successful coin flips.
    coin_flips: StoredOutput<[u8; 32]>,
    /// Outputs of successful key generation and refresh.
    key_shares: StoredOutput<Output>,
    /// Signatures generated from successful signing runs.
    signatures: StoredOutput<Signature>,
    /// Channel for sending messages to the coordinator.
    outgoing: Sender<MessageFromWorker>,
}

impl Worker {
    fn new(
        config: ParticipantConfig,
        pool: WorkerPool,
        threshold: usize,
        message: Vec<u8>,
        outgoing: Sender<MessageFromWorker>,
    ) -> Self {
        Worker {
            config,
            pool,
            threshold,
            message,
            running: HashMap::new(),
            finished: HashSet::new(),
            coin_flips: StoredOutput::new(),
            key_shares: StoredOutput::new(),
            signatures: StoredOutput::new(),
            outgoing,
        }
    }

    /// Start the sub-protocol described by `session`.
    #[instrument(skip_all)]
    fn new_sub_protocol(
        &mut self,
        session: &SessionIdentity,
        mut handler: RunningHandler,
        key_id: KeyId,
    ) -> anyhow::Result<()> {
        let messages = handler.start()?;
        let hash = session.hash();
        let _ = self.running.insert(hash, (handler, key_id));
        self.report_progress(hash, messages)
    }

    /// Process a message from another worker to make progress on one of our
    /// runs.
    #[instrument(skip_all)]
    fn process_message(&mut self, incoming: Message) -> anyhow::Result<()> {
        let hash = incoming.session_hash();
        let Some((handler, _)) = self.running.get_mut(&hash) else {
            if self.finished.contains(&hash) {
                trace!("Ignoring late message for a finished run");
            } else {
                warn!("Ignoring message for unknown session {hash:?}");
            }
            return Ok(());
        };
        let messages = handler.deliver(incoming)?;
        self.report_progress(hash, messages)
    }

    /// Forward `messages` and, once the run for `hash` is over, store its
    /// output.
    fn report_progress(&mut self, hash: SessionHash, messages: Vec<Message>) -> anyhow::Result<()> {
        // Only communicate with coordinator if we actually produced messages.
        if !messages.is_empty() {
            self.outgoing.send(MessageFromWorker::Outgoing(messages))?;
        }

        let Some((handler, key_id)) = self.running.get(&hash) else {
            return Ok(());
        };
        let key_id = *key_id;
        let completed = match handler.outcome() {
            Ok(None) => return Ok(()),
            Ok(Some(completed)) => completed,
            Err(e) => {
                let _ = self.running.remove(&hash);
                self.outgoing
                    .send(MessageFromWorker::SubProtocolFailed(self.config.id(), e.to_string()))?;
                return Ok(());
            }
        };
        let _ = self.running.remove(&hash);
        let _ = self.finished.insert(hash);

        debug!("Completed subprotocol successfully. Storing outputs!");
        match completed {
            Completed::Xor(value) => {
                info!("Agreed on shared randomness {}", hex(&value));
                self.coin_flips.store(key_id, value);
            }
            Completed::Key(output) => {
                info!(
                    "Holding a share of public key {} (threshold {})",
                    hex(&output.public_key().to_bytes()),
                    output.threshold()
                );
                self.key_shares.store(key_id, output);
            }
            Completed::Signature(signature) => {
                let public_key = self.key_shares.retrieve(&key_id)?.public_key();
                if !signature.verify(&public_key, &self.message) {
                    bail!("signature does not verify");
                }
                info!("Produced a valid signature on {:?}", String::from_utf8_lossy(&self.message));
                self.signatures.store(key_id, signature);
            }
        }
        self.outgoing
            .send(MessageFromWorker::SubProtocolEnded(self.config.id()))?;
        Ok(())
    }
}

/// Sub-protocol wrappers around `new_sub_protocol`.
/// These functions fetch the required inputs from storage.
impl Worker {
    fn new_xor(
        &mut self,
        instance: Instance,
        key_id: KeyId,
        participants: Vec<ParticipantIdentifier>,
    ) -> anyhow::Result<()> {
        let session = SessionIdentity::new(
            xor::PROTOCOL_NAME,
            participants,
            self.config.id(),
            0,
            &instance.0.to_bytes(),
        )?;
        let first = xor::first_round(&mut thread_rng());
        let handler = Handler::new(session.clone(), self.pool.clone(), first)?;
        self.new_sub_protocol(&session, RunningHandler::Xor(handler), key_id)
    }

    fn new_keygen(
        &mut self,
        instance: Instance,
        key_id: KeyId,
        participants: Vec<ParticipantIdentifier>,
    ) -> anyhow::Result<()> {
        let session = SessionIdentity::new(
            keygen::KEYGEN_PROTOCOL_NAME,
            participants,
            self.config.id(),
            self.threshold,
            &instance.0.to_bytes(),
        )?;
        let first = keygen::keygen(&session, &mut thread_rng());
        let handler = Handler::new(session.clone(), self.pool.clone(), first)?;
        self.new_sub_protocol(&session, RunningHandler::Key(handler), key_id)
    }

    fn new_refresh(
        &mut self,
        instance: Instance,
        key_id: KeyId,
        participants: Vec<ParticipantIdentifier>,
    ) -> anyhow::Result<()> {
        let session = SessionIdentity::new(
            keygen::REFRESH_PROTOCOL_NAME,
            participants,
            self.config.id(),
            self.threshold,
            &instance.0.to_bytes(),
        )?;
        let prior = self.key_shares.retrieve(&key_id)?;
        let first = keygen::refresh(&session, prior, &mut thread_rng())?;
        let handler = Handler::new(session.clone(), self.pool.clone(), first)?;
        self.new_sub_protocol(&session, RunningHandler::Key(handler), key_id)
    }

    fn new_sign(
        &mut self,
        instance: Instance,
        key_id: KeyId,
        participants: Vec<ParticipantIdentifier>,
    ) -> anyhow::Result<()> {
        let key = self.key_shares.retrieve(&key_id)?.clone();
        let input = sign::Input::new(&self.message, key, instance.0);
        let session = sign::session(participants, self.config.id(), &input)?;
        let first = sign::sign(&session, input, &mut thread_rng())?;
        let handler = Handler::new(session.clone(), self.pool.clone(), first)?;
        self.new_sub_protocol(&session, RunningHandler::Sign(handler), key_id)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Function to drive work for the workers. These workers execute in their
/// own thread.
#[instrument(skip_all, fields(id = %worker.config.id()))]
fn participant_worker(
    mut worker: Worker,
    from_coordinator: Receiver<MessageFromCoordinator>,
) -> anyhow::Result<()> {
    info!("Worker thread started.");

    for incoming in from_coordinator {
        let result = match incoming {
            // Message from another worker for a current protocol we are executing.
            MessageFromCoordinator::SubProtocolMessage(message) => worker.process_message(message),
            // Message from coordinator asking us to start a new sub-protocol.
            MessageFromCoordinator::NewSubProtocol(sub_protocol, key_id, instance, participants) => {
                match sub_protocol {
                    SubProtocol::Xor => worker.new_xor(instance, key_id, participants),
                    SubProtocol::KeyGeneration => worker.new_keygen(instance, key_id, participants),
                    SubProtocol::KeyRefresh => worker.new_refresh(instance, key_id, participants),
                    SubProtocol::Sign => worker.new_sign(instance, key_id, participants),
                }
            }
        };
        if let Err(e) = result {
            error!("Worker failed: {e}");
            worker
                .outgoing
                .send(MessageFromWorker::SubProtocolFailed(worker.config.id(), e.to_string()))?;
            return Err(e);
        }
    }

    Ok(())
}
