// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

/// Bytewise XOR of two 256-bit values.
pub(crate) fn xor_256_bits(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        errors::{CallerError, InternalError, ProtocolError},
        handler::Handler,
        messages::Message,
        protocol::{ParticipantConfig, ParticipantIdentifier},
        session::SessionIdentity,
    };
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };
    use std::collections::{HashMap, VecDeque};
    use tracing_subscriber::{
        filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    };

    /// Initialize any fields necessary for our tests. This should be called at
    /// the top of all our tests.
    ///
    /// This will print the rng seed to stderr so that if a test fails, the
    /// failing seed can be recovered and used for debugging.
    pub(crate) fn init_testing() -> StdRng {
        let mut seeder = OsRng;
        let seed = seeder.gen();
        eprintln!(
            "To re-run test with the same randomness, use init_testing_with_seed() with the following seed:"
        );
        eprintln!("\t{seed:?}");
        StdRng::from_seed(seed)
    }

    /// A seeded version of [`init_testing`] that also turns on logging.
    ///
    /// Only call this while debugging. Several tests purposely feed bad
    /// input, and the resulting `warn`/`error` events are confusing next to
    /// a passing test.
    #[allow(unused)]
    pub(crate) fn init_testing_with_seed(seed: [u8; 32]) -> StdRng {
        let logging_level = EnvFilter::from_default_env()
            .max_level_hint()
            .and_then(|hint| hint.into_level())
            .unwrap_or(tracing::Level::DEBUG);

        // Only capture logging events from this crate.
        let targets = Targets::new().with_target("tss_engine", logging_level);
        let stdout_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_filter(targets);

        // It's okay if this fails. It just means logging has already been set up for
        // this thread.
        let _ = tracing_subscriber::registry().with(stdout_layer).try_init();

        StdRng::from_seed(seed)
    }

    /// One session identity per member of a fresh random quorum.
    pub(crate) fn quorum_sessions(
        protocol_name: &str,
        size: usize,
        threshold: usize,
        aux: &[u8],
        rng: &mut StdRng,
    ) -> Vec<SessionIdentity> {
        let configs = ParticipantConfig::random_quorum(size, rng).unwrap();
        let pids = configs[0].all_participants();
        pids.iter()
            .map(|pid| SessionIdentity::new(protocol_name, pids.clone(), *pid, threshold, aux).unwrap())
            .collect()
    }

    type Tamper = Box<dyn FnMut(ParticipantIdentifier, Message) -> Message>;

    /// In-memory stand-in for a transport connecting a set of handlers.
    ///
    /// Messages are fanned out to their recipients when sent, and delivered
    /// either in order or in a random order.
    pub(crate) struct Network<O> {
        handlers: Vec<Handler<O>>,
        index: HashMap<ParticipantIdentifier, usize>,
        in_flight: VecDeque<(ParticipantIdentifier, Message)>,
        shuffle: Option<StdRng>,
        tamper: Option<Tamper>,
        delivered: usize,
    }

    impl<O: Send + 'static> Network<O> {
        pub(crate) fn new(handlers: Vec<Handler<O>>) -> Self {
            let index = handlers
                .iter()
                .enumerate()
                .map(|(i, handler)| (handler.session().self_id(), i))
                .collect();
            Self {
                handlers,
                index,
                in_flight: VecDeque::new(),
                shuffle: None,
                tamper: None,
                delivered: 0,
            }
        }

        /// Deliver in-flight messages in a random order drawn from `rng`.
        pub(crate) fn shuffled(mut self, rng: StdRng) -> Self {
            self.shuffle = Some(rng);
            self
        }

        /// Rewrite every copy of a message right before it is queued for its
        /// recipient.
        pub(crate) fn with_tamper(
            mut self,
            tamper: impl FnMut(ParticipantIdentifier, Message) -> Message + 'static,
        ) -> Self {
            self.tamper = Some(Box::new(tamper));
            self
        }

        pub(crate) fn send(&mut self, messages: Vec<Message>) {
            for message in messages {
                let mut recipients = match message.to() {
                    Some(recipient) => vec![recipient],
                    None => self
                        .index
                        .keys()
                        .filter(|pid| **pid != message.from())
                        .copied()
                        .collect(),
                };
                recipients.sort();
                for recipient in recipients {
                    let copy = match self.tamper.as_mut() {
                        Some(tamper) => tamper(recipient, message.clone()),
                        None => message.clone(),
                    };
                    self.in_flight.push_back((recipient, copy));
                }
            }
        }

        /// Hand an arbitrary message to `recipient` right away.
        pub(crate) fn inject(&mut self, recipient: ParticipantIdentifier, message: Message) {
            self.deliver_one(recipient, message);
        }

        fn deliver_one(&mut self, recipient: ParticipantIdentifier, message: Message) {
            let Some(&i) = self.index.get(&recipient) else {
                return;
            };
            self.delivered += 1;
            match self.handlers[i].deliver(message) {
                Ok(outgoing) => self.send(outgoing),
                Err(InternalError::CallingApplicationMistake(
                    CallerError::ProtocolAlreadyTerminated,
                )) => {}
                Err(e) => panic!("handler failed: {e:?}"),
            }
        }

        pub(crate) fn start(&mut self) {
            for i in 0..self.handlers.len() {
                let outgoing = self.handlers[i].start().unwrap();
                self.send(outgoing);
            }
        }

        /// Deliver a single in-flight message. Returns false if none is left.
        pub(crate) fn step(&mut self) -> bool {
            let next = match self.shuffle.as_mut() {
                Some(rng) if !self.in_flight.is_empty() => {
                    let pick = rng.gen_range(0..self.in_flight.len());
                    self.in_flight.swap_remove_back(pick)
                }
                _ => self.in_flight.pop_front(),
            };
            match next {
                Some((recipient, message)) => {
                    self.deliver_one(recipient, message);
                    true
                }
                None => false,
            }
        }

        /// Deliver until nothing is in flight.
        pub(crate) fn run(&mut self) {
            while self.step() {}
        }

        /// Start every handler and deliver until nothing is in flight.
        pub(crate) fn run_to_completion(mut self) -> Self {
            self.start();
            self.run();
            self
        }

        pub(crate) fn in_flight(&mut self) -> &mut VecDeque<(ParticipantIdentifier, Message)> {
            &mut self.in_flight
        }

        pub(crate) fn handlers(&self) -> &[Handler<O>] {
            &self.handlers
        }

        pub(crate) fn handler(&self, pid: ParticipantIdentifier) -> &Handler<O> {
            &self.handlers[self.index[&pid]]
        }

        pub(crate) fn delivered(&self) -> usize {
            self.delivered
        }

        pub(crate) fn into_results(self) -> Vec<Result<O, ProtocolError>> {
            self.handlers.into_iter().map(Handler::into_result).collect()
        }

        pub(crate) fn into_outputs(self) -> Vec<O> {
            self.into_results()
                .into_iter()
                .map(|result| result.map_err(|e| e.to_string()).unwrap())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_its_own_inverse() {
        let a = [0x5a; 32];
        let b: [u8; 32] = std::array::from_fn(|i| i as u8);
        let c = xor_256_bits(&a, &b);
        assert_ne!(c, a);
        assert_eq!(xor_256_bits(&c, &b), a);
        assert_eq!(xor_256_bits(&a, &a), [0; 32]);
    }
}
