// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A bounded pool of worker threads for per-sender verification work.
//!
//! Rounds hand the pool one job per remote sender and block until every job
//! has finished. Results come back in input order, so the outcome of a round
//! never depends on how the jobs were scheduled.
//!
//! One pool can serve any number of concurrent sessions. Jobs only see the
//! inputs handed to them, so sessions cannot observe each other.

use crate::errors::{InternalError, Result};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{num::NonZeroUsize, sync::Arc};
use tracing::{error, info};

/// Handle to a shared pool of worker threads. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<ThreadPool>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `pool_size` workers.
    ///
    /// A `pool_size` of 0 uses all available hardware parallelism.
    pub fn new(pool_size: usize) -> Result<Self> {
        let size = match pool_size {
            0 => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            n => n,
        };
        let inner = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("tss-worker-{index}"))
            .build()
            .map_err(|e| {
                error!("Failed to build worker pool: {e}");
                InternalError::PoolCreation
            })?;
        info!("Started worker pool with {size} workers");
        Ok(Self {
            inner: Arc::new(inner),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on every item and return the results in input order.
    ///
    /// Blocks until all jobs are done.
    pub fn map<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.inner
            .install(|| items.into_par_iter().map(job).collect())
    }

    /// Run `check` on every item. Returns the error of the first failing item
    /// in input order, regardless of which job failed first.
    pub fn check_all<T, E, F>(&self, items: Vec<T>, check: F) -> std::result::Result<(), E>
    where
        T: Send,
        E: Send,
        F: Fn(T) -> std::result::Result<(), E> + Sync + Send,
    {
        self.map(items, check)
            .into_iter()
            .find_map(std::result::Result::err)
            .map_or(Ok(()), Err)
    }
}
