// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processor Supervisor
//!
//! Runs every [`Processor`] in its own task. A processor reporting
//! [`Progress::MoreWork`] is called again at once; an idle or failing one
//! sleeps for the idle interval first. Cancelling the shared token stops
//! every loop, but never in the middle of a unit of work.

use crate::processor::{Processor, Progress};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Owns the tasks of every running [`Processor`] and the token that stops
/// them.
pub struct Supervisor {
    token: CancellationToken,
    idle: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Creates a supervisor with no running processors.
    ///
    /// # Parameters
    /// * `idle` - Sleep after an idle or failed iteration
    /// * `token` - Cancelling it stops every loop after its current iteration
    pub fn new(idle: Duration, token: CancellationToken) -> Supervisor {
        Supervisor {
            token,
            idle,
            tasks: Vec::new(),
        }
    }

    /// Starts `processor` in its own loop.
    pub fn spawn(&mut self, processor: Arc<dyn Processor>) {
        let token = self.token.clone();
        let idle = self.idle;

        info!(processor = processor.name(), "starting processor");
        self.tasks
            .push(tokio::spawn(run_loop(processor, idle, token)));
    }

    /// Number of running loops.
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancels every loop and waits for them to finish.
    pub async fn stop(self) {
        self.token.cancel();

        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "processor task failed");
            }
        }
        info!("processors stopped");
    }
}

async fn run_loop(processor: Arc<dyn Processor>, idle: Duration, token: CancellationToken) {
    while !token.is_cancelled() {
        let wait = match processor.process().await {
            Ok(Progress::MoreWork) => continue,
            Ok(Progress::Idle) => idle,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    processor = processor.name(),
                    "processor iteration failed"
                );
                idle
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
