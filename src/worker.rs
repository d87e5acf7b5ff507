//! Background sealing.
//!
//! [`SealWorker`] admits votes on the caller's task and hands proof-of-work to
//! tokio's blocking pool, so submission always answers with a pending receipt.
//! Completed seals, closes and failures are reported on the event channel
//! returned by [`SealWorker::spawn`].

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::LedgerError;
use crate::ledger::{LedgerManager, VoteReceipt};
use crate::vote::Ballot;

/// Outcome of a background request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealEvent {
    /// A block was mined and appended.
    Sealed {
        /// Election that grew.
        election_id: String,
        /// Index of the new block.
        block_index: u64,
        /// Hash of the new block.
        block_hash: String,
        /// Votes sealed by the block, in block order.
        vote_ids: Vec<String>,
    },
    /// A close request finished.
    Closed {
        /// Election that was closed.
        election_id: String,
        /// Number of blocks sealed while flushing.
        blocks: usize,
    },
    /// A request failed; affected votes stay pending.
    Failed {
        /// Election the request targeted.
        election_id: String,
        /// Rendered error.
        error: String,
    },
}

#[derive(Debug)]
enum SealRequest {
    Seal(String),
    Close(String),
}

/// Handle to the background sealing task.
#[derive(Debug)]
pub struct SealWorker {
    manager: Arc<LedgerManager>,
    requests: mpsc::UnboundedSender<SealRequest>,
    task: JoinHandle<()>,
}

impl SealWorker {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(manager: Arc<LedgerManager>) -> (Self, mpsc::UnboundedReceiver<SealEvent>) {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Arc::clone(&manager), request_rx, events));
        info!("QSYS|mod=WORKER|evt=START");
        (
            Self {
                manager,
                requests,
                task,
            },
            event_rx,
        )
    }

    /// The manager this worker seals for.
    pub fn manager(&self) -> &Arc<LedgerManager> {
        &self.manager
    }

    /// Admits a vote and schedules a seal once the pool is full.
    ///
    /// The receipt is always `Pending`; the matching [`SealEvent::Sealed`]
    /// carries the vote id once its block is appended.
    pub fn submit_vote(
        &self,
        election_id: &str,
        ballot: Ballot,
        signature: String,
    ) -> Result<VoteReceipt, LedgerError> {
        let admission = self.manager.admit_vote(election_id, ballot, signature)?;
        if admission.seal_due {
            self.request_seal(election_id)?;
        }
        Ok(admission.receipt)
    }

    /// Schedules sealing of the election's pending pool.
    pub fn request_seal(&self, election_id: &str) -> Result<(), LedgerError> {
        self.send(SealRequest::Seal(election_id.to_string()))
    }

    /// Schedules the election-ended handling.
    pub fn request_close(&self, election_id: &str) -> Result<(), LedgerError> {
        self.send(SealRequest::Close(election_id.to_string()))
    }

    fn send(&self, request: SealRequest) -> Result<(), LedgerError> {
        self.requests
            .send(request)
            .map_err(|_| LedgerError::Io("seal worker has stopped".into()))
    }

    /// Stops accepting requests and waits for queued work to finish.
    pub async fn shutdown(self) {
        let Self { requests, task, .. } = self;
        drop(requests);
        if let Err(err) = task.await {
            warn!("QSYS|mod=WORKER|evt=JOIN_FAILED|error={err}");
        }
        info!("QSYS|mod=WORKER|evt=STOP");
    }
}

async fn run(
    manager: Arc<LedgerManager>,
    mut requests: mpsc::UnboundedReceiver<SealRequest>,
    events: mpsc::UnboundedSender<SealEvent>,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => {
                    let manager = Arc::clone(&manager);
                    let events = events.clone();
                    tasks.spawn_blocking(move || handle(&manager, request, &events));
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    warn!("QSYS|mod=WORKER|evt=TASK_FAILED|error={err}");
                }
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!("QSYS|mod=WORKER|evt=TASK_FAILED|error={err}");
        }
    }
}

fn handle(
    manager: &LedgerManager,
    request: SealRequest,
    events: &mpsc::UnboundedSender<SealEvent>,
) {
    let event = match request {
        SealRequest::Seal(election_id) => match manager.seal_block(&election_id) {
            Ok(block) => SealEvent::Sealed {
                election_id,
                block_index: block.index,
                block_hash: block.hash.clone(),
                vote_ids: block.votes.iter().map(|tx| tx.vote_id.clone()).collect(),
            },
            // An earlier request already drained the pool.
            Err(LedgerError::EmptyBlockDisallowed(_)) => {
                debug!("QSYS|mod=WORKER|evt=SEAL_SKIPPED|election={election_id}");
                return;
            }
            Err(err) => failed(election_id, err),
        },
        SealRequest::Close(election_id) => match manager.close_election(&election_id) {
            Ok(blocks) => SealEvent::Closed {
                election_id,
                blocks: blocks.len(),
            },
            Err(err) => failed(election_id, err),
        },
    };
    // The receiver may have been dropped; the ledger state is already final.
    let _ = events.send(event);
}

fn failed(election_id: String, err: LedgerError) -> SealEvent {
    warn!("QSYS|mod=WORKER|evt=FAILED|election={election_id}|error={err}");
    SealEvent::Failed {
        election_id,
        error: err.to_string(),
    }
}
