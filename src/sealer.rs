//! Seal scheduling.
//!
//! Sealing is signed up front; publication is deferred by an explicit state
//! machine. The task waits out the slot delay, optionally yields one extra
//! second to an in-turn peer whose block is still being processed, and emits
//! the sealed block into the result sink unless stopped or overtaken.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::{traits::ChainHeaderReader, types::Block, DIFF_IN_TURN, PROCESS_BACK_OFF_TIME};

/// States of one sealing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealState {
    /// Signed, not yet waiting.
    Armed,
    /// Waiting out the slot delay.
    WaitingDelay,
    /// Out of turn, yielding to the in-turn proposer's block.
    WaitingPeer,
    /// Block handed to the result sink.
    Emitted,
    /// Stopped or overtaken; nothing was emitted.
    Aborted,
}

/// One armed sealing attempt, ready to be spawned.
pub(crate) struct SealTask<C> {
    chain: Arc<C>,
    block: Block,
    delay: Duration,
    results: mpsc::Sender<Block>,
    stop: watch::Receiver<bool>,
}

impl<C: ChainHeaderReader + 'static> SealTask<C> {
    pub(crate) fn new(
        chain: Arc<C>,
        block: Block,
        delay: Duration,
        results: mpsc::Sender<Block>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { chain, block, delay, results, stop }
    }

    /// Drive the attempt to completion. Returns the terminal state, which is
    /// only observed by tests; the driver consumes the result sink.
    pub(crate) async fn run(mut self) -> SealState {
        let number = self.block.header.number;
        let mut state = SealState::Armed;

        loop {
            state = match state {
                SealState::Armed => {
                    if self.stopped() {
                        SealState::Aborted
                    } else {
                        SealState::WaitingDelay
                    }
                }
                SealState::WaitingDelay => {
                    trace!(target: "rota::seal", number, delay = ?self.delay, "waiting for slot to propagate");
                    tokio::select! {
                        _ = self.stop.changed() => SealState::Aborted,
                        _ = tokio::time::sleep(self.delay) => {
                            if self.should_wait_for_peer() {
                                SealState::WaitingPeer
                            } else {
                                SealState::Emitted
                            }
                        }
                    }
                }
                SealState::WaitingPeer => {
                    info!(target: "rota::seal", number, "waiting for the in-turn block to process");
                    tokio::select! {
                        _ = self.stop.changed() => {
                            info!(target: "rota::seal", number, "in-turn block processed, abort sealing");
                            SealState::Aborted
                        }
                        _ = tokio::time::sleep(Duration::from_secs(PROCESS_BACK_OFF_TIME)) => {
                            let head = self.chain.current_header().map(|h| h.number).unwrap_or_default();
                            if head >= number {
                                info!(target: "rota::seal", number, head, "chain advanced, abort sealing");
                                SealState::Aborted
                            } else {
                                SealState::Emitted
                            }
                        }
                    }
                }
                SealState::Emitted => {
                    if let Err(e) = self.results.try_send(self.block.clone()) {
                        warn!(target: "rota::seal", number, %e, "sealing result is not read by miner");
                    }
                    return SealState::Emitted;
                }
                SealState::Aborted => {
                    debug!(target: "rota::seal", number, "sealing aborted");
                    return SealState::Aborted;
                }
            };
        }
    }

    fn stopped(&mut self) -> bool {
        *self.stop.borrow_and_update()
    }

    /// An out-of-turn attempt whose parent matches the highest verified
    /// header yields once: the in-turn block for this slot is likely mid
    /// import.
    fn should_wait_for_peer(&self) -> bool {
        if self.block.header.difficulty == DIFF_IN_TURN {
            return false;
        }
        match self.chain.highest_verified_header() {
            Some(highest) => highest.parent_hash == self.block.header.parent_hash,
            None => false,
        }
    }
}
