use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::consensus::round_state::RoundStep;
use crate::consensus::state::ConsensusEvent;

/// A scheduled step deadline. Deadlines are absolute (round start plus the
/// configured step duration); the machine ignores any that arrive stale.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutInfo {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    pub duration: Duration,
}

/// Runs on the async runtime, turning schedule requests into timeout events
/// delivered back to the consensus thread.
pub struct TimerService {
    rx: mpsc::Receiver<TimeoutInfo>,
    to_consensus: Sender<ConsensusEvent>,
}

pub struct TimerHandle {
    pub tx: mpsc::Sender<TimeoutInfo>,
}

impl TimerService {
    pub fn new(to_consensus: Sender<ConsensusEvent>) -> (Self, TimerHandle) {
        let (tx, rx) = mpsc::channel(256);
        (Self { rx, to_consensus }, TimerHandle { tx })
    }

    pub async fn run(mut self) {
        while let Some(info) = self.rx.recv().await {
            let to_consensus = self.to_consensus.clone();
            tokio::spawn(async move {
                sleep(info.duration).await;
                let _ = to_consensus.try_send(ConsensusEvent::Timeout {
                    height: info.height,
                    round: info.round,
                    step: info.step,
                });
            });
        }
    }
}
