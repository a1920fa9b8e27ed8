use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::error::{LouvainError, Result};

enum Frame<M> {
    Data {
        seq: u64,
        from: u32,
        body: Option<M>,
    },
    Abort {
        from: u32,
        reason: String,
    },
}

/// Endpoint of one worker in the all-to-all mesh.
///
/// Every collective call is a full barrier: it returns only after a frame of
/// the same sequence number arrived from every peer. Frames of a later
/// sequence sent by faster peers are parked until their round comes.
pub struct Exchange<M> {
    rank: u32,
    worker_count: u32,
    senders: Vec<Sender<Frame<M>>>,
    receiver: Receiver<Frame<M>>,
    seq: u64,
    parked: BTreeMap<(u64, u32), Option<M>>,
    timeout: Duration,
}

impl<M: Send> Exchange<M> {
    /// Connected endpoints for `worker_count` workers, indexed by rank.
    pub fn mesh(worker_count: u32, timeout: Duration) -> Vec<Exchange<M>> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| crossbeam_channel::unbounded())
            .unzip();
        receivers.into_iter()
            .enumerate()
            .map(|(rank, receiver)| Exchange {
                rank: rank as u32,
                worker_count,
                senders: senders.clone(),
                receiver,
                seq: 0,
                parked: BTreeMap::new(),
                timeout,
            })
            .collect()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// Send `outgoing[p]` to worker `p` and return what every worker sent to
    /// this one, indexed by source rank.
    pub fn all_to_all(&mut self, outgoing: Vec<M>) -> Result<Vec<M>> {
        if outgoing.len() != self.worker_count as usize {
            return Err(LouvainError::Synchronization(format!(
                "worker {} prepared {} messages for {} workers",
                self.rank, outgoing.len(), self.worker_count)));
        }
        let received = self.round(outgoing.into_iter().map(Some).collect())?;
        received.into_iter()
            .enumerate()
            .map(|(from, body)| body.ok_or_else(|| LouvainError::Synchronization(
                format!("worker {} sent an empty frame", from))))
            .collect()
    }

    /// Wait until every worker arrived.
    pub fn barrier(&mut self) -> Result<()> {
        let outgoing = (0..self.worker_count).map(|_| None).collect();
        self.round(outgoing).map(|_| ())
    }

    /// Tell every peer this worker is giving up.
    pub fn abort(&self, reason: &str) {
        error!("worker {} aborting: {}", self.rank, reason);
        for (peer, sender) in self.senders.iter().enumerate() {
            if peer as u32 != self.rank {
                let _ = sender.send(Frame::Abort { from: self.rank, reason: reason.to_owned() });
            }
        }
    }

    fn round(&mut self, outgoing: Vec<Option<M>>) -> Result<Vec<Option<M>>> {
        self.seq += 1;
        let seq = self.seq;
        let mut slots: Vec<Option<Option<M>>> = (0..self.worker_count).map(|_| None).collect();

        for (peer, body) in outgoing.into_iter().enumerate() {
            if peer as u32 == self.rank {
                slots[peer] = Some(body);
                continue;
            }
            self.senders[peer]
                .send(Frame::Data { seq, from: self.rank, body })
                .map_err(|_| LouvainError::Synchronization(
                    format!("worker {} is gone", peer)))?;
        }

        let mut missing = self.worker_count - 1;
        let parked_keys: Vec<(u64, u32)> = self.parked.range((seq, 0)..(seq + 1, 0))
            .map(|(key, _)| *key)
            .collect();
        for key in parked_keys {
            if let Some(body) = self.parked.remove(&key) {
                slots[key.1 as usize] = Some(body);
                missing -= 1;
            }
        }

        while missing > 0 {
            match self.receiver.recv_timeout(self.timeout) {
                Ok(Frame::Data { seq: frame_seq, from, body }) => {
                    if frame_seq == seq {
                        slots[from as usize] = Some(body);
                        missing -= 1;
                    } else if frame_seq > seq {
                        debug!("worker {} parks frame {} from worker {}", self.rank, frame_seq, from);
                        self.parked.insert((frame_seq, from), body);
                    } else {
                        return Err(LouvainError::Synchronization(format!(
                            "worker {} got stale frame {} from worker {} during round {}",
                            self.rank, frame_seq, from, seq)));
                    }
                }
                Ok(Frame::Abort { from, reason }) => {
                    return Err(LouvainError::Synchronization(
                        format!("worker {} aborted: {}", from, reason)));
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(LouvainError::Synchronization(format!(
                        "worker {} timed out after {:?} waiting for {} peers in round {}",
                        self.rank, self.timeout, missing, seq)));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LouvainError::Synchronization(
                        format!("worker {} lost its mailbox", self.rank)));
                }
            }
        }

        Ok(slots.into_iter().map(|slot| slot.flatten()).collect())
    }
}

impl<M: Send + Clone> Exchange<M> {
    /// Broadcast `body` and collect everyone's contribution, indexed by rank.
    pub fn all_gather(&mut self, body: M) -> Result<Vec<M>> {
        let outgoing = vec![body; self.worker_count as usize];
        self.all_to_all(outgoing)
    }
}

#[cfg(test)]
mod exchange_test {
    use std::time::Duration;

    use crate::exchange::Exchange;

    #[test]
    fn test_single_worker() {
        let mut mesh = Exchange::<u32>::mesh(1, Duration::from_secs(1));
        let mut exchange = mesh.pop().unwrap();
        assert_eq!(exchange.all_gather(7).unwrap(), vec![7]);
        exchange.barrier().unwrap();
    }

    #[test]
    fn test_rounds_stay_ordered() {
        let mesh = Exchange::<u64>::mesh(3, Duration::from_secs(10));
        let results: Vec<Vec<Vec<u64>>> = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = mesh.into_iter()
                .map(|mut exchange| scope.spawn(move |_| {
                    let rank = exchange.rank() as u64;
                    (0..20u64)
                        .map(|round| exchange.all_gather(round * 10 + rank).unwrap())
                        .collect::<Vec<_>>()
                }))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        }).unwrap();

        for per_worker in results {
            for (round, gathered) in per_worker.iter().enumerate() {
                let round = round as u64;
                assert_eq!(gathered, &vec![round * 10, round * 10 + 1, round * 10 + 2]);
            }
        }
    }

    #[test]
    fn test_all_to_all_routes_by_rank() {
        let mesh = Exchange::<(u32, u32)>::mesh(2, Duration::from_secs(10));
        let results: Vec<Vec<(u32, u32)>> = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = mesh.into_iter()
                .map(|mut exchange| scope.spawn(move |_| {
                    let me = exchange.rank();
                    exchange.all_to_all(vec![(me, 0), (me, 1)]).unwrap()
                }))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        }).unwrap();
        assert_eq!(results[0], vec![(0, 0), (1, 0)]);
        assert_eq!(results[1], vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn test_abort_reaches_peer() {
        let mut mesh = Exchange::<u32>::mesh(2, Duration::from_secs(10));
        let mut waiting = mesh.pop().unwrap();
        let failing = mesh.pop().unwrap();
        failing.abort("disk full");
        let err = waiting.barrier().unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_timeout() {
        let mut mesh = Exchange::<u32>::mesh(2, Duration::from_millis(50));
        let _silent = mesh.pop().unwrap();
        let mut waiting = mesh.pop().unwrap();
        assert!(waiting.barrier().unwrap_err().to_string().contains("timed out"));
    }
}
