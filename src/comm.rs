//! Communicator abstraction for cooperating processes.
//!
//! The parallel layer never talks to a message-passing library directly;
//! it goes through this trait, which carries exactly the collective
//! operations the engine needs.  `SelfComm` satisfies it for serial use.
//! `ThreadComm` runs a real N-endpoint group over shared memory — one
//! endpoint per thread — which is how the collective paths are tested
//! without an MPI launcher.  An MPI-backed implementation plugs in at
//! the same seam.
//!
//! Every collective blocks until all endpoints of the group participate.
//! A peer that panics poisons the shared state, and every surviving
//! endpoint reports a `Collective` error instead of hanging on a result
//! that will never arrive.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::BigFileError;

/// A group of cooperating processes.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Block until every rank arrives.
    fn barrier(&self) -> Result<(), BigFileError>;

    /// Replace `data` on every rank with the root's bytes.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), BigFileError>;

    /// Sum of `value` over all ranks, returned to all ranks.
    fn allreduce_sum(&self, value: u64) -> Result<u64, BigFileError>;

    /// Every rank's `value`, in rank order, returned to all ranks.
    fn allgather(&self, value: u64) -> Result<Vec<u64>, BigFileError>;
}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn barrier(&self) -> Result<(), BigFileError> {
        (**self).barrier()
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), BigFileError> {
        (**self).broadcast(root, data)
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64, BigFileError> {
        (**self).allreduce_sum(value)
    }

    fn allgather(&self, value: u64) -> Result<Vec<u64>, BigFileError> {
        (**self).allgather(value)
    }
}

// ── Serial communicator ─────────────────────────────────────────────

/// The single-rank group: every collective is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), BigFileError> {
        Ok(())
    }

    fn broadcast(&self, _root: usize, _data: &mut Vec<u8>) -> Result<(), BigFileError> {
        Ok(())
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64, BigFileError> {
        Ok(value)
    }

    fn allgather(&self, value: u64) -> Result<Vec<u64>, BigFileError> {
        Ok(vec![value])
    }
}

// ── In-process thread communicator ──────────────────────────────────

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<State>,
    arrived_cv: Condvar,
}

#[derive(Debug)]
struct State {
    /// Completed-collective counter; endpoints wait for it to advance.
    phase: u64,
    arrived: usize,
    // deposit slots; a rank may already deposit for the next collective
    // while stragglers are still reading the previous result
    values: Vec<u64>,
    payload: Vec<u8>,
    // results; only the last arrival of a collective overwrites these,
    // which cannot happen before every rank has read the previous one
    result: Vec<u64>,
    result_bytes: Vec<u8>,
}

/// One endpoint of an in-process group of `size` threads.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
    // this endpoint's completed-collective count
    generation: Cell<u64>,
}

impl ThreadComm {
    /// Create the endpoints of a `size`-rank group; hand one to each
    /// thread.
    pub fn split(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a communicator needs at least one rank");
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(State {
                phase: 0,
                arrived: 0,
                values: vec![0; size],
                payload: Vec::new(),
                result: Vec::new(),
                result_bytes: Vec::new(),
            }),
            arrived_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
                generation: Cell::new(0),
            })
            .collect()
    }

    /// One collective round: deposit this rank's contribution, let the
    /// last arrival combine, and read the combined result.
    fn round<R>(
        &self,
        deposit: impl FnOnce(&mut State),
        combine: impl FnOnce(&mut State),
        read: impl FnOnce(&State) -> R,
    ) -> Result<R, BigFileError> {
        let generation = self.generation.get();
        let mut state = self.shared.state.lock().map_err(poisoned)?;
        deposit(&mut state);
        state.arrived += 1;
        if state.arrived == self.shared.size {
            combine(&mut state);
            state.arrived = 0;
            state.phase = generation + 1;
            self.shared.arrived_cv.notify_all();
        } else {
            while state.phase == generation {
                state = self.shared.arrived_cv.wait(state).map_err(poisoned)?;
            }
        }
        self.generation.set(generation + 1);
        Ok(read(&state))
    }
}

fn poisoned<T>(_: T) -> BigFileError {
    BigFileError::Collective {
        message: "a peer rank panicked mid-collective".into(),
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), BigFileError> {
        self.round(|_| {}, |_| {}, |_| {})
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), BigFileError> {
        if root >= self.shared.size {
            return Err(BigFileError::Collective {
                message: format!("broadcast root {root} out of range"),
            });
        }
        let mine = if self.rank == root {
            std::mem::take(data)
        } else {
            Vec::new()
        };
        let is_root = self.rank == root;
        *data = self.round(
            move |state| {
                if is_root {
                    state.payload = mine;
                }
            },
            |state| state.result_bytes = std::mem::take(&mut state.payload),
            |state| state.result_bytes.clone(),
        )?;
        Ok(())
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64, BigFileError> {
        let rank = self.rank;
        // wrapping, so mod-2^64 checksum contributions combine exactly
        self.round(
            move |state| state.values[rank] = value,
            |state| {
                state.result = vec![
                    state
                        .values
                        .iter()
                        .fold(0u64, |acc, &v| acc.wrapping_add(v)),
                ]
            },
            |state| state.result[0],
        )
    }

    fn allgather(&self, value: u64) -> Result<Vec<u64>, BigFileError> {
        let rank = self.rank;
        self.round(
            move |state| state.values[rank] = value,
            |state| state.result = state.values.clone(),
            |state| state.result.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F>(size: usize, f: F)
    where
        F: Fn(ThreadComm) + Send + Sync + Copy + 'static,
    {
        let mut handles = Vec::new();
        for comm in ThreadComm::split(size) {
            handles.push(thread::spawn(move || f(comm)));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn self_comm_is_trivial() {
        let c = SelfComm;
        assert_eq!(c.size(), 1);
        c.barrier().unwrap();
        assert_eq!(c.allreduce_sum(7).unwrap(), 7);
        assert_eq!(c.allgather(7).unwrap(), vec![7]);
        let mut data = b"payload".to_vec();
        c.broadcast(0, &mut data).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn allreduce_sums_over_ranks() {
        run_group(4, |comm| {
            let total = comm.allreduce_sum(comm.rank() as u64 + 1).unwrap();
            assert_eq!(total, 1 + 2 + 3 + 4);
        });
    }

    #[test]
    fn allgather_orders_by_rank() {
        run_group(3, |comm| {
            let all = comm.allgather(10 * comm.rank() as u64).unwrap();
            assert_eq!(all, vec![0, 10, 20]);
        });
    }

    #[test]
    fn broadcast_copies_root_bytes() {
        run_group(4, |comm| {
            let mut data = if comm.rank() == 0 {
                b"from root".to_vec()
            } else {
                Vec::new()
            };
            comm.broadcast(0, &mut data).unwrap();
            assert_eq!(data, b"from root");
        });
    }

    #[test]
    fn collectives_compose_in_sequence() {
        run_group(2, |comm| {
            for i in 0..50u64 {
                assert_eq!(comm.allreduce_sum(i).unwrap(), 2 * i);
                comm.barrier().unwrap();
            }
        });
    }

    #[test]
    fn broadcast_rejects_bad_root() {
        run_group(1, |comm| {
            assert!(comm.broadcast(5, &mut Vec::new()).is_err());
        });
    }
}
