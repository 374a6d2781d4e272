//! An in-process world where every rank runs on its own thread.
//!
//! Ranks exchange tensors over channels. Each handle numbers the collectives it issues, so a
//! message from a peer that already moved on to the next collective is held back until it is
//! asked for.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use hashbrown::HashMap;
use ndarray::ArrayD;

use super::{Collective, concat, split_even};
use crate::sharding::ProcessGroup;
use crate::{CollectiveError, Element};

struct Envelope {
    seq: u64,
    payload: Box<dyn Any + Send>,
}

/// Factory for a set of connected [`ThreadedCollective`] handles.
pub struct LocalWorld;

impl LocalWorld {
    /// Creates one connected handle per rank, in rank order.
    ///
    /// Every ordered pair of ranks gets its own channel, so a rank that goes away is seen as
    /// disconnected by each peer waiting on it.
    pub fn connect(world_size: usize) -> Vec<ThreadedCollective> {
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        let mut outboxes = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let mut links = Vec::with_capacity(world_size);
            for inbox in inboxes.iter_mut() {
                let (sender, receiver) = channel();
                links.push(sender);
                inbox.push(receiver);
            }
            outboxes.push(links);
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| ThreadedCollective {
                rank,
                outboxes,
                inboxes,
                pending: RefCell::new(HashMap::new()),
                seq: Cell::new(0),
            })
            .collect()
    }

    /// Runs `f` once per rank, each on its own thread, and returns the results in rank order.
    ///
    /// A panic on any rank is propagated once all threads have been joined.
    pub fn run<R, F>(world_size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadedCollective) -> R + Sync,
    {
        let f = &f;
        thread::scope(|scope| {
            let handles = Self::connect(world_size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

/// One rank's endpoint in a [`LocalWorld`].
pub struct ThreadedCollective {
    rank: usize,
    /// Channel to each peer, indexed by the peer's rank.
    outboxes: Vec<Sender<Envelope>>,
    /// Channel from each peer, indexed by the peer's rank.
    inboxes: Vec<Receiver<Envelope>>,
    pending: RefCell<HashMap<(u64, usize), Box<dyn Any + Send>>>,
    seq: Cell<u64>,
}

impl ThreadedCollective {
    /// Number of ranks in the world.
    pub fn world_size(&self) -> usize {
        self.outboxes.len()
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn check_member(&self, group: &ProcessGroup) -> Result<(), CollectiveError> {
        match group.ranks().get(group.local_index()) {
            Some(&rank) if rank == self.rank => Ok(()),
            _ => Err(CollectiveError::NotAMember {
                rank: self.rank,
                group: group.ranks().to_vec(),
            }),
        }
    }

    fn send<E: Element>(&self, peer: usize, seq: u64, tensor: ArrayD<E>) -> Result<(), CollectiveError> {
        let envelope = Envelope {
            seq,
            payload: Box::new(tensor),
        };

        self.outboxes
            .get(peer)
            .ok_or(CollectiveError::Disconnected { peer })?
            .send(envelope)
            .map_err(|_| CollectiveError::Disconnected { peer })
    }

    fn recv<E: Element>(&self, peer: usize, seq: u64) -> Result<ArrayD<E>, CollectiveError> {
        let inbox = self
            .inboxes
            .get(peer)
            .ok_or(CollectiveError::Disconnected { peer })?;

        let buffered = self.pending.borrow_mut().remove(&(seq, peer));
        let payload = match buffered {
            Some(payload) => payload,
            None => loop {
                let envelope = inbox
                    .recv()
                    .map_err(|_| CollectiveError::Disconnected { peer })?;
                if envelope.seq == seq {
                    break envelope.payload;
                }
                self.pending
                    .borrow_mut()
                    .insert((envelope.seq, peer), envelope.payload);
            },
        };

        payload
            .downcast::<ArrayD<E>>()
            .map(|tensor| *tensor)
            .map_err(|_| {
                CollectiveError::Malformed(format!(
                    "rank {} sent an element type other than {:?}",
                    peer,
                    E::DTYPE
                ))
            })
    }
}

impl Collective for ThreadedCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        self.check_member(group)?;
        let seq = self.next_seq();

        for &peer in group.ranks() {
            if peer != self.rank {
                self.send(peer, seq, tensor.clone())?;
            }
        }

        let parts = group
            .ranks()
            .iter()
            .map(|&peer| {
                if peer == self.rank {
                    Ok(tensor.clone())
                } else {
                    self.recv(peer, seq)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        concat(dim, &parts)
    }

    fn all_to_all<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        gather_dim: usize,
        split_dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        self.check_member(group)?;
        let seq = self.next_seq();

        let mut own = None;
        let chunks = split_even(tensor, split_dim, group.size())?;
        for (&peer, chunk) in group.ranks().iter().zip(chunks) {
            if peer == self.rank {
                own = Some(chunk);
            } else {
                self.send(peer, seq, chunk)?;
            }
        }

        let parts = group
            .ranks()
            .iter()
            .map(|&peer| {
                if peer == self.rank {
                    own.take().ok_or_else(|| {
                        CollectiveError::Malformed(format!("rank {} listed twice in group", peer))
                    })
                } else {
                    self.recv(peer, seq)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        concat(gather_dim, &parts)
    }
}
