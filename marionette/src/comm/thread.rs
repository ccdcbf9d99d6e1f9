//! In-process backend: every rank is an OS thread and messages travel through
//! per-rank mailboxes guarded by a mutex/condvar pair.
//!
//! Matching follows MPI: a message is identified by its channel (derived from
//! the communicator context), the sender's rank inside its local group and the
//! tag, and messages from one sender on one channel are delivered in order.
//! Context ids for new communicators are agreed on by the group leaders so
//! every member ends up on the same channel.

use super::{CommError, Communicator, Rank, Status, Tag};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    os::raw::c_void,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{debug, error};

// channel kinds multiplexed onto one context
const POINT: u64 = 0;
const SIDE: u64 = 1;
const CROSS: u64 = 2;
const KINDS: u64 = 3;

// tags used on the internal channels
const TAG_GATHER: Tag = 1;
const TAG_BROADCAST: Tag = 2;
const TAG_SPLIT: Tag = 3;
const TAG_MERGE: Tag = 4;

/// panic payload of ranks brought down by another rank's abort
#[derive(Debug, Clone, Copy)]
pub struct Aborted {
    pub code: i32,
}

struct Envelope {
    channel: u64,
    source: Rank,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

struct Fabric {
    mailboxes: Vec<Mailbox>,
    next_context: AtomicU64,
    aborted: AtomicBool,
    epoch: Instant,
}

impl Fabric {
    fn new(size: usize) -> Self {
        Self {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            next_context: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn fresh_context(&self) -> u64 {
        self.next_context.fetch_add(1, Ordering::SeqCst)
    }

    fn post(&self, global: usize, envelope: Envelope) {
        let mailbox = &self.mailboxes[global];
        mailbox.queue.lock().push_back(envelope);
        mailbox.arrived.notify_all();
    }

    fn poison(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for mailbox in &self.mailboxes {
            // take the lock so a waiter can't miss the wakeup between its check and its wait
            let _queue = mailbox.queue.lock();
            mailbox.arrived.notify_all();
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Communicator handle of one rank in an in-process world.
pub struct ThreadComm {
    fabric: Arc<Fabric>,
    context: u64,
    group: Arc<[usize]>,
    remote: Option<Arc<[usize]>>,
    rank: Rank,
}

/// Run `body` on `size` ranks, each on its own thread named `rank-N`, and
/// collect the per-rank results in rank order.
///
/// A panic on one rank poisons the fabric so the remaining ranks unwind
/// instead of blocking forever; the first genuine panic is re-raised.
pub fn run<T, F>(size: usize, body: F) -> std::io::Result<Vec<T>>
where
    F: Fn(ThreadComm) -> T + Sync,
    T: Send,
{
    let fabric = Arc::new(Fabric::new(size));
    let group: Arc<[usize]> = (0..size).collect();
    let context = fabric.fresh_context();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for rank in 0..size {
            let comm = ThreadComm {
                fabric: fabric.clone(),
                context,
                group: group.clone(),
                remote: None,
                rank: rank as Rank,
            };
            let body = &body;

            let handle = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let fabric = comm.fabric.clone();
                    match panic::catch_unwind(AssertUnwindSafe(|| body(comm))) {
                        Ok(value) => value,
                        Err(payload) => {
                            fabric.poison();
                            panic::resume_unwind(payload)
                        }
                    }
                });

            match handle {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    error!(error = ?error, "Failed to spawn rank {rank}");
                    fabric.poison();
                    return Err(error);
                }
            }
        }

        let mut results = Vec::with_capacity(size);
        let mut failure: Option<Box<dyn Any + Send>> = None;
        for handle in handles {
            match handle.join() {
                Ok(value) => results.push(value),
                Err(payload) => {
                    // keep the panic that started the cascade, not the echoes of the abort
                    let secondary = payload.is::<Aborted>();
                    if failure.as_ref().map_or(true, |first| first.is::<Aborted>() && !secondary) {
                        failure = Some(payload);
                    }
                }
            }
        }

        match failure {
            Some(payload) => panic::resume_unwind(payload),
            None => Ok(results),
        }
    })
}

impl ThreadComm {
    fn global(&self) -> usize {
        self.group[self.rank as usize]
    }

    fn channel(&self, kind: u64) -> u64 {
        self.context * KINDS + kind
    }

    fn targets(&self) -> &[usize] {
        self.remote.as_deref().unwrap_or(&self.group)
    }

    fn check_rank(rank: Rank, size: usize) -> Result<usize, CommError> {
        if rank < 0 || rank as usize >= size {
            Err(CommError::RankOutOfRange {
                rank,
                size: size as Rank,
            })
        } else {
            Ok(rank as usize)
        }
    }

    fn require_intra(&self) -> Result<(), CommError> {
        if self.remote.is_some() {
            Err(CommError::NotIntra)
        } else {
            Ok(())
        }
    }

    fn deliver(&self, kind: u64, global: usize, tag: Tag, payload: Vec<u8>) {
        self.fabric.post(
            global,
            Envelope {
                channel: self.channel(kind),
                source: self.rank,
                tag,
                payload,
            },
        );
    }

    fn scan(queue: &VecDeque<Envelope>, channel: u64, source: Option<Rank>, tag: Option<Tag>) -> Option<usize> {
        queue.iter().position(|envelope| {
            envelope.channel == channel
                && source.map_or(true, |source| source == envelope.source)
                && tag.map_or(true, |tag| tag == envelope.tag)
        })
    }

    fn check_abort(&self) {
        if self.fabric.is_aborted() {
            panic::panic_any(Aborted { code: 1 });
        }
    }

    /// block until a matching envelope is queued, returning the locked queue and its index
    fn wait(&self, kind: u64, source: Option<Rank>, tag: Option<Tag>) -> (MutexGuard<'_, VecDeque<Envelope>>, usize) {
        let channel = self.channel(kind);
        let mailbox = &self.fabric.mailboxes[self.global()];
        let mut queue = mailbox.queue.lock();

        loop {
            if self.fabric.is_aborted() {
                drop(queue);
                panic::panic_any(Aborted { code: 1 });
            }
            if let Some(index) = Self::scan(&queue, channel, source, tag) {
                return (queue, index);
            }
            mailbox.arrived.wait(&mut queue);
        }
    }

    fn receive(&self, kind: u64, source: Rank, tag: Tag) -> Vec<u8> {
        let (mut queue, index) = self.wait(kind, Some(source), Some(tag));
        queue.remove(index).map(|envelope| envelope.payload).unwrap_or_default()
    }

    /// broadcast over the local group, regardless of whether this is an inter-communicator
    fn side_broadcast(&self, root: Rank, data: &mut Vec<u8>) {
        if self.rank == root {
            for (rank, global) in self.group.iter().enumerate() {
                if rank as Rank != root {
                    self.deliver(SIDE, *global, TAG_BROADCAST, data.clone());
                }
            }
        } else {
            *data = self.receive(SIDE, root, TAG_BROADCAST);
        }
    }

    /// gather onto `root` of the local group, `None` on every other rank
    fn side_gather(&self, root: Rank, data: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        if self.rank == root {
            let mut gathered = Vec::with_capacity(self.group.len());
            for rank in 0..self.group.len() as Rank {
                if rank == root {
                    gathered.push(data.clone());
                } else {
                    gathered.push(self.receive(SIDE, rank, TAG_GATHER));
                }
            }
            Some(gathered)
        } else {
            self.deliver(SIDE, self.group[root as usize], TAG_GATHER, data);
            None
        }
    }

    fn derive(&self, context: u64, group: Arc<[usize]>, remote: Option<Arc<[usize]>>, rank: Rank) -> Self {
        Self {
            fabric: self.fabric.clone(),
            context,
            group,
            remote,
            rank,
        }
    }
}

fn encode_words(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

fn decode_words(bytes: &[u8]) -> Result<Vec<u64>, CommError> {
    if bytes.len() % 8 != 0 {
        return Err(CommError::Malformed(format!(
            "{} bytes of internal metadata",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect())
}

fn to_group(words: &[u64]) -> Arc<[usize]> {
    words.iter().map(|word| *word as usize).collect()
}

impl Communicator for ThreadComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.group.len() as Rank
    }

    fn is_inter(&self) -> bool {
        self.remote.is_some()
    }

    fn remote_size(&self) -> Rank {
        self.remote.as_ref().map_or(0, |remote| remote.len() as Rank)
    }

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) -> Result<(), CommError> {
        let targets = self.targets();
        let dest = Self::check_rank(dest, targets.len())?;
        self.deliver(POINT, targets[dest], tag, data.to_vec());

        Ok(())
    }

    fn probe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Status, CommError> {
        let (queue, index) = self.wait(POINT, source, tag);
        let envelope = &queue[index];

        Ok(Status {
            source: envelope.source,
            tag: envelope.tag,
            count: envelope.payload.len(),
        })
    }

    fn iprobe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Option<Status>, CommError> {
        self.check_abort();
        let queue = self.fabric.mailboxes[self.global()].queue.lock();

        Ok(
            Self::scan(&queue, self.channel(POINT), source, tag).map(|index| Status {
                source: queue[index].source,
                tag: queue[index].tag,
                count: queue[index].payload.len(),
            }),
        )
    }

    fn recv(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(Vec<u8>, Status), CommError> {
        let (mut queue, index) = self.wait(POINT, source, tag);
        match queue.remove(index) {
            Some(envelope) => {
                let status = Status {
                    source: envelope.source,
                    tag: envelope.tag,
                    count: envelope.payload.len(),
                };
                Ok((envelope.payload, status))
            }
            None => Err(CommError::Malformed("matched message vanished".to_string())),
        }
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.require_intra()?;
        self.side_gather(0, Vec::new());
        self.side_broadcast(0, &mut Vec::new());

        Ok(())
    }

    fn broadcast(&self, root: Rank, data: &mut Vec<u8>) -> Result<(), CommError> {
        self.require_intra()?;
        Self::check_rank(root, self.group.len())?;
        self.side_broadcast(root, data);

        Ok(())
    }

    fn dup(&self) -> Result<Self, CommError> {
        self.require_intra()?;

        let mut context = if self.rank == 0 {
            encode_words(&[self.fabric.fresh_context()])
        } else {
            Vec::new()
        };
        self.side_broadcast(0, &mut context);
        let context = decode_words(&context)?
            .first()
            .copied()
            .ok_or_else(|| CommError::Malformed("missing context id".to_string()))?;

        Ok(self.derive(context, self.group.clone(), None, self.rank))
    }

    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Self>, CommError> {
        self.require_intra()?;

        // (has colour, colour, key) so that negative colours stay distinguishable from none
        let request = encode_words(&[
            color.is_some() as u64,
            color.unwrap_or(0) as u32 as u64,
            key as u32 as u64,
        ]);

        let assignment = match self.side_gather(0, request) {
            Some(requests) => {
                let mut colors: BTreeMap<i32, Vec<(i32, usize)>> = BTreeMap::new();
                let mut uncolored = Vec::new();
                for (rank, request) in requests.iter().enumerate() {
                    let words = decode_words(request)?;
                    if words.len() != 3 {
                        return Err(CommError::Malformed("split request".to_string()));
                    }
                    if words[0] == 0 {
                        uncolored.push(rank);
                    } else {
                        colors
                            .entry(words[1] as u32 as i32)
                            .or_default()
                            .push((words[2] as u32 as i32, rank));
                    }
                }

                let mut replies = vec![Vec::new(); self.group.len()];
                for (_, mut members) in colors {
                    members.sort();
                    let context = self.fabric.fresh_context();
                    let globals: Vec<u64> = members
                        .iter()
                        .map(|(_, rank)| self.group[*rank] as u64)
                        .collect();

                    for (index, (_, rank)) in members.iter().enumerate() {
                        let mut words = vec![context, index as u64];
                        words.extend_from_slice(&globals);
                        replies[*rank] = encode_words(&words);
                    }
                }
                debug!(uncolored = uncolored.len(), "Split assignments computed");

                let mut own = Vec::new();
                for (rank, reply) in replies.into_iter().enumerate() {
                    if rank == 0 {
                        own = reply;
                    } else {
                        self.deliver(SIDE, self.group[rank], TAG_SPLIT, reply);
                    }
                }
                own
            }
            None => self.receive(SIDE, 0, TAG_SPLIT),
        };

        if assignment.is_empty() {
            return Ok(None);
        }

        let words = decode_words(&assignment)?;
        if words.len() < 3 {
            return Err(CommError::Malformed("split assignment".to_string()));
        }

        Ok(Some(self.derive(
            words[0],
            to_group(&words[2..]),
            None,
            words[1] as Rank,
        )))
    }

    fn solo(&self) -> Result<Self, CommError> {
        let group: Arc<[usize]> = Arc::from(vec![self.global()]);

        Ok(self.derive(self.fabric.fresh_context(), group, None, 0))
    }

    fn intercomm_create(
        &self,
        local_leader: Rank,
        peer: &Self,
        remote_leader: Rank,
        tag: Tag,
    ) -> Result<Self, CommError> {
        self.require_intra()?;
        peer.require_intra()?;
        Self::check_rank(local_leader, self.group.len())?;

        let mut bridge = Vec::new();
        if self.rank == local_leader {
            let their_leader = peer.group[Self::check_rank(remote_leader, peer.group.len())?];

            let proposal = self.fabric.fresh_context();
            let mut words = vec![proposal];
            words.extend(self.group.iter().map(|global| *global as u64));
            peer.send(remote_leader, tag, &encode_words(&words))?;

            let (reply, _) = peer.recv(Some(remote_leader), Some(tag))?;
            let reply = decode_words(&reply)?;
            let (their_proposal, their_group) = reply
                .split_first()
                .ok_or_else(|| CommError::Malformed("empty bridge metadata".to_string()))?;

            let context = if self.group[local_leader as usize] < their_leader {
                proposal
            } else {
                *their_proposal
            };

            let mut words = vec![context];
            words.extend_from_slice(their_group);
            bridge = encode_words(&words);
        }
        self.side_broadcast(local_leader, &mut bridge);

        let words = decode_words(&bridge)?;
        let (context, remote) = words
            .split_first()
            .ok_or_else(|| CommError::Malformed("empty bridge broadcast".to_string()))?;

        Ok(self.derive(*context, self.group.clone(), Some(to_group(remote)), self.rank))
    }

    fn merge(&self, high: bool) -> Result<Self, CommError> {
        let remote = self.remote.clone().ok_or(CommError::NotInter)?;

        let mut decision = Vec::new();
        if self.rank == 0 {
            let proposal = self.fabric.fresh_context();
            self.deliver(CROSS, remote[0], TAG_MERGE, encode_words(&[high as u64, proposal]));

            let reply = decode_words(&self.receive(CROSS, 0, TAG_MERGE))?;
            if reply.len() != 2 {
                return Err(CommError::Malformed("merge metadata".to_string()));
            }
            let their_high = reply[0] != 0;

            let ours_lower = self.group[0] < remote[0];
            let local_first = if high != their_high { !high } else { ours_lower };
            let context = if ours_lower { proposal } else { reply[1] };

            decision = encode_words(&[local_first as u64, context]);
        }
        self.side_broadcast(0, &mut decision);

        let words = decode_words(&decision)?;
        if words.len() != 2 {
            return Err(CommError::Malformed("merge decision".to_string()));
        }

        let (first, second) = if words[0] != 0 {
            (&self.group, &remote)
        } else {
            (&remote, &self.group)
        };
        let merged: Arc<[usize]> = first.iter().chain(second.iter()).copied().collect();
        let rank = if words[0] != 0 {
            self.rank
        } else {
            remote.len() as Rank + self.rank
        };

        Ok(self.derive(words[1], merged, None, rank))
    }

    fn translate_ranks(&self, ranks: &[Rank], other: &Self) -> Result<Vec<Option<Rank>>, CommError> {
        ranks
            .iter()
            .map(|rank| {
                let global = self.group[Self::check_rank(*rank, self.group.len())?];
                Ok(other
                    .group
                    .iter()
                    .position(|candidate| *candidate == global)
                    .map(|position| position as Rank))
            })
            .collect()
    }

    fn wtime(&self) -> f64 {
        self.fabric.epoch.elapsed().as_secs_f64()
    }

    fn abort(&self, code: i32) -> ! {
        error!(rank = self.rank, code, "Aborting in-process world");
        self.fabric.poison();
        panic::panic_any(Aborted { code })
    }

    fn handle(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }
}
