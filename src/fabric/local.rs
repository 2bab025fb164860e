// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process rank fabric
//!
//! Runs a whole group inside one process: every rank is a thread, every
//! ordered rank pair has a tag-matched mailbox, and one-sided segments are
//! shared storage reached through a group-wide registry. Suitable for
//! single-node SPMD work and as the hermetic fabric the test suite runs on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::{debug, trace};

use crate::comm::Communicator;
use crate::error::{WeftError, WeftResult};
use crate::window::WindowBuffer;

use super::{Fabric, WinId, WireTag};

/// Configuration for an in-process group
#[derive(Debug, Clone)]
pub struct LocalConfig {
    size: usize,
    name: String,
}

impl LocalConfig {
    /// Configuration for a group of `size` ranks under the default name
    pub fn new(size: usize) -> Self {
        Self {
            size,
            name: "weft".to_string(),
        }
    }

    /// Set the group name used in logs and rank thread names
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the group, yielding one connected `Communicator` per rank, in
    /// rank order. The endpoints share one fabric; hand each to its own
    /// thread.
    pub fn build(&self) -> WeftResult<Vec<Communicator>> {
        if self.size == 0 {
            return Err(WeftError::Config(format!(
                "group '{}' must have at least one rank",
                self.name
            )));
        }
        let shared = Arc::new(GroupShared::new(&self.name, self.size));
        debug!("group '{}' built with {} rank(s)", self.name, self.size);
        Ok((0..self.size)
            .map(|rank| {
                let endpoint: Arc<dyn Fabric> = Arc::new(LocalFabric {
                    shared: Arc::clone(&shared),
                    rank,
                    coll_seq: AtomicU64::new(0),
                    win_seq: AtomicU64::new(0),
                });
                Communicator::new(endpoint)
            })
            .collect())
    }
}

/// Run `f` as an SPMD program over a fresh in-process group.
///
/// Spawns one named thread per rank, hands each thread its rank's
/// `Communicator`, joins them all, and returns the per-rank results in rank
/// order. A rank that panics has its panic resumed on the caller; note that
/// a rank which stops mid-collective leaves peers blocked in their own
/// collective calls, just as an aborted rank would.
pub fn spmd<T, F>(config: &LocalConfig, f: F) -> WeftResult<Vec<T>>
where
    T: Send,
    F: Fn(Communicator) -> WeftResult<T> + Send + Sync,
{
    let comms = config.build()?;
    let name = config.name().to_string();
    let results = thread::scope(|scope| {
        let f = &f;
        let mut handles = Vec::with_capacity(comms.len());
        for (rank, comm) in comms.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("{name}-rank{rank}"))
                .spawn_scoped(scope, move || f(comm))
                .map_err(|e| WeftError::Fatal(format!("failed to spawn rank {rank}: {e}")))?;
            handles.push(handle);
        }
        let mut per_rank = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(result) => per_rank.push(result),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok(per_rank)
    })?;
    results.into_iter().collect()
}

/// One queued message between an ordered rank pair
struct Packet {
    tag: WireTag,
    payload: Vec<u8>,
}

/// Tag-matched mailbox: FIFO within a tag, unordered across tags
struct Mailbox {
    queue: Mutex<VecDeque<Packet>>,
    arrived: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    fn push(&self, tag: WireTag, payload: Vec<u8>) -> WeftResult<()> {
        let mut queue = lock(&self.queue)?;
        queue.push_back(Packet { tag, payload });
        self.arrived.notify_all();
        Ok(())
    }

    fn pull(&self, tag: WireTag) -> WeftResult<Vec<u8>> {
        let mut queue = lock(&self.queue)?;
        loop {
            if let Some(at) = queue.iter().position(|p| p.tag == tag) {
                if let Some(packet) = queue.remove(at) {
                    return Ok(packet.payload);
                }
            }
            queue = self
                .arrived
                .wait(queue)
                .map_err(|_| poisoned("mailbox"))?;
        }
    }
}

/// State shared by every endpoint of one group
struct GroupShared {
    name: String,
    size: usize,
    /// Indexed `dst * size + src`
    mailboxes: Vec<Mailbox>,
    /// Window id -> per-rank exposed segments
    windows: Mutex<HashMap<u64, Vec<Option<WindowBuffer>>>>,
}

impl GroupShared {
    fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            mailboxes: (0..size * size).map(|_| Mailbox::new()).collect(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn mailbox(&self, src: usize, dst: usize) -> &Mailbox {
        &self.mailboxes[dst * self.size + src]
    }
}

/// One rank's endpoint into an in-process group
pub struct LocalFabric {
    shared: Arc<GroupShared>,
    rank: usize,
    coll_seq: AtomicU64,
    win_seq: AtomicU64,
}

impl LocalFabric {
    fn check_peer(&self, peer: usize) -> WeftResult<()> {
        if peer >= self.shared.size {
            return Err(WeftError::contract(
                self.rank,
                format!(
                    "peer rank {} out of range for group '{}' of {} rank(s)",
                    peer, self.shared.name, self.shared.size
                ),
            ));
        }
        Ok(())
    }

    /// Shared handle to the segment `rank` exposed under `win`
    fn segment(&self, win: WinId, rank: usize) -> WeftResult<WindowBuffer> {
        self.check_peer(rank)?;
        let windows = lock(&self.shared.windows)?;
        windows
            .get(&win.0)
            .and_then(|slots| slots[rank].clone())
            .ok_or_else(|| {
                WeftError::Fatal(format!(
                    "window {} has no segment for rank {} (never created or already withdrawn)",
                    win.0, rank
                ))
            })
    }
}

impl Fabric for LocalFabric {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn next_coll_seq(&self) -> u64 {
        self.coll_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, dst: usize, tag: WireTag, payload: &[u8]) -> WeftResult<()> {
        self.check_peer(dst)?;
        trace!(
            "'{}' {} -> {} send {:?} ({} B)",
            self.shared.name,
            self.rank,
            dst,
            tag,
            payload.len()
        );
        self.shared.mailbox(self.rank, dst).push(tag, payload.to_vec())
    }

    fn recv(&self, src: usize, tag: WireTag, buf: &mut [u8]) -> WeftResult<()> {
        self.check_peer(src)?;
        let payload = self.shared.mailbox(src, self.rank).pull(tag)?;
        if payload.len() != buf.len() {
            return Err(WeftError::Truncation {
                rank: self.rank,
                src,
                expected: buf.len(),
                got: payload.len(),
            });
        }
        buf.copy_from_slice(&payload);
        trace!(
            "'{}' {} <- {} recv {:?} ({} B)",
            self.shared.name,
            self.rank,
            src,
            tag,
            buf.len()
        );
        Ok(())
    }

    fn win_create(&self, buffer: WindowBuffer) -> WeftResult<WinId> {
        let id = self.win_seq.fetch_add(1, Ordering::Relaxed);
        let mut windows = lock(&self.shared.windows)?;
        let slots = windows
            .entry(id)
            .or_insert_with(|| vec![None; self.shared.size]);
        if slots[self.rank].is_some() {
            return Err(WeftError::Fatal(format!(
                "window {} already has a segment for rank {}",
                id, self.rank
            )));
        }
        debug!(
            "'{}' rank {}: window {} exposes {} B",
            self.shared.name,
            self.rank,
            id,
            buffer.len()
        );
        slots[self.rank] = Some(buffer);
        Ok(WinId(id))
    }

    fn win_extent(&self, win: WinId, rank: usize) -> WeftResult<usize> {
        Ok(self.segment(win, rank)?.len())
    }

    fn win_put(&self, win: WinId, target: usize, disp: usize, bytes: &[u8]) -> WeftResult<()> {
        let segment = self.segment(win, target)?;
        let end = disp
            .checked_add(bytes.len())
            .filter(|&end| end <= segment.len())
            .ok_or_else(|| {
                WeftError::contract(
                    self.rank,
                    format!(
                        "put of {} B at displacement {} exceeds rank {}'s {} B segment",
                        bytes.len(),
                        disp,
                        target,
                        segment.len()
                    ),
                )
            })?;
        segment.as_mut_slice()[disp..end].copy_from_slice(bytes);
        trace!(
            "'{}' {} put {} B into rank {} window {} at {}",
            self.shared.name,
            self.rank,
            bytes.len(),
            target,
            win.0,
            disp
        );
        Ok(())
    }

    fn win_get(&self, win: WinId, target: usize, disp: usize, buf: &mut [u8]) -> WeftResult<()> {
        let segment = self.segment(win, target)?;
        let end = disp
            .checked_add(buf.len())
            .filter(|&end| end <= segment.len())
            .ok_or_else(|| {
                WeftError::contract(
                    self.rank,
                    format!(
                        "get of {} B at displacement {} exceeds rank {}'s {} B segment",
                        buf.len(),
                        disp,
                        target,
                        segment.len()
                    ),
                )
            })?;
        buf.copy_from_slice(&segment.as_slice()[disp..end]);
        trace!(
            "'{}' {} got {} B from rank {} window {} at {}",
            self.shared.name,
            self.rank,
            buf.len(),
            target,
            win.0,
            disp
        );
        Ok(())
    }

    fn win_free(&self, win: WinId) -> WeftResult<()> {
        let mut windows = lock(&self.shared.windows)?;
        let slots = windows.get_mut(&win.0).ok_or_else(|| {
            WeftError::Fatal(format!("window {} is not registered in this group", win.0))
        })?;
        if slots[self.rank].take().is_none() {
            return Err(WeftError::Fatal(format!(
                "window {} segment for rank {} already withdrawn",
                win.0, self.rank
            )));
        }
        if slots.iter().all(Option::is_none) {
            windows.remove(&win.0);
            debug!("'{}' window {} fully released", self.shared.name, win.0);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> WeftResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| poisoned("group state"))
}

fn poisoned(what: &str) -> WeftError {
    WeftError::Fatal(format!("{what} lock poisoned; a peer rank aborted"))
}
