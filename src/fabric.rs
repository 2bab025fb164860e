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

//! Rank fabric: the message-passing runtime underneath `Communicator` and
//! `RmaWindow`.
//!
//! A fabric endpoint represents one rank's membership in a fixed group. It
//! provides tagged point-to-point byte transfer and a one-sided segment
//! registry; everything else (collective algorithms, typed views, contract
//! checks) is layered on top. `fabric::local` is the in-process
//! implementation, with one endpoint per rank thread.

use crate::error::WeftResult;
use crate::window::WindowBuffer;

pub mod coll;
pub mod local;

/// User-visible message tag for point-to-point transfers. Non-negative;
/// `None` in the public API means tag 0.
pub type Tag = i32;

/// On-the-wire tag. User traffic and collective traffic occupy disjoint
/// spaces so a collective can never match a point-to-point receive, and
/// successive collectives (distinguished by sequence number) can never
/// match each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTag {
    /// Point-to-point message carrying a caller-chosen tag
    User(Tag),
    /// Collective-internal message for the group-wide operation with this
    /// per-rank sequence number
    Coll(u64),
}

/// Opaque identifier of a one-sided window within a fabric.
///
/// Allocated per endpoint from a monotone counter; since window creation is
/// collective and SPMD call order matches across ranks, every rank derives
/// the same id for the same logical window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinId(pub(crate) u64);

/// One rank's endpoint into a group fabric.
///
/// Implementations must be usable from the rank's single control thread
/// while peers operate concurrently on their own endpoints, so the trait is
/// `Send + Sync` and all operations take `&self`.
pub trait Fabric: Send + Sync {
    // =========================================================================
    // Membership
    // =========================================================================

    /// Group name, used to label logs and rank threads
    fn name(&self) -> &str;

    /// This endpoint's rank, `0 <= rank < size`
    fn rank(&self) -> usize;

    /// Number of ranks in the group, fixed for the fabric's lifetime
    fn size(&self) -> usize;

    /// Next collective sequence number for this rank. Every collective
    /// entered through this endpoint draws exactly one; matching SPMD call
    /// order keeps the counters aligned across ranks.
    fn next_coll_seq(&self) -> u64;

    // =========================================================================
    // Point-to-point
    // =========================================================================

    /// Deposit `payload` for `dst` under `tag`. Buffered: returns as soon
    /// as the payload is queued, never blocks on the receiver.
    fn send(&self, dst: usize, tag: WireTag, payload: &[u8]) -> WeftResult<()>;

    /// Block until a message from `src` under `tag` arrives, then copy it
    /// into `buf`. The payload length must equal `buf.len()` exactly;
    /// anything else is a truncation error. Messages between one ordered
    /// rank pair with the same tag are delivered in send order.
    fn recv(&self, src: usize, tag: WireTag, buf: &mut [u8]) -> WeftResult<()>;

    // =========================================================================
    // One-sided segment registry
    // =========================================================================

    /// Register this rank's segment for a new window and return its id.
    /// Registration alone is local; the caller is responsible for the
    /// collective synchronization that makes the window usable.
    fn win_create(&self, buffer: WindowBuffer) -> WeftResult<WinId>;

    /// Byte length of the segment `rank` exposed under `win`
    fn win_extent(&self, win: WinId, rank: usize) -> WeftResult<usize>;

    /// Write `bytes` into `target`'s segment at byte displacement `disp`
    fn win_put(&self, win: WinId, target: usize, disp: usize, bytes: &[u8]) -> WeftResult<()>;

    /// Read `buf.len()` bytes from `target`'s segment at displacement `disp`
    fn win_get(&self, win: WinId, target: usize, disp: usize, buf: &mut [u8]) -> WeftResult<()>;

    /// Withdraw this rank's segment from `win`
    fn win_free(&self, win: WinId) -> WeftResult<()>;
}
