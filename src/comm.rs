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

//! Communicator: collective and point-to-point operations over a rank group
//!
//! All transfer operations are generic over `T: Pod` and ultimately move raw
//! bytes; `T = u8` is the untyped case and any other element type only
//! changes how counts are scaled. Collective calls are SPMD: every rank of
//! the group must make the same call in the same relative order, or the
//! program deadlocks. That hazard is not locally detectable and is never
//! reported as an error. What *is* reported, before anything reaches the
//! fabric, is every locally checkable precondition, as a rank-identified
//! contract violation.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use log::trace;

use crate::error::{WeftError, WeftResult};
use crate::fabric::{coll, Fabric, Tag, WireTag};
use crate::request::Request;

/// Handle to a fixed group of cooperating ranks.
///
/// Cheap to clone; clones share the underlying fabric endpoint. Constructed
/// either from a pre-existing fabric handle via [`Communicator::new`] or as
/// part of a fresh group via [`crate::fabric::local::LocalConfig::build`].
#[derive(Clone)]
pub struct Communicator {
    fabric: Arc<dyn Fabric>,
}

impl Communicator {
    /// Wrap a pre-existing fabric endpoint
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self { fabric }
    }

    pub(crate) fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// This process's rank within the group, `0 <= rank < size`
    pub fn rank(&self) -> usize {
        self.fabric.rank()
    }

    /// Number of ranks in the group
    pub fn size(&self) -> usize {
        self.fabric.size()
    }

    /// Ring neighbor before this rank, wrapping at 0
    pub fn prev(&self) -> usize {
        (self.rank() + self.size() - 1) % self.size()
    }

    /// Ring neighbor after this rank, wrapping at `size - 1`
    pub fn next(&self) -> usize {
        (self.rank() + 1) % self.size()
    }

    pub fn first(&self) -> bool {
        self.rank() == 0
    }

    pub fn last(&self) -> bool {
        self.rank() == self.size() - 1
    }

    // =========================================================================
    // Collectives
    // =========================================================================

    /// Block until every rank in the group has called `barrier`
    pub fn barrier(&self) -> WeftResult<()> {
        let seq = self.fabric.next_coll_seq();
        trace!("'{}' rank {}: barrier (seq {})", self.fabric.name(), self.rank(), seq);
        coll::barrier(self.fabric.as_ref(), seq)
    }

    /// Copy root's `data` into every rank's `data`, idempotent on root.
    /// Buffers must have the same length on every rank.
    pub fn bcast<T: Pod>(&self, data: &mut [T], root: usize) -> WeftResult<()> {
        self.check_rank("root", root)?;
        let seq = self.fabric.next_coll_seq();
        trace!(
            "'{}' rank {}: bcast {} B from root {} (seq {})",
            self.fabric.name(),
            self.rank(),
            data.len() * size_of::<T>(),
            root,
            seq
        );
        coll::bcast(self.fabric.as_ref(), seq, bytemuck::cast_slice_mut(data), root)
    }

    /// Partition root's `src` into equal `dst.len()`-element chunks, one per
    /// rank in rank order. `src` is only read at root, where it must hold
    /// exactly `dst.len() * size()` elements.
    pub fn scatter<T: Pod>(&self, src: &[T], dst: &mut [T], root: usize) -> WeftResult<()> {
        self.check_rank("root", root)?;
        if self.rank() == root {
            self.ensure(src.len() == dst.len() * self.size(), || {
                format!(
                    "scatter root holds {} element(s) but a group of {} needs {} per rank",
                    src.len(),
                    self.size(),
                    dst.len()
                )
            })?;
        }
        let seq = self.fabric.next_coll_seq();
        trace!(
            "'{}' rank {}: scatter {} B per rank from root {} (seq {})",
            self.fabric.name(),
            self.rank(),
            dst.len() * size_of::<T>(),
            root,
            seq
        );
        let src_bytes: &[u8] = if self.rank() == root {
            bytemuck::cast_slice(src)
        } else {
            &[]
        };
        coll::scatter(self.fabric.as_ref(), seq, src_bytes, bytemuck::cast_slice_mut(dst), root)
    }

    /// Partition root's `src` into per-rank chunks described by `counts` and
    /// `offsets` (both in elements, both of length `size()` on every rank).
    /// Each rank receives its chunk into `dst`, whose length must equal
    /// `counts[rank()]`.
    pub fn scatterv<T: Pod>(
        &self,
        src: &[T],
        counts: &[usize],
        offsets: &[usize],
        dst: &mut [T],
        root: usize,
    ) -> WeftResult<()> {
        self.check_rank("root", root)?;
        self.check_layout("scatterv", counts, offsets)?;
        self.ensure(counts[self.rank()] == dst.len(), || {
            format!(
                "scatterv destination holds {} element(s) but counts[{}] is {}",
                dst.len(),
                self.rank(),
                counts[self.rank()]
            )
        })?;
        if self.rank() == root {
            self.check_coverage("scatterv source", src.len(), counts, offsets)?;
        }
        let seq = self.fabric.next_coll_seq();
        let src_bytes: &[u8] = if self.rank() == root {
            bytemuck::cast_slice(src)
        } else {
            &[]
        };
        coll::scatterv(
            self.fabric.as_ref(),
            seq,
            src_bytes,
            &scaled::<T>(counts),
            &scaled::<T>(offsets),
            bytemuck::cast_slice_mut(dst),
            root,
        )
    }

    /// Assemble every rank's `src` into root's `dst` in rank order, rank r's
    /// contribution at element offset `src.len() * r`. `dst` is only
    /// written at root, where it must hold exactly `src.len() * size()`
    /// elements; other ranks may pass an empty slice.
    pub fn gather<T: Pod>(&self, src: &[T], dst: &mut [T], root: usize) -> WeftResult<()> {
        self.check_rank("root", root)?;
        if self.rank() == root {
            self.ensure(dst.len() == src.len() * self.size(), || {
                format!(
                    "gather root destination holds {} element(s), group of {} delivers {}",
                    dst.len(),
                    self.size(),
                    src.len() * self.size()
                )
            })?;
        }
        let seq = self.fabric.next_coll_seq();
        trace!(
            "'{}' rank {}: gather {} B per rank to root {} (seq {})",
            self.fabric.name(),
            self.rank(),
            src.len() * size_of::<T>(),
            root,
            seq
        );
        let dst_bytes: &mut [u8] = if self.rank() == root {
            bytemuck::cast_slice_mut(dst)
        } else {
            &mut []
        };
        coll::gather(self.fabric.as_ref(), seq, bytemuck::cast_slice(src), dst_bytes, root)
    }

    /// Assemble per-rank chunks of `counts[r]` elements at `offsets[r]`
    /// into root's `dst`. The send count is `counts[rank()]` and must equal
    /// `src.len()`; layout slices have length `size()` on every rank.
    pub fn gatherv<T: Pod>(
        &self,
        src: &[T],
        counts: &[usize],
        offsets: &[usize],
        dst: &mut [T],
        root: usize,
    ) -> WeftResult<()> {
        self.check_rank("root", root)?;
        self.check_layout("gatherv", counts, offsets)?;
        self.ensure(counts[self.rank()] == src.len(), || {
            format!(
                "gatherv source holds {} element(s) but counts[{}] is {}",
                src.len(),
                self.rank(),
                counts[self.rank()]
            )
        })?;
        if self.rank() == root {
            self.check_coverage("gatherv destination", dst.len(), counts, offsets)?;
        }
        let seq = self.fabric.next_coll_seq();
        let dst_bytes: &mut [u8] = if self.rank() == root {
            bytemuck::cast_slice_mut(dst)
        } else {
            &mut []
        };
        coll::gatherv(
            self.fabric.as_ref(),
            seq,
            bytemuck::cast_slice(src),
            &scaled::<T>(counts),
            &scaled::<T>(offsets),
            dst_bytes,
            root,
        )
    }

    /// Every rank contributes `src`; every rank ends with the concatenation
    /// in rank order. `dst.len()` must equal `src.len() * size()`.
    pub fn all_gather<T: Pod>(&self, src: &[T], dst: &mut [T]) -> WeftResult<()> {
        self.check_all_gather(src, dst)?;
        let seq = self.fabric.next_coll_seq();
        trace!(
            "'{}' rank {}: all_gather {} B per rank (seq {})",
            self.fabric.name(),
            self.rank(),
            src.len() * size_of::<T>(),
            seq
        );
        coll::all_gather(
            self.fabric.as_ref(),
            seq,
            bytemuck::cast_slice(src),
            bytemuck::cast_slice_mut(dst),
        )
    }

    /// Non-blocking [`Communicator::all_gather`]: the contribution is posted
    /// before returning, but `dst` holds the result only after the returned
    /// request has been waited.
    pub fn i_all_gather<'buf, T: Pod>(
        &self,
        src: &[T],
        dst: &'buf mut [T],
    ) -> WeftResult<Request<'buf>> {
        self.check_all_gather(src, dst)?;
        let seq = self.fabric.next_coll_seq();
        let count = src.len() * size_of::<T>();
        let dst_bytes = bytemuck::cast_slice_mut(dst);
        coll::all_gather_issue(self.fabric.as_ref(), seq, bytemuck::cast_slice(src), dst_bytes)?;
        Ok(Request::all_gather(
            Arc::clone(&self.fabric),
            seq,
            dst_bytes,
            count,
        ))
    }

    /// Personalized exchange: rank r's chunk `s * count..(s + 1) * count` of
    /// `src` lands in rank s's `dst` at chunk r, with
    /// `count = src.len() / size()`. Both buffers must have the same
    /// length, divisible by `size()`.
    pub fn alltoall<T: Pod>(&self, src: &[T], dst: &mut [T]) -> WeftResult<()> {
        self.ensure(src.len() == dst.len(), || {
            format!(
                "alltoall buffers differ: {} vs {} element(s)",
                src.len(),
                dst.len()
            )
        })?;
        self.ensure(src.len() % self.size() == 0, || {
            format!(
                "alltoall buffer of {} element(s) not divisible by group of {}",
                src.len(),
                self.size()
            )
        })?;
        let seq = self.fabric.next_coll_seq();
        let count = src.len() / self.size() * size_of::<T>();
        trace!(
            "'{}' rank {}: alltoall {} B per pair (seq {})",
            self.fabric.name(),
            self.rank(),
            count,
            seq
        );
        coll::alltoall(
            self.fabric.as_ref(),
            seq,
            bytemuck::cast_slice(src),
            bytemuck::cast_slice_mut(dst),
            count,
        )
    }

    /// Personalized exchange with per-destination extents. All four layout
    /// slices are in elements and of length `size()`; they are scaled by
    /// the element size internally.
    pub fn alltoallv<T: Pod>(
        &self,
        src: &[T],
        send_counts: &[usize],
        send_offsets: &[usize],
        dst: &mut [T],
        recv_counts: &[usize],
        recv_offsets: &[usize],
    ) -> WeftResult<()> {
        self.check_layout("alltoallv send", send_counts, send_offsets)?;
        self.check_layout("alltoallv recv", recv_counts, recv_offsets)?;
        self.check_coverage("alltoallv source", src.len(), send_counts, send_offsets)?;
        self.check_coverage("alltoallv destination", dst.len(), recv_counts, recv_offsets)?;
        let rank = self.rank();
        self.ensure(send_counts[rank] == recv_counts[rank], || {
            format!(
                "alltoallv self-addressed chunk sizes differ: sending {}, receiving {}",
                send_counts[rank], recv_counts[rank]
            )
        })?;
        let seq = self.fabric.next_coll_seq();
        coll::alltoallv(
            self.fabric.as_ref(),
            seq,
            bytemuck::cast_slice(src),
            &scaled::<T>(send_counts),
            &scaled::<T>(send_offsets),
            bytemuck::cast_slice_mut(dst),
            &scaled::<T>(recv_counts),
            &scaled::<T>(recv_offsets),
        )
    }

    // =========================================================================
    // Point-to-point
    // =========================================================================

    /// Non-blocking tagged send to `dst`. The payload is captured before
    /// returning; the request retires it. `None` means tag 0.
    /// Self-addressed sends are allowed.
    pub fn isend<'buf, T: Pod>(
        &self,
        data: &'buf [T],
        dst: usize,
        tag: Option<Tag>,
    ) -> WeftResult<Request<'buf>> {
        self.check_rank("destination", dst)?;
        let tag = self.check_tag(tag)?;
        self.fabric.send(dst, WireTag::User(tag), bytemuck::cast_slice(data))?;
        Ok(Request::completed())
    }

    /// Non-blocking tagged receive from `src`; `data` is filled when the
    /// returned request is waited. The matching message must carry exactly
    /// `data.len()` elements. `None` means tag 0.
    pub fn irecv<'buf, T: Pod>(
        &self,
        data: &'buf mut [T],
        src: usize,
        tag: Option<Tag>,
    ) -> WeftResult<Request<'buf>> {
        self.check_rank("source", src)?;
        let tag = self.check_tag(tag)?;
        Ok(Request::recv(
            Arc::clone(&self.fabric),
            src,
            WireTag::User(tag),
            bytemuck::cast_slice_mut(data),
        ))
    }

    // =========================================================================
    // Contract checks
    // =========================================================================

    fn ensure(&self, ok: bool, message: impl FnOnce() -> String) -> WeftResult<()> {
        if ok {
            Ok(())
        } else {
            Err(WeftError::contract(self.rank(), message()))
        }
    }

    fn check_rank(&self, role: &str, rank: usize) -> WeftResult<()> {
        self.ensure(rank < self.size(), || {
            format!(
                "{role} rank {rank} out of range for group of {}",
                self.size()
            )
        })
    }

    fn check_tag(&self, tag: Option<Tag>) -> WeftResult<Tag> {
        let tag = tag.unwrap_or(0);
        self.ensure(tag >= 0, || format!("message tag {tag} is negative"))?;
        Ok(tag)
    }

    fn check_layout(&self, op: &str, counts: &[usize], offsets: &[usize]) -> WeftResult<()> {
        self.ensure(counts.len() == self.size(), || {
            format!(
                "{op} counts has {} entr(ies) for a group of {}",
                counts.len(),
                self.size()
            )
        })?;
        self.ensure(offsets.len() == self.size(), || {
            format!(
                "{op} offsets has {} entr(ies) for a group of {}",
                offsets.len(),
                self.size()
            )
        })
    }

    fn check_coverage(
        &self,
        what: &str,
        len: usize,
        counts: &[usize],
        offsets: &[usize],
    ) -> WeftResult<()> {
        for r in 0..self.size() {
            let end = offsets[r].checked_add(counts[r]);
            self.ensure(end.map_or(false, |end| end <= len), || {
                format!(
                    "{what} of {len} element(s) does not cover offsets[{r}] + counts[{r}] = {} + {}",
                    offsets[r], counts[r]
                )
            })?;
        }
        Ok(())
    }

    fn check_all_gather<T: Pod>(&self, src: &[T], dst: &[T]) -> WeftResult<()> {
        self.ensure(dst.len() == src.len() * self.size(), || {
            format!(
                "all_gather destination holds {} element(s), group of {} delivers {}",
                dst.len(),
                self.size(),
                src.len() * self.size()
            )
        })
    }
}

/// Identity equality: two communicators are equal iff they wrap the same
/// fabric endpoint, never because their groups merely look alike.
impl PartialEq for Communicator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fabric, &other.fabric)
    }
}

impl Eq for Communicator {}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("group", &self.fabric.name())
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}

/// Scale an element-count slice to bytes
fn scaled<T>(counts: &[usize]) -> Vec<usize> {
    counts.iter().map(|c| c * size_of::<T>()).collect()
}
