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

//! Collective algorithms over the point-to-point fabric
//!
//! Everything here is built from buffered sends and blocking tag-matched
//! receives: binomial trees for the rooted equal-chunk collectives, linear
//! root-addressed exchange for the irregular ones, direct pairwise exchange
//! for the all-to-all family, and a dissemination barrier. Each collective
//! instance is isolated by its sequence-numbered wire tag, so one message
//! flows per ordered rank pair per instance and nothing can cross-match.
//!
//! Buffer-size contracts are the caller's job; by the time control reaches
//! this module every slice is exactly the length the pattern requires.

use super::{Fabric, WireTag};
use crate::error::WeftResult;

/// Rotate `rank` so the root sits at 0. Tree shapes are computed in the
/// rotated space and translated back at the wire.
fn transform_rank(rank: usize, root: usize, size: usize) -> usize {
    (rank + size - root) % size
}

fn untransform_rank(t: usize, root: usize, size: usize) -> usize {
    (t + root) % size
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Binomial-tree broadcast of `buf` from `root`
pub(crate) fn bcast(fabric: &dyn Fabric, seq: u64, buf: &mut [u8], root: usize) -> WeftResult<()> {
    let size = fabric.size();
    if size == 1 {
        return Ok(());
    }
    let tag = WireTag::Coll(seq);
    let me = transform_rank(fabric.rank(), root, size);
    let top = if me == 0 {
        ceil_log2(size)
    } else {
        let k = me.trailing_zeros();
        let parent = untransform_rank(me - (1usize << k), root, size);
        fabric.recv(parent, tag, buf)?;
        k
    };
    for k in (0..top).rev() {
        let child = me + (1usize << k);
        if child < size {
            fabric.send(untransform_rank(child, root, size), tag, buf)?;
        }
    }
    Ok(())
}

/// Binomial-tree scatter: `src` (read at root only) is cut into
/// `dst.len()`-byte chunks, one per rank in rank order.
///
/// Each node stages the chunks of its whole subtree in root-rotated order,
/// so a parent forwards one contiguous slice per child.
pub(crate) fn scatter(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    dst: &mut [u8],
    root: usize,
) -> WeftResult<()> {
    let size = fabric.size();
    let count = dst.len();
    if size == 1 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let tag = WireTag::Coll(seq);
    let me = transform_rank(fabric.rank(), root, size);
    let (stage, top) = if me == 0 {
        let mut stage = vec![0u8; size * count];
        for t in 0..size {
            let orig = untransform_rank(t, root, size);
            stage[t * count..(t + 1) * count]
                .copy_from_slice(&src[orig * count..(orig + 1) * count]);
        }
        (stage, ceil_log2(size))
    } else {
        let k = me.trailing_zeros();
        let span = (1usize << k).min(size - me);
        let mut stage = vec![0u8; span * count];
        let parent = untransform_rank(me - (1usize << k), root, size);
        fabric.recv(parent, tag, &mut stage)?;
        (stage, k)
    };
    for k in (0..top).rev() {
        let child = me + (1usize << k);
        if child < size {
            let child_span = (1usize << k).min(size - child);
            let from = (1usize << k) * count;
            fabric.send(
                untransform_rank(child, root, size),
                tag,
                &stage[from..from + child_span * count],
            )?;
        }
    }
    dst.copy_from_slice(&stage[..count]);
    Ok(())
}

/// Binomial-tree gather: every rank's `src` lands in `dst` (written at root
/// only) at element offset `rank * src.len()`.
pub(crate) fn gather(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    dst: &mut [u8],
    root: usize,
) -> WeftResult<()> {
    let size = fabric.size();
    let count = src.len();
    if size == 1 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let tag = WireTag::Coll(seq);
    let me = transform_rank(fabric.rank(), root, size);
    let (span, top) = if me == 0 {
        (size, ceil_log2(size))
    } else {
        let k = me.trailing_zeros();
        ((1usize << k).min(size - me), k)
    };
    let mut stage = vec![0u8; span * count];
    stage[..count].copy_from_slice(src);
    for k in 0..top {
        let child = me + (1usize << k);
        if child >= size {
            break;
        }
        let child_span = (1usize << k).min(size - child);
        let at = (1usize << k) * count;
        fabric.recv(
            untransform_rank(child, root, size),
            tag,
            &mut stage[at..at + child_span * count],
        )?;
    }
    if me == 0 {
        for t in 0..size {
            let orig = untransform_rank(t, root, size);
            dst[orig * count..(orig + 1) * count]
                .copy_from_slice(&stage[t * count..(t + 1) * count]);
        }
    } else {
        let parent = untransform_rank(me - (1usize << top), root, size);
        fabric.send(parent, tag, &stage)?;
    }
    Ok(())
}

/// Linear root-addressed scatter with per-rank byte counts and offsets.
///
/// Irregular extents make tree staging depend on layout only the root
/// holds, so the root addresses every rank directly.
pub(crate) fn scatterv(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    counts: &[usize],
    offsets: &[usize],
    dst: &mut [u8],
    root: usize,
) -> WeftResult<()> {
    let rank = fabric.rank();
    let tag = WireTag::Coll(seq);
    if rank == root {
        for r in 0..fabric.size() {
            if r == rank {
                continue;
            }
            fabric.send(r, tag, &src[offsets[r]..offsets[r] + counts[r]])?;
        }
        dst.copy_from_slice(&src[offsets[rank]..offsets[rank] + counts[rank]]);
    } else {
        fabric.recv(root, tag, dst)?;
    }
    Ok(())
}

/// Linear root-addressed gather with per-rank byte counts and offsets
pub(crate) fn gatherv(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    counts: &[usize],
    offsets: &[usize],
    dst: &mut [u8],
    root: usize,
) -> WeftResult<()> {
    let rank = fabric.rank();
    let tag = WireTag::Coll(seq);
    if rank == root {
        for r in 0..fabric.size() {
            if r == rank {
                continue;
            }
            fabric.recv(r, tag, &mut dst[offsets[r]..offsets[r] + counts[r]])?;
        }
        dst[offsets[rank]..offsets[rank] + counts[rank]].copy_from_slice(src);
    } else {
        fabric.send(root, tag, src)?;
    }
    Ok(())
}

/// Issue half of an all-gather: post this rank's contribution to every peer
/// and place it in `dst` at its own offset. Pair with [`all_gather_drain`].
pub(crate) fn all_gather_issue(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    dst: &mut [u8],
) -> WeftResult<()> {
    let rank = fabric.rank();
    let count = src.len();
    let tag = WireTag::Coll(seq);
    for peer in 0..fabric.size() {
        if peer != rank {
            fabric.send(peer, tag, src)?;
        }
    }
    dst[rank * count..(rank + 1) * count].copy_from_slice(src);
    Ok(())
}

/// Drain half of an all-gather: collect every peer's `count`-byte
/// contribution into its slot of `dst`.
pub(crate) fn all_gather_drain(
    fabric: &dyn Fabric,
    seq: u64,
    dst: &mut [u8],
    count: usize,
) -> WeftResult<()> {
    let rank = fabric.rank();
    let tag = WireTag::Coll(seq);
    for peer in 0..fabric.size() {
        if peer == rank {
            continue;
        }
        fabric.recv(peer, tag, &mut dst[peer * count..(peer + 1) * count])?;
    }
    Ok(())
}

/// Direct-exchange all-gather
pub(crate) fn all_gather(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    dst: &mut [u8],
) -> WeftResult<()> {
    all_gather_issue(fabric, seq, src, dst)?;
    all_gather_drain(fabric, seq, dst, src.len())
}

/// Pairwise-exchange all-to-all with `count` bytes per ordered rank pair
pub(crate) fn alltoall(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    dst: &mut [u8],
    count: usize,
) -> WeftResult<()> {
    let rank = fabric.rank();
    let size = fabric.size();
    let tag = WireTag::Coll(seq);
    for peer in 0..size {
        if peer != rank {
            fabric.send(peer, tag, &src[peer * count..(peer + 1) * count])?;
        }
    }
    dst[rank * count..(rank + 1) * count]
        .copy_from_slice(&src[rank * count..(rank + 1) * count]);
    for peer in 0..size {
        if peer != rank {
            fabric.recv(peer, tag, &mut dst[peer * count..(peer + 1) * count])?;
        }
    }
    Ok(())
}

/// Pairwise-exchange all-to-all with per-destination byte counts/offsets
pub(crate) fn alltoallv(
    fabric: &dyn Fabric,
    seq: u64,
    src: &[u8],
    send_counts: &[usize],
    send_offsets: &[usize],
    dst: &mut [u8],
    recv_counts: &[usize],
    recv_offsets: &[usize],
) -> WeftResult<()> {
    let rank = fabric.rank();
    let size = fabric.size();
    let tag = WireTag::Coll(seq);
    for peer in 0..size {
        if peer != rank {
            fabric.send(
                peer,
                tag,
                &src[send_offsets[peer]..send_offsets[peer] + send_counts[peer]],
            )?;
        }
    }
    dst[recv_offsets[rank]..recv_offsets[rank] + recv_counts[rank]]
        .copy_from_slice(&src[send_offsets[rank]..send_offsets[rank] + send_counts[rank]]);
    for peer in 0..size {
        if peer != rank {
            fabric.recv(
                peer,
                tag,
                &mut dst[recv_offsets[peer]..recv_offsets[peer] + recv_counts[peer]],
            )?;
        }
    }
    Ok(())
}

/// Dissemination barrier: after `ceil(log2(size))` token rounds every rank
/// has transitively heard from every other.
pub(crate) fn barrier(fabric: &dyn Fabric, seq: u64) -> WeftResult<()> {
    let size = fabric.size();
    if size == 1 {
        return Ok(());
    }
    let rank = fabric.rank();
    let tag = WireTag::Coll(seq);
    let mut step = 1usize;
    while step < size {
        let to = (rank + step) % size;
        let from = (rank + size - step) % size;
        fabric.send(to, tag, &[])?;
        fabric.recv(from, tag, &mut [])?;
        step <<= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_rotation_round_trips() {
        for size in 1..=8 {
            for root in 0..size {
                for rank in 0..size {
                    let t = transform_rank(rank, root, size);
                    assert_eq!(untransform_rank(t, root, size), rank);
                }
                assert_eq!(transform_rank(root, root, size), 0);
            }
        }
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }
}
