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

//! One-sided RMA windows over caller-owned segments
//!
//! A window pairs every rank of a group with a byte segment that the other
//! ranks can address directly. `put` completes locally at issue (the data
//! is captured) and becomes visible at the target under the next [`fence`]
//! or a directed [`flush`]; `get` completes before returning and reads
//! whatever the target segment holds at that moment, unordered with this
//! rank's own unflushed puts.
//!
//! [`fence`]: RmaWindow::fence
//! [`flush`]: RmaWindow::flush

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;
use log::{error, warn};

use crate::comm::Communicator;
use crate::error::{WeftError, WeftResult};
use crate::fabric::WinId;

// =============================================================================
// WindowBuffer
// =============================================================================

/// Shared byte segment backing one rank's side of a window.
///
/// Handles are cheap to clone and all refer to the same storage, so a rank
/// can keep one for direct access to its own segment after handing one to
/// [`RmaWindow::create`]. Storage is word-backed, which keeps typed views
/// of element types up to 8-byte alignment valid at displacement 0.
#[derive(Clone)]
pub struct WindowBuffer {
    words: Arc<RwLock<Vec<u64>>>,
    len: usize,
}

impl WindowBuffer {
    /// Zero-filled segment of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: Arc::new(RwLock::new(vec![0u64; (len + 7) / 8])),
            len,
        }
    }

    /// Segment initialized from `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        let buf = Self::zeroed(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    /// Extent in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read view of the segment bytes, held under the segment lock.
    /// Panics if a previous holder poisoned the lock by panicking.
    pub fn as_slice(&self) -> WindowSlice<'_> {
        WindowSlice {
            guard: self.words.read().unwrap(),
            len: self.len,
        }
    }

    /// Write view of the segment bytes, held under the segment lock.
    /// Panics if a previous holder poisoned the lock by panicking.
    pub fn as_mut_slice(&self) -> WindowSliceMut<'_> {
        WindowSliceMut {
            guard: self.words.write().unwrap(),
            len: self.len,
        }
    }
}

/// Read guard over a segment's bytes
pub struct WindowSlice<'a> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
}

impl Deref for WindowSlice<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        &bytes[..self.len]
    }
}

/// Write guard over a segment's bytes
pub struct WindowSliceMut<'a> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
}

impl Deref for WindowSliceMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        &bytes[..self.len]
    }
}

impl DerefMut for WindowSliceMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.guard.as_mut_slice());
        &mut bytes[..self.len]
    }
}

/// Typed read view of a window's local segment
pub struct LocalData<'a, T> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Pod> Deref for LocalData<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        bytemuck::cast_slice(&bytes[..self.len])
    }
}

/// Typed write view of a window's local segment
pub struct LocalDataMut<'a, T> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Pod> Deref for LocalDataMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        bytemuck::cast_slice(&bytes[..self.len])
    }
}

impl<T: Pod> DerefMut for LocalDataMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.guard.as_mut_slice());
        bytemuck::cast_slice_mut(&mut bytes[..self.len])
    }
}

impl<T: Pod> fmt::Debug for LocalData<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalData")
            .field("elems", &self.len())
            .finish()
    }
}

impl<T: Pod> fmt::Debug for LocalDataMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDataMut")
            .field("elems", &self.len())
            .finish()
    }
}

fn poisoned(what: &str) -> WeftError {
    WeftError::Fatal(format!("{what} lock poisoned; a rank aborted mid-operation"))
}

/// A typed view exists only when the byte extent is a whole number of
/// properly aligned elements; checked once, before a guard is handed out.
fn check_view<T: Pod>(rank: usize, words: &[u64], len: usize) -> WeftResult<()> {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    match bytemuck::try_cast_slice::<u8, T>(&bytes[..len]) {
        Ok(_) => Ok(()),
        Err(err) => Err(WeftError::contract(
            rank,
            format!(
                "segment of {len} B does not view as [{}]: {err}",
                std::any::type_name::<T>()
            ),
        )),
    }
}

// =============================================================================
// RmaWindow
// =============================================================================

/// One-sided window over a group of ranks.
///
/// A handle is either *live* (collectively created, one registered segment
/// per rank) or *null* (the default). Data operations on a null handle are
/// contract violations, except [`RmaWindow::fence`], which is a no-op, so
/// null handles can sit in containers beside live ones.
pub struct RmaWindow {
    inner: Option<LiveWindow>,
}

struct LiveWindow {
    comm: Communicator,
    id: WinId,
    buffer: WindowBuffer,
    pending: Mutex<Vec<PendingPut>>,
}

/// A put captured at issue, addressed but not yet applied
struct PendingPut {
    target: usize,
    disp: usize,
    bytes: Vec<u8>,
}

impl Default for RmaWindow {
    fn default() -> Self {
        Self::null()
    }
}

impl RmaWindow {
    /// Detached handle; every data operation on it fails until a live
    /// window is assigned over it
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Collectively create a window exposing `buffer` as this rank's
    /// segment. Every rank of `comm` must call with its own segment, and
    /// no rank returns before all segments are registered. Segments may
    /// differ in extent; zero-byte segments are allowed.
    ///
    /// The group handle is retained inside the window, so the window stays
    /// usable even after the caller drops every clone of `comm`.
    pub fn create(comm: &Communicator, buffer: &WindowBuffer) -> WeftResult<RmaWindow> {
        let id = comm.fabric().win_create(buffer.clone())?;
        let win = RmaWindow {
            inner: Some(LiveWindow {
                comm: comm.clone(),
                id,
                buffer: buffer.clone(),
                pending: Mutex::new(Vec::new()),
            }),
        };
        comm.barrier()?;
        Ok(win)
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Detach the handle without freeing. If the window was live its
    /// segment stays registered with the group; only [`RmaWindow::free`]
    /// withdraws it.
    pub fn set_null(&mut self) {
        if let Some(live) = self.inner.take() {
            warn!(
                "'{}' rank {}: window {} handle nulled while live, segment stays registered",
                live.comm.fabric().name(),
                live.rank(),
                live.id.0
            );
        }
    }

    /// Typed read view of this rank's own segment
    pub fn local_data<T: Pod>(&self) -> WeftResult<LocalData<'_, T>> {
        let live = self.live("local_data")?;
        let guard = live
            .buffer
            .words
            .read()
            .map_err(|_| poisoned("window segment"))?;
        check_view::<T>(live.rank(), guard.as_slice(), live.buffer.len)?;
        Ok(LocalData {
            guard,
            len: live.buffer.len,
            _elem: PhantomData,
        })
    }

    /// Typed write view of this rank's own segment
    pub fn local_data_mut<T: Pod>(&self) -> WeftResult<LocalDataMut<'_, T>> {
        let live = self.live("local_data_mut")?;
        let guard = live
            .buffer
            .words
            .write()
            .map_err(|_| poisoned("window segment"))?;
        check_view::<T>(live.rank(), guard.as_slice(), live.buffer.len)?;
        Ok(LocalDataMut {
            guard,
            len: live.buffer.len,
            _elem: PhantomData,
        })
    }

    /// Queue `src` for delivery into `target`'s segment at byte
    /// displacement `disp`. Completes locally before returning; the data
    /// reaches the target under the next [`RmaWindow::fence`] or a
    /// [`RmaWindow::flush`] addressed to it. Bounds against the target
    /// segment are checked here, at issue.
    pub fn put<T: Pod>(&self, src: &[T], target: usize, disp: usize) -> WeftResult<()> {
        let live = self.live("put")?;
        live.check_target(target)?;
        let bytes: &[u8] = bytemuck::cast_slice(src);
        live.check_span("put", target, disp, bytes.len())?;
        let mut pending = live
            .pending
            .lock()
            .map_err(|_| poisoned("pending-put queue"))?;
        pending.push(PendingPut {
            target,
            disp,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Read `dst.len()` elements from `target`'s segment at byte
    /// displacement `disp`. Completes before returning with whatever the
    /// segment holds at that moment; this rank's own unflushed puts are
    /// not reflected.
    pub fn get<T: Pod>(&self, dst: &mut [T], target: usize, disp: usize) -> WeftResult<()> {
        let live = self.live("get")?;
        live.check_target(target)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        live.check_span("get", target, disp, bytes.len())?;
        live.comm.fabric().win_get(live.id, target, disp, bytes)
    }

    /// Apply every queued put and synchronize the group. On return, all
    /// puts issued by all ranks before their fence are visible in the
    /// target segments. A no-op on a null handle.
    pub fn fence(&self) -> WeftResult<()> {
        let live = match &self.inner {
            Some(live) => live,
            None => return Ok(()),
        };
        live.drain(None)?;
        live.comm.barrier()
    }

    /// Apply the queued puts addressed to `target`, in issue order. Not
    /// collective; on return those puts are visible in `target`'s segment.
    /// Puts addressed elsewhere stay queued.
    pub fn flush(&self, target: usize) -> WeftResult<()> {
        let live = self.live("flush")?;
        live.check_target(target)?;
        live.drain(Some(target))
    }

    /// Collectively tear the window down and null the handle. Fails on
    /// unflushed puts rather than dropping them.
    pub fn free(&mut self) -> WeftResult<()> {
        {
            let live = self.live("free")?;
            let queued = live
                .pending
                .lock()
                .map_err(|_| poisoned("pending-put queue"))?
                .len();
            if queued != 0 {
                return Err(WeftError::contract(
                    live.rank(),
                    format!("free with {queued} unflushed put(s) queued, fence or flush first"),
                ));
            }
            live.comm.barrier()?;
            live.comm.fabric().win_free(live.id)?;
        }
        self.inner = None;
        Ok(())
    }

    fn live(&self, op: &str) -> WeftResult<&LiveWindow> {
        self.inner
            .as_ref()
            .ok_or_else(|| WeftError::NullWindow(op.to_string()))
    }
}

impl LiveWindow {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn check_target(&self, target: usize) -> WeftResult<()> {
        if target < self.comm.size() {
            Ok(())
        } else {
            Err(WeftError::contract(
                self.rank(),
                format!(
                    "target rank {target} out of range for group of {}",
                    self.comm.size()
                ),
            ))
        }
    }

    fn check_span(&self, op: &str, target: usize, disp: usize, len: usize) -> WeftResult<()> {
        let extent = self.comm.fabric().win_extent(self.id, target)?;
        match disp.checked_add(len).filter(|&end| end <= extent) {
            Some(_) => Ok(()),
            None => Err(WeftError::contract(
                self.rank(),
                format!(
                    "{op} of {len} B at displacement {disp} exceeds rank {target}'s {extent} B segment"
                ),
            )),
        }
    }

    /// Apply queued puts in issue order; `target` restricts to one rank
    fn drain(&self, target: Option<usize>) -> WeftResult<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| poisoned("pending-put queue"))?;
        let mut kept = Vec::new();
        for put in pending.drain(..) {
            if target.map_or(true, |t| put.target == t) {
                self.comm
                    .fabric()
                    .win_put(self.id, put.target, put.disp, &put.bytes)?;
            } else {
                kept.push(put);
            }
        }
        *pending = kept;
        Ok(())
    }
}

impl Drop for RmaWindow {
    fn drop(&mut self) {
        if let Some(live) = self.inner.take() {
            if std::thread::panicking() {
                error!(
                    "'{}' rank {}: window {} leaked during panic unwind",
                    live.comm.fabric().name(),
                    live.rank(),
                    live.id.0
                );
            } else if cfg!(debug_assertions) {
                panic!("rank {}: window {} dropped without free", live.rank(), live.id.0);
            } else {
                error!(
                    "'{}' rank {}: window {} dropped without free, segment leaked",
                    live.comm.fabric().name(),
                    live.rank(),
                    live.id.0
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_round_trips_bytes() {
        let buf = WindowBuffer::from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.len(), 5);
        assert_eq!(&*buf.as_slice(), &[1, 2, 3, 4, 5]);

        buf.as_mut_slice()[4] = 9;
        assert_eq!(&*buf.as_slice(), &[1, 2, 3, 4, 9]);
    }

    #[test]
    fn buffer_clones_share_storage() {
        let a = WindowBuffer::zeroed(4);
        let b = a.clone();
        b.as_mut_slice().copy_from_slice(&[7, 7, 7, 7]);
        assert_eq!(&*a.as_slice(), &[7, 7, 7, 7]);
    }

    #[test]
    fn zero_length_buffer() {
        let buf = WindowBuffer::zeroed(0);
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn null_window_reports_data_ops() {
        let win = RmaWindow::null();
        assert!(win.is_null());
        assert!(win.local_data::<u8>().is_err());
        assert!(win.put(&[0u8; 1], 0, 0).is_err());
        assert!(win.flush(0).is_err());
        // fence is the one null-tolerant operation
        win.fence().unwrap();
    }
}
