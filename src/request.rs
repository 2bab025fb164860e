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

//! Pending non-blocking operations
//!
//! `isend`, `irecv`, and `i_all_gather` hand back a [`Request`] that borrows
//! the transfer buffer, so the borrow checker enforces what the contract
//! demands: no mutation of a send buffer and no read of a receive buffer
//! until the request has been waited. Completion is observed only through
//! [`Request::wait`].

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::error::WeftResult;
use crate::fabric::{coll, Fabric, WireTag};

/// Handle to one in-flight non-blocking operation.
///
/// Requests may be waited in any order relative to issue order. Dropping a
/// request that still has pending receives leaves the matching messages
/// queued and logs a warning; it never blocks.
#[must_use = "a request does nothing until waited"]
pub struct Request<'buf> {
    state: State<'buf>,
}

enum State<'buf> {
    /// Payload already deposited with the fabric; complete on construction
    Sent,
    /// Blocking tag-matched receive, deferred to `wait`
    Recv {
        fabric: Arc<dyn Fabric>,
        src: usize,
        tag: WireTag,
        buf: &'buf mut [u8],
    },
    /// All-gather with its sends issued; peer contributions drain at `wait`
    AllGather {
        fabric: Arc<dyn Fabric>,
        seq: u64,
        dst: &'buf mut [u8],
        count: usize,
    },
    Done,
}

impl<'buf> Request<'buf> {
    pub(crate) fn completed() -> Self {
        Self { state: State::Sent }
    }

    pub(crate) fn recv(fabric: Arc<dyn Fabric>, src: usize, tag: WireTag, buf: &'buf mut [u8]) -> Self {
        Self {
            state: State::Recv {
                fabric,
                src,
                tag,
                buf,
            },
        }
    }

    pub(crate) fn all_gather(fabric: Arc<dyn Fabric>, seq: u64, dst: &'buf mut [u8], count: usize) -> Self {
        Self {
            state: State::AllGather {
                fabric,
                seq,
                dst,
                count,
            },
        }
    }

    /// Block until the operation completes, releasing the buffer borrow
    pub fn wait(mut self) -> WeftResult<()> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Sent | State::Done => Ok(()),
            State::Recv {
                fabric,
                src,
                tag,
                buf,
            } => fabric.recv(src, tag, buf),
            State::AllGather {
                fabric,
                seq,
                dst,
                count,
            } => coll::all_gather_drain(fabric.as_ref(), seq, dst, count),
        }
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Sent => "sent",
            State::Recv { .. } => "recv",
            State::AllGather { .. } => "all_gather",
            State::Done => "done",
        };
        f.debug_struct("Request").field("state", &state).finish()
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        match &self.state {
            State::Sent | State::Done => {}
            State::Recv { fabric, src, .. } => warn!(
                "'{}' rank {}: receive request dropped without wait; message from rank {} stays queued",
                fabric.name(),
                fabric.rank(),
                src
            ),
            State::AllGather { fabric, .. } => warn!(
                "'{}' rank {}: all-gather request dropped without wait; {} contribution(s) stay queued",
                fabric.name(),
                fabric.rank(),
                fabric.size() - 1
            ),
        }
    }
}
