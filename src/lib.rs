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

//! Weft: a process-rank communication substrate
//!
//! Weft gives a fixed group of ranks the classic SPMD toolkit: rooted and
//! symmetric collectives (`bcast`, `scatter`/`gather` and their irregular
//! `v` forms, `all_gather`, `alltoall`), tagged non-blocking point-to-point
//! messaging, and one-sided RMA windows with explicit completion epochs.
//! The transport behind a group is a [`Fabric`] implementation; the
//! built-in local fabric runs every rank as a thread of one process, which
//! is how the whole crate is tested.
//!
//! ```
//! use weft::fabric::local::{self, LocalConfig};
//!
//! let totals = local::spmd(&LocalConfig::new(3), |comm| {
//!     let mine = [comm.rank() as u32];
//!     let mut all = [0u32; 3];
//!     comm.all_gather(&mine, &mut all)?;
//!     Ok(all.iter().sum::<u32>())
//! })
//! .unwrap();
//! assert_eq!(totals, vec![3, 3, 3]);
//! ```

pub mod comm;
pub mod error;
pub mod fabric;
pub mod request;
pub mod util;
pub mod window;

// Re-export commonly used types
pub use crate::comm::Communicator;
pub use crate::error::{Code, WeftError, WeftResult};
pub use crate::fabric::local::LocalConfig;
pub use crate::fabric::{Fabric, Tag, WinId};
pub use crate::request::Request;
pub use crate::window::{RmaWindow, WindowBuffer};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
