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

//! Tests for one-sided RMA windows over the local fabric
//!
//! ## Test Categories
//!
//! 1. **Epoch tests** - put/get against the deferred completion model:
//!    puts apply at fence or flush, gets complete at issue
//! 2. **Lifecycle tests** - collective create/free, the null handle, and
//!    the leak detector
//! 3. **View tests** - typed access to the local segment
//!
//! Each SPMD body runs one rank per thread via `local::spmd`; every rank
//! must issue the same collective sequence (create, fence, free) even when
//! only one side moves data.

use weft::fabric::local::{self, LocalConfig};
use weft::{Code, RmaWindow, WindowBuffer};

// ============================================================================
// Epochs: put, get, fence, flush
// ============================================================================

#[test]
fn test_put_fence_makes_data_visible() {
    local::spmd(&LocalConfig::new(2).named("putfence"), |comm| {
        let segment = WindowBuffer::zeroed(8);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.first() {
            win.put(&[42i32], 1, 0)?;
        }
        win.fence()?;

        if comm.last() {
            let data = win.local_data::<i32>()?;
            assert_eq!(data[0], 42, "rank 1 segment not updated by the fence");
        }
        // After the fence any rank reads the value back, not just the target.
        let mut fetched = [0i32];
        win.get(&mut fetched, 1, 0)?;
        assert_eq!(fetched[0], 42, "rank {}: get after fence", comm.rank());
        win.free()?;
        assert!(win.is_null());
        Ok(())
    })
    .unwrap();
    println!("✓ put becomes visible at the fence");
}

#[test]
fn test_put_defers_until_fence() {
    local::spmd(&LocalConfig::new(2).named("deferred"), |comm| {
        let segment = WindowBuffer::from_slice(&[9u8; 4]);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.first() {
            win.put(&[1u8, 1, 1, 1], 1, 0)?;
        }
        // synchronizes the ranks but completes nothing
        comm.barrier()?;
        if comm.last() {
            let data = win.local_data::<u8>()?;
            assert_eq!(&data[..], &[9, 9, 9, 9], "put applied before any epoch closed");
        }
        // holds rank 0 out of its fence until the pre-fence read is done
        comm.barrier()?;
        win.fence()?;
        if comm.last() {
            let data = win.local_data::<u8>()?;
            assert_eq!(&data[..], &[1, 1, 1, 1], "fence did not apply the put");
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ puts stay local until an epoch closes");
}

#[test]
fn test_flush_completes_directed_puts() {
    local::spmd(&LocalConfig::new(3).named("flush"), |comm| {
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.rank() == 0 {
            win.put(&[5i32], 1, 0)?;
            win.put(&[6i32], 2, 0)?;
            // completes only the put addressed to rank 1
            win.flush(1)?;
        }
        comm.barrier()?;
        if comm.rank() == 1 {
            assert_eq!(win.local_data::<i32>()?[0], 5);
        }
        if comm.rank() == 2 {
            assert_eq!(
                win.local_data::<i32>()?[0],
                0,
                "flush(1) must not complete puts to rank 2"
            );
        }
        comm.barrier()?;
        if comm.rank() == 0 {
            win.flush(2)?;
        }
        comm.barrier()?;
        if comm.rank() == 2 {
            assert_eq!(win.local_data::<i32>()?[0], 6);
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ flush completes puts to its target and leaves others queued");
}

#[test]
fn test_get_reads_remote_segment() {
    local::spmd(&LocalConfig::new(2).named("get"), |comm| {
        let seed: Vec<u8> = if comm.first() {
            vec![0; 8]
        } else {
            (10u8..18).collect()
        };
        let segment = WindowBuffer::from_slice(&seed);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.first() {
            let mut fetched = [0u8; 4];
            win.get(&mut fetched, 1, 2)?;
            assert_eq!(fetched, [12, 13, 14, 15]);
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ get reads the target segment at a byte displacement");
}

#[test]
fn test_get_ignores_own_queued_puts() {
    local::spmd(&LocalConfig::new(2).named("unordered"), |comm| {
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;
        if comm.first() {
            win.put(&[9i32], 1, 0)?;
            let mut fetched = [i32::MAX];
            win.get(&mut fetched, 1, 0)?;
            assert_eq!(fetched[0], 0, "get must not observe the queued put");
            win.flush(1)?;
            win.get(&mut fetched, 1, 0)?;
            assert_eq!(fetched[0], 9);
        }
        comm.barrier()?;
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ gets bypass the local put queue");
}

#[test]
fn test_typed_put_at_byte_displacement() {
    local::spmd(&LocalConfig::new(2).named("disp"), |comm| {
        // four i32 slots
        let segment = WindowBuffer::zeroed(16);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.first() {
            win.put(&[-3i32], 1, 8)?;
        }
        win.fence()?;
        if comm.last() {
            let data = win.local_data::<i32>()?;
            assert_eq!(&data[..], &[0, 0, -3, 0], "displacement is in bytes, not elements");
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ displacements address bytes");
}

#[test]
fn test_put_to_own_segment() {
    local::spmd(&LocalConfig::new(2).named("selfput"), |comm| {
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;
        let rank = comm.rank() as i32;
        win.put(&[rank + 1], comm.rank(), 0)?;
        win.fence()?;
        assert_eq!(win.local_data::<i32>()?[0], rank + 1);
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ a rank can put into its own segment");
}

#[test]
fn test_put_checks_bounds_at_issue() {
    local::spmd(&LocalConfig::new(2).named("bounds"), |comm| {
        let len = if comm.first() { 16 } else { 8 };
        let segment = WindowBuffer::zeroed(len);
        let mut win = RmaWindow::create(&comm, &segment)?;

        if comm.first() {
            // rank 1 exposes 8 bytes; 12 cannot fit
            let err = win.put(&[0u8; 12], 1, 0).unwrap_err();
            assert_eq!(err.code(), Code::Contract);
            assert!(err.to_string().contains("8 B segment"), "got: {err}");
            // a displacement past the end fails even for small data
            assert!(win.put(&[0u8; 4], 1, 6).is_err());
            assert!(win.get(&mut [0u8; 4], 1, 6).is_err());
            // the full extent is fine
            win.put(&[0u8; 8], 1, 0)?;
            win.flush(1)?;
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ rma bounds are enforced against the target extent at issue");
}

#[test]
fn test_zero_extent_segments() {
    local::spmd(&LocalConfig::new(2).named("empty-seg"), |comm| {
        // rank 1 exposes nothing
        let segment = if comm.first() {
            WindowBuffer::zeroed(8)
        } else {
            WindowBuffer::zeroed(0)
        };
        let mut win = RmaWindow::create(&comm, &segment)?;
        if comm.first() {
            assert!(win.put(&[1u8], 1, 0).is_err(), "no byte fits a zero segment");
            // zero bytes at displacement zero is legal
            win.put(&[0u8; 0], 1, 0)?;
        } else {
            assert!(win.local_data::<u8>()?.is_empty());
        }
        win.fence()?;
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ zero-extent segments participate in the window");
}

// ============================================================================
// Lifecycle: null handles, free, leak detection
// ============================================================================

#[test]
fn test_null_window_and_set_null() {
    local::spmd(&LocalConfig::new(2).named("null"), |comm| {
        let null = RmaWindow::default();
        assert!(null.is_null());
        // the one null-tolerant operation, and it is not collective
        null.fence()?;
        assert!(null.put(&[0u8], 0, 0).is_err());
        assert!(null.get(&mut [0u8], 0, 0).is_err());
        assert!(null.flush(0).is_err());
        assert!(null.local_data::<u8>().is_err());

        // set_null detaches the handle but leaves the segment registered,
        // so the peer's one-sided traffic still lands
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;
        if comm.last() {
            win.set_null();
            assert!(win.is_null());
        }
        if comm.first() {
            win.put(&[77i32], 1, 0)?;
            win.flush(1)?;
            win.set_null();
        }
        comm.barrier()?;
        if comm.last() {
            assert_eq!(&segment.as_slice()[..4], &77i32.to_ne_bytes());
        }
        Ok(())
    })
    .unwrap();
    println!("✓ null handles reject data operations; set_null detaches without freeing");
}

#[test]
fn test_free_nulls_the_handle() {
    local::spmd(&LocalConfig::new(2).named("freecycle"), |comm| {
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;
        assert!(!win.is_null());
        win.free()?;
        assert!(win.is_null());
        assert!(win.put(&[0u8], 0, 0).is_err());
        assert!(win.free().is_err(), "double free must fail");
        // still a no-op on the nulled handle
        win.fence()?;
        Ok(())
    })
    .unwrap();
    println!("✓ free tears down collectively and nulls the handle");
}

#[test]
fn test_free_refuses_unflushed_puts() {
    local::spmd(&LocalConfig::new(2).named("dirtyfree"), |comm| {
        let segment = WindowBuffer::zeroed(4);
        let mut win = RmaWindow::create(&comm, &segment)?;
        if comm.first() {
            win.put(&[1u32], 1, 0)?;
            let err = win.free().unwrap_err();
            assert_eq!(err.code(), Code::Contract);
            assert!(err.to_string().contains("unflushed"), "got: {err}");
        }
        // applies the put; both ranks are clean afterwards
        win.fence()?;
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ free refuses to drop queued puts");
}

#[test]
fn test_windows_are_independent() {
    local::spmd(&LocalConfig::new(2).named("twowin"), |comm| {
        let seg_a = WindowBuffer::zeroed(4);
        let seg_b = WindowBuffer::from_slice(&[1, 2, 3, 4]);
        let mut win_a = RmaWindow::create(&comm, &seg_a)?;
        let mut win_b = RmaWindow::create(&comm, &seg_b)?;

        if comm.first() {
            win_a.put(&[0xAAu8], 1, 0)?;
        }
        win_a.fence()?;
        if comm.last() {
            assert_eq!(win_a.local_data::<u8>()?[0], 0xAA);
            assert_eq!(
                &win_b.local_data::<u8>()?[..],
                &[1, 2, 3, 4],
                "sibling window touched"
            );
        }
        win_b.free()?;
        win_a.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ windows on the same group do not interfere");
}

#[test]
fn test_window_outlives_caller_communicators() {
    let group = LocalConfig::new(2).named("outlive").build().unwrap();
    std::thread::scope(|s| {
        for comm in group {
            s.spawn(move || {
                let rank = comm.rank();
                let segment = WindowBuffer::zeroed(4);
                let mut win = RmaWindow::create(&comm, &segment).unwrap();
                // the window keeps the group alive on its own
                drop(comm);
                if rank == 0 {
                    win.put(&[8i32], 1, 0).unwrap();
                }
                win.fence().unwrap();
                if rank == 1 {
                    assert_eq!(win.local_data::<i32>().unwrap()[0], 8);
                }
                win.free().unwrap();
            });
        }
    });
    println!("✓ a live window keeps its group usable after the caller drops it");
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "dropped without free")]
fn test_leak_detector_panics_in_debug() {
    let group = LocalConfig::new(1).named("leak").build().unwrap();
    let segment = WindowBuffer::zeroed(4);
    let _win = RmaWindow::create(&group[0], &segment).unwrap();
    // dropped live at the end of scope
}

#[test]
fn test_poisoned_segment_reports_fatal() {
    local::spmd(&LocalConfig::new(1).named("poisoned"), |comm| {
        let segment = WindowBuffer::zeroed(8);
        let mut win = RmaWindow::create(&comm, &segment)?;
        // a holder dying mid-update poisons the segment lock
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _hold = segment.as_mut_slice();
            panic!("holder dies with the write guard");
        }));
        let err = win.local_data::<u32>().unwrap_err();
        assert_eq!(err.code(), Code::Fatal);
        assert!(err.to_string().contains("poisoned"), "got: {err}");
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ a poisoned segment surfaces as a fatal error, not a panic");
}

// ============================================================================
// Typed views of the local segment
// ============================================================================

#[test]
fn test_local_data_type_misfit() {
    local::spmd(&LocalConfig::new(1).named("misfit"), |comm| {
        let segment = WindowBuffer::zeroed(6);
        let mut win = RmaWindow::create(&comm, &segment)?;
        let err = win.local_data::<u64>().unwrap_err();
        assert_eq!(err.code(), Code::Contract);
        // the same bytes view fine as three u16
        let shown = format!("{:?}", win.local_data::<u16>()?);
        assert_eq!(shown, "LocalData { elems: 3 }");
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ typed views require a whole number of elements");
}

#[test]
fn test_local_data_mut_is_remotely_visible() {
    local::spmd(&LocalConfig::new(2).named("localmut"), |comm| {
        let segment = WindowBuffer::zeroed(8);
        let mut win = RmaWindow::create(&comm, &segment)?;
        if comm.last() {
            win.local_data_mut::<u32>()?.copy_from_slice(&[11, 22]);
        }
        comm.barrier()?;
        if comm.first() {
            let mut fetched = [0u32; 2];
            win.get(&mut fetched, 1, 0)?;
            assert_eq!(fetched, [11, 22]);
        }
        win.free()?;
        Ok(())
    })
    .unwrap();
    println!("✓ writes through the local view are visible to remote gets");
}
