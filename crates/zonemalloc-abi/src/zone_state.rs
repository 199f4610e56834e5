//! Process-wide zone.
//!
//! Every C entry point and [`ZoneAllocator`](crate::ZoneAllocator) shares
//! one [`Zone`], created on first use.
//!
//! Uses manual atomic init instead of `OnceLock`: this runs inside
//! `malloc`, and `OnceLock` may park the thread, which can allocate.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use zonemalloc_core::{SystemPages, Zone, ZoneFlags};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static ZONE_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static ZONE_PTR: AtomicPtr<Zone> = AtomicPtr::new(std::ptr::null_mut());

fn ready_zone() -> Option<&'static Zone> {
    let ptr = ZONE_PTR.load(Ordering::Acquire);
    // SAFETY: only ever set to a zone returned by `Zone::create`, which is
    // never destroyed.
    unsafe { ptr.as_ref() }
}

/// The process zone, creating it if needed.
///
/// Returns `None` if the zone cannot be created (no memory). Threads that
/// race the creating thread spin until it finishes; zone creation itself
/// never allocates, so the creating thread cannot re-enter here.
pub fn try_process_zone() -> Option<&'static Zone> {
    loop {
        match ZONE_STATE.load(Ordering::Acquire) {
            STATE_READY => return ready_zone(),
            STATE_INITIALIZING => std::hint::spin_loop(),
            _ => {
                if ZONE_STATE
                    .compare_exchange(
                        STATE_UNINIT,
                        STATE_INITIALIZING,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }
                let Some(zone) = Zone::create(SystemPages::global(), ZoneFlags::from_env()) else {
                    ZONE_STATE.store(STATE_UNINIT, Ordering::Release);
                    return None;
                };
                ZONE_PTR.store(std::ptr::from_ref(zone).cast_mut(), Ordering::Release);
                ZONE_STATE.store(STATE_READY, Ordering::Release);
                return Some(zone);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_zone_is_created_once() {
        let a = try_process_zone().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| try_process_zone().unwrap().address()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), a.address());
        }
        assert!(a.check());
    }
}
