use std::collections::BTreeMap;
use std::ffi::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use zonemalloc_abi::malloc_abi::{
    aligned_alloc, calloc, free, malloc, malloc_usable_size, posix_memalign, realloc, valloc,
};
use zonemalloc_abi::vtable::{KERN_INVALID_ADDRESS, KERN_SUCCESS};
use zonemalloc_abi::{MallocStatistics, MallocZone, zonemalloc_create_zone};
use zonemalloc_core::VmRange;

#[derive(Default)]
struct Collected {
    by_type: BTreeMap<c_uint, Vec<VmRange>>,
    batches: usize,
}

unsafe extern "C" fn collect(
    _task: *mut c_void,
    context: *mut c_void,
    type_mask: c_uint,
    ranges: *mut VmRange,
    count: c_uint,
) {
    let collected = unsafe { &mut *context.cast::<Collected>() };
    let ranges = unsafe { std::slice::from_raw_parts(ranges, count as usize) };
    collected.batches += 1;
    collected.by_type.entry(type_mask).or_default().extend_from_slice(ranges);
}

unsafe extern "C" fn counting_reader(
    task: *mut c_void,
    address: usize,
    _size: usize,
    local: *mut *mut c_void,
) -> c_int {
    unsafe {
        (*task.cast::<AtomicUsize>()).fetch_add(1, Ordering::Relaxed);
        *local = address as *mut c_void;
    }
    KERN_SUCCESS
}

unsafe extern "C" fn failing_reader(
    _task: *mut c_void,
    _address: usize,
    _size: usize,
    _local: *mut *mut c_void,
) -> c_int {
    KERN_INVALID_ADDRESS
}

fn in_use_map(collected: &Collected) -> BTreeMap<usize, usize> {
    collected
        .by_type
        .get(&1)
        .map(|v| v.iter().map(|r| (r.address, r.size)).collect())
        .unwrap_or_default()
}

fn statistics(z: *mut MallocZone) -> MallocStatistics {
    let mut stats = MallocStatistics::default();
    unsafe { ((*(*z).introspect).statistics)(z, &mut stats) };
    stats
}

#[test]
fn basic_table_round_trip() {
    let z = zonemalloc_create_zone(0, 0);
    assert!(!z.is_null());
    unsafe {
        assert_eq!(
            std::ffi::CStr::from_ptr((*z).zone_name).to_str().unwrap(),
            "zonemalloc"
        );
        // The table itself is one block of the zone.
        let base = statistics(z);
        assert_eq!(base.blocks_in_use, 1);

        let a = ((*z).malloc)(z, 40);
        let b = ((*z).calloc)(z, 10, 100);
        let c = ((*z).valloc)(z, 10);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert!(std::slice::from_raw_parts(b.cast::<u8>(), 1000).iter().all(|&x| x == 0));
        assert_eq!(c as usize % 4096, 0);
        assert!(((*z).size)(z, a) >= 40);

        a.cast::<u8>().write_bytes(7, 40);
        let a2 = ((*z).realloc)(z, a, 5000);
        assert!(!a2.is_null());
        assert!(std::slice::from_raw_parts(a2.cast::<u8>(), 40).iter().all(|&x| x == 7));

        let m = ((*z).memalign)(z, 256, 700);
        assert_eq!(m as usize % 256, 0);

        assert_eq!(statistics(z).blocks_in_use, 5);
        assert!(((*(*z).introspect).good_size)(z, 1) >= 1);
        assert_eq!(((*(*z).introspect).check)(z), 1);

        ((*z).free)(z, a2);
        ((*z).free_definite_size)(z, b, 1000);
        ((*z).free)(z, c);
        ((*z).free)(z, m);
        assert_eq!(statistics(z).blocks_in_use, 1);
        ((*z).destroy)(z);
    }
}

#[test]
fn batch_entry_points() {
    let z = zonemalloc_create_zone(0, 0);
    unsafe {
        let mut out = [std::ptr::null_mut::<c_void>(); 16];
        // Fresh zone: the exact-size list is empty.
        assert_eq!(((*z).batch_malloc)(z, 64, out.as_mut_ptr(), 16), 0);

        let mut fences = Vec::new();
        let mut pool = Vec::new();
        for _ in 0..8 {
            pool.push(((*z).malloc)(z, 64));
            fences.push(((*z).malloc)(z, 64));
        }
        // Fill the cache first so the rest reach the free lists.
        for p in &pool {
            ((*z).free)(z, *p);
        }
        let got = ((*z).batch_malloc)(z, 64, out.as_mut_ptr(), 16);
        assert!(got >= 1 && got <= 7);
        for p in &out[..got as usize] {
            assert!(!p.is_null());
            assert!(((*z).size)(z, *p) >= 64);
        }
        ((*z).batch_free)(z, out.as_mut_ptr(), got);
        assert!(out[..got as usize].iter().all(|p| p.is_null()));
        ((*z).batch_free)(z, fences.as_mut_ptr(), fences.len() as c_uint);
        assert_eq!(((*(*z).introspect).check)(z), 1);
        ((*z).destroy)(z);
    }
}

#[test]
fn enumerator_reports_live_blocks_through_callbacks() {
    let z = zonemalloc_create_zone(0, 0);
    unsafe {
        let blocks: Vec<_> = [24usize, 900, 3000, 70_000]
            .iter()
            .map(|&n| ((*z).malloc)(z, n))
            .collect();
        let introspect = &*(*z).introspect;

        let reads = AtomicUsize::new(0);
        let mut collected = Collected::default();
        let rc = (introspect.enumerator)(
            std::ptr::from_ref(&reads).cast_mut().cast(),
            std::ptr::from_mut(&mut collected).cast(),
            7,
            z as usize,
            Some(counting_reader),
            Some(collect),
        );
        assert_eq!(rc, KERN_SUCCESS);
        assert!(reads.load(Ordering::Relaxed) > 0);
        let in_use = in_use_map(&collected);
        for p in &blocks {
            assert_eq!(in_use.get(&(*p as usize)), Some(&((*z).size)(z, *p)));
        }
        // Plus the table block itself.
        assert_eq!(in_use.len(), blocks.len() + 1);
        assert!(collected.by_type.contains_key(&2));
        assert!(collected.by_type.contains_key(&4));

        // A null reader means the zone is local; only in-use ranges asked for.
        let mut local = Collected::default();
        let rc = (introspect.enumerator)(
            std::ptr::null_mut(),
            std::ptr::from_mut(&mut local).cast(),
            1,
            z as usize,
            None,
            Some(collect),
        );
        assert_eq!(rc, KERN_SUCCESS);
        assert_eq!(local.by_type.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(in_use_map(&local), in_use);

        let mut none = Collected::default();
        let rc = (introspect.enumerator)(
            std::ptr::null_mut(),
            std::ptr::from_mut(&mut none).cast(),
            7,
            z as usize,
            Some(failing_reader),
            Some(collect),
        );
        assert_eq!(rc, KERN_INVALID_ADDRESS);
        assert_eq!(none.batches, 0);

        for p in blocks {
            ((*z).free)(z, p);
        }
        ((*z).destroy)(z);
    }
}

#[test]
fn lock_log_and_print_entry_points() {
    let z = zonemalloc_create_zone(0, 0);
    unsafe {
        let introspect = &*(*z).introspect;
        (introspect.force_lock)(z);
        (introspect.force_unlock)(z);

        let p = ((*z).malloc)(z, 2000);
        (introspect.log)(z, p);
        ((*z).free)(z, p);
        (introspect.log)(z, std::ptr::null_mut());
        (introspect.print)(z, 1);
        (introspect.statistics)(z, std::ptr::null_mut());
        ((*z).destroy)(z);
    }
}

#[test]
fn c_entry_points_use_the_process_zone() {
    unsafe {
        let p = malloc(100);
        assert!(!p.is_null());
        assert!(malloc_usable_size(p) >= 100);
        assert_eq!(malloc_usable_size(std::ptr::null_mut()), 0);

        let q = realloc(p, 10_000);
        assert!(!q.is_null());
        assert!(malloc_usable_size(q) >= 10_000);
        assert!(realloc(q, 0).is_null());

        assert!(calloc(usize::MAX, 2).is_null());
        let z = calloc(4, 8);
        assert!(std::slice::from_raw_parts(z.cast::<u8>(), 32).iter().all(|&b| b == 0));
        free(z);

        let v = valloc(1);
        assert_eq!(v as usize % 4096, 0);
        free(v);

        let a = aligned_alloc(128, 300);
        assert_eq!(a as usize % 128, 0);
        free(a);

        let mut out = std::ptr::null_mut();
        assert_eq!(posix_memalign(&mut out, 3, 64), libc::EINVAL);
        assert!(out.is_null());
        assert_eq!(posix_memalign(&mut out, 64, 64), 0);
        assert_eq!(out as usize % 64, 0);
        free(out);

        free(std::ptr::null_mut());
    }
}
