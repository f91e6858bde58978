extern crate std;

use core::mem::MaybeUninit;
use std::{prelude::v1::*, vec};

use super::*;

#[test]
fn arena_aligns_its_base() {
    let mut pool = vec![MaybeUninit::<u8>::uninit(); 256];
    // Deliberately misalign the start.
    let region = ArenaRegion::new(&mut pool[1..]);
    assert_eq!(region.base.as_ptr() as usize % GRANULARITY, 0);
}

#[test]
fn arena_grows_contiguously_until_spent() {
    let mut pool = vec![MaybeUninit::<u8>::uninit(); 256];
    let mut region = ArenaRegion::new(&mut pool);
    assert!(region.low().is_none());
    assert!(region.high().is_none());

    let a = unsafe { region.grow(64) }.unwrap();
    let b = unsafe { region.grow(128) }.unwrap();
    assert_eq!(unsafe { a.as_ptr().add(64) }, b.as_ptr());
    assert_eq!(region.low().unwrap(), a);
    assert_eq!(region.high().unwrap().as_ptr(), unsafe {
        b.as_ptr().add(128)
    });

    // More than the leftover must be refused, and refusal must not move the
    // cursor.
    assert!(unsafe { region.grow(128) }.is_none());
    let c = unsafe { region.grow(32) }.unwrap();
    assert_eq!(unsafe { b.as_ptr().add(128) }, c.as_ptr());
}

#[cfg(unix)]
#[test]
fn mmap_grows_contiguously_until_spent() {
    let mut region = MmapRegion::new(1 << 16).unwrap();
    assert!(region.low().is_none());

    let a = unsafe { region.grow(1 << 12) }.unwrap();
    assert_eq!(a.as_ptr() as usize % GRANULARITY, 0);
    let b = unsafe { region.grow(1 << 12) }.unwrap();
    assert_eq!(unsafe { a.as_ptr().add(1 << 12) }, b.as_ptr());

    // The fresh bytes must be writable.
    unsafe {
        core::ptr::write_bytes(a.as_ptr(), 0xa5, 1 << 13);
        assert_eq!(*b.as_ptr().add((1 << 12) - 1), 0xa5);
    }

    assert!(unsafe { region.grow(1 << 20) }.is_none());
    assert_eq!(region.low().unwrap(), a);
}
