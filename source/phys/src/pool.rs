//! Packet pool
//!
//! A specialized pool allocator for wire-frame-sized buffers. It is
//! optimized and opinionated for the following cases:
//!
//! * Fixed-size slots, each large enough for one complete frame
//!   (16 byte header plus up to 236 payload bytes), 4-byte aligned
//! * Use on targets that may not have CAS atomics, so only `load`
//!   and `store` are used for synchronization
//!
//! This allows for the creation of [`PacketBox`] allocations, that can
//! only be allocated with exclusive access to a [`RawPacketSlice`], but
//! can be deallocated by dropping (just like a Box from the standard
//! library), and do not require any kind of mutex at the time of drop.

use core::{
    ops::{Deref, DerefMut},
    ptr::{addr_of, addr_of_mut, NonNull},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    unreachable,
};
use grounded::{const_init::ConstInit, uninit::GroundedArrayCell};

use crate::packet::{FRAME_BYTES, HEADER_BYTES};

/// Storage for exactly N packet slots
pub struct PacketStorage<const N: usize> {
    slots: GroundedArrayCell<RawPacket, N>,
    once: AtomicBool,
}

impl<const N: usize> PacketStorage<N> {
    /// Create a new packet storage buffer
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        Self {
            slots: GroundedArrayCell::const_init(),
            once: AtomicBool::new(false),
        }
    }

    /// Attempt to take the storage as a [RawPacketSlice]
    ///
    /// The first call will return Some, all later calls will
    /// return None. Uses a [critical section][critical_section::with]
    /// to ensure it only works once, even on targets without atomics
    pub fn take(&'static self) -> Option<RawPacketSlice> {
        self.take_cell()
            .map(|s| unsafe { RawPacketSlice::from_static(s) })
    }

    fn take_cell(&'static self) -> Option<&'static GroundedArrayCell<RawPacket, N>> {
        critical_section::with(|_| {
            let old = self.once.load(Ordering::Acquire);
            self.once.store(true, Ordering::Release);
            !old
        })
        .then_some(&self.slots)
    }
}

/// The Rules:
///
/// `freelen` serves two functions:
///
/// * When NOT allocated, it must always be zero.
/// * When allocated, it represents the live wire length of the frame,
///   which is never less than the header size, so it must ALWAYS be
///   NONZERO.
///
/// ONLY the RawPacketSlice is allowed to make the zero -> nonzero
/// transition, when the freelen is nonzero, it MUST NOT read or write
/// the data field, nor write to freelen.
///
/// ONLY the PacketBox is allowed to make the nonzero -> zero transition.
/// Setting freelen to zero represents giving up exclusive access to the
/// contents of the data field.
#[repr(C, align(4))]
pub(crate) struct RawPacket {
    data: [u8; FRAME_BYTES],
    freelen: AtomicU8,
}

/// An allocated packet slot
///
/// Stores one wire frame of `16..=252` bytes. Storage can be accessed
/// through the [Deref] and [DerefMut] traits; the view covers exactly
/// the current wire length.
pub struct PacketBox {
    ptr: NonNull<RawPacket>,
}

unsafe impl Send for PacketBox {}

impl PacketBox {
    unsafe fn freelen_ref(&self) -> &AtomicU8 {
        let fl_ptr = addr_of!((*self.ptr.as_ptr()).freelen);
        &*fl_ptr
    }

    /// Sets the wire length of the storage.
    ///
    /// ## Panics
    ///
    /// `len` must cover at least a header and at most a full frame,
    /// or this function will panic
    pub fn set_len(&mut self, len: usize) {
        if len < HEADER_BYTES || len > FRAME_BYTES {
            unreachable!()
        }
        unsafe {
            let fl = self.freelen_ref();
            fl.store(len as u8, Ordering::Relaxed);
        }
    }
}

impl Deref for PacketBox {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Ordering can be relaxed as we have exclusive access to the
        // backing storage, and exclusive WRITE access to freelen as
        // long as the PacketBox exists.
        let len = unsafe { self.freelen_ref().load(Ordering::Relaxed) };
        assert!(len != 0);
        let data_ptr: *const u8 = unsafe {
            let arr_ptr: *const [u8; FRAME_BYTES] = addr_of!((*self.ptr.as_ptr()).data);
            arr_ptr.cast()
        };
        unsafe { core::slice::from_raw_parts(data_ptr, len as usize) }
    }
}

impl DerefMut for PacketBox {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Ordering can be relaxed as we have exclusive access to the
        // backing storage, and exclusive WRITE access to freelen as
        // long as the PacketBox exists.
        let len = unsafe { self.freelen_ref().load(Ordering::Relaxed) };
        assert!(len != 0);
        let data_ptr: *mut u8 = unsafe {
            let arr_ptr: *mut [u8; FRAME_BYTES] = addr_of_mut!((*self.ptr.as_ptr()).data);
            arr_ptr.cast()
        };
        unsafe { core::slice::from_raw_parts_mut(data_ptr, len as usize) }
    }
}

impl Drop for PacketBox {
    fn drop(&mut self) {
        let ptr: *mut RawPacket = self.ptr.as_ptr();
        // SAFETY: PacketBox represents ownership of `data`, and we have the right
        // to release on drop
        unsafe {
            let atom_ptr: *mut AtomicU8 = addr_of_mut!((*ptr).freelen);
            let atom: &AtomicU8 = &*atom_ptr;
            atom.store(RawPacket::FREE, Ordering::Release);
        }
    }
}

impl RawPacket {
    const FREE: u8 = 0;
    const MAX_LEN: u8 = FRAME_BYTES as u8;
}

impl ConstInit for RawPacket {
    #[allow(clippy::declare_interior_mutable_const)]
    const VAL: Self = RawPacket {
        data: [0u8; FRAME_BYTES],
        freelen: AtomicU8::new(0),
    };
}

unsafe impl Send for RawPacketSlice {}

/// A sliceable allocation pool
///
/// Can be created via [PacketStorage::take()], or by splitting
/// via [RawPacketSlice::split()].
pub struct RawPacketSlice {
    start: NonNull<RawPacket>,
    len: usize,
    next_idx: usize,
}

impl RawPacketSlice {
    /// ## Safety
    ///
    /// You must only ever call this once
    pub(crate) unsafe fn from_static<const N: usize>(
        buf: &'static GroundedArrayCell<RawPacket, N>,
    ) -> Self {
        Self {
            start: NonNull::new_unchecked(buf.as_mut_ptr()),
            len: N,
            next_idx: 0,
        }
    }

    /// Create a new, empty [RawPacketSlice] that has no
    /// backing storage.
    pub const fn uninit() -> Self {
        Self {
            start: NonNull::dangling(),
            len: 0,
            next_idx: 0,
        }
    }

    /// Count the number of allocatable slots
    pub fn count_allocatable(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let mut ct = 0;
        let start_ptr: *mut RawPacket = self.start.as_ptr();
        for idx in 0..self.len {
            let ptr: *mut RawPacket = unsafe { start_ptr.add(idx) };
            // Scope access of subfield so all references are dropped before we make the
            // non-null
            {
                let atom_ptr: *const AtomicU8 = unsafe { addr_of!((*ptr).freelen) };
                let atom: &AtomicU8 = unsafe { &*atom_ptr };

                // IF the value is zero, we have mutable exclusive access to allocate it.
                if atom.load(Ordering::Acquire) == RawPacket::FREE {
                    ct += 1;
                }
            }
        }
        ct
    }

    /// Attempt to allocate a [PacketBox] from the backing storage
    /// available to this [RawPacketSlice].
    ///
    /// A fresh allocation always has the full-frame length.
    ///
    /// This allocation performs a linear search of the backing
    /// storage, so allocation is `O(n)`. Returns [None] if no
    /// storage slots were available.
    pub fn allocate_raw(&mut self) -> Option<PacketBox> {
        if self.len == 0 {
            return None;
        }
        if self.next_idx >= self.len {
            self.next_idx = 0;
        }
        let start_ptr: *mut RawPacket = self.start.as_ptr();
        let idxes = (self.next_idx..self.len).chain(0..self.next_idx);
        for idx in idxes {
            let ptr: *mut RawPacket = unsafe { start_ptr.add(idx) };
            // Scope access of subfield so all references are dropped before we make the
            // non-null
            {
                let atom_ptr: *mut AtomicU8 = unsafe { addr_of_mut!((*ptr).freelen) };
                let atom: &AtomicU8 = unsafe { &*atom_ptr };

                // IF the value is zero, we have mutable exclusive access to allocate it.
                if atom.load(Ordering::Acquire) == RawPacket::FREE {
                    atom.store(RawPacket::MAX_LEN, Ordering::Release);
                    self.next_idx = idx + 1;
                } else {
                    continue;
                }
            }
            // If we didn't continue, we succeeded, and the len is now MAX_LEN
            return Some(PacketBox {
                ptr: NonNull::new(ptr)?,
            });
        }

        // End of search, none found
        None
    }

    /// Splits the tail starting at `at` from self.
    ///
    /// Additionally will refuse to split if `at` is `0` or the current capacity.
    ///
    /// Self is left with elements `[..at]`, and the new item is left with elements `[at..]`.
    pub fn split(&mut self, at: usize) -> Option<Self> {
        if (at == 0) || (at > self.len) {
            return None;
        }

        // if len = 5, and at = 2, then:
        // self.len becomes 2 (0, 1)
        // new.len becomes 3 (2, 3, 4)
        let len_new = self.len - at;
        self.len = at;

        Some(RawPacketSlice {
            start: unsafe { NonNull::new_unchecked(self.start.as_ptr().add(at)) },
            len: len_new,
            next_idx: 0,
        })
    }

    /// The backing capacity of this [RawPacketSlice].
    pub fn capacity(&self) -> usize {
        self.len
    }
}
