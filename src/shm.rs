// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared memory region, layout and header access
//!
//! Maps the IVSHMEM region, carves it into the header, cursor area and frame
//! ring, and provides the atomic flag accessors used for hand-off with the
//! guest-side consumer.
//!
//! The region is read by a foreign process at any instant. Flag bytes are
//! accessed through `AtomicU8` views (a `u8` atomic is valid at any offset);
//! multi-byte descriptor fields use unaligned raw-pointer accesses, ordered
//! against the flag bytes by the release store of the `UPDATE` bit.

use std::alloc;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};

use log::info;
use memmap2::MmapMut;

use crate::capture::FrameInfo;
use crate::protocol::*;
use crate::{Result, ServiceError};

/// Round up to the next 128-byte boundary.
#[inline]
pub fn align_up(x: usize) -> usize {
    (x + 0x7F) & !0x7F
}

/// Round down to the previous 128-byte boundary.
#[inline]
pub fn align_down(x: usize) -> usize {
    x & !0x7F
}

/// Shared memory provider trait
///
/// Abstracts the inter-VM shared-memory device: enumeration, mapping and
/// teardown. The agent only needs the mapped byte range.
pub trait ShmProvider: Send {
    /// Map the region
    fn initialize(&mut self) -> Result<()>;

    /// Size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Base pointer of the mapped region
    fn memory(&mut self) -> *mut u8;

    /// Unmap the region
    fn deinitialize(&mut self);
}

/// File-backed shared memory (IVSHMEM device node or plain file)
pub struct FileShm {
    path: PathBuf,
    map: Option<MmapMut>,
}

impl FileShm {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            map: None,
        }
    }
}

impl ShmProvider for FileShm {
    fn initialize(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| ServiceError::Map(format!("{}: {}", self.path.display(), e)))?;

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ServiceError::Map(format!("{}: {}", self.path.display(), e)))?;

        self.map = Some(map);
        Ok(())
    }

    fn size(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    fn memory(&mut self) -> *mut u8 {
        self.map.as_mut().map_or(ptr::null_mut(), |m| m.as_mut_ptr())
    }

    fn deinitialize(&mut self) {
        self.map = None;
    }
}

/// Heap-backed shared memory for tests and local development
pub struct MemoryShm {
    size: usize,
    ptr: *mut u8,
}

// MemoryShm owns its allocation exclusively
unsafe impl Send for MemoryShm {}

impl MemoryShm {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ptr: ptr::null_mut(),
        }
    }

    fn layout(&self) -> alloc::Layout {
        // 128-byte alignment matches the section alignment of the real device
        alloc::Layout::from_size_align(self.size, 128).expect("valid layout")
    }
}

impl ShmProvider for MemoryShm {
    fn initialize(&mut self) -> Result<()> {
        if self.ptr.is_null() {
            let ptr = unsafe { alloc::alloc_zeroed(self.layout()) };
            if ptr.is_null() {
                return Err(ServiceError::Map("memory allocation failed".to_string()));
            }
            self.ptr = ptr;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn memory(&mut self) -> *mut u8 {
        self.ptr
    }

    fn deinitialize(&mut self) {
        if !self.ptr.is_null() {
            unsafe { alloc::dealloc(self.ptr, self.layout()) };
            self.ptr = ptr::null_mut();
        }
    }
}

impl Drop for MemoryShm {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Computed section offsets within the shared memory region.
///
/// All section starts are 128-byte aligned so descriptors and pixel rows do
/// not share cache lines with adjacent regions.
#[derive(Debug, Clone, Copy)]
pub struct ShmLayout {
    /// Total region size in bytes
    pub size: usize,
    /// Offset of the cursor pixel area
    pub cursor_offset: usize,
    /// Capacity of the cursor pixel area
    pub cursor_capacity: usize,
    /// Offset of the first frame slot
    pub frames_offset: usize,
    /// Size of each frame slot
    pub frame_size: usize,
    /// Offset of each frame slot from the region base
    pub frame_offsets: [usize; MAX_FRAMES],
}

impl ShmLayout {
    /// Carve a region of `size` bytes into header, cursor area and frame ring.
    pub fn compute(size: usize) -> Result<Self> {
        let header_size = core::mem::size_of::<KvmfrHeader>();
        if size < header_size {
            return Err(ServiceError::RegionTooSmall {
                required: header_size,
                available: size,
            });
        }

        // data_pos fields are 32-bit offsets from the region base
        if size > u32::MAX as usize {
            return Err(ServiceError::Map(format!(
                "region of {} bytes exceeds the 32-bit offset space",
                size
            )));
        }

        let cursor_offset = align_up(header_size);
        let frames_offset = align_up(cursor_offset + CURSOR_CAPACITY);
        if frames_offset >= size {
            return Err(ServiceError::RegionTooSmall {
                required: frames_offset + MAX_FRAMES * 128,
                available: size,
            });
        }

        let frame_size = align_down((size - frames_offset) / MAX_FRAMES);
        if frame_size == 0 {
            return Err(ServiceError::RegionTooSmall {
                required: frames_offset + MAX_FRAMES * 128,
                available: size,
            });
        }

        let mut frame_offsets = [0usize; MAX_FRAMES];
        for (i, offset) in frame_offsets.iter_mut().enumerate() {
            *offset = frames_offset + i * frame_size;
        }

        Ok(Self {
            size,
            cursor_offset,
            cursor_capacity: CURSOR_CAPACITY,
            frames_offset,
            frame_size,
            frame_offsets,
        })
    }
}

/// Mapped shared memory region with its computed layout.
///
/// Shared between the service loop and the cursor worker via `Arc`; all
/// methods take `&self` and synchronize through the header flag bytes.
pub struct ShmRegion {
    provider: Box<dyn ShmProvider>,
    base: *mut u8,
    layout: ShmLayout,
}

// The region is only mutated through atomic flags and the hand-off
// discipline described in the protocol module.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Map the provider's region and derive the section layout.
    pub fn new(mut provider: Box<dyn ShmProvider>) -> Result<Self> {
        provider.initialize()?;

        let size = provider.size();
        let layout = match ShmLayout::compute(size) {
            Ok(layout) => layout,
            Err(e) => {
                provider.deinitialize();
                return Err(e);
            }
        };

        let base = provider.memory();
        if base.is_null() {
            provider.deinitialize();
            return Err(ServiceError::Map("provider returned no memory".to_string()));
        }

        info!("Total Available : {:3} MiB", size / 1024 / 1024);
        info!("Max Cursor Size : {:3} MiB", layout.cursor_capacity / 1024 / 1024);
        info!("Max Frame Size  : {:3} MiB", layout.frame_size / 1024 / 1024);
        info!("Cursor          : 0x{:08x}", layout.cursor_offset);
        for (i, offset) in layout.frame_offsets.iter().enumerate() {
            info!("Frame {}         : 0x{:08x}", i, offset);
        }

        Ok(Self {
            provider,
            base,
            layout,
        })
    }

    /// The computed section layout
    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    #[inline]
    fn header(&self) -> *mut KvmfrHeader {
        self.base as *mut KvmfrHeader
    }

    #[inline]
    fn header_flags_atomic(&self) -> &AtomicU8 {
        unsafe { &*(ptr::addr_of_mut!((*self.header()).flags) as *const AtomicU8) }
    }

    #[inline]
    fn frame_flags_atomic(&self) -> &AtomicU8 {
        unsafe { &*(ptr::addr_of_mut!((*self.header()).frame.flags) as *const AtomicU8) }
    }

    #[inline]
    fn cursor_flags_atomic(&self) -> &AtomicU8 {
        unsafe { &*(ptr::addr_of_mut!((*self.header()).cursor.flags) as *const AtomicU8) }
    }

    /// Stamp the header for a (re)started producer.
    ///
    /// Writes magic and version, zeroes both descriptors and clears `RESTART`.
    /// Zeroed descriptors announce "producer restarted" to an
    /// already-connected consumer. `host_id` is left untouched.
    pub fn stamp_header(&self) {
        let header = self.header();
        unsafe {
            ptr::addr_of_mut!((*header).magic).write(KVMFR_MAGIC);
            ptr::addr_of_mut!((*header).version).write_unaligned(KVMFR_VERSION);
            ptr::addr_of_mut!((*header).frame).write(KvmfrFrame::default());
            ptr::addr_of_mut!((*header).cursor).write(KvmfrCursor::default());
        }
        self.header_flags_atomic()
            .fetch_and(!HeaderFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Zero both descriptors (teardown path).
    pub fn zero_descriptors(&self) {
        let header = self.header();
        unsafe {
            ptr::addr_of_mut!((*header).frame).write(KvmfrFrame::default());
            ptr::addr_of_mut!((*header).cursor).write(KvmfrCursor::default());
        }
    }

    pub fn magic(&self) -> [u8; 8] {
        unsafe { ptr::addr_of!((*self.header()).magic).read() }
    }

    pub fn version(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header()).version).read_unaligned() }
    }

    pub fn host_id(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header()).host_id).read_unaligned() }
    }

    /// Current global flags
    pub fn header_flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.header_flags_atomic().load(Ordering::Acquire))
    }

    /// Whether the consumer has requested a restart
    pub fn restart_requested(&self) -> bool {
        self.header_flags().contains(HeaderFlags::RESTART)
    }

    /// Request a restart (consumer side of the hand-off; used by loopback
    /// clients and tests).
    pub fn request_restart(&self) {
        self.header_flags_atomic()
            .fetch_or(HeaderFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Acknowledge a restart request.
    ///
    /// Atomic AND: the consumer may be setting the flag concurrently.
    pub fn clear_restart(&self) {
        self.header_flags_atomic()
            .fetch_and(!HeaderFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Raise or drop the `PAUSED` indication.
    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.header_flags_atomic()
                .fetch_or(HeaderFlags::PAUSED.bits(), Ordering::Release);
        } else {
            self.header_flags_atomic()
                .fetch_and(!HeaderFlags::PAUSED.bits(), Ordering::Release);
        }
    }

    /// Drop every global flag bit except `RESTART` (end-of-tick mask).
    pub fn retain_restart_only(&self) {
        self.header_flags_atomic()
            .fetch_and(HeaderFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Whether the consumer still holds the published frame
    pub fn frame_update_pending(&self) -> bool {
        let flags = self.frame_flags_atomic().load(Ordering::Acquire);
        FrameFlags::from_bits_truncate(flags).contains(FrameFlags::UPDATE)
    }

    /// Overwrite the frame descriptor fields for a fresh frame.
    ///
    /// Must only be called while the producer owns the descriptor (the
    /// `UPDATE` wait has completed or `RESTART` released it).
    pub fn publish_frame(&self, frame_type: FrameType, info: &FrameInfo, data_pos: u32) {
        let header = self.header();
        unsafe {
            ptr::addr_of_mut!((*header).frame.frame_type).write_unaligned(frame_type as u32);
            ptr::addr_of_mut!((*header).frame.width).write_unaligned(info.width);
            ptr::addr_of_mut!((*header).frame.height).write_unaligned(info.height);
            ptr::addr_of_mut!((*header).frame.stride).write_unaligned(info.stride);
            ptr::addr_of_mut!((*header).frame.pitch).write_unaligned(info.pitch);
            ptr::addr_of_mut!((*header).frame.data_pos).write_unaligned(data_pos);
        }
    }

    /// Signal a frame update.
    ///
    /// Release ordering: a consumer that sees the flag also sees the
    /// descriptor and pixel writes that preceded it.
    pub fn arm_frame_update(&self) {
        self.frame_flags_atomic()
            .fetch_or(FrameFlags::UPDATE.bits(), Ordering::Release);
    }

    /// Clear the frame `UPDATE` flag (consumer side of the hand-off).
    pub fn clear_frame_update(&self) {
        self.frame_flags_atomic()
            .fetch_and(!FrameFlags::UPDATE.bits(), Ordering::AcqRel);
    }

    /// Raw cursor flags byte
    pub fn cursor_flags_raw(&self) -> u8 {
        self.cursor_flags_atomic().load(Ordering::Acquire)
    }

    /// Clear all cursor flags (consumer side of the hand-off).
    pub fn clear_cursor_flags(&self) {
        self.cursor_flags_atomic().store(0, Ordering::Release);
    }

    /// Write the cursor position fields.
    pub fn set_cursor_position(&self, x: i32, y: i32) {
        let header = self.header();
        unsafe {
            ptr::addr_of_mut!((*header).cursor.x).write_unaligned(x);
            ptr::addr_of_mut!((*header).cursor.y).write_unaligned(y);
        }
    }

    /// Commit a cursor shape: descriptor fields, pixel copy and version bump.
    ///
    /// Must only be called while the cursor flags byte is clear. The caller
    /// has already validated `shape.len() <= cursor_capacity`.
    pub fn set_cursor_shape(
        &self,
        cursor_type: CursorType,
        width: u32,
        height: u32,
        pitch: u32,
        shape: &[u8],
    ) {
        debug_assert!(shape.len() <= self.layout.cursor_capacity);

        let header = self.header();
        unsafe {
            let version = ptr::addr_of!((*header).cursor.version).read_unaligned();
            ptr::addr_of_mut!((*header).cursor.version).write_unaligned(version.wrapping_add(1));
            ptr::addr_of_mut!((*header).cursor.cursor_type).write_unaligned(cursor_type as u32);
            ptr::addr_of_mut!((*header).cursor.width).write_unaligned(width);
            ptr::addr_of_mut!((*header).cursor.height).write_unaligned(height);
            ptr::addr_of_mut!((*header).cursor.pitch).write_unaligned(pitch);
            ptr::addr_of_mut!((*header).cursor.data_pos)
                .write_unaligned(self.layout.cursor_offset as u32);

            ptr::copy_nonoverlapping(
                shape.as_ptr(),
                self.base.add(self.layout.cursor_offset),
                shape.len(),
            );
        }
    }

    /// Publish the cursor flags byte.
    ///
    /// Single release store; the flags byte was clear while the fields were
    /// written, so the consumer observes either nothing or the full update.
    pub fn publish_cursor_flags(&self, flags: CursorFlags) {
        self.cursor_flags_atomic().store(flags.bits(), Ordering::Release);
    }

    /// Snapshot copy of the frame descriptor
    pub fn frame_descriptor(&self) -> KvmfrFrame {
        unsafe { ptr::addr_of!((*self.header()).frame).read() }
    }

    /// Snapshot copy of the cursor descriptor
    pub fn cursor_descriptor(&self) -> KvmfrCursor {
        unsafe { ptr::addr_of!((*self.header()).cursor).read() }
    }

    /// Mutable view of a frame slot's pixel bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the slot per the hand-off discipline: the frame
    /// descriptor does not reference it, or its `UPDATE` flag is clear.
    pub unsafe fn frame_slot(&self, index: usize) -> &mut [u8] {
        debug_assert!(index < MAX_FRAMES);
        slice::from_raw_parts_mut(
            self.base.add(self.layout.frame_offsets[index]),
            self.layout.frame_size,
        )
    }

    /// Read-only view of the cursor pixel area (consumer side; tests).
    pub fn cursor_pixels(&self, len: usize) -> &[u8] {
        let len = len.min(self.layout.cursor_capacity);
        unsafe { slice::from_raw_parts(self.base.add(self.layout.cursor_offset), len) }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        self.provider.deinitialize();
    }
}
