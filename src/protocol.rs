// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared protocol definitions between the host producer and the guest viewer
//!
//! These structures live at the start of the IVSHMEM region and are read by
//! the guest at any instant; they must be kept in sync with the guest-side
//! client.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      KvmfrHeader                             │
//! │  - Magic, version, host identity                            │
//! │  - Global flags (RESTART, PAUSED)                           │
//! │  - Embedded frame and cursor descriptors                    │
//! └─────────────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Cursor pixel area                          │
//! │  - 1 MiB, starts at the next 128-byte boundary              │
//! └─────────────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Frame ring                                 │
//! │  - MAX_FRAMES equal-sized slots (double buffering)          │
//! │  - Slot size rounded down to a 128-byte boundary            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Synchronization
//!
//! Every flag byte is a mini-protocol:
//! - The consumer sets `RESTART`; the producer clears it with an atomic AND.
//! - The producer sets `PAUSED` while it cannot publish frames.
//! - Each descriptor's `UPDATE` bit is the hand-off token: set only by the
//!   producer, cleared only by the consumer.

use serde::{Deserialize, Serialize};

/// Magic tag at the start of the shared memory region.
pub const KVMFR_MAGIC: [u8; 8] = *b"KVMFR---";

/// Current protocol version.
///
/// Incremented when the wire structures change incompatibly.
pub const KVMFR_VERSION: u32 = 1;

/// Number of slots in the frame ring (double buffering).
pub const MAX_FRAMES: usize = 2;

/// Fixed capacity of the cursor pixel area (1 MiB).
pub const CURSOR_CAPACITY: usize = 1024 * 1024;

bitflags::bitflags! {
    /// Global header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Consumer (re)connected; the producer must reset its capture state.
        const RESTART = 0x01;
        /// Producer is temporarily not publishing frames.
        const PAUSED = 0x02;
    }
}

bitflags::bitflags! {
    /// Frame descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// A frame is ready; cleared by the consumer once displayed.
        const UPDATE = 0x01;
    }
}

bitflags::bitflags! {
    /// Cursor descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u8 {
        /// The x/y fields carry a fresh position.
        const POS = 0x01;
        /// The shape fields and pixel area carry a fresh shape.
        const SHAPE = 0x02;
        /// The cursor is currently visible.
        const VISIBLE = 0x04;
        /// Hand-off token; cleared by the consumer once consumed.
        const UPDATE = 0x08;
    }
}

/// Pixel format of a published frame.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// No frame published yet
    Invalid = 0,
    /// 32-bit ARGB
    Argb = 1,
    /// 24-bit RGB
    Rgb = 2,
    /// YUV 4:2:0
    Yuv420 = 3,
}

impl Default for FrameType {
    fn default() -> Self {
        FrameType::Invalid
    }
}

impl TryFrom<u32> for FrameType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Invalid),
            1 => Ok(FrameType::Argb),
            2 => Ok(FrameType::Rgb),
            3 => Ok(FrameType::Yuv420),
            _ => Err("Invalid frame type value"),
        }
    }
}

/// Encoding of a published cursor shape.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorType {
    /// 32-bit BGRA color cursor
    Color = 0,
    /// 1-bit AND/XOR monochrome cursor
    Monochrome = 1,
    /// Color cursor with a mask plane
    MaskedColor = 2,
}

impl Default for CursorType {
    fn default() -> Self {
        CursorType::Color
    }
}

impl TryFrom<u32> for CursorType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CursorType::Color),
            1 => Ok(CursorType::Monochrome),
            2 => Ok(CursorType::MaskedColor),
            _ => Err("Invalid cursor type value"),
        }
    }
}

/// Frame descriptor embedded in the header.
///
/// Written by the producer only while the `UPDATE` bit is clear (or while the
/// consumer has disengaged via `RESTART`). All integers little-endian;
/// `data_pos` is an offset from the region base into one of the ring slots.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmfrFrame {
    /// Flags (bit 0 = `UPDATE`)
    pub flags: u8,
    /// Pixel format (see `FrameType`)
    pub frame_type: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Elements per row
    pub stride: u32,
    /// Bytes per row
    pub pitch: u32,
    /// Offset of the pixel data from the region base
    pub data_pos: u32,
}

/// Cursor descriptor embedded in the header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmfrCursor {
    /// Flags (`POS`, `SHAPE`, `VISIBLE`, `UPDATE`)
    pub flags: u8,
    /// Shape version, strictly monotonic; bumped on every committed shape
    pub version: u32,
    /// Shape encoding (see `CursorType`)
    pub cursor_type: u32,
    /// Shape width in pixels
    pub width: u32,
    /// Shape height in pixels
    pub height: u32,
    /// Shape bytes per row
    pub pitch: u32,
    /// Offset of the shape pixels from the region base
    pub data_pos: u32,
    /// Cursor X position in pixels
    pub x: i32,
    /// Cursor Y position in pixels
    pub y: i32,
}

/// Protocol header at offset 0 of the shared memory region.
///
/// The layout is packed and little-endian; the guest maps the same bytes and
/// relies on these exact offsets. `host_id` is stamped by the shared-memory
/// provider and never written by the agent after initialization.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct KvmfrHeader {
    /// Magic tag (`KVMFR_MAGIC`)
    pub magic: [u8; 8],
    /// Protocol version (`KVMFR_VERSION`)
    pub version: u32,
    /// Opaque host identity, set by the shared-memory provider
    pub host_id: u32,
    /// Global flags (`RESTART`, `PAUSED`)
    pub flags: u8,
    /// Frame descriptor
    pub frame: KvmfrFrame,
    /// Cursor descriptor
    pub cursor: KvmfrCursor,
}

const _: () = assert!(core::mem::size_of::<KvmfrFrame>() == 25);
const _: () = assert!(core::mem::size_of::<KvmfrCursor>() == 33);
const _: () = assert!(core::mem::size_of::<KvmfrHeader>() == 75);
