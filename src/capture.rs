// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame capture backends
//!
//! Abstracts the concrete capture device (DXGI, NvFBC, X11, ...) behind a
//! trait the service loop drives. Backends report one of five outcomes per
//! capture attempt and hand pixel bytes directly into a frame-ring slot.

use crate::protocol::{CursorType, FrameType};
use crate::Result;

/// Outcome of a single capture attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// A new frame (and possibly cursor state) is available
    Ok,
    /// Nothing changed within the backend's internal timeout
    Timeout,
    /// Only the cursor changed; the frame ring must not be touched
    CursorOnly,
    /// Unrecoverable backend failure
    Error,
    /// The backend lost its device and must be reinitialized
    Reinit,
}

/// Geometry of a captured frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Elements per row
    pub stride: u32,
    /// Bytes per row
    pub pitch: u32,
}

/// Cursor state reported by the capture backend.
///
/// `has_pos` and `has_shape` are independent: a movement-only update carries
/// no shape bytes, a shape change may arrive without movement.
#[derive(Debug, Clone, Default)]
pub struct CursorState {
    /// Anything below changed since the last capture
    pub updated: bool,
    /// `x`/`y` carry a fresh position
    pub has_pos: bool,
    pub x: i32,
    pub y: i32,
    /// The shape fields carry a fresh shape
    pub has_shape: bool,
    pub cursor_type: CursorType,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Shape pixel bytes
    pub shape: Vec<u8>,
    /// Whether the cursor is visible
    pub visible: bool,
}

/// Capture backend trait
pub trait CaptureBackend: Send {
    /// Initialize the capture device
    fn initialize(&mut self) -> Result<()>;

    /// Reinitialize after a restart request or device loss
    fn re_initialize(&mut self) -> Result<()>;

    /// Whether the device can be (re)initialized right now
    fn can_initialize(&self) -> bool;

    /// Tear down the capture device
    fn de_initialize(&mut self);

    /// Largest frame this backend can produce, in bytes
    fn max_frame_size(&self) -> usize;

    /// Pixel format of produced frames
    fn frame_type(&self) -> FrameType;

    /// Attempt to capture; blocks up to the backend's internal timeout
    fn capture(&mut self) -> CaptureStatus;

    /// Write the captured frame's pixels into `dest` and report its geometry
    fn grab_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo>;

    /// Cursor state accumulated by the last capture
    fn cursor(&self) -> &CursorState;
}

/// Test-pattern capture backend
pub mod pattern {
    use super::*;

    const BYTES_PER_PIXEL: usize = 4;

    /// Generates a scrolling gradient with a simple arrow cursor.
    ///
    /// Stands in for a real capture device on machines without one; also the
    /// default backend of the binary.
    pub struct PatternCapture {
        width: u32,
        height: u32,
        tick: u64,
        cursor: CursorState,
        active: bool,
    }

    impl PatternCapture {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                tick: 0,
                cursor: CursorState::default(),
                active: false,
            }
        }

        fn arrow_shape() -> Vec<u8> {
            let size = 32usize;
            let mut data = vec![0u8; size * size * BYTES_PER_PIXEL];
            for y in 0..size {
                for x in 0..size {
                    if x == y || (x < 8 && y < 8 && x >= y) {
                        let offset = (y * size + x) * BYTES_PER_PIXEL;
                        data[offset] = 255;
                        data[offset + 1] = 255;
                        data[offset + 2] = 255;
                        data[offset + 3] = 255;
                    }
                }
            }
            data
        }
    }

    impl CaptureBackend for PatternCapture {
        fn initialize(&mut self) -> Result<()> {
            self.active = true;
            self.tick = 0;

            // Publish the arrow shape once; movement follows per capture
            let shape = Self::arrow_shape();
            self.cursor = CursorState {
                updated: true,
                has_pos: true,
                x: 0,
                y: 0,
                has_shape: true,
                cursor_type: CursorType::Color,
                width: 32,
                height: 32,
                pitch: 32 * BYTES_PER_PIXEL as u32,
                shape,
                visible: true,
            };
            Ok(())
        }

        fn re_initialize(&mut self) -> Result<()> {
            self.initialize()
        }

        fn can_initialize(&self) -> bool {
            true
        }

        fn de_initialize(&mut self) {
            self.active = false;
        }

        fn max_frame_size(&self) -> usize {
            self.width as usize * self.height as usize * BYTES_PER_PIXEL
        }

        fn frame_type(&self) -> FrameType {
            FrameType::Argb
        }

        fn capture(&mut self) -> CaptureStatus {
            if !self.active {
                return CaptureStatus::Error;
            }
            self.tick += 1;
            if self.tick > 1 {
                self.cursor.has_shape = false;
            }
            self.cursor.has_pos = true;
            self.cursor.x = (self.tick % self.width as u64) as i32;
            self.cursor.y = (self.tick % self.height as u64) as i32;
            self.cursor.updated = true;
            CaptureStatus::Ok
        }

        fn grab_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
            let pitch = self.width as usize * BYTES_PER_PIXEL;
            let len = (pitch * self.height as usize).min(dest.len());
            let phase = self.tick as usize;

            for (i, byte) in dest[..len].iter_mut().enumerate() {
                let x = (i % pitch) / BYTES_PER_PIXEL;
                let y = i / pitch;
                *byte = match i % BYTES_PER_PIXEL {
                    0 => (x + phase) as u8,
                    1 => (y + phase) as u8,
                    2 => ((x + y) / 2) as u8,
                    _ => 0xFF,
                };
            }

            Ok(FrameInfo {
                width: self.width,
                height: self.height,
                stride: self.width,
                pitch: pitch as u32,
            })
        }

        fn cursor(&self) -> &CursorState {
            &self.cursor
        }
    }
}

pub use pattern::PatternCapture as DefaultCapture;
