// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! lg-capture Host Agent
//!
//! Host-side frame producer: captures the host framebuffer and cursor state,
//! writes them into an inter-VM shared-memory region and signals the
//! guest-side viewer through a lock-free header protocol.

pub mod capture;
pub mod cursor;
pub mod protocol;
pub mod service;
pub mod session;
pub mod shm;

pub use capture::{CaptureBackend, CaptureStatus, CursorState, DefaultCapture, FrameInfo};
pub use cursor::CursorPipe;
pub use service::HostService;
pub use session::{DefaultSessionWatcher, SessionId, SessionWatcher};
pub use shm::{FileShm, MemoryShm, ShmLayout, ShmProvider, ShmRegion};

/// Result type for host agent operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Host agent error types
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Shared memory mapping failed: {0}")]
    Map(String),

    #[error("Shared memory region too small: need {required} bytes, got {available}")]
    RegionTooSmall { required: usize, available: usize },

    #[error("Maximum frame size of {required} bytes exceeds the {available} byte slot")]
    FrameTooLarge { required: usize, available: usize },

    #[error("Capture retry count exceeded")]
    RetriesExceeded,

    #[error("Capture reinitialization failed: {0}")]
    ReinitFailed(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
