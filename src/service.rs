// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host service loop
//!
//! Coordinates capture, the frame ring and the cursor pipe. One call to
//! `process` is one tick of the capture state machine: honor a consumer
//! restart, capture (with retries), hand the cursor to its worker, commit
//! the frame.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::capture::{CaptureBackend, CaptureStatus};
use crate::cursor::CursorPipe;
use crate::protocol::MAX_FRAMES;
use crate::session::{SessionId, SessionWatcher};
use crate::shm::{ShmProvider, ShmRegion};
use crate::{Result, ServiceError};

const REINIT_POLL: Duration = Duration::from_millis(100);

/// Host-side frame producer.
///
/// Owns the shared memory region, the capture backend and the cursor worker.
/// `Drop` tears everything down, so every exit path de-initializes.
pub struct HostService {
    region: Arc<ShmRegion>,
    capture: Box<dyn CaptureBackend>,
    session: Box<dyn SessionWatcher>,
    console_session: SessionId,
    cursor: CursorPipe,
    frame_index: usize,
    have_frame: bool,
}

impl HostService {
    /// Bring up shared memory, validate the layout against the capture
    /// backend, stamp the header and start the cursor worker.
    pub fn initialize(
        shm: Box<dyn ShmProvider>,
        mut capture: Box<dyn CaptureBackend>,
        session: Box<dyn SessionWatcher>,
    ) -> Result<Self> {
        capture.initialize()?;

        let region = match ShmRegion::new(shm) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                capture.de_initialize();
                return Err(e);
            }
        };

        let frame_size = region.layout().frame_size;
        if capture.max_frame_size() > frame_size {
            capture.de_initialize();
            return Err(ServiceError::FrameTooLarge {
                required: capture.max_frame_size(),
                available: frame_size,
            });
        }

        // Stamping zeroed descriptors tells an already-connected consumer
        // that the producer restarted.
        region.stamp_header();

        let console_session = session.current_session_id();
        let cursor = CursorPipe::start(Arc::clone(&region))?;

        info!("Host service initialized");
        Ok(Self {
            region,
            capture,
            session,
            console_session,
            cursor,
            frame_index: 0,
            have_frame: false,
        })
    }

    /// Shared memory region handle (consumer-side helpers, diagnostics).
    pub fn region(&self) -> Arc<ShmRegion> {
        Arc::clone(&self.region)
    }

    /// Next ring slot to write
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Whether a frame has ever been published
    pub fn have_frame(&self) -> bool {
        self.have_frame
    }

    /// Run one tick of the capture state machine.
    pub fn process(&mut self) -> Result<()> {
        // The consumer (re)connected and wants a clean slate
        if self.region.restart_requested() {
            info!("Restart requested");
            if let Err(e) = self.capture.re_initialize() {
                error!("ReInitialize failed: {}", e);
                return Err(ServiceError::ReinitFailed(e.to_string()));
            }
            self.check_frame_size()?;
            self.region.clear_restart();
        }

        let mut ok = false;
        let mut cursor_only = false;
        let mut repeat = false;

        let mut tries = 0;
        while tries < 2 {
            match self.capture.capture() {
                CaptureStatus::Ok => ok = true,
                CaptureStatus::Timeout => {
                    if self.have_frame {
                        // Re-publish the previous slot so the consumer keeps
                        // refreshing through idle periods
                        ok = true;
                        repeat = true;
                        self.frame_index = self
                            .frame_index
                            .checked_sub(1)
                            .unwrap_or(MAX_FRAMES - 1);
                    } else {
                        // Timeouts before the first frame are not failures
                        continue;
                    }
                }
                CaptureStatus::CursorOnly => {
                    ok = true;
                    cursor_only = true;
                }
                CaptureStatus::Error => {
                    error!("Capture failed");
                    return Err(ServiceError::Capture("capture backend failed".to_string()));
                }
                CaptureStatus::Reinit => {
                    // A reinit request does not count towards a failure to
                    // capture
                    self.reinitialize_capture()?;
                    continue;
                }
            }

            if ok {
                break;
            }
            tries += 1;
        }

        if !ok {
            error!("Capture retry count exceeded");
            return Err(ServiceError::RetriesExceeded);
        }

        let cursor = self.capture.cursor();
        if cursor.updated {
            self.cursor.post(cursor);
        }

        if !cursor_only {
            if !repeat {
                let data_pos = self.region.layout().frame_offsets[self.frame_index] as u32;
                let info = {
                    // SAFETY: the producer owns this slot; the descriptor
                    // either references the other slot or its UPDATE flag is
                    // clear.
                    let slot = unsafe { self.region.frame_slot(self.frame_index) };
                    self.capture.grab_frame(slot)?
                };

                self.wait_frame_release();

                self.region
                    .publish_frame(self.capture.frame_type(), &info, data_pos);
                self.frame_index = (self.frame_index + 1) % MAX_FRAMES;
                self.have_frame = true;

                debug!(
                    "Published frame {}x{} at 0x{:08x}",
                    info.width, info.height, data_pos
                );
            } else {
                self.wait_frame_release();
            }

            self.region.arm_frame_update();
        }

        // Any stale producer-side flag is now irrelevant; RESTART stays with
        // the consumer
        self.region.retain_restart_only();
        Ok(())
    }

    /// Tear down the cursor worker, capture and shared memory.
    pub fn deinitialize(self) {
        // Drop performs the teardown; consuming self guarantees it
    }

    fn shutdown(&mut self) {
        self.cursor.stop();
        self.capture.de_initialize();
        self.region.zero_descriptors();
        self.frame_index = 0;
        self.have_frame = false;
        info!("Host service stopped");
    }

    /// Spin until the consumer releases the frame descriptor.
    ///
    /// No timeout: the only release paths are the consumer clearing `UPDATE`
    /// or raising `RESTART`. No OS primitive spans the VM boundary.
    fn wait_frame_release(&self) {
        while self.region.frame_update_pending() {
            if self.region.restart_requested() {
                break;
            }
            std::hint::spin_loop();
        }
    }

    fn check_frame_size(&self) -> Result<()> {
        let frame_size = self.region.layout().frame_size;
        if self.capture.max_frame_size() > frame_size {
            error!(
                "Maximum frame size of {} bytes exceeds maximum space available",
                self.capture.max_frame_size()
            );
            return Err(ServiceError::FrameTooLarge {
                required: self.capture.max_frame_size(),
                available: frame_size,
            });
        }
        Ok(())
    }

    /// Device-loss recovery: pause, wait for the console and the device,
    /// reinitialize, re-validate.
    fn reinitialize_capture(&mut self) -> Result<()> {
        info!("ReInitialize requested");
        self.region.set_paused(true);

        if self.session.current_session_id() != self.console_session {
            info!("User switch detected, waiting to regain control");
            while self.session.current_session_id() != self.console_session {
                thread::sleep(REINIT_POLL);
            }
        }

        while !self.capture.can_initialize() {
            thread::sleep(REINIT_POLL);
        }

        if let Err(e) = self.capture.re_initialize() {
            error!("ReInitialize failed: {}", e);
            return Err(ServiceError::ReinitFailed(e.to_string()));
        }
        self.check_frame_size()?;

        self.region.set_paused(false);
        Ok(())
    }
}

impl Drop for HostService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
