// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cursor pipe
//!
//! Cursor updates are bursty and tiny compared to frames; coupling them to
//! the frame cadence would either stall frames or drop cursor motion. A
//! dedicated worker drains a latest-wins inbox and publishes through the
//! cursor descriptor, independent of the frame ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::error;

use crate::capture::CursorState;
use crate::protocol::{CursorFlags, CursorType};
use crate::shm::ShmRegion;
use crate::Result;

/// Latest-wins snapshot bridging the capture loop and the cursor worker.
///
/// The position and shape branches are independent; `visible` is always
/// carried. Overwritten on every post, drained by the worker.
#[derive(Default)]
struct CursorInbox {
    signaled: bool,
    has_pos: bool,
    x: i32,
    y: i32,
    has_shape: bool,
    cursor_type: CursorType,
    width: u32,
    height: u32,
    pitch: u32,
    shape: Vec<u8>,
    visible: bool,
}

struct Shared {
    running: AtomicBool,
    inbox: Mutex<CursorInbox>,
    event: Condvar,
}

/// Cursor worker handle owned by the service.
pub struct CursorPipe {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CursorPipe {
    /// Spawn the cursor worker over the given region.
    pub fn start(region: Arc<ShmRegion>) -> Result<Self> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            inbox: Mutex::new(CursorInbox::default()),
            event: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("cursor-pipe".to_string())
            .spawn(move || worker_loop(region, worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Merge a cursor update into the inbox and wake the worker.
    pub fn post(&self, update: &CursorState) {
        let mut inbox = self.shared.inbox.lock().unwrap();
        if update.has_pos {
            inbox.has_pos = true;
            inbox.x = update.x;
            inbox.y = update.y;
        }
        if update.has_shape {
            inbox.has_shape = true;
            inbox.cursor_type = update.cursor_type;
            inbox.width = update.width;
            inbox.height = update.height;
            inbox.pitch = update.pitch;
            inbox.shape.clear();
            inbox.shape.extend_from_slice(&update.shape);
        }
        inbox.visible = update.visible;
        inbox.signaled = true;
        drop(inbox);
        self.shared.event.notify_one();
    }

    /// Request shutdown and join the worker.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.event.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CursorPipe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(region: Arc<ShmRegion>, shared: Arc<Shared>) {
    let cursor_capacity = region.layout().cursor_capacity;

    while shared.running.load(Ordering::Acquire) {
        // Wait for work; the 1 s cap keeps shutdown observable with no
        // cursor traffic.
        {
            let inbox = shared.inbox.lock().unwrap();
            if !inbox.signaled {
                let (inbox, _timeout) = shared
                    .event
                    .wait_timeout(inbox, Duration::from_secs(1))
                    .unwrap();
                if !inbox.signaled {
                    continue;
                }
            }
        }

        // The consumer must release the previous update first
        while region.cursor_flags_raw() != 0 {
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut flags = CursorFlags::empty();
        {
            let mut inbox = shared.inbox.lock().unwrap();
            inbox.signaled = false;

            if inbox.has_pos {
                inbox.has_pos = false;
                flags |= CursorFlags::POS;
                if inbox.visible {
                    flags |= CursorFlags::VISIBLE;
                }
                region.set_cursor_position(inbox.x, inbox.y);
            }

            if inbox.has_shape {
                inbox.has_shape = false;
                if inbox.shape.len() > cursor_capacity {
                    error!(
                        "Cursor shape of {} bytes exceeds the {} byte cursor area, dropping shape",
                        inbox.shape.len(),
                        cursor_capacity
                    );
                } else {
                    flags |= CursorFlags::SHAPE;
                    region.set_cursor_shape(
                        inbox.cursor_type,
                        inbox.width,
                        inbox.height,
                        inbox.pitch,
                        &inbox.shape,
                    );
                }
            }
        }

        region.publish_cursor_flags(flags | CursorFlags::UPDATE);
    }
}
