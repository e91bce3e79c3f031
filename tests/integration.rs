// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the host agent
//!
//! Drives the full service over heap-backed shared memory with scripted
//! capture backends, playing the consumer side of the hand-off protocol:
//! - frame ring rotation and idle repeats
//! - consumer-requested restarts
//! - cursor pipe behavior, including oversized shapes
//! - session-switch pauses

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lg_host_agent::capture::{CaptureBackend, CaptureStatus, CursorState, FrameInfo};
use lg_host_agent::protocol::{
    CursorFlags, CursorType, FrameFlags, FrameType, HeaderFlags, KVMFR_MAGIC, KVMFR_VERSION,
};
use lg_host_agent::session::{SessionId, SessionWatcher};
use lg_host_agent::shm::{MemoryShm, ShmRegion};
use lg_host_agent::{HostService, Result, ServiceError};

// ============================================================================
// Test Backends
// ============================================================================

/// Capture backend driven by a pre-loaded status script.
///
/// An empty script yields `Ok`. Counters are shared so tests can observe the
/// backend after the service takes ownership.
struct ScriptedCapture {
    script: VecDeque<CaptureStatus>,
    cursor: CursorState,
    max_frame: usize,
    fill: u8,
    info: FrameInfo,
    grab_count: Arc<AtomicUsize>,
    reinit_count: Arc<AtomicUsize>,
}

impl ScriptedCapture {
    fn new(max_frame: usize, info: FrameInfo) -> Self {
        Self {
            script: VecDeque::new(),
            cursor: CursorState::default(),
            max_frame,
            fill: 0x42,
            info,
            grab_count: Arc::new(AtomicUsize::new(0)),
            reinit_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn full_hd() -> Self {
        Self::new(
            1920 * 1080 * 4,
            FrameInfo {
                width: 1920,
                height: 1080,
                stride: 1920,
                pitch: 1920 * 4,
            },
        )
    }

    fn small() -> Self {
        Self::new(
            640 * 480 * 4,
            FrameInfo {
                width: 640,
                height: 480,
                stride: 640,
                pitch: 640 * 4,
            },
        )
    }

    fn with_script(mut self, script: &[CaptureStatus]) -> Self {
        self.script = script.iter().copied().collect();
        self
    }

    fn with_cursor(mut self, cursor: CursorState) -> Self {
        self.cursor = cursor;
        self
    }

    fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::clone(&self.grab_count), Arc::clone(&self.reinit_count))
    }
}

impl CaptureBackend for ScriptedCapture {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn re_initialize(&mut self) -> Result<()> {
        self.reinit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_initialize(&self) -> bool {
        true
    }

    fn de_initialize(&mut self) {}

    fn max_frame_size(&self) -> usize {
        self.max_frame
    }

    fn frame_type(&self) -> FrameType {
        FrameType::Argb
    }

    fn capture(&mut self) -> CaptureStatus {
        self.script.pop_front().unwrap_or(CaptureStatus::Ok)
    }

    fn grab_frame(&mut self, dest: &mut [u8]) -> Result<FrameInfo> {
        self.grab_count.fetch_add(1, Ordering::SeqCst);
        let len = self.max_frame.min(dest.len());
        dest[..len].fill(self.fill);
        Ok(self.info)
    }

    fn cursor(&self) -> &CursorState {
        &self.cursor
    }
}

/// Capture backend that always reports an unrecoverable error.
struct FailingCapture {
    max_frame: usize,
}

impl CaptureBackend for FailingCapture {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn re_initialize(&mut self) -> Result<()> {
        Err(ServiceError::Capture("device lost".to_string()))
    }

    fn can_initialize(&self) -> bool {
        true
    }

    fn de_initialize(&mut self) {}

    fn max_frame_size(&self) -> usize {
        self.max_frame
    }

    fn frame_type(&self) -> FrameType {
        FrameType::Argb
    }

    fn capture(&mut self) -> CaptureStatus {
        CaptureStatus::Error
    }

    fn grab_frame(&mut self, _dest: &mut [u8]) -> Result<FrameInfo> {
        Err(ServiceError::Capture("device lost".to_string()))
    }

    fn cursor(&self) -> &CursorState {
        unreachable!("failing capture has no cursor")
    }
}

/// Session watcher whose id can be flipped from another thread.
#[derive(Clone)]
struct SwitchableSession {
    id: Arc<AtomicU32>,
}

impl SwitchableSession {
    fn new(id: u32) -> Self {
        Self {
            id: Arc::new(AtomicU32::new(id)),
        }
    }

    fn set(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }
}

impl SessionWatcher for SwitchableSession {
    fn current_session_id(&self) -> SessionId {
        SessionId(self.id.load(Ordering::SeqCst))
    }
}

fn fixed_session() -> Box<SwitchableSession> {
    Box::new(SwitchableSession::new(1))
}

fn start_service(size: usize, capture: ScriptedCapture) -> HostService {
    HostService::initialize(Box::new(MemoryShm::new(size)), Box::new(capture), fixed_session())
        .expect("service should initialize")
}

fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn cursor_flags(region: &ShmRegion) -> CursorFlags {
    CursorFlags::from_bits_truncate(region.cursor_flags_raw())
}

const SIZE_64_MIB: usize = 64 * 1024 * 1024;
const SIZE_4_MIB: usize = 4 * 1024 * 1024;

// ============================================================================
// Cold Start and Ring Rotation
// ============================================================================

#[test]
fn cold_start_publishes_first_frame() {
    let mut service = start_service(SIZE_64_MIB, ScriptedCapture::full_hd());
    let region = service.region();

    service.process().unwrap();

    assert_eq!(region.magic(), KVMFR_MAGIC);
    assert_eq!(region.version(), KVMFR_VERSION);

    let frame = region.frame_descriptor();
    assert_eq!({ frame.flags } & FrameFlags::UPDATE.bits(), FrameFlags::UPDATE.bits());
    assert_eq!({ frame.data_pos }, region.layout().frames_offset as u32);
    assert_eq!({ frame.width }, 1920);
    assert_eq!({ frame.height }, 1080);
    assert_eq!({ frame.frame_type }, FrameType::Argb as u32);
    assert_eq!(service.frame_index(), 1);
    assert!(service.have_frame());
}

#[test]
fn ring_rotates_after_consumer_ack() {
    let mut service = start_service(SIZE_64_MIB, ScriptedCapture::full_hd());
    let region = service.region();
    let layout = *region.layout();

    service.process().unwrap();
    region.clear_frame_update();
    service.process().unwrap();

    let frame = region.frame_descriptor();
    assert_eq!(
        { frame.data_pos },
        (layout.frames_offset + layout.frame_size) as u32
    );
    assert!(region.frame_update_pending());
    assert_eq!(service.frame_index(), 0);

    // Magic and version never change across ticks
    assert_eq!(region.magic(), KVMFR_MAGIC);
    assert_eq!(region.version(), KVMFR_VERSION);
}

#[test]
fn idle_repeat_republishes_without_pixel_writes() {
    let capture = ScriptedCapture::full_hd().with_script(&[
        CaptureStatus::Ok,
        CaptureStatus::Ok,
        CaptureStatus::Timeout,
    ]);
    let (grab_count, _) = capture.counters();
    let mut service = start_service(SIZE_64_MIB, capture);
    let region = service.region();
    let layout = *region.layout();

    service.process().unwrap();
    region.clear_frame_update();
    service.process().unwrap();
    region.clear_frame_update();
    assert_eq!(grab_count.load(Ordering::SeqCst), 2);

    // Idle tick: the descriptor still references the last published slot
    service.process().unwrap();

    assert_eq!(grab_count.load(Ordering::SeqCst), 2);
    assert!(region.frame_update_pending());
    let frame = region.frame_descriptor();
    assert_eq!(
        { frame.data_pos },
        (layout.frames_offset + layout.frame_size) as u32
    );
    assert_eq!(service.frame_index(), 1);
}

#[test]
fn timeout_before_first_frame_keeps_retrying() {
    let capture = ScriptedCapture::full_hd().with_script(&[
        CaptureStatus::Timeout,
        CaptureStatus::Timeout,
        CaptureStatus::Timeout,
        CaptureStatus::Ok,
    ]);
    let (grab_count, _) = capture.counters();
    let mut service = start_service(SIZE_64_MIB, capture);
    let region = service.region();

    // Timeouts with no prior frame are not capture failures
    service.process().unwrap();

    assert_eq!(grab_count.load(Ordering::SeqCst), 1);
    assert!(region.frame_update_pending());
    assert!(service.have_frame());
}

// ============================================================================
// Consumer Restart
// ============================================================================

#[test]
fn consumer_restart_reinitializes_capture() {
    let capture = ScriptedCapture::full_hd();
    let (_, reinit_count) = capture.counters();
    let mut service = start_service(SIZE_64_MIB, capture);
    let region = service.region();
    let layout = *region.layout();

    service.process().unwrap();

    // Consumer reconnects: releases the frame and raises RESTART
    region.clear_frame_update();
    region.request_restart();

    service.process().unwrap();

    assert!(!region.restart_requested());
    assert_eq!(reinit_count.load(Ordering::SeqCst), 1);
    assert!(region.frame_update_pending());
    let frame = region.frame_descriptor();
    assert_eq!(
        { frame.data_pos },
        (layout.frames_offset + layout.frame_size) as u32
    );
    assert_eq!(service.frame_index(), 0);
}

#[test]
fn restart_releases_the_frame_wait() {
    let capture = ScriptedCapture::full_hd();
    let (grab_count, reinit_count) = capture.counters();
    let mut service = start_service(SIZE_64_MIB, capture);
    let region = service.region();
    let layout = *region.layout();

    // First frame published but never consumed
    service.process().unwrap();
    assert!(region.frame_update_pending());

    // The next tick blocks in the hand-off spin until RESTART fires
    let worker = thread::spawn(move || {
        let result = service.process();
        (service, result)
    });

    // The second grab precedes the spin; once it lands the tick can only be
    // waiting on the consumer
    wait_until(|| grab_count.load(Ordering::SeqCst) == 2, "second grab");
    thread::sleep(Duration::from_millis(50));
    region.request_restart();

    let (service, result) = worker.join().unwrap();
    result.unwrap();

    // The wait was abandoned, the frame republished, RESTART left for the
    // next tick
    assert!(region.restart_requested());
    assert_eq!(reinit_count.load(Ordering::SeqCst), 0);
    assert!(region.frame_update_pending());
    let frame = region.frame_descriptor();
    assert_eq!(
        { frame.data_pos },
        (layout.frames_offset + layout.frame_size) as u32
    );
    drop(service);
}

// ============================================================================
// Capture Failures
// ============================================================================

#[test]
fn capture_error_fails_the_tick() {
    let mut service = HostService::initialize(
        Box::new(MemoryShm::new(SIZE_4_MIB)),
        Box::new(FailingCapture {
            max_frame: 640 * 480 * 4,
        }),
        fixed_session(),
    )
    .unwrap();

    assert!(matches!(service.process(), Err(ServiceError::Capture(_))));
}

#[test]
fn frame_size_boundary() {
    // Exactly MAX_FRAMES slots of the backend's frame size past the cursor
    // area: the smallest region that must initialize
    let frame_size = 1920 * 1080 * 4;
    let size = 128 + 1024 * 1024 + 2 * frame_size;

    let service = HostService::initialize(
        Box::new(MemoryShm::new(size)),
        Box::new(ScriptedCapture::full_hd()),
        fixed_session(),
    );
    let service = service.expect("exact fit should initialize");
    assert_eq!(service.region().layout().frame_size, frame_size);
    drop(service);

    // One byte more than the slot can hold must fail
    let capture = ScriptedCapture::new(
        frame_size + 1,
        FrameInfo {
            width: 1920,
            height: 1080,
            stride: 1920,
            pitch: 1920 * 4,
        },
    );
    let result = HostService::initialize(
        Box::new(MemoryShm::new(size)),
        Box::new(capture),
        fixed_session(),
    );
    assert!(matches!(result, Err(ServiceError::FrameTooLarge { .. })));
}

// ============================================================================
// Cursor Pipe
// ============================================================================

#[test]
fn cursor_only_tick_leaves_frame_ring_alone() {
    let cursor = CursorState {
        updated: true,
        has_pos: true,
        x: 50,
        y: 60,
        visible: true,
        ..Default::default()
    };
    let capture = ScriptedCapture::small()
        .with_script(&[CaptureStatus::CursorOnly])
        .with_cursor(cursor);
    let (grab_count, _) = capture.counters();
    let mut service = start_service(SIZE_4_MIB, capture);
    let region = service.region();

    service.process().unwrap();

    // Frame ring untouched
    assert_eq!(grab_count.load(Ordering::SeqCst), 0);
    assert!(!region.frame_update_pending());
    assert!(!service.have_frame());

    // Cursor published by the worker
    wait_until(
        || cursor_flags(&region).contains(CursorFlags::UPDATE),
        "cursor update",
    );
    let flags = cursor_flags(&region);
    assert!(flags.contains(CursorFlags::POS));
    assert!(flags.contains(CursorFlags::VISIBLE));
    let desc = region.cursor_descriptor();
    assert_eq!({ desc.x }, 50);
    assert_eq!({ desc.y }, 60);
}

#[test]
fn oversized_cursor_shape_is_dropped() {
    let cursor = CursorState {
        updated: true,
        has_pos: true,
        x: 7,
        y: 8,
        has_shape: true,
        cursor_type: CursorType::Color,
        width: 724,
        height: 724,
        pitch: 724 * 4,
        shape: vec![0xEE; 2 * 1024 * 1024],
        visible: true,
    };
    let capture = ScriptedCapture::small()
        .with_script(&[CaptureStatus::CursorOnly])
        .with_cursor(cursor);
    let mut service = start_service(SIZE_4_MIB, capture);
    let region = service.region();

    service.process().unwrap();

    wait_until(
        || cursor_flags(&region).contains(CursorFlags::UPDATE),
        "cursor update",
    );

    // The position still lands; the shape is dropped and the version
    // untouched
    let flags = cursor_flags(&region);
    assert!(flags.contains(CursorFlags::POS));
    assert!(!flags.contains(CursorFlags::SHAPE));
    let desc = region.cursor_descriptor();
    assert_eq!({ desc.version }, 0);
    assert_eq!({ desc.x }, 7);
}

#[test]
fn cursor_shape_version_increments_per_commit() {
    let cursor = CursorState {
        updated: true,
        has_pos: true,
        x: 1,
        y: 2,
        has_shape: true,
        cursor_type: CursorType::Color,
        width: 8,
        height: 8,
        pitch: 32,
        shape: vec![0x11; 8 * 8 * 4],
        visible: true,
    };
    let capture = ScriptedCapture::small()
        .with_script(&[CaptureStatus::CursorOnly, CaptureStatus::CursorOnly])
        .with_cursor(cursor);
    let mut service = start_service(SIZE_4_MIB, capture);
    let region = service.region();

    service.process().unwrap();
    wait_until(
        || cursor_flags(&region).contains(CursorFlags::UPDATE),
        "first cursor update",
    );
    assert_eq!({ region.cursor_descriptor().version }, 1);

    region.clear_cursor_flags();
    service.process().unwrap();
    wait_until(
        || cursor_flags(&region).contains(CursorFlags::UPDATE),
        "second cursor update",
    );
    assert_eq!({ region.cursor_descriptor().version }, 2);
    assert!(cursor_flags(&region).contains(CursorFlags::SHAPE));
}

// ============================================================================
// Session Switch
// ============================================================================

#[test]
fn session_switch_pauses_publishing() {
    let capture = ScriptedCapture::small().with_script(&[CaptureStatus::Reinit, CaptureStatus::Ok]);
    let (_, reinit_count) = capture.counters();
    let session = SwitchableSession::new(1);
    let session_handle = session.clone();

    let mut service = HostService::initialize(
        Box::new(MemoryShm::new(SIZE_4_MIB)),
        Box::new(capture),
        Box::new(session),
    )
    .unwrap();
    let region = service.region();

    // The console switches away before the reinit-triggering tick
    session_handle.set(2);

    let worker = thread::spawn(move || {
        let result = service.process();
        (service, result)
    });

    wait_until(
        || region.header_flags().contains(HeaderFlags::PAUSED),
        "PAUSED flag",
    );
    thread::sleep(Duration::from_millis(250));
    assert!(region.header_flags().contains(HeaderFlags::PAUSED));
    assert!(!region.frame_update_pending());

    // Console returns; the tick completes with a published frame
    session_handle.set(1);
    let (service, result) = worker.join().unwrap();
    result.unwrap();

    assert!(!region.header_flags().contains(HeaderFlags::PAUSED));
    assert_eq!(reinit_count.load(Ordering::SeqCst), 1);
    assert!(region.frame_update_pending());
    drop(service);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn deinitialize_zeroes_descriptors() {
    let cursor = CursorState {
        updated: true,
        has_pos: true,
        x: 5,
        y: 6,
        visible: true,
        ..Default::default()
    };
    let mut service = start_service(SIZE_4_MIB, ScriptedCapture::small().with_cursor(cursor));
    let region = service.region();

    service.process().unwrap();
    wait_until(
        || cursor_flags(&region).contains(CursorFlags::UPDATE),
        "cursor update",
    );

    service.deinitialize();

    let frame = region.frame_descriptor();
    assert_eq!({ frame.flags }, 0);
    assert_eq!({ frame.data_pos }, 0);
    assert_eq!({ frame.width }, 0);
    let desc = region.cursor_descriptor();
    assert_eq!({ desc.flags }, 0);
    assert_eq!({ desc.x }, 0);

    // Identity fields survive teardown until the next stamp
    assert_eq!(region.magic(), KVMFR_MAGIC);
}

#[test]
fn producer_touches_only_its_own_flag_bits() {
    let mut service = start_service(SIZE_64_MIB, ScriptedCapture::full_hd());
    let region = service.region();

    for _ in 0..4 {
        region.clear_frame_update();
        service.process().unwrap();
        let flags = region.header_flags();
        // The producer only ever raises PAUSED and only ever clears RESTART
        assert!(!flags.contains(HeaderFlags::RESTART));
        assert!(!flags.contains(HeaderFlags::PAUSED));
    }
}

#[test]
fn drop_joins_cursor_worker_promptly() {
    let service = start_service(SIZE_4_MIB, ScriptedCapture::small());

    let started = Instant::now();
    drop(service);
    assert!(started.elapsed() < Duration::from_secs(3));
}
