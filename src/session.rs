// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Interactive session tracking
//!
//! A switched-out console session cannot be captured; the service suspends
//! until the session it started under owns the display again.

/// Opaque identifier of an interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(pub u32);

/// Session watcher trait
pub trait SessionWatcher: Send {
    /// Identifier of the session currently owning the display
    fn current_session_id(&self) -> SessionId;
}

/// Console-backed session watcher
#[cfg(target_os = "linux")]
pub mod console {
    use super::*;
    use std::fs;

    const ACTIVE_VT: &str = "/sys/class/tty/tty0/active";

    /// Reads the active virtual terminal from sysfs.
    pub struct ConsoleSessionWatcher;

    impl ConsoleSessionWatcher {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for ConsoleSessionWatcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SessionWatcher for ConsoleSessionWatcher {
        fn current_session_id(&self) -> SessionId {
            // "tty2\n" -> 2; treat an unreadable node as session 0
            let id = fs::read_to_string(ACTIVE_VT)
                .ok()
                .and_then(|s| s.trim().trim_start_matches("tty").parse().ok())
                .unwrap_or(0);
            SessionId(id)
        }
    }
}

/// Fixed session watcher
pub mod fixed {
    use super::*;

    /// Always reports the same session; for hosts without session switching.
    pub struct FixedSessionWatcher {
        id: SessionId,
    }

    impl FixedSessionWatcher {
        pub fn new(id: SessionId) -> Self {
            Self { id }
        }
    }

    impl Default for FixedSessionWatcher {
        fn default() -> Self {
            Self::new(SessionId(0))
        }
    }

    impl SessionWatcher for FixedSessionWatcher {
        fn current_session_id(&self) -> SessionId {
            self.id
        }
    }
}

#[cfg(target_os = "linux")]
pub use console::ConsoleSessionWatcher as DefaultSessionWatcher;

#[cfg(not(target_os = "linux"))]
pub use fixed::FixedSessionWatcher as DefaultSessionWatcher;
