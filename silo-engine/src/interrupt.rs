// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Cooperative interruption.
//!
//! Long operations (reference scans, path copies, table enumeration,
//! child waits) poll a process-wide flag at checkpoints. A signal handler
//! or another thread sets the flag with [`trigger`]; the operation then
//! unwinds with [`Error::Interrupted`], running destructors that kill
//! children and release locks on the way out.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Request interruption of the current operation. Async-signal-safe.
pub fn trigger() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the flag, typically before starting a new top-level operation.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Checkpoint: returns `Err(Interrupted)` once [`trigger`] has been called.
pub fn check_interrupt() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}
