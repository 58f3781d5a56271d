//! Explicit lifecycle state for the process-wide engines.
//!
//! Both the decode engine (FFmpeg) and the raster engine have global state
//! that must be set up once before use. Instead of initialising lazily on
//! first use, each engine owns an [`EngineLifecycle`] that records whether it
//! is uninitialised, ready, or shut down. Initialisation is idempotent;
//! shutdown is final.

use std::sync::Mutex;

use crate::error::ThumbnailError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    Uninitialized,
    Ready,
    ShutDown,
}

/// Lock-guarded lifecycle of one engine.
pub(crate) struct EngineLifecycle {
    name: &'static str,
    state: Mutex<EngineState>,
}

impl EngineLifecycle {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    /// Run `init` exactly once. Later calls are no-ops; calls after
    /// [`shutdown`](EngineLifecycle::shutdown) fail.
    pub(crate) fn ensure_ready<F>(&self, init: F) -> Result<(), ThumbnailError>
    where
        F: FnOnce() -> Result<(), ThumbnailError>,
    {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            EngineState::Ready => Ok(()),
            EngineState::ShutDown => Err(ThumbnailError::EngineShutdown(self.name)),
            EngineState::Uninitialized => {
                init()?;
                log::debug!("{} engine initialised", self.name);
                *state = EngineState::Ready;
                Ok(())
            }
        }
    }

    /// Mark the engine as shut down, running `teardown` if it was ever
    /// initialised. Returns `false` if it was already shut down.
    pub(crate) fn shutdown<F>(&self, teardown: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            EngineState::ShutDown => false,
            EngineState::Ready => {
                teardown();
                log::debug!("{} engine shut down", self.name);
                *state = EngineState::ShutDown;
                true
            }
            EngineState::Uninitialized => {
                *state = EngineState::ShutDown;
                true
            }
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn init_runs_once() {
        let lifecycle = EngineLifecycle::new("test");
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            lifecycle
                .ensure_ready(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), EngineState::Ready);
    }

    #[test]
    fn failed_init_can_be_retried() {
        let lifecycle = EngineLifecycle::new("test");
        let result = lifecycle.ensure_ready(|| Err(ThumbnailError::OutOfMemory));
        assert!(result.is_err());
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);
        lifecycle.ensure_ready(|| Ok(())).unwrap();
        assert_eq!(lifecycle.state(), EngineState::Ready);
    }

    #[test]
    fn use_after_shutdown_fails() {
        let lifecycle = EngineLifecycle::new("test");
        lifecycle.ensure_ready(|| Ok(())).unwrap();
        let mut torn_down = false;
        assert!(lifecycle.shutdown(|| torn_down = true));
        assert!(torn_down);
        assert!(!lifecycle.shutdown(|| unreachable!()));

        let error = lifecycle.ensure_ready(|| Ok(())).unwrap_err();
        assert!(matches!(error, ThumbnailError::EngineShutdown("test")));
    }
}
