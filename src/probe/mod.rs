//! Seam between the tracking core and the OS. A real [FocusProbe] implementation
//! (X11, Windows, macOS) lives outside this crate; the core only consumes the
//! two signals below.

use std::sync::Arc;

use anyhow::Result;

/// Snapshot of whatever window currently holds focus.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    /// Short application name, for example 'firefox'.
    pub app_name: Arc<str>,
    /// Title of the focused window, for example 'Inbox - Mail'.
    pub window_title: Arc<str>,
    pub process_id: u32,
    /// Full path to the executable, when the platform exposes it.
    pub executable_path: Arc<str>,
}

/// Contract every platform integration must implement.
#[cfg_attr(test, mockall::automock)]
pub trait FocusProbe: Send + 'static {
    fn current_window(&mut self) -> Result<WindowSnapshot>;

    /// Seconds since the last user input.
    fn idle_seconds(&mut self) -> Result<f64>;
}

impl FocusProbe for Box<dyn FocusProbe> {
    fn current_window(&mut self) -> Result<WindowSnapshot> {
        (**self).current_window()
    }

    fn idle_seconds(&mut self) -> Result<f64> {
        (**self).idle_seconds()
    }
}

/// Resolves the probe for the platform this binary was built for. The tracking
/// core itself is platform-agnostic; integrations register here.
pub fn platform_probe() -> Result<Box<dyn FocusProbe>> {
    anyhow::bail!(
        "this build carries no OS focus probe; link a platform integration implementing FocusProbe"
    )
}
