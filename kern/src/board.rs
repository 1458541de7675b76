//! Seam toward the board support package.
//!
//! Pin bring-up and the system-ready output are external collaborators; the
//! runtime only ever talks to them through this trait. The default
//! implementation does nothing, which keeps the core runnable with no
//! hardware (or simulated hardware) attached.

/// Board operations the runtime needs.
pub trait Board: Send + Sync {
    /// Drives the system-ready digital output: asserted when the system
    /// enters `Run`, deasserted when it leaves.
    fn set_ready(&self, on: bool);

    /// Configures `gpio` as an input with the requested internal pull.
    /// Called once, on the first subscription for the pin.
    fn configure_input(&self, gpio: u8, pull_down: bool);
}

/// Board with nothing behind it.
pub struct NullBoard;

impl Board for NullBoard {
    fn set_ready(&self, _on: bool) {}
    fn configure_input(&self, _gpio: u8, _pull_down: bool) {}
}
