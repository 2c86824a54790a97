//! Windowing/input collaborator interface consumed by the lifecycle.
//!
//! The widget toolkit, GL, and input devices live behind this trait. The
//! lifecycle only needs the handful of calls below; everything here must be
//! non-blocking except `init_window`, which the watchdog is paused around.

use crate::app::markers::LastExecEvent;
use crate::error::LifecycleError;

pub trait Frontend {
    /// Bring up the window and GL. May fail on unmet GL requirements.
    fn init_window(&mut self) -> Result<(), LifecycleError>;

    fn init_joystick(&mut self);

    /// Pump OS-level window events.
    fn process_native_events(&mut self);

    fn gather_input(&mut self);

    fn scan_joystick(&mut self);

    fn scan_keyboard(&mut self);

    fn window_visible(&self) -> bool;

    fn window_minimized(&self) -> bool;

    fn has_focus(&self) -> bool;

    /// Open modal dialogs; logout waits for zero.
    fn modal_dialog_count(&self) -> usize;

    fn close_all_floaters(&mut self);

    fn all_floaters_closed(&self) -> bool;

    fn show_progress(&mut self, show: bool);

    fn set_progress(&mut self, percent: f32, message: &str);

    /// Render one frame.
    fn display(&mut self);

    fn save_final_snapshot(&mut self);

    /// Tell the user how the previous run ended; `false` means they chose
    /// not to continue.
    fn confirm_previous_crash(&mut self, event: LastExecEvent) -> bool;

    fn shutdown_window(&mut self);
}

/// Frontend with no window at all. Used by the binary until a display layer
/// is wired in, and by tests that drive the lifecycle directly.
#[derive(Debug, Clone)]
pub struct HeadlessFrontend {
    pub visible: bool,
    pub minimized: bool,
    pub focused: bool,
    pub modal_dialogs: usize,
    pub floaters_open: usize,
    pub frames_displayed: u64,
    pub snapshots_saved: u32,
    pub progress_shown: bool,
    pub progress: Option<(f32, String)>,
    pub accept_crash_prompt: bool,
    pub fail_window_init: bool,
    pub window_initialized: bool,
}

impl Default for HeadlessFrontend {
    fn default() -> Self {
        Self {
            visible: true,
            minimized: false,
            focused: true,
            modal_dialogs: 0,
            floaters_open: 0,
            frames_displayed: 0,
            snapshots_saved: 0,
            progress_shown: false,
            progress: None,
            accept_crash_prompt: true,
            fail_window_init: false,
            window_initialized: false,
        }
    }
}

impl HeadlessFrontend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Frontend for HeadlessFrontend {
    fn init_window(&mut self) -> Result<(), LifecycleError> {
        if self.fail_window_init {
            return Err(LifecycleError::WindowInit(
                "display does not meet GL requirements".to_string(),
            ));
        }
        self.window_initialized = true;
        Ok(())
    }

    fn init_joystick(&mut self) {}

    fn process_native_events(&mut self) {}

    fn gather_input(&mut self) {}

    fn scan_joystick(&mut self) {}

    fn scan_keyboard(&mut self) {}

    fn window_visible(&self) -> bool {
        self.visible
    }

    fn window_minimized(&self) -> bool {
        self.minimized
    }

    fn has_focus(&self) -> bool {
        self.focused
    }

    fn modal_dialog_count(&self) -> usize {
        self.modal_dialogs
    }

    fn close_all_floaters(&mut self) {
        self.floaters_open = 0;
    }

    fn all_floaters_closed(&self) -> bool {
        self.floaters_open == 0
    }

    fn show_progress(&mut self, show: bool) {
        self.progress_shown = show;
    }

    fn set_progress(&mut self, percent: f32, message: &str) {
        self.progress = Some((percent, message.to_string()));
    }

    fn display(&mut self) {
        self.frames_displayed += 1;
    }

    fn save_final_snapshot(&mut self) {
        self.snapshots_saved += 1;
    }

    fn confirm_previous_crash(&mut self, _event: LastExecEvent) -> bool {
        self.accept_crash_prompt
    }

    fn shutdown_window(&mut self) {
        self.window_initialized = false;
    }
}
