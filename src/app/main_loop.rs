//! The cooperative main loop: input, idle, render, and a bounded service
//! window for the background workers, with watchdog pings at each phase.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::LifecycleError;

use super::fatal;
use super::memsim::SimulatedOom;
use super::watchdog::WatchdogTimeout;
use super::{AppContext, FRAME_STALL_THRESHOLD};

const IO_BACKLOG_SLEEP_THRESHOLD: usize = 1000;

impl AppContext {
    /// Run until something sets the exiting flag. Returns only after the
    /// final snapshot is taken and the watchdog is gone.
    pub fn main_loop(&mut self) -> Result<(), LifecycleError> {
        // The watchdog lives exactly as long as the loop.
        if self.config.watchdog && self.watchdog.is_none() {
            let writer = self.markers.crash_marker_writer();
            let timeout = Duration::from_secs_f32(self.config.watchdog_timeout_secs);
            self.watchdog = Some(WatchdogTimeout::new(
                timeout,
                Box::new(move |state| {
                    writer.write_llerror_marker();
                    fatal::raise_fatal(state);
                }),
            )?);
        }
        self.resume_watchdog();

        let mut frame_timer = Instant::now();
        while !self.exiting {
            if let Err(SimulatedOom) = self.run_frame(&mut frame_timer) {
                // Failed allocation mid-frame. Survivable only while the
                // leak simulator is the cause; otherwise session state can
                // no longer be trusted.
                match self.memsim.as_mut() {
                    Some(sim) if sim.is_active() => {
                        sim.stop();
                        tracing::warn!(
                            "allocation failure from the leak simulator; simulator stopped"
                        );
                    }
                    _ => {
                        self.pause_watchdog();
                        fatal::raise_fatal("allocation failure in the main loop");
                    }
                }
            }
        }

        // Keep a snapshot for next time, if we made it through startup.
        if self.startup_complete {
            self.frontend.save_final_snapshot();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.destroy();
        }
        tracing::info!("exiting main loop");
        Ok(())
    }

    fn run_frame(&mut self, frame_timer: &mut Instant) -> Result<(), SimulatedOom> {
        if let Some(signal) = &self.quit_signal {
            if signal() {
                tracing::info!("external quit signal");
                self.logout.quit_requested = true;
                self.force_quit();
            }
        }

        self.ping_watchdog("main:native_events");
        self.frontend.process_native_events();

        self.ping_watchdog("main:gather_input");
        self.frontend.gather_input();

        if let Some(sim) = self.memsim.as_mut() {
            sim.idle()?;
        }

        if !self.exiting {
            self.ping_watchdog("main:joystick_keyboard");
            // Movement keys only once startup finished and the window can
            // meaningfully receive them.
            if self.startup_complete
                && self.frontend.window_visible()
                && !self.frontend.window_minimized()
                && self.frontend.has_focus()
            {
                self.frontend.scan_joystick();
                self.frontend.scan_keyboard();
            }

            {
                // Message handling can legitimately stall on disk or a
                // blocking read; that is not a hang.
                self.pause_watchdog();
                let now = Instant::now();
                self.idle(now);
                self.resume_watchdog();
            }

            if self.do_disconnect && self.startup_complete {
                self.pause_watchdog();
                self.frontend.save_final_snapshot();
                self.disconnect_viewer();
                self.resume_watchdog();
            }

            if !self.exiting {
                self.ping_watchdog("main:display");
                self.frontend.display();
            }
        }

        self.ping_watchdog("main:sleep");
        self.pause_watchdog();

        if self.config.yield_time_ms >= 0 {
            thread::sleep(Duration::from_millis(self.config.yield_time_ms as u64));
        }

        // Yield cooperatively when backgrounded, parking the decode workers
        // for the duration.
        if !self.frontend.window_visible() || !self.frontend.has_focus() {
            let yield_ms = self.config.background_yield_ms;
            if yield_ms > 0 {
                thread::sleep(Duration::from_millis(yield_ms));
                if let Some(workers) = &self.workers {
                    workers.pause_render_sensitive();
                }
            }
        }

        self.service_workers();

        // Decode workers must not race the next render pass when the client
        // runs single-threaded.
        if !self.config.run_multiple_threads {
            if let Some(workers) = &self.workers {
                workers.pause_render_sensitive();
            }
        }

        if self.startup_complete && frame_timer.elapsed() > FRAME_STALL_THRESHOLD {
            self.frame.frame_stalls += 1;
        }
        *frame_timer = Instant::now();

        self.resume_watchdog();
        self.ping_watchdog("main:end");
        Ok(())
    }

    /// Service the background workers until no work remains or this frame's
    /// budget is spent: 50 ms of service per second of frame time, capped at
    /// 5 ms per frame, zero when the workers free-run on their own threads.
    fn service_workers(&mut self) {
        let Some(workers) = &self.workers else {
            return;
        };
        let max_idle_time = if self.config.run_multiple_threads {
            Duration::ZERO
        } else {
            let frame_secs = self.frame.dt_clamped.as_secs_f64();
            Duration::from_secs_f64((0.05 * frame_secs).min(0.005))
        };
        let service_start = Instant::now();
        loop {
            let (work_pending, io_pending) = workers.update_all(1);
            if io_pending > IO_BACKLOG_SLEEP_THRESHOLD {
                // Let the IO threads catch up before queueing more on top.
                thread::sleep(Duration::from_millis(((io_pending / 100).min(100)) as u64));
            }
            if work_pending == 0 || service_start.elapsed() >= max_idle_time {
                break;
            }
        }
    }
}
