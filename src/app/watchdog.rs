//! Dead-man's switch for main-loop stalls.
//!
//! The main thread pings with a named state string at each major phase and
//! pauses the watchdog around work that may legitimately block (disk IO,
//! blocking reads). Missing the timeout while unpaused fires the fatal
//! callback once, with the last state string so the report names the phase
//! that hung.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::lock_or_recover;

pub type TimeoutCallback = Box<dyn Fn(&str) + Send + Sync + 'static>;

struct WatchdogShared {
    epoch: Instant,
    timeout_ms: u64,
    last_ping_ms: AtomicU64,
    paused: AtomicBool,
    shutdown: AtomicBool,
    tripped: AtomicBool,
    state: Mutex<String>,
    on_timeout: TimeoutCallback,
}

impl WatchdogShared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }
}

pub struct WatchdogTimeout {
    shared: Arc<WatchdogShared>,
    handle: Option<JoinHandle<()>>,
}

impl WatchdogTimeout {
    pub fn new(timeout: Duration, on_timeout: TimeoutCallback) -> io::Result<Self> {
        let timeout_ms = timeout.as_millis().max(1).min(u128::from(u64::MAX)) as u64;
        let shared = Arc::new(WatchdogShared {
            epoch: Instant::now(),
            timeout_ms,
            last_ping_ms: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
            state: Mutex::new(String::new()),
            on_timeout,
        });
        let monitor_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || monitor_loop(monitor_shared))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Note forward progress. Cheap enough to call several times per frame.
    pub fn ping(&self, state: &str) {
        self.shared
            .last_ping_ms
            .store(self.shared.now_ms(), Ordering::Relaxed);
        let mut current = lock_or_recover(&self.shared.state, "watchdog::ping");
        if current.as_str() != state {
            current.clear();
            current.push_str(state);
        }
    }

    /// Suspend hang detection around legitimately-blocking work.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    /// Resume detection; the clock restarts so paused time is not counted.
    pub fn resume(&self) {
        self.shared
            .last_ping_ms
            .store(self.shared.now_ms(), Ordering::Relaxed);
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    pub fn has_tripped(&self) -> bool {
        self.shared.tripped.load(Ordering::Relaxed)
    }

    pub fn destroy(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchdogTimeout {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(shared: Arc<WatchdogShared>) {
    let poll = Duration::from_millis((shared.timeout_ms / 4).clamp(10, 250));
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !shared.paused.load(Ordering::Relaxed) && !shared.tripped.load(Ordering::Relaxed) {
            let elapsed = shared
                .now_ms()
                .saturating_sub(shared.last_ping_ms.load(Ordering::Relaxed));
            if elapsed > shared.timeout_ms {
                shared.tripped.store(true, Ordering::Relaxed);
                let state = lock_or_recover(&shared.state, "watchdog::monitor_loop").clone();
                tracing::error!(state = %state, "main loop missed the watchdog deadline");
                (shared.on_timeout)(&state);
            }
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn watchdog_with_channel(
        timeout: Duration,
    ) -> (WatchdogTimeout, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let watchdog = WatchdogTimeout::new(
            timeout,
            Box::new(move |state| {
                let _ = tx.send(state.to_string());
            }),
        )
        .expect("spawn watchdog");
        (watchdog, rx)
    }

    #[test]
    fn missed_pings_trip_the_watchdog_with_last_state() {
        let (watchdog, rx) = watchdog_with_channel(Duration::from_millis(80));
        watchdog.ping("main:idle");
        let state = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("watchdog should trip");
        assert_eq!(state, "main:idle");
        assert!(watchdog.has_tripped());
        watchdog.destroy();
    }

    #[test]
    fn regular_pings_keep_it_quiet() {
        let (watchdog, rx) = watchdog_with_channel(Duration::from_millis(150));
        for _ in 0..10 {
            watchdog.ping("main:display");
            thread::sleep(Duration::from_millis(30));
        }
        assert!(rx.try_recv().is_err());
        assert!(!watchdog.has_tripped());
        watchdog.destroy();
    }

    #[test]
    fn paused_watchdog_does_not_trip() {
        let (watchdog, rx) = watchdog_with_channel(Duration::from_millis(80));
        watchdog.ping("main:sleep");
        watchdog.pause();
        thread::sleep(Duration::from_millis(300));
        assert!(rx.try_recv().is_err(), "paused watchdog must stay quiet");

        // Resuming restarts the clock rather than counting the paused gap.
        watchdog.resume();
        watchdog.ping("main:end");
        assert!(!watchdog.has_tripped());
        watchdog.destroy();
    }
}
