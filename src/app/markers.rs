//! Marker files: crash-vs-freeze-vs-clean-exit history across restarts.
//!
//! One empty file per concern, named per install. The exec marker records
//! the owning pid; "still locked" is modeled as "owning pid still alive",
//! probed with a zero signal. What survives to the next startup, combined
//! with owner liveness, classifies the previous run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const EXEC_MARKER: &str = "gridview.exec_marker";
const LOGOUT_MARKER: &str = "gridview.logout_marker";
const LLERROR_MARKER: &str = "gridview.llerror_marker";
const ERROR_MARKER: &str = "gridview.error_marker";

/// How the previous run of this install ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastExecEvent {
    Normal,
    /// Exec marker left behind with a dead owner: the process froze.
    Froze,
    /// The error-reporting path wrote its marker before dying.
    LlerrorCrash,
    /// Crash without the error path having run (signal, external kill).
    OtherCrash,
    /// Froze while a logout was in flight.
    LogoutFroze,
    /// Crashed while a logout was in flight.
    LogoutCrash,
}

/// Everything the startup classification needs to know about the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MarkerObservations {
    pub exec_exists: bool,
    pub exec_owner_alive: bool,
    pub logout_exists: bool,
    pub llerror_exists: bool,
    pub error_exists: bool,
}

/// The decision table. Later rows refine earlier ones: a logout marker
/// upgrades a freeze to a logout freeze, and a crash marker on top of that
/// upgrades it to a logout crash.
pub(crate) fn classify(obs: &MarkerObservations) -> LastExecEvent {
    let mut event = LastExecEvent::Normal;
    if obs.exec_exists && !obs.exec_owner_alive {
        event = LastExecEvent::Froze;
    }
    if obs.logout_exists {
        event = LastExecEvent::LogoutFroze;
    }
    if obs.llerror_exists {
        event = if event == LastExecEvent::LogoutFroze {
            LastExecEvent::LogoutCrash
        } else {
            LastExecEvent::LlerrorCrash
        };
    }
    if obs.error_exists {
        event = if event == LastExecEvent::LogoutFroze {
            LastExecEvent::LogoutCrash
        } else {
            LastExecEvent::OtherCrash
        };
    }
    event
}

pub struct MarkerFiles {
    exec_path: PathBuf,
    logout_path: PathBuf,
    llerror_path: PathBuf,
    error_path: PathBuf,
    owns_exec: bool,
    owns_logout: bool,
}

impl MarkerFiles {
    pub fn new(dir: &Path) -> Self {
        Self {
            exec_path: dir.join(EXEC_MARKER),
            logout_path: dir.join(LOGOUT_MARKER),
            llerror_path: dir.join(LLERROR_MARKER),
            error_path: dir.join(ERROR_MARKER),
            owns_exec: false,
            owns_logout: false,
        }
    }

    /// Whether a live process holds the exec marker.
    pub fn another_instance_running(&self) -> bool {
        exec_marker_owner(&self.exec_path)
            .map(process_alive)
            .unwrap_or(false)
    }

    /// Pid of a live instance other than this process, if one holds the
    /// exec marker.
    pub fn live_instance_pid(&self) -> Option<i32> {
        let pid = exec_marker_owner(&self.exec_path)?;
        if pid == std::process::id() as i32 {
            return None;
        }
        process_alive(pid).then_some(pid)
    }

    /// Classify the previous run, consume the crash markers, and (unless a
    /// live instance holds it) claim the exec marker for this process.
    pub fn startup(&mut self) -> io::Result<LastExecEvent> {
        let event = classify(&self.observe());
        // Consumed once read; the next launch starts from a clean slate.
        let _ = fs::remove_file(&self.logout_path);
        let _ = fs::remove_file(&self.llerror_path);
        let _ = fs::remove_file(&self.error_path);

        if self.another_instance_running() {
            // No new markers while another instance owns the install.
            return Ok(event);
        }
        if let Some(parent) = self.exec_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.exec_path, std::process::id().to_string())?;
        self.owns_exec = true;
        tracing::debug!(path = %self.exec_path.display(), "exec marker claimed");
        Ok(event)
    }

    fn observe(&self) -> MarkerObservations {
        MarkerObservations {
            exec_exists: self.exec_path.exists(),
            exec_owner_alive: exec_marker_owner(&self.exec_path)
                .map(process_alive)
                .unwrap_or(false),
            logout_exists: self.logout_path.exists(),
            llerror_exists: self.llerror_path.exists(),
            error_exists: self.error_path.exists(),
        }
    }

    /// Written when a logout request goes out; removed on clean exit.
    pub fn create_logout_marker(&mut self) {
        match fs::write(&self.logout_path, b"") {
            Ok(()) => self.owns_logout = true,
            Err(err) => tracing::warn!(
                path = %self.logout_path.display(),
                "cannot create logout marker: {err}"
            ),
        }
    }

    /// Handle the crash-reporting path can use without borrowing the set.
    pub fn crash_marker_writer(&self) -> CrashMarkerWriter {
        CrashMarkerWriter {
            llerror_path: self.llerror_path.clone(),
            error_path: self.error_path.clone(),
        }
    }

    /// Remove markers on clean exit. `leave_logout_marker` keeps the logout
    /// marker so a quit-during-logout is classified on the next launch.
    /// Only markers this process created are touched.
    pub fn remove_markers(&mut self, leave_logout_marker: bool) {
        if self.owns_exec {
            let _ = fs::remove_file(&self.exec_path);
            self.owns_exec = false;
        }
        if self.owns_logout && !leave_logout_marker {
            let _ = fs::remove_file(&self.logout_path);
            self.owns_logout = false;
        }
    }
}

/// Crash-marker writing decoupled from `MarkerFiles` so fatal handlers and
/// the watchdog can hold one without a lifetime into the app context.
#[derive(Debug, Clone)]
pub struct CrashMarkerWriter {
    llerror_path: PathBuf,
    error_path: PathBuf,
}

impl CrashMarkerWriter {
    /// The error-reporting path reached the point of writing its marker.
    pub fn write_llerror_marker(&self) {
        let _ = fs::write(&self.llerror_path, b"");
    }

    /// Generic-crash marker for failures outside the error path.
    pub fn write_error_marker(&self) {
        let _ = fs::write(&self.error_path, b"");
    }
}

fn exec_marker_owner(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(pid, 0) probes process existence without sending a signal.
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
        matches!(
            io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::EPERM
        )
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    // Without a liveness probe, treat a leftover marker as a freeze rather
    // than refusing to start.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_DIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    fn test_dir(label: &str) -> PathBuf {
        let seq = TEST_DIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "gridview-markers-{label}-{}-{seq}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    #[cfg(unix)]
    fn missing_pid() -> i32 {
        let current = std::process::id() as i32;
        let mut candidate = current + 10_000;
        for _ in 0..2000 {
            if !process_alive(candidate) {
                return candidate;
            }
            candidate += 1;
        }
        candidate
    }

    #[test]
    fn clean_slate_classifies_as_normal() {
        assert_eq!(
            classify(&MarkerObservations::default()),
            LastExecEvent::Normal
        );
    }

    #[test]
    fn classification_decision_table() {
        let froze = MarkerObservations {
            exec_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&froze), LastExecEvent::Froze);

        let still_running = MarkerObservations {
            exec_exists: true,
            exec_owner_alive: true,
            ..Default::default()
        };
        assert_eq!(classify(&still_running), LastExecEvent::Normal);

        let logout_froze = MarkerObservations {
            logout_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&logout_froze), LastExecEvent::LogoutFroze);

        let llerror = MarkerObservations {
            llerror_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&llerror), LastExecEvent::LlerrorCrash);

        let other = MarkerObservations {
            error_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&other), LastExecEvent::OtherCrash);

        let logout_crash = MarkerObservations {
            logout_exists: true,
            llerror_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&logout_crash), LastExecEvent::LogoutCrash);

        let logout_then_generic = MarkerObservations {
            logout_exists: true,
            error_exists: true,
            ..Default::default()
        };
        assert_eq!(classify(&logout_then_generic), LastExecEvent::LogoutCrash);
    }

    #[test]
    fn startup_claims_exec_marker_and_cleans_up() {
        let dir = test_dir("claim");
        let mut markers = MarkerFiles::new(&dir);
        let event = markers.startup().expect("startup");
        assert_eq!(event, LastExecEvent::Normal);
        assert!(dir.join(EXEC_MARKER).exists());
        // Our own pid is alive, so a second observer sees a running instance.
        let other = MarkerFiles::new(&dir);
        assert!(other.another_instance_running());

        markers.remove_markers(false);
        assert!(!dir.join(EXEC_MARKER).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn stale_exec_marker_reads_as_freeze() {
        let dir = test_dir("freeze");
        fs::write(dir.join(EXEC_MARKER), missing_pid().to_string()).expect("write marker");
        let mut markers = MarkerFiles::new(&dir);
        assert!(!markers.another_instance_running());
        let event = markers.startup().expect("startup");
        assert_eq!(event, LastExecEvent::Froze);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn logout_marker_alone_reads_as_logout_freeze_and_is_consumed() {
        let dir = test_dir("logout-froze");
        fs::write(dir.join(LOGOUT_MARKER), b"").expect("write marker");
        let mut markers = MarkerFiles::new(&dir);
        let event = markers.startup().expect("startup");
        assert_eq!(event, LastExecEvent::LogoutFroze);
        assert!(
            !dir.join(LOGOUT_MARKER).exists(),
            "logout marker must be consumed once read"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn crash_markers_are_consumed_on_startup() {
        let dir = test_dir("crash-consume");
        fs::write(dir.join(LLERROR_MARKER), b"").expect("write marker");
        let mut markers = MarkerFiles::new(&dir);
        assert_eq!(markers.startup().expect("startup"), LastExecEvent::LlerrorCrash);
        assert!(!dir.join(LLERROR_MARKER).exists());

        // Next startup is clean again.
        let mut second = MarkerFiles::new(&dir);
        // The first instance (us) still holds the exec marker, so no freeze.
        assert_eq!(second.startup().expect("startup"), LastExecEvent::Normal);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn crash_marker_writer_round_trips() {
        let dir = test_dir("writer");
        let markers = MarkerFiles::new(&dir);
        let writer = markers.crash_marker_writer();
        writer.write_llerror_marker();
        writer.write_error_marker();
        assert!(dir.join(LLERROR_MARKER).exists());
        assert!(dir.join(ERROR_MARKER).exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn logout_marker_can_be_left_for_next_launch() {
        let dir = test_dir("leave-logout");
        let mut markers = MarkerFiles::new(&dir);
        markers.startup().expect("startup");
        markers.create_logout_marker();
        markers.remove_markers(true);
        assert!(dir.join(LOGOUT_MARKER).exists());
        assert!(!dir.join(EXEC_MARKER).exists());
        let _ = fs::remove_dir_all(dir);
    }
}
