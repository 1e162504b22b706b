use tokio::process::Child;

/// Handle to a child's process group. Children are spawned as their own
/// group leaders, so the group id equals the child pid and a group
/// signal reaches every descendant that has not detached into a new
/// session of its own.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    pub fn of(child: &Child) -> Self {
        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .filter(|pid| *pid > 0);
        Self { pgid }
    }

    #[cfg(unix)]
    pub fn terminate(&self) {
        self.signal_all(libc::SIGTERM);
    }

    #[cfg(unix)]
    pub fn force_kill(&self) {
        self.signal_all(libc::SIGKILL);
    }

    #[cfg(unix)]
    fn signal_all(&self, signal: i32) {
        if let Some(pgid) = self.pgid {
            // ESRCH just means the group already exited
            unsafe {
                libc::killpg(pgid, signal);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) {}

    #[cfg(not(unix))]
    pub fn force_kill(&self) {}
}
