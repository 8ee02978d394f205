// Shared identity helpers and limit types used across crates.
use serde::{Deserialize, Serialize};

/// Process-identity helpers.
///
/// A peer's identity on the wire is its OS process id; the name lookup is
/// used to render identities for logs and to validate registrations.
pub mod identity {
    use std::fmt;

    /// Identity of the calling process.
    pub fn current() -> i32 {
        std::process::id() as i32
    }

    /// Short command name of a local process, if it is still alive.
    pub fn process_name(pid: i32) -> Option<String> {
        if pid <= 0 {
            return None;
        }
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
        let name = comm.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Render an identity as `name(pid)` for logs, falling back to the pid
    /// alone when the process is gone.
    ///
    /// ```
    /// use crossbar_common::identity;
    ///
    /// let me = identity::current();
    /// assert!(identity::describe(me).contains(&me.to_string()));
    /// ```
    pub fn describe(pid: i32) -> String {
        match process_name(pid) {
            Some(name) => format!("{name}({pid})"),
            None => pid.to_string(),
        }
    }

    /// Display adapter for structured log fields.
    pub struct Describe(pub i32);

    impl fmt::Display for Describe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&describe(self.0))
        }
    }
}

/// Buffer and payload bounds shared by broker and peers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    /// Capacity the broker negotiates for a subscriber's receive buffer.
    pub recv_buffer_bytes: usize,
    /// Per-peer outgoing queue depth before notifications are dropped.
    pub send_queue_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: 8 * 1024,
            send_queue_depth: 256,
        }
    }
}
