//! Completion markers on the node

use keel_common::Result;

use crate::executor::{shell_quote, RemoteExecutor};

/// Directory holding one empty file per completed (sub-)step
pub const SENTINEL_DIR: &str = "/var/lib/keel/sentinel";

/// Path of the sentinel for `name`
pub fn path(name: &str) -> String {
    format!("{SENTINEL_DIR}/{name}")
}

/// Whether `name` already completed on this node
pub async fn is_done(exec: &dyn RemoteExecutor, name: &str) -> Result<bool> {
    exec.exists(&path(name)).await
}

/// Record that `name` completed
pub async fn mark_done(exec: &dyn RemoteExecutor, name: &str) -> Result<()> {
    exec.write_file(b"", &path(name)).await
}

/// Shell snippet removing every sentinel
pub fn clear_all_command() -> String {
    format!("rm -rf {}", shell_quote(SENTINEL_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(path("system-prep.swap"), "/var/lib/keel/sentinel/system-prep.swap");
        assert_eq!(clear_all_command(), "rm -rf '/var/lib/keel/sentinel'");
    }
}
