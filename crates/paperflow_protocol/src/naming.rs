use std::path::PathBuf;

use crate::defaults::CHANNEL_NAME_PREFIX;

/// Logical channel name for the worker with the given process id.
///
/// Derived only from the pid, so two live workers on one host never collide.
pub fn channel_name(pid: u32) -> String {
    format!("{}.{}", CHANNEL_NAME_PREFIX, pid)
}

/// Filesystem address of the channel: a Unix domain socket in the temp dir.
#[cfg(unix)]
pub fn channel_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", channel_name(pid)))
}

/// Filesystem address of the channel: a named pipe in the local pipe namespace.
#[cfg(windows)]
pub fn channel_path(pid: u32) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{}", channel_name(pid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_embeds_pid() {
        assert_eq!(channel_name(4242), "paperflow.worker.4242");
    }

    #[test]
    fn channel_paths_differ_per_pid() {
        assert_ne!(channel_path(1), channel_path(2));
        let path = channel_path(77).to_string_lossy().to_string();
        assert!(path.contains("paperflow.worker.77"));
    }
}
