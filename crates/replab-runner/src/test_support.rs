use replab_core::ensure_dir;
use std::fs;
use std::path::PathBuf;

/// Unique directory under the system temp dir, removed on drop.
pub(crate) struct TempDirGuard {
    pub(crate) path: PathBuf,
}

impl TempDirGuard {
    pub(crate) fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
