//! Stdout/stderr capture files for tracked processes.
//!
//! Each launched process gets two append-only temp files its output is
//! redirected into. They are readable while the process runs (partial
//! output) and removed once the final result has been collected. Callers
//! serialize reads against removal with the tracker's cleanup lock.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Paths of the two capture files backing one process.
#[derive(Debug)]
pub(crate) struct CaptureFiles {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl CaptureFiles {
    /// Create a capture file pair in `dir`, returning the open handles the
    /// child's stdio is redirected into.
    pub(crate) fn create(dir: &Path) -> io::Result<(Self, File, File)> {
        let (stdout_file, stdout_path) = tempfile::Builder::new()
            .prefix("cmd_out_")
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;
        let (stderr_file, stderr_path) = tempfile::Builder::new()
            .prefix("cmd_err_")
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;

        debug!(
            stdout_path = %stdout_path.display(),
            stderr_path = %stderr_path.display(),
            "Created capture files"
        );

        Ok((
            Self {
                stdout_path,
                stderr_path,
            },
            stdout_file,
            stderr_file,
        ))
    }

    pub(crate) fn read_stdout(&self) -> String {
        read_capture(&self.stdout_path)
    }

    pub(crate) fn read_stderr(&self) -> String {
        read_capture(&self.stderr_path)
    }

    /// Remove both capture files. Failure is logged, never escalated: it
    /// must not mask the operation's actual result.
    pub(crate) fn remove(&self) {
        for path in [&self.stdout_path, &self.stderr_path] {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove capture file");
            }
        }
    }
}

fn read_capture(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Capture file does not exist");
            String::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error reading capture file");
            format!("[Error reading output: {e}]")
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capture_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let (capture, mut stdout, _stderr) = CaptureFiles::create(dir.path()).unwrap();

        use std::io::Write;
        stdout.write_all(b"partial output").unwrap();
        stdout.flush().unwrap();

        assert_eq!(capture.read_stdout(), "partial output");
        assert_eq!(capture.read_stderr(), "");

        capture.remove();
        // Reading after removal reports empty rather than erroring.
        assert_eq!(capture.read_stdout(), "");
        // Removal is idempotent.
        capture.remove();
    }
}
