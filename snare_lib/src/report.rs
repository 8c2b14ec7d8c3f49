use std::{
    fs::{create_dir_all, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use log::info;

/// Persists opaque report buffers into a directory, one file per report.
///
/// Files are named `<posix seconds>_<counter>_<event>.bin` and are created
/// exclusively, so a report is never appended to or overwritten.
#[derive(Debug)]
pub struct ReportSink {
    dir: PathBuf,
    counter: AtomicU64,
}

impl ReportSink {
    /// Creates `dir` (and any missing parents).
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `buf` to a fresh file and returns its path.
    pub fn persist(&self, event: &str, buf: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.join(format!(
            "{}_{}_{}.bin",
            Utc::now().timestamp(),
            self.counter.fetch_add(1, Ordering::Relaxed),
            sanitize(event)
        ));

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(buf)?;
        info!("Logged report: {} ({} bytes)", event, buf.len());
        Ok(path)
    }
}

/// Event names come from the traced program; keep them to one path
/// component.
fn sanitize(event: &str) -> String {
    let name = event
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>();
    if name.is_empty() || name == "." || name == ".." {
        "unnamed".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn creates_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        let sink = ReportSink::create(root.path().join("prepo").join("xde")).unwrap();
        assert!(sink.dir().is_dir());
    }

    #[test]
    fn each_report_gets_its_own_file() {
        let root = tempfile::tempdir().unwrap();
        let sink = ReportSink::create(root.path()).unwrap();

        let first = sink.persist("save_data", b"\x01\x02").unwrap();
        let second = sink.persist("save_data", b"\x03").unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"\x01\x02");
        assert_eq!(fs::read(&second).unwrap(), b"\x03");

        let name = first.file_name().unwrap().to_str().unwrap();
        let parts = name.split('_').collect::<Vec<_>>();
        assert!(parts[0].parse::<i64>().is_ok());
        assert_eq!(parts[1], "0");
        assert!(name.ends_with("_save_data.bin"));
    }

    #[test]
    fn event_names_stay_inside_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let sink = ReportSink::create(root.path()).unwrap();

        let path = sink.persist("../escape", b"x").unwrap();
        assert_eq!(path.parent(), Some(root.path()));
        assert!(path.to_str().unwrap().ends_with(".._escape.bin"));
    }
}
