// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Persist downloaded capture bytes to the local file system.
// Author: Lukas Bower

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

/// Writer callback filling a capture file as it streams in.
pub type FillFn<'a> = dyn FnMut(&mut dyn Write) -> io::Result<()> + 'a;

/// Destination for downloaded capture files.
pub trait CaptureSink: Send + Sync {
    /// Stream a capture through `fill` and return the committed path.
    ///
    /// Nothing is left at the destination when `fill` fails.
    fn persist(
        &self,
        node: &str,
        capture: &str,
        destination: Option<&Path>,
        fill: &mut FillFn<'_>,
    ) -> io::Result<PathBuf>;
}

impl<T: CaptureSink + ?Sized> CaptureSink for Arc<T> {
    fn persist(
        &self,
        node: &str,
        capture: &str,
        destination: Option<&Path>,
        fill: &mut FillFn<'_>,
    ) -> io::Result<PathBuf> {
        (**self).persist(node, capture, destination, fill)
    }
}

/// Sink writing `<dir>/<node>/<capture>.<extension>` atomically.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    extension: String,
}

impl DirectorySink {
    /// Create a sink rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    /// Return the default path for a capture.
    #[must_use]
    pub fn default_path(&self, node: &str, capture: &str) -> PathBuf {
        self.dir.join(self.relative_path(node, capture))
    }

    // Node names never contain '/', so one directory per node keeps paths unique.
    fn relative_path(&self, node: &str, capture: &str) -> PathBuf {
        Path::new(node).join(format!("{capture}.{}", self.extension))
    }

    fn resolve(&self, node: &str, capture: &str, destination: Option<&Path>) -> PathBuf {
        match destination {
            Some(path) if path.is_dir() => path.join(self.relative_path(node, capture)),
            Some(path) => path.to_path_buf(),
            None => self.default_path(node, capture),
        }
    }
}

impl CaptureSink for DirectorySink {
    fn persist(
        &self,
        node: &str,
        capture: &str,
        destination: Option<&Path>,
        fill: &mut FillFn<'_>,
    ) -> io::Result<PathBuf> {
        let path = self.resolve(node, capture, destination);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        let written = File::create(&tmp).and_then(|file| {
            let mut writer = BufWriter::new(file);
            fill(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            writer.get_ref().metadata().map(|meta| meta.len())
        });
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&tmp) {
                    warn!("capture tmp cleanup failed path={} error={cleanup}", tmp.display());
                }
                return Err(err);
            }
        };
        fs::rename(&tmp, &path)?;
        debug!(
            "capture persisted node={node} capture={capture} path={} bytes={bytes}",
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_all(bytes: &'static [u8]) -> impl FnMut(&mut dyn Write) -> io::Result<()> {
        move |out| out.write_all(bytes)
    }

    #[test]
    fn writes_default_and_explicit_paths() {
        let temp = TempDir::new().unwrap();
        let sink = DirectorySink::new(temp.path().join("out"), "pcap");
        let path = sink
            .persist("n1", "cap1", None, &mut write_all(b"pcap-bytes"))
            .unwrap();
        assert_eq!(path, temp.path().join("out/n1/cap1.pcap"));
        assert_eq!(fs::read(&path).unwrap(), b"pcap-bytes");

        let explicit = temp.path().join("elsewhere/trace.pcap");
        let path = sink
            .persist("n1", "cap1", Some(&explicit), &mut write_all(b"again"))
            .unwrap();
        assert_eq!(path, explicit);
        assert!(!temp.path().join("elsewhere/trace.tmp").exists());

        let into_dir = sink
            .persist("n2", "cap2", Some(temp.path()), &mut write_all(b"x"))
            .unwrap();
        assert_eq!(into_dir, temp.path().join("n2/cap2.pcap"));
    }

    #[test]
    fn hyphenated_node_and_capture_names_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let sink = DirectorySink::new(temp.path(), "pcap");
        let first = sink
            .persist("a-b", "c", None, &mut write_all(b"first"))
            .unwrap();
        let second = sink
            .persist("a", "b-c", None, &mut write_all(b"second"))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"first");
        assert_eq!(fs::read(&second).unwrap(), b"second");
    }

    #[test]
    fn failed_fill_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let sink = DirectorySink::new(temp.path(), "pcap");
        let err = sink
            .persist("n1", "cap1", None, &mut |out: &mut dyn Write| -> io::Result<()> {
                out.write_all(b"partial")?;
                Err(io::Error::other("stream broke"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "stream broke");
        assert!(!temp.path().join("n1/cap1.pcap").exists());
        assert!(!temp.path().join("n1/cap1.tmp").exists());
    }
}
