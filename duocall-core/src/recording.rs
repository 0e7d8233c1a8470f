//! Recording collaborator and per-session recorder state
//!
//! Recorder failures are logged, never fatal: a call proceeds unrecorded
//! when a recorder cannot be created, and a failed write drops that frame.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What a recorder captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    Audio,
    Video,
    Data,
}

impl RecorderKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Data => "data",
        }
    }
}

/// One open recording target.
pub trait Recorder: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Creates recorders; the implementation decides the container format.
pub trait RecorderFactory: Send + Sync {
    fn open(&self, kind: RecorderKind, codec: &str, path: &Path) -> Result<Box<dyn Recorder>>;
}

pub(crate) struct ActiveRecorder {
    pub(crate) path: PathBuf,
    recorder: Box<dyn Recorder>,
}

impl ActiveRecorder {
    pub(crate) fn new(path: PathBuf, recorder: Box<dyn Recorder>) -> Self {
        Self { path, recorder }
    }
}

/// Recording file paths collected when a session's recorders are closed.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingPaths {
    pub(crate) audio: Option<PathBuf>,
    pub(crate) video: Option<PathBuf>,
    pub(crate) data: Option<PathBuf>,
}

impl RecordingPaths {
    pub(crate) fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.data.is_none()
    }
}

/// The recorders of one session, guarded by the session's recorder lock.
#[derive(Default)]
pub(crate) struct RecorderSet {
    pub(crate) audio: Option<ActiveRecorder>,
    pub(crate) video: Option<ActiveRecorder>,
    pub(crate) data: Option<ActiveRecorder>,
}

impl RecorderSet {
    pub(crate) fn write_audio(&mut self, frame: &[u8]) {
        Self::write_slot(&mut self.audio, frame);
    }

    pub(crate) fn write_video(&mut self, frame: &[u8]) {
        Self::write_slot(&mut self.video, frame);
    }

    pub(crate) fn write_data(&mut self, frame: &[u8]) {
        Self::write_slot(&mut self.data, frame);
    }

    fn write_slot(slot: &mut Option<ActiveRecorder>, frame: &[u8]) {
        if let Some(active) = slot.as_mut() {
            if let Err(error) = active.recorder.write_frame(frame) {
                warn!(path = %active.path.display(), %error, "recorder write failed, dropping frame");
            }
        }
    }

    /// Close everything, reporting the file paths that were written.
    pub(crate) fn close_all(&mut self) -> RecordingPaths {
        let mut paths = RecordingPaths::default();
        for (slot, out) in [
            (&mut self.audio, &mut paths.audio),
            (&mut self.video, &mut paths.video),
            (&mut self.data, &mut paths.data),
        ] {
            if let Some(mut active) = slot.take() {
                if let Err(error) = active.recorder.close() {
                    warn!(path = %active.path.display(), %error, "recorder close failed");
                }
                *out = Some(active.path);
            }
        }
        paths
    }
}

/// A minimal file-backed recorder: raw frames, each prefixed with its
/// big-endian length, appended to one file per media kind.
pub struct FileRecorder {
    writer: BufWriter<File>,
}

impl Recorder for FileRecorder {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let len = u32::try_from(frame.len()).context("frame too large")?;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(frame)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Factory for [`FileRecorder`]s; creates missing parent directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRecorderFactory;

impl RecorderFactory for FileRecorderFactory {
    fn open(&self, kind: RecorderKind, codec: &str, path: &Path) -> Result<Box<dyn Recorder>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating record dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {} recording {}", kind.as_str(), path.display()))?;
        let _ = codec;
        Ok(Box::new(FileRecorder {
            writer: BufWriter::new(file),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_recorder_writes_length_prefixed_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alice-1_audio");
        let factory = FileRecorderFactory;
        let mut recorder = factory
            .open(RecorderKind::Audio, "opus", &path)
            .expect("recorder opens");
        recorder.write_frame(&[1, 2, 3]).expect("frame writes");
        recorder.close().expect("recorder closes");

        let bytes = std::fs::read(&path).expect("file readable");
        assert_eq!(bytes, vec![0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_close_all_reports_paths_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bob-1_video");
        let factory = FileRecorderFactory;
        let recorder = factory
            .open(RecorderKind::Video, "vp8", &path)
            .expect("recorder opens");

        let mut set = RecorderSet::default();
        set.video = Some(ActiveRecorder::new(path.clone(), recorder));
        let paths = set.close_all();
        assert_eq!(paths.video.as_deref(), Some(path.as_path()));
        assert!(paths.audio.is_none());
        assert!(set.close_all().is_empty());
    }

    #[test]
    fn test_write_on_empty_set_is_a_noop() {
        let mut set = RecorderSet::default();
        set.write_audio(&[0; 8]);
        set.write_video(&[0; 8]);
        assert!(set.close_all().is_empty());
    }
}
