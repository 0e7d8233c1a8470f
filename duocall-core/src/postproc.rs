//! Post-call processing queue
//!
//! When a recorded call ends, a [`RecordingJob`] describing the per-party
//! files is queued for the post-processing collaborator (typically an
//! external muxing script). The worker runs on its own task and its
//! failures never affect a teardown that already completed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A completed recorded call, ready for muxing into one artifact.
#[derive(Debug, Clone)]
pub struct RecordingJob {
    /// Directory holding the per-party files.
    pub dir: PathBuf,
    /// Audio+video call (webm output) vs audio-only (mp3 output).
    pub is_video: bool,
    pub audio_1: Option<PathBuf>,
    pub video_1: Option<PathBuf>,
    pub audio_2: Option<PathBuf>,
    pub video_2: Option<PathBuf>,
    /// Output artifact name, without directory or extension.
    pub output: String,
}

impl RecordingJob {
    /// Path of the artifact the post-processor is expected to produce.
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        let extension = if self.is_video { "webm" } else { "mp3" };
        self.dir.join(format!("{}.{}", self.output, extension))
    }
}

/// Post-processing collaborator.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, job: RecordingJob) -> anyhow::Result<()>;
}

/// Drops every job; for hosts that never enable recording.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostProcessor;

#[async_trait]
impl PostProcessor for NoopPostProcessor {
    async fn process(&self, job: RecordingJob) -> anyhow::Result<()> {
        debug!(output = %job.output, "discarding recording job");
        Ok(())
    }
}

pub(crate) fn spawn_worker(
    mut jobs: mpsc::UnboundedReceiver<RecordingJob>,
    processor: Arc<dyn PostProcessor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let output = job.output.clone();
            match processor.process(job).await {
                Ok(()) => info!(%output, "recording job processed"),
                Err(error) => warn!(%output, %error, "recording job failed"),
            }
        }
        debug!("record handler task exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CollectingProcessor {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PostProcessor for CollectingProcessor {
        async fn process(&self, job: RecordingJob) -> anyhow::Result<()> {
            self.seen.lock().push(job.output);
            Ok(())
        }
    }

    #[test]
    fn test_artifact_path_by_call_kind() {
        let mut job = RecordingJob {
            dir: PathBuf::from("/rec"),
            is_video: true,
            audio_1: None,
            video_1: None,
            audio_2: None,
            video_2: None,
            output: "videocall_alice-bob-1".to_string(),
        };
        assert_eq!(
            job.artifact_path(),
            PathBuf::from("/rec/videocall_alice-bob-1.webm")
        );
        job.is_video = false;
        assert_eq!(
            job.artifact_path(),
            PathBuf::from("/rec/videocall_alice-bob-1.mp3")
        );
    }

    #[tokio::test]
    async fn test_worker_drains_queue_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = spawn_worker(
            rx,
            Arc::new(CollectingProcessor { seen: seen.clone() }),
        );

        for output in ["first", "second"] {
            tx.send(RecordingJob {
                dir: PathBuf::from("/rec"),
                is_video: false,
                audio_1: None,
                video_1: None,
                audio_2: None,
                video_2: None,
                output: output.to_string(),
            })
            .expect("worker alive");
        }
        drop(tx);
        worker.await.expect("worker exits cleanly");

        assert_eq!(*seen.lock(), vec!["first".to_string(), "second".to_string()]);
    }
}
