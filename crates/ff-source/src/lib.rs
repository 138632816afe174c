#![forbid(unsafe_code)]

use std::sync::Arc;

use ff_frame::{Frame, FrameError};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("dataset frames disagree on schema: frame {index} is missing column '{column}'")]
    SchemaMismatch { index: usize, column: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// The contract the engine consumes from the external data-storage layer.
///
/// Implementations must be shareable across threads; parallel batch workers
/// call [`FrameSource::snapshot`] to obtain their own independent handle
/// rather than sharing one connection.
pub trait FrameSource: Send + Sync {
    /// Total number of frames in the dataset.
    fn frame_count(&self) -> usize;

    /// Column names of the current schema, excluding housekeeping columns.
    fn variables(&self) -> Vec<String>;

    /// One frame's point table, or `None` when the index is out of range or
    /// the frame cannot be loaded (load failures are reported out-of-band).
    fn frame(&self, index: usize) -> Option<Frame>;

    /// Forward-only pass over all frames projected to `columns`. Re-invoke
    /// to restart; each call yields an independent iterator.
    fn iter_frames<'a>(&'a self, columns: &[String]) -> Box<dyn Iterator<Item = Frame> + 'a>;

    /// Independent handle for a parallel worker.
    fn snapshot(&self) -> Box<dyn FrameSource>;
}

/// In-memory dataset, used by tests and small sessions. Frames share one
/// `Arc` so snapshots are cheap.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frames: Arc<Vec<Frame>>,
    variables: Vec<String>,
}

impl MemorySource {
    pub fn new(frames: Vec<Frame>) -> Result<Self, SourceError> {
        let variables = frames
            .first()
            .map(|frame| frame.variables().to_vec())
            .unwrap_or_default();
        for (index, frame) in frames.iter().enumerate() {
            for column in &variables {
                if !frame.has_column(column) {
                    return Err(SourceError::SchemaMismatch {
                        index,
                        column: column.clone(),
                    });
                }
            }
        }
        Ok(Self {
            frames: Arc::new(frames),
            variables,
        })
    }
}

impl FrameSource for MemorySource {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn variables(&self) -> Vec<String> {
        self.variables.clone()
    }

    fn frame(&self, index: usize) -> Option<Frame> {
        let frame = self.frames.get(index).cloned();
        if frame.is_none() {
            warn!(index, count = self.frames.len(), "frame index out of range");
        }
        frame
    }

    fn iter_frames<'a>(&'a self, columns: &[String]) -> Box<dyn Iterator<Item = Frame> + 'a> {
        let columns = columns.to_vec();
        Box::new(self.frames.iter().filter_map(move |frame| {
            match frame.project(&columns) {
                Ok(projected) => Some(projected),
                Err(error) => {
                    warn!(%error, time_key = frame.time_key(), "skipping unprojectable frame");
                    None
                }
            }
        }))
    }

    fn snapshot(&self) -> Box<dyn FrameSource> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameSource, MemorySource, SourceError};
    use ff_frame::Frame;

    fn frame(t: f64, p: Vec<f64>) -> Frame {
        let n = p.len();
        Frame::new(
            t,
            vec![
                ("x", (0..n).map(|i| i as f64).collect()),
                ("y", vec![0.0; n]),
                ("p", p),
            ],
        )
        .expect("frame")
    }

    #[test]
    fn memory_source_exposes_count_schema_and_frames() {
        let source =
            MemorySource::new(vec![frame(0.0, vec![1.0, 2.0]), frame(1.0, vec![3.0, 4.0])])
                .expect("source");

        assert_eq!(source.frame_count(), 2);
        assert_eq!(source.variables(), vec!["x", "y", "p"]);
        assert_eq!(source.frame(1).expect("frame 1").time_key(), 1.0);
        assert!(source.frame(7).is_none());
    }

    #[test]
    fn iter_frames_projects_and_restarts() {
        let source =
            MemorySource::new(vec![frame(0.0, vec![1.0]), frame(1.0, vec![2.0])]).expect("source");

        let wanted = vec!["p".to_owned()];
        let first_pass: Vec<_> = source.iter_frames(&wanted).collect();
        assert_eq!(first_pass.len(), 2);
        assert_eq!(first_pass[0].variables(), &["p"]);

        // restartable: a second call starts from the beginning again
        assert_eq!(source.iter_frames(&wanted).count(), 2);
    }

    #[test]
    fn snapshot_yields_an_equivalent_independent_handle() {
        let source = MemorySource::new(vec![frame(0.0, vec![1.0])]).expect("source");
        let handle = source.snapshot();
        assert_eq!(handle.frame_count(), 1);
        assert_eq!(handle.variables(), source.variables());
    }

    #[test]
    fn schema_drift_across_frames_is_rejected() {
        let odd = Frame::new(1.0, vec![("x", vec![0.0]), ("y", vec![0.0])]).expect("frame");
        let err = MemorySource::new(vec![frame(0.0, vec![1.0]), odd]).expect_err("must fail");
        assert!(matches!(err, SourceError::SchemaMismatch { index: 1, .. }));
    }
}
