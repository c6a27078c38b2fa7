//! Shared async text sink for handler output.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Appendable text sink handlers write to.
///
/// Cheap to clone; all clones share one buffered writer. Write failures
/// are surfaced to the caller so it can fall back to a secondary sink
/// instead of crashing the pipeline.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl OutputSink {
    /// Wrap an arbitrary async writer.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(BufWriter::new(Box::new(writer)))),
        }
    }

    /// Sink writing to process standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Write a chunk of text without a trailing newline.
    ///
    /// # Errors
    /// Returns error if the underlying write or flush fails.
    pub async fn write_text(&self, text: &str) -> Result<(), std::io::Error> {
        let mut guard = self.writer.lock().await;
        guard.write_all(text.as_bytes()).await?;
        guard.flush().await?;
        Ok(())
    }

    /// Write one line.
    ///
    /// # Errors
    /// Returns error if the underlying write or flush fails.
    pub async fn write_line(&self, line: &str) -> Result<(), std::io::Error> {
        let mut guard = self.writer.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.write_all(b"\n").await?;
        guard.flush().await?;
        Ok(())
    }
}
