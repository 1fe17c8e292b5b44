use super::CaptureSource;
use crate::error::CaptureError;
use tokio::sync::mpsc;

/// Push-style capture: buffers sent on a channel by another task or thread.
///
/// Ends when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Create a source together with the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait::async_trait]
impl CaptureSource for ChannelSource {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}
