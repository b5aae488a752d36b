use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::sync::fetcher::CachedPhoto;

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A cycle completed; `photos` replaces whatever was published before.
    #[serde(rename = "PHOTOS_UPDATED")]
    PhotosUpdated { photos: Vec<CachedPhoto> },
    #[serde(rename = "AUTH_ERROR")]
    AuthError { message: String },
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Writes each event as one JSON line until every sender is dropped.
pub async fn forward_events<W>(mut events: EventReceiver, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}
