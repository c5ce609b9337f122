//! Server-sent event framing for order updates.

use crate::model::Order;
use async_trait::async_trait;
use pipeline_framework::EventSink;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// `data: <json>\n\n`, or `None` if the order cannot be encoded.
pub fn encode_event(order: &Order) -> Option<Vec<u8>> {
    let json = match serde_json::to_vec(order) {
        Ok(json) => json,
        Err(error) => {
            warn!(order_id = %order.order_id, %error, "Failed to encode event, skipping");
            return None;
        }
    };
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(&json);
    frame.extend_from_slice(b"\n\n");
    Some(frame)
}

/// An [`EventSink`] over any async writer, flushing after every frame.
pub struct SseWriter<W> {
    writer: W,
}

impl<W> SseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for SseWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }
}
