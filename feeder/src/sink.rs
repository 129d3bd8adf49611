use feed_actors::feed::consumer::{EventSink, SinkAck};
use feed_actors::feed::Handshake;
use feed_protocol::Event;
use futures_util::future::BoxFuture;
use std::io::ErrorKind;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Writes every delivered event as one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin + Send> EventSink<Event> for JsonLinesSink<W> {
    fn accept(
        &mut self,
        _handshake: Handshake,
        event: Event,
    ) -> BoxFuture<'_, anyhow::Result<SinkAck>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            let written = match self.writer.write_all(&line).await {
                Ok(()) => self.writer.flush().await,
                Err(err) => Err(err),
            };
            match written {
                Ok(()) => Ok(SinkAck::Continue),
                // the reading end went away, nobody is left to feed
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    warn!(key = %event.key, "Output closed, cancelling feed");
                    Ok(SinkAck::Cancel)
                }
                Err(err) => Err(err.into()),
            }
        })
    }
}
