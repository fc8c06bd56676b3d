use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::response::sse::{Event, KeepAlive};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tracing::{info, warn};

use crate::engine::{EngineError, EngineHandle};
use crate::hub::{ClientConnection, ConnectionId, Transport};
use crate::protocol::ServerEvent;

/// Read-only overlay stream. The first event is always `sync`.
pub struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl SseStream {
    pub async fn subscribe(engine: &EngineHandle) -> Result<Self, EngineError> {
        let (connection, receiver) = ClientConnection::new(Transport::Sse);
        let id = connection.id;
        engine.register(connection).await?;
        info!(stage = "sse", %id, "overlay stream opened");

        let stream = ReceiverStream::new(receiver).filter_map(|event| to_event(&event).map(Ok));
        Ok(Self {
            inner: Box::pin(stream),
            _guard: ClientGuard {
                engine: engine.clone(),
                id,
            },
        })
    }
}

impl Stream for SseStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

fn to_event(event: &ServerEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(stage = "sse", event = event.name(), error = %err, "failed to encode event");
            None
        }
    }
}

pub fn keep_alive(heartbeat_secs: u64) -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(heartbeat_secs))
        .text("heartbeat")
}

struct ClientGuard {
    engine: EngineHandle,
    id: ConnectionId,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        info!(stage = "sse", id = %self.id, "overlay stream closed");
        self.engine.unregister(self.id);
    }
}
