//! Method-name routing for streaming RPCs.
//!
//! Handlers are registered per stream shape. Opening a stream looks up the
//! factory, creates a session, spawns the handler as its own task, and
//! returns the session id to the caller. The handler task is the single
//! owner of the session's outbound side; when it returns the session is
//! torn down, and a handler error (or panic) becomes an ERROR frame first.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::{Status, StreamKind, StreamRegistry, StreamSession};

/// Sentinel session id returned when no handler is registered for a method.
pub const NO_HANDLER_SESSION_ID: i64 = -1;

/// The future a stream handler runs to completion.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Status>> + Send>>;

/// A handler closure driving one session.
pub type StreamHandler = Box<dyn FnOnce(Arc<StreamSession>) -> HandlerFuture + Send>;

/// Factory for server-streaming handlers; receives the initial request bytes.
pub type ServerStreamFactory = Arc<dyn Fn(Bytes) -> StreamHandler + Send + Sync>;

/// Factory for client-streaming handlers.
pub type ClientStreamFactory = Arc<dyn Fn() -> StreamHandler + Send + Sync>;

/// Factory for bidirectional-streaming handlers.
pub type BidiStreamFactory = Arc<dyn Fn() -> StreamHandler + Send + Sync>;

/// Box an async closure into a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: FnOnce(Arc<StreamSession>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Box::new(move |session| Box::pin(f(session)))
}

/// Routes stream opens to registered handlers and owns the handler tasks.
pub struct StreamDispatcher {
    registry: Arc<StreamRegistry>,
    runtime: tokio::runtime::Handle,
    server: RwLock<HashMap<String, ServerStreamFactory>>,
    client: RwLock<HashMap<String, ClientStreamFactory>>,
    bidi: RwLock<HashMap<String, BidiStreamFactory>>,
}

impl StreamDispatcher {
    /// Create a dispatcher spawning handlers on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime context; use
    /// [`with_runtime`](Self::with_runtime) there.
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self::with_runtime(registry, tokio::runtime::Handle::current())
    }

    pub fn with_runtime(registry: Arc<StreamRegistry>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            registry,
            runtime,
            server: RwLock::new(HashMap::new()),
            client: RwLock::new(HashMap::new()),
            bidi: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn register_server_stream<F>(&self, method: &str, factory: F)
    where
        F: Fn(Bytes) -> StreamHandler + Send + Sync + 'static,
    {
        self.server
            .write()
            .insert(method.to_string(), Arc::new(factory));
        tracing::debug!(method, "registered server-stream handler");
    }

    pub fn register_client_stream<F>(&self, method: &str, factory: F)
    where
        F: Fn() -> StreamHandler + Send + Sync + 'static,
    {
        self.client
            .write()
            .insert(method.to_string(), Arc::new(factory));
        tracing::debug!(method, "registered client-stream handler");
    }

    pub fn register_bidi_stream<F>(&self, method: &str, factory: F)
    where
        F: Fn() -> StreamHandler + Send + Sync + 'static,
    {
        self.bidi
            .write()
            .insert(method.to_string(), Arc::new(factory));
        tracing::debug!(method, "registered bidi-stream handler");
    }

    /// Drop every registered handler. Test teardown.
    pub fn unregister_all(&self) {
        self.server.write().clear();
        self.client.write().clear();
        self.bidi.write().clear();
        tracing::debug!("unregistered all stream handlers");
    }

    /// Dispatch a server-streaming open. Returns the session id, or
    /// [`NO_HANDLER_SESSION_ID`] when the method has no handler.
    pub fn open_server_stream(&self, method: &str, initial: Bytes) -> i64 {
        let factory = self.server.read().get(method).cloned();
        match factory {
            Some(factory) => self.start(method, StreamKind::ServerStream, factory(initial)),
            None => {
                tracing::warn!(method, "no server-stream handler registered");
                NO_HANDLER_SESSION_ID
            }
        }
    }

    /// Dispatch a client-streaming open.
    pub fn open_client_stream(&self, method: &str) -> i64 {
        let factory = self.client.read().get(method).cloned();
        match factory {
            Some(factory) => self.start(method, StreamKind::ClientStream, factory()),
            None => {
                tracing::warn!(method, "no client-stream handler registered");
                NO_HANDLER_SESSION_ID
            }
        }
    }

    /// Dispatch a bidirectional-streaming open.
    pub fn open_bidi_stream(&self, method: &str) -> i64 {
        let factory = self.bidi.read().get(method).cloned();
        match factory {
            Some(factory) => self.start(method, StreamKind::BidiStream, factory()),
            None => {
                tracing::warn!(method, "no bidi-stream handler registered");
                NO_HANDLER_SESSION_ID
            }
        }
    }

    fn start(&self, method: &str, kind: StreamKind, handler: StreamHandler) -> i64 {
        let session = self.registry.create(method, kind);
        let session_id = session.id();
        let registry = self.registry.clone();

        self.runtime.spawn(async move {
            // A panicking handler must not take the session down silently:
            // the peer would wait on a stream that never terminates.
            let outcome = AssertUnwindSafe(handler(session.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(status)) => {
                    tracing::warn!(session_id, status = %status, "stream handler failed");
                    session.error(status).await;
                }
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("panic in stream handler: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("panic in stream handler: {s}")
                    } else {
                        "panic in stream handler".to_string()
                    };
                    tracing::error!(session_id, message, "stream handler panicked");
                    session.error(Status::internal(message)).await;
                }
            }
            registry.close(session_id).await;
        });

        session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameKind, OutboundFrame, QueueSink};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn dispatcher_with_sink(capacity: usize) -> (StreamDispatcher, mpsc::Receiver<OutboundFrame>) {
        let registry = Arc::new(StreamRegistry::new());
        let (sink, rx) = QueueSink::bounded(capacity);
        registry.set_host_sink(Some(sink));
        (StreamDispatcher::new(registry), rx)
    }

    async fn collect_until_terminal(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            let kind = frame.kind;
            frames.push(frame);
            if matches!(kind, FrameKind::End | FrameKind::Error) {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn unknown_method_returns_sentinel() {
        let (dispatcher, _rx) = dispatcher_with_sink(4);
        assert_eq!(
            dispatcher.open_server_stream("nope", Bytes::new()),
            NO_HANDLER_SESSION_ID
        );
        assert_eq!(dispatcher.open_client_stream("nope"), NO_HANDLER_SESSION_ID);
        assert_eq!(dispatcher.open_bidi_stream("nope"), NO_HANDLER_SESSION_ID);
    }

    #[tokio::test]
    async fn server_stream_waits_for_ready_then_counts() {
        let (dispatcher, mut rx) = dispatcher_with_sink(16);
        dispatcher.register_server_stream("test/server_stream", |_initial| {
            stream_handler(|session| async move {
                if !session.wait_ready().await {
                    return Ok(());
                }
                for i in 1..=5u8 {
                    session.send(Bytes::from(vec![i])).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                session.close_send().await?;
                Ok(())
            })
        });

        let start = Instant::now();
        let id = dispatcher.open_server_stream("test/server_stream", Bytes::new());
        assert!(id > 0);

        // Subscribe late: nothing may be emitted before the ready signal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.registry().signal_ready(id);

        let frames = collect_until_terminal(&mut rx).await;
        assert!(start.elapsed() >= Duration::from_millis(140));

        assert_eq!(frames.len(), 6);
        for (i, frame) in frames[..5].iter().enumerate() {
            assert_eq!(frame.session_id, id);
            assert_eq!(frame.kind, FrameKind::Data);
            assert_eq!(frame.payload.as_ref(), &[i as u8 + 1]);
        }
        assert_eq!(frames[5].kind, FrameKind::End);
    }

    #[tokio::test]
    async fn client_stream_sums_pushed_bytes() {
        let (dispatcher, mut rx) = dispatcher_with_sink(16);
        dispatcher.register_client_stream("test/client_stream", || {
            stream_handler(|session| async move {
                let mut sum = 0u8;
                while let Some(data) = session.recv().await {
                    if let Some(&first) = data.first() {
                        sum = sum.wrapping_add(first);
                    }
                }
                session.send(Bytes::from(vec![sum])).await?;
                session.close_send().await?;
                Ok(())
            })
        });

        let id = dispatcher.open_client_stream("test/client_stream");
        assert!(id > 0);
        let registry = dispatcher.registry();
        for byte in [0x10u8, 0x20, 0x30] {
            registry.push(id, Bytes::from(vec![byte])).await.unwrap();
        }
        registry.close_input(id);

        let frames = collect_until_terminal(&mut rx).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Data);
        assert_eq!(frames[0].payload.as_ref(), &[0x60]);
        assert_eq!(frames[1].kind, FrameKind::End);
    }

    #[tokio::test]
    async fn bidi_stream_echoes_until_input_close() {
        let (dispatcher, mut rx) = dispatcher_with_sink(16);
        dispatcher.register_bidi_stream("test/bidi_stream", || {
            stream_handler(|session| async move {
                if !session.wait_ready().await {
                    return Ok(());
                }
                while let Some(data) = session.recv().await {
                    session.send(data).await?;
                }
                session.close_send().await?;
                Ok(())
            })
        });

        let id = dispatcher.open_bidi_stream("test/bidi_stream");
        assert!(id > 0);
        let registry = dispatcher.registry();
        registry.signal_ready(id);
        registry.push(id, Bytes::from_static(&[0xAA])).await.unwrap();
        registry.push(id, Bytes::from_static(&[0xBB])).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, FrameKind::Data);
        assert_eq!(first.payload.as_ref(), &[0xAA]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, FrameKind::Data);
        assert_eq!(second.payload.as_ref(), &[0xBB]);

        registry.close_input(id);
        assert_eq!(rx.recv().await.unwrap().kind, FrameKind::End);
    }

    #[tokio::test]
    async fn handler_error_becomes_error_frame() {
        let (dispatcher, mut rx) = dispatcher_with_sink(16);
        dispatcher.register_client_stream("test/fail", || {
            stream_handler(|_session| async move {
                Err(Status::internal("deliberate failure"))
            })
        });

        let id = dispatcher.open_client_stream("test/fail");
        let frames = collect_until_terminal(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Error);
        assert_eq!(frames[0].payload.as_ref(), b"deliberate failure");

        // The session deregisters once the handler task finishes.
        let deadline = Instant::now() + Duration::from_secs(1);
        while dispatcher.registry().lookup(id).is_some() {
            assert!(Instant::now() < deadline, "session was not deregistered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_frame() {
        let (dispatcher, mut rx) = dispatcher_with_sink(16);
        dispatcher.register_bidi_stream("test/panic", || {
            stream_handler(|_session| async move { panic!("kaboom") })
        });

        dispatcher.open_bidi_stream("test/panic");
        let frames = collect_until_terminal(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Error);
        assert!(
            std::str::from_utf8(&frames[0].payload)
                .unwrap()
                .contains("kaboom")
        );
    }

    #[tokio::test]
    async fn unregister_all_clears_every_shape() {
        let (dispatcher, _rx) = dispatcher_with_sink(4);
        dispatcher.register_server_stream("s", |_| {
            stream_handler(|_s| async move { Ok(()) })
        });
        dispatcher.register_client_stream("c", || {
            stream_handler(|_s| async move { Ok(()) })
        });
        dispatcher.register_bidi_stream("b", || {
            stream_handler(|_s| async move { Ok(()) })
        });
        dispatcher.unregister_all();
        assert_eq!(
            dispatcher.open_server_stream("s", Bytes::new()),
            NO_HANDLER_SESSION_ID
        );
        assert_eq!(dispatcher.open_client_stream("c"), NO_HANDLER_SESSION_ID);
        assert_eq!(dispatcher.open_bidi_stream("b"), NO_HANDLER_SESSION_ID);
    }
}
