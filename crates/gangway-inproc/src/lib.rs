//! gangway-inproc: in-process client connection.
//!
//! This is the zero-copy call path within the host process. Calls route
//! directly to a service implementation object; messages cross a pair of
//! bounded channels as owned boxed values, never serialized. It is the
//! semantic reference for the bridge's RPC behavior: the FFI and plugin
//! transports must agree with what this adapter does.
//!
//! # Shape
//!
//! ```text
//!   InProcStream (client)                 ServerStreamPair (handler)
//!   ---------------------                 --------------------------
//!   send ──────────── channel A ────────▶ recv
//!   recv ◀─────────── channel B ──────── send
//! ```
//!
//! The handler runs on its own task. Returning `Ok` closes the
//! handler-send side so the client observes EOF; returning `Err` stores the
//! status, which every recv after the buffered messages drain will yield.

#![forbid(unsafe_code)]

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use gangway_core::{Event, Status};
use tokio::sync::{mpsc, oneshot};

/// Capacity of each direction's message channel.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// A message crossing the in-process boundary: owned, typed, unserialized.
pub type AnyMessage = Box<dyn Any + Send>;

fn downcast<T: 'static>(message: AnyMessage) -> Result<T, Status> {
    message
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| Status::internal("in-process message type mismatch"))
}

// ----------------------------------------------------------------------
// Call context
// ----------------------------------------------------------------------

struct ContextInner {
    cancelled: Event,
    parent: Option<Arc<ContextInner>>,
}

impl ContextInner {
    fn is_cancelled(&self) -> bool {
        self.cancelled.is_fired()
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }

    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &self.parent {
                None => self.cancelled.wait().await,
                Some(parent) => tokio::select! {
                    _ = self.cancelled.wait() => {}
                    _ = parent.wait() => {}
                },
            }
        })
    }
}

/// Cancellation context attached to an in-process call.
///
/// `child` derives a context that observes its parent: cancelling the
/// parent cancels the child, cancelling the child leaves the parent alone.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: Event::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child context cancelled with (but not cancelling) `self`.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: Event::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Wait until this context (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.inner.wait().await
    }

    fn check(&self) -> Result<(), Status> {
        if self.is_cancelled() {
            Err(Status::cancelled("call context cancelled"))
        } else {
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------
// Service seam
// ----------------------------------------------------------------------

/// The implementation object behind an [`InProcChannel`].
///
/// Generated wrappers implement this by matching on the method name and
/// downcasting the boxed messages to their concrete types.
pub trait InProcService: Send + Sync + 'static {
    /// Dispatch a unary call. The response crosses back as a boxed value.
    fn unary(
        &self,
        ctx: CallContext,
        method: &str,
        request: AnyMessage,
    ) -> BoxFuture<'static, Result<AnyMessage, Status>>;

    /// Dispatch a streaming call of any shape, driving `stream` until done.
    fn stream(
        &self,
        ctx: CallContext,
        method: &str,
        stream: ServerStreamPair,
    ) -> BoxFuture<'static, Result<(), Status>>;
}

/// The handler-facing view of one in-process stream.
pub struct ServerStreamPair {
    ctx: CallContext,
    outbound: mpsc::Sender<AnyMessage>,
    inbound: mpsc::Receiver<AnyMessage>,
}

impl ServerStreamPair {
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Send one response message to the client.
    pub async fn send<T: Send + 'static>(&self, message: T) -> Result<(), Status> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(Status::cancelled("call context cancelled")),
            res = self.outbound.send(Box::new(message)) => {
                res.map_err(|_| Status::cancelled("client stream dropped"))
            }
        }
    }

    /// Receive the next request message. `None` after the client's
    /// close-send.
    pub async fn recv<T: Send + 'static>(&mut self) -> Result<Option<T>, Status> {
        match self.recv_any().await? {
            Some(message) => downcast(message).map(Some),
            None => Ok(None),
        }
    }

    /// Receive the next request message without a type, for handlers that
    /// route on something other than the static type.
    pub async fn recv_any(&mut self) -> Result<Option<AnyMessage>, Status> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(Status::cancelled("call context cancelled")),
            message = self.inbound.recv() => Ok(message),
        }
    }
}

// ----------------------------------------------------------------------
// Client side
// ----------------------------------------------------------------------

/// Client connection routing calls straight to an in-process service.
#[derive(Clone)]
pub struct InProcChannel {
    service: Arc<dyn InProcService>,
}

impl InProcChannel {
    pub fn new(service: Arc<dyn InProcService>) -> Self {
        Self { service }
    }

    /// Unary call: the implementation is invoked with the typed request and
    /// its result is handed back typed. Errors surface verbatim.
    pub async fn unary<Req, Resp>(
        &self,
        ctx: &CallContext,
        method: &str,
        request: Req,
    ) -> Result<Resp, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        ctx.check()?;
        let call_ctx = ctx.child();
        let response = self
            .service
            .unary(call_ctx, method, Box::new(request))
            .await?;
        downcast(response)
    }

    /// Open a stream of any shape.
    ///
    /// Spawns the implementation on its own task wired to the returned
    /// client stream. Must be called from within a tokio runtime.
    pub fn open_stream<Req, Resp>(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<InProcStream<Req, Resp>, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        ctx.check()?;
        let call_ctx = ctx.child();

        let (client_tx, server_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (server_tx, client_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = oneshot::channel();

        let pair = ServerStreamPair {
            ctx: call_ctx.clone(),
            outbound: server_tx.clone(),
            inbound: server_rx,
        };

        let service = self.service.clone();
        let method_owned = method.to_string();
        let handler_ctx = call_ctx.clone();
        tokio::spawn(async move {
            let result = service.stream(handler_ctx, &method_owned, pair).await;
            if let Err(status) = result {
                tracing::debug!(method = %method_owned, status = %status, "in-process handler failed");
                let _ = err_tx.send(status);
            }
            // Dropped only after the error slot is filled, so the client
            // cannot observe EOF before the error is in place.
            drop(server_tx);
        });

        // The client half shares the handler's context: closing the client
        // side cancels the handler, while the caller's own context stays
        // untouched.
        Ok(InProcStream {
            ctx: call_ctx,
            send_tx: Some(client_tx),
            recv_rx: client_rx,
            err_rx: Some(err_rx),
            stored_err: None,
            _marker: std::marker::PhantomData,
        })
    }
}

/// The client half of an in-process stream.
///
/// Dropping the stream cancels the handler's context.
pub struct InProcStream<Req, Resp> {
    ctx: CallContext,
    send_tx: Option<mpsc::Sender<AnyMessage>>,
    recv_rx: mpsc::Receiver<AnyMessage>,
    err_rx: Option<oneshot::Receiver<Status>>,
    stored_err: Option<Status>,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> InProcStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Send one request message.
    pub async fn send(&self, message: Req) -> Result<(), Status> {
        let Some(tx) = &self.send_tx else {
            return Err(Status::new(
                gangway_core::ErrorCode::StreamClosed,
                "send side already closed",
            ));
        };
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(Status::cancelled("call context cancelled")),
            res = tx.send(Box::new(message)) => {
                res.map_err(|_| Status::cancelled("handler dropped its receive side"))
            }
        }
    }

    /// Signal EOF on the send side. The handler's recv observes `None`.
    pub fn close_send(&mut self) {
        self.send_tx = None;
    }

    /// Receive the next response.
    ///
    /// `Ok(None)` is clean EOF. Once the handler has failed, the buffered
    /// messages drain first and then the stored error is returned by this
    /// and every subsequent call.
    pub async fn recv(&mut self) -> Result<Option<Resp>, Status> {
        if let Some(err) = &self.stored_err {
            return Err(err.clone());
        }

        let message = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => return Err(Status::cancelled("call context cancelled")),
            message = self.recv_rx.recv() => message,
        };

        match message {
            Some(message) => downcast(message).map(Some),
            None => {
                if let Some(mut err_rx) = self.err_rx.take() {
                    if let Ok(status) = err_rx.try_recv() {
                        self.stored_err = Some(status.clone());
                        return Err(status);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Cancel the call. The handler's context observes the cancellation.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl<Req, Resp> Drop for InProcStream<Req, Resp> {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}
