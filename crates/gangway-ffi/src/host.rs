//! Runtime → host calls.
//!
//! A handler that needs the host to answer something (the UI layer owns the
//! method) fires the registered host unary callback and blocks on the
//! matcher until `gangway_send_async_response` arrives with the same
//! request id. Host-directed streams are built the other way around: a
//! registry session the host pushes into, kicked off by a unary callback
//! whose method name carries the session id.

use std::time::Duration;

use bytes::Bytes;
use gangway_core::{LOCAL_INBOUND_CAPACITY, Status, StreamKind};

use crate::data::alloc_bytes;
use crate::runtime::runtime;

/// Invoke the host's unary callback and wait for its response.
///
/// Fails with not-initialized when no callback is registered, and with a
/// "timeout …" status when the host does not answer within the matcher's
/// configured window. A `None` release (callback hot-swapped mid-flight)
/// surfaces as cancelled.
pub async fn invoke_host(method: &str, payload: &[u8]) -> Result<Bytes, Status> {
    let Some(cb) = runtime().host_unary_callback() else {
        return Err(Status::not_initialized("host callback not registered"));
    };

    let method_c = std::ffi::CString::new(method)
        .map_err(|_| Status::invalid_argument("method contains NUL"))?;
    let (id, rx) = runtime().matcher().create();

    let (data, len) = alloc_bytes(payload);
    // SAFETY: the callback contract says data is only valid during the
    // call; the host copies synchronously and answers later by request id.
    unsafe {
        cb(id, method_c.as_ptr(), data, len);
        if !data.is_null() {
            libc::free(data);
        }
    }

    match runtime().matcher().wait(id, rx).await? {
        Some(response) => Ok(response),
        None => Err(Status::cancelled("host callback was replaced")),
    }
}

/// Invoke a host-side server-streaming method and collect its responses.
///
/// Opens a registry session for the host to push into, starts the call via
/// [`invoke_host`] with `method:<session id>`, then drains the session
/// until the host closes it. A zero `timeout` waits indefinitely.
pub async fn invoke_host_stream(
    method: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<Bytes>, Status> {
    let session = runtime().registry().create_with_sink(
        method,
        StreamKind::ServerStream,
        None,
        LOCAL_INBOUND_CAPACITY,
    );
    let session_id = session.id();

    let method_with_id = format!("{method}:{session_id}");
    if let Err(status) = invoke_host(&method_with_id, payload).await {
        runtime().registry().close(session_id).await;
        return Err(status);
    }

    let drain = async {
        let mut responses = Vec::new();
        loop {
            tokio::select! {
                item = session.recv() => match item {
                    Some(payload) => responses.push(payload),
                    None => break,
                },
                _ = session.done().wait() => break,
            }
        }
        responses
    };

    let result = if timeout.is_zero() {
        Ok(drain.await)
    } else {
        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| Status::deadline_exceeded("timeout waiting for host stream data"))
    };

    runtime().registry().close(session_id).await;
    result
}
