//! C ABI exports: host → runtime.
//!
//! Unary calls are synchronous: the calling host thread blocks on the
//! bridge runtime until the service answers. Stream opens return a session
//! id immediately and frames flow through the registered callbacks.
//!
//! Errors on the unary surface come back as a negative `len` whose absolute
//! value counts the bytes of a prost-encoded `StatusDetail`.

use std::os::raw::{c_char, c_void};
use std::time::Duration;

use bytes::Bytes;
use gangway_core::{Metadata, Status};
use prost::Message;

use crate::data::{FfiData, alloc_bytes, alloc_message, bytes_from_raw};
use crate::runtime::{CallOptions, StreamCallbackFn, UnaryCallbackFn, runtime};

/// Reserved metadata key carrying a per-call timeout in milliseconds.
const TIMEOUT_METADATA_KEY: &str = "__timeout_ms";

fn status_reply(status: &Status) -> FfiData {
    tracing::debug!(status = %status, "unary invoke failed");
    let encoded = status.to_detail().encode_to_vec();
    let (data, len) = alloc_bytes(&encoded);
    FfiData { data, len: -len }
}

/// Parse `"k=v\n"` metadata, splitting off the reserved timeout key.
fn parse_call_metadata(raw: &[u8]) -> (CallOptions, Option<Duration>) {
    let decoded = Metadata::decode(raw);
    let timeout = decoded
        .get(TIMEOUT_METADATA_KEY)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    let mut metadata = Metadata::new();
    for (key, value) in decoded.iter() {
        if key != TIMEOUT_METADATA_KEY {
            let _ = metadata.set(key, value);
        }
    }
    (CallOptions { metadata }, timeout)
}

/// # Safety
///
/// `method` must be a valid NUL-terminated string; `data`, when non-null,
/// must point at `len` readable bytes. Both only need to live for the call.
unsafe fn invoke_unary_impl(
    method: *const c_char,
    data: *const c_void,
    len: i64,
    meta: *const c_void,
    meta_len: i64,
) -> FfiData {
    if method.is_null() {
        return status_reply(&Status::invalid_argument("method is null"));
    }
    // SAFETY: caller contract.
    let method = match unsafe { std::ffi::CStr::from_ptr(method) }.to_str() {
        Ok(m) => m.to_string(),
        Err(_) => return status_reply(&Status::invalid_argument("method is not UTF-8")),
    };
    // SAFETY: caller contract. Copied before the call suspends.
    let payload = Bytes::copy_from_slice(unsafe { bytes_from_raw(data, len) });
    let (call, timeout) = parse_call_metadata(unsafe { bytes_from_raw(meta, meta_len) });

    let Some(service) = runtime().service() else {
        return status_reply(&Status::not_initialized(
            "service implementation not installed",
        ));
    };

    let result = runtime().block_on(async move {
        let invocation = service.invoke(call, &method, payload);
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
                Ok(result) => result,
                Err(_) => Err(Status::deadline_exceeded("unary call timed out")),
            },
            None => invocation.await,
        }
    });

    match result {
        Ok(response) => match alloc_message(response.into_inner().as_ref()) {
            Ok((data, len)) => FfiData { data, len },
            Err(status) => status_reply(&status),
        },
        Err(status) => status_reply(&status),
    }
}

/// Synchronous unary invocation.
///
/// # Safety
///
/// See [`invoke_unary_impl`]: `method` NUL-terminated, `data` readable for
/// `len` bytes when non-null.
#[no_mangle]
pub unsafe extern "C" fn gangway_invoke_unary(
    method: *const c_char,
    data: *const c_void,
    len: i64,
) -> FfiData {
    // SAFETY: forwarded caller contract.
    unsafe { invoke_unary_impl(method, data, len, std::ptr::null(), 0) }
}

/// Synchronous unary invocation with a trailing `"k=v\n"` metadata buffer.
/// The reserved key `__timeout_ms` bounds the call.
///
/// # Safety
///
/// See [`gangway_invoke_unary`]; additionally `meta`, when non-null, must
/// point at `meta_len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn gangway_invoke_unary_with_metadata(
    method: *const c_char,
    data: *const c_void,
    len: i64,
    meta: *const c_void,
    meta_len: i64,
) -> FfiData {
    // SAFETY: forwarded caller contract.
    unsafe { invoke_unary_impl(method, data, len, meta, meta_len) }
}

/// Release memory returned by the unary exports.
///
/// # Safety
///
/// `data` must be null or the `data` pointer of an [`FfiData`] this library
/// returned, released at most once.
#[no_mangle]
pub unsafe extern "C" fn gangway_free_data(data: *mut c_void) {
    if !data.is_null() {
        // SAFETY: allocation came from alloc_bytes/alloc_message (malloc).
        unsafe { libc::free(data) };
    }
}

/// Set the host unary callback. Releases pending requests registered
/// against the previous callback (hot reload). Null unregisters.
#[no_mangle]
pub extern "C" fn gangway_register_unary_callback(cb: Option<UnaryCallbackFn>) {
    tracing::debug!(registered = cb.is_some(), "host unary callback updated");
    runtime().set_host_unary_callback(cb);
}

/// Set the outbound stream callback (copy variant). Null unregisters.
#[no_mangle]
pub extern "C" fn gangway_register_stream_callback(cb: Option<StreamCallbackFn>) {
    tracing::debug!(registered = cb.is_some(), "stream callback updated");
    runtime().set_copy_callback(cb);
}

/// Set the zero-copy outbound stream callback, used for DATA frames.
/// Null unregisters.
#[no_mangle]
pub extern "C" fn gangway_register_stream_callback_zero_copy(cb: Option<StreamCallbackFn>) {
    tracing::debug!(registered = cb.is_some(), "zero-copy stream callback updated");
    runtime().set_zero_copy_callback(cb);
}

/// Open a server stream, spawning its handler. Returns the session id, or
/// -1 when the method has no registered handler.
///
/// # Safety
///
/// `method` NUL-terminated; `data` readable for `len` bytes when non-null.
#[no_mangle]
pub unsafe extern "C" fn gangway_open_server_stream(
    method: *const c_char,
    data: *const c_void,
    len: i64,
) -> i64 {
    if method.is_null() {
        return gangway_core::NO_HANDLER_SESSION_ID;
    }
    // SAFETY: caller contract.
    let Ok(method) = (unsafe { std::ffi::CStr::from_ptr(method) }).to_str() else {
        return gangway_core::NO_HANDLER_SESSION_ID;
    };
    let initial = Bytes::copy_from_slice(unsafe { bytes_from_raw(data, len) });
    runtime().dispatcher().open_server_stream(method, initial)
}

/// Open a client stream. Returns the session id or -1.
///
/// # Safety
///
/// `method` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn gangway_open_client_stream(method: *const c_char) -> i64 {
    if method.is_null() {
        return gangway_core::NO_HANDLER_SESSION_ID;
    }
    // SAFETY: caller contract.
    let Ok(method) = (unsafe { std::ffi::CStr::from_ptr(method) }).to_str() else {
        return gangway_core::NO_HANDLER_SESSION_ID;
    };
    runtime().dispatcher().open_client_stream(method)
}

/// Open a bidirectional stream. Returns the session id or -1.
///
/// # Safety
///
/// `method` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn gangway_open_bidi_stream(method: *const c_char) -> i64 {
    if method.is_null() {
        return gangway_core::NO_HANDLER_SESSION_ID;
    }
    // SAFETY: caller contract.
    let Ok(method) = (unsafe { std::ffi::CStr::from_ptr(method) }).to_str() else {
        return gangway_core::NO_HANDLER_SESSION_ID;
    };
    runtime().dispatcher().open_bidi_stream(method)
}

/// Push one inbound payload into a stream session. Returns 0 on success,
/// negative on error. Blocks while the session's inbound channel is full.
///
/// # Safety
///
/// `data`, when non-null, must point at `len` readable bytes for the
/// duration of the call.
#[no_mangle]
pub unsafe extern "C" fn gangway_push_stream_data(
    session_id: i64,
    data: *const c_void,
    len: i64,
) -> i32 {
    // SAFETY: caller contract; copied before the call suspends.
    let payload = Bytes::copy_from_slice(unsafe { bytes_from_raw(data, len) });
    match runtime().block_on(runtime().registry().push(session_id, payload)) {
        Ok(()) => 0,
        Err(status) => {
            tracing::warn!(session_id, status = %status, "push stream data failed");
            -1
        }
    }
}

/// EOF from the host: no more inbound payloads for this session.
#[no_mangle]
pub extern "C" fn gangway_close_stream_input(session_id: i64) {
    runtime().registry().close_input(session_id);
}

/// Full session teardown.
#[no_mangle]
pub extern "C" fn gangway_close_stream(session_id: i64) {
    runtime().block_on(runtime().registry().close(session_id));
}

/// The host's subscriber for this session is installed; handlers blocked in
/// `wait_ready` may start sending.
#[no_mangle]
pub extern "C" fn gangway_stream_ready(session_id: i64) {
    runtime().registry().signal_ready(session_id);
}

/// Complete a pending host callback with its response payload.
///
/// # Safety
///
/// `data`, when non-null, must point at `len` readable bytes for the
/// duration of the call.
#[no_mangle]
pub unsafe extern "C" fn gangway_send_async_response(
    request_id: i64,
    data: *const c_void,
    len: i64,
) {
    // SAFETY: caller contract; copied before handing off.
    let payload = Bytes::copy_from_slice(unsafe { bytes_from_raw(data, len) });
    runtime().matcher().complete(request_id, payload);
}
