//! End-to-end tests of the C export surface with real `extern "C"`
//! callbacks.
//!
//! The FFI state is process-global, so every test serializes on one mutex
//! and resets the pieces it touches. Tests are plain `#[test]`s: the
//! exports block on the bridge's own runtime, exactly like a host thread.

use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use gangway_core::{ErrorCode, Status, StatusDetail, UnaryResponse, stream_handler};
use gangway_ffi::{
    CallOptions, FfiData, UnaryService, gangway_close_stream, gangway_close_stream_input,
    gangway_free_data, gangway_invoke_unary, gangway_invoke_unary_with_metadata,
    gangway_open_bidi_stream, gangway_open_client_stream, gangway_open_server_stream,
    gangway_push_stream_data, gangway_register_stream_callback,
    gangway_register_stream_callback_zero_copy, gangway_register_unary_callback,
    gangway_send_async_response, gangway_stream_ready, host,
};
use prost::Message;

// ----------------------------------------------------------------------
// Shared harness
// ----------------------------------------------------------------------

static FFI_LOCK: Mutex<()> = Mutex::new(());

fn lock_ffi() -> MutexGuard<'static, ()> {
    init_tracing();
    FFI_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

static FRAMES: Mutex<Vec<(i64, u8, Vec<u8>)>> = Mutex::new(Vec::new());

/// Recording copy-variant stream callback. Releases the transferred
/// allocation after copying it out, as a real host would.
unsafe extern "C" fn record_stream_frame(session_id: i64, kind: u8, data: *mut c_void, len: i64) {
    let bytes = if data.is_null() || len <= 0 {
        Vec::new()
    } else {
        // SAFETY: the runtime hands us `len` bytes it just allocated.
        unsafe { std::slice::from_raw_parts(data as *const u8, len as usize).to_vec() }
    };
    if !data.is_null() {
        // SAFETY: ownership of the allocation transferred to us.
        unsafe { libc::free(data) };
    }
    FRAMES.lock().unwrap().push((session_id, kind, bytes));
}

static LAST_HOST_REQUEST: AtomicI64 = AtomicI64::new(0);

/// Host unary callback that records the request id and never answers.
unsafe extern "C" fn silent_host_callback(
    request_id: i64,
    _method: *const c_char,
    _data: *mut c_void,
    _len: i64,
) {
    LAST_HOST_REQUEST.store(request_id, Ordering::SeqCst);
}

fn reset_ffi_state() {
    gangway_ffi::dispatcher().unregister_all();
    gangway_ffi::clear_service();
    gangway_register_stream_callback(None);
    gangway_register_stream_callback_zero_copy(None);
    gangway_register_unary_callback(None);
    gangway_ffi::matcher().set_timeout(gangway_core::DEFAULT_RESPONSE_TIMEOUT);
    FRAMES.lock().unwrap().clear();
    LAST_HOST_REQUEST.store(0, Ordering::SeqCst);
}

fn frames_snapshot() -> Vec<(i64, u8, Vec<u8>)> {
    FRAMES.lock().unwrap().clone()
}

/// Poll the recorded frames until `pred` passes or `timeout` elapses.
fn wait_for_frames(
    pred: impl Fn(&[(i64, u8, Vec<u8>)]) -> bool,
    timeout: Duration,
) -> Vec<(i64, u8, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    loop {
        let frames = frames_snapshot();
        if pred(&frames) {
            return frames;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for frames; got {frames:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

const FRAME_DATA: u8 = 0x02;
const FRAME_END: u8 = 0x03;
const FRAME_ERROR: u8 = 0x04;

fn has_terminal_frame(frames: &[(i64, u8, Vec<u8>)]) -> bool {
    frames
        .iter()
        .any(|(_, kind, _)| *kind == FRAME_END || *kind == FRAME_ERROR)
}

struct TestService;

impl UnaryService for TestService {
    fn invoke(
        &self,
        _call: CallOptions,
        method: &str,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<UnaryResponse, Status>> {
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "test/swap" => {
                    if payload.as_ref() == [0x01, 0x02, 0x03] {
                        Ok(vec![0x0A, 0x0B].into())
                    } else {
                        Err(Status::invalid_argument("unexpected payload"))
                    }
                }
                "test/slow" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(vec![1].into())
                }
                "test/fail" => Err(Status::invalid_argument("bad input")),
                _ => Err(Status::not_found(format!("method {method} not found"))),
            }
        })
    }
}

fn decode_error(reply: &FfiData) -> Status {
    assert!(reply.len < 0, "expected an error reply, got len {}", reply.len);
    let bytes = unsafe {
        std::slice::from_raw_parts(reply.data as *const u8, reply.len.unsigned_abs() as usize)
    };
    let detail = StatusDetail::decode(bytes).expect("error payload must be a StatusDetail");
    Status::from_detail(&detail)
}

fn invoke(method: &str, payload: &[u8]) -> FfiData {
    let method = std::ffi::CString::new(method).unwrap();
    unsafe {
        gangway_invoke_unary(
            method.as_ptr(),
            payload.as_ptr() as *const c_void,
            payload.len() as i64,
        )
    }
}

// ----------------------------------------------------------------------
// Unary surface
// ----------------------------------------------------------------------

#[test]
fn unary_ffi_round_trip() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_ffi::install_service(std::sync::Arc::new(TestService));

    let reply = invoke("test/swap", &[0x01, 0x02, 0x03]);
    assert_eq!(reply.len, 2);
    let bytes = unsafe { std::slice::from_raw_parts(reply.data as *const u8, 2) };
    assert_eq!(bytes, &[0x0A, 0x0B]);
    unsafe { gangway_free_data(reply.data) };
}

#[test]
fn unary_error_comes_back_as_negative_status_detail() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_ffi::install_service(std::sync::Arc::new(TestService));

    let reply = invoke("test/fail", &[]);
    let status = decode_error(&reply);
    assert_eq!(status.code, ErrorCode::InvalidArgument);
    assert_eq!(status.message, "bad input");
    unsafe { gangway_free_data(reply.data) };
}

#[test]
fn unary_without_installed_service_is_not_initialized() {
    let _guard = lock_ffi();
    reset_ffi_state();

    let reply = invoke("test/swap", &[0x01]);
    let status = decode_error(&reply);
    assert_eq!(status.code, ErrorCode::NotInitialized);
    unsafe { gangway_free_data(reply.data) };
}

#[test]
fn metadata_timeout_bounds_the_call() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_ffi::install_service(std::sync::Arc::new(TestService));

    let method = std::ffi::CString::new("test/slow").unwrap();
    let meta = b"__timeout_ms=50\n";
    let reply = unsafe {
        gangway_invoke_unary_with_metadata(
            method.as_ptr(),
            std::ptr::null(),
            0,
            meta.as_ptr() as *const c_void,
            meta.len() as i64,
        )
    };
    let status = decode_error(&reply);
    assert_eq!(status.code, ErrorCode::DeadlineExceeded);
    unsafe { gangway_free_data(reply.data) };
}

// ----------------------------------------------------------------------
// Streaming surface
// ----------------------------------------------------------------------

#[test]
fn server_stream_honors_the_ready_handshake() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_register_stream_callback(Some(record_stream_frame));

    gangway_ffi::dispatcher().register_server_stream("test/server_stream", |_initial| {
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

    let method = std::ffi::CString::new("test/server_stream").unwrap();
    let start = Instant::now();
    let id = unsafe { gangway_open_server_stream(method.as_ptr(), std::ptr::null(), 0) };
    assert!(id > 0);

    // Late subscription: nothing may arrive before the ready signal.
    std::thread::sleep(Duration::from_millis(100));
    assert!(frames_snapshot().is_empty());
    gangway_stream_ready(id);

    let frames = wait_for_frames(has_terminal_frame, Duration::from_secs(5));
    assert!(start.elapsed() >= Duration::from_millis(140));
    assert_eq!(frames.len(), 6);
    for (i, (session_id, kind, payload)) in frames[..5].iter().enumerate() {
        assert_eq!(*session_id, id);
        assert_eq!(*kind, FRAME_DATA);
        assert_eq!(payload.as_slice(), &[i as u8 + 1]);
    }
    assert_eq!(frames[5].1, FRAME_END);
}

#[test]
fn bidi_stream_echoes_over_the_c_surface() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_register_stream_callback(Some(record_stream_frame));

    gangway_ffi::dispatcher().register_bidi_stream("test/bidi_stream", || {
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

    let method = std::ffi::CString::new("test/bidi_stream").unwrap();
    let id = unsafe { gangway_open_bidi_stream(method.as_ptr()) };
    assert!(id > 0);
    gangway_stream_ready(id);

    for byte in [0xAAu8, 0xBB] {
        let rc = unsafe {
            gangway_push_stream_data(id, [byte].as_ptr() as *const c_void, 1)
        };
        assert_eq!(rc, 0);
    }

    let frames = wait_for_frames(|f| f.len() >= 2, Duration::from_secs(5));
    assert_eq!(frames[0], (id, FRAME_DATA, vec![0xAA]));
    assert_eq!(frames[1], (id, FRAME_DATA, vec![0xBB]));

    gangway_close_stream_input(id);
    let frames = wait_for_frames(has_terminal_frame, Duration::from_secs(5));
    assert_eq!(frames.last().unwrap().1, FRAME_END);
}

#[test]
fn push_to_a_closed_stream_reports_an_error() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_register_stream_callback(Some(record_stream_frame));

    gangway_ffi::dispatcher().register_client_stream("test/drain", || {
        stream_handler(|session| async move {
            while session.recv().await.is_some() {}
            session.close_send().await?;
            Ok(())
        })
    });

    let method = std::ffi::CString::new("test/drain").unwrap();
    let id = unsafe { gangway_open_client_stream(method.as_ptr()) };
    assert!(id > 0);
    gangway_close_stream(id);

    let rc = unsafe { gangway_push_stream_data(id, [1u8].as_ptr() as *const c_void, 1) };
    assert_eq!(rc, -1);

    // Unknown method sentinel while we are here.
    let missing = std::ffi::CString::new("test/missing").unwrap();
    assert_eq!(unsafe { gangway_open_client_stream(missing.as_ptr()) }, -1);
}

static ZERO_COPY_FRAMES: Mutex<Vec<(i64, u8, Vec<u8>)>> = Mutex::new(Vec::new());

/// Recording zero-copy stream callback.
unsafe extern "C" fn record_zero_copy_frame(
    session_id: i64,
    kind: u8,
    data: *mut c_void,
    len: i64,
) {
    let bytes = if data.is_null() || len <= 0 {
        Vec::new()
    } else {
        // SAFETY: the runtime serialized `len` bytes into this allocation.
        unsafe { std::slice::from_raw_parts(data as *const u8, len as usize).to_vec() }
    };
    if !data.is_null() {
        // SAFETY: ownership of the allocation transferred to us.
        unsafe { libc::free(data) };
    }
    ZERO_COPY_FRAMES.lock().unwrap().push((session_id, kind, bytes));
}

#[test]
fn zero_copy_callback_takes_data_frames_only() {
    let _guard = lock_ffi();
    reset_ffi_state();
    ZERO_COPY_FRAMES.lock().unwrap().clear();
    gangway_register_stream_callback(Some(record_stream_frame));
    gangway_register_stream_callback_zero_copy(Some(record_zero_copy_frame));

    let detail = StatusDetail {
        code: 0,
        message: "zero copy".into(),
    };
    let expected = detail.encode_to_vec();

    gangway_ffi::dispatcher().register_server_stream("test/zero_copy", move |_initial| {
        let detail = detail.clone();
        stream_handler(move |session| async move {
            session
                .send_message(&gangway_core::ProtoFrame(detail))
                .await?;
            session.close_send().await?;
            Ok(())
        })
    });

    let method = std::ffi::CString::new("test/zero_copy").unwrap();
    let id = unsafe { gangway_open_server_stream(method.as_ptr(), std::ptr::null(), 0) };
    assert!(id > 0);

    let frames = wait_for_frames(has_terminal_frame, Duration::from_secs(5));

    // DATA went through the zero-copy registration, serialized in place;
    // the metadata frame (END) stayed on the copy path.
    let zero_copy = ZERO_COPY_FRAMES.lock().unwrap().clone();
    assert_eq!(zero_copy, vec![(id, FRAME_DATA, expected)]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, FRAME_END);
}

// ----------------------------------------------------------------------
// Host bridge
// ----------------------------------------------------------------------

#[test]
fn matcher_timeout_surfaces_as_stream_error() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_register_stream_callback(Some(record_stream_frame));
    gangway_register_unary_callback(Some(silent_host_callback));
    gangway_ffi::matcher().set_timeout(Duration::from_millis(100));

    gangway_ffi::dispatcher().register_server_stream("test/ask_host", |_initial| {
        stream_handler(|_session| async move {
            host::invoke_host("host/question", b"?").await?;
            Ok(())
        })
    });

    let method = std::ffi::CString::new("test/ask_host").unwrap();
    let id = unsafe { gangway_open_server_stream(method.as_ptr(), std::ptr::null(), 0) };
    assert!(id > 0);

    let frames = wait_for_frames(has_terminal_frame, Duration::from_secs(5));
    let (session_id, kind, payload) = frames.last().unwrap();
    assert_eq!(*session_id, id);
    assert_eq!(*kind, FRAME_ERROR);
    assert!(
        std::str::from_utf8(payload).unwrap().starts_with("timeout"),
        "error payload was {payload:?}"
    );

    // The pending entry was reclaimed.
    assert!(gangway_ffi::matcher().is_empty());
    assert!(LAST_HOST_REQUEST.load(Ordering::SeqCst) > 0);
}

#[test]
fn async_response_completes_the_host_call() {
    let _guard = lock_ffi();
    reset_ffi_state();
    gangway_register_stream_callback(Some(record_stream_frame));
    gangway_register_unary_callback(Some(silent_host_callback));

    gangway_ffi::dispatcher().register_server_stream("test/relay", |_initial| {
        stream_handler(|session| async move {
            let answer = host::invoke_host("host/lookup", b"key").await?;
            session.send(answer).await?;
            session.close_send().await?;
            Ok(())
        })
    });

    let method = std::ffi::CString::new("test/relay").unwrap();
    let id = unsafe { gangway_open_server_stream(method.as_ptr(), std::ptr::null(), 0) };
    assert!(id > 0);

    // Play the host: wait for the callback, then answer by request id.
    let deadline = Instant::now() + Duration::from_secs(2);
    let request_id = loop {
        let request_id = LAST_HOST_REQUEST.load(Ordering::SeqCst);
        if request_id > 0 {
            break request_id;
        }
        assert!(Instant::now() < deadline, "host callback never fired");
        std::thread::sleep(Duration::from_millis(5));
    };
    unsafe {
        gangway_send_async_response(request_id, [7u8, 7].as_ptr() as *const c_void, 2);
    }

    let frames = wait_for_frames(has_terminal_frame, Duration::from_secs(5));
    assert_eq!(frames[0], (id, FRAME_DATA, vec![7, 7]));
    assert_eq!(frames[1].1, FRAME_END);
}

static HOST_STREAM_SESSION: AtomicI64 = AtomicI64::new(0);

/// Kickoff callback for host-directed streams: records the request id and
/// parses the session id off the `method:<id>` suffix.
unsafe extern "C" fn stream_kickoff_callback(
    request_id: i64,
    method: *const c_char,
    _data: *mut c_void,
    _len: i64,
) {
    // SAFETY: the runtime passes a NUL-terminated method string.
    let method = unsafe { std::ffi::CStr::from_ptr(method) }.to_string_lossy();
    if let Some((_, id)) = method.rsplit_once(':') {
        if let Ok(id) = id.parse::<i64>() {
            HOST_STREAM_SESSION.store(id, Ordering::SeqCst);
        }
    }
    LAST_HOST_REQUEST.store(request_id, Ordering::SeqCst);
}

#[test]
fn host_stream_collects_pushed_payloads() {
    let _guard = lock_ffi();
    reset_ffi_state();
    HOST_STREAM_SESSION.store(0, Ordering::SeqCst);
    gangway_register_unary_callback(Some(stream_kickoff_callback));

    // Play the host on a thread: answer the kickoff call, push two
    // payloads into the session named by the method suffix, signal EOF.
    let host_thread = std::thread::spawn(|| {
        let deadline = Instant::now() + Duration::from_secs(2);
        let (request_id, session_id) = loop {
            let request_id = LAST_HOST_REQUEST.load(Ordering::SeqCst);
            let session_id = HOST_STREAM_SESSION.load(Ordering::SeqCst);
            if request_id > 0 && session_id > 0 {
                break (request_id, session_id);
            }
            assert!(Instant::now() < deadline, "kickoff callback never fired");
            std::thread::sleep(Duration::from_millis(5));
        };

        unsafe { gangway_send_async_response(request_id, std::ptr::null(), 0) };
        for byte in [0x11u8, 0x22] {
            let rc = unsafe {
                gangway_push_stream_data(session_id, [byte].as_ptr() as *const c_void, 1)
            };
            assert_eq!(rc, 0);
        }
        gangway_close_stream_input(session_id);
    });

    let result = gangway_ffi::runtime().block_on(async {
        host::invoke_host_stream("host/list", b"all", Duration::from_secs(5)).await
    });
    host_thread.join().unwrap();

    let responses = result.unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].as_ref(), &[0x11]);
    assert_eq!(responses[1].as_ref(), &[0x22]);
}
