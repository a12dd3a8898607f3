//! Platform seam for shared-library access.
//!
//! The loader never touches `dlopen` directly: every OS interaction goes
//! through [`PluginPlatform`], so tests can substitute a scripted mock and
//! drive the unload/in-flight machinery without a real shared object.
//!
//! Symbols are opaque addresses. The C signatures they are cast back to are
//! the plugin export contract:
//!
//! ```c
//! char*              Gangway_Invoke_<Service>(char* method, char* data, int len, int* resp_len);
//! void               Gangway_Free(char* ptr);
//! unsigned long long Gangway_Stream_<Service>_Open(char* method);
//! int                Gangway_Stream_Send(unsigned long long h, char* data, int len);
//! char*              Gangway_Stream_Recv(unsigned long long h, int* resp_len, int* status);
//! void               Gangway_Stream_CloseSend(unsigned long long h);
//! void               Gangway_Stream_Close(unsigned long long h);
//! ```

use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::Arc;

use crate::PluginError;

/// Opaque token for a loaded library.
pub type LibraryHandle = usize;

/// Opaque address of a resolved symbol.
pub type RawSymbol = usize;

/// Raw result of one stream recv: optional copied bytes, the reported
/// length, and the status word (0 = data, 1 = EOF, other = error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvOutcome {
    pub data: Option<Vec<u8>>,
    pub len: i32,
    pub status: i32,
}

/// Everything the loader needs from the OS and the plugin's C surface.
pub trait PluginPlatform: Send + Sync + 'static {
    fn open(&self, path: &Path) -> Result<LibraryHandle, PluginError>;
    fn symbol(&self, library: LibraryHandle, name: &str) -> Result<RawSymbol, PluginError>;
    fn close(&self, library: LibraryHandle);

    fn invoke(
        &self,
        invoke_fn: RawSymbol,
        free_fn: RawSymbol,
        method: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, PluginError>;

    fn stream_open(&self, open_fn: RawSymbol, method: &str) -> u64;
    fn stream_send(&self, send_fn: RawSymbol, handle: u64, data: &[u8]) -> i32;
    fn stream_recv(&self, recv_fn: RawSymbol, free_fn: RawSymbol, handle: u64) -> RecvOutcome;
    fn stream_close_send(&self, close_send_fn: RawSymbol, handle: u64);
    fn stream_close(&self, close_fn: RawSymbol, handle: u64);
}

type InvokeFn =
    unsafe extern "C" fn(*const c_char, *const c_char, c_int, *mut c_int) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type StreamOpenFn = unsafe extern "C" fn(*const c_char) -> u64;
type StreamSendFn = unsafe extern "C" fn(u64, *const c_char, c_int) -> c_int;
type StreamRecvFn = unsafe extern "C" fn(u64, *mut c_int, *mut c_int) -> *mut c_char;
type StreamHandleFn = unsafe extern "C" fn(u64);

/// The real platform: `libloading` for load/resolve, direct calls through
/// the cast function pointers.
pub struct DlPlatform;

impl DlPlatform {
    /// Shared instance used by `Plugin::load`.
    pub fn shared() -> Arc<dyn PluginPlatform> {
        static SHARED: std::sync::LazyLock<Arc<DlPlatform>> =
            std::sync::LazyLock::new(|| Arc::new(DlPlatform));
        SHARED.clone()
    }
}

fn c_string(value: &str) -> Result<CString, PluginError> {
    CString::new(value).map_err(|_| PluginError::Invoke(format!("string {value:?} contains NUL")))
}

impl PluginPlatform for DlPlatform {
    fn open(&self, path: &Path) -> Result<LibraryHandle, PluginError> {
        // SAFETY: loading a library runs its initializers; that is the
        // entire point of a plugin and the caller opted into it by path.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| PluginError::Load(e.to_string()))?;
        Ok(Box::into_raw(Box::new(library)) as LibraryHandle)
    }

    fn symbol(&self, library: LibraryHandle, name: &str) -> Result<RawSymbol, PluginError> {
        // SAFETY: `library` came out of `open` above and is only freed by
        // `close`, which the loader calls strictly after the last resolve.
        let library = unsafe { &*(library as *const libloading::Library) };
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        // SAFETY: the resolved address is only ever cast back to the
        // signatures documented in the module header.
        let symbol = unsafe { library.get::<unsafe extern "C" fn()>(&bytes) }
            .map_err(|_| PluginError::Symbol(name.to_string()))?;
        Ok(*symbol as RawSymbol)
    }

    fn close(&self, library: LibraryHandle) {
        // SAFETY: handles are created exactly once in `open` and the loader
        // guarantees no call is in flight when it unloads.
        drop(unsafe { Box::from_raw(library as *mut libloading::Library) });
    }

    fn invoke(
        &self,
        invoke_fn: RawSymbol,
        free_fn: RawSymbol,
        method: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, PluginError> {
        let method = c_string(method)?;
        let mut resp_len: c_int = 0;

        // SAFETY: invoke_fn/free_fn were resolved against the documented
        // export signatures; data outlives the synchronous call; the
        // returned buffer is copied before being handed back to the
        // plugin's own free.
        unsafe {
            let invoke: InvokeFn = std::mem::transmute(invoke_fn);
            let response = invoke(
                method.as_ptr(),
                data.as_ptr() as *const c_char,
                data.len() as c_int,
                &mut resp_len,
            );
            if response.is_null() {
                return Err(PluginError::Invoke("plugin returned nil".to_string()));
            }
            let bytes =
                std::slice::from_raw_parts(response as *const u8, resp_len.max(0) as usize)
                    .to_vec();
            let free: FreeFn = std::mem::transmute(free_fn);
            free(response);
            Ok(bytes)
        }
    }

    fn stream_open(&self, open_fn: RawSymbol, method: &str) -> u64 {
        let Ok(method) = c_string(method) else {
            return 0;
        };
        // SAFETY: see invoke.
        unsafe {
            let open: StreamOpenFn = std::mem::transmute(open_fn);
            open(method.as_ptr())
        }
    }

    fn stream_send(&self, send_fn: RawSymbol, handle: u64, data: &[u8]) -> i32 {
        // SAFETY: see invoke; the plugin must copy before returning.
        unsafe {
            let send: StreamSendFn = std::mem::transmute(send_fn);
            send(handle, data.as_ptr() as *const c_char, data.len() as c_int)
        }
    }

    fn stream_recv(&self, recv_fn: RawSymbol, free_fn: RawSymbol, handle: u64) -> RecvOutcome {
        let mut resp_len: c_int = 0;
        let mut status: c_int = 0;
        // SAFETY: see invoke.
        unsafe {
            let recv: StreamRecvFn = std::mem::transmute(recv_fn);
            let response = recv(handle, &mut resp_len, &mut status);
            let data = if response.is_null() {
                None
            } else {
                let bytes =
                    std::slice::from_raw_parts(response as *const u8, resp_len.max(0) as usize)
                        .to_vec();
                let free: FreeFn = std::mem::transmute(free_fn);
                free(response);
                Some(bytes)
            };
            RecvOutcome {
                data,
                len: resp_len,
                status,
            }
        }
    }

    fn stream_close_send(&self, close_send_fn: RawSymbol, handle: u64) {
        // SAFETY: see invoke.
        unsafe {
            let close_send: StreamHandleFn = std::mem::transmute(close_send_fn);
            close_send(handle)
        }
    }

    fn stream_close(&self, close_fn: RawSymbol, handle: u64) {
        // SAFETY: see invoke.
        unsafe {
            let close: StreamHandleFn = std::mem::transmute(close_fn);
            close(handle)
        }
    }
}
