//! C-visible data carrier and allocation helpers.
//!
//! Every buffer that crosses to the host is `libc::malloc`ed and ownership
//! transfers with the pointer: the host releases it with its own free (or
//! [`gangway_free_data`](crate::gangway_free_data) for unary replies).

use std::os::raw::c_void;

use gangway_core::{FfiMessage, Status};

/// Byte buffer returned across the C boundary.
///
/// `len > 0`: success payload of `len` bytes. `len < 0`: error; `abs(len)`
/// bytes of a prost-encoded `StatusDetail`. `data` may be null when `len`
/// is zero.
#[repr(C)]
pub struct FfiData {
    pub data: *mut c_void,
    pub len: i64,
}

impl FfiData {
    pub fn empty() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }
}

/// Copy `bytes` into fresh C memory. Returns `(null, 0)` for an empty
/// slice or on allocation failure.
pub(crate) fn alloc_bytes(bytes: &[u8]) -> (*mut c_void, i64) {
    if bytes.is_empty() {
        return (std::ptr::null_mut(), 0);
    }
    // SAFETY: malloc'd region is at least bytes.len() long when non-null.
    unsafe {
        let ptr = libc::malloc(bytes.len());
        if ptr.is_null() {
            return (std::ptr::null_mut(), 0);
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        (ptr, bytes.len() as i64)
    }
}

/// Serialize `message` straight into fresh C memory.
pub(crate) fn alloc_message(message: &dyn FfiMessage) -> Result<(*mut c_void, i64), Status> {
    let len = message.encoded_len();
    if len == 0 {
        return Ok((std::ptr::null_mut(), 0));
    }
    // SAFETY: the slice covers exactly the malloc'd region; on encode
    // failure the region is released before returning.
    unsafe {
        let ptr = libc::malloc(len);
        if ptr.is_null() {
            return Err(Status::internal("failed to allocate C memory"));
        }
        let buf = std::slice::from_raw_parts_mut(ptr as *mut u8, len);
        if let Err(e) = message.encode_into(buf) {
            libc::free(ptr);
            return Err(e);
        }
        Ok((ptr, len as i64))
    }
}

/// View borrowed C memory as a byte slice. Null or non-positive length
/// yields the empty slice.
///
/// # Safety
///
/// When `data` is non-null it must point at `len` readable bytes that stay
/// valid for `'a`.
pub(crate) unsafe fn bytes_from_raw<'a>(data: *const c_void, len: i64) -> &'a [u8] {
    if data.is_null() || len <= 0 {
        return &[];
    }
    // SAFETY: caller contract.
    unsafe { std::slice::from_raw_parts(data as *const u8, len as usize) }
}
