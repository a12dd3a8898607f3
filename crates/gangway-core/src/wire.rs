//! Object-safe encoding facade for payloads crossing the C boundary.
//!
//! The zero-copy outbound paths serialize a message straight into a freshly
//! allocated C-visible buffer. `FfiMessage` is the seam that makes that
//! possible without naming a concrete message type: it reports the exact
//! encoded length up front and then encodes into a caller-provided buffer.

use bytes::Bytes;

use crate::Status;

/// A payload that can report its encoded length and encode itself into a
/// pre-sized buffer.
pub trait FfiMessage: Send + Sync {
    /// Exact number of bytes `encode_into` will write.
    fn encoded_len(&self) -> usize;

    /// Encode into `buf`, which is exactly `encoded_len()` bytes.
    fn encode_into(&self, buf: &mut [u8]) -> Result<(), Status>;
}

impl FfiMessage for Bytes {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), Status> {
        buf.copy_from_slice(self);
        Ok(())
    }
}

impl FfiMessage for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), Status> {
        buf.copy_from_slice(self);
        Ok(())
    }
}

/// Adapter giving any prost message an [`FfiMessage`] implementation.
///
/// A wrapper rather than a blanket impl so byte buffers can implement the
/// trait too.
pub struct ProtoFrame<M>(pub M);

impl<M: prost::Message> FfiMessage for ProtoFrame<M> {
    fn encoded_len(&self) -> usize {
        self.0.encoded_len()
    }

    fn encode_into(&self, mut buf: &mut [u8]) -> Result<(), Status> {
        self.0
            .encode(&mut buf)
            .map_err(|e| Status::internal(format!("message encode failed: {e}")))
    }
}

/// The successful result of a unary FFI invocation.
///
/// Wraps an [`FfiMessage`] so the export layer can serialize directly into C
/// memory regardless of whether the service produced raw bytes or a typed
/// message.
pub struct UnaryResponse(Box<dyn FfiMessage>);

impl UnaryResponse {
    pub fn from_message<M: prost::Message + 'static>(message: M) -> Self {
        Self(Box::new(ProtoFrame(message)))
    }

    pub fn into_inner(self) -> Box<dyn FfiMessage> {
        self.0
    }
}

impl From<Bytes> for UnaryResponse {
    fn from(bytes: Bytes) -> Self {
        Self(Box::new(bytes))
    }
}

impl From<Vec<u8>> for UnaryResponse {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Box::new(bytes))
    }
}
