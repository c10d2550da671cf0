//! The serialization collaborator seam.
//!
//! The invocation layer treats payloads as opaque typed values; marshalling to
//! and from bytes is done by the types themselves (in production, by generated
//! stubs implementing [`Marshal`]). Failures are passed through unchanged as
//! [`Error::Serialization`].

use bytes::Bytes;

use crate::error::Error;

/// Marshals a request/response payload to and from bytes.
pub trait Marshal: Send + Sync + Sized + 'static {
    fn to_bytes(&self) -> Result<Bytes, Error>;
    fn from_bytes(bytes: &Bytes) -> Result<Self, Error>;
}

impl Marshal for Bytes {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(self.clone())
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self, Error> {
        Ok(bytes.clone())
    }
}

impl Marshal for Vec<u8> {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self))
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self, Error> {
        Ok(bytes.to_vec())
    }
}

impl Marshal for String {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self, Error> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| Error::Serialization(format!("invalid utf-8 payload: {}", e)))
    }
}
