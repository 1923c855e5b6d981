//! Byte-source abstraction consumed by the line framer

use crate::error::Result;
use std::io::{ErrorKind, Read};
use std::net::TcpStream;

/// Source of bytes for a [`LineFramer`](super::LineFramer).
///
/// `read` fills at most `buffer.len()` bytes and returns how many were
/// placed. Returning `Ok(0)` means the stream is closed.
pub trait ByteSource: Send {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;
}

impl ByteSource for TcpStream {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        loop {
            match Read::read(self, buffer) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        (**self).read(buffer)
    }
}
