use bytes::{Buf, BufMut};

/// An error raised when decoding persisted keys or digests.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The input ended before a complete value was read.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// A granularity byte did not match any known granularity.
    #[error("unknown granularity id {0}")]
    InvalidGranularity(u8),
    /// A string field did not contain valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    /// A string field exceeded the maximum encodable length.
    #[error("string field of {0} bytes is too long")]
    StringTooLong(usize),
    /// Bytes were left over after decoding a complete value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

pub(crate) fn ensure(buf: &impl Buf, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(())
}

pub(crate) fn put_str(buf: &mut impl BufMut, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn get_str(buf: &mut impl Buf) -> Result<String, CodecError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;

    let mut bytes = vec![0; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

pub(crate) fn finish(buf: &impl Buf) -> Result<(), CodecError> {
    match buf.remaining() {
        0 => Ok(()),
        n => Err(CodecError::TrailingBytes(n)),
    }
}
