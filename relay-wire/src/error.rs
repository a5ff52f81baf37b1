/// Decode failures always carry the byte offset of the field that failed, so
/// callers can log with context (§4.A: "the field that failed is identified
/// by byte offset for logging").
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of payload at offset {offset}")]
    Truncated { offset: usize },
    #[error("unknown type tag {tag:?} at offset {offset}")]
    UnknownTag { offset: usize, tag: u8 },
    #[error("malformed length prefix at offset {offset}")]
    BadLength { offset: usize },
    #[error("invalid utf-8 text at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid numeric literal at offset {offset}")]
    BadNumber { offset: usize },
    #[error("trailing bytes after a complete value ({trailing} byte(s) at offset {offset})")]
    TrailingBytes { offset: usize, trailing: usize },
    #[error("empty payload")]
    Empty,
}
