//! Fixed-length record encoding.

use thiserror::Error;

use crate::response::{ResponseType, SizeVector};

/// Bytes taken by the code at the start of every record.
pub const HEADER_LEN: usize = 4;

/// Longest fault record: kind, size role and two size vectors.
pub const FAULT_LEN: usize = 2 + 2 * ResponseType::COUNT;

/// Payload length used by `open` and `setup`, before sizes are agreed.
///
/// Holds two size vectors plus the proposed `data_size`, or a fault record.
pub const HANDSHAKE_PAYLOAD_LEN: usize = FAULT_LEN;

/// Smallest negotiated payload; replies carrying a fault record need it.
pub const MIN_PAYLOAD_LEN: usize = HANDSHAKE_PAYLOAD_LEN;

/// Default upper bound on the negotiated payload, in doubles.
pub const DEFAULT_PAYLOAD_CAP: usize = 256;

const F64_LEN: usize = size_of::<f64>();

/// Errors during record encode/decode.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Fewer bytes than one record of the current layout.
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },
    /// More bytes than one record of the current layout.
    #[error("malformed record: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
    /// The vectors do not fit into the payload.
    #[error("payload overflow: {values} values exceed payload length {capacity}")]
    PayloadOverflow { values: usize, capacity: usize },
    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),
    #[error("unknown return code: {0}")]
    UnknownReturnCode(i32),
}

/// Shape of every record on a session.
///
/// Invariant: both peers hold the same layout at all times. The layout
/// changes exactly once, after a successful `setup` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    payload_len: usize,
}

impl RecordLayout {
    /// Layout of `open` and `setup` records.
    pub const HANDSHAKE: Self = Self::new(HANDSHAKE_PAYLOAD_LEN);

    #[must_use]
    pub const fn new(payload_len: usize) -> Self {
        Self { payload_len }
    }

    /// Number of doubles after the code.
    #[inline]
    pub const fn payload_len(self) -> usize {
        self.payload_len
    }

    /// Bytes per record.
    #[inline]
    pub const fn record_len(self) -> usize {
        HEADER_LEN + self.payload_len * F64_LEN
    }

    /// Payload length needed to carry the given sizes.
    ///
    /// Covers the flattened command vectors, the flattened measured
    /// vectors, an `n × n` matrix reply and a fault record, whichever is
    /// largest.
    #[must_use]
    pub fn data_size(commands: SizeVector, measured: SizeVector, matrix_dim: usize) -> usize {
        commands
            .total()
            .max(measured.total())
            .max(matrix_dim * matrix_dim)
            .max(MIN_PAYLOAD_LEN)
    }
}

struct RecordWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> RecordWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn pad_to(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }
}

struct RecordReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> RecordReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        arr
    }

    fn take_i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.take())
    }

    fn take_f64(&mut self) -> f64 {
        f64::from_ne_bytes(self.take())
    }
}

/// Encode one record into `buf`.
///
/// The vectors are written back to back and the rest of the payload is
/// zero filled. The buffer is cleared and reused (preserves capacity).
///
/// # Errors
///
/// Returns [`CodecError::PayloadOverflow`] if the vectors hold more values
/// than the layout's payload.
pub fn encode_record(
    code: i32,
    vectors: &[&[f64]],
    layout: RecordLayout,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let values: usize = vectors.iter().map(|v| v.len()).sum();
    if values > layout.payload_len() {
        return Err(CodecError::PayloadOverflow {
            values,
            capacity: layout.payload_len(),
        });
    }

    let mut w = RecordWriter::new(buf);
    w.put_i32(code);
    for v in vectors.iter().flat_map(|v| v.iter()) {
        w.put_f64(*v);
    }
    w.pad_to(layout.record_len());
    Ok(())
}

/// Decode one record, writing its payload into `payload`.
///
/// Returns the raw code; mapping it to an [`Opcode`](super::Opcode) or
/// [`ReturnCode`](super::ReturnCode) is up to the receiver.
///
/// # Errors
///
/// Returns [`CodecError::ShortRead`] if `bytes` is shorter than one record
/// and [`CodecError::Malformed`] if it is longer. A short buffer is never
/// read as a record with shorter vectors.
pub fn decode_record(
    bytes: &[u8],
    layout: RecordLayout,
    payload: &mut Vec<f64>,
) -> Result<i32, CodecError> {
    let expected = layout.record_len();
    if bytes.len() < expected {
        return Err(CodecError::ShortRead {
            need: expected,
            have: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(CodecError::Malformed {
            expected,
            actual: bytes.len(),
        });
    }

    let mut r = RecordReader::new(bytes);
    let code = r.take_i32();
    payload.clear();
    payload.extend((0..layout.payload_len()).map(|_| r.take_f64()));
    Ok(code)
}
