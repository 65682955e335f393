//! Shadow/actor wire protocol.
//!
//! # Wire Format
//!
//! Every message is one fixed-length record:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────┐
//! │ Code (4) │ Payload: payload_len × f64, zero padded              │
//! └──────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! The code is an [`Opcode`] on requests and a [`ReturnCode`] on replies.
//! Vector lengths are not part of the payload: both sides slice it with the
//! size vectors agreed during `setup`. Until `setup` completes, records use
//! the [`RecordLayout::HANDSHAKE`] layout. After that, both sides switch to
//! the negotiated `data_size`, which stays fixed for the rest of the session.
//!
//! Values are written in native byte order. Both ends of a session must
//! share the same endianness and `f64` layout; mixing architectures is not
//! supported.
//!
//! # Exchange
//!
//! Strictly request then reply, one outstanding request per session:
//!
//! ```text
//! Shadow                                  Actor
//!   │ OPEN(version, tag, nonce)             │
//!   │──────────────────────────────────────>│
//!   │        COMPLETED(tag, version, nonce) │
//!   │<──────────────────────────────────────│
//!   │ SETUP(sizes_a, sizes_b, data_size)    │
//!   │──────────────────────────────────────>│
//!   │                             COMPLETED │   layout frozen
//!   │<──────────────────────────────────────│
//!   │ SET_TRIAL_RESPONSE(vectors)           │
//!   │──────────────────────────────────────>│
//!   │                 COMPLETED | FAILED(f) │
//!   │<──────────────────────────────────────│
//!   │ GET_DAQ_RESPONSE                      │
//!   │──────────────────────────────────────>│
//!   │                  COMPLETED(vectors)   │
//!   │<──────────────────────────────────────│
//!   │ COMMIT_STATE                          │
//!   │──────────────────────────────────────>│
//!   │                             COMPLETED │
//!   │<──────────────────────────────────────│
//!   │ DIE | SHUTDOWN                        │
//!   │──────────────────────────────────────>│
//!   │                              RECEIVED │
//!   │<──────────────────────────────────────│
//! ```

pub mod codec;
pub mod fault;
pub mod opcode;

pub use codec::{
    CodecError, DEFAULT_PAYLOAD_CAP, FAULT_LEN, HANDSHAKE_PAYLOAD_LEN, HEADER_LEN, MIN_PAYLOAD_LEN,
    RecordLayout, decode_record, encode_record,
};
pub use fault::RemoteFault;
pub use opcode::{LEGACY_PROTOCOL_VERSION, Opcode, PROTOCOL_VERSION, ReturnCode};
