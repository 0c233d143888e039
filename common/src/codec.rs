use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

use crate::config::Framing;

/// Default upper bound for a single control record.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// One record read from the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// JSON text of one control record
    Message(String),
    /// A record that was dropped at the framing layer. The reader has already
    /// resynchronised and the next frame can be decoded normally.
    Rejected(FrameFault),
}

/// Recoverable framing faults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameFault {
    #[error("frame exceeds the {limit} byte limit")]
    TooLong { limit: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Unrecoverable control channel failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec for the relay's control channel.
///
/// `Lines` carries one JSON record per `\n`-terminated line. `LengthDelimited`
/// prefixes every JSON payload with its length as a little-endian `u32`.
#[derive(Debug)]
pub enum ControlCodec {
    Lines {
        inner: LinesCodec,
        limit: usize,
    },
    LengthDelimited {
        encoder: LengthDelimitedCodec,
        limit:   usize,
        /// Bytes of a rejected record still to be discarded
        skip:    usize,
    },
}

const LENGTH_PREFIX: usize = 4;

impl ControlCodec {
    pub fn new(framing: Framing, max_frame_length: usize) -> Self {
        match framing {
            Framing::Lines => ControlCodec::Lines {
                inner: LinesCodec::new_with_max_length(max_frame_length),
                limit: max_frame_length,
            },
            Framing::LengthDelimited => ControlCodec::LengthDelimited {
                encoder: LengthDelimitedCodec::builder()
                    .little_endian()
                    .length_field_length(LENGTH_PREFIX)
                    .max_frame_length(max_frame_length)
                    .new_codec(),
                limit:   max_frame_length,
                skip:    0,
            },
        }
    }

    fn lines_result(result: Result<Option<String>, LinesCodecError>, limit: usize) -> Result<Option<InboundFrame>, CodecError> {
        match result {
            Ok(line) => Ok(line.map(InboundFrame::Message)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(InboundFrame::Rejected(FrameFault::TooLong { limit }))),
            // The offending line has already been consumed.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(InboundFrame::Rejected(FrameFault::InvalidUtf8)))
            }
            Err(LinesCodecError::Io(e)) => Err(CodecError::Io(e)),
        }
    }

    fn length_delimited(src: &mut BytesMut, limit: usize, skip: &mut usize) -> Option<InboundFrame> {
        if *skip > 0 {
            let discarded = (*skip).min(src.len());
            src.advance(discarded);
            *skip -= discarded;
            if *skip > 0 {
                return None;
            }
        }

        if src.len() < LENGTH_PREFIX {
            return None;
        }
        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > limit {
            // Drop the oversized record as it streams in and resume at the next prefix.
            src.advance(LENGTH_PREFIX);
            let discarded = length.min(src.len());
            src.advance(discarded);
            *skip = length - discarded;
            return Some(InboundFrame::Rejected(FrameFault::TooLong { limit }));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return None;
        }
        src.advance(LENGTH_PREFIX);
        Some(Self::payload(src.split_to(length)))
    }

    fn payload(frame: BytesMut) -> InboundFrame {
        match String::from_utf8(frame.to_vec()) {
            Ok(text) => InboundFrame::Message(text),
            Err(_) => InboundFrame::Rejected(FrameFault::InvalidUtf8),
        }
    }
}

impl Decoder for ControlCodec {
    type Error = CodecError;
    type Item = InboundFrame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            ControlCodec::Lines { inner, limit } => Self::lines_result(inner.decode(src), *limit),
            ControlCodec::LengthDelimited { limit, skip, .. } => Ok(Self::length_delimited(src, *limit, skip)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            ControlCodec::Lines { inner, limit } => Self::lines_result(inner.decode_eof(src), *limit),
            ControlCodec::LengthDelimited { limit, skip, .. } => match Self::length_delimited(src, *limit, skip) {
                Some(frame) => Ok(Some(frame)),
                None if src.is_empty() => Ok(None),
                None => Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control channel closed mid-record",
                ))),
            },
        }
    }
}

impl Encoder<String> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            ControlCodec::Lines { inner, .. } => inner.encode(item, dst).map_err(|e| match e {
                LinesCodecError::Io(e) => CodecError::Io(e),
                LinesCodecError::MaxLineLengthExceeded => {
                    CodecError::Io(io::Error::new(io::ErrorKind::InvalidInput, "line too long"))
                }
            }),
            ControlCodec::LengthDelimited { encoder, .. } => Ok(encoder.encode(Bytes::from(item), dst)?),
        }
    }
}
