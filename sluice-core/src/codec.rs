//! Response framing.
//!
//! The connection does not know the wire format of the ingestion protocol.
//! After every read it hands the received bytes to a [`FrameCodec`], which
//! says whether they form a complete response frame. The codec also supplies
//! the keep-alive probe, if the protocol has one.
//!
//! [`LengthPrefixedCodec`] is a reference implementation for protocols that
//! start each frame with a big-endian length header.

use crate::error::{ConnectionError, Result};
use bytes::Bytes;

/// Codec answer for the bytes received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A complete frame of this many bytes.
    Complete(usize),
    /// More bytes are needed.
    Partial,
    /// The bytes can never form a valid frame.
    Malformed(String),
}

/// Decides frame boundaries for responses.
pub trait FrameCodec: Send + 'static {
    /// Inspect the bytes received in the current cycle.
    fn check(&mut self, buf: &[u8]) -> Verdict;

    /// Frame to send as a keep-alive probe.
    ///
    /// `None` means the protocol has no probe; an idle connection is then
    /// failed instead of probed.
    fn probe_frame(&self) -> Option<Bytes> {
        None
    }
}

impl FrameCodec for Box<dyn FrameCodec> {
    fn check(&mut self, buf: &[u8]) -> Verdict {
        (**self).check(buf)
    }

    fn probe_frame(&self) -> Option<Bytes> {
        (**self).probe_frame()
    }
}

/// Width of the length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWidth {
    /// `u16`, big-endian.
    U16,
    /// `u32`, big-endian.
    U32,
}

impl HeaderWidth {
    #[inline]
    const fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Frames prefixed with a big-endian length header.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    width: HeaderWidth,
    /// Header counts itself in the length.
    inclusive: bool,
    max_frame: usize,
    probe: Option<Bytes>,
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(HeaderWidth::U32)
    }
}

impl LengthPrefixedCodec {
    /// Create a codec with an exclusive length header and no probe.
    pub fn new(width: HeaderWidth) -> Self {
        Self {
            width,
            inclusive: false,
            max_frame: 4 * 1024 * 1024,
            probe: None,
        }
    }

    /// Length includes the header itself.
    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    /// Largest acceptable frame, header included.
    pub fn max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }

    /// Use `frame` as the keep-alive probe.
    pub fn with_probe(mut self, frame: impl Into<Bytes>) -> Self {
        self.probe = Some(frame.into());
        self
    }

    /// Frame `payload` with this codec's header.
    ///
    /// Fails if the frame is larger than `max_frame` or than the header can
    /// express.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let header = self.width.bytes();
        let total = payload.len() + header;
        if total > self.max_frame {
            return Err(ConnectionError::Protocol(format!(
                "frame of {total} bytes exceeds limit of {}",
                self.max_frame
            )));
        }
        let len = if self.inclusive { total } else { payload.len() };
        let too_long = || {
            ConnectionError::Protocol(format!(
                "length {len} does not fit a {header}-byte header"
            ))
        };

        let mut out = Vec::with_capacity(total);
        match self.width {
            HeaderWidth::U16 => {
                let len = u16::try_from(len).map_err(|_| too_long())?;
                out.extend_from_slice(&len.to_be_bytes());
            }
            HeaderWidth::U32 => {
                let len = u32::try_from(len).map_err(|_| too_long())?;
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        out.extend_from_slice(payload);
        Ok(out.into())
    }

    fn frame_len(&self, buf: &[u8]) -> Option<usize> {
        let declared = match self.width {
            HeaderWidth::U16 => u16::from_be_bytes(buf.get(..2)?.try_into().ok()?) as usize,
            HeaderWidth::U32 => u32::from_be_bytes(buf.get(..4)?.try_into().ok()?) as usize,
        };
        Some(if self.inclusive {
            declared
        } else {
            declared + self.width.bytes()
        })
    }
}

impl FrameCodec for LengthPrefixedCodec {
    fn check(&mut self, buf: &[u8]) -> Verdict {
        let header = self.width.bytes();
        let Some(total) = self.frame_len(buf) else {
            return Verdict::Partial;
        };
        if total < header {
            return Verdict::Malformed(format!("declared length {total} shorter than header"));
        }
        if total > self.max_frame {
            return Verdict::Malformed(format!(
                "frame of {total} bytes exceeds limit of {}",
                self.max_frame
            ));
        }
        if buf.len() < total {
            Verdict::Partial
        } else {
            Verdict::Complete(total)
        }
    }

    fn probe_frame(&self) -> Option<Bytes> {
        self.probe.clone()
    }
}
