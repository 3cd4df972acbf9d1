//! The MLLP framing codec.
//!
//! MLLP wraps each transmission in a single-byte header (`0x0B`) and a
//! two byte footer (`0x1C` then `0x0D`). This codec reassembles framed
//! units from a byte stream and frames outbound acknowledgments, and can
//! be driven either standalone ([`MllpCodec::receive`]) or through a
//! [Tokio Framed](https://docs.rs/tokio-util/latest/tokio_util/codec/struct.Framed.html)
//! transport via the [`Decoder`]/[`Encoder`] impls.
//!
//! Each connection gets its own codec instance: the partial-frame buffer
//! is per-connection state and must never be shared.

use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

/// Text encodings supported for the wire payload.
///
/// HL7 v2 payloads are single-byte-oriented; UTF-8 is the default and
/// Latin-1 covers the 8-bit legacy feeds still in the wild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding::Utf8
    }
}

impl TextEncoding {
    pub(crate) fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    pub(crate) fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// Marker trait for the byte streams a connection can run over
/// (plain TCP or a TLS stream).
pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A stateful MLLP reassembler bound to one connection's byte stream.
pub struct MllpCodec {
    buffer: BytesMut,
    last_message: Option<String>,
    encoding: TextEncoding,
}

impl Default for MllpCodec {
    fn default() -> Self {
        MllpCodec::new()
    }
}

impl MllpCodec {
    /// Vertical-Tab char, the marker for the start of a message.
    pub const BLOCK_HEADER: u8 = 0x0B;
    /// File-Separator char, the marker for the end of a message.
    pub const BLOCK_END: u8 = 0x1C;
    /// Carriage return, the frame footer byte.
    pub const BLOCK_FOOTER: u8 = 0x0D;

    /// A codec using the default UTF-8 encoding.
    pub fn new() -> Self {
        MllpCodec::with_encoding(TextEncoding::default())
    }

    /// A codec decoding and encoding payloads with `encoding`.
    pub fn with_encoding(encoding: TextEncoding) -> Self {
        MllpCodec {
            buffer: BytesMut::new(),
            last_message: None,
            encoding,
        }
    }

    /// Accepts a byte slice for processing.
    /// Returns whether a completed unit is waiting (via [`MllpCodec::last_message`]).
    ///
    /// A frame is considered complete once both the end marker (`0x1C`)
    /// and footer (`0x0D`) have appeared *anywhere* in the accumulated
    /// buffer. That is deliberately looser than a single-frame boundary
    /// check: several back-to-back frames are extracted together as one
    /// joined unit, and stray marker bytes are not guarded against.
    pub fn receive(&mut self, bytes: &[u8]) -> bool {
        self.buffer.reserve(bytes.len());
        self.buffer.put_slice(bytes);

        if self.buffer.contains(&MllpCodec::BLOCK_END)
            && self.buffer.contains(&MllpCodec::BLOCK_FOOTER)
        {
            self.process_message();
            return true;
        }

        trace!("MLLP: no complete frame yet, holding {} bytes", self.buffer.len());
        false
    }

    /// The most recently extracted unit. Reading does not clear it.
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    // Decode the whole buffer, split on the end-marker/carriage-return
    // footer sequence, drop empty fragments, strip residual control
    // bytes and rejoin the survivors with a carriage return.
    fn process_message(&mut self) {
        let text = self.encoding.decode(&self.buffer);
        let mut fragments: Vec<String> = Vec::new();

        for part in text.split("\x1c\r") {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            fragments.push(trimmed.replace('\x0b', "").replace('\x1c', ""));
        }

        trace!("MLLP: extracted {} fragment(s) from frame", fragments.len());
        self.last_message = Some(fragments.join("\r"));
        self.buffer.clear();
    }
}

// Decoding an MLLP frame from a Framed transport. The read buffer is
// drained into the codec's own accumulator on every call so partial
// frames survive between reads.
impl Decoder for MllpCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let bytes = src.split_to(src.len());
        if self.receive(&bytes) {
            Ok(self.last_message.clone())
        } else {
            Ok(None)
        }
    }
}

// Framing outbound data as header + encoded payload + end marker + footer.
// Used for the ACK/NACK messages written back by the listener.
impl Encoder<String> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(item.as_str(), dst)
    }
}

impl<'a> Encoder<&'a str> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.encoding.encode(item);

        dst.reserve(payload.len() + 3);
        dst.put_u8(MllpCodec::BLOCK_HEADER);
        dst.put_slice(&payload);
        dst.put_u8(MllpCodec::BLOCK_END);
        dst.put_u8(MllpCodec::BLOCK_FOOTER);

        debug!("MLLP: encoded {} payload bytes for send", payload.len());
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;

    fn wrap_for_mllp(s: &str) -> Vec<u8> {
        format!("\x0B{}\x1C\x0D", s).into_bytes()
    }

    #[test]
    fn can_construct_without_error() {
        let m = MllpCodec::new();
        assert!(m.last_message().is_none());
    }

    #[test]
    fn wraps_simple_data() {
        let mut m = MllpCodec::new();
        let mut output_buf = BytesMut::with_capacity(64);

        m.encode("abcd", &mut output_buf).unwrap();

        assert_eq!(&output_buf[..], &wrap_for_mllp("abcd")[..]);
    }

    #[test]
    fn partial_frame_accumulates_across_calls() {
        let mut m = MllpCodec::new();

        assert!(!m.receive(b"\x0BTest"));
        assert!(m.last_message().is_none());

        assert!(m.receive(b" Data\x1C\x0D"));
        assert_eq!(m.last_message(), Some("Test Data"));
    }

    #[test]
    fn whole_frame_in_one_call() {
        let mut m = MllpCodec::new();

        assert!(m.receive(&wrap_for_mllp("Test Data")));
        assert_eq!(m.last_message(), Some("Test Data"));
    }

    #[test]
    fn split_point_does_not_change_the_unit() {
        let framed = wrap_for_mllp("MSH|^~\\&|A|||||||ADT^A01|1|P|2.5");

        let mut whole = MllpCodec::new();
        whole.receive(&framed);

        for split in 1..framed.len() - 1 {
            let mut codec = MllpCodec::new();
            codec.receive(&framed[..split]);
            codec.receive(&framed[split..]);
            assert_eq!(codec.last_message(), whole.last_message());
        }
    }

    #[test]
    fn back_to_back_frames_join_with_carriage_return() {
        let mut m = MllpCodec::new();

        assert!(m.receive(b"\x0Bone\x1C\x0D\x0Btwo\x1C\x0D"));
        assert_eq!(m.last_message(), Some("one\rtwo"));
    }

    #[test]
    fn empty_fragments_are_dropped() {
        let mut m = MllpCodec::new();

        assert!(m.receive(b"\x0B\x1C\x0D\x0Bdata\x1C\x0D\x1C\x0D"));
        assert_eq!(m.last_message(), Some("data"));
    }

    #[test]
    fn residual_control_bytes_are_stripped() {
        let mut m = MllpCodec::new();

        assert!(m.receive(b"\x0Bab\x0Bcd\x1C\x0D"));
        assert_eq!(m.last_message(), Some("abcd"));
    }

    #[test]
    fn last_message_read_is_idempotent() {
        let mut m = MllpCodec::new();
        m.receive(&wrap_for_mllp("abcd"));

        assert_eq!(m.last_message(), Some("abcd"));
        assert_eq!(m.last_message(), Some("abcd"));
    }

    #[test]
    fn buffer_is_reset_per_frame() {
        let mut m = MllpCodec::new();

        assert!(m.receive(&wrap_for_mllp("Test Data")));
        assert_eq!(m.last_message(), Some("Test Data"));

        assert!(m.receive(&wrap_for_mllp("This is different")));
        assert_eq!(m.last_message(), Some("This is different"));
    }

    #[test]
    fn encode_then_receive_round_trips() {
        let payload = "MSH|^~\\&|ZIS|1^AHospital|||200405141144||ADT^A01|20041104082400|P|2.3";

        let mut m = MllpCodec::new();
        let mut framed = BytesMut::new();
        m.encode(payload, &mut framed).unwrap();

        let mut receiver = MllpCodec::new();
        assert!(receiver.receive(&framed));
        assert_eq!(receiver.last_message(), Some(payload));
    }

    #[test]
    fn latin1_round_trip() {
        let mut sender = MllpCodec::with_encoding(TextEncoding::Latin1);
        let mut framed = BytesMut::new();
        sender.encode("caf\u{e9}", &mut framed).unwrap();

        // one byte per char on the wire
        assert_eq!(framed.len(), 4 + 3);

        let mut receiver = MllpCodec::with_encoding(TextEncoding::Latin1);
        assert!(receiver.receive(&framed));
        assert_eq!(receiver.last_message(), Some("caf\u{e9}"));
    }

    #[test]
    fn decoder_drains_the_read_buffer() {
        // tokio gets unhappy if a decoder leaves bytes unconsumed on close
        let mut m = MllpCodec::new();
        let mut data = BytesMut::from(&b"\x0BTest Data\x1C\x0D"[..]);

        let result = m.decode(&mut data).unwrap();

        assert_eq!(result.as_deref(), Some("Test Data"));
        assert_eq!(data.len(), 0, "decoder left data sitting in the buffer");
    }

    #[test]
    fn decoder_returns_none_until_frame_completes() {
        let mut m = MllpCodec::new();

        let mut call1 = BytesMut::from(&b"\x0BTest"[..]);
        assert!(m.decode(&mut call1).unwrap().is_none());

        let mut call2 = BytesMut::from(&b" Data\x1C\x0D"[..]);
        assert_eq!(m.decode(&mut call2).unwrap().as_deref(), Some("Test Data"));
    }

    #[test]
    fn test_real_message() {
        let mut m = MllpCodec::new();
        let data = wrap_for_mllp("MSH|^~\\&|ZIS|1^AHospital|||200405141144||ADT^A01|20041104082400|P|2.3|||AL|NE|||8859/15\rEVN|A01|20041104082400.0000+0100|20041104082400\rPID||\"\"|10||Vries^Danny^D.^^de||19951202|M");

        assert!(m.receive(&data));
        let msg = m.last_message().unwrap();
        assert!(msg.starts_with("MSH|"));
        assert!(msg.contains("\rEVN|"));
        assert!(msg.contains("\rPID|"));
    }
}
