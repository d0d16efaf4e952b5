//! C3 — framer: turns partial TCP reads into whole records (spec.md §4.2),
//! and the inner frag_index/frag_total/record_len structure each decrypted
//! frame body carries.
use crate::error::FramerError;

/// Ten-byte sentinel the stream framer resynchronises on (spec.md §3).
pub const HEADER_PATTERN: [u8; 10] = [0x00, 0x00, 0x1B, 0x00, 0x05, 0x13, 0x5D, 0xFF, 0xFF, 0xFF];
/// Read-buffer size for a single `socket.read()` call (spec.md §6).
pub const MAX_FRAME: usize = 1400;

const HANDSHAKE_HEADER_LEN: usize = 6; // frag_index:u16 + frag_total:u16 + record_len:u16
const SEALED_HEADER_LEN: usize = 2; // enc_len:u16

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Pre-handshake: records travel unencrypted.
    Handshake,
    /// Post-handshake: records travel as AES-GCM-sealed blobs.
    Sealed,
}

/// Build the inner plaintext structure carried inside (or, during the
/// handshake, standing in place of) an AES-GCM record:
/// `frag_index:u16 | frag_total:u16 | record_len:u16 | encoded_record_bytes`.
pub fn build_inner(frag_index: u16, frag_total: u16, record_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + record_bytes.len());
    out.extend_from_slice(&frag_index.to_be_bytes());
    out.extend_from_slice(&frag_total.to_be_bytes());
    out.extend_from_slice(&(record_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(record_bytes);
    out
}

/// Parse the inner structure built by [`build_inner`].
pub fn parse_inner(bytes: &[u8]) -> Result<(u16, u16, &[u8]), FramerError> {
    if bytes.len() < HANDSHAKE_HEADER_LEN {
        return Err(FramerError::InnerTruncated { need: HANDSHAKE_HEADER_LEN, have: bytes.len() });
    }
    let frag_index = u16::from_be_bytes([bytes[0], bytes[1]]);
    let frag_total = u16::from_be_bytes([bytes[2], bytes[3]]);
    let record_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    let need = HANDSHAKE_HEADER_LEN + record_len;
    if bytes.len() < need {
        return Err(FramerError::InnerTruncated { need, have: bytes.len() });
    }
    Ok((frag_index, frag_total, &bytes[HANDSHAKE_HEADER_LEN..need]))
}

/// Frame a handshake-phase inner structure: `HEADER_PATTERN ++ inner`.
pub fn encode_handshake_frame(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_PATTERN.len() + inner.len());
    out.extend_from_slice(&HEADER_PATTERN);
    out.extend_from_slice(inner);
    out
}

/// Frame a sealed (post-handshake) blob: `HEADER_PATTERN ++ enc_len:u16 ++ blob`.
pub fn encode_sealed_frame(sealed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_PATTERN.len() + 2 + sealed.len());
    out.extend_from_slice(&HEADER_PATTERN);
    out.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    out.extend_from_slice(sealed);
    out
}

/// Reassembles whole frame bodies out of a continuous byte stream (spec.md
/// §4.2). Frame bodies are opaque to the framer: in `Handshake` mode they are
/// the plaintext inner structure; in `Sealed` mode they are `nonce ||
/// ciphertext`, still to be AES-GCM-opened by the caller.
pub struct Framer {
    overflow: Vec<u8>,
    mode: FrameMode,
}

impl Framer {
    pub fn new(mode: FrameMode) -> Self {
        Self { overflow: Vec::new(), mode }
    }

    pub fn set_mode(&mut self, mode: FrameMode) {
        self.mode = mode;
    }

    fn header_len(&self) -> usize {
        match self.mode {
            FrameMode::Handshake => HANDSHAKE_HEADER_LEN,
            FrameMode::Sealed => SEALED_HEADER_LEN,
        }
    }

    /// Length declared by a segment's header, and the offset its body starts at.
    fn declared_len(&self, segment: &[u8]) -> usize {
        match self.mode {
            // frag_index:u16 + frag_total:u16 + record_len:u16 — the body we
            // hand upward is the whole inner structure, header included, so
            // the caller can recover frag_index/frag_total via parse_inner.
            FrameMode::Handshake => {
                u16::from_be_bytes([segment[4], segment[5]]) as usize
            }
            FrameMode::Sealed => u16::from_be_bytes([segment[0], segment[1]]) as usize,
        }
    }

    fn body_offset(&self) -> usize {
        match self.mode {
            FrameMode::Handshake => 0, // body == whole segment (header + payload)
            FrameMode::Sealed => SEALED_HEADER_LEN,
        }
    }

    /// Feed one inbound chunk (one `socket.read()` result). Returns every
    /// whole frame body recovered from `overflow ++ chunk`, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut s = std::mem::take(&mut self.overflow);
        s.extend_from_slice(chunk);

        let segments = split_on_pattern(&s, &HEADER_PATTERN);
        let mut out = Vec::new();

        let mut iter = segments.into_iter();
        // s0: tail of a previously-incomplete frame, or stray bytes before
        // the first sentinel. Re-buffer verbatim (it already lost its sentinel).
        if let Some(s0) = iter.next() {
            self.overflow = s0.to_vec();
        }

        let header_len = self.header_len();
        let body_offset = self.body_offset();
        for segment in iter {
            if segment.len() < header_len {
                self.overflow.extend_from_slice(&HEADER_PATTERN);
                self.overflow.extend_from_slice(segment);
                break;
            }
            let declared = self.declared_len(segment);
            let need = match self.mode {
                FrameMode::Handshake => HANDSHAKE_HEADER_LEN + declared,
                FrameMode::Sealed => SEALED_HEADER_LEN + declared,
            };
            if segment.len() < need {
                self.overflow.extend_from_slice(&HEADER_PATTERN);
                self.overflow.extend_from_slice(segment);
                break;
            }
            out.push(segment[body_offset..need].to_vec());
            if segment.len() > need {
                self.overflow.extend_from_slice(&HEADER_PATTERN);
                self.overflow.extend_from_slice(&segment[need..]);
            }
        }
        out
    }
}

/// Split `haystack` on every non-overlapping occurrence of `pattern`,
/// mirroring the teacher's "split by sentinel" description (spec.md §4.2).
/// The pattern itself is dropped from the output, same as `str::split`.
fn split_on_pattern<'a>(haystack: &'a [u8], pattern: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(rel) = find_subslice(&haystack[start..], pattern) {
        out.push(&haystack[start..start + rel]);
        start += rel + pattern.len();
    }
    out.push(&haystack[start..]);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, MessageKind, MsgRecord};
    use chrono::Utc;

    fn sample_frame() -> Vec<u8> {
        let record = codec::encode_record(&codec::Record::Msg(MsgRecord {
            kind: MessageKind::Message,
            payload: b"hello".to_vec(),
            username: "alice".into(),
            colour: "red".into(),
            timestamp: Utc::now(),
        }));
        let inner = build_inner(1, 1, &record);
        encode_handshake_frame(&inner)
    }

    #[test]
    fn whole_frame_in_one_push() {
        let frame = sample_frame();
        let mut framer = Framer::new(FrameMode::Handshake);
        let bodies = framer.push(&frame);
        assert_eq!(bodies.len(), 1);
        let (idx, total, record_bytes) = parse_inner(&bodies[0]).unwrap();
        assert_eq!((idx, total), (1, 1));
        assert!(matches!(codec::decode_record(record_bytes).unwrap(), codec::Record::Msg(_)));
    }

    #[test]
    fn frame_split_across_two_pushes() {
        let frame = sample_frame();
        let mid = frame.len() / 2;
        let mut framer = Framer::new(FrameMode::Handshake);
        assert!(framer.push(&frame[..mid]).is_empty());
        let bodies = framer.push(&frame[mid..]);
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn frame_split_across_many_small_pushes() {
        let frame = sample_frame();
        let mut framer = Framer::new(FrameMode::Handshake);
        let mut bodies = Vec::new();
        for byte in frame.chunks(1) {
            bodies.extend(framer.push(byte));
        }
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn two_whole_frames_in_one_chunk() {
        let frame = sample_frame();
        let mut combined = frame.clone();
        combined.extend_from_slice(&frame);
        let mut framer = Framer::new(FrameMode::Handshake);
        let bodies = framer.push(&combined);
        assert_eq!(bodies.len(), 2);
    }

    #[test]
    fn second_frame_incomplete_is_buffered() {
        let frame = sample_frame();
        let mut combined = frame.clone();
        combined.extend_from_slice(&frame[..frame.len() - 3]);
        let mut framer = Framer::new(FrameMode::Handshake);
        let bodies = framer.push(&combined);
        assert_eq!(bodies.len(), 1);
        let rest = frame[frame.len() - 3..].to_vec();
        let bodies2 = framer.push(&rest);
        assert_eq!(bodies2.len(), 1);
    }

    #[test]
    fn chunk_entirely_a_tail_buffers_everything() {
        let frame = sample_frame();
        let mut framer = Framer::new(FrameMode::Handshake);
        // No sentinel at all: simulate a read that is pure mid-frame tail bytes.
        let tail = &frame[2..5];
        let bodies = framer.push(tail);
        assert!(bodies.is_empty());
        assert_eq!(framer.overflow, tail);
    }

    #[test]
    fn sealed_mode_roundtrips_nonce_and_ciphertext_blob() {
        let blob = vec![7u8; 40];
        let frame = encode_sealed_frame(&blob);
        let mut framer = Framer::new(FrameMode::Sealed);
        let bodies = framer.push(&frame);
        assert_eq!(bodies, vec![blob]);
    }

    #[test]
    fn zero_length_push_is_a_no_op() {
        let mut framer = Framer::new(FrameMode::Handshake);
        assert!(framer.push(&[]).is_empty());
    }
}
