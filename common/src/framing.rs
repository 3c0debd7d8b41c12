//! Point-to-point link fragmentation (spec §4.3, §6): shared by the node's
//! notify path and the host's reassembly path so both sides of the 20-byte
//! `'+'`-prefix scheme stay in lockstep without duplicating the logic.

/// The transport's effective notification payload bound.
pub const MTU: usize = 20;
/// Bytes of payload a continuation fragment carries (one byte spent on the
/// `'+'` prefix).
const CONTINUATION_PAYLOAD: usize = MTU - 1;

/// Split `message` into notification frames: messages ≤ 20 bytes go out as a
/// single frame; longer messages are split so every fragment but the last is
/// exactly 20 bytes, `'+'`-prefixed, carrying 19 bytes of payload, and the
/// final fragment is unprefixed and ≤ 20 bytes.
pub fn fragment(message: &[u8]) -> Vec<Vec<u8>> {
    if message.len() <= MTU {
        return vec![message.to_vec()];
    }

    let mut frames = Vec::new();
    let mut rest = message;
    while rest.len() > CONTINUATION_PAYLOAD {
        let (chunk, remainder) = rest.split_at(CONTINUATION_PAYLOAD);
        let mut frame = Vec::with_capacity(MTU);
        frame.push(b'+');
        frame.extend_from_slice(chunk);
        frames.push(frame);
        rest = remainder;
    }
    frames.push(rest.to_vec());
    frames
}

/// Accumulates `'+'`-prefixed fragments and commits on the first unprefixed
/// one, on whichever side of the link is receiving.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed one received frame. Returns `Some(message)` once a terminal
    /// (unprefixed) fragment completes a message.
    pub fn push(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        match frame.split_first() {
            Some((b'+', rest)) => {
                self.buf.extend_from_slice(rest);
                None
            }
            _ => {
                self.buf.extend_from_slice(frame);
                Some(std::mem::take(&mut self.buf))
            }
        }
    }
}
