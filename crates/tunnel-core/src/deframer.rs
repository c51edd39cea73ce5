use crate::framer::{ESC, FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitTag,
    AwaitTagEsc,
    InFrame,
    InFrameEsc,
}

/// Result of feeding one byte to the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum DeframerOutcome<'a> {
    /// No frame completed yet.
    Continue,
    /// A frame closed; `order` is its tag and `payload` its body.
    Frame { order: u8, payload: &'a [u8] },
    /// The in-progress frame exceeded the configured payload limit. The
    /// decoder resets to `Idle`; the caller should treat this as fatal for
    /// the tunnel connection.
    ProtocolError,
}

/// The dual of [`crate::framer::Framer`]: consumes a byte stream produced by
/// it and yields `(tag, payload)` events.
pub struct Deframer {
    state: State,
    order: Option<u8>,
    payload: Vec<u8>,
    max_payload: usize,
}

impl Deframer {
    pub fn new(max_payload: usize) -> Self {
        Self { state: State::Idle, order: None, payload: Vec::new(), max_payload }
    }

    pub fn feed(&mut self, byte: u8) -> DeframerOutcome<'_> {
        match self.state {
            State::Idle => {
                if byte == FLAG {
                    self.state = State::AwaitTag;
                }
                DeframerOutcome::Continue
            }
            State::AwaitTag => match byte {
                ESC => {
                    self.state = State::AwaitTagEsc;
                    DeframerOutcome::Continue
                }
                FLAG => DeframerOutcome::Continue,
                b => {
                    self.order = Some(b);
                    self.payload.clear();
                    self.state = State::InFrame;
                    DeframerOutcome::Continue
                }
            },
            State::AwaitTagEsc => {
                self.order = Some(byte);
                self.payload.clear();
                self.state = State::InFrame;
                DeframerOutcome::Continue
            }
            State::InFrame => match byte {
                ESC => {
                    self.state = State::InFrameEsc;
                    DeframerOutcome::Continue
                }
                FLAG => {
                    self.state = State::Idle;
                    let order = self.order.take().expect("InFrame implies order is set");
                    DeframerOutcome::Frame { order, payload: &self.payload }
                }
                b => self.push_payload_byte(b),
            },
            State::InFrameEsc => {
                self.state = State::InFrame;
                self.push_payload_byte(byte)
            }
        }
    }

    fn push_payload_byte(&mut self, b: u8) -> DeframerOutcome<'_> {
        if self.payload.len() >= self.max_payload {
            self.state = State::Idle;
            self.order = None;
            return DeframerOutcome::ProtocolError;
        }
        self.payload.push(b);
        DeframerOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(d: &mut Deframer, bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        for &b in bytes {
            if let DeframerOutcome::Frame { order, payload } = d.feed(b) {
                frames.push((order, payload.to_vec()));
            }
        }
        frames
    }

    #[test]
    fn decodes_simple_frame() {
        let mut d = Deframer::new(64);
        let frames = feed_all(&mut d, &[0x7E, 0x00, b'h', b'i', 0x7E]);
        assert_eq!(frames, vec![(0, b"hi".to_vec())]);
    }

    #[test]
    fn decodes_escaped_payload_byte() {
        let mut d = Deframer::new(64);
        let frames = feed_all(&mut d, &[0x7E, 0x00, 0x7D, 0x7E, 0x7E]);
        assert_eq!(frames, vec![(0, vec![0x7E])]);
    }

    #[test]
    fn doubled_flag_in_await_tag_resyncs_without_opening_frame() {
        let mut d = Deframer::new(64);
        let frames = feed_all(&mut d, &[0x7E, 0x7E, 0x01, b'z', 0x7E]);
        assert_eq!(frames, vec![(1, b"z".to_vec())]);
    }

    #[test]
    fn escaped_tag_is_decoded() {
        let mut d = Deframer::new(64);
        let frames = feed_all(&mut d, &[0x7E, 0x7D, 0x7E, b'x', 0x7E]);
        assert_eq!(frames, vec![(0x7E, b"x".to_vec())]);
    }

    #[test]
    fn oversize_frame_reports_protocol_error() {
        let mut d = Deframer::new(2);
        assert_eq!(d.feed(0x7E), DeframerOutcome::Continue);
        assert_eq!(d.feed(0x00), DeframerOutcome::Continue);
        assert_eq!(d.feed(b'a'), DeframerOutcome::Continue);
        assert_eq!(d.feed(b'b'), DeframerOutcome::Continue);
        assert_eq!(d.feed(b'c'), DeframerOutcome::ProtocolError);
    }

    #[test]
    fn encode_then_decode_roundtrip_preserves_per_tag_order() {
        use crate::framer::Framer;

        let mut f = Framer::new(256);
        f.encapsulate(b"one", 0);
        f.encapsulate(b"two", 1);
        f.encapsulate(b"three", 0);
        f.finish();

        let mut wire = Vec::new();
        f.send(&mut wire).unwrap();

        let mut d = Deframer::new(256);
        let frames = feed_all(&mut d, &wire);

        let tag0: Vec<u8> = frames.iter().filter(|(t, _)| *t == 0).flat_map(|(_, p)| p.clone()).collect();
        let tag1: Vec<u8> = frames.iter().filter(|(t, _)| *t == 1).flat_map(|(_, p)| p.clone()).collect();
        assert_eq!(tag0, b"onethree");
        assert_eq!(tag1, b"two");
    }
}
