//! Single-slot fragment accumulator.
//!
//! At most one fragmented message can be in flight per connection;
//! control frames interleave freely and never pass through here.

use crate::frame::MessageKind;
use crate::traits::handler::Message;

pub(crate) const INTERLEAVED_FRAGMENT: &str =
    "Endpoint tried to start a fragment without finishing another";
pub(crate) const STRAY_CONTINUATION: &str =
    "Endpoint sent a continuation frame without starting a fragment";
pub(crate) const INVALID_TEXT: &str = "Invalid UTF-8 in text message";

/// A protocol violation the session answers with a local close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Violation {
    pub code: u16,
    pub reason: &'static str,
}

#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    slot: Option<(MessageKind, Vec<u8>)>,
}

impl Reassembler {
    /// First piece of a fragmented message.
    pub(crate) fn fragment(&mut self, kind: MessageKind, part: Vec<u8>) -> Result<(), Violation> {
        if self.slot.is_some() {
            return Err(Violation {
                code: 1002,
                reason: INTERLEAVED_FRAGMENT,
            });
        }
        self.slot = Some((kind, part));
        Ok(())
    }

    /// Middle piece; appended to the open slot.
    pub(crate) fn continuation(&mut self, part: Vec<u8>) -> Result<(), Violation> {
        match &mut self.slot {
            Some((_, accumulated)) => {
                accumulated.extend_from_slice(&part);
                Ok(())
            }
            None => Err(Violation {
                code: 1002,
                reason: STRAY_CONTINUATION,
            }),
        }
    }

    /// Terminal piece; empties the slot and yields the whole message.
    pub(crate) fn finish(&mut self, part: Vec<u8>) -> Result<Message, Violation> {
        let Some((kind, mut accumulated)) = self.slot.take() else {
            return Err(Violation {
                code: 1002,
                reason: STRAY_CONTINUATION,
            });
        };
        accumulated.extend_from_slice(&part);
        assemble(kind, accumulated)
    }

    /// Drop any half-built message, e.g. before a reconnect.
    pub(crate) fn reset(&mut self) {
        self.slot = None;
    }
}

/// Convert accumulated bytes into a message, enforcing UTF-8 on text.
pub(crate) fn assemble(kind: MessageKind, bytes: Vec<u8>) -> Result<Message, Violation> {
    match kind {
        MessageKind::Binary => Ok(Message::Binary(bytes)),
        MessageKind::Text => match String::from_utf8(bytes) {
            Ok(text) => Ok(Message::Text(text)),
            Err(_) => Err(Violation {
                code: 1007,
                reason: INVALID_TEXT,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_fragments_in_order() {
        let mut reassembler = Reassembler::default();
        reassembler
            .fragment(MessageKind::Binary, vec![1, 2])
            .unwrap();
        reassembler.continuation(vec![3]).unwrap();
        let message = reassembler.finish(vec![4]).unwrap();
        assert_eq!(message, Message::Binary(vec![1, 2, 3, 4]));
    }

    #[test]
    fn carries_the_kind_from_the_first_fragment() {
        let mut reassembler = Reassembler::default();
        reassembler
            .fragment(MessageKind::Text, b"he".to_vec())
            .unwrap();
        reassembler.continuation(b"ll".to_vec()).unwrap();
        let message = reassembler.finish(b"o".to_vec()).unwrap();
        assert_eq!(message, Message::Text("hello".to_string()));
    }

    #[test]
    fn slot_is_reusable_after_finish() {
        let mut reassembler = Reassembler::default();
        reassembler.fragment(MessageKind::Binary, vec![1]).unwrap();
        reassembler.finish(vec![2]).unwrap();
        assert!(reassembler.fragment(MessageKind::Text, vec![]).is_ok());
    }

    #[test]
    fn a_second_fragment_while_one_is_open_is_a_1002() {
        let mut reassembler = Reassembler::default();
        reassembler.fragment(MessageKind::Binary, vec![1]).unwrap();
        let violation = reassembler
            .fragment(MessageKind::Binary, vec![2])
            .unwrap_err();
        assert_eq!(violation.code, 1002);
        assert_eq!(violation.reason, INTERLEAVED_FRAGMENT);
    }

    #[test]
    fn a_continuation_without_a_fragment_is_a_1002() {
        let mut reassembler = Reassembler::default();
        let violation = reassembler.continuation(vec![1]).unwrap_err();
        assert_eq!(violation.code, 1002);
        assert_eq!(violation.reason, STRAY_CONTINUATION);
    }

    #[test]
    fn a_finish_without_a_fragment_is_a_1002() {
        let mut reassembler = Reassembler::default();
        let violation = reassembler.finish(vec![1]).unwrap_err();
        assert_eq!(violation.code, 1002);
        assert_eq!(violation.reason, STRAY_CONTINUATION);
    }

    #[test]
    fn text_reassembled_to_invalid_utf8_is_a_1007() {
        let mut reassembler = Reassembler::default();
        // 0xE2 0x82 0xAC is €; truncating it splits the codepoint
        reassembler
            .fragment(MessageKind::Text, vec![0xE2, 0x82])
            .unwrap();
        let violation = reassembler.finish(vec![]).unwrap_err();
        assert_eq!(violation.code, 1007);
    }

    #[test]
    fn reset_clears_a_half_built_message() {
        let mut reassembler = Reassembler::default();
        reassembler.fragment(MessageKind::Binary, vec![1]).unwrap();
        reassembler.reset();
        assert!(reassembler.finish(vec![2]).is_err());
    }
}
