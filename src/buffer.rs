//! Outbound buffer for payloads accepted while no connection is open.

use std::collections::VecDeque;

use crate::types::Message;

/// FIFO queue of pending payloads.
///
/// Insertion order is preserved through flush attempts: a flush removes
/// entries one at a time from the front, so a mid-flush failure leaves
/// exactly the unsent suffix queued for the next attempt.
#[derive(Debug, Default)]
pub(crate) struct OutboundBuffer {
    entries: VecDeque<Message>,
}

impl OutboundBuffer {
    pub(crate) fn push(&mut self, message: Message) {
        self.entries.push_back(message);
    }

    /// Next entry to deliver, without removing it.
    pub(crate) fn front(&self) -> Option<Message> {
        self.entries.front().cloned()
    }

    /// Remove the front entry after a confirmed send.
    pub(crate) fn pop_front(&mut self) {
        self.entries.pop_front();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total queued bytes, counted into the handle's buffered amount.
    pub(crate) fn byte_len(&self) -> u64 {
        self.entries.iter().map(|m| m.len() as u64).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut buffer = OutboundBuffer::default();
        buffer.push(Message::from("a"));
        buffer.push(Message::from("b"));
        buffer.push(Message::from("c"));

        assert_eq!(buffer.front(), Some(Message::from("a")));
        buffer.pop_front();
        assert_eq!(buffer.front(), Some(Message::from("b")));
        buffer.pop_front();
        assert_eq!(buffer.front(), Some(Message::from("c")));
    }

    #[test]
    fn partial_drain_keeps_suffix() {
        let mut buffer = OutboundBuffer::default();
        for payload in ["one", "two", "three", "four"] {
            buffer.push(Message::from(payload));
        }

        // Two confirmed sends, then a failure: the suffix stays queued.
        buffer.pop_front();
        buffer.pop_front();

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.front(), Some(Message::from("three")));
    }

    #[test]
    fn byte_len_counts_text_and_binary() {
        let mut buffer = OutboundBuffer::default();
        buffer.push(Message::from("abc"));
        buffer.push(Message::from(vec![1_u8, 2, 3, 4]));

        assert_eq!(buffer.byte_len(), 7);
        buffer.clear();
        assert_eq!(buffer.byte_len(), 0);
        assert!(buffer.is_empty());
    }
}
