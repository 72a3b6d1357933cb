//! Single-slot mailbox living inside a shared segment.
//!
//! Byte 0 is the unread flag; the message text follows, NUL-terminated. One
//! side writes and the other reads, so the flag is the whole protocol.

use crate::config::MSG_CHANNEL_SIZE;

pub struct MsgChannel<'a> {
    buf: &'a mut [u8],
}

impl<'a> MsgChannel<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        debug_assert!(buf.len() >= 2);
        Self { buf }
    }

    /// Largest message text this channel accepts.
    pub fn capacity(&self) -> usize {
        self.buf.len().saturating_sub(2)
    }

    pub fn has_msg(&self) -> bool {
        self.buf[0] != 0
    }

    /// Store `msg` if the slot is empty and it fits; otherwise leave the
    /// buffer untouched and return false.
    pub fn send_msg(&mut self, msg: &str) -> bool {
        if self.has_msg() {
            return false;
        }
        let bytes = msg.as_bytes();
        if bytes.len() > self.capacity() || bytes.contains(&0) {
            return false;
        }
        self.buf[1..1 + bytes.len()].copy_from_slice(bytes);
        self.buf[1 + bytes.len()] = 0;
        self.buf[0] = 1;
        true
    }

    /// Take the unread message, if any, and mark the slot empty.
    pub fn get_msg(&mut self) -> Option<String> {
        if !self.has_msg() {
            return None;
        }
        let body = &self.buf[1..];
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        let msg = String::from_utf8_lossy(&body[..end]).into_owned();
        self.buf[0] = 0;
        Some(msg)
    }

    /// Overwrite whatever is there. Used by a writer that owns the direction
    /// and wants the reader to see only the latest value.
    pub fn force_msg(&mut self, msg: &str) -> bool {
        self.buf[0] = 0;
        self.send_msg(msg)
    }
}

/// The eight channels of a worker segment, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    ProcessControlRequest,
    ProcessControlReply,
    GraphicsRequest,
    GraphicsReply,
    Heartbeat,
    AppStatus,
    TrickleUp,
    TrickleDown,
}

impl ChannelId {
    pub const ALL: [ChannelId; 8] = [
        ChannelId::ProcessControlRequest,
        ChannelId::ProcessControlReply,
        ChannelId::GraphicsRequest,
        ChannelId::GraphicsReply,
        ChannelId::Heartbeat,
        ChannelId::AppStatus,
        ChannelId::TrickleUp,
        ChannelId::TrickleDown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn range(self) -> std::ops::Range<usize> {
        let start = self.index() * MSG_CHANNEL_SIZE;
        start..start + MSG_CHANNEL_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> Vec<u8> {
        vec![0u8; MSG_CHANNEL_SIZE]
    }

    #[test]
    fn send_then_get_returns_original_text() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        assert!(channel.send_msg("<suspend/>"));
        assert_eq!(channel.get_msg().as_deref(), Some("<suspend/>"));
        assert!(!channel.has_msg());
    }

    #[test]
    fn second_send_is_rejected_without_touching_buffer() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        assert!(channel.send_msg("<quit/>"));
        assert!(!channel.send_msg("<abort/>"));
        assert_eq!(channel.get_msg().as_deref(), Some("<quit/>"));
    }

    #[test]
    fn get_on_empty_channel_returns_none() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        assert_eq!(channel.get_msg(), None);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        let too_long = "x".repeat(MSG_CHANNEL_SIZE - 1);
        assert!(!channel.send_msg(&too_long));
        assert!(!channel.has_msg());

        let just_fits = "x".repeat(MSG_CHANNEL_SIZE - 2);
        assert!(channel.send_msg(&just_fits));
        assert_eq!(channel.get_msg().map(|m| m.len()), Some(MSG_CHANNEL_SIZE - 2));
    }

    #[test]
    fn shorter_message_does_not_leak_previous_tail() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        assert!(channel.send_msg("<fraction_done>0.5</fraction_done>"));
        channel.get_msg();
        assert!(channel.send_msg("<quit/>"));
        assert_eq!(channel.get_msg().as_deref(), Some("<quit/>"));
    }

    #[test]
    fn force_msg_replaces_unread() {
        let mut buf = buffer();
        let mut channel = MsgChannel::new(&mut buf);
        channel.send_msg("old");
        assert!(channel.force_msg("new"));
        assert_eq!(channel.get_msg().as_deref(), Some("new"));
    }

    #[test]
    fn channel_ranges_do_not_overlap() {
        let ranges: Vec<_> = ChannelId::ALL.iter().map(|c| c.range()).collect();
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(ranges.last().map(|r| r.end), Some(crate::config::SHARED_SEGMENT_SIZE));
    }
}
