use crate::core::channel::ChannelId;
use crate::core::shared_mem::SharedSegment;
use std::collections::VecDeque;

/// Outbound messages for one channel of one task.
///
/// The channel holds a single unread message, so anything that can't go out
/// right away waits here and is retried by `poll` on every pass.
#[derive(Debug)]
pub struct DeferredQueue {
    channel: ChannelId,
    pending: VecDeque<String>,
    // 0.0 while the queue is empty
    blocked_since: f64,
}

impl DeferredQueue {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            pending: VecDeque::new(),
            blocked_since: 0.0,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    /// Send now if nothing is queued ahead and the channel is free;
    /// otherwise append. Returns true if the message went out immediately.
    pub fn enqueue_and_try_send(
        &mut self,
        msg: &str,
        segment: Option<&mut dyn SharedSegment>,
        now: f64,
    ) -> bool {
        if self.pending.is_empty() {
            if let Some(segment) = segment {
                if segment.send(self.channel, msg) {
                    return true;
                }
            }
            self.blocked_since = now;
        }
        self.pending.push_back(msg.to_string());
        false
    }

    /// Try to push the head message through. Returns true if one was sent.
    pub fn poll(&mut self, segment: &mut dyn SharedSegment, now: f64) -> bool {
        let Some(head) = self.pending.front() else {
            return false;
        };
        if !segment.send(self.channel, head) {
            return false;
        }
        self.pending.pop_front();
        self.blocked_since = if self.pending.is_empty() { 0.0 } else { now };
        true
    }

    /// Drop the newest queued message if it is exactly `msg`.
    pub fn purge_if_tail_equals(&mut self, msg: &str) -> bool {
        if self.pending.back().map(String::as_str) != Some(msg) {
            return false;
        }
        self.pending.pop_back();
        if self.pending.is_empty() {
            self.blocked_since = 0.0;
        }
        true
    }

    /// True once the head message has been waiting longer than `threshold` seconds.
    pub fn is_stuck(&self, now: f64, threshold: f64) -> bool {
        self.blocked_since != 0.0 && now - self.blocked_since > threshold
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.blocked_since = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared_mem::HeapSegment;
    use crate::config::SHARED_SEGMENT_SIZE;

    fn segment() -> HeapSegment {
        HeapSegment::new("q", SHARED_SEGMENT_SIZE)
    }

    #[test]
    fn sends_immediately_when_idle() {
        let mut seg = segment();
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        assert!(queue.enqueue_and_try_send("<suspend/>", Some(&mut seg), 10.0));
        assert!(queue.is_empty());
        assert!(!queue.is_stuck(1000.0, 180.0));
        assert_eq!(seg.recv(ChannelId::ProcessControlRequest).as_deref(), Some("<suspend/>"));
    }

    #[test]
    fn queues_while_channel_full_and_drains_in_order() {
        let mut seg = segment();
        let mut worker = seg.clone();
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        assert!(queue.enqueue_and_try_send("<suspend/>", Some(&mut seg), 10.0));
        assert!(!queue.enqueue_and_try_send("<resume/>", Some(&mut seg), 11.0));
        assert!(!queue.enqueue_and_try_send("<quit/>", Some(&mut seg), 12.0));
        assert_eq!(queue.len(), 2);

        assert!(!queue.poll(&mut seg, 13.0));
        assert_eq!(worker.recv(ChannelId::ProcessControlRequest).as_deref(), Some("<suspend/>"));
        assert!(queue.poll(&mut seg, 14.0));
        assert_eq!(worker.recv(ChannelId::ProcessControlRequest).as_deref(), Some("<resume/>"));
        assert!(queue.poll(&mut seg, 15.0));
        assert_eq!(worker.recv(ChannelId::ProcessControlRequest).as_deref(), Some("<quit/>"));
        assert!(queue.is_empty());
        assert!(!queue.is_stuck(10_000.0, 180.0));
    }

    #[test]
    fn purge_before_poll_means_nothing_is_delivered() {
        let mut seg = segment();
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        // no segment yet: the message has to wait
        assert!(!queue.enqueue_and_try_send("<suspend/>", None, 10.0));
        assert!(queue.purge_if_tail_equals("<suspend/>"));
        assert!(queue.is_empty());
        assert!(!queue.poll(&mut seg, 11.0));
        assert!(!seg.has_msg(ChannelId::ProcessControlRequest));
    }

    #[test]
    fn purge_only_matches_tail() {
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        queue.enqueue_and_try_send("<suspend/>", None, 1.0);
        queue.enqueue_and_try_send("<resume/>", None, 2.0);
        assert!(!queue.purge_if_tail_equals("<suspend/>"));
        assert!(queue.purge_if_tail_equals("<resume/>"));
        assert_eq!(queue.pending().collect::<Vec<_>>(), vec!["<suspend/>"]);
    }

    #[test]
    fn send_restarts_clock_for_next_head() {
        let mut seg = segment();
        let mut worker = seg.clone();
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        assert!(queue.enqueue_and_try_send("<suspend/>", Some(&mut seg), 0.0));
        queue.enqueue_and_try_send("<resume/>", Some(&mut seg), 1.0);
        queue.enqueue_and_try_send("<quit/>", Some(&mut seg), 2.0);

        worker.recv(ChannelId::ProcessControlRequest);
        assert!(queue.poll(&mut seg, 100.0));
        // <quit/> has been waiting since the send at 100, not since 1
        assert!(!queue.is_stuck(250.0, 180.0));
        assert!(queue.is_stuck(281.0, 180.0));
    }

    #[test]
    fn stuck_after_threshold() {
        let mut queue = DeferredQueue::new(ChannelId::ProcessControlRequest);
        queue.enqueue_and_try_send("<suspend/>", None, 100.0);
        queue.enqueue_and_try_send("<resume/>", None, 150.0);
        assert!(!queue.is_stuck(280.0, 180.0));
        assert!(queue.is_stuck(280.5, 180.0));
    }
}
