//! Flow-control accounting for ACKMSG / ACKRPY.
//!
//! The sender tracks body bytes in flight per message and stops framing a
//! message once a full window is outstanding; the receiver acknowledges
//! cumulative body bytes at a fixed cadence while more frames are expected.
//! Both sides count post-compression wire bytes, so the numbers agree.

/// Unacked body bytes a sender may have outstanding per message.
pub const DEFAULT_SEND_WINDOW: u64 = 128 * 1024;

/// Body bytes between acknowledgments on the receive side.
pub const DEFAULT_ACK_INTERVAL: u64 = 32 * 1024;

/// Sender-side window over one outgoing message.
#[derive(Debug)]
pub struct SendWindow {
    sent: u64,
    acked: u64,
    window: u64,
}

impl SendWindow {
    /// Create a window of the given size.
    pub fn new(window: u64) -> Self {
        Self {
            sent: 0,
            acked: 0,
            window,
        }
    }

    /// Record body bytes handed to the transport.
    pub fn record_sent(&mut self, n: usize) {
        self.sent += n as u64;
    }

    /// Record a cumulative acknowledgment from the peer.
    ///
    /// Acks never regress and never exceed what was sent.
    pub fn record_ack(&mut self, total_received: u64) {
        self.acked = self.acked.max(total_received.min(self.sent));
    }

    /// Body bytes sent but not yet acknowledged.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.sent - self.acked
    }

    /// True while the scheduler must skip this message.
    #[inline]
    pub fn is_stalled(&self) -> bool {
        self.in_flight() >= self.window
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_WINDOW)
    }
}

/// Receiver-side cadence for one incoming message.
#[derive(Debug)]
pub struct AckTracker {
    acked: u64,
    interval: u64,
}

impl AckTracker {
    /// Create a tracker that acks every `interval` bytes.
    pub fn new(interval: u64) -> Self {
        Self { acked: 0, interval }
    }

    /// Observe the cumulative byte count; `Some(total)` when an ACK is due.
    pub fn note_total(&mut self, total_received: u64) -> Option<u64> {
        if total_received - self.acked >= self.interval {
            self.acked = total_received;
            Some(total_received)
        } else {
            None
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_stalls_and_recovers() {
        let mut window = SendWindow::new(100);
        window.record_sent(60);
        assert!(!window.is_stalled());
        window.record_sent(40);
        assert!(window.is_stalled());
        assert_eq!(window.in_flight(), 100);

        window.record_ack(30);
        assert_eq!(window.in_flight(), 70);
        assert!(!window.is_stalled());
    }

    #[test]
    fn test_acks_never_regress_or_overshoot() {
        let mut window = SendWindow::new(100);
        window.record_sent(50);
        window.record_ack(40);
        window.record_ack(10); // stale ack ignored
        assert_eq!(window.in_flight(), 10);
        window.record_ack(500); // peer cannot ack the unsent
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_tracker_fires_on_interval() {
        let mut tracker = AckTracker::new(32);
        assert_eq!(tracker.note_total(10), None);
        assert_eq!(tracker.note_total(31), None);
        assert_eq!(tracker.note_total(40), Some(40));
        assert_eq!(tracker.note_total(60), None);
        assert_eq!(tracker.note_total(72), Some(72));
    }

    #[test]
    fn test_defaults_match_contract() {
        assert_eq!(DEFAULT_SEND_WINDOW, 131_072);
        assert_eq!(DEFAULT_ACK_INTERVAL, 32_768);
        assert!(SendWindow::default().window == DEFAULT_SEND_WINDOW);
    }
}
