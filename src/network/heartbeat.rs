//! Heartbeat based liveness tracking for device connections.

use tracing::{debug, warn};

/// What the connection should do when the write-idle timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a HEART_BEAT request
    SendHeartbeat,
    /// Too many heartbeats went unanswered
    Close,
}

/// Counts heartbeats the device has not answered
#[derive(Debug)]
pub struct HeartbeatMonitor {
    device_id: String,
    missed: u32,
    max_missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(device_id: impl Into<String>, max_missed: u32) -> Self {
        HeartbeatMonitor {
            device_id: device_id.into(),
            missed: 0,
            max_missed,
        }
    }

    /// Heartbeats sent since the last reply
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Called when nothing has been written for the heartbeat interval
    pub fn on_write_idle(&mut self) -> HeartbeatAction {
        if self.missed > self.max_missed {
            warn!(
                "{}: Too many missed heartbeats ({} > {}), closing",
                self.device_id, self.missed, self.max_missed
            );
            return HeartbeatAction::Close;
        }
        self.missed += 1;
        debug!("{}: Sending heartbeat ({} unanswered)", self.device_id, self.missed - 1);
        HeartbeatAction::SendHeartbeat
    }

    /// Called for every HEART_BEAT reply
    pub fn on_heartbeat_reply(&mut self) {
        self.missed = 0;
    }

    pub fn reset(&mut self) {
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_after_max_missed() {
        let mut monitor = HeartbeatMonitor::new("bf01", 3);
        for _ in 0..4 {
            assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        }
        assert_eq!(monitor.missed(), 4);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::Close);
    }

    #[test]
    fn test_reply_resets_counter() {
        let mut monitor = HeartbeatMonitor::new("bf01", 1);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        monitor.on_heartbeat_reply();
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::Close);
    }

    #[test]
    fn test_zero_tolerance() {
        let mut monitor = HeartbeatMonitor::new("bf01", 0);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(monitor.on_write_idle(), HeartbeatAction::Close);
    }
}
