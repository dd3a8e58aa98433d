//! Lanes: one WebSocket connection classed by priority.

use crate::frame::{Frame, CONTROL_FRAME_CAP};
use anchor::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded depth of each lane queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;

/// Heartbeat cadence per lane.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A heartbeat unanswered past this deadline degrades the lane.
pub const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Consecutive missed heartbeats before a lane is failed.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneClass {
    /// Lane 0: gossip, consensus, acks. Strict frame cap, highest priority.
    Control,
    /// Lane 1: latency-sensitive data.
    Priority,
    /// Lanes 2+: everything else.
    Bulk,
}

impl LaneClass {
    pub fn for_lane(lane: u16) -> LaneClass {
        match lane {
            0 => LaneClass::Control,
            1 => LaneClass::Priority,
            _ => LaneClass::Bulk,
        }
    }
}

/// Per-lane state machine: Connecting -> Connected <-> Degraded ->
/// Failed | Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Connecting,
    Connected,
    Degraded,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub missed_heartbeats: u32,
}

/// Bounded frame queue with wakeup for the pump task.
struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    depth: usize,
    ready: Notify,
}

impl FrameQueue {
    fn new(depth: usize) -> FrameQueue {
        FrameQueue {
            frames: Mutex::new(VecDeque::with_capacity(depth.min(64))),
            depth,
            ready: Notify::new(),
        }
    }

    fn try_push(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() >= self.depth {
            return false;
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_one();
        true
    }

    fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    async fn pop_wait(&self) -> Frame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.ready.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.frames.lock().len()
    }
}

/// One physical connection of a virtual link.
///
/// The lane owns its queues and stats; the wire pump (see `ws`) drains
/// the send queue onto the socket and feeds the recv queue from it.
/// Streams hold only the lane id and look the lane up through the link,
/// never an owning handle.
pub struct Lane {
    pub id: u16,
    class: LaneClass,
    state: Mutex<LaneState>,
    send_queue: Arc<FrameQueue>,
    recv_queue: Arc<FrameQueue>,
    stats: Mutex<LaneStats>,
    sequence: AtomicU64,
}

impl Lane {
    pub fn new(id: u16) -> Lane {
        Lane::with_queue_depth(id, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(id: u16, depth: usize) -> Lane {
        Lane {
            id,
            class: LaneClass::for_lane(id),
            state: Mutex::new(LaneState::Connecting),
            send_queue: Arc::new(FrameQueue::new(depth)),
            recv_queue: Arc::new(FrameQueue::new(depth)),
            stats: Mutex::new(LaneStats::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn class(&self) -> LaneClass {
        self.class
    }

    pub fn state(&self) -> LaneState {
        *self.state.lock()
    }

    pub fn stats(&self) -> LaneStats {
        *self.stats.lock()
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Admission check: control lanes cap frame size, every lane caps
    /// queue depth.
    pub fn can_accept_frame(&self, frame: &Frame) -> Result<()> {
        if self.class == LaneClass::Control && frame.payload_len() > CONTROL_FRAME_CAP {
            return Err(Error::InvalidConfiguration(format!(
                "lane {} cannot accept frame: {} bytes exceeds the {CONTROL_FRAME_CAP}-byte control cap",
                self.id,
                frame.payload_len()
            )));
        }
        if self.send_queue.len() >= self.send_queue.depth {
            return Err(Error::Transient(format!(
                "lane {}: send queue full",
                self.id
            )));
        }
        match self.state() {
            LaneState::Failed | LaneState::Closed => {
                Err(Error::ConnectionClosed)
            }
            _ => Ok(()),
        }
    }

    /// Enqueue for the wire pump. Callers may retry another lane on a
    /// queue-full error.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.can_accept_frame(&frame)?;
        let bytes = frame.payload_len() as u64;
        if !self.send_queue.try_push(frame) {
            return Err(Error::Transient(format!(
                "lane {}: send queue full",
                self.id
            )));
        }
        let mut stats = self.stats.lock();
        stats.frames_sent += 1;
        stats.bytes_sent += bytes;
        Ok(())
    }

    /// Next frame for the socket; awaits until one is queued.
    pub(crate) async fn next_outgoing(&self) -> Frame {
        self.send_queue.pop_wait().await
    }

    /// Deliver a frame read off the socket. Frames beyond the recv depth
    /// are dropped with a count, matching bounded-queue backpressure.
    pub(crate) fn deliver(&self, frame: Frame) -> bool {
        let bytes = frame.payload_len() as u64;
        let accepted = self.recv_queue.try_push(frame);
        if accepted {
            let mut stats = self.stats.lock();
            stats.frames_received += 1;
            stats.bytes_received += bytes;
        }
        accepted
    }

    /// Receive in send order; `None` when the queue is momentarily empty.
    pub fn try_recv(&self) -> Option<Frame> {
        self.recv_queue.pop()
    }

    pub async fn recv(&self) -> Frame {
        self.recv_queue.pop_wait().await
    }

    pub(crate) fn set_state(&self, next: LaneState) {
        let mut state = self.state.lock();
        // Closed and Failed are terminal.
        if matches!(*state, LaneState::Closed | LaneState::Failed) {
            return;
        }
        *state = next;
    }

    /// Heartbeat bookkeeping: a miss degrades, repeated misses fail.
    pub(crate) fn heartbeat_missed(&self) -> LaneState {
        let missed = {
            let mut stats = self.stats.lock();
            stats.missed_heartbeats += 1;
            stats.missed_heartbeats
        };
        if missed >= MAX_MISSED_HEARTBEATS {
            self.set_state(LaneState::Failed);
        } else {
            self.set_state(LaneState::Degraded);
        }
        self.state()
    }

    /// A pong arrived in time; clear the miss streak and recover.
    pub(crate) fn heartbeat_answered(&self) {
        self.stats.lock().missed_heartbeats = 0;
        if self.state() == LaneState::Degraded {
            self.set_state(LaneState::Connected);
        }
    }

    pub(crate) fn mark_connected(&self) {
        self.set_state(LaneState::Connected);
    }

    pub fn close(&self) {
        *self.state.lock() = LaneState::Closed;
        self.send_queue.ready.notify_waiters();
    }
}

/// Heartbeat frames ride the lane they probe.
pub(crate) fn heartbeat_frame(lane: &Lane) -> Frame {
    Frame::heartbeat(lane.id, lane.next_sequence())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_lane_rejects_oversized_frames() {
        let lane = Lane::new(0);
        lane.mark_connected();
        let big = Frame::control(1, vec![0u8; 2048]);
        let err = lane.can_accept_frame(&big).unwrap_err();
        assert!(err.to_string().contains("lane 0 cannot accept frame"));

        // The same payload is fine on a data lane.
        let lane1 = Lane::new(1);
        lane1.mark_connected();
        let frame = Frame::data(1, 0, 1, vec![0u8; 2048]);
        assert!(lane1.can_accept_frame(&frame).is_ok());
    }

    #[test]
    fn queue_full_rejects_the_overflow_frame() {
        let lane = Lane::with_queue_depth(1, 1000);
        lane.mark_connected();
        for i in 0..1000u64 {
            lane.send(Frame::data(1, 0, i, Vec::new())).unwrap();
        }
        let err = lane.send(Frame::data(1, 0, 1000, Vec::new())).unwrap_err();
        assert!(err.to_string().contains("send queue full"));
        assert!(err.is_transient(), "callers may retry another lane");
    }

    #[test]
    fn delivery_preserves_send_order() {
        let lane = Lane::new(2);
        lane.mark_connected();
        for i in 0..5u64 {
            assert!(lane.deliver(Frame::data(2, 0, i, Vec::new())));
        }
        let sequences: Vec<u64> = std::iter::from_fn(|| lane.try_recv())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn heartbeat_misses_degrade_then_fail() {
        let lane = Lane::new(1);
        lane.mark_connected();
        assert_eq!(lane.heartbeat_missed(), LaneState::Degraded);
        lane.heartbeat_answered();
        assert_eq!(lane.state(), LaneState::Connected);

        assert_eq!(lane.heartbeat_missed(), LaneState::Degraded);
        assert_eq!(lane.heartbeat_missed(), LaneState::Degraded);
        assert_eq!(lane.heartbeat_missed(), LaneState::Failed);
        // Failed is terminal.
        lane.heartbeat_answered();
        assert_eq!(lane.state(), LaneState::Failed);
    }

    #[test]
    fn closed_lane_refuses_frames() {
        let lane = Lane::new(1);
        lane.mark_connected();
        lane.close();
        assert!(matches!(
            lane.send(Frame::data(1, 0, 1, Vec::new())).unwrap_err(),
            Error::ConnectionClosed
        ));
    }
}
