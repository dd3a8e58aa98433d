//! Virtual links: one logical peer connection over several lanes.

use crate::frame::Frame;
use crate::lane::{Lane, LaneClass, LaneState};
use anchor::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Lanes per link unless the caller asks for fewer.
pub const DEFAULT_LANE_COUNT: u16 = 4;

/// Stream traffic classes mapped onto lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    Control,
    Priority,
    Bulk,
}

/// Aggregated link health: the least-healthy-lane rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Degraded,
    Failed,
}

/// A logical peer-to-peer connection multiplexing up to
/// [`DEFAULT_LANE_COUNT`] lanes.
///
/// The link owns its lanes; streams and pumps refer to lanes by id and
/// resolve them through the link, which keeps the natural
/// link/lane/stream cycle broken.
pub struct VirtualLink {
    pub id: String,
    pub local_node: String,
    pub remote_node: String,
    lanes: RwLock<Vec<Arc<Lane>>>,
}

impl VirtualLink {
    pub fn new(
        id: impl Into<String>,
        local_node: impl Into<String>,
        remote_node: impl Into<String>,
        lane_count: u16,
    ) -> VirtualLink {
        let count = lane_count.clamp(1, DEFAULT_LANE_COUNT);
        let lanes = (0..count).map(|i| Arc::new(Lane::new(i))).collect();
        VirtualLink {
            id: id.into(),
            local_node: local_node.into(),
            remote_node: remote_node.into(),
            lanes: RwLock::new(lanes),
        }
    }

    pub fn lane(&self, id: u16) -> Result<Arc<Lane>> {
        self.lanes
            .read()
            .get(id as usize)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("lane {id} on link {}", self.id)))
    }

    pub fn lanes(&self) -> Vec<Arc<Lane>> {
        self.lanes.read().iter().map(Arc::clone).collect()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.read().len()
    }

    /// Lane selection: control -> lane 0, priority -> lane 1, bulk ->
    /// first non-control lane that can take the frame (first-fit).
    pub fn select_lane(&self, class: StreamClass, frame: &Frame) -> Result<Arc<Lane>> {
        let lanes = self.lanes.read();
        match class {
            StreamClass::Control => lanes
                .first()
                .map(Arc::clone)
                .ok_or_else(|| Error::NotFound(format!("link {} has no control lane", self.id))),
            StreamClass::Priority => lanes
                .get(1)
                .or_else(|| lanes.first())
                .map(Arc::clone)
                .ok_or_else(|| Error::NotFound(format!("link {} has no lanes", self.id))),
            StreamClass::Bulk => {
                let mut last_error = None;
                for lane in lanes.iter().skip(1) {
                    match lane.can_accept_frame(frame) {
                        Ok(()) => return Ok(Arc::clone(lane)),
                        Err(err) => last_error = Some(err),
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    Error::NotFound(format!("link {} has no bulk lanes", self.id))
                }))
            }
        }
    }

    /// Route one frame onto the lane its class selects.
    pub fn send(&self, class: StreamClass, mut frame: Frame) -> Result<u16> {
        let lane = self.select_lane(class, &frame)?;
        frame.lane = lane.id;
        lane.send(frame)?;
        debug!(link = %self.id, lane = lane.id, "frame queued");
        Ok(lane.id)
    }

    /// Any Connected lane keeps the link alive; all Failed/Closed fails
    /// it; Degraded anywhere (or any lane still connecting) shows through.
    pub fn status(&self) -> LinkStatus {
        let lanes = self.lanes.read();
        let mut any_connected = false;
        let mut any_degraded = false;
        let mut any_connecting = false;
        for lane in lanes.iter() {
            match lane.state() {
                LaneState::Connected => any_connected = true,
                LaneState::Degraded => any_degraded = true,
                LaneState::Connecting => any_connecting = true,
                LaneState::Failed | LaneState::Closed => {}
            }
        }
        if any_degraded {
            LinkStatus::Degraded
        } else if any_connected {
            LinkStatus::Connected
        } else if any_connecting {
            LinkStatus::Connecting
        } else {
            LinkStatus::Failed
        }
    }

    pub fn close(&self) {
        for lane in self.lanes.read().iter() {
            lane.close();
        }
    }
}

/// Map a lane class to the stream class that targets it.
impl From<LaneClass> for StreamClass {
    fn from(class: LaneClass) -> StreamClass {
        match class {
            LaneClass::Control => StreamClass::Control,
            LaneClass::Priority => StreamClass::Priority,
            LaneClass::Bulk => StreamClass::Bulk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_link(lanes: u16) -> VirtualLink {
        let link = VirtualLink::new("link_1", "node_a", "node_b", lanes);
        for lane in link.lanes() {
            lane.mark_connected();
        }
        link
    }

    #[test]
    fn control_frames_target_lane_zero() {
        let link = connected_link(3);
        let lane = link
            .select_lane(StreamClass::Control, &Frame::control(1, vec![0u8; 16]))
            .unwrap();
        assert_eq!(lane.id, 0);
    }

    #[test]
    fn oversized_control_frame_fails_on_lane_zero_but_rides_lane_one() {
        let link = connected_link(3);
        let big = Frame::control(1, vec![0u8; 2048]);
        let err = link.send(StreamClass::Control, big.clone()).unwrap_err();
        assert!(err.to_string().contains("lane 0 cannot accept frame"));

        let lane = link.send(StreamClass::Priority, big).unwrap();
        assert_eq!(lane, 1);
    }

    #[test]
    fn bulk_first_fit_skips_full_lanes() {
        let link = connected_link(3);
        // Fill lane 1 to capacity.
        let lane1 = link.lane(1).unwrap();
        for i in 0..crate::lane::DEFAULT_QUEUE_DEPTH as u64 {
            lane1.send(Frame::data(1, 0, i, Vec::new())).unwrap();
        }
        let chosen = link
            .select_lane(StreamClass::Bulk, &Frame::data(0, 0, 1, Vec::new()))
            .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn burst_past_queue_depth_reports_queue_full() {
        let link = connected_link(2);
        for i in 0..1000u64 {
            link.send(StreamClass::Priority, Frame::data(1, 0, i, Vec::new()))
                .unwrap();
        }
        let err = link
            .send(StreamClass::Priority, Frame::data(1, 0, 1000, Vec::new()))
            .unwrap_err();
        assert!(err.to_string().contains("send queue full"));
    }

    #[test]
    fn link_status_follows_least_healthy_lane() {
        let link = connected_link(3);
        assert_eq!(link.status(), LinkStatus::Connected);

        link.lane(2).unwrap().heartbeat_missed();
        assert_eq!(link.status(), LinkStatus::Degraded);

        for lane in link.lanes() {
            for _ in 0..crate::lane::MAX_MISSED_HEARTBEATS {
                lane.heartbeat_missed();
            }
        }
        assert_eq!(link.status(), LinkStatus::Failed);
    }

    #[test]
    fn closing_the_link_fails_status() {
        let link = connected_link(2);
        link.close();
        assert_eq!(link.status(), LinkStatus::Failed);
    }
}
