//! # Anchor mesh transport
//!
//! Node-to-node control and data frames over multi-lane WebSocket
//! virtual links, independent of the adapter stack:
//!
//! - **[`frame`]**: the frame model, the JSON wire codec, the reserved
//!   binary framing, and the connect handshake - all behind a pluggable
//!   [`frame::FrameCodec`]
//! - **[`lane`]**: one WebSocket connection per lane, classed
//!   Control/Priority/Bulk, with bounded queues, heartbeat health, and a
//!   Connecting -> Connected <-> Degraded -> Failed | Closed state machine
//! - **[`link`]**: the virtual link multiplexing up to four lanes with
//!   class-based selection (control -> lane 0, priority -> lane 1, bulk ->
//!   first fit) and least-healthy-lane status aggregation
//! - **[`ws`]**: lane pumps for the tungstenite client side and the axum
//!   server side
//! - **[`routing`]**: distance-vector routing table scaffold with
//!   broadcast route updates and max-age cleanup
//! - **[`consensus`]**: leader-election scaffold (term monotonicity,
//!   single vote per term); log replication intentionally absent and not
//!   load-bearing
//!
//! Ordering: frames on one lane are delivered in send order; across lanes
//! of the same link no order is promised.

pub mod consensus;
pub mod frame;
pub mod lane;
pub mod link;
pub mod routing;
pub mod ws;

pub use consensus::{MeshConsensus, NodeRole};
pub use frame::{
    BinaryFrameCodec, Frame, FrameCodec, FrameType, Handshake, JsonFrameCodec, RoutingInfo,
    CONTROL_FRAME_CAP,
};
pub use lane::{Lane, LaneClass, LaneState, LaneStats, DEFAULT_QUEUE_DEPTH, HEARTBEAT_INTERVAL};
pub use link::{LinkStatus, StreamClass, VirtualLink, DEFAULT_LANE_COUNT};
pub use routing::{RouteEntry, RouteUpdate, RoutingTable};
pub use ws::{accept_lane, connect_lane, LanePump};
