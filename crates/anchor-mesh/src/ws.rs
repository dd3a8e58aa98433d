//! WebSocket attachment for lanes.
//!
//! The pump is transport-agnostic: it exchanges encoded frame bytes over
//! a channel pair, so the same logic serves the tungstenite client side
//! and the axum server side. Per lane there are three duties:
//!
//! - drain the lane's send queue onto the socket
//! - decode inbound bytes, answer heartbeats with acks, deliver data
//! - probe with a heartbeat every 30s; a missed pong degrades the lane,
//!   repeated misses fail it and stop the pump

use crate::frame::{Frame, FrameCodec, FrameType, Handshake};
use crate::lane::{heartbeat_frame, Lane, LaneState, HEARTBEAT_INTERVAL, PONG_DEADLINE};
use anchor::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Encoded frame bytes plus the text/binary flag.
pub(crate) type WireBytes = (bool, Vec<u8>);

/// Channel depth between the pump and a socket adapter.
const WIRE_CHANNEL: usize = 64;

/// A running lane pump; dropping it or calling `close` stops the tasks.
pub struct LanePump {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanePump {
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Start the transport-agnostic pump for one lane.
///
/// Returns the channel pair a socket adapter shuttles: `outgoing` bytes
/// to write to the socket, `incoming` bytes read from it.
pub(crate) fn start_pump(
    lane: Arc<Lane>,
    codec: Arc<dyn FrameCodec>,
) -> (mpsc::Sender<WireBytes>, mpsc::Receiver<WireBytes>, LanePump) {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<WireBytes>(WIRE_CHANNEL);
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<WireBytes>(WIRE_CHANNEL);
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();

    lane.mark_connected();

    // Send side: lane queue -> encoded bytes.
    {
        let lane = Arc::clone(&lane);
        let codec = Arc::clone(&codec);
        let outgoing = outgoing_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    frame = lane.next_outgoing() => {
                        match codec.encode(&frame) {
                            Ok(bytes) => {
                                if outgoing.send((codec.is_text(), bytes)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(lane = lane.id, error = %err, "frame encode failed"),
                        }
                    }
                }
            }
        }));
    }

    // Heartbeat prober: enqueue a probe, expect its ack within the pong
    // deadline.
    let (pong_tx, mut pong_rx) = mpsc::channel::<u64>(WIRE_CHANNEL);
    {
        let lane = Arc::clone(&lane);
        let mut shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let probe = heartbeat_frame(&lane);
                        let sequence = probe.sequence;
                        if lane.send(probe).is_err() {
                            break;
                        }
                        let answered = tokio::time::timeout(PONG_DEADLINE, async {
                            while let Some(acked) = pong_rx.recv().await {
                                if acked >= sequence {
                                    return true;
                                }
                            }
                            false
                        })
                        .await
                        .unwrap_or(false);
                        if answered {
                            lane.heartbeat_answered();
                        } else if lane.heartbeat_missed() == LaneState::Failed {
                            warn!(lane = lane.id, "lane failed after repeated missed heartbeats");
                            break;
                        }
                    }
                }
            }
        }));
    }

    // Receive side: decoded frames -> acks, pongs, delivery.
    {
        let lane = Arc::clone(&lane);
        let mut shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = incoming_rx.recv() => {
                        let Some((_, bytes)) = received else { break };
                        let frame = match codec.decode(&bytes) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(lane = lane.id, error = %err, "frame decode failed");
                                continue;
                            }
                        };
                        match frame.frame_type {
                            FrameType::Heartbeat => {
                                let ack = Frame::ack(lane.id, frame.sequence);
                                if let Err(err) = lane.send(ack) {
                                    debug!(lane = lane.id, error = %err, "heartbeat ack not queued");
                                }
                            }
                            FrameType::Ack => {
                                let _ = pong_tx.send(frame.sequence).await;
                            }
                            _ => {
                                if !lane.deliver(frame) {
                                    warn!(lane = lane.id, "recv queue full, frame dropped");
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    (incoming_tx, outgoing_rx, LanePump { shutdown, tasks })
}

/// Dial one lane over a WebSocket URL, send the handshake, and start the
/// pump.
pub async fn connect_lane(
    url: &str,
    handshake: &Handshake,
    lane: Arc<Lane>,
    codec: Arc<dyn FrameCodec>,
) -> Result<LanePump> {
    handshake.validate()?;
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| Error::Transient(format!("mesh dial {url}: {err}")))?;
    let (mut sink, mut source) = stream.split();

    let hello = serde_json::to_string(handshake)?;
    sink.send(WsMessage::Text(hello))
        .await
        .map_err(|err| Error::Transient(format!("mesh handshake {url}: {err}")))?;

    let (incoming_tx, mut outgoing_rx, pump) = start_pump(lane, codec);

    // Socket adapter: outgoing bytes onto the sink...
    tokio::spawn(async move {
        while let Some((text, bytes)) = outgoing_rx.recv().await {
            let message = if text {
                WsMessage::Text(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                WsMessage::Binary(bytes)
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    // ...and inbound messages into the pump.
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            let payload = match message {
                Ok(WsMessage::Text(text)) => (true, text.into_bytes()),
                Ok(WsMessage::Binary(bytes)) => (false, bytes),
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue, // ping/pong handled by the library
            };
            if incoming_tx.send(payload).await.is_err() {
                break;
            }
        }
    });

    Ok(pump)
}

/// Accept one lane on an axum WebSocket upgrade. Reads and validates the
/// handshake first; unknown capabilities in it are ignored.
pub async fn accept_lane(
    mut socket: axum::extract::ws::WebSocket,
    lane: Arc<Lane>,
    codec: Arc<dyn FrameCodec>,
) -> Result<(Handshake, LanePump)> {
    use axum::extract::ws::Message as AxMessage;

    let hello = match socket.recv().await {
        Some(Ok(AxMessage::Text(text))) => text,
        Some(Ok(_)) => {
            return Err(Error::InvalidConfiguration(
                "handshake must be the first text message".into(),
            ))
        }
        _ => return Err(Error::ConnectionClosed),
    };
    let handshake: Handshake = serde_json::from_str(&hello)?;
    handshake.validate()?;

    let (incoming_tx, mut outgoing_rx, pump) = start_pump(lane, codec);
    let (mut sink, mut source) = socket.split();

    tokio::spawn(async move {
        while let Some((text, bytes)) = outgoing_rx.recv().await {
            let message = if text {
                AxMessage::Text(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                AxMessage::Binary(bytes)
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            let payload = match message {
                Ok(AxMessage::Text(text)) => (true, text.into_bytes()),
                Ok(AxMessage::Binary(bytes)) => (false, bytes),
                Ok(AxMessage::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if incoming_tx.send(payload).await.is_err() {
                break;
            }
        }
    });

    Ok((handshake, pump))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::JsonFrameCodec;

    /// Two pumps joined back-to-back: what one writes, the other reads.
    #[tokio::test]
    async fn frames_cross_between_paired_pumps_in_order() {
        let lane_a = Arc::new(Lane::new(1));
        let lane_b = Arc::new(Lane::new(1));
        let codec: Arc<dyn FrameCodec> = Arc::new(JsonFrameCodec);

        let (a_in, mut a_out, pump_a) = start_pump(Arc::clone(&lane_a), Arc::clone(&codec));
        let (b_in, mut b_out, pump_b) = start_pump(Arc::clone(&lane_b), Arc::clone(&codec));

        // Loopback wiring.
        tokio::spawn(async move {
            while let Some(bytes) = a_out.recv().await {
                if b_in.send(bytes).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(bytes) = b_out.recv().await {
                if a_in.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        for i in 0..5u64 {
            lane_a.send(Frame::data(1, 9, i, format!("m{i}").into_bytes())).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), lane_b.recv())
                .await
                .expect("frame crossed");
            received.push(frame.sequence);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);

        pump_a.close().await;
        pump_b.close().await;
    }
}
