//! Client-side typing debounce
//!
//! Keystrokes arrive far faster than the peer needs updates, so the tracker
//! collapses them: the first keystroke toward a peer emits one typing
//! datagram, and a quiet period with no further keystrokes (or an explicit
//! stop) emits the stop. Repeated stops are harmless.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use super::Outbound;
use crate::protocol::codec::Encodable;
use crate::protocol::messages::{StopTyping, Typing};
use crate::UserId;

#[derive(Debug)]
enum TypingInput {
    Keystroke(UserId),
    Stop(UserId),
}

/// Debouncing tracker for outgoing typing signals
pub struct TypingTracker {
    input_tx: mpsc::UnboundedSender<TypingInput>,
    task: JoinHandle<()>,
}

impl TypingTracker {
    /// Spawn a tracker that writes datagrams to `outbound_tx`
    pub(crate) fn spawn(
        quiet_period: Duration,
        outbound_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(quiet_period, input_rx, outbound_tx));
        Self { input_tx, task }
    }

    /// Report a keystroke in a composer addressed to `receiver_id`
    pub fn keystroke(&self, receiver_id: UserId) {
        let _ = self.input_tx.send(TypingInput::Keystroke(receiver_id));
    }

    /// Explicitly stop typing toward `receiver_id`
    pub fn stop(&self, receiver_id: UserId) {
        let _ = self.input_tx.send(TypingInput::Stop(receiver_id));
    }

    /// Stop the tracker task
    pub(crate) fn shutdown(self) {
        self.task.abort();
    }
}

async fn run(
    quiet_period: Duration,
    mut input_rx: mpsc::UnboundedReceiver<TypingInput>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
) {
    // The peer currently being typed to, if any
    let mut active: Option<UserId> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            input = input_rx.recv() => {
                match input {
                    Some(TypingInput::Keystroke(peer)) => {
                        if active.as_ref() != Some(&peer) {
                            // Switching composers stops the old signal first
                            if let Some(old) = active.take() {
                                send_stop(&outbound_tx, old);
                            }
                            send_typing(&outbound_tx, peer.clone());
                            active = Some(peer);
                        }
                        deadline = Instant::now() + quiet_period;
                    }
                    Some(TypingInput::Stop(peer)) => {
                        if active.as_ref() == Some(&peer) {
                            active = None;
                        }
                        send_stop(&outbound_tx, peer);
                    }
                    None => {
                        if let Some(peer) = active.take() {
                            send_stop(&outbound_tx, peer);
                        }
                        return;
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline), if active.is_some() => {
                if let Some(peer) = active.take() {
                    send_stop(&outbound_tx, peer);
                }
            }
        }
    }
}

fn send_typing(outbound_tx: &mpsc::UnboundedSender<Outbound>, receiver_id: UserId) {
    let signal = Typing {
        receiver_id: Some(receiver_id),
        user_id: None,
    };
    send_datagram(outbound_tx, &signal);
}

fn send_stop(outbound_tx: &mpsc::UnboundedSender<Outbound>, receiver_id: UserId) {
    let signal = StopTyping {
        receiver_id: Some(receiver_id),
        user_id: None,
    };
    send_datagram(outbound_tx, &signal);
}

fn send_datagram<T: Encodable>(outbound_tx: &mpsc::UnboundedSender<Outbound>, msg: &T) {
    match msg.encode_frame() {
        Ok(frame) => {
            let _ = outbound_tx.send(Outbound::Datagram(frame.encode_to_bytes()));
        }
        Err(e) => warn!("Failed to encode typing signal: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Decodable;
    use crate::protocol::frame::{Frame, FrameType};

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            match outbound {
                Outbound::Datagram(data) => {
                    frames.push(Frame::decode_complete(&data).unwrap());
                }
                Outbound::Control(_) => panic!("Typing tracker must only emit datagrams"),
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_keystroke_burst_emits_single_typing() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(50), outbound_tx);

        for _ in 0..10 {
            tracker.keystroke("u2".to_string());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Typing);
        let typing = Typing::decode_frame(&frames[0]).unwrap();
        assert_eq!(typing.receiver_id.as_deref(), Some("u2"));

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_quiet_period_emits_stop() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(50), outbound_tx);

        tracker.keystroke("u2".to_string());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::Typing);
        assert_eq!(frames[1].frame_type, FrameType::StopTyping);

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_continued_typing_defers_stop() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(80), outbound_tx);

        // Keep typing past the first quiet window
        for _ in 0..3 {
            tracker.keystroke("u2".to_string());
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Typing);

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_explicit_stop_cancels_timer() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(50), outbound_tx);

        tracker.keystroke("u2".to_string());
        tracker.stop("u2".to_string());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // One typing, one stop, and no second stop from the timer
        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::Typing);
        assert_eq!(frames[1].frame_type, FrameType::StopTyping);

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_repeated_stops_are_harmless() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(50), outbound_tx);

        tracker.stop("u2".to_string());
        tracker.stop("u2".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.frame_type, FrameType::StopTyping);
        }

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_switching_peers_stops_old_signal() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::spawn(Duration::from_millis(200), outbound_tx);

        tracker.keystroke("u2".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.keystroke("u3".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = drain_frames(&mut outbound_rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameType::Typing);
        assert_eq!(frames[1].frame_type, FrameType::StopTyping);
        assert_eq!(frames[2].frame_type, FrameType::Typing);

        let stop = StopTyping::decode_frame(&frames[1]).unwrap();
        assert_eq!(stop.receiver_id.as_deref(), Some("u2"));
        let typing = Typing::decode_frame(&frames[2]).unwrap();
        assert_eq!(typing.receiver_id.as_deref(), Some("u3"));

        tracker.shutdown();
    }
}
