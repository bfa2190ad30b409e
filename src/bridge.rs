//! The full serial-to-CAN pipeline behind one type.

use crate::alarm::AlarmTracker;
use crate::cells::CellInfoAggregator;
use crate::charge::ChargeController;
use crate::compute::ComputedDataModel;
use crate::protocol::{FrameProgress, FrameReceiver, StatusReply};
use crate::pylontech::{CanFrame, CanFrameEncoder, CanSink};

/// Consumes raw serial bytes on one side and produces the Pylontech CAN
/// frame set on the other.
///
/// Time never comes from a clock, the caller passes a monotonic
/// millisecond timestamp into [`Bridge::frames`], so with a frozen
/// timestamp and no new input repeated calls yield byte-identical frames.
pub struct Bridge {
    receiver: FrameReceiver,
    cells: CellInfoAggregator,
    model: ComputedDataModel,
    alarms: AlarmTracker,
    encoder: CanFrameEncoder,
    controller: ChargeController,
    latest: Option<StatusReply>,
    /// Set by [`Bridge::on_timeout`]; blocks re-encoding from the stale
    /// snapshot until a fresh reply arrives.
    degraded: bool,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            receiver: FrameReceiver::new(),
            cells: CellInfoAggregator::new(),
            model: ComputedDataModel::new(),
            alarms: AlarmTracker::new(),
            encoder: CanFrameEncoder::new(),
            controller: ChargeController::new(),
            latest: None,
            degraded: false,
        }
    }

    /// Feeds a chunk of serial data, returns the number of complete status
    /// replies decoded and processed.
    ///
    /// A framing error discards the partial frame and retries the failing
    /// byte once as a potential new frame start, so the stream resyncs on
    /// the next start marker.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let mut processed = 0;
        for byte in bytes {
            match self.receiver.consume(*byte) {
                Ok(FrameProgress::Pending) => {}
                Ok(FrameProgress::Complete) => {
                    if self.process_frame() {
                        processed += 1;
                    }
                    self.receiver.reset();
                }
                Err(error) => {
                    log::warn!("Discarding frame: {}", error);
                    self.receiver.reset();
                    // The byte that broke the frame may be the start of the
                    // next one.
                    if let Err(error) = self.receiver.consume(*byte) {
                        log::trace!("Skipping byte: {}", error);
                        self.receiver.reset();
                    }
                }
            }
        }
        processed
    }

    fn process_frame(&mut self) -> bool {
        let reply = match StatusReply::decode(self.receiver.frame()) {
            Ok(reply) => reply,
            Err(error) => {
                log::warn!("Discarding undecodable frame: {}", error);
                return false;
            }
        };
        self.cells.update(&reply);
        self.model.update(&reply, &self.cells);
        self.alarms.update(reply.alarms);
        if self.alarms.take_changed() {
            match self.alarms.active() {
                Some(alarm) if self.alarms.is_error() => log::warn!("Alarm: {}", alarm),
                Some(alarm) => log::info!("{}", alarm),
                None => log::info!("Alarms cleared"),
            }
        }
        self.latest = Some(reply);
        self.degraded = false;
        true
    }

    /// Degrades the CAN frames to safe values after the BMS stopped
    /// answering. The next good reply restores them.
    pub fn on_timeout(&mut self) {
        self.receiver.reset();
        self.encoder.apply_failsafe();
        self.degraded = true;
    }

    /// The most recent decoded reply, if any arrived yet.
    pub fn latest(&self) -> Option<&StatusReply> {
        self.latest.as_ref()
    }

    pub fn cells(&self) -> &CellInfoAggregator {
        &self.cells
    }

    pub fn model(&self) -> &ComputedDataModel {
        &self.model
    }

    pub fn alarms(&self) -> &AlarmTracker {
        &self.alarms
    }

    /// Runs the charge controller against the latest snapshot, refreshes
    /// the frame set and returns it in transmit order.
    ///
    /// After [`Bridge::on_timeout`] the fail-safe values stay in place
    /// until a fresh reply arrives.
    pub fn frames(&mut self, now_ms: u64) -> [&CanFrame; 10] {
        if !self.degraded {
            if let Some(snapshot) = self.model.current.clone() {
                let advice = self.controller.update(&snapshot, now_ms);
                self.encoder.update(
                    &snapshot,
                    advice.current_limit_100ma,
                    advice.inhibit_charging,
                );
            }
        }
        self.encoder.frames()
    }

    /// Refreshes the frame set as [`Bridge::frames`] and sends it.
    pub fn transmit(&mut self, sink: &mut dyn CanSink, now_ms: u64) -> std::io::Result<()> {
        self.frames(now_ms);
        self.encoder.transmit_all(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::ReplyBuilder;
    use crate::pylontech::SOC_SOH_FRAME_ID;

    struct CollectingSink(Vec<CanFrame>);

    impl CanSink for CollectingSink {
        fn transmit(&mut self, frame: &CanFrame) -> std::io::Result<()> {
            self.0.push(*frame);
            Ok(())
        }
    }

    #[test]
    fn frame_to_can_end_to_end() {
        let mut bridge = Bridge::new();
        let frame = ReplyBuilder::default().build();
        assert_eq!(bridge.feed(&frame), 1);

        let frames = bridge.frames(0);
        let soc_soh = frames[1];
        assert_eq!(soc_soh.id, SOC_SOH_FRAME_ID);
        // Default cells average 3301 mV, 70 % on the LFP curve.
        assert_eq!(soc_soh.payload(), &[70, 0, 100, 0]);

        let values = frames[2];
        assert_eq!(u16::from_le_bytes([values.data[0], values.data[1]]), 2640);

        let mut sink = CollectingSink(Vec::new());
        bridge.transmit(&mut sink, 0).unwrap();
        assert_eq!(sink.0.len(), 10);
        assert_eq!(sink.0[0].id, 0x351);
        assert_eq!(sink.0[9].id, 0x373);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut bridge = Bridge::new();
        let mut stream = vec![0x00, 0xFF, 0x4E, 0x12];
        stream.extend_from_slice(&ReplyBuilder::default().build());
        assert_eq!(bridge.feed(&stream), 1);
        assert!(bridge.latest().is_some());
    }

    #[test]
    fn split_delivery() {
        let mut bridge = Bridge::new();
        let frame = ReplyBuilder::default().build();
        let (head, tail) = frame.split_at(frame.len() / 2);
        assert_eq!(bridge.feed(head), 0);
        assert_eq!(bridge.feed(tail), 1);
    }

    #[test]
    fn repeated_frames_with_frozen_time_are_identical() {
        let mut bridge = Bridge::new();
        let frame = ReplyBuilder {
            current_raw: 0x8064,
            ..Default::default()
        }
        .build();
        bridge.feed(&frame);
        let first: Vec<CanFrame> = bridge.frames(5000).iter().map(|f| **f).collect();
        let second: Vec<CanFrame> = bridge.frames(5000).iter().map(|f| **f).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn timeout_failsafe_and_recovery() {
        let mut bridge = Bridge::new();
        let frame = ReplyBuilder {
            current_raw: 0x8064, // charging 1 A
            ..Default::default()
        }
        .build();
        bridge.feed(&frame);
        assert_ne!(bridge.frames(0)[4].payload(), &[0, 0]);

        bridge.on_timeout();
        let frames = bridge.frames(1000);
        assert_eq!(i16::from_le_bytes([frames[2].data[2], frames[2].data[3]]), 0);
        assert_eq!(frames[4].payload(), &[0, 0]);

        bridge.feed(&frame);
        assert_ne!(bridge.frames(5000)[4].payload(), &[0, 0]);
    }

    #[test]
    fn corrupted_frame_then_good_frame() {
        let mut bridge = Bridge::new();
        let mut bad = ReplyBuilder::default().build();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        assert_eq!(bridge.feed(&bad), 0);
        let good = ReplyBuilder::default().build();
        assert_eq!(bridge.feed(&good), 1);
    }
}
