//! Routing of reassembled packets.
//!
//! The dispatcher is the notification sink of one streaming session. It owns
//! the reassembler, decodes DLReports into the store, and feeds the watchdog
//! on every tail-valid packet. Nothing else feeds it.

use std::sync::Arc;

use tracing::{debug, warn};

use power_watchdog_types::{Command, DlReport, ParseError};

use crate::events::{EventDispatcher, LinkEvent};
use crate::metrics::LinkMetrics;
use crate::reassembler::{Packet, Reassembler, ReassemblyEvent};
use crate::store::MeasurementStore;
use crate::watchdog::WatchdogFeeder;

/// Per-session packet sink.
#[derive(Debug)]
pub struct PacketDispatcher {
    reassembler: Reassembler,
    store: MeasurementStore,
    feeder: WatchdogFeeder,
    metrics: Arc<LinkMetrics>,
    events: EventDispatcher,
}

impl PacketDispatcher {
    /// Create a sink with a fresh reassembly buffer.
    pub fn new(
        store: MeasurementStore,
        feeder: WatchdogFeeder,
        metrics: Arc<LinkMetrics>,
        events: EventDispatcher,
    ) -> Self {
        Self {
            reassembler: Reassembler::new(),
            store,
            feeder,
            metrics,
            events,
        }
    }

    /// Undecoded bytes held by the reassembler.
    pub fn buffered(&self) -> usize {
        self.reassembler.buffered()
    }

    /// Handle one raw notification chunk.
    pub fn handle_chunk(&mut self, chunk: &[u8]) {
        self.metrics.record_bytes(chunk.len());

        for event in self.reassembler.push(chunk) {
            match event {
                ReassemblyEvent::Packet(packet) => {
                    self.feeder.feed();
                    self.dispatch(&packet);
                }
                ReassemblyEvent::BadTail { .. } => self.metrics.record_bad_tail(),
                ReassemblyEvent::OversizedLength { .. } => {
                    self.metrics.record_oversized_length()
                }
                ReassemblyEvent::Overflow { .. } => self.metrics.record_buffer_overflow(),
            }
        }
    }

    fn dispatch(&self, packet: &Packet) {
        match packet.header.command {
            Command::DlReport => self.handle_dl_report(packet),
            Command::ErrorReport => {
                self.metrics.record_error_report();
                debug!(
                    "ErrorReport received ({} bytes body): {}",
                    packet.body.len(),
                    hex::encode(&packet.body)
                );
            }
            Command::Alarm => {
                self.metrics.record_alarm();
                warn!(
                    "Alarm notification received ({} bytes body): {}",
                    packet.body.len(),
                    hex::encode(&packet.body)
                );
            }
            Command::Unknown(code) => {
                self.metrics.record_unknown_command();
                debug!("Unknown cmd {} ({} bytes body)", code, packet.body.len());
            }
        }
    }

    fn handle_dl_report(&self, packet: &Packet) {
        let report = match DlReport::from_body(&packet.body) {
            Ok(report) => report,
            Err(ParseError::UnexpectedBodyLength(len)) => {
                self.metrics.record_unexpected_body_length();
                warn!("Unexpected DLReport body length: {} (expected 34 or 68)", len);
                return;
            }
            Err(e) => {
                warn!("Failed to decode DLReport: {}", e);
                return;
            }
        };

        let l1 = report.line1();
        match report.line2() {
            Some(l2) => debug!(
                "L1: {:.1}V {:.2}A {:.1}W | L2: {:.1}V {:.2}A {:.1}W",
                l1.input_voltage, l1.current, l1.power, l2.input_voltage, l2.current, l2.power
            ),
            None => debug!(
                "L1: {:.1}V {:.2}A {:.1}W {:.3}kWh {:.1}Hz err={}",
                l1.input_voltage, l1.current, l1.power, l1.energy, l1.frequency, l1.error_code
            ),
        }

        self.store.apply(&report, &packet.raw);
        self.metrics.record_packet_decoded();
        self.events.send(LinkEvent::Snapshot {
            has_second_line: report.line2().is_some(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::watchdog::LinkWatchdog;
    use power_watchdog_types::LineMeasurement;
    use power_watchdog_types::protocol::encode_packet;

    fn line(voltage: f64, current: f64) -> LineMeasurement {
        LineMeasurement {
            input_voltage: voltage,
            current,
            power: voltage * current,
            energy: 12.5,
            output_voltage: voltage,
            frequency: 60.0,
            ..LineMeasurement::default()
        }
    }

    struct Harness {
        dispatcher: PacketDispatcher,
        store: MeasurementStore,
        metrics: Arc<LinkMetrics>,
        watchdog: LinkWatchdog,
    }

    fn harness() -> Harness {
        let store = MeasurementStore::new();
        let metrics = Arc::new(LinkMetrics::new());
        let watchdog = LinkWatchdog::new(Duration::from_secs(30));
        let dispatcher = PacketDispatcher::new(
            store.clone(),
            watchdog.feeder(),
            Arc::clone(&metrics),
            EventDispatcher::default(),
        );
        Harness {
            dispatcher,
            store,
            metrics,
            watchdog,
        }
    }

    #[test]
    fn test_single_line_report() {
        let mut h = harness();
        let body = DlReport::Single(line(120.0, 10.0)).to_body();
        let packet = encode_packet(Command::DlReport, 1, &body).unwrap();
        h.dispatcher.handle_chunk(&packet);

        let snapshot = h.store.snapshot();
        assert!(snapshot.is_ready());
        assert!(!snapshot.has_line2);
        assert!((snapshot.line1.input_voltage - 120.0).abs() < 1e-4);
        assert_eq!(snapshot.raw_hex, hex::encode(&packet));
        assert_eq!(h.metrics.snapshot().packets_decoded, 1);
    }

    #[test]
    fn test_dual_then_single_clears_flag() {
        let mut h = harness();
        let dual = DlReport::Dual(line(121.0, 20.0), line(119.0, 15.0)).to_body();
        h.dispatcher
            .handle_chunk(&encode_packet(Command::DlReport, 1, &dual).unwrap());

        let snapshot = h.store.snapshot();
        assert!(snapshot.has_line2);
        assert!((snapshot.line1.current - 20.0).abs() < 1e-4);
        assert!((snapshot.line2.current - 15.0).abs() < 1e-4);
        assert!((snapshot.line2.input_voltage - 119.0).abs() < 1e-4);

        let single = DlReport::Single(line(122.0, 5.0)).to_body();
        h.dispatcher
            .handle_chunk(&encode_packet(Command::DlReport, 2, &single).unwrap());
        let snapshot = h.store.snapshot();
        assert!(!snapshot.has_line2);
        assert!((snapshot.line1.current - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_unexpected_length_leaves_snapshot() {
        let mut h = harness();
        h.dispatcher
            .handle_chunk(&encode_packet(Command::DlReport, 1, &[0u8; 35]).unwrap());
        assert!(!h.store.snapshot().is_ready());
        assert_eq!(h.metrics.snapshot().unexpected_body_lengths, 1);
    }

    #[test]
    fn test_bad_tail_leaves_snapshot() {
        let mut h = harness();
        let body = DlReport::Single(line(120.0, 1.0)).to_body();
        let good = encode_packet(Command::DlReport, 1, &body).unwrap();
        h.dispatcher.handle_chunk(&good);
        let before = h.store.snapshot();

        let mut bad = DlReport::Single(line(99.0, 1.0)).to_body();
        bad = encode_packet(Command::DlReport, 2, &bad).unwrap();
        let len = bad.len();
        bad[len - 1] ^= 0xFF;
        h.dispatcher.handle_chunk(&bad);

        assert_eq!(h.store.snapshot(), before);
        assert_eq!(h.metrics.snapshot().bad_tails, 1);
        assert_eq!(h.dispatcher.buffered(), 0);
    }

    #[test]
    fn test_bad_tail_on_empty_store_keeps_not_ready() {
        let mut h = harness();
        let mut bad = encode_packet(Command::DlReport, 1, &[0u8; 34]).unwrap();
        bad[43] = 0;
        h.dispatcher.handle_chunk(&bad);
        assert_eq!(h.store.snapshot().updated_at, None);
    }

    #[test]
    fn test_fragmented_matches_whole() {
        let body = DlReport::Dual(line(121.0, 20.0), line(119.0, 15.0)).to_body();
        let packet = encode_packet(Command::DlReport, 1, &body).unwrap();

        let mut whole = harness();
        whole.dispatcher.handle_chunk(&packet);

        let mut split = harness();
        split.dispatcher.handle_chunk(&packet[..30]);
        assert!(!split.store.snapshot().is_ready());
        split.dispatcher.handle_chunk(&packet[30..]);

        let (a, b) = (whole.store.snapshot(), split.store.snapshot());
        assert_eq!(a.line1, b.line1);
        assert_eq!(a.line2, b.line2);
        assert_eq!(a.raw_hex, b.raw_hex);
    }

    #[test]
    fn test_ignored_commands_are_counted() {
        let mut h = harness();
        let mut data = encode_packet(Command::ErrorReport, 1, &[1, 2]).unwrap();
        data.extend(encode_packet(Command::Alarm, 2, &[3]).unwrap());
        data.extend(encode_packet(Command::Unknown(42), 3, &[]).unwrap());
        h.dispatcher.handle_chunk(&data);

        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.error_reports, 1);
        assert_eq!(metrics.alarms, 1);
        assert_eq!(metrics.unknown_commands, 1);
        assert_eq!(metrics.packets_decoded, 0);
        assert_eq!(metrics.bytes_received, data.len() as u64);
        assert!(!h.store.snapshot().is_ready());
    }

    #[test]
    fn test_only_valid_packets_feed_watchdog() {
        let mut h = harness();
        let mut bad = encode_packet(Command::DlReport, 1, &[0u8; 34]).unwrap();
        bad[44] = 0;
        h.dispatcher.handle_chunk(&bad);
        h.dispatcher.handle_chunk(&[0x00, 0x01, 0x02, 0x03, 0x04]);
        h.dispatcher
            .handle_chunk(&encode_packet(Command::DlReport, 1, &[0u8; 35]).unwrap());
        assert_eq!(h.watchdog.feeds(), 1);

        h.dispatcher
            .handle_chunk(&encode_packet(Command::Alarm, 2, &[]).unwrap());
        assert_eq!(h.watchdog.feeds(), 2);
    }
}
