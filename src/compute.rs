use crate::cells::CellInfoAggregator;
use crate::protocol::{Alarms, Chemistry, StatusBits, StatusReply};
use crate::soc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The values the CAN side and the charge controller work from, derived
/// from one decoded reply.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ComputedSnapshot {
    pub battery_10mv: u16,
    pub current_10ma: i16,
    /// Voltage mapped SOC, not the BMS's coulomb-counted one.
    pub soc_percent: u8,
    /// The BMS's own SOC estimate; the charge controller trusts this one
    /// for the end-of-bulk decision.
    pub bms_soc_percent: u8,
    pub chemistry: Chemistry,
    pub alarms: Alarms,
    pub status: StatusBits,
    pub temperature_mosfet: i16,
    pub temperature_sensor1: i16,
    pub temperature_sensor2: i16,
    /// Hottest of the three temperature readings.
    pub temperature_maximum: i16,
    pub total_capacity_ah: u32,
    /// total_capacity_ah scaled by the estimated SOC.
    pub remaining_capacity_ah: u32,
    pub voltage_volts: f32,
    pub current_amps: f32,
    pub power_watts: f32,
    pub charge_overcurrent_a: u16,
    pub discharge_overcurrent_a: u16,
    pub battery_overvoltage_10mv: u16,
    pub battery_undervoltage_10mv: u16,
    pub minimum_cell_mv: u16,
    pub maximum_cell_mv: u16,
    pub average_cell_mv: u16,
    /// Second and first byte of the firmware version string, reported in
    /// the specifications frame.
    pub software_version_low: u8,
    pub software_version_high: u8,
    pub bms_is_starting: bool,
}

impl ComputedSnapshot {
    fn derive(reply: &StatusReply, cells: &CellInfoAggregator) -> Self {
        let soc_percent = soc::estimate(reply.chemistry, cells.average_millivolt);
        let voltage_volts = reply.battery_10mv as f32 / 100.0;
        let current_amps = reply.current_10ma as f32 / 100.0;
        Self {
            battery_10mv: reply.battery_10mv,
            current_10ma: reply.current_10ma,
            soc_percent,
            bms_soc_percent: reply.bms_soc_percent,
            chemistry: reply.chemistry,
            alarms: reply.alarms,
            status: reply.status,
            temperature_mosfet: reply.temperature_mosfet,
            temperature_sensor1: reply.temperature_sensor1,
            temperature_sensor2: reply.temperature_sensor2,
            temperature_maximum: reply
                .temperature_mosfet
                .max(reply.temperature_sensor1)
                .max(reply.temperature_sensor2),
            total_capacity_ah: reply.total_capacity_ah,
            remaining_capacity_ah: reply.total_capacity_ah * soc_percent as u32 / 100,
            voltage_volts,
            current_amps,
            power_watts: voltage_volts * current_amps,
            charge_overcurrent_a: reply.charge_overcurrent_a,
            discharge_overcurrent_a: reply.discharge_overcurrent_a,
            battery_overvoltage_10mv: reply.battery_overvoltage_10mv,
            battery_undervoltage_10mv: reply.battery_undervoltage_10mv,
            minimum_cell_mv: cells.minimum_millivolt,
            maximum_cell_mv: cells.maximum_millivolt,
            average_cell_mv: cells.average_millivolt,
            software_version_low: reply.software_version[1],
            software_version_high: reply.software_version[0],
            bms_is_starting: reply.is_starting(),
        }
    }
}

/// Holds the current and previous snapshot and answers "did X change"
/// questions between consecutive polls.
///
/// The change predicates are informational, nothing in the pipeline
/// filters on them.
#[derive(Debug, Clone, Default)]
pub struct ComputedDataModel {
    pub current: Option<ComputedSnapshot>,
    previous: Option<ComputedSnapshot>,
    /// Polls with the balancer bit set since startup.
    pub balancing_count: u32,
}

/// Expected poll interval, used to turn the balancing counter into a
/// duration.
const POLL_INTERVAL_SECONDS: u32 = 2;

impl ComputedDataModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, reply: &StatusReply, cells: &CellInfoAggregator) {
        let snapshot = ComputedSnapshot::derive(reply, cells);
        if snapshot.status.balancer_active() {
            self.balancing_count += 1;
        }
        self.previous = self.current.take();
        self.current = Some(snapshot);
    }

    fn changed<T: PartialEq>(&self, f: impl Fn(&ComputedSnapshot) -> T) -> bool {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => f(current) != f(previous),
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn alarms_changed(&self) -> bool {
        self.changed(|s| s.alarms)
    }

    pub fn status_changed(&self) -> bool {
        self.changed(|s| s.status)
    }

    pub fn soc_changed(&self) -> bool {
        self.changed(|s| s.soc_percent)
    }

    pub fn capacity_changed(&self) -> bool {
        self.changed(|s| s.remaining_capacity_ah) || self.soc_changed()
    }

    fn moved_by(&self, threshold: f32, f: impl Fn(&ComputedSnapshot) -> f32) -> bool {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => (f(current) - f(previous)).abs() > threshold,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn temperature_changed(&self) -> bool {
        self.moved_by(2.0, |s| s.temperature_maximum as f32)
    }

    pub fn voltage_changed(&self) -> bool {
        self.moved_by(0.02, |s| s.voltage_volts)
    }

    pub fn power_changed(&self) -> bool {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => {
                (current.power_watts - previous.power_watts).abs() >= 20.0
            }
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Accumulated time with the balancer active, assuming the regular
    /// poll interval.
    pub fn balancing_seconds(&self) -> u32 {
        self.balancing_count * POLL_INTERVAL_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::ReplyBuilder;

    fn poll(model: &mut ComputedDataModel, alarms: u16, status: u16) {
        let frame = ReplyBuilder {
            alarms,
            status,
            ..Default::default()
        }
        .build();
        let reply = ReplyBuilder::receive(&frame).unwrap();
        let mut cells = CellInfoAggregator::new();
        cells.update(&reply);
        model.update(&reply, &cells);
    }

    #[test]
    fn soc_comes_from_average_cell_voltage() {
        let mut model = ComputedDataModel::new();
        poll(&mut model, 0, 0b0011);
        // Default builder cells average 3301 mV, inside the 70..80 % span.
        let snapshot = model.current.as_ref().unwrap();
        assert_eq!(snapshot.soc_percent, 70);
        // The BMS's own estimate rides along untouched.
        assert_eq!(snapshot.bms_soc_percent, 50);
    }

    #[test]
    fn change_predicates() {
        let mut model = ComputedDataModel::new();
        assert!(!model.alarms_changed());
        poll(&mut model, 0, 0b0011);
        // First snapshot counts as a change.
        assert!(model.alarms_changed());
        poll(&mut model, 0, 0b0011);
        assert!(!model.alarms_changed());
        assert!(!model.status_changed());
        poll(&mut model, 1 << 2, 0b0001);
        assert!(model.alarms_changed());
        assert!(model.status_changed());
    }

    #[test]
    fn balancing_count_tracks_balancer_bit() {
        let mut model = ComputedDataModel::new();
        poll(&mut model, 0, 0b0011);
        poll(&mut model, 0, 0b0111);
        poll(&mut model, 0, 0b0111);
        assert_eq!(model.balancing_count, 2);
    }

    #[test]
    fn derived_floats_and_capacity() {
        let frame = ReplyBuilder {
            current_raw: 0x8000 | 1000, // charging 10 A
            ..Default::default()
        }
        .build();
        let reply = ReplyBuilder::receive(&frame).unwrap();
        let mut cells = CellInfoAggregator::new();
        cells.update(&reply);
        let mut model = ComputedDataModel::new();
        model.update(&reply, &cells);
        let snapshot = model.current.as_ref().unwrap();
        assert_eq!(snapshot.voltage_volts, 26.4);
        assert_eq!(snapshot.current_amps, 10.0);
        assert_eq!(snapshot.power_watts, 264.0);
        // 100 Ah at the 70 % voltage-mapped SOC.
        assert_eq!(snapshot.remaining_capacity_ah, 70);

        // Same values again, nothing moved.
        model.update(&reply, &cells);
        assert!(!model.voltage_changed());
        assert!(!model.power_changed());
        assert!(!model.temperature_changed());
        assert!(!model.capacity_changed());
    }

    #[test]
    fn maximum_temperature() {
        let frame = ReplyBuilder {
            temperatures: [35, 150, 28],
            ..Default::default()
        }
        .build();
        let reply = ReplyBuilder::receive(&frame).unwrap();
        let mut cells = CellInfoAggregator::new();
        cells.update(&reply);
        let mut model = ComputedDataModel::new();
        model.update(&reply, &cells);
        // 150 decodes to -50 degrees, so the MOSFET reading wins.
        assert_eq!(model.current.as_ref().unwrap().temperature_maximum, 35);
    }
}
