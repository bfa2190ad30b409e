//! Pylontech compatible CAN frame encoding.
//!
//! All multi-byte fields are little-endian on the wire. Frame contents
//! follow the protocol a Pylontech US2000 speaks to Deye, SMA and Luxpower
//! inverters, which is why a few frames carry fixed placeholder values.

use crate::compute::ComputedSnapshot;

/// SOC below which the inverter is asked to force-charge from any source.
pub const SOC_THRESHOLD_FOR_FORCE_CHARGE: u8 = 10;

pub const BATTERY_LIMITS_FRAME_ID: u16 = 0x351;
pub const SOC_SOH_FRAME_ID: u16 = 0x355;
pub const CURRENT_VALUES_FRAME_ID: u16 = 0x356;
pub const ERRORS_WARNINGS_FRAME_ID: u16 = 0x359;
pub const CHARGE_REQUEST_FRAME_ID: u16 = 0x35C;
pub const MANUFACTURER_FRAME_ID: u16 = 0x35E;
pub const SPECIFICATIONS_FRAME_ID: u16 = 0x35F;
pub const LUXPOWER_CAPACITY_FRAME_ID: u16 = 0x379;
pub const CELL_INFO_FRAME_ID: u16 = 0x373;
pub const NETWORK_ALIVE_FRAME_ID: u16 = 0x305;

/// One classic (11-bit id) CAN frame, payload in `data[..len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub len: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    fn new(id: u16, len: u8) -> Self {
        Self {
            id,
            len,
            data: [0; 8],
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_i16(&mut self, offset: usize, value: i16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// Where the encoded frames go. The binary backs this with a SocketCAN
/// socket; tests collect frames in a `Vec`.
pub trait CanSink {
    fn transmit(&mut self, frame: &CanFrame) -> std::io::Result<()>;
}

/// Maintains the full set of frames the inverter expects, refreshed from
/// each poll and degraded to safe values when the BMS stops answering.
#[derive(Debug, Clone)]
pub struct CanFrameEncoder {
    limits: CanFrame,
    soc_soh: CanFrame,
    current_values: CanFrame,
    manufacturer: CanFrame,
    charge_request: CanFrame,
    alive: CanFrame,
    errors_warnings: CanFrame,
    specifications: CanFrame,
    luxpower_capacity: CanFrame,
    cell_info: CanFrame,
}

impl Default for CanFrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CanFrameEncoder {
    pub fn new() -> Self {
        let mut manufacturer = CanFrame::new(MANUFACTURER_FRAME_ID, 8);
        manufacturer.data.copy_from_slice(b"PYLON   ");
        let mut alive = CanFrame::new(NETWORK_ALIVE_FRAME_ID, 8);
        alive.data[0] = 33;
        let mut errors_warnings = CanFrame::new(ERRORS_WARNINGS_FRAME_ID, 7);
        errors_warnings.data[4] = 1; // one battery module
        errors_warnings.data[5] = b'P';
        errors_warnings.data[6] = b'N';
        Self {
            limits: CanFrame::new(BATTERY_LIMITS_FRAME_ID, 8),
            soc_soh: CanFrame::new(SOC_SOH_FRAME_ID, 4),
            current_values: CanFrame::new(CURRENT_VALUES_FRAME_ID, 6),
            manufacturer,
            charge_request: CanFrame::new(CHARGE_REQUEST_FRAME_ID, 2),
            alive,
            errors_warnings,
            specifications: CanFrame::new(SPECIFICATIONS_FRAME_ID, 8),
            luxpower_capacity: CanFrame::new(LUXPOWER_CAPACITY_FRAME_ID, 8),
            cell_info: CanFrame::new(CELL_INFO_FRAME_ID, 8),
        }
    }

    /// Refreshes every frame from one poll's derived values.
    ///
    /// `charge_current_limit_100ma` is the limit to advertise in 0x351,
    /// normally the BMS's charge overcurrent protection, but the charge
    /// controller lowers it during managed charging. `inhibit_charging`
    /// drops the charge enable flag regardless of the MOSFET state.
    pub fn update(
        &mut self,
        s: &ComputedSnapshot,
        charge_current_limit_100ma: u16,
        inhibit_charging: bool,
    ) {
        self.limits.put_u16(0, s.battery_overvoltage_10mv / 10);
        self.limits.put_u16(2, charge_current_limit_100ma);
        self.limits.put_u16(4, s.discharge_overcurrent_a * 10);
        self.limits.put_u16(6, s.battery_undervoltage_10mv / 10);

        self.soc_soh.put_u16(0, s.soc_percent as u16);
        self.soc_soh.put_u16(2, 100);

        self.current_values.put_u16(0, s.battery_10mv);
        self.current_values.put_i16(2, s.current_10ma / 10);
        self.current_values.put_i16(4, s.temperature_maximum * 10);

        let mut request = 0u8;
        // ChargeEnable and DischargeEnable are deliberately cross-wired to
        // the opposite MOSFET: the inverter may only pull current while the
        // discharge MOSFET conducts and push while the charge MOSFET does.
        if s.status.discharge_mosfet_active() && !inhibit_charging {
            request |= 1 << 7;
        }
        if s.status.charge_mosfet_active() {
            request |= 1 << 6;
        }
        if s.soc_percent < SOC_THRESHOLD_FOR_FORCE_CHARGE {
            request |= 1 << 5;
        }
        if s.battery_10mv < s.battery_undervoltage_10mv {
            request |= 1 << 4;
        }
        self.charge_request.data[0] = request;
        self.charge_request.data[1] = 0;

        let overtemperature = s.alarms.mosfet_overtemperature()
            || s.alarms.sensor_overtemperature()
            || s.alarms.sensor2_overtemperature();
        let mut errors = 0u8;
        if s.alarms.cell_overvoltage() {
            errors |= 1 << 1;
        }
        if s.alarms.cell_undervoltage() {
            errors |= 1 << 2;
        }
        if overtemperature {
            errors |= 1 << 3;
        }
        if s.alarms.sensor_low_temperature() {
            errors |= 1 << 4;
        }
        if s.alarms.discharge_overcurrent() {
            errors |= 1 << 7;
        }
        self.errors_warnings.data[0] = errors;
        let mut errors2 = 0u8;
        if s.alarms.charge_overcurrent() {
            errors2 |= 1 << 0;
        }
        if s.status.battery_down() {
            errors2 |= 1 << 7;
        }
        self.errors_warnings.data[1] = errors2;
        // Warnings mirror the errors but trip on the battery level alarms.
        let mut warnings = 0u8;
        if s.alarms.charge_overvoltage() {
            warnings |= 1 << 1;
        }
        if s.alarms.discharge_undervoltage() {
            warnings |= 1 << 2;
        }
        if overtemperature {
            warnings |= 1 << 3;
        }
        if s.alarms.sensor_low_temperature() {
            warnings |= 1 << 4;
        }
        if s.alarms.discharge_overcurrent() {
            warnings |= 1 << 7;
        }
        self.errors_warnings.data[2] = warnings;
        self.errors_warnings.data[3] = if s.alarms.charge_overcurrent() { 1 } else { 0 };

        self.specifications.put_u16(0, 0); // chemistry code
        self.specifications.data[2] = 0; // hardware version "1.0"
        self.specifications.data[3] = 1;
        self.specifications.put_u16(4, s.total_capacity_ah as u16);
        self.specifications.data[6] = s.software_version_low;
        self.specifications.data[7] = s.software_version_high;

        self.luxpower_capacity.put_u16(0, s.total_capacity_ah as u16);

        self.cell_info.put_u16(0, s.minimum_cell_mv);
        self.cell_info.put_u16(2, s.maximum_cell_mv);
        // Cell temperature extremes are not available from the BMS; these
        // recorded placeholder values keep BYD protocol inverters happy.
        self.cell_info.put_u16(4, 0x006F);
        self.cell_info.put_u16(6, 0x00DE);
    }

    /// Degrades the frames after the BMS stopped answering: zero current,
    /// no charge or discharge permission, no stale error flags.
    pub fn apply_failsafe(&mut self) {
        self.current_values.put_i16(2, 0);
        self.charge_request.data[0] = 0;
        self.charge_request.data[1] = 0;
        self.errors_warnings.data[..4].fill(0);
    }

    /// All frames in transmit order.
    pub fn frames(&self) -> [&CanFrame; 10] {
        [
            &self.limits,
            &self.soc_soh,
            &self.current_values,
            &self.manufacturer,
            &self.charge_request,
            &self.alive,
            &self.errors_warnings,
            &self.specifications,
            &self.luxpower_capacity,
            &self.cell_info,
        ]
    }

    pub fn transmit_all(&self, sink: &mut dyn CanSink) -> std::io::Result<()> {
        for frame in self.frames() {
            sink.transmit(frame)?;
        }
        Ok(())
    }
}
