use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const FRAME_START_BYTE_0: u8 = 0x4E;
pub const FRAME_START_BYTE_1: u8 = 0x57;
pub const FRAME_END_BYTE: u8 = 0x68;

/// Smallest declared frame length the BMS ever sends (the bare request echo).
pub const MINIMAL_FRAME_LENGTH: u16 = 19;
/// Receive buffer size; a 24 cell status reply stays well below this.
pub const MAXIMUM_FRAME_SIZE: usize = 350;
/// Compile-time cell limit; replies reporting more cells are flagged, not decoded.
pub const MAXIMUM_NUMBER_OF_CELLS: usize = 24;

const TX_BUFFER_LENGTH: usize = 21;

/// 16-bit truncated additive checksum over `buffer`.
pub fn additive_checksum(buffer: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for b in buffer {
        checksum = checksum.wrapping_add(*b as u16);
    }
    checksum
}

/// Builds the 21-byte "read all data" request frame.
///
/// Function 6 = read all data, source 3 = PC, transport 0 = request.
pub fn status_request() -> [u8; TX_BUFFER_LENGTH] {
    let mut tx_buffer = [0; TX_BUFFER_LENGTH];
    tx_buffer[0] = FRAME_START_BYTE_0;
    tx_buffer[1] = FRAME_START_BYTE_1;
    tx_buffer[3] = 0x13; // declared length, bytes 2..end
    tx_buffer[8] = 0x06; // function: read all data
    tx_buffer[9] = 0x03; // source: PC
    tx_buffer[16] = FRAME_END_BYTE;
    let checksum = additive_checksum(&tx_buffer[..TX_BUFFER_LENGTH - 2]);
    tx_buffer[TX_BUFFER_LENGTH - 2..].copy_from_slice(&checksum.to_be_bytes());
    tx_buffer
}

/// Decodes the sign-magnitude current field: bit 15 set (or an all-zero
/// field) means charging, giving the non-negative 15-bit magnitude; clear
/// means discharging, giving the negated magnitude. Unit is 10 mA.
pub fn decode_current(raw: u16) -> i16 {
    if raw == 0 || raw & 0x8000 != 0 {
        (raw & 0x7FFF) as i16
    } else {
        -(raw as i16)
    }
}

/// Decodes the temperature offset code: values up to 100 are degrees
/// Celsius as-is, values above 100 encode negative degrees as `100 - raw`.
pub fn decode_temperature(raw: u16) -> i16 {
    if raw <= 100 {
        raw as i16
    } else {
        100 - raw as i16
    }
}

/// Result of feeding one byte into the [`FrameReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// More bytes are needed.
    Pending,
    /// A structurally valid frame with a correct checksum is in the buffer.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    StartMarker0,
    StartMarker1,
    LengthHigh,
    LengthLow,
    Body,
    ChecksumHigh,
    ChecksumLow,
    Complete,
}

/// Incremental receiver for one BMS reply frame.
///
/// Feed every byte of the stream in order via [`FrameReceiver::consume`].
/// On any error the partially filled buffer must be discarded with
/// [`FrameReceiver::reset`] before resuming; resynchronization to the next
/// start marker is the caller's concern.
pub struct FrameReceiver {
    buffer: [u8; MAXIMUM_FRAME_SIZE],
    index: usize,
    /// Declared frame length, known once byte 3 has been consumed.
    length: usize,
    state: ReceiverState,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self {
            buffer: [0; MAXIMUM_FRAME_SIZE],
            index: 0,
            length: 0,
            state: ReceiverState::StartMarker0,
        }
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.length = 0;
        self.state = ReceiverState::StartMarker0;
    }

    /// The completed frame, `declared length + 2` bytes. Empty unless the
    /// last [`FrameReceiver::consume`] returned [`FrameProgress::Complete`].
    pub fn frame(&self) -> &[u8] {
        if self.state == ReceiverState::Complete {
            &self.buffer[..self.length + 2]
        } else {
            &[]
        }
    }

    pub fn consume(&mut self, byte: u8) -> Result<FrameProgress, Error> {
        if self.index >= MAXIMUM_FRAME_SIZE {
            return Err(Error::FrameLength(self.length as u16));
        }
        self.buffer[self.index] = byte;

        match self.state {
            ReceiverState::StartMarker0 => {
                if byte != FRAME_START_BYTE_0 {
                    return Err(Error::StartMarker {
                        index: self.index,
                        byte,
                    });
                }
                self.state = ReceiverState::StartMarker1;
            }
            ReceiverState::StartMarker1 => {
                if byte != FRAME_START_BYTE_1 {
                    return Err(Error::StartMarker {
                        index: self.index,
                        byte,
                    });
                }
                self.state = ReceiverState::LengthHigh;
            }
            ReceiverState::LengthHigh => {
                self.state = ReceiverState::LengthLow;
            }
            ReceiverState::LengthLow => {
                let length = u16::from_be_bytes([self.buffer[2], byte]);
                if length < MINIMAL_FRAME_LENGTH || length as usize + 2 > MAXIMUM_FRAME_SIZE {
                    return Err(Error::FrameLength(length));
                }
                self.length = length as usize;
                self.state = ReceiverState::Body;
            }
            ReceiverState::Body => {
                if self.index == self.length - 3 && byte != FRAME_END_BYTE {
                    return Err(Error::EndMarker {
                        index: self.index,
                        byte,
                    });
                }
                if self.index == self.length - 1 {
                    self.state = ReceiverState::ChecksumHigh;
                }
            }
            ReceiverState::ChecksumHigh => {
                self.state = ReceiverState::ChecksumLow;
            }
            ReceiverState::ChecksumLow => {
                // The two bytes before the transmitted checksum are the
                // reserved high half of the 4-byte checksum field and are
                // not part of the sum.
                let computed = additive_checksum(&self.buffer[..self.length - 2]);
                let received = u16::from_be_bytes([self.buffer[self.length], byte]);
                if computed != received {
                    return Err(Error::Checksum { computed, received });
                }
                self.state = ReceiverState::Complete;
                self.index += 1;
                return Ok(FrameProgress::Complete);
            }
            ReceiverState::Complete => {
                // A completed frame must be consumed and the receiver reset
                // before more bytes arrive.
                return Err(Error::StartMarker {
                    index: self.index,
                    byte,
                });
            }
        }
        self.index += 1;
        Ok(FrameProgress::Pending)
    }
}

/// Battery cell chemistry reported by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Chemistry {
    LithiumIronPhosphate,
    LithiumIon,
}

impl Chemistry {
    fn from_code(code: u8) -> Self {
        match code {
            0 => Chemistry::LithiumIronPhosphate,
            1 => Chemistry::LithiumIon,
            _ => {
                log::warn!("Unknown battery type code {}, assuming LFP", code);
                Chemistry::LithiumIronPhosphate
            }
        }
    }
}

impl fmt::Display for Chemistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Chemistry::LithiumIronPhosphate => write!(f, "LiFePO4"),
            Chemistry::LithiumIon => write!(f, "Li-ion"),
        }
    }
}

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Alarm bitmask from field token 0x8B.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Alarms(pub u16);

impl Alarms {
    pub const NUMBER_OF_DEFINED_BITS: usize = 14;
    /// Bit 2, raised when the pack reaches its charge voltage limit.
    pub const CHARGE_OVERVOLTAGE: u16 = 1 << 2;

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn low_capacity(&self) -> bool {
        read_bit!(self.0, 0)
    }
    pub fn mosfet_overtemperature(&self) -> bool {
        read_bit!(self.0, 1)
    }
    pub fn charge_overvoltage(&self) -> bool {
        read_bit!(self.0, 2)
    }
    pub fn discharge_undervoltage(&self) -> bool {
        read_bit!(self.0, 3)
    }
    pub fn sensor_overtemperature(&self) -> bool {
        read_bit!(self.0, 4)
    }
    pub fn charge_overcurrent(&self) -> bool {
        read_bit!(self.0, 5)
    }
    pub fn discharge_overcurrent(&self) -> bool {
        read_bit!(self.0, 6)
    }
    pub fn cell_voltage_difference(&self) -> bool {
        read_bit!(self.0, 7)
    }
    pub fn sensor2_overtemperature(&self) -> bool {
        read_bit!(self.0, 8)
    }
    pub fn sensor_low_temperature(&self) -> bool {
        read_bit!(self.0, 9)
    }
    pub fn cell_overvoltage(&self) -> bool {
        read_bit!(self.0, 10)
    }
    pub fn cell_undervoltage(&self) -> bool {
        read_bit!(self.0, 11)
    }
}

/// BMS status bitmask from field token 0x8C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusBits(pub u16);

impl StatusBits {
    pub fn charge_mosfet_active(&self) -> bool {
        read_bit!(self.0, 0)
    }
    pub fn discharge_mosfet_active(&self) -> bool {
        read_bit!(self.0, 1)
    }
    pub fn balancer_active(&self) -> bool {
        read_bit!(self.0, 2)
    }
    pub fn battery_down(&self) -> bool {
        read_bit!(self.0, 3)
    }
}

/// Sequential reader for the token-tagged fields of a reply body.
struct FieldReader<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buffer: &'a [u8], pos: usize) -> Self {
        Self { buffer, pos }
    }

    fn token(&mut self, expected: u8) -> Result<(), Error> {
        let found = self.read_u8()?;
        if found != expected {
            return Err(Error::FieldToken {
                index: self.pos - 1,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self
            .buffer
            .get(self.pos)
            .ok_or(Error::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes([self.read_u8()?, self.read_u8()?]))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes([
            self.read_u8()?,
            self.read_u8()?,
            self.read_u8()?,
            self.read_u8()?,
        ]))
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let end = self.pos + N;
        let slice = self
            .buffer
            .get(self.pos..end)
            .ok_or(Error::Truncated(self.pos))?;
        let mut out = [0; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), Error> {
        if self.pos + n > self.buffer.len() {
            return Err(Error::Truncated(self.pos));
        }
        self.pos += n;
        Ok(())
    }
}

/// Decoded status reply, all fields in host byte order and raw BMS units.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusReply {
    pub temperature_mosfet: i16,
    pub temperature_sensor1: i16,
    pub temperature_sensor2: i16,
    /// Pack voltage in 10 mV units.
    pub battery_10mv: u16,
    /// Load current in 10 mA units, charging positive.
    pub current_10ma: i16,
    /// The BMS's own SOC estimate; the bridge recomputes its own, see soc.rs.
    pub bms_soc_percent: u8,
    pub temperature_sensor_count: u8,
    pub cycles: u16,
    pub total_cycle_capacity: u32,
    pub configured_cell_count: u16,
    pub alarms: Alarms,
    pub status: StatusBits,
    pub battery_overvoltage_10mv: u16,
    pub battery_undervoltage_10mv: u16,
    pub cell_overvoltage_mv: u16,
    pub cell_overvoltage_recovery_mv: u16,
    pub cell_overvoltage_delay_s: u16,
    pub cell_undervoltage_mv: u16,
    pub cell_undervoltage_recovery_mv: u16,
    pub cell_undervoltage_delay_s: u16,
    pub cell_difference_protection_mv: u16,
    pub discharge_overcurrent_a: u16,
    pub discharge_overcurrent_delay_s: u16,
    pub charge_overcurrent_a: u16,
    pub charge_overcurrent_delay_s: u16,
    pub balance_start_mv: u16,
    pub balance_difference_mv: u16,
    pub balancer_enabled: bool,
    pub total_capacity_ah: u32,
    pub charging_enabled: bool,
    pub discharging_enabled: bool,
    pub chemistry: Chemistry,
    pub low_capacity_alarm_percent: u8,
    pub device_id: [u8; 8],
    pub manufacture_date: [u8; 4],
    pub working_minutes: u32,
    pub software_version: [u8; 15],
    pub actual_capacity_ah: u32,
    pub manufacturer_id: [u8; 24],
    pub record_number: u32,
    /// Cell voltages in reported order, mV. Entries past `cell_count` are zero.
    pub cell_millivolt: [u16; MAXIMUM_NUMBER_OF_CELLS],
    pub cell_count: usize,
    /// The reply reported more cells than fit; `cell_millivolt` is untouched.
    pub cell_overflow: bool,
}

impl StatusReply {
    /// Decodes a complete, checksum-validated frame as produced by
    /// [`FrameReceiver`].
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        // Header: start marker, length, BMS id, function, source, transport.
        // The data section starts at index 11 with the cell info token.
        let mut r = FieldReader::new(frame, 11);

        r.token(0x79)?;
        let section_bytes = r.read_u8()? as usize;
        let reported_cells = section_bytes / 3;
        let mut cell_millivolt = [0u16; MAXIMUM_NUMBER_OF_CELLS];
        let mut cell_count = 0;
        let cell_overflow = reported_cells > MAXIMUM_NUMBER_OF_CELLS;
        if cell_overflow {
            log::warn!(
                "Reply reports {} cells but this build supports {}, skipping cell data",
                reported_cells,
                MAXIMUM_NUMBER_OF_CELLS
            );
            r.skip(section_bytes)?;
        } else {
            for entry in cell_millivolt.iter_mut().take(reported_cells) {
                r.read_u8()?; // cell number, implied by position
                *entry = r.read_u16()?;
            }
            cell_count = reported_cells;
        }

        r.token(0x80)?;
        let temperature_mosfet = decode_temperature(r.read_u16()?);
        r.token(0x81)?;
        let temperature_sensor1 = decode_temperature(r.read_u16()?);
        r.token(0x82)?;
        let temperature_sensor2 = decode_temperature(r.read_u16()?);
        r.token(0x83)?;
        let battery_10mv = r.read_u16()?;
        r.token(0x84)?;
        let current_10ma = decode_current(r.read_u16()?);
        r.token(0x85)?;
        let bms_soc_percent = r.read_u8()?;
        r.token(0x86)?;
        let temperature_sensor_count = r.read_u8()?;
        r.token(0x87)?;
        let cycles = r.read_u16()?;
        r.token(0x89)?;
        let total_cycle_capacity = r.read_u32()?;
        r.token(0x8A)?;
        let configured_cell_count = r.read_u16()?;
        r.token(0x8B)?;
        let alarms = Alarms(r.read_u16()?);
        r.token(0x8C)?;
        let status = StatusBits(r.read_u16()?);
        r.token(0x8E)?;
        let battery_overvoltage_10mv = r.read_u16()?;
        r.token(0x8F)?;
        let battery_undervoltage_10mv = r.read_u16()?;
        r.token(0x90)?;
        let cell_overvoltage_mv = r.read_u16()?;
        r.token(0x91)?;
        let cell_overvoltage_recovery_mv = r.read_u16()?;
        r.token(0x92)?;
        let cell_overvoltage_delay_s = r.read_u16()?;
        r.token(0x93)?;
        let cell_undervoltage_mv = r.read_u16()?;
        r.token(0x94)?;
        let cell_undervoltage_recovery_mv = r.read_u16()?;
        r.token(0x95)?;
        let cell_undervoltage_delay_s = r.read_u16()?;
        r.token(0x96)?;
        let cell_difference_protection_mv = r.read_u16()?;
        r.token(0x97)?;
        let discharge_overcurrent_a = r.read_u16()?;
        r.token(0x98)?;
        let discharge_overcurrent_delay_s = r.read_u16()?;
        r.token(0x99)?;
        let charge_overcurrent_a = r.read_u16()?;
        r.token(0x9A)?;
        let charge_overcurrent_delay_s = r.read_u16()?;
        r.token(0x9B)?;
        let balance_start_mv = r.read_u16()?;
        r.token(0x9C)?;
        let balance_difference_mv = r.read_u16()?;
        r.token(0x9D)?;
        let balancer_enabled = r.read_u8()? != 0;
        r.token(0xAA)?;
        let total_capacity_ah = r.read_u32()?;
        r.token(0xAB)?;
        let charging_enabled = r.read_u8()? != 0;
        r.token(0xAC)?;
        let discharging_enabled = r.read_u8()? != 0;
        r.token(0xAF)?;
        let chemistry = Chemistry::from_code(r.read_u8()?);
        r.token(0xB1)?;
        let low_capacity_alarm_percent = r.read_u8()?;
        r.token(0xB4)?;
        let device_id = r.read_bytes::<8>()?;
        r.token(0xB5)?;
        let manufacture_date = r.read_bytes::<4>()?;
        r.token(0xB6)?;
        let working_minutes = r.read_u32()?;
        r.token(0xB7)?;
        let software_version = r.read_bytes::<15>()?;
        r.token(0xB9)?;
        let actual_capacity_ah = r.read_u32()?;
        r.token(0xBA)?;
        let manufacturer_id = r.read_bytes::<24>()?;

        // Trailer: record number, end marker, 4-byte checksum field.
        let record_number = r.read_u32()?;

        Ok(Self {
            temperature_mosfet,
            temperature_sensor1,
            temperature_sensor2,
            battery_10mv,
            current_10ma,
            bms_soc_percent,
            temperature_sensor_count,
            cycles,
            total_cycle_capacity,
            configured_cell_count,
            alarms,
            status,
            battery_overvoltage_10mv,
            battery_undervoltage_10mv,
            cell_overvoltage_mv,
            cell_overvoltage_recovery_mv,
            cell_overvoltage_delay_s,
            cell_undervoltage_mv,
            cell_undervoltage_recovery_mv,
            cell_undervoltage_delay_s,
            cell_difference_protection_mv,
            discharge_overcurrent_a,
            discharge_overcurrent_delay_s,
            charge_overcurrent_a,
            charge_overcurrent_delay_s,
            balance_start_mv,
            balance_difference_mv,
            balancer_enabled,
            total_capacity_ah,
            charging_enabled,
            discharging_enabled,
            chemistry,
            low_capacity_alarm_percent,
            device_id,
            manufacture_date,
            working_minutes,
            software_version,
            actual_capacity_ah,
            manufacturer_id,
            record_number,
            cell_millivolt,
            cell_count,
            cell_overflow,
        })
    }

    /// Device id as printable text.
    pub fn device_id_str(&self) -> String {
        String::from_utf8_lossy(&self.device_id).trim_end().into()
    }

    /// Software version as printable text.
    pub fn software_version_str(&self) -> String {
        String::from_utf8_lossy(&self.software_version)
            .trim_end()
            .into()
    }

    /// Manufacturer id as printable text.
    pub fn manufacturer_id_str(&self) -> String {
        String::from_utf8_lossy(&self.manufacturer_id)
            .trim_end()
            .into()
    }

    /// True while the BMS is still starting up (~16 s after power-on), when
    /// it reports SOC and cycle count as zero.
    pub fn is_starting(&self) -> bool {
        self.bms_soc_percent == 0 && self.cycles == 0
    }
}
