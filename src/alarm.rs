use crate::protocol::Alarms;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One alarm bit of the 0x8B field, in bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Alarm {
    LowCapacity,
    PowerMosfetOvertemperature,
    ChargeOvervoltage,
    DischargeUndervoltage,
    SensorOvertemperature,
    ChargeOvercurrent,
    DischargeOvercurrent,
    CellVoltageDifference,
    Sensor2Overtemperature,
    SensorLowTemperature,
    CellOvervoltage,
    CellUndervoltage,
    Protection309A,
    Protection309B,
}

impl Alarm {
    const ALL: [Alarm; Alarms::NUMBER_OF_DEFINED_BITS] = [
        Alarm::LowCapacity,
        Alarm::PowerMosfetOvertemperature,
        Alarm::ChargeOvervoltage,
        Alarm::DischargeUndervoltage,
        Alarm::SensorOvertemperature,
        Alarm::ChargeOvercurrent,
        Alarm::DischargeOvercurrent,
        Alarm::CellVoltageDifference,
        Alarm::Sensor2Overtemperature,
        Alarm::SensorLowTemperature,
        Alarm::CellOvervoltage,
        Alarm::CellUndervoltage,
        Alarm::Protection309A,
        Alarm::Protection309B,
    ];
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Alarm::LowCapacity => "Low capacity",
            Alarm::PowerMosfetOvertemperature => "Power MOSFET overtemperature",
            Alarm::ChargeOvervoltage => "Battery is full",
            Alarm::DischargeUndervoltage => "Discharge undervoltage",
            Alarm::SensorOvertemperature => "Sensor overtemperature",
            Alarm::ChargeOvercurrent => "Charge overcurrent",
            Alarm::DischargeOvercurrent => "Discharge overcurrent",
            Alarm::CellVoltageDifference => "Cell voltage difference",
            Alarm::Sensor2Overtemperature => "Sensor 2 overtemperature",
            Alarm::SensorLowTemperature => "Sensor low temperature",
            Alarm::CellOvervoltage => "Cell overvoltage",
            Alarm::CellUndervoltage => "Cell undervoltage",
            Alarm::Protection309A => "309_A protection",
            Alarm::Protection309B => "309_B protection",
        };
        f.write_str(text)
    }
}

/// Tracks alarm transitions between polls.
///
/// Pack-full (charge overvoltage) on its own is a normal condition, not an
/// error. Anything else active makes the state an error.
#[derive(Debug, Clone, Default)]
pub struct AlarmTracker {
    mask: Alarms,
    /// Highest-numbered active alarm, kept for display.
    active: Option<Alarm>,
    just_changed: bool,
}

impl AlarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, alarms: Alarms) {
        if alarms == self.mask {
            return;
        }
        self.mask = alarms;
        self.just_changed = true;
        self.active = None;
        if alarms.any() {
            for (bit, alarm) in Alarm::ALL.iter().enumerate() {
                if alarms.0 >> bit & 1 != 0 {
                    self.active = Some(*alarm);
                }
            }
        }
    }

    pub fn active(&self) -> Option<Alarm> {
        self.active
    }

    /// True when any alarm other than plain pack-full is set.
    pub fn is_error(&self) -> bool {
        self.mask.any() && self.mask.0 != Alarms::CHARGE_OVERVOLTAGE
    }

    /// One-shot transition flag, cleared by reading it.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.just_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_highest_active_alarm() {
        let mut tracker = AlarmTracker::new();
        tracker.update(Alarms(1 << 0 | 1 << 10));
        assert_eq!(tracker.active(), Some(Alarm::CellOvervoltage));
        assert!(tracker.is_error());
    }

    #[test]
    fn pack_full_alone_is_not_an_error() {
        let mut tracker = AlarmTracker::new();
        tracker.update(Alarms(Alarms::CHARGE_OVERVOLTAGE));
        assert_eq!(tracker.active(), Some(Alarm::ChargeOvervoltage));
        assert!(!tracker.is_error());

        tracker.update(Alarms(Alarms::CHARGE_OVERVOLTAGE | 1 << 0));
        assert!(tracker.is_error());
    }

    #[test]
    fn change_flag_is_one_shot() {
        let mut tracker = AlarmTracker::new();
        tracker.update(Alarms(1 << 3));
        assert!(tracker.take_changed());
        assert!(!tracker.take_changed());

        // No transition, no flag.
        tracker.update(Alarms(1 << 3));
        assert!(!tracker.take_changed());

        tracker.update(Alarms(0));
        assert!(tracker.take_changed());
        assert_eq!(tracker.active(), None);
        assert!(!tracker.is_error());
    }

    #[test]
    fn alarm_text() {
        assert_eq!(Alarm::ChargeOvervoltage.to_string(), "Battery is full");
        assert_eq!(Alarm::Protection309B.to_string(), "309_B protection");
    }
}
