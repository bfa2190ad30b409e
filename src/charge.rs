//! Managed CCCV charging via the advertised charge current limit.
//!
//! Inverters follow the limit in the 0x351 frame, so shaping that value
//! shapes the charge: a warmup pause, a linear current ramp to 0.3C, a
//! constant current hold and a linear taper to zero once the pack is
//! nearly full. The controller never reads a clock, the caller passes a
//! monotonic millisecond timestamp into every call.

use crate::compute::ComputedSnapshot;
use crate::protocol::Chemistry;
use crate::soc::map_range;

/// A charge attempt shorter than this is treated as a fluke, not a charge.
const WARMUP_MILLIS: u64 = 120_000;
/// One controller tick; ramp and taper advance at this rate.
const TICK_MILLIS: u64 = 60_000;
/// Ticks from minimal current to the full ramp ceiling.
const RAMP_TICKS: i64 = 40;
/// Ticks from the ceiling down to zero during taper.
const TAPER_TICKS: i64 = 45;
/// Ceiling factor: capacity in Ah times this gives 0.3C in 100 mA units.
const CEILING_100MA_PER_AMPERE_HOUR: u32 = 3;
/// Bulk charging ends at this SOC, the taper takes over.
const BULK_CHARGE_SOC_LIMIT_PERCENT: u8 = 95;
/// Start attempts while already at a limit before charging is inhibited.
const MAXIMUM_FAILED_STARTS: u8 = 2;

const LFP_CHARGE_LIMIT_MV: u32 = 3450;
const LI_ION_CHARGE_LIMIT_MV: u32 = 4200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePhase {
    NotCharging,
    Warmup,
    RampUp,
    Hold,
    Taper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitCheck {
    Nothing,
    /// SOC limit reached, move to taper.
    Stop,
    /// Cell voltage close to the charge limit, shave the current.
    Reduce,
}

/// What the CAN side should advertise this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeAdvice {
    /// Charge current limit for the 0x351 frame, in 100 mA units.
    pub current_limit_100ma: u16,
    /// Repeated failed starts; the charge request frame must drop its
    /// charge enable flag until the next reset.
    pub inhibit_charging: bool,
}

#[derive(Debug, Clone)]
pub struct ChargeController {
    phase: ChargePhase,
    start_time_ms: u64,
    last_check_ms: u64,
    tick: i64,
    /// min(BMS charge overcurrent protection, 0.3C), in 100 mA units.
    ceiling_100ma: u16,
    /// Managed limit; `None` advertises the BMS's own protection value.
    managed_100ma: Option<u16>,
    failed_starts: u8,
    inhibit_charging: bool,
}

impl Default for ChargeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargeController {
    pub fn new() -> Self {
        Self {
            phase: ChargePhase::NotCharging,
            start_time_ms: 0,
            last_check_ms: 0,
            tick: 0,
            ceiling_100ma: 0,
            managed_100ma: None,
            failed_starts: 0,
            inhibit_charging: false,
        }
    }

    pub fn phase(&self) -> ChargePhase {
        self.phase
    }

    fn reset(&mut self) {
        if self.phase != ChargePhase::NotCharging {
            log::trace!("Reset charging parameters");
        }
        self.phase = ChargePhase::NotCharging;
        self.start_time_ms = 0;
        self.last_check_ms = 0;
        self.tick = 0;
        self.managed_100ma = None;
        // failed_starts survives so consecutive at-limit starts add up; a
        // clean start clears it.
        self.inhibit_charging = false;
    }

    fn limit_check(&self, s: &ComputedSnapshot) -> LimitCheck {
        // The BMS's coulomb-counted SOC decides the end of bulk charging;
        // the voltage-mapped value sags under charge current.
        if s.bms_soc_percent >= BULK_CHARGE_SOC_LIMIT_PERCENT {
            return LimitCheck::Stop;
        }
        let limit_mv = match s.chemistry {
            Chemistry::LithiumIronPhosphate => LFP_CHARGE_LIMIT_MV,
            Chemistry::LithiumIon => LI_ION_CHARGE_LIMIT_MV,
        };
        // 2% headroom over the measured maximum.
        if s.maximum_cell_mv as u32 * 102 / 100 > limit_mv {
            LimitCheck::Reduce
        } else {
            LimitCheck::Nothing
        }
    }

    fn ceiling(s: &ComputedSnapshot) -> u16 {
        let protection = s.charge_overcurrent_a as u32 * 10;
        let point_three_c = s.total_capacity_ah * CEILING_100MA_PER_AMPERE_HOUR;
        protection.min(point_three_c) as u16
    }

    /// Advances the controller by one poll and returns the limit to
    /// advertise. `now_ms` must be monotonic across calls.
    pub fn update(&mut self, s: &ComputedSnapshot, now_ms: u64) -> ChargeAdvice {
        let protection_100ma = s.charge_overcurrent_a * 10;

        if s.current_10ma <= 0 {
            self.reset();
            return self.advice(protection_100ma);
        }

        // The limit check runs at tick rate, between ticks it reports
        // nothing.
        let check_due = now_ms.saturating_sub(self.last_check_ms) >= TICK_MILLIS;
        let check = if check_due {
            self.limit_check(s)
        } else {
            LimitCheck::Nothing
        };

        if self.phase == ChargePhase::NotCharging {
            if check != LimitCheck::Nothing {
                // Charging started while already at a limit. A few of
                // those in a row and the pack is full enough that asking
                // the inverter to stop is the right call.
                self.failed_starts += 1;
                if self.failed_starts > MAXIMUM_FAILED_STARTS {
                    log::warn!("Repeated charge starts at limit, inhibiting charging");
                    self.inhibit_charging = true;
                    return self.advice(protection_100ma);
                }
            } else {
                self.failed_starts = 0;
            }
            self.start_time_ms = now_ms;
            self.ceiling_100ma = Self::ceiling(s);
            self.phase = ChargePhase::Warmup;
            log::trace!("Charge detected, ceiling {} x100mA", self.ceiling_100ma);
        }

        // Phase transitions, checked in order so a long gap between polls
        // can move through several phases in one call.
        if self.phase == ChargePhase::Warmup {
            if now_ms.saturating_sub(self.start_time_ms) < WARMUP_MILLIS {
                return self.advice(protection_100ma);
            }
            // Resume the ramp at the tick matching the current the
            // inverter already delivers.
            self.tick = map_range(
                s.current_10ma as i64 / 10,
                1,
                self.ceiling_100ma as i64,
                0,
                RAMP_TICKS,
            ) + 1;
            self.phase = ChargePhase::RampUp;
            log::trace!("Charge ramp starting at tick {}", self.tick);
        }
        if self.phase == ChargePhase::RampUp {
            let ramp_elapsed = (RAMP_TICKS as u64 + 1) * TICK_MILLIS;
            if now_ms.saturating_sub(self.start_time_ms) >= ramp_elapsed {
                self.phase = ChargePhase::Hold;
                self.tick = 0;
            }
        } else if self.phase == ChargePhase::Hold {
            match check {
                LimitCheck::Stop => {
                    self.phase = ChargePhase::Taper;
                    self.tick = 0;
                }
                LimitCheck::Reduce => {
                    if let Some(current) = self.managed_100ma.as_mut() {
                        *current = (*current as u32 * 98 / 100) as u16;
                    }
                }
                LimitCheck::Nothing => {}
            }
        }

        if now_ms.saturating_sub(self.last_check_ms) < TICK_MILLIS {
            return self.advice(protection_100ma);
        }
        self.last_check_ms = now_ms;

        match self.phase {
            ChargePhase::RampUp => {
                let ramped = map_range(self.tick, 0, RAMP_TICKS, 1, self.ceiling_100ma as i64);
                self.managed_100ma = Some((ramped as u16).min(self.ceiling_100ma));
                self.tick += 1;
            }
            ChargePhase::Hold => {
                self.tick += 1;
            }
            ChargePhase::Taper => {
                self.tick += 1;
                if check != LimitCheck::Reduce {
                    let tapered = map_range(
                        self.tick,
                        1,
                        TAPER_TICKS,
                        self.ceiling_100ma as i64,
                        0,
                    )
                    .max(0);
                    self.managed_100ma = Some(tapered as u16);
                }
                if self.managed_100ma == Some(0) {
                    log::trace!("End of charge");
                    self.reset();
                }
            }
            ChargePhase::NotCharging | ChargePhase::Warmup => {}
        }
        self.advice(protection_100ma)
    }

    fn advice(&self, protection_100ma: u16) -> ChargeAdvice {
        ChargeAdvice {
            current_limit_100ma: self.managed_100ma.unwrap_or(protection_100ma),
            inhibit_charging: self.inhibit_charging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Alarms, StatusBits};

    fn snapshot(current_10ma: i16, soc: u8) -> ComputedSnapshot {
        ComputedSnapshot {
            battery_10mv: 2650,
            current_10ma,
            soc_percent: soc,
            bms_soc_percent: soc,
            chemistry: Chemistry::LithiumIronPhosphate,
            alarms: Alarms(0),
            status: StatusBits(0b0011),
            temperature_mosfet: 30,
            temperature_sensor1: 28,
            temperature_sensor2: 29,
            temperature_maximum: 30,
            total_capacity_ah: 100,
            remaining_capacity_ah: soc as u32,
            voltage_volts: 26.5,
            current_amps: current_10ma as f32 / 100.0,
            power_watts: 26.5 * current_10ma as f32 / 100.0,
            charge_overcurrent_a: 25,
            discharge_overcurrent_a: 60,
            battery_overvoltage_10mv: 2760,
            battery_undervoltage_10mv: 2320,
            minimum_cell_mv: 3290,
            maximum_cell_mv: 3310,
            average_cell_mv: 3300,
            software_version_low: b'1',
            software_version_high: b'1',
            bms_is_starting: false,
        }
    }

    #[test]
    fn discharging_keeps_bms_limit() {
        let mut controller = ChargeController::new();
        let advice = controller.update(&snapshot(-500, 60), 0);
        assert_eq!(controller.phase(), ChargePhase::NotCharging);
        assert_eq!(advice.current_limit_100ma, 250);
        assert!(!advice.inhibit_charging);
    }

    #[test]
    fn warmup_before_ramp() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(500, 60), 0);
        assert_eq!(controller.phase(), ChargePhase::Warmup);
        // Still warming up, BMS limit stays in force.
        let advice = controller.update(&snapshot(500, 60), WARMUP_MILLIS - 1);
        assert_eq!(advice.current_limit_100ma, 250);
        assert_eq!(controller.phase(), ChargePhase::Warmup);

        controller.update(&snapshot(500, 60), WARMUP_MILLIS);
        assert_eq!(controller.phase(), ChargePhase::RampUp);
    }

    #[test]
    fn ramp_is_monotonic_and_capped() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(10, 60), 0);
        let mut now = WARMUP_MILLIS;
        let mut previous = 0;
        for _ in 0..RAMP_TICKS {
            let advice = controller.update(&snapshot(10, 60), now);
            assert!(advice.current_limit_100ma >= previous);
            // 0.3C of 100 Ah beats the 25 A protection value.
            assert!(advice.current_limit_100ma <= 250);
            previous = advice.current_limit_100ma;
            now += TICK_MILLIS;
        }
        assert!(previous > 1);
    }

    #[test]
    fn hold_after_ramp_window() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(10, 60), 0);
        controller.update(&snapshot(10, 60), WARMUP_MILLIS);
        let past_ramp = (RAMP_TICKS as u64 + 1) * TICK_MILLIS;
        controller.update(&snapshot(10, 60), past_ramp);
        assert_eq!(controller.phase(), ChargePhase::Hold);
    }

    #[test]
    fn soc_limit_starts_taper_and_taper_ends_in_reset() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(10, 60), 0);
        let mut now = (RAMP_TICKS as u64 + 1) * TICK_MILLIS;
        controller.update(&snapshot(10, 60), now);
        assert_eq!(controller.phase(), ChargePhase::Hold);

        now += TICK_MILLIS;
        controller.update(&snapshot(10, 96), now);
        assert_eq!(controller.phase(), ChargePhase::Taper);

        let mut last = u16::MAX;
        for _ in 0..TAPER_TICKS {
            now += TICK_MILLIS;
            let advice = controller.update(&snapshot(10, 96), now);
            assert!(advice.current_limit_100ma <= last || advice.current_limit_100ma == 250);
            last = advice.current_limit_100ma;
            if controller.phase() == ChargePhase::NotCharging {
                return; // taper reached zero and reset
            }
        }
        panic!("taper never finished");
    }

    #[test]
    fn taper_follows_bms_soc_not_voltage_soc() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(10, 60), 0);
        let mut now = (RAMP_TICKS as u64 + 1) * TICK_MILLIS;
        controller.update(&snapshot(10, 60), now);
        assert_eq!(controller.phase(), ChargePhase::Hold);

        // The voltage-mapped SOC alone does not end bulk charging.
        now += TICK_MILLIS;
        let mut s = snapshot(10, 60);
        s.soc_percent = 96;
        controller.update(&s, now);
        assert_eq!(controller.phase(), ChargePhase::Hold);

        now += TICK_MILLIS;
        let mut s = snapshot(10, 60);
        s.bms_soc_percent = 96;
        controller.update(&s, now);
        assert_eq!(controller.phase(), ChargePhase::Taper);
    }

    #[test]
    fn high_cell_voltage_reduces_hold_current() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(250, 60), 0);
        // One ramp tick so a managed limit is in place before holding.
        controller.update(&snapshot(250, 60), WARMUP_MILLIS);
        assert_eq!(controller.phase(), ChargePhase::RampUp);
        let mut now = (RAMP_TICKS as u64 + 1) * TICK_MILLIS;
        controller.update(&snapshot(250, 60), now);
        assert_eq!(controller.phase(), ChargePhase::Hold);
        now += TICK_MILLIS;
        let before = controller.update(&snapshot(250, 60), now);
        assert!(before.current_limit_100ma < 250);
        // 3400 mV * 1.02 exceeds the 3450 mV LFP limit.
        let mut hot = snapshot(250, 60);
        hot.maximum_cell_mv = 3400;
        now += TICK_MILLIS;
        let after = controller.update(&hot, now);
        assert_eq!(
            after.current_limit_100ma,
            before.current_limit_100ma * 98 / 100
        );
        assert_eq!(controller.phase(), ChargePhase::Hold);
    }

    #[test]
    fn repeated_starts_at_limit_inhibit_charging() {
        let mut controller = ChargeController::new();
        let mut now = TICK_MILLIS;
        for _ in 0..MAXIMUM_FAILED_STARTS {
            let advice = controller.update(&snapshot(10, 96), now);
            assert!(!advice.inhibit_charging);
            // Drop back to discharge so the next poll is a fresh start.
            controller.update(&snapshot(-10, 96), now);
            now += TICK_MILLIS;
        }
        let advice = controller.update(&snapshot(10, 96), now);
        assert!(advice.inhibit_charging);
    }

    #[test]
    fn reset_restores_bms_limit() {
        let mut controller = ChargeController::new();
        controller.update(&snapshot(10, 60), 0);
        controller.update(&snapshot(10, 60), WARMUP_MILLIS);
        controller.update(&snapshot(10, 60), WARMUP_MILLIS + TICK_MILLIS);
        let advice = controller.update(&snapshot(-10, 60), WARMUP_MILLIS + 2 * TICK_MILLIS);
        assert_eq!(controller.phase(), ChargePhase::NotCharging);
        assert_eq!(advice.current_limit_100ma, 250);
    }
}
