//! Voltage based state of charge estimation.
//!
//! The BMS's own SOC tracking drifts badly on packs that rarely see a full
//! charge, so the state of charge reported on the CAN side is looked up
//! from the average cell voltage instead, with linear interpolation between
//! the breakpoints of a per-chemistry discharge curve.

use crate::protocol::Chemistry;

/// Returned when the voltage is outside the table, which in practice means
/// the pack is either deeply discharged or the reading is garbage.
const FALLBACK_SOC_PERCENT: u8 = 20;

const LFP_SOC_PERCENT: [u8; 15] = [0, 1, 5, 10, 14, 20, 30, 40, 50, 60, 70, 80, 90, 99, 100];
const LFP_MILLIVOLT: [u16; 15] = [
    2500, 2538, 2800, 3000, 3150, 3200, 3225, 3250, 3263, 3275, 3300, 3325, 3350, 3375, 3450,
];

const LI_ION_SOC_PERCENT: [u8; 21] = [
    0, 5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90, 95, 100,
];
const LI_ION_MILLIVOLT: [u16; 21] = [
    3000, 3062, 3123, 3177, 3238, 3300, 3362, 3423, 3477, 3538, 3600, 3662, 3723, 3777, 3838,
    3900, 3962, 4023, 4077, 4138, 4200,
];

/// Linear rescale of `value` from `[in_min, in_max]` to `[out_min, out_max]`
/// with truncating integer division.
pub fn map_range(value: i64, in_min: i64, in_max: i64, out_min: i64, out_max: i64) -> i64 {
    (value - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// Estimates the state of charge from the average cell voltage.
///
/// The first table entries describe the near-empty cliff where the curve
/// is too steep for a resting-voltage estimate to mean anything, so the
/// search starts above them.
pub fn estimate(chemistry: Chemistry, average_cell_mv: u16) -> u8 {
    let (soc, millivolt): (&[u8], &[u16]) = match chemistry {
        Chemistry::LithiumIronPhosphate => (&LFP_SOC_PERCENT, &LFP_MILLIVOLT),
        Chemistry::LithiumIon => (&LI_ION_SOC_PERCENT, &LI_ION_MILLIVOLT),
    };
    let mv = average_cell_mv;
    for i in 3..millivolt.len() - 1 {
        if mv >= millivolt[i] && mv <= millivolt[i + 1] {
            return map_range(
                mv as i64,
                millivolt[i] as i64,
                millivolt[i + 1] as i64,
                soc[i] as i64,
                soc[i + 1] as i64,
            ) as u8;
        }
    }
    FALLBACK_SOC_PERCENT
}
