use crate::protocol::{StatusReply, MAXIMUM_NUMBER_OF_CELLS};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Balancing counters above this are halved, together with the rest of the
/// array, to keep recent behavior dominant. 43200 ticks is one day at a
/// 2 second poll interval.
const BALANCING_COUNT_DECAY_THRESHOLD: u32 = 43200;

/// Percentages are only recomputed once the counter sum exceeds this, so a
/// few samples of startup noise do not produce misleading numbers.
const BALANCING_COUNT_NOISE_FLOOR: u32 = 60;

/// Where a cell's voltage sits within the pack at the last poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellRank {
    Minimum,
    Maximum,
    #[default]
    Between,
}

#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellEntry {
    pub millivolt: u16,
    pub rank: CellRank,
}

/// Long-run balancing statistics per cell: how often each cell was the
/// pack minimum or maximum while the balancer was active.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellStatistics {
    pub minimum_counts: [u32; MAXIMUM_NUMBER_OF_CELLS],
    pub maximum_counts: [u32; MAXIMUM_NUMBER_OF_CELLS],
    pub minimum_percent: [u8; MAXIMUM_NUMBER_OF_CELLS],
    pub maximum_percent: [u8; MAXIMUM_NUMBER_OF_CELLS],
}

impl CellStatistics {
    fn accumulate(counts: &mut [u32], percents: &mut [u8], cells: &[CellEntry], rank: CellRank) {
        for (i, cell) in cells.iter().enumerate() {
            if cell.rank == rank {
                counts[i] += 1;
            }
        }
        let sum: u32 = counts.iter().sum();
        if sum > BALANCING_COUNT_NOISE_FLOOR {
            for (count, percent) in counts.iter().zip(percents.iter_mut()) {
                *percent = (*count * 100 / sum) as u8;
            }
        }
        if counts.iter().any(|c| *c > BALANCING_COUNT_DECAY_THRESHOLD) {
            for count in counts.iter_mut() {
                *count /= 2;
            }
        }
    }
}

/// Per-poll cell voltage summary plus the accumulated balancing statistics.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellInfoAggregator {
    pub cells: [CellEntry; MAXIMUM_NUMBER_OF_CELLS],
    pub cell_count: usize,
    pub minimum_index: usize,
    pub maximum_index: usize,
    pub minimum_millivolt: u16,
    pub maximum_millivolt: u16,
    pub average_millivolt: u16,
    /// Maximum minus minimum cell voltage.
    pub difference_millivolt: u16,
    pub statistics: CellStatistics,
    mismatch_logged: bool,
}

impl Default for CellInfoAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl CellInfoAggregator {
    pub fn new() -> Self {
        Self {
            cells: [CellEntry::default(); MAXIMUM_NUMBER_OF_CELLS],
            cell_count: 0,
            minimum_index: 0,
            maximum_index: 0,
            minimum_millivolt: 0,
            maximum_millivolt: 0,
            average_millivolt: 0,
            difference_millivolt: 0,
            statistics: CellStatistics::default(),
            mismatch_logged: false,
        }
    }

    /// Recomputes all per-poll values from a decoded reply.
    ///
    /// When the reply flagged a cell count overflow the previous cell state
    /// is kept, only the derived values over the stale voltages remain.
    pub fn update(&mut self, reply: &StatusReply) {
        if reply.cell_overflow {
            return;
        }
        self.cell_count = reply.cell_count;

        let mut minimum = u16::MAX;
        let mut maximum = 0u16;
        let mut sum: u32 = 0;
        let mut nonzero = 0u32;
        for i in 0..reply.cell_count {
            let mv = reply.cell_millivolt[i];
            self.cells[i].millivolt = mv;
            // During BMS startup cells read zero; they are excluded from
            // every derived figure, not just the average.
            if mv == 0 {
                continue;
            }
            if mv < minimum {
                minimum = mv;
                self.minimum_index = i;
            }
            if mv > maximum {
                maximum = mv;
                self.maximum_index = i;
            }
            sum += mv as u32;
            nonzero += 1;
        }
        if nonzero == 0 {
            self.minimum_millivolt = 0;
            self.maximum_millivolt = 0;
            self.average_millivolt = 0;
            self.difference_millivolt = 0;
            return;
        }
        self.minimum_millivolt = minimum;
        self.maximum_millivolt = maximum;
        self.average_millivolt = (sum / nonzero) as u16;
        self.difference_millivolt = maximum - minimum;

        for cell in self.cells[..reply.cell_count].iter_mut() {
            cell.rank = if cell.millivolt == minimum {
                CellRank::Minimum
            } else if cell.millivolt == maximum {
                CellRank::Maximum
            } else {
                CellRank::Between
            };
        }

        if reply.cell_count != reply.configured_cell_count as usize
            && !reply.is_starting()
            && !self.mismatch_logged
        {
            log::warn!(
                "BMS reports {} cell voltages but is configured for {}",
                reply.cell_count,
                reply.configured_cell_count
            );
            self.mismatch_logged = true;
        }

        // Statistics only make sense while the balancer is working on the
        // extremes.
        if reply.status.balancer_active() {
            let cells = &self.cells[..reply.cell_count];
            CellStatistics::accumulate(
                &mut self.statistics.minimum_counts,
                &mut self.statistics.minimum_percent,
                cells,
                CellRank::Minimum,
            );
            CellStatistics::accumulate(
                &mut self.statistics.maximum_counts,
                &mut self.statistics.maximum_percent,
                cells,
                CellRank::Maximum,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::ReplyBuilder;

    fn reply_with(cells_mv: Vec<u16>, status: u16) -> StatusReply {
        let frame = ReplyBuilder {
            cells_mv,
            status,
            ..Default::default()
        }
        .build();
        ReplyBuilder::receive(&frame).unwrap()
    }

    #[test]
    fn min_max_average_difference() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.update(&reply_with(vec![3300, 3250, 3350, 3300], 0b0011));
        assert_eq!(aggregator.minimum_millivolt, 3250);
        assert_eq!(aggregator.maximum_millivolt, 3350);
        assert_eq!(aggregator.minimum_index, 1);
        assert_eq!(aggregator.maximum_index, 2);
        assert_eq!(aggregator.average_millivolt, 3300);
        assert_eq!(aggregator.difference_millivolt, 100);
        assert_eq!(aggregator.cells[1].rank, CellRank::Minimum);
        assert_eq!(aggregator.cells[2].rank, CellRank::Maximum);
        assert_eq!(aggregator.cells[0].rank, CellRank::Between);
    }

    #[test]
    fn ties_rank_every_extreme_cell() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.update(&reply_with(vec![3250, 3250, 3350, 3350], 0b0011));
        assert_eq!(aggregator.cells[0].rank, CellRank::Minimum);
        assert_eq!(aggregator.cells[1].rank, CellRank::Minimum);
        assert_eq!(aggregator.cells[2].rank, CellRank::Maximum);
        assert_eq!(aggregator.cells[3].rank, CellRank::Maximum);
    }

    #[test]
    fn zero_cells_excluded_from_average() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.update(&reply_with(vec![0, 3300, 3300, 0], 0b0011));
        assert_eq!(aggregator.average_millivolt, 3300);
    }

    #[test]
    fn zero_cells_excluded_from_extremes_ranks_and_statistics() {
        let mut aggregator = CellInfoAggregator::new();
        // Startup frame with the balancer already active.
        aggregator.update(&reply_with(vec![0, 3300, 3302, 0], 0b0111));
        assert_eq!(aggregator.minimum_millivolt, 3300);
        assert_eq!(aggregator.maximum_millivolt, 3302);
        assert_eq!(aggregator.minimum_index, 1);
        assert_eq!(aggregator.maximum_index, 2);
        assert_eq!(aggregator.difference_millivolt, 2);
        assert_eq!(aggregator.average_millivolt, 3301);
        assert_eq!(aggregator.cells[0].rank, CellRank::Between);
        assert_eq!(aggregator.cells[3].rank, CellRank::Between);
        assert_eq!(aggregator.cells[1].rank, CellRank::Minimum);
        assert_eq!(aggregator.cells[2].rank, CellRank::Maximum);
        assert_eq!(aggregator.statistics.minimum_counts[0], 0);
        assert_eq!(aggregator.statistics.minimum_counts[1], 1);
        assert_eq!(aggregator.statistics.maximum_counts[2], 1);
    }

    #[test]
    fn statistics_only_grow_while_balancing() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.update(&reply_with(vec![3250, 3350], 0b0011));
        assert_eq!(aggregator.statistics.minimum_counts[0], 0);

        // balancer bit set
        aggregator.update(&reply_with(vec![3250, 3350], 0b0111));
        assert_eq!(aggregator.statistics.minimum_counts[0], 1);
        assert_eq!(aggregator.statistics.maximum_counts[1], 1);
        assert_eq!(aggregator.statistics.minimum_counts[1], 0);
    }

    #[test]
    fn percentages_wait_for_noise_floor() {
        let mut aggregator = CellInfoAggregator::new();
        for _ in 0..BALANCING_COUNT_NOISE_FLOOR {
            aggregator.update(&reply_with(vec![3250, 3350], 0b0111));
        }
        assert_eq!(aggregator.statistics.minimum_percent[0], 0);
        aggregator.update(&reply_with(vec![3250, 3350], 0b0111));
        assert_eq!(aggregator.statistics.minimum_percent[0], 100);
        assert_eq!(aggregator.statistics.maximum_percent[1], 100);
    }

    #[test]
    fn counters_halve_past_decay_threshold() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.statistics.minimum_counts[0] = BALANCING_COUNT_DECAY_THRESHOLD;
        aggregator.statistics.minimum_counts[1] = 100;
        aggregator.update(&reply_with(vec![3250, 3350], 0b0111));
        // The update pushed cell 0 past the threshold, halving the array.
        assert_eq!(
            aggregator.statistics.minimum_counts[0],
            (BALANCING_COUNT_DECAY_THRESHOLD + 1) / 2
        );
        assert_eq!(aggregator.statistics.minimum_counts[1], 50);
    }

    #[test]
    fn overflow_keeps_previous_cells() {
        let mut aggregator = CellInfoAggregator::new();
        aggregator.update(&reply_with(vec![3250, 3350], 0b0011));
        let frame = ReplyBuilder {
            cells_mv: vec![3000; MAXIMUM_NUMBER_OF_CELLS + 1],
            ..Default::default()
        }
        .build();
        let overflowed = ReplyBuilder::receive(&frame).unwrap();
        aggregator.update(&overflowed);
        assert_eq!(aggregator.cell_count, 2);
        assert_eq!(aggregator.minimum_millivolt, 3250);
    }
}
