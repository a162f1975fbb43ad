// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session context gap bookkeeping
//!
//! A TPM refuses to save a session context once the distance between the
//! oldest saved session and the newest would exceed `TPM_PT_CONTEXT_GAP_MAX`.
//! The sequence space is split into two halves by the most significant bit
//! of the gap range. When the sessions still living in the other half
//! outnumber the sequence numbers left in the current half, the oldest
//! sessions are reloaded and saved again so they move into the current half
//! before the module would have to refuse.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{other_half} sessions in the other half exceed the gap limit {gap_max}")]
pub struct GapInvariantViolation {
    pub other_half: u64,
    pub gap_max: u64,
}

#[derive(Debug, Clone)]
pub struct GapScheduler {
    last_session_sequence: u64,
    gap_msb_mask: u64,
    gap_max: u64,
}

impl GapScheduler {
    pub fn new(gap_max: u64) -> Self {
        Self {
            // The first session load wraps this to zero
            last_session_sequence: u64::MAX,
            gap_msb_mask: (gap_max + 1) >> 1,
            gap_max,
        }
    }

    pub fn gap_max(&self) -> u64 {
        self.gap_max
    }

    pub fn last_session_sequence(&self) -> u64 {
        self.last_session_sequence
    }

    /// Forget everything learned from the module's context counter
    pub fn reset(&mut self) {
        self.last_session_sequence = u64::MAX;
    }

    /// A session context was loaded; the next save will consume a number
    pub fn note_session_loaded(&mut self) {
        self.last_session_sequence = self.last_session_sequence.wrapping_add(1);
    }

    /// A session context was saved with `sequence`
    pub fn note_session_saved(&mut self, sequence: u64) {
        self.last_session_sequence = sequence;
    }

    fn in_current_half(&self, sequence: u64) -> bool {
        sequence & self.gap_msb_mask == self.last_session_sequence & self.gap_msb_mask
    }

    /// Sequence numbers left after the last one in the current half
    pub fn remaining_in_current_half(&self) -> u64 {
        let last = self.last_session_sequence;
        if last & self.gap_msb_mask != 0 {
            self.gap_max - (last & self.gap_max)
        } else {
            (self.gap_msb_mask - 1) - (last & (self.gap_msb_mask - 1))
        }
    }

    /// Number of saved sessions whose sequence number lies in the other half
    pub fn other_half_count(&self, sequences: &[u64]) -> u64 {
        sequences
            .iter()
            .filter(|seq| !self.in_current_half(**seq))
            .count() as u64
    }

    /// How many reload/save cycles must run before the next session load
    pub fn sessions_to_cycle(&self, sequences: &[u64]) -> Result<u64, GapInvariantViolation> {
        let other_half = self.other_half_count(sequences);
        if other_half > self.gap_max / 2 {
            return Err(GapInvariantViolation {
                other_half,
                gap_max: self.gap_max,
            });
        }
        if other_half != 0 && other_half >= self.remaining_in_current_half() {
            Ok(other_half)
        } else {
            Ok(0)
        }
    }

    /// Sequence number of the least recently saved session
    ///
    /// Searched in three phases: sessions in the current half newer than the
    /// last sequence number, then sessions in the other half, then sessions
    /// in the current half older than the last sequence number. Each phase
    /// picks the smallest sequence number it finds.
    pub fn find_oldest_session(&self, sequences: &[u64]) -> Option<u64> {
        let last = self.last_session_sequence;
        let phases: [&dyn Fn(u64) -> bool; 3] = [
            &|seq| self.in_current_half(seq) && seq > last,
            &|seq| !self.in_current_half(seq),
            &|seq| self.in_current_half(seq) && seq < last,
        ];
        phases
            .iter()
            .find_map(|phase| sequences.iter().copied().filter(|seq| phase(*seq)).min())
    }
}
