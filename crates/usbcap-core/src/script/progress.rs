//! Progress ticks emitted while a script replays.
//!
//! A script is split into equal-width phases, one symbol per phase, and a
//! tick is emitted every `stride` descriptors. The firmware script spells
//! `USB`, the bitstream script `FPGA`.

use crate::protocol::constants::{
    BITSTREAM_TICK_STRIDE, BITSTREAM_TICK_SYMBOLS, FIRMWARE_TICK_STRIDE, FIRMWARE_TICK_SYMBOLS,
};

use super::ScriptKind;

/// Tick cadence and phase symbols for one script kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPlan {
    stride: usize,
    symbols: &'static [char],
}

impl ProgressPlan {
    pub const fn new(stride: usize, symbols: &'static [char]) -> Self {
        Self { stride, symbols }
    }

    pub fn for_kind(kind: ScriptKind) -> Self {
        match kind {
            ScriptKind::Firmware => Self::new(FIRMWARE_TICK_STRIDE, FIRMWARE_TICK_SYMBOLS),
            ScriptKind::Bitstream => Self::new(BITSTREAM_TICK_STRIDE, BITSTREAM_TICK_SYMBOLS),
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Symbol to print before issuing descriptor `index` of a script of
    /// length `len`, or `None` when no tick falls on this index.
    ///
    /// Phase width is clamped to 1 and the phase to the last one, so short
    /// scripts and lengths that do not divide evenly stay in range.
    pub fn symbol_at(&self, index: usize, len: usize) -> Option<char> {
        if self.stride == 0 || self.symbols.is_empty() || index % self.stride != 0 {
            return None;
        }
        let width = (len / self.symbols.len()).max(1);
        let phase = (index / width).min(self.symbols.len() - 1);
        Some(self.symbols[phase])
    }

    /// All ticks a full replay of `len` descriptors would print.
    pub fn render(&self, len: usize) -> String {
        (0..len).filter_map(|i| self.symbol_at(i, len)).collect()
    }
}
