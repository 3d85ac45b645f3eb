// =============================================================================
// Frame — tabular OHLCV + indicator columns indexed by UTC bar time
// =============================================================================
//
// Strategies consume a frame of named f64 columns sharing one time index.
// `prepare` adds indicator columns; signals read the last row by name.
// Column lengths always equal the index length.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::exchange::Candle;

#[derive(Debug, Clone, Default)]
pub struct Frame {
    index: Vec<DateTime<Utc>>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Frame {
    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut frame = Self {
            index: candles.iter().map(|c| c.ts).collect(),
            columns: BTreeMap::new(),
        };
        frame.set_column("open", candles.iter().map(|c| c.open).collect());
        frame.set_column("high", candles.iter().map(|c| c.high).collect());
        frame.set_column("low", candles.iter().map(|c| c.low).collect());
        frame.set_column("close", candles.iter().map(|c| c.close).collect());
        frame.set_column("volume", candles.iter().map(|c| c.volume).collect());
        frame
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.index.last().copied()
    }

    /// Insert or replace a column. Panics in debug builds if the length does
    /// not match the index; callers build columns from the same bar set.
    pub fn set_column(&mut self, name: &str, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.index.len(), "column {name} length mismatch");
        self.columns.insert(name.to_string(), values);
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn row(&self, idx: usize) -> Option<Row<'_>> {
        if idx < self.index.len() {
            Some(Row { frame: self, idx })
        } else {
            None
        }
    }

    pub fn last_row(&self) -> Option<Row<'_>> {
        self.len().checked_sub(1).and_then(|idx| self.row(idx))
    }
}

/// One bar of a frame, with column access by name.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    frame: &'a Frame,
    idx: usize,
}

impl Row<'_> {
    pub fn ts(&self) -> DateTime<Utc> {
        self.frame.index[self.idx]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.frame
            .columns
            .get(name)
            .and_then(|col| col.get(self.idx))
            .copied()
            .filter(|v| v.is_finite())
    }

    /// Missing or non-finite values read as the provided default.
    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).unwrap_or(default)
    }
}
