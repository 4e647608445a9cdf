//! Sliding window of snapshot periods.
//!
//! Every mutation a builder makes is also recorded in the current period's
//! change record `P`. Each prune opens a new period; once more than
//! `period_count` periods have closed, the oldest record is handed back so the
//! builder can subtract exactly what that period added.
//!
//! ```text
//!   period_count = 2
//!
//!   prune #1: [P0] P1          nothing expires
//!   prune #2: [P0 P1] P2       nothing expires
//!   prune #3: [P1 P2] P3       P0 expires
//! ```

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Window of per-period change records.
#[derive(Debug)]
pub struct PruneWindow<P> {
    period_count: usize,
    closed: VecDeque<P>,
    current: P,
    period: u64,
}

impl<P: Default> PruneWindow<P> {
    /// Create a window retaining `period_count` closed periods.
    ///
    /// A count of zero is a configuration error.
    pub fn new(period_count: usize) -> Result<Self> {
        if period_count == 0 {
            return Err(Error::InvalidConfig(
                "period count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            period_count,
            closed: VecDeque::with_capacity(period_count + 1),
            current: P::default(),
            period: 0,
        })
    }

    /// Change record of the open period.
    pub fn current_mut(&mut self) -> &mut P {
        &mut self.current
    }

    /// Index of the open period, starting at zero.
    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn period_count(&self) -> usize {
        self.period_count
    }

    /// Close the open period and return the record that fell out of the
    /// window, if any.
    pub fn advance(&mut self) -> Option<P> {
        self.closed.push_back(std::mem::take(&mut self.current));
        self.period += 1;
        if self.closed.len() > self.period_count {
            self.closed.pop_front()
        } else {
            None
        }
    }

    /// Closed records still inside the window, oldest first.
    pub fn retained(&self) -> impl Iterator<Item = &P> {
        self.closed.iter()
    }
}
