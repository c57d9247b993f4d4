/*!
 * Construction options for a [Tape](crate::tape::Tape).
 */

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/**
 * Initial capacities and checks for a new tape.
 *
 * Capacities only avoid early reallocation, the tape grows as needed either way.
 *
 * ```
 * use easy_ad::config::TapeConfig;
 * use easy_ad::tape::Tape;
 * let tape = Tape::with_config(TapeConfig::default().records_capacity(1024));
 * assert_eq!(tape.depth(), 0);
 * ```
 */
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TapeConfig {
    pub records_capacity: usize,
    pub values_capacity: usize,
    pub cells_capacity: usize,
    /**
     * Whether to reject access from a thread other than the one that opened the
     * outermost frame. Defaults to true.
     */
    pub check_owner: bool,
}

impl Default for TapeConfig {
    fn default() -> Self {
        TapeConfig {
            records_capacity: 64,
            values_capacity: 64,
            cells_capacity: 64,
            check_owner: true,
        }
    }
}

impl TapeConfig {
    pub fn records_capacity(mut self, capacity: usize) -> Self {
        self.records_capacity = capacity;
        self
    }

    pub fn values_capacity(mut self, capacity: usize) -> Self {
        self.values_capacity = capacity;
        self
    }

    pub fn cells_capacity(mut self, capacity: usize) -> Self {
        self.cells_capacity = capacity;
        self
    }

    pub fn check_owner(mut self, check: bool) -> Self {
        self.check_owner = check;
        self
    }
}
