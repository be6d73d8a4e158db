//! Heap growth heuristics.
//!
//! After every cycle the limit is recomputed from the bytes marking found
//! live. Allocation past the limit starts the next collection.

/// Tuning of allocation-triggered collections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapGrowingConfig {
    /// The heap is never collected automatically below this many bytes.
    pub min_limit: usize,
    /// Live bytes after a cycle are multiplied by this factor to get the
    /// next limit.
    pub factor: f64,
}

impl Default for HeapGrowingConfig {
    fn default() -> Self {
        Self {
            min_limit: 4 * 1024 * 1024,
            factor: 1.5,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeapGrowing {
    config: Option<HeapGrowingConfig>,
    limit: usize,
}

impl HeapGrowing {
    /// `None` disables allocation-triggered collections.
    pub(crate) fn new(config: Option<HeapGrowingConfig>) -> Self {
        Self {
            limit: config.map_or(usize::MAX, |config| config.min_limit),
            config,
        }
    }

    pub(crate) const fn limit_reached(&self, allocated_bytes: usize) -> bool {
        allocated_bytes >= self.limit
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub(crate) fn update_limit(&mut self, live_bytes: usize) {
        let Some(config) = self.config else {
            return;
        };
        let scaled = (live_bytes as f64 * config.factor) as usize;
        self.limit = scaled.max(config.min_limit);
    }

    #[cfg(test)]
    pub(crate) const fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_triggers() {
        let growing = HeapGrowing::new(None);
        assert!(!growing.limit_reached(usize::MAX - 1));
    }

    #[test]
    fn test_limit_follows_live_bytes() {
        let mut growing = HeapGrowing::new(Some(HeapGrowingConfig {
            min_limit: 1000,
            factor: 2.0,
        }));
        assert!(growing.limit_reached(1000));
        assert!(!growing.limit_reached(999));

        growing.update_limit(4000);
        assert_eq!(growing.limit(), 8000);

        growing.update_limit(10);
        assert_eq!(growing.limit(), 1000);
    }
}
