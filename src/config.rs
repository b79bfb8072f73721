//! Configuration surface: the in-process analogue of the env-var parser the
//! original project drives its `memtier` launcher with (out of scope here,
//! see `SPEC_FULL.md` Non-goals). Everything a caller can tune is validated
//! once, at `build()` time, rather than scattered through `assert!`s at use
//! sites the way `original_source/src/mtt_internals.c` does it.

use crate::error::{Result, TierError};
use crate::pagesizes::{BIGARY_PAGESIZE, TRACED_PAGESIZE};

/// Which tier facade backs a [`crate::tier::TierMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierPolicy {
    /// Split new allocations across tiers by a fixed fill ratio.
    StaticRatio,
    /// Route allocations by size against a (periodically adapted) threshold.
    DynamicThreshold,
    /// Delegate everything to the hotness-tracking migration engine.
    DataMovement,
}

/// Byte thresholds the migration engine enforces on the near tier's total
/// tracked size. `low <= soft <= hard`, all multiples of `TRACED_PAGESIZE`.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub low: usize,
    pub soft: usize,
    pub hard: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub policy: TierPolicy,
    pub limits: Limits,
    /// Target per-tier fill weights. For `StaticRatio`, one entry per
    /// tier. For `DynamicThreshold`, one entry per tier (`size_thresholds`
    /// has one fewer, since it only names the boundaries *between*
    /// tiers) -- the ratio the adapted thresholds converge toward.
    pub tier_ratios: Vec<u32>,
    pub size_thresholds: Vec<usize>,
    pub ranking_update_period_ms: u64,
    pub stale_touch_cutoff_ms: u64,
    pub hog_memory: bool,
}

pub struct ConfigBuilder {
    policy: TierPolicy,
    limits: Option<Limits>,
    tier_ratios: Vec<u32>,
    size_thresholds: Vec<usize>,
    ranking_update_period_ms: u64,
    stale_touch_cutoff_ms: u64,
    hog_memory: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            policy: TierPolicy::DataMovement,
            limits: None,
            tier_ratios: Vec::new(),
            size_thresholds: Vec::new(),
            ranking_update_period_ms: 1000,
            stale_touch_cutoff_ms: 1000,
            hog_memory: false,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: TierPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn limits(mut self, low: usize, soft: usize, hard: usize) -> Self {
        self.limits = Some(Limits { low, soft, hard });
        self
    }

    pub fn tier_ratios(mut self, ratios: Vec<u32>) -> Self {
        self.tier_ratios = ratios;
        self
    }

    pub fn size_thresholds(mut self, thresholds: Vec<usize>) -> Self {
        self.size_thresholds = thresholds;
        self
    }

    pub fn ranking_update_period_ms(mut self, ms: u64) -> Self {
        self.ranking_update_period_ms = ms;
        self
    }

    pub fn hog_memory(mut self, hog: bool) -> Self {
        self.hog_memory = hog;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !crate::pagesizes::check_correctness() {
            return Err(TierError::invalid(
                "TRACED_PAGESIZE/BIGARY_PAGESIZE are misconfigured relative to the system page size",
            ));
        }

        let limits = self.limits.unwrap_or(Limits {
            low: 0,
            soft: usize::MAX - usize::MAX % TRACED_PAGESIZE,
            hard: usize::MAX - usize::MAX % TRACED_PAGESIZE,
        });

        if !(limits.low <= limits.soft && limits.soft <= limits.hard) {
            return Err(TierError::invalid(
                "limits must satisfy low <= soft <= hard",
            ));
        }
        for (name, v) in [("low", limits.low), ("soft", limits.soft), ("hard", limits.hard)] {
            if v % TRACED_PAGESIZE != 0 {
                return Err(TierError::invalid(format!(
                    "{} limit is not a multiple of the traced page size",
                    name
                )));
            }
        }

        match self.policy {
            TierPolicy::StaticRatio => {
                if self.tier_ratios.is_empty() || self.tier_ratios.iter().all(|&r| r == 0) {
                    return Err(TierError::invalid(
                        "static-ratio policy requires at least one nonzero tier ratio",
                    ));
                }
            }
            TierPolicy::DynamicThreshold => {
                let mut sorted = self.size_thresholds.clone();
                sorted.sort_unstable();
                if sorted != self.size_thresholds {
                    return Err(TierError::invalid(
                        "size thresholds must be given in ascending order",
                    ));
                }
                if self.tier_ratios.len() != self.size_thresholds.len() + 1
                    || self.tier_ratios.iter().all(|&r| r == 0)
                {
                    return Err(TierError::invalid(
                        "dynamic-threshold policy requires one target tier_ratios entry per \
                         tier (size_thresholds.len() + 1), not all zero",
                    ));
                }
            }
            TierPolicy::DataMovement => {}
        }

        Ok(Config {
            policy: self.policy,
            limits,
            tier_ratios: self.tier_ratios,
            size_thresholds: self.size_thresholds,
            ranking_update_period_ms: self.ranking_update_period_ms,
            stale_touch_cutoff_ms: self.stale_touch_cutoff_ms,
            hog_memory: self.hog_memory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_order_limits() {
        let err = ConfigBuilder::new()
            .limits(TRACED_PAGESIZE * 4, TRACED_PAGESIZE * 2, TRACED_PAGESIZE * 8)
            .build()
            .unwrap_err();
        assert!(matches!(err, TierError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_misaligned_limits() {
        let err = ConfigBuilder::new().limits(1, 2, 3).build().unwrap_err();
        assert!(matches!(err, TierError::InvalidArgument(_)));
    }

    #[test]
    fn static_ratio_requires_nonzero_ratio() {
        let err = ConfigBuilder::new()
            .policy(TierPolicy::StaticRatio)
            .tier_ratios(vec![0, 0])
            .build()
            .unwrap_err();
        assert!(matches!(err, TierError::InvalidArgument(_)));
    }

    #[test]
    fn dynamic_threshold_requires_one_ratio_per_tier() {
        let err = ConfigBuilder::new()
            .policy(TierPolicy::DynamicThreshold)
            .size_thresholds(vec![64, 256])
            .tier_ratios(vec![1, 1])
            .build()
            .unwrap_err();
        assert!(matches!(err, TierError::InvalidArgument(_)));

        let ok = ConfigBuilder::new()
            .policy(TierPolicy::DynamicThreshold)
            .size_thresholds(vec![64, 256])
            .tier_ratios(vec![1, 1, 1])
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn default_data_movement_config_builds() {
        let cfg = ConfigBuilder::new()
            .limits(0, TRACED_PAGESIZE * 1024, TRACED_PAGESIZE * 2048)
            .build()
            .unwrap();
        assert_eq!(cfg.policy, TierPolicy::DataMovement);
        assert!(cfg.limits.low <= cfg.limits.soft);
    }

    #[test]
    fn bigary_pagesize_is_multiple_of_traced_pagesize() {
        assert_eq!(BIGARY_PAGESIZE % TRACED_PAGESIZE, 0);
    }
}
