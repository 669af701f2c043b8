//! Tier decay and flash-save thresholds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::item::ContextTier;

/// Tier an item returns to when it is referenced again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionTier {
    #[default]
    Hot,
    Warm,
}

impl PromotionTier {
    pub fn tier(&self) -> ContextTier {
        match self {
            Self::Hot => ContextTier::Hot,
            Self::Warm => ContextTier::Warm,
        }
    }
}

impl fmt::Display for PromotionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tier().as_str())
    }
}

impl FromStr for PromotionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            _ => Err(format!("Invalid promotion tier: {}", s)),
        }
    }
}

/// Decay rules applied by the per-turn sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Unreferenced turns after which an item is COLD.
    pub cold_after_turns: u32,
    pub promote_to: PromotionTier,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            cold_after_turns: 3,
            promote_to: PromotionTier::Hot,
        }
    }
}

impl TierPolicy {
    /// Tier implied by the number of turns since the last reference.
    pub fn tier_for(&self, turns_unreferenced: u64) -> ContextTier {
        if turns_unreferenced == 0 {
            ContextTier::Hot
        } else if turns_unreferenced < u64::from(self.cold_after_turns.max(1)) {
            ContextTier::Warm
        } else {
            ContextTier::Cold
        }
    }

    /// Sweep result for an item: never moves toward HOT.
    pub fn decay(&self, current: ContextTier, turns_unreferenced: u64) -> ContextTier {
        current.max(self.tier_for(turns_unreferenced))
    }
}

/// When an agent's working set must be flash-saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSaveConfig {
    pub threshold_tokens: usize,
    pub max_tokens: usize,
}

impl Default for FlashSaveConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 144_000,
            max_tokens: 180_000,
        }
    }
}

impl FlashSaveConfig {
    pub fn should_flash_save(&self, footprint: usize) -> bool {
        footprint >= self.threshold_tokens
    }

    /// Footprint as a percentage of the configured maximum.
    pub fn usage_percentage(&self, footprint: usize) -> f64 {
        if self.max_tokens == 0 {
            return 100.0;
        }
        footprint as f64 / self.max_tokens as f64 * 100.0
    }
}
