//! Tiered context management and flash save.

mod item;
mod manager;
mod policy;

pub use item::{
    ArchiveRef, CHARS_PER_TOKEN, ContextEntry, ContextItem, ContextTier, ItemKind,
    REFERENCE_OVERHEAD_TOKENS, estimate_tokens,
};
pub use manager::{AgentContextSnapshot, ContextManager, ContextSnapshot, FlashSaveResult};
pub use policy::{FlashSaveConfig, PromotionTier, TierPolicy};
