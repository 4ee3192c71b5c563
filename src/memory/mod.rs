//! 记忆层：Token 预算、上下文窗口分配、长期记忆召回

pub mod context;
pub mod long_term;
pub mod token_budget;

pub use context::{ContextSettings, ContextSummary, ContextWindowManager};
pub use long_term::{InMemoryLongTerm, LongTermMemory, NoopLongTerm};
pub use token_budget::{
    CharHeuristic, ContextBudget, ContextSection, SectionKind, TokenCounter, TRUNCATION_MARKER,
};
