//! 长期记忆：跨运行召回过往经验
//!
//! Dispatcher 在每个步骤开始前按步骤描述检索，运行结束后写入各 Agent 的执行摘要。
//! 当前实现为 InMemoryLongTerm（关键词重叠），可替换为向量库实现。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::warn;

/// 长期记忆 trait：写入与检索
pub trait LongTermMemory: Send + Sync {
    fn add(&self, text: &str);

    /// 按查询检索最相关的 k 条
    fn search(&self, query: &str, k: usize) -> Vec<String>;

    /// 是否启用（Noop 返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 未启用长期记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopLongTerm;

impl LongTermMemory for NoopLongTerm {
    fn add(&self, _text: &str) {}

    fn search(&self, _query: &str, _k: usize) -> Vec<String> {
        Vec::new()
    }

    fn enabled(&self) -> bool {
        false
    }
}

type Entry = (String, HashSet<String>);

/// 内存实现：按词重叠数排序，超出容量时淘汰最早的条目
#[derive(Debug, Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<Vec<Entry>>>,
    max_entries: usize,
}

/// 小写词集合（忽略单字符词）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LongTermMemory for InMemoryLongTerm {
    fn add(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Ok(mut store) = self.store.write() else {
            warn!("Long-term memory lock poisoned, dropping entry");
            return;
        };
        store.push((text.to_string(), tokenize_lower(text)));
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
    }

    fn search(&self, query: &str, k: usize) -> Vec<String> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let Ok(store) = self.store.read() else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, &String)> = store
            .iter()
            .map(|(text, doc_tokens)| (query_tokens.intersection(doc_tokens).count(), text))
            .filter(|(score, _)| *score > 0)
            .collect();
        // 稳定排序：同分时较早写入的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(k).map(|(_, t)| t.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_ranks_by_overlap() {
        let mem = InMemoryLongTerm::new(10);
        mem.add("Researcher summarized EV battery suppliers");
        mem.add("Editor polished the launch blog post");
        mem.add("Researcher compared battery chemistry costs");

        let hits = mem.search("battery chemistry research", 2);
        assert_eq!(hits[0], "Researcher compared battery chemistry costs");
        assert_eq!(hits.len(), 2);
        assert!(mem.search("unrelated words", 3).is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mem = InMemoryLongTerm::new(2);
        mem.add("alpha entry");
        mem.add("beta entry");
        mem.add("gamma entry");
        assert_eq!(mem.len(), 2);
        assert!(mem.search("alpha", 5).is_empty());
    }

    #[test]
    fn test_noop_is_disabled() {
        let mem = NoopLongTerm;
        mem.add("anything");
        assert!(!mem.enabled());
        assert!(mem.search("anything", 5).is_empty());
    }
}
