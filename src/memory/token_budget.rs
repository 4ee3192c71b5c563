//! Token 预算控制
//!
//! 为 Agent 上下文设置 token 预算，各段落按优先级竞争：
//! 优先级 1（目标、待办）必保留，只在极端情况下截断；2-5 按优先级从低到高依次被截断或丢弃。

/// 每个 token 约对应的字符数（近似值）
pub const CHARS_PER_TOKEN: usize = 4;

/// 截断后追加的标记
pub const TRUNCATION_MARKER: &str = "\n[Content truncated to fit context window]\n";

/// Token 计数器：可替换为真实 tokenizer
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// 字符启发式：4 字符 ≈ 1 token
///
/// 只是近似值，对中文等非 ASCII 文本会明显低估。
#[derive(Debug, Default, Clone, Copy)]
pub struct CharHeuristic;

impl TokenCounter for CharHeuristic {
    fn count(&self, text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }
}

/// 一次上下文分配的 token 预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub total_tokens: usize,
    pub reserved_for_output: usize,
    pub reserved_for_system: usize,
}

impl ContextBudget {
    pub fn new(total_tokens: usize, reserved_for_output: usize, reserved_for_system: usize) -> Self {
        Self {
            total_tokens,
            reserved_for_output,
            reserved_for_system,
        }
    }

    /// 可用于上下文的 token 数
    pub fn available(&self) -> usize {
        self.total_tokens
            .saturating_sub(self.reserved_for_output)
            .saturating_sub(self.reserved_for_system)
    }
}

/// 上下文段落类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    /// 当前目标与原始请求
    Goal,
    /// 接下来的步骤
    Pending,
    /// 最近完成的步骤
    Completed,
    /// 工作记忆变量
    Variables,
    /// 长期记忆召回
    Memories,
    /// 上游 Agent 输出
    Upstream,
    /// 长期用户背景
    Telos,
}

impl SectionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SectionKind::Goal => "goal",
            SectionKind::Pending => "pending",
            SectionKind::Completed => "completed",
            SectionKind::Variables => "variables",
            SectionKind::Memories => "memories",
            SectionKind::Upstream => "upstream",
            SectionKind::Telos => "telos",
        }
    }

    /// 优先级（数字越小越重要）
    pub fn priority(&self) -> u8 {
        match self {
            SectionKind::Goal | SectionKind::Pending => 1,
            SectionKind::Completed => 2,
            SectionKind::Variables | SectionKind::Memories => 3,
            SectionKind::Upstream => 4,
            SectionKind::Telos => 5,
        }
    }

    pub fn truncatable(&self) -> bool {
        self.priority() > 1
    }

    /// 最终输出中的排列位置
    pub fn display_rank(&self) -> usize {
        *self as usize
    }
}

/// 带 token 计数的上下文段落
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSection {
    pub kind: SectionKind,
    pub content: String,
    pub tokens: usize,
}

impl ContextSection {
    pub fn new(kind: SectionKind, content: String, counter: &dyn TokenCounter) -> Self {
        let tokens = counter.count(&content);
        Self {
            kind,
            content,
            tokens,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }

    pub fn truncatable(&self) -> bool {
        self.kind.truncatable()
    }
}

/// 将段落截断到 max_tokens 以内
///
/// 以传入的计数器衡量结果（含截断标记），二分查找可保留的最长前缀；
/// 若截断点之前、且超过一半位置处有换行，则在该换行处截断。
pub fn truncate_section(
    section: &ContextSection,
    max_tokens: usize,
    counter: &dyn TokenCounter,
) -> ContextSection {
    if section.tokens <= max_tokens {
        return section.clone();
    }

    let bounds: Vec<usize> = section
        .content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(section.content.len()))
        .collect();
    let build = |keep: usize| cut_at_line(&section.content[..bounds[keep]], keep);

    let (mut lo, mut hi) = (0, bounds.len() - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if counter.count(&build(mid)) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    ContextSection::new(section.kind, build(lo), counter)
}

/// 保留前 keep 个字符，优先在后半段的最后一个换行处截断，并追加标记
fn cut_at_line(prefix: &str, keep: usize) -> String {
    let mut content = prefix.to_string();
    if let Some(pos) = content.rfind('\n') {
        if content[..pos].chars().count() * 2 > keep {
            content.truncate(pos);
        }
    }
    content.push_str(TRUNCATION_MARKER);
    content
}
