use arc_swap::ArcSwap;
use log::{debug, info};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

/// 单级通配符，恰好匹配一个标签
pub const WILDCARD: &str = "*";
/// 深度通配符，匹配零个或多个标签
pub const DEEP_WILDCARD: &str = "**";
/// 终止标记：到达此节点时域名可以结束
const TERMINAL: &str = "";

#[derive(Debug, Clone, Default)]
struct Node {
    children: HashMap<Box<str>, Node>,
}

impl Node {
    fn child(&self, label: &str) -> Option<&Node> {
        self.children.get(label)
    }

    fn is_terminal(&self) -> bool {
        self.children.is_empty() || self.children.contains_key(TERMINAL)
    }

    fn insert(&mut self, labels: &[&str]) {
        match labels.split_first() {
            None => {
                self.children.entry(TERMINAL.into()).or_default();
            }
            Some((label, rest)) => {
                self.children.entry((*label).into()).or_default().insert(rest);
            }
        }
    }

    /// `labels` 为倒序标签（顶级域名在前）
    fn matches(&self, labels: &[&str]) -> bool {
        if let Some(deep) = self.child(DEEP_WILDCARD) {
            if deep.is_terminal() {
                return true;
            }
            // "**" 出现在规则中间：吞掉任意数量的标签后继续匹配
            for skip in 0..=labels.len() {
                if deep.matches(&labels[skip..]) {
                    return true;
                }
            }
        }

        let (label, rest) = match labels.split_first() {
            Some(split) => split,
            None => return self.is_terminal(),
        };

        if label.is_empty() {
            return false;
        }

        if let Some(exact) = self.child(label) {
            if exact.matches(rest) {
                return true;
            }
        }

        match self.child(WILDCARD) {
            Some(wildcard) => wildcard.matches(rest),
            None => false,
        }
    }
}

/// 规范化域名：去掉首尾空白与结尾的点，统一小写
pub fn normalize_domain(domain: &str) -> Cow<'_, str> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

/// 后缀规则树
///
/// 标签倒序存储（顶级域名先匹配），支持：
/// - 精确匹配：`a.example.com`
/// - 单级通配：`*.example.com` 只匹配 `x.example.com`，不匹配 `x.y.example.com`
/// - 深度通配：`**.example.com` 匹配 `example.com` 及其所有子域名
#[derive(Debug, Clone, Default)]
pub struct SuffixRuleTree {
    root: Node,
    len: usize,
}

impl SuffixRuleTree {
    /// 从规则列表构建规则树，空规则被忽略
    pub fn build<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::default();
        for pattern in patterns {
            tree.insert(pattern.as_ref());
        }
        tree
    }

    /// 追加一条规则，返回是否真正插入
    pub fn insert(&mut self, pattern: &str) -> bool {
        let pattern = normalize_domain(pattern);
        if pattern.is_empty() {
            return false;
        }

        let labels: Vec<&str> = pattern.rsplit('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            debug!("忽略非法规则: {}", pattern);
            return false;
        }

        self.root.insert(&labels);
        self.len += 1;
        true
    }

    /// 检查域名是否命中规则树
    #[inline]
    pub fn matches(&self, domain: &str) -> bool {
        if self.root.children.is_empty() {
            return false;
        }

        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return false;
        }

        let labels: Vec<&str> = domain.rsplit('.').collect();
        self.root.matches(&labels)
    }

    /// 已插入的规则条数（含重复）
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 不可变的一段规则，保留原文以便合并时重建
#[derive(Debug)]
struct Segment {
    patterns: Vec<Box<str>>,
    tree: SuffixRuleTree,
}

impl Segment {
    fn build<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = SuffixRuleTree::default();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if tree.insert(pattern) {
                kept.push(normalize_domain(pattern).into());
            }
        }
        Self { patterns: kept, tree }
    }

    fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// 规则集某一时刻的快照
///
/// 由若干段组成，段大小从前往后严格递减（类似二进制计数器）；
/// 任一段命中即命中。
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    segments: Vec<Arc<Segment>>,
}

impl RuleSnapshot {
    pub fn matches(&self, domain: &str) -> bool {
        self.segments.iter().any(|s| s.tree.matches(domain))
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 追加一条规则后的新快照，旧快照不变
    ///
    /// 新规则自成一段，末尾两段不比前一段小时合并。每条规则至多被合并
    /// O(log n) 次，追加的均摊开销与已有规则数无关。
    fn with(&self, pattern: &str) -> Self {
        let mut segments = self.segments.clone();
        let single = Segment::build([pattern]);
        if single.len() == 0 {
            return Self { segments };
        }
        segments.push(Arc::new(single));

        while segments.len() >= 2 {
            let n = segments.len();
            if segments[n - 1].len() < segments[n - 2].len() {
                break;
            }
            let (Some(last), Some(prev)) = (segments.pop(), segments.pop()) else {
                break;
            };
            let merged = Segment::build(prev.patterns.iter().chain(last.patterns.iter()));
            segments.push(Arc::new(merged));
        }
        Self { segments }
    }
}

/// 可并发读取、写时复制的规则集
///
/// 读者通过 `load()` 拿到当前快照，追加规则时生成新快照再原子替换引用。
/// 读者永远看不到构建到一半的树。
pub struct RuleSet {
    name: &'static str,
    current: ArcSwap<RuleSnapshot>,
}

impl RuleSet {
    pub fn new<I, S>(name: &'static str, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = Self::build_snapshot(patterns);
        if !snapshot.is_empty() {
            info!("规则集 [{}] 加载 {} 条规则", name, snapshot.len());
        }
        Self {
            name,
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn empty(name: &'static str) -> Self {
        Self::new(name, std::iter::empty::<&str>())
    }

    fn build_snapshot<I, S>(patterns: I) -> RuleSnapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segment = Segment::build(patterns);
        let segments = if segment.len() == 0 { Vec::new() } else { vec![Arc::new(segment)] };
        RuleSnapshot { segments }
    }

    #[inline]
    pub fn matches(&self, domain: &str) -> bool {
        self.current.load().matches(domain)
    }

    /// 追加一条规则（动态学习到的规则走这里）
    pub fn append(&self, pattern: &str) {
        self.current.rcu(|current| current.with(pattern));
        debug!("规则集 [{}] 追加规则: {}", self.name, pattern);
    }

    /// 整体替换规则（重新加载）
    pub fn replace<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = Self::build_snapshot(patterns);
        info!("规则集 [{}] 重新加载 {} 条规则", self.name, snapshot.len());
        self.current.store(Arc::new(snapshot));
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(patterns: &[&str]) -> SuffixRuleTree {
        SuffixRuleTree::build(patterns.iter().copied())
    }

    #[test]
    fn test_exact_siblings() {
        let t = tree(&["a.wweir.cc", "b.wweir.cc"]);
        assert!(t.matches("a.wweir.cc"));
        assert!(!t.matches("c.wweir.cc"));
    }

    #[test]
    fn test_parent_and_child() {
        let t = tree(&["wweir.cc", "a.wweir.cc"]);
        assert!(t.matches("wweir.cc"));
        assert!(t.matches("a.wweir.cc"));
        assert!(!t.matches("b.wweir.cc"));
    }

    #[test]
    fn test_strict_parent_does_not_match() {
        let t = tree(&["a.wweir.cc"]);
        assert!(!t.matches("wweir.cc"));
        assert!(!t.matches("cc"));
    }

    #[test]
    fn test_single_wildcard_one_level() {
        let t = tree(&["wweir.cc", "a.wweir.cc", "*.wweir.cc"]);
        assert!(t.matches("b.wweir.cc"));
        assert!(t.matches("a.wweir.cc"));
        assert!(!t.matches("a.b.wweir.cc"));
    }

    #[test]
    fn test_single_wildcard_needs_a_label() {
        let t = tree(&["*.example.com"]);
        assert!(!t.matches("example.com"));
        assert!(!t.matches("notexample.com"));
        assert!(t.matches("a.example.com"));
    }

    #[test]
    fn test_deep_wildcards() {
        let t = tree(&["**.cc", "a.**.com", "**.wweir.*"]);
        assert!(t.matches("wweir.cc"));
        assert!(t.matches("a.b.wweir.cc"));
        assert!(!t.matches("b.fuzz.com"));
        assert!(t.matches("www.wweir.com"));
    }

    #[test]
    fn test_deep_wildcard_in_middle() {
        let t = tree(&["a.**.com"]);
        assert!(t.matches("a.com"));
        assert!(t.matches("a.x.com"));
        assert!(t.matches("a.x.y.com"));
        assert!(!t.matches("b.x.com"));
    }

    #[test]
    fn test_deep_wildcard_matches_bare_suffix() {
        let t = tree(&["**.github.com"]);
        assert!(t.matches("github.com"));
        assert!(t.matches("api.github.com"));
        assert!(t.matches("a.b.github.com"));
        assert!(!t.matches("gitlab.com"));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let t = tree(&["Example.Com", "*.GitHub.IO"]);
        assert!(t.matches("example.com"));
        assert!(t.matches("EXAMPLE.COM."));
        assert!(t.matches("user.github.io"));
        assert!(t.matches("USER.GITHUB.IO"));
    }

    #[test]
    fn test_empty_tree() {
        let t = tree(&[]);
        assert!(t.is_empty());
        assert!(!t.matches("example.com"));
        assert!(!t.matches(""));
    }

    #[test]
    fn test_invalid_patterns_ignored() {
        let t = tree(&["", "  ", "a..b.com"]);
        assert!(t.is_empty());
        assert!(!t.matches("a..b.com"));
    }

    #[test]
    fn test_rule_set_append_is_visible_and_old_snapshot_unchanged() {
        let set = RuleSet::new("test", ["a.wweir.cc"]);
        let before = set.snapshot();

        set.append("b.wweir.cc");

        assert!(set.matches("b.wweir.cc"));
        assert!(set.matches("a.wweir.cc"));
        assert!(!before.matches("b.wweir.cc"));
        assert!(before.matches("a.wweir.cc"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_rule_set_replace() {
        let set = RuleSet::new("test", ["a.wweir.cc"]);
        set.replace(["**.example.com"]);
        assert!(!set.matches("a.wweir.cc"));
        assert!(set.matches("www.example.com"));
    }

    #[test]
    fn test_append_keeps_few_segments() {
        let set = RuleSet::new("test", ["**.base.com"]);
        for i in 0..1000 {
            set.append(&format!("learned{}.com", i));
        }

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1001);
        // 段大小严格递减，段数不超过 log2(n) + 1
        assert!(snapshot.segment_count() <= 11, "{} segments", snapshot.segment_count());
        assert!(set.matches("learned0.com"));
        assert!(set.matches("learned999.com"));
        assert!(set.matches("x.base.com"));
        assert!(!set.matches("learned1000.com"));
    }

    #[test]
    fn test_append_ignores_invalid_pattern() {
        let set = RuleSet::empty("test");
        set.append("a..b.com");
        set.append("  ");
        assert!(set.is_empty());
        assert_eq!(set.snapshot().segment_count(), 0);
    }

    #[test]
    fn test_concurrent_readers_during_append() {
        let set = Arc::new(RuleSet::new("test", ["**.stable.com"]));
        let mut handles = Vec::new();

        for i in 0..4 {
            let set = Arc::clone(&set);
            handles.push(std::thread::spawn(move || {
                for j in 0..200 {
                    if i == 0 {
                        set.append(&format!("d{}.dyn.com", j));
                    }
                    assert!(set.matches("x.stable.com"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(set.matches("d199.dyn.com"));
    }
}
