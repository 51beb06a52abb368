//! 分词：关键词语义索引使用
//!
//! 含 CJK 字符的文本走 jieba 搜索引擎模式；其余按非字母数字字符切分（迭代文本里常见 `key: value`、
//! JSON 片段，按空白切分会把标点粘在词上）。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some(c), None) => is_cjk(c),
        (Some(_), Some(_)) => token.chars().any(|c| c.is_alphanumeric()),
    }
}

/// 分词并转小写，过滤单字符（CJK 单字保留）与纯标点
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|s| s.to_lowercase())
            .filter(|s| keep(s))
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

pub fn overlap_score(a: &HashSet<String>, b: &HashSet<String>) -> usize {
    a.intersection(b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("observation: Paris is sunny, 21C.");
        assert!(tokens.contains(&"paris".to_string()));
        assert!(tokens.contains(&"sunny".to_string()));
        assert!(tokens.contains(&"observation".to_string()));
        assert!(!tokens.iter().any(|t| t.ends_with(':') || t.ends_with(',')));
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_contains_cjk() {
        assert!(contains_cjk("Hello 世界"));
        assert!(!contains_cjk("Hello World"));
    }

    #[test]
    fn test_similarity_scores() {
        let a = tokenize_to_set("Rust programming");
        let b = tokenize_to_set("Rust language");
        assert_eq!(overlap_score(&a, &b), 1);
        assert!(jaccard_similarity(&a, &b) > 0.0);
        assert_eq!(jaccard_similarity(&a, &HashSet::new()), 0.0);
    }
}
