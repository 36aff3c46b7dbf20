//! Emotion tag parsing and heuristic inference driving the avatar state.
//!
//! Two paths feed the same closed emotion set: an explicit leading tag the
//! LLM is instructed to emit (`<emo:NAME>`, `[emotion:NAME]`, `【情绪:NAME】`),
//! or a keyword/punctuation heuristic when no tag is present.

use once_cell::sync::Lazy;
use regex::Regex;

/// The closed set of emotions the avatar understands.
pub const EMOTION_TYPES: [&str; 6] = ["neutral", "happy", "sad", "angry", "shy", "surprised"];

static EMO_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:\[(?:emotion|emo)\s*[:=]\s*([a-zA-Z_\p{Han}]+)\s*\]|<(?:emotion|emo)\s*[:=]\s*([a-zA-Z_\p{Han}]+)\s*>|【(?:情绪|emotion)\s*[:：]\s*([a-zA-Z_\p{Han}]+)\s*】)\s*",
    )
    .expect("static emotion tag regex")
});

fn alias_table() -> &'static [(&'static str, &'static str)] {
    &[
        ("neutral", "neutral"),
        ("calm", "neutral"),
        ("normal", "neutral"),
        ("平静", "neutral"),
        ("中性", "neutral"),
        ("普通", "neutral"),
        ("happy", "happy"),
        ("joy", "happy"),
        ("开心", "happy"),
        ("高兴", "happy"),
        ("愉快", "happy"),
        ("兴奋", "happy"),
        ("sad", "sad"),
        ("伤心", "sad"),
        ("难过", "sad"),
        ("失落", "sad"),
        ("沮丧", "sad"),
        ("angry", "angry"),
        ("mad", "angry"),
        ("生气", "angry"),
        ("愤怒", "angry"),
        ("恼火", "angry"),
        ("shy", "shy"),
        ("害羞", "shy"),
        ("脸红", "shy"),
        ("不好意思", "shy"),
        ("surprised", "surprised"),
        ("surprise", "surprised"),
        ("惊讶", "surprised"),
        ("震惊", "surprised"),
        ("吃惊", "surprised"),
    ]
}

/// Normalize any alias (English/Chinese, exact or substring match) to one of
/// the six canonical labels, defaulting to `default` when nothing matches.
pub fn normalize_emotion(value: Option<&str>, default: &str) -> String {
    let Some(raw) = value else {
        return default.to_string();
    };
    let key = raw.trim().to_lowercase();
    if key.is_empty() {
        return default.to_string();
    }
    for (alias, canonical) in alias_table() {
        if key == *alias {
            return canonical.to_string();
        }
    }
    for (alias, canonical) in alias_table() {
        if key.contains(alias) {
            return canonical.to_string();
        }
    }
    default.to_string()
}

/// Extract and strip a leading emotion tag, e.g. `"[emotion:happy] 你好"` ->
/// `(Some("happy"), "你好")`.
pub fn strip_leading_emotion_tag(text: &str) -> (Option<String>, String) {
    if text.is_empty() {
        return (None, String::new());
    }
    let Some(caps) = EMO_TAG_RE.captures(text) else {
        return (None, text.to_string());
    };
    let raw = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str());
    let emotion = normalize_emotion(raw, "neutral");
    let whole = caps.get(0).expect("capture 0 always matches");
    let cleaned = text[whole.end()..].to_string();
    (Some(emotion), cleaned)
}

const HAPPY_KEYWORDS: &[&str] = &[
    "开心", "高兴", "喜欢", "太棒", "哈哈", "嘿嘿", "喵~", "耶", "爱你",
];
const SAD_KEYWORDS: &[&str] = &["难过", "伤心", "呜", "哭", "失落", "抱抱", "委屈", "遗憾"];
const ANGRY_KEYWORDS: &[&str] = &["生气", "气死", "愤怒", "烦死", "讨厌", "火大", "别烦"];
const SHY_KEYWORDS: &[&str] = &["害羞", "脸红", "不好意思", "羞", "///", "*>_<*"];
const SURPRISED_KEYWORDS: &[&str] = &["哇", "诶", "居然", "真的吗", "不会吧", "惊", "震惊"];

/// Keyword + punctuation heuristic classification into the closed set.
pub fn infer_emotion(text: &str, default: &str) -> String {
    if text.is_empty() {
        return default.to_string();
    }
    let mut happy = 0i32;
    let mut sad = 0i32;
    let mut angry = 0i32;
    let mut shy = 0i32;
    let mut surprised = 0i32;

    let count_hits = |kws: &[&str]| kws.iter().filter(|kw| text.contains(*kw)).count() as i32;
    happy += count_hits(HAPPY_KEYWORDS) * 2;
    sad += count_hits(SAD_KEYWORDS) * 2;
    angry += count_hits(ANGRY_KEYWORDS) * 2;
    shy += count_hits(SHY_KEYWORDS) * 2;
    surprised += count_hits(SURPRISED_KEYWORDS) * 2;

    surprised += text.matches('？').count() as i32 + text.matches('?').count() as i32;
    happy += text.matches('~').count() as i32;
    happy += (text.matches('！').count() / 2) as i32 + (text.matches('!').count() / 2) as i32;

    let scores = [
        ("happy", happy),
        ("sad", sad),
        ("angry", angry),
        ("shy", shy),
        ("surprised", surprised),
    ];
    let (best_label, best_score) = scores
        .iter()
        .copied()
        .max_by_key(|(_, score)| *score)
        .expect("scores is non-empty");
    if best_score <= 0 {
        return default.to_string();
    }
    best_label.to_string()
}

/// Outcome of resolving a leading-emotion prefix from a streaming LLM reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadingPrefixResolution {
    /// A complete, valid tag was found; carries the canonical emotion and
    /// the text following the tag.
    Resolved(String, String),
    /// The accumulated prefix could still turn into a valid tag; wait for
    /// more characters before deciding.
    NeedMore,
    /// No tag is present (or never will be); `text` is passed through as-is.
    NoTag(String),
}

/// Safety caps from spec §4.6: commit `NoTag` rather than stalling forever
/// on a malformed or truncated tag.
pub const LEADING_PREFIX_MAX_CHUNKS: u32 = 6;
pub const LEADING_PREFIX_MAX_CHARS: usize = 80;

/// Resolve a possible leading emotion tag from the accumulated prefix of a
/// streamed LLM reply. Callers accumulate `prefix` across chunks and re-call
/// this until it stops returning `NeedMore` (or the safety cap in
/// `EmotionPrefixAccumulator` fires).
pub fn resolve_leading_emotion_prefix(prefix: &str) -> LeadingPrefixResolution {
    if prefix.is_empty() {
        return LeadingPrefixResolution::NeedMore;
    }

    let (tag_emotion, cleaned) = strip_leading_emotion_tag(prefix);
    if let Some(emotion) = tag_emotion {
        // strip_leading_emotion_tag only returns Some when a full tag matched.
        return LeadingPrefixResolution::Resolved(emotion, cleaned);
    }

    let stripped = prefix.trim_start();
    if stripped.is_empty() {
        return LeadingPrefixResolution::NeedMore;
    }

    let looks_incomplete = (stripped.starts_with("<emo") && !stripped.contains('>'))
        || (stripped.starts_with("[emo") && !stripped.contains(']'))
        || ((stripped.starts_with("【情绪") || stripped.starts_with("【emotion"))
            && !stripped.contains('】'));
    if looks_incomplete {
        return LeadingPrefixResolution::NeedMore;
    }

    LeadingPrefixResolution::NoTag(prefix.to_string())
}

/// Accumulates LLM chunks until a leading-tag decision can be made, applying
/// the 6-chunk/80-char safety cap from spec §4.6.
#[derive(Debug, Default)]
pub struct EmotionPrefixAccumulator {
    buffer: String,
    chunks_seen: u32,
}

impl EmotionPrefixAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one more chunk, returning the resolution once decided.
    pub fn push(&mut self, chunk: &str) -> LeadingPrefixResolution {
        self.buffer.push_str(chunk);
        self.chunks_seen += 1;

        let mut resolution = resolve_leading_emotion_prefix(&self.buffer);
        if matches!(resolution, LeadingPrefixResolution::NeedMore)
            && (self.chunks_seen >= LEADING_PREFIX_MAX_CHUNKS
                || self.buffer.chars().count() >= LEADING_PREFIX_MAX_CHARS)
        {
            resolution = LeadingPrefixResolution::NoTag(std::mem::take(&mut self.buffer));
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_tag_syntaxes() {
        for (input, expected_rest) in [
            ("[emotion:happy] rest", "rest"),
            ("<emo:sad> rest", "rest"),
            ("【情绪:开心】 rest", "rest"),
        ] {
            let (emotion, rest) = strip_leading_emotion_tag(input);
            assert!(emotion.is_some(), "failed on {input}");
            assert_eq!(rest, expected_rest);
        }
    }

    #[test]
    fn alias_table_normalizes_to_canonical() {
        assert_eq!(normalize_emotion(Some("开心"), "neutral"), "happy");
        assert_eq!(normalize_emotion(Some("joy"), "neutral"), "happy");
        assert_eq!(normalize_emotion(Some("unknown_word"), "neutral"), "neutral");
    }

    #[test]
    fn leading_prefix_waits_for_split_tag() {
        assert_eq!(
            resolve_leading_emotion_prefix("<emo:"),
            LeadingPrefixResolution::NeedMore
        );
        match resolve_leading_emotion_prefix("<emo:happy> 你好") {
            LeadingPrefixResolution::Resolved(e, rest) => {
                assert_eq!(e, "happy");
                assert_eq!(rest, "你好");
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn accumulator_commits_no_tag_after_cap() {
        let mut acc = EmotionPrefixAccumulator::new();
        let long_text = "a".repeat(90);
        let resolution = acc.push(&long_text);
        assert!(matches!(resolution, LeadingPrefixResolution::NoTag(_)));
    }

    #[test]
    fn accumulator_commits_no_tag_after_chunk_count() {
        let mut acc = EmotionPrefixAccumulator::new();
        let mut last = LeadingPrefixResolution::NeedMore;
        for _ in 0..6 {
            last = acc.push("x");
        }
        assert!(matches!(last, LeadingPrefixResolution::NoTag(_)));
    }

    #[test]
    fn infer_emotion_picks_highest_scoring_label() {
        assert_eq!(infer_emotion("我好开心啊,哈哈", "neutral"), "happy");
        assert_eq!(infer_emotion("没有任何关键词", "neutral"), "neutral");
    }
}
