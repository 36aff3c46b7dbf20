//! Prethink prediction prompt, result sanitizer, and injection block.
//!
//! Grounded in `core/prethink.py`: exact sanitize rules (fence stripping,
//! line-prefix stripping, 1-3 line cap, meaningful-character filter).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::voice::session::ChatMessage;

static MEANINGFUL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]").unwrap());
static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static LINE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\s]*[-*•\d.)(]+\s*").unwrap());

/// Build the prediction prompt from recent history, asking the LLM to guess
/// the user's next turn.
pub fn build_prethink_prompt(recent_history: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    for msg in recent_history {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }
        let role = if msg.role == "user" { "用户" } else { "助手" };
        lines.push(format!("{role}: {content}"));
    }
    let history_text = if lines.is_empty() {
        "（无）".to_string()
    } else {
        lines.join("\n")
    };

    format!(
        "你是对话预判助手。请基于最近对话，预测“用户下一轮最可能说什么”。\n\
         输出要求：\n\
         1. 仅输出 1-3 条预测，不要解释过程。\n\
         2. 每条一行，简洁中文，不要超过 40 字。\n\
         3. 不要编造新事实；若信息不足可给宽泛预测。\n\
         4. 不要输出 Markdown、代码块、标签或多余前缀。\n\n\
         最近对话：\n{history_text}\n\n请输出预测："
    )
}

/// Sanitize a raw LLM prediction into a short, usable hint: strip code
/// fences, strip bullet/numbered-list prefixes, keep only lines containing
/// at least one meaningful character, cap at 1-3 lines and `max_chars`.
pub fn sanitize_prethink_result(raw_text: &str, max_chars: usize) -> String {
    if raw_text.is_empty() {
        return String::new();
    }
    let max_chars = max_chars.max(60);

    let without_fences = FENCE_RE.replace_all(raw_text, "");
    let text = without_fences.replace('\r', "\n");
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let mut cleaned_lines = Vec::new();
    for line in text.split('\n') {
        let line = LINE_PREFIX_RE.replace(line.trim(), "").to_string();
        if line.is_empty() {
            continue;
        }
        if !MEANINGFUL_RE.is_match(&line) {
            continue;
        }
        cleaned_lines.push(line);
        if cleaned_lines.len() >= 3 {
            break;
        }
    }

    let cleaned = cleaned_lines.join("\n");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }
    if cleaned.chars().count() > max_chars {
        cleaned.chars().take(max_chars).collect::<String>()
    } else {
        cleaned.to_string()
    }
}

/// Wrap a stored hint as an internal-reference block for the prompt, marked
/// as not to be echoed and subordinate to whatever the user actually says.
pub fn build_prethink_injection_block(hint_text: &str) -> String {
    let hint = hint_text.trim();
    if hint.is_empty() {
        return String::new();
    }
    format!(
        "【内部参考-下一轮用户可能意图（可能不准确）】\n{hint}\n仅供内部推理，不得向用户复述；若与当前用户输入冲突，以当前输入为准。"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_fences_and_prefixes() {
        let raw = "```\n1. 你今天吃饭了吗\n- 你要去哪里\n```";
        let cleaned = sanitize_prethink_result(raw, 220);
        assert_eq!(cleaned, "你今天吃饭了吗\n你要去哪里");
    }

    #[test]
    fn sanitize_caps_at_three_lines() {
        let raw = (1..=5)
            .map(|i| format!("预测{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let cleaned = sanitize_prethink_result(&raw, 220);
        assert_eq!(cleaned.lines().count(), 3);
    }

    #[test]
    fn sanitize_caps_at_max_chars() {
        let raw = "a".repeat(500);
        let cleaned = sanitize_prethink_result(&raw, 60);
        assert_eq!(cleaned.chars().count(), 60);
    }

    #[test]
    fn sanitize_drops_lines_without_meaningful_chars() {
        let raw = "···\n有意义的一行";
        let cleaned = sanitize_prethink_result(raw, 220);
        assert_eq!(cleaned, "有意义的一行");
    }

    #[test]
    fn injection_block_empty_for_empty_hint() {
        assert_eq!(build_prethink_injection_block(""), "");
        assert_eq!(build_prethink_injection_block("   "), "");
    }
}
