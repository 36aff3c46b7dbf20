//! Composes the system prompt and renders chat history for the LLM adapter.
//!
//! Grounded in the original plugin's `build_system_prompt`, minus the
//! randomized personality-state/reply-style system (see DESIGN.md Open
//! Question #4) — this core carries one fixed persona plus the mandatory
//! hard output rules the avatar pipeline depends on.

use crate::config::PersonaConfig;
use crate::voice::session::ChatMessage;

const HARD_OUTPUT_RULES: &str = "\n请用简短的口语回答，适合语音合成。\n【输出格式硬性要求】\n1. 每条回复必须以情绪标签开头，格式严格为<emo:neutral|happy|sad|angry|shy|surprised>。\n2. 标签后只能输出“可直接朗读的台词正文”，不能输出任何动作、神态、旁白、舞台说明、心理描写。\n3. 严禁出现如：'(微笑)'、'[叹气]'、'*沉默*'、'（看向你）'、'她说/我想' 这类描述性文本。\n4. 若无法判断情绪，统一使用<emo:neutral>。\n5. 只输出“情绪标签 + 台词正文”，不要输出额外解释、注释、Markdown、代码块。";

/// Build the fixed system prompt: persona line + mandatory hard output
/// rules. Unlike the original, this does not randomize personality state
/// or reply style — see DESIGN.md Open Question #4.
pub fn build_system_prompt(persona: &PersonaConfig) -> String {
    let mut prompt = format!("你的名字是{}。", persona.bot_name);
    if !persona.alias.is_empty() {
        prompt.push_str(&format!("也有人叫你{}。", persona.alias));
    }
    prompt.push_str(HARD_OUTPUT_RULES);
    prompt
}

/// Label the recent-history rendering the way the original plugin does:
/// `用户`/assistant-name alternating lines, then a trailing `Assistant: `
/// cue for the model to continue.
pub fn render_history(history: &[ChatMessage], bot_name: &str) -> String {
    let mut rendered = String::new();
    for msg in history {
        let role_label = if msg.role == "user" { "用户" } else { bot_name };
        rendered.push_str(role_label);
        rendered.push_str(": ");
        rendered.push_str(&msg.content);
        rendered.push('\n');
    }
    rendered.push_str(bot_name);
    rendered.push_str(": ");
    rendered
}

/// Full prompt assembly: system prompt + optional prethink reference block
/// + rendered history, per spec §4.7.
pub fn build_full_prompt(
    persona: &PersonaConfig,
    prethink_injection_block: Option<&str>,
    history: &[ChatMessage],
) -> String {
    let mut prompt = build_system_prompt(persona);
    prompt.push_str("\n\n");
    if let Some(block) = prethink_injection_block {
        if !block.is_empty() {
            prompt.push_str(block);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(&render_history(history, &persona.bot_name));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_carries_hard_output_rules() {
        let persona = PersonaConfig {
            bot_name: "小美".to_string(),
            alias: String::new(),
        };
        let prompt = build_system_prompt(&persona);
        assert!(prompt.contains("小美"));
        assert!(prompt.contains("<emo:neutral>"));
        assert!(prompt.contains("Markdown"));
    }

    #[test]
    fn full_prompt_includes_injection_block_only_when_present() {
        let persona = PersonaConfig::default();
        let history = vec![ChatMessage {
            role: "user".to_string(),
            content: "你好".to_string(),
        }];
        let without = build_full_prompt(&persona, None, &history);
        assert!(!without.contains("内部参考"));
        let with = build_full_prompt(&persona, Some("【内部参考】提示"), &history);
        assert!(with.contains("内部参考"));
    }
}
