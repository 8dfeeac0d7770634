//! Chat-шаблоны промптов по архитектурам.
//!
//! Instruct-чекпойнты ожидают точную разметку диалога; «сырой» текст
//! без шаблона заметно деградирует качество ответов.

use lm_core::ArchType;

/// Обернуть сообщение пользователя в chat-шаблон архитектуры.
///
/// Шаблон заканчивается маркером начала ответа ассистента: генерация
/// продолжает именно реплику ассистента.
pub fn chat_prompt(arch: ArchType, user_message: &str) -> String {
    match arch {
        // ChatML-разметка Qwen: <|im_start|>/<|im_end|>
        ArchType::Qwen3 => format!(
            "<|im_start|>user\n{user_message}<|im_end|>\n<|im_start|>assistant\n"
        ),
        ArchType::Llama => format!("[INST] {user_message} [/INST]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qwen3_prompt_ends_with_assistant_marker() {
        let p = chat_prompt(ArchType::Qwen3, "Привет");
        assert!(p.starts_with("<|im_start|>user\n"));
        assert!(p.contains("Привет"));
        assert!(p.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_llama_prompt_uses_inst_markers() {
        let p = chat_prompt(ArchType::Llama, "hello");
        assert_eq!(p, "[INST] hello [/INST]");
    }
}
