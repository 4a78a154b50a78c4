//! Conversation memory bounded by a model's context window.

use std::collections::VecDeque;

use super::{CompressError, Compression};
use crate::config::ModelConfig;
use crate::text::estimate_tokens;
use crate::types::ChatMessage;

/// Token budget of one model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    /// Model context window
    pub context_window: u32,

    /// Tokens held back for the response
    pub reserved_output: u32,
}

impl ContextBudget {
    pub fn new(context_window: u32, reserved_output: u32) -> Self {
        Self {
            context_window,
            reserved_output,
        }
    }

    /// Budget for a configured model.
    pub fn for_model(model: &ModelConfig) -> Self {
        Self::new(model.context_window, model.max_output_tokens)
    }

    /// Tokens available for prompt, knowledge and history.
    pub fn safe_limit(&self) -> u32 {
        self.context_window.saturating_sub(self.reserved_output)
    }
}

/// Outcome of fitting history into the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FitReport {
    /// Messages evicted from the front of the history
    pub dropped_messages: usize,

    /// Tokens those messages held
    pub dropped_tokens: u32,

    /// Prompt, knowledge and remaining history combined
    pub total_tokens: u32,

    /// Headroom left under the safe limit
    pub remaining: u32,
}

/// FIFO conversation history that trims itself to a context budget.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    budget: ContextBudget,
    history: VecDeque<ChatMessage>,
    history_tokens: u32,
}

impl MemoryManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self {
            budget,
            history: VecDeque::new(),
            history_tokens: 0,
        }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    /// Append a message to the history.
    pub fn push(&mut self, message: ChatMessage) {
        self.history_tokens = self.history_tokens.saturating_add(message.token_count());
        self.history.push_back(message);
    }

    /// Messages in chronological order.
    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Estimated tokens held by the history.
    pub fn history_tokens(&self) -> u32 {
        self.history_tokens
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.history_tokens = 0;
    }

    /// Evict the oldest messages until prompt, knowledge and history fit.
    ///
    /// Fails without touching the history when the system prompt and
    /// knowledge alone exceed the safe limit.
    pub fn fit(&mut self, system_prompt: &str, knowledge_tokens: u32) -> Result<FitReport, CompressError> {
        let limit = self.budget.safe_limit();
        let fixed = estimate_tokens(system_prompt).saturating_add(knowledge_tokens);
        if fixed > limit {
            return Err(CompressError::BudgetExceeded {
                required: fixed,
                available: limit,
            });
        }

        let mut report = FitReport::default();
        while fixed.saturating_add(self.history_tokens) > limit {
            let Some(oldest) = self.history.pop_front() else {
                break;
            };
            let tokens = oldest.token_count();
            self.history_tokens = self.history_tokens.saturating_sub(tokens);
            report.dropped_messages += 1;
            report.dropped_tokens += tokens;
        }

        report.total_tokens = fixed + self.history_tokens;
        report.remaining = limit - report.total_tokens;

        if report.dropped_messages > 0 {
            tracing::debug!(
                dropped = report.dropped_messages,
                dropped_tokens = report.dropped_tokens,
                remaining = report.remaining,
                "History trimmed to fit context window"
            );
        }

        Ok(report)
    }

    /// Build the message list for a call: system prompt with the selected
    /// knowledge appended, followed by the trimmed history.
    pub fn assemble(&mut self, system_prompt: &str, knowledge: &Compression) -> Result<Vec<ChatMessage>, CompressError> {
        let system = if knowledge.is_empty() {
            system_prompt.to_string()
        } else {
            format!("{}\n\n{}", system_prompt, knowledge.render("\n\n"))
        };

        self.fit(&system, 0)?;

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(self.history.iter().cloned());
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::ScoredChunk;
    use crate::types::Chunk;

    fn message(tokens: u32) -> ChatMessage {
        ChatMessage::user("x".repeat(tokens as usize * 4))
    }

    #[test]
    fn test_safe_limit() {
        assert_eq!(ContextBudget::new(1000, 200).safe_limit(), 800);
        assert_eq!(ContextBudget::new(100, 200).safe_limit(), 0);
        let model = ModelConfig::new(1000, 1000);
        assert_eq!(
            ContextBudget::for_model(&model).safe_limit(),
            model.context_window - model.max_output_tokens
        );
    }

    #[test]
    fn test_fit_evicts_oldest_first() {
        let mut memory = MemoryManager::new(ContextBudget::new(100, 20));
        memory.push(ChatMessage::user("a".repeat(120))); // 30 tokens
        memory.push(message(30));
        memory.push(ChatMessage::assistant("b".repeat(120))); // 30 tokens

        let report = memory.fit("", 30).unwrap();
        assert_eq!(report.dropped_messages, 2);
        assert_eq!(report.dropped_tokens, 60);
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.history().next().unwrap().role, "assistant");
        assert_eq!(report.total_tokens, 60);
        assert_eq!(report.remaining, 20);
    }

    #[test]
    fn test_fit_without_pressure_keeps_everything() {
        let mut memory = MemoryManager::new(ContextBudget::new(1000, 100));
        memory.push(message(10));
        memory.push(message(10));
        let report = memory.fit("You are concise.", 50).unwrap();
        assert_eq!(report.dropped_messages, 0);
        assert_eq!(memory.history_tokens(), 20);
    }

    #[test]
    fn test_fixed_context_over_budget_fails() {
        let mut memory = MemoryManager::new(ContextBudget::new(100, 50));
        memory.push(message(5));
        let result = memory.fit("", 60);
        assert_eq!(
            result,
            Err(CompressError::BudgetExceeded {
                required: 60,
                available: 50
            })
        );
        // History untouched on failure
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_history_never_exceeds_limit() {
        let mut memory = MemoryManager::new(ContextBudget::new(200, 50));
        for i in 0..40 {
            memory.push(message(i % 7 + 1));
            let report = memory.fit("system prompt text", 40).unwrap();
            assert!(report.total_tokens <= 150);
        }
    }

    #[test]
    fn test_assemble_puts_knowledge_in_system_message() {
        let mut memory = MemoryManager::new(ContextBudget::new(1000, 100));
        memory.push(ChatMessage::user("What limits apply?"));

        let knowledge = Compression {
            selected: vec![ScoredChunk {
                chunk: Chunk::from_text(0, "Limit is 80k TPM."),
                score: 0.9,
            }],
            metrics: Default::default(),
        };

        let messages = memory.assemble("Answer briefly.", &knowledge).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.ends_with("Limit is 80k TPM."));
        assert_eq!(messages[1].content, "What limits apply?");
    }
}
