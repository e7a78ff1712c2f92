use relay_domain::{Message, ToolDefinition};

/// Deterministic token estimator. Implementations must be O(n) over
/// characters; LLM adapters typically forward their tokenizer here.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default ~4-characters-per-token heuristic.
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn count(&self, text: &str) -> usize {
        text.chars().count() / 4 + 1
    }
}

/// Fixed structural overhead per message (role, framing).
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Estimated tokens for one message, via its serialized form.
pub fn estimate_message_tokens(estimator: &dyn TokenEstimator, message: &Message) -> usize {
    let serialized = serde_json::to_string(&message.content).unwrap_or_default();
    estimator.count(&serialized) + PER_MESSAGE_OVERHEAD
}

/// Estimated tokens for a full request: system prompt + tool
/// definitions + every message.
pub fn estimate_request_tokens(
    estimator: &dyn TokenEstimator,
    system: &str,
    tools: &[ToolDefinition],
    messages: &[Message],
) -> usize {
    let mut total = estimator.count(system);
    for tool in tools {
        total += estimator.count(&tool.name);
        total += estimator.count(&tool.description);
        total += estimator.count(&tool.parameters.to_string());
    }
    for message in messages {
        total += estimate_message_tokens(estimator, message);
    }
    total
}
