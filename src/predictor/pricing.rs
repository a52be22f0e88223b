//! Per-provider price tables and token counting.

use std::sync::{LazyLock, Mutex};
use tiktoken_rs::CoreBPE;

use super::ProviderKind;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub input: f64,
    pub output: f64,
}

const fn p(input: f64, output: f64) -> Price {
    Price { input, output }
}

const OPENAI: &[(&str, Price)] = &[
    ("gpt-4o-mini", p(0.15, 0.60)),
    ("gpt-4o", p(2.50, 10.00)),
    ("gpt-4.1-nano", p(0.10, 0.40)),
    ("gpt-4.1-mini", p(0.40, 1.60)),
    ("gpt-4.1", p(2.00, 8.00)),
    ("gpt-4-turbo", p(10.00, 30.00)),
    ("gpt-3.5-turbo", p(0.50, 1.50)),
    ("o3-mini", p(1.10, 4.40)),
    ("o1-mini", p(1.10, 4.40)),
    ("o1", p(15.00, 60.00)),
    ("text-embedding-3-small", p(0.02, 0.0)),
    ("text-embedding-3-large", p(0.13, 0.0)),
    ("text-embedding-ada-002", p(0.10, 0.0)),
];

const ANTHROPIC: &[(&str, Price)] = &[
    ("claude-3-haiku", p(0.25, 1.25)),
    ("claude-3-5-haiku", p(0.80, 4.00)),
    ("claude-3-5-sonnet", p(3.00, 15.00)),
    ("claude-3-7-sonnet", p(3.00, 15.00)),
    ("claude-sonnet-4", p(3.00, 15.00)),
    ("claude-3-opus", p(15.00, 75.00)),
    ("claude-opus-4", p(15.00, 75.00)),
];

const GOOGLE: &[(&str, Price)] = &[
    ("gemini-1.5-flash", p(0.075, 0.30)),
    ("gemini-1.5-pro", p(1.25, 5.00)),
    ("gemini-2.0-flash", p(0.10, 0.40)),
    ("gemini-2.5-pro", p(1.25, 10.00)),
    ("text-embedding-004", p(0.0, 0.0)),
];

const GROQ: &[(&str, Price)] = &[
    ("llama-3.1-8b-instant", p(0.05, 0.08)),
    ("llama-3.3-70b-versatile", p(0.59, 0.79)),
    ("mixtral-8x7b", p(0.24, 0.24)),
];

const DEEPSEEK: &[(&str, Price)] = &[
    ("deepseek-chat", p(0.27, 1.10)),
    ("deepseek-reasoner", p(0.55, 2.19)),
];

const XAI: &[(&str, Price)] = &[("grok-2", p(2.00, 10.00)), ("grok-3", p(3.00, 15.00))];

fn table(provider: ProviderKind) -> &'static [(&'static str, Price)] {
    match provider {
        ProviderKind::OpenAI => OPENAI,
        ProviderKind::Anthropic => ANTHROPIC,
        ProviderKind::Google => GOOGLE,
        ProviderKind::Groq => GROQ,
        ProviderKind::DeepSeek => DEEPSEEK,
        ProviderKind::XAI => XAI,
        ProviderKind::Ollama | ProviderKind::Phind => &[],
    }
}

/// Price of `model`, matched by the longest catalogued prefix.
pub fn price(provider: ProviderKind, model: &str) -> Option<Price> {
    table(provider)
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, price)| *price)
}

/// Whether `model` is one of the provider's catalogued models.
pub fn is_catalogued(provider: ProviderKind, model: &str) -> bool {
    price(provider, model).is_some()
}

pub fn cost(provider: ProviderKind, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match price(provider, model) {
        Some(price) => {
            input_tokens as f64 / 1_000_000.0 * price.input
                + output_tokens as f64 / 1_000_000.0 * price.output
        }
        None => 0.0,
    }
}

static ENCODER: LazyLock<Option<Mutex<CoreBPE>>> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().ok().map(Mutex::new));

/// Token count of `text` under `cl100k_base`, or a chars/4 estimate when the
/// encoder is unavailable.
pub fn count_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    if let Some(Ok(bpe)) = ENCODER.as_ref().map(|m| m.lock()) {
        return bpe.encode_with_special_tokens(text).len() as u64;
    }
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(price(ProviderKind::OpenAI, "gpt-4o-mini-2024-07-18"), Some(p(0.15, 0.60)));
        assert_eq!(price(ProviderKind::OpenAI, "gpt-4o-2024-08-06"), Some(p(2.50, 10.00)));
    }

    #[test]
    fn unknown_models_are_free_and_uncatalogued() {
        assert!(!is_catalogued(ProviderKind::OpenAI, "my-finetune"));
        assert_eq!(cost(ProviderKind::OpenAI, "my-finetune", 1000, 1000), 0.0);
        assert_eq!(cost(ProviderKind::Ollama, "llama3", 1000, 1000), 0.0);
    }

    #[test]
    fn cost_uses_per_million_rates() {
        let c = cost(ProviderKind::Anthropic, "claude-3-5-sonnet-latest", 1_000_000, 100_000);
        assert!((c - 4.5).abs() < 1e-9);
    }

    #[test]
    fn counts_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert!(count_tokens("Hello there, how are you today?") > 0);
    }
}
