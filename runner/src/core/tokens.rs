//! Per-agent token accounting.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// Input/output token counts for one agent or for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    fn add(&mut self, input: u64, output: u64) {
        self.input += input;
        self.output += output;
        self.total += input + output;
    }
}

/// Serialised form written to `token_usage.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenReport {
    pub per_agent: BTreeMap<String, TokenUsage>,
    pub total: TokenUsage,
}

/// Running totals, shared by every agent of a run.
#[derive(Debug, Default)]
pub struct TokenLedger {
    inner: Mutex<TokenReport>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent: &str, input_tokens: u64, output_tokens: u64) {
        let mut report = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        report
            .per_agent
            .entry(agent.to_string())
            .or_default()
            .add(input_tokens, output_tokens);
        report.total.add(input_tokens, output_tokens);
    }

    pub fn snapshot(&self) -> TokenReport {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// True once any call has been recorded.
    pub fn has_calls(&self) -> bool {
        !self.snapshot().per_agent.is_empty()
    }
}

/// Rough token estimate for backends that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_sums_per_agent_and_total() {
        let ledger = TokenLedger::new();
        ledger.record("python_coder", 100, 20);
        ledger.record("python_coder", 50, 5);
        ledger.record("executer", 10, 1);

        let report = ledger.snapshot();
        assert_eq!(
            report.per_agent["python_coder"],
            TokenUsage {
                input: 150,
                output: 25,
                total: 175
            }
        );
        assert_eq!(report.total.total, 186);
    }

    #[test]
    fn report_serialises_with_expected_keys() {
        let ledger = TokenLedger::new();
        ledger.record("reranker", 3, 4);
        let json = serde_json::to_value(ledger.snapshot()).expect("json");
        assert_eq!(json["per_agent"]["reranker"]["total"], 7);
        assert_eq!(json["total"]["input"], 3);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
