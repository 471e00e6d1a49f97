//! Per-turn tool-call ledger enforcing the quota policy.
//!
//! Created at the start of a turn, discarded at its end; never
//! persisted. Single-writer (the turn loop), so no locking. Counters
//! only move forward within a turn.

use std::collections::VecDeque;

use rawi_domain::config::QuotaConfig;

/// Which ceiling a rejected call would have crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaBreach {
    /// The hard per-turn dispatch ceiling.
    TotalCalls { limit: u32 },
    /// The same tool requested too many times in a row.
    ConsecutiveRepeat { tool: String, limit: u32 },
}

impl std::fmt::Display for QuotaBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaBreach::TotalCalls { limit } => {
                write!(f, "tool call budget exhausted ({limit} per turn)")
            }
            QuotaBreach::ConsecutiveRepeat { tool, limit } => {
                write!(f, "'{tool}' already called {limit} times in a row")
            }
        }
    }
}

/// Monotonic per-turn counters: total dispatches plus a rolling window
/// of the most recent tool names.
pub struct CallLedger {
    quota: QuotaConfig,
    total: u32,
    recent: VecDeque<String>,
}

impl CallLedger {
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            quota,
            total: 0,
            recent: VecDeque::with_capacity(quota.max_consecutive as usize),
        }
    }

    /// Would dispatching `tool` now cross a ceiling?
    ///
    /// Checked by the engine before every dispatch; a breach is a
    /// defined terminal branch of the turn, not an error.
    pub fn check(&self, tool: &str) -> Result<(), QuotaBreach> {
        if self.total >= self.quota.max_total_calls {
            return Err(QuotaBreach::TotalCalls {
                limit: self.quota.max_total_calls,
            });
        }

        let window = self.quota.max_consecutive as usize;
        if self.recent.len() >= window && self.recent.iter().all(|name| name == tool) {
            return Err(QuotaBreach::ConsecutiveRepeat {
                tool: tool.to_string(),
                limit: self.quota.max_consecutive,
            });
        }

        Ok(())
    }

    /// Record one dispatched (or malformed-and-counted) call.
    pub fn record(&mut self, tool: &str) {
        self.total += 1;
        let window = self.quota.max_consecutive as usize;
        if self.recent.len() == window {
            self.recent.pop_front();
        }
        self.recent.push_back(tool.to_string());
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> CallLedger {
        CallLedger::new(QuotaConfig::default())
    }

    #[test]
    fn fresh_ledger_allows_any_tool() {
        let l = ledger();
        assert!(l.check("search_quran").is_ok());
        assert_eq!(l.total(), 0);
    }

    #[test]
    fn total_ceiling_rejects_eleventh_call() {
        let mut l = ledger();
        let tools = ["search_quran", "search_hadith"];
        for i in 0..10 {
            let tool = tools[i % 2];
            l.check(tool).unwrap();
            l.record(tool);
        }
        assert_eq!(l.total(), 10);
        let breach = l.check("search_quran").unwrap_err();
        assert_eq!(breach, QuotaBreach::TotalCalls { limit: 10 });
    }

    #[test]
    fn fourth_consecutive_same_tool_is_rejected() {
        let mut l = ledger();
        for _ in 0..3 {
            l.check("search_quran").unwrap();
            l.record("search_quran");
        }
        let breach = l.check("search_quran").unwrap_err();
        assert!(matches!(
            breach,
            QuotaBreach::ConsecutiveRepeat { ref tool, limit: 3 } if tool == "search_quran"
        ));
    }

    #[test]
    fn intervening_tool_resets_the_repeat_window() {
        let mut l = ledger();
        for _ in 0..3 {
            l.record("search_quran");
        }
        l.record("search_hadith");
        // Window is now [quran, quran, hadith] — quran is allowed again.
        assert!(l.check("search_quran").is_ok());
    }

    #[test]
    fn repeat_window_respects_configured_size() {
        let mut l = CallLedger::new(QuotaConfig {
            max_total_calls: 10,
            max_consecutive: 1,
        });
        l.record("search_quran");
        assert!(l.check("search_quran").is_err());
        assert!(l.check("search_hadith").is_ok());
    }

    #[test]
    fn counters_are_monotonic() {
        let mut l = ledger();
        for i in 1..=5 {
            l.record("search_quran");
            assert_eq!(l.total(), i);
        }
    }
}
