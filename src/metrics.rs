//! Token and latency accounting for reasoning backend calls.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Engine operations that consume backend inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagehandFunctionName {
    Act,
    Extract,
}

impl StagehandFunctionName {
    pub fn as_str(self) -> &'static str {
        match self {
            StagehandFunctionName::Act => "act",
            StagehandFunctionName::Extract => "extract",
        }
    }
}

/// Metrics shared between every session of one [`Stagehand`](crate::Stagehand).
pub type SharedMetrics = Arc<Mutex<StagehandMetrics>>;

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagehandMetrics {
    pub act_prompt_tokens: u64,
    pub act_completion_tokens: u64,
    pub act_inference_time_ms: u64,

    pub extract_prompt_tokens: u64,
    pub extract_completion_tokens: u64,
    pub extract_inference_time_ms: u64,

    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_inference_time_ms: u64,
}

impl StagehandMetrics {
    pub fn merge(&mut self, other: &StagehandMetrics) {
        self.act_prompt_tokens += other.act_prompt_tokens;
        self.act_completion_tokens += other.act_completion_tokens;
        self.act_inference_time_ms += other.act_inference_time_ms;

        self.extract_prompt_tokens += other.extract_prompt_tokens;
        self.extract_completion_tokens += other.extract_completion_tokens;
        self.extract_inference_time_ms += other.extract_inference_time_ms;

        self.total_prompt_tokens += other.total_prompt_tokens;
        self.total_completion_tokens += other.total_completion_tokens;
        self.total_inference_time_ms += other.total_inference_time_ms;
    }

    /// Record one backend call and update the cumulative totals.
    pub fn record(
        &mut self,
        function: StagehandFunctionName,
        prompt_tokens: u64,
        completion_tokens: u64,
        inference_time_ms: u64,
    ) {
        match function {
            StagehandFunctionName::Act => {
                self.act_prompt_tokens += prompt_tokens;
                self.act_completion_tokens += completion_tokens;
                self.act_inference_time_ms += inference_time_ms;
            }
            StagehandFunctionName::Extract => {
                self.extract_prompt_tokens += prompt_tokens;
                self.extract_completion_tokens += completion_tokens;
                self.extract_inference_time_ms += inference_time_ms;
            }
        }

        self.total_prompt_tokens += prompt_tokens;
        self.total_completion_tokens += completion_tokens;
        self.total_inference_time_ms += inference_time_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_totals() {
        let mut metrics = StagehandMetrics::default();
        metrics.record(StagehandFunctionName::Act, 10, 5, 100);
        metrics.record(StagehandFunctionName::Act, 2, 3, 40);
        metrics.record(StagehandFunctionName::Extract, 1, 1, 20);

        assert_eq!(metrics.act_prompt_tokens, 12);
        assert_eq!(metrics.act_completion_tokens, 8);
        assert_eq!(metrics.act_inference_time_ms, 140);
        assert_eq!(metrics.extract_inference_time_ms, 20);
        assert_eq!(metrics.total_prompt_tokens, 13);
        assert_eq!(metrics.total_completion_tokens, 9);
        assert_eq!(metrics.total_inference_time_ms, 160);
    }

    #[test]
    fn merge_combines_sessions() {
        let mut a = StagehandMetrics::default();
        a.record(StagehandFunctionName::Extract, 4, 2, 50);

        let mut b = StagehandMetrics::default();
        b.record(StagehandFunctionName::Extract, 1, 1, 20);
        b.record(StagehandFunctionName::Act, 3, 2, 30);

        a.merge(&b);
        assert_eq!(a.extract_prompt_tokens, 5);
        assert_eq!(a.extract_completion_tokens, 3);
        assert_eq!(a.extract_inference_time_ms, 70);
        assert_eq!(a.act_prompt_tokens, 3);
        assert_eq!(a.total_completion_tokens, 5);
    }
}
