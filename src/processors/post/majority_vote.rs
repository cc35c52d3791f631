use crate::classifier::Prediction;
use crate::processors::{Postprocessor, ProcessorError, ProcessorInfo, StageConfig};
use crate::types::Fields;
use serde::Deserialize;
use std::collections::VecDeque;

const DEFAULT_WINDOW: usize = 5;

fn default_window() -> usize {
    DEFAULT_WINDOW
}

#[derive(Debug, Deserialize)]
struct MajorityVoteParams {
    #[serde(default = "default_window")]
    window_size: usize,
}

/// Buffers the last N labels and emits the most frequent one once the
/// window is full. Ties go to the label that reached the top count first
/// in window order.
pub struct MajorityVote {
    config: StageConfig,
    window_size: usize,
    window: VecDeque<String>,
}

impl MajorityVote {
    pub const TYPE: &'static str = "majority_vote";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Majority Vote",
        description: "Waits for N results and returns the most common label",
    };

    pub fn new(config: StageConfig) -> Result<Self, ProcessorError> {
        let params: MajorityVoteParams = config.typed_params(Self::TYPE)?;
        if params.window_size == 0 {
            return Err(ProcessorError::InvalidConfig {
                type_name: Self::TYPE.to_string(),
                reason: "window_size must be at least 1".to_string(),
            });
        }
        Ok(Self {
            config,
            window_size: params.window_size,
            window: VecDeque::with_capacity(params.window_size),
        })
    }

    fn majority(&self) -> Option<&str> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for label in &self.window {
            match counts.iter_mut().find(|(seen, _)| *seen == label.as_str()) {
                Some((_, count)) => *count += 1,
                None => counts.push((label.as_str(), 1)),
            }
        }

        let mut best: Option<(&str, usize)> = None;
        for (label, count) in counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label)
    }
}

impl Postprocessor for MajorityVote {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        format!("I will publish the most common of the last {} results", self.window_size)
    }

    fn process(&mut self, _fields: &Fields, prediction: Prediction) -> Option<Prediction> {
        self.window.push_back(prediction.label.clone());
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        if self.window.len() < self.window_size {
            return None;
        }

        let label = self.majority()?.to_string();
        Some(Prediction { label, ..prediction })
    }
}
