use crate::classifier::Prediction;
use crate::processors::{Postprocessor, ProcessorInfo, StageConfig};
use crate::types::Fields;

/// Suppresses a prediction identical to the last one that got through.
pub struct OnlyDiff {
    config: StageConfig,
    last: Option<Prediction>,
}

impl OnlyDiff {
    pub const TYPE: &'static str = "only_diff";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Only Diff",
        description: "Drops results unless they differ from the previous result",
    };

    pub fn new(config: StageConfig) -> Self {
        Self { config, last: None }
    }
}

impl Postprocessor for OnlyDiff {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        "I will only pass on results that differ from the previous one".to_string()
    }

    fn process(&mut self, _fields: &Fields, prediction: Prediction) -> Option<Prediction> {
        if self.last.as_ref() == Some(&prediction) {
            return None;
        }
        self.last = Some(prediction.clone());
        Some(prediction)
    }
}
