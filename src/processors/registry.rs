//! Static processor registry
//!
//! Maps a stored type tag to its constructor. Adding a stage type means
//! adding one arm here and one entry to the matching `*_TYPES` table.

use super::post::{MajorityVote, OnlyDiff};
use super::pre::{NullHandler, RollingAverage, TemporalExpander, TypeCaster};
use super::{Postprocessor, Preprocessor, ProcessorError, StageConfig};
use crate::store::ProcessorDefinition;
use serde::Serialize;

/// Metadata shown when listing available stage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessorInfo {
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const PREPROCESSOR_TYPES: &[&ProcessorInfo] = &[
    &TypeCaster::INFO,
    &NullHandler::INFO,
    &RollingAverage::INFO,
    &TemporalExpander::INFO,
];

const POSTPROCESSOR_TYPES: &[&ProcessorInfo] = &[&OnlyDiff::INFO, &MajorityVote::INFO];

pub fn available_preprocessors() -> Vec<ProcessorInfo> {
    PREPROCESSOR_TYPES.iter().map(|info| **info).collect()
}

pub fn available_postprocessors() -> Vec<ProcessorInfo> {
    POSTPROCESSOR_TYPES.iter().map(|info| **info).collect()
}

pub fn create_preprocessor(definition: &ProcessorDefinition) -> Result<Box<dyn Preprocessor>, ProcessorError> {
    let config = StageConfig::from_definition(definition)?;
    let stage: Box<dyn Preprocessor> = match definition.type_name.as_str() {
        TypeCaster::TYPE => Box::new(TypeCaster::new(config)),
        NullHandler::TYPE => Box::new(NullHandler::new(config)?),
        RollingAverage::TYPE => Box::new(RollingAverage::new(config)?),
        TemporalExpander::TYPE => Box::new(TemporalExpander::new(config)?),
        other => return Err(ProcessorError::UnknownType(other.to_string())),
    };
    Ok(stage)
}

pub fn create_postprocessor(definition: &ProcessorDefinition) -> Result<Box<dyn Postprocessor>, ProcessorError> {
    let config = StageConfig::from_definition(definition)?;
    let stage: Box<dyn Postprocessor> = match definition.type_name.as_str() {
        OnlyDiff::TYPE => Box::new(OnlyDiff::new(config)),
        MajorityVote::TYPE => Box::new(MajorityVote::new(config)?),
        other => return Err(ProcessorError::UnknownType(other.to_string())),
    };
    Ok(stage)
}
