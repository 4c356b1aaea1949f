use std::fs;
use std::path::Path;

use crate::definition::model::ProcessDefinition;
use crate::error::Result;

pub fn parse_definition(yaml: &str) -> Result<ProcessDefinition> {
    let definition = serde_yaml::from_str(yaml)?;
    Ok(definition)
}

pub fn load_definition_from_yaml(path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let yaml = fs::read_to_string(path)?;
    parse_definition(&yaml)
}
