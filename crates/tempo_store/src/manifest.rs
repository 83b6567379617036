use std::fs;
use std::path::Path;

use aideon_tempo_core::{ModelManifest, TempoError, TempoResult};

use crate::model::Model;

pub fn parse_model_manifest(raw: &str) -> TempoResult<ModelManifest> {
    serde_json::from_str(raw)
        .map_err(|err| TempoError::config(format!("model manifest parse: {err}")))
}

pub fn load_model_manifest(path: &Path) -> TempoResult<ModelManifest> {
    let raw = fs::read_to_string(path).map_err(|err| {
        TempoError::config(format!("read model manifest {}: {err}", path.display()))
    })?;
    parse_model_manifest(&raw)
}

pub fn load_model(path: &Path) -> TempoResult<Model> {
    Model::from_manifest(load_model_manifest(path)?)
}
