use std::path::{Path, PathBuf};

use aideon_tempo_core::{TempoError, TempoResult};

use crate::config::{TempoConfig, default_db_name};
use crate::manifest::load_model;
use crate::model::Model;
use crate::session::TempoStore;

pub fn load_or_init_config(base: &Path) -> TempoResult<TempoConfig> {
    TempoConfig::load_or_init(base, &default_sqlite_path(base))
}

pub async fn open_store(base: &Path, model: Model) -> TempoResult<TempoStore> {
    let config = load_or_init_config(base)?;
    TempoStore::connect(&config, base, model).await
}

/// Opens a store whose model comes from the manifest named in `tempo.json`.
pub async fn open_store_from_manifest(base: &Path) -> TempoResult<TempoStore> {
    let config = load_or_init_config(base)?;
    let path = config
        .model_manifest_path(base)
        .ok_or_else(|| TempoError::config("config names no model_manifest"))?;
    let model = load_model(&path)?;
    TempoStore::connect(&config, base, model).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(default_db_name())
}

#[cfg(test)]
mod tests {
    use super::{default_sqlite_path, load_or_init_config, open_store, open_store_from_manifest};
    use crate::model::Model;
    use aideon_tempo_core::{EntityDef, TempoError};
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_store_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let config = load_or_init_config(base).expect("config");
        assert_eq!(config.backend_name(), "sqlite");
        let model = Model::builder()
            .entity(EntityDef::new("author", "authors").dimension("period"))
            .build()
            .expect("model");
        let store = open_store(base, model).await.expect("open store");
        assert!(default_sqlite_path(base).exists());
        assert_eq!(store.backend().name(), "sqlite");
    }

    #[tokio::test]
    async fn manifest_store_requires_manifest_path() {
        let dir = tempdir().expect("tempdir");
        let err = open_store_from_manifest(dir.path())
            .await
            .expect_err("no manifest configured");
        assert!(matches!(err, TempoError::Config { .. }));
    }
}
