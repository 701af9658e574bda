//! Shared fixtures for the storage integration tests.

#![allow(dead_code)]

use bulwark_storage::catalog::BUNDLED_ASSETS;
use bulwark_storage::{Catalog, Database, SchemaManager, StorageConfig};
use std::sync::Arc;

pub const KEY: &str = "integration_test_encryption_key";
pub const OTHER_KEY: &str = "a_completely_different_encryption_key";

pub async fn manager(db: &Database) -> SchemaManager {
    SchemaManager::new(db.clone(), StorageConfig::new(KEY).application_version("test")).unwrap()
}

pub async fn manager_with_catalog(db: &Database, catalog: Catalog) -> SchemaManager {
    SchemaManager::with_catalog(
        db.clone(),
        Arc::new(catalog),
        StorageConfig::new(KEY).application_version("test"),
    )
    .unwrap()
}

/// The bundled catalog with some scripts replaced by name.
pub fn catalog_with(overrides: &[(&'static str, &'static str)]) -> Catalog {
    let assets: Vec<(&str, &str)> = BUNDLED_ASSETS
        .iter()
        .map(|&(name, query)| {
            overrides
                .iter()
                .find(|(o, _)| *o == name)
                .map_or((name, query), |&(o, q)| (o, q))
        })
        .collect();

    Catalog::discover(&assets).unwrap()
}

pub async fn tables(db: &Database) -> Vec<String> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();

    rows.into_iter().map(|(name,)| name).collect()
}
