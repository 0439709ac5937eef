//! Embedded, file-backed [`VectorStore`].
//!
//! Collections live in memory behind a `tokio::sync::RwLock` and are mirrored
//! to `<dir>/<collection>.json` after every mutation. Search is brute-force
//! over all records of the collection using the collection's metric, so the
//! engine has no separate index to build: [`VectorStore::create_vector_index`]
//! always reports `false`.
//!
//! Records are keyed by chunk id; inserting an existing id overwrites it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    build_records, check_batch_size, check_limit, CollectionInfo, DistanceMethod, VectorRecord,
    VectorStore,
};
use crate::embedding::{cosine_similarity, dot_product};
use crate::error::{RagError, Result};
use crate::models::RetrievedDocument;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddedCollection {
    name: String,
    dimension: usize,
    distance: DistanceMethod,
    records: BTreeMap<i64, VectorRecord>,
}

impl EmbeddedCollection {
    fn score(&self, query: &[f32], record: &VectorRecord) -> f64 {
        let score = match self.distance {
            DistanceMethod::Cosine => cosine_similarity(query, &record.vector),
            DistanceMethod::Dot => dot_product(query, &record.vector),
        };
        score as f64
    }
}

/// Single-process vector store persisted as one JSON file per collection.
pub struct EmbeddedStore {
    dir: Option<PathBuf>,
    distance: DistanceMethod,
    collections: RwLock<HashMap<String, EmbeddedCollection>>,
    /// Collection files written since construction.
    writes: AtomicUsize,
}

impl EmbeddedStore {
    /// Store persisted under `dir`. Nothing is read until [`VectorStore::connect`].
    pub fn open(dir: &Path, distance: DistanceMethod) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
            distance,
            collections: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Store with no backing directory; contents vanish on drop.
    pub fn in_memory(distance: DistanceMethod) -> Self {
        Self {
            dir: None,
            distance,
            collections: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    fn collection_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", name)))
    }

    async fn persist(&self, collection: &EmbeddedCollection) -> Result<()> {
        let Some(path) = self.collection_path(&collection.name) else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(collection)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| RagError::provider_from(format!("writing {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RagError::provider_from(format!("writing {}", path.display()), e))?;
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    fn writes(&self) -> usize {
        self.writes.load(AtomicOrdering::Relaxed)
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        let Some(path) = self.collection_path(name) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::provider_from(
                format!("removing {}", path.display()),
                e,
            )),
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(RagError::validation(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl VectorStore for EmbeddedStore {
    fn backend_name(&self) -> &'static str {
        "embedded"
    }

    async fn connect(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            RagError::provider_from(format!("creating {}", dir.display()), e)
        })?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| RagError::provider_from(format!("reading {}", dir.display()), e))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let collection: EmbeddedCollection = serde_json::from_slice(&bytes).map_err(|e| {
                RagError::provider_from(format!("corrupt collection file {}", path.display()), e)
            })?;
            loaded.insert(collection.name.clone(), collection);
        }

        info!(dir = %dir.display(), collections = loaded.len(), "embedded store loaded");
        *self.collections.write().await = loaded;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.collections.write().await.clear();
        Ok(())
    }

    async fn is_collection_exist(&self, name: &str) -> bool {
        self.collections.read().await.contains_key(name)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str, dim: usize, do_reset: bool) -> Result<bool> {
        check_name(name)?;
        if dim == 0 {
            return Err(RagError::validation("collection dimension must be > 0"));
        }

        let mut collections = self.collections.write().await;
        if do_reset && collections.remove(name).is_some() {
            self.remove_file(name).await?;
            info!(collection = name, "collection reset");
        }
        if collections.contains_key(name) {
            return Ok(false);
        }

        let collection = EmbeddedCollection {
            name: name.to_string(),
            dimension: dim,
            distance: self.distance,
            records: BTreeMap::new(),
        };
        self.persist(&collection).await?;
        collections.insert(name.to_string(), collection);
        info!(collection = name, dim, "collection created");
        Ok(true)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let removed = self.collections.write().await.remove(name).is_some();
        self.remove_file(name).await?;
        if removed {
            info!(collection = name, "collection deleted");
        }
        Ok(())
    }

    async fn get_collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|c| CollectionInfo {
            name: c.name.clone(),
            backend: self.backend_name().to_string(),
            dimension: Some(c.dimension),
            distance: c.distance,
            record_count: c.records.len() as u64,
            vector_index: None,
        }))
    }

    async fn insert_many(
        &self,
        name: &str,
        texts: &[String],
        vectors: &[Vec<f32>],
        metadata: Option<&[serde_json::Value]>,
        ids: &[i64],
        batch_size: usize,
    ) -> Result<usize> {
        check_batch_size(batch_size)?;
        let records = build_records(texts, vectors, metadata, ids)?;

        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| {
            RagError::not_found(format!("cannot insert into missing collection {}", name))
        })?;

        if let Some(bad) = records
            .iter()
            .find(|r| r.vector.len() != collection.dimension)
        {
            return Err(RagError::validation(format!(
                "vector for chunk {} has {} dimensions, collection {} expects {}",
                bad.chunk_id,
                bad.vector.len(),
                name,
                collection.dimension
            )));
        }

        let mut replaced = Vec::with_capacity(records.len());
        for batch in records.chunks(batch_size) {
            for record in batch {
                let previous = collection.records.insert(record.chunk_id, record.clone());
                replaced.push((record.chunk_id, previous));
            }
            debug!(collection = name, batch = batch.len(), "batch applied");
        }

        // One file write per call; undo every batch if it fails.
        if let Err(e) = self.persist(collection).await {
            for (chunk_id, previous) in replaced.into_iter().rev() {
                match previous {
                    Some(record) => collection.records.insert(chunk_id, record),
                    None => collection.records.remove(&chunk_id),
                };
            }
            return Err(e);
        }
        let inserted = replaced.len();
        drop(collections);

        self.create_vector_index(name).await?;
        Ok(inserted)
    }

    async fn delete_records(&self, name: &str, ids: &[i64]) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(name) else {
            return Ok(0);
        };

        let removed: Vec<VectorRecord> = ids
            .iter()
            .filter_map(|id| collection.records.remove(id))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.persist(collection).await {
            for record in removed {
                collection.records.insert(record.chunk_id, record);
            }
            return Err(e);
        }
        debug!(collection = name, removed = removed.len(), "records deleted");
        Ok(removed.len())
    }

    async fn search_by_vector(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        check_limit(limit)?;

        let collections = self.collections.read().await;
        let Some(collection) = collections.get(name) else {
            warn!(collection = name, "search on missing collection");
            return Ok(Vec::new());
        };

        if vector.len() != collection.dimension {
            return Err(RagError::validation(format!(
                "query vector has {} dimensions, collection {} expects {}",
                vector.len(),
                name,
                collection.dimension
            )));
        }

        let mut scored: Vec<RetrievedDocument> = collection
            .records
            .values()
            .map(|r| RetrievedDocument {
                chunk_id: r.chunk_id,
                text: r.text.clone(),
                score: collection.score(vector, r),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn create_vector_index(&self, name: &str) -> Result<bool> {
        debug!(collection = name, "embedded engine manages its index internally");
        Ok(false)
    }

    async fn reset_vector_index(&self, name: &str) -> Result<bool> {
        self.create_vector_index(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn orthonormal() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ]
    }

    #[tokio::test]
    async fn test_create_collection_twice() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        assert!(store.create_collection("c", 3, false).await.unwrap());
        assert!(!store.create_collection("c", 3, false).await.unwrap());
        assert!(store.create_collection("c", 3, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_collection_rejects_zero_dim() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        assert!(store.create_collection("c", 0, false).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_collection_is_noop() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.delete_collection("nope").await.unwrap();
        assert!(!store.is_collection_exist("nope").await);
    }

    #[tokio::test]
    async fn test_insert_and_info() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.create_collection("c", 3, false).await.unwrap();
        let n = store
            .insert_many("c", &texts(&["a", "b", "c"]), &orthonormal(), None, &[1, 2, 3], 2)
            .await
            .unwrap();
        assert_eq!(n, 3);

        let info = store.get_collection_info("c").await.unwrap().unwrap();
        assert_eq!(info.record_count, 3);
        assert_eq!(info.dimension, Some(3));
        assert!(store.get_collection_info("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reinsert_same_ids_replaces() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.create_collection("c", 3, false).await.unwrap();
        for _ in 0..2 {
            store
                .insert_many("c", &texts(&["a", "b", "c"]), &orthonormal(), None, &[1, 2, 3], 50)
                .await
                .unwrap();
        }
        let info = store.get_collection_info("c").await.unwrap().unwrap();
        assert_eq!(info.record_count, 3);
    }

    #[tokio::test]
    async fn test_insert_into_missing_collection_fails() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        let err = store
            .insert_many("c", &texts(&["a"]), &[vec![1.0]], None, &[1], 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_insert_wrong_dimension_fails() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.create_collection("c", 3, false).await.unwrap();
        let err = store
            .insert_many("c", &texts(&["a"]), &[vec![1.0, 0.0]], None, &[1], 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_search_ranks_descending() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.create_collection("c", 3, false).await.unwrap();
        store
            .insert_many("c", &texts(&["a", "b", "c"]), &orthonormal(), None, &[1, 2, 3], 50)
            .await
            .unwrap();

        let results = store
            .search_by_vector("c", &[0.9, 0.1, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].text, "a");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

        let top = store.search_by_vector("c", &[0.0, 0.0, 1.0], 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].text, "c");
    }

    #[tokio::test]
    async fn test_dot_metric() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Dot);
        store.create_collection("c", 2, false).await.unwrap();
        store
            .insert_many(
                "c",
                &texts(&["short", "long"]),
                &[vec![1.0, 0.0], vec![3.0, 0.0]],
                None,
                &[1, 2],
                50,
            )
            .await
            .unwrap();
        let results = store.search_by_vector("c", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results[0].text, "long");
        assert!((results[0].score - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_records_skips_unknown_ids() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        assert_eq!(store.delete_records("c", &[1]).await.unwrap(), 0);

        store.create_collection("c", 3, false).await.unwrap();
        store
            .insert_many("c", &texts(&["a", "b", "c"]), &orthonormal(), None, &[1, 2, 3], 50)
            .await
            .unwrap();
        assert_eq!(store.delete_records("c", &[2, 3, 99]).await.unwrap(), 2);

        let info = store.get_collection_info("c").await.unwrap().unwrap();
        assert_eq!(info.record_count, 1);
        let results = store.search_by_vector("c", &[0.0, 1.0, 0.0], 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, 1);
    }

    #[tokio::test]
    async fn test_search_missing_collection_is_empty() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        let results = store.search_by_vector("nope", &[1.0], 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_create_vector_index_is_internal() {
        let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
        store.create_collection("c", 3, false).await.unwrap();
        assert!(!store.create_vector_index("c").await.unwrap());
        assert!(!store.reset_vector_index("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_persists_across_reconnect() {
        let dir = TempDir::new().unwrap();
        {
            let store = EmbeddedStore::open(dir.path(), DistanceMethod::Cosine);
            store.connect().await.unwrap();
            store.create_collection("collection_3_1", 3, false).await.unwrap();
            store
                .insert_one(
                    "collection_3_1",
                    "alpha",
                    &[1.0, 0.0, 0.0],
                    Some(serde_json::json!({"source": "a.txt"})),
                    42,
                )
                .await
                .unwrap();
            store.disconnect().await.unwrap();
        }

        let store = EmbeddedStore::open(dir.path(), DistanceMethod::Cosine);
        store.connect().await.unwrap();
        assert_eq!(
            store.list_collections().await.unwrap(),
            vec!["collection_3_1".to_string()]
        );
        let results = store
            .search_by_vector("collection_3_1", &[1.0, 0.0, 0.0], 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "alpha");

        store.delete_collection("collection_3_1").await.unwrap();
        assert!(!dir.path().join("collection_3_1.json").exists());
    }

    #[tokio::test]
    async fn test_insert_writes_file_once_across_batches() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<i64> = (1..=7).collect();
        let vectors: Vec<Vec<f32>> = ids.iter().map(|i| vec![*i as f32, 1.0]).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("t{}", i)).collect();
        {
            let store = EmbeddedStore::open(dir.path(), DistanceMethod::Dot);
            store.connect().await.unwrap();
            store.create_collection("c", 2, false).await.unwrap();
            let before = store.writes();

            let n = store
                .insert_many("c", &names, &vectors, None, &ids, 2)
                .await
                .unwrap();
            assert_eq!(n, 7);
            assert_eq!(store.writes(), before + 1);
        }

        let store = EmbeddedStore::open(dir.path(), DistanceMethod::Dot);
        store.connect().await.unwrap();
        let info = store.get_collection_info("c").await.unwrap().unwrap();
        assert_eq!(info.record_count, 7);
        let top = store.search_by_vector("c", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top[0].chunk_id, 7);
        assert_eq!(top[0].text, "t7");
    }
}
