//! Table-level context shared by merge tasks: schema snapshot, settings,
//! disks, codec selection and bookkeeping locks.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::Level;
use parking_lot::Mutex;
use parquet::file::properties::WriterProperties;

use crate::{
    logging::merge_log,
    merge::MergingParams,
    option::MergeTreeOptions,
    part::{MergeType, TtlInfos},
    schema::TableSchema,
};

/// The `Data` collaborator: everything a merge task consumes from the owning
/// table.
pub struct TableData {
    schema: Arc<TableSchema>,
    merging_params: MergingParams,
    options: MergeTreeOptions,
    parts_dir: PathBuf,
    tmp_volume_dir: PathBuf,
    /// Names of temporary part directories currently claimed by tasks.
    temp_part_dirs: Arc<Mutex<HashSet<String>>>,
    /// Active parts and their compressed sizes. Guards table-wide size
    /// queries; merge preparation touches it before opening input readers,
    /// so the lock order against readers is fixed here.
    active_parts: Mutex<HashMap<String, u64>>,
    /// Row-id maps of decoupled parts, primed at merge finalize so first
    /// searches skip the map read.
    decouple_cache: Mutex<HashMap<String, Arc<Vec<u64>>>>,
}

impl TableData {
    pub fn new(
        schema: Arc<TableSchema>,
        merging_params: MergingParams,
        options: MergeTreeOptions,
        parts_dir: impl Into<PathBuf>,
        tmp_volume_dir: impl Into<PathBuf>,
    ) -> std::io::Result<Arc<Self>> {
        let parts_dir = parts_dir.into();
        let tmp_volume_dir = tmp_volume_dir.into();
        std::fs::create_dir_all(&parts_dir)?;
        std::fs::create_dir_all(&tmp_volume_dir)?;
        Ok(Arc::new(Self {
            schema,
            merging_params,
            options,
            parts_dir,
            tmp_volume_dir,
            temp_part_dirs: Arc::new(Mutex::new(HashSet::new())),
            active_parts: Mutex::new(HashMap::new()),
            decouple_cache: Mutex::new(HashMap::new()),
        }))
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn merging_params(&self) -> &MergingParams {
        &self.merging_params
    }

    pub fn options(&self) -> &MergeTreeOptions {
        &self.options
    }

    pub fn parts_dir(&self) -> &Path {
        &self.parts_dir
    }

    pub fn tmp_volume_dir(&self) -> &Path {
        &self.tmp_volume_dir
    }

    pub fn register_part(&self, name: impl Into<String>, compressed_bytes: u64) {
        self.active_parts.lock().insert(name.into(), compressed_bytes);
    }

    pub fn forget_part(&self, name: &str) {
        self.active_parts.lock().remove(name);
    }

    /// Total compressed size of active parts. Takes the parts lock.
    pub fn total_active_size(&self) -> u64 {
        self.active_parts.lock().values().sum()
    }

    /// Picks the payload codec for the merged part.
    ///
    /// Consults `total_active_size`, which takes the parts lock. Callers run
    /// this before creating input readers (which take the same lock in
    /// shared mode through part registration) so the acquisition order never
    /// reverses.
    pub fn compression_codec_for_part(
        &self,
        total_compressed: u64,
        ttl: &TtlInfos,
        merge_type: MergeType,
        time_of_merge: i64,
    ) -> WriterProperties {
        let table_size = self.total_active_size().max(1);
        let part_expired = ttl
            .part
            .map(|range| range.finished(time_of_merge))
            .unwrap_or(false);
        let recompress =
            merge_type == MergeType::TtlRecompress || (part_expired && merge_type.is_ttl());
        merge_log!(
            Level::Debug,
            "codec_for_part",
            "merge_bytes={total_compressed} table_bytes={table_size} recompress={recompress}",
        );
        if recompress {
            self.options.recompression_parquet_properties.clone()
        } else {
            self.options.write_parquet_properties.clone()
        }
    }

    /// Claims a temporary part directory name for the lifetime of the lock.
    pub fn temporary_directory_lock(&self, dir_name: impl Into<String>) -> TempDirLock {
        let dir_name = dir_name.into();
        self.temp_part_dirs.lock().insert(dir_name.clone());
        TempDirLock {
            registry: self.temp_part_dirs.clone(),
            dir_name,
        }
    }

    pub fn is_temp_dir_claimed(&self, dir_name: &str) -> bool {
        self.temp_part_dirs.lock().contains(dir_name)
    }

    pub(crate) fn prime_decouple_cache(&self, key: String, row_ids: Arc<Vec<u64>>) {
        self.decouple_cache.lock().insert(key, row_ids);
    }

    pub fn decouple_cache_get(&self, key: &str) -> Option<Arc<Vec<u64>>> {
        self.decouple_cache.lock().get(key).cloned()
    }
}

/// RAII claim on a temporary part directory name.
pub struct TempDirLock {
    registry: Arc<Mutex<HashSet<String>>>,
    dir_name: String,
}

impl Drop for TempDirLock {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.dir_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeMode;

    #[test]
    fn temp_dir_lock_releases_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = Arc::new(TableSchema::new(
            Arc::new(arrow_schema::Schema::empty()),
            vec![],
        ));
        let data = TableData::new(
            schema,
            MergingParams::new(MergeMode::Ordinary),
            MergeTreeOptions::new(),
            tmp.path().join("data"),
            tmp.path().join("tmp"),
        )
        .unwrap();

        let lock = data.temporary_directory_lock("tmp_merge_all_1_2_1");
        assert!(data.is_temp_dir_claimed("tmp_merge_all_1_2_1"));
        drop(lock);
        assert!(!data.is_temp_dir_claimed("tmp_merge_all_1_2_1"));
    }

    #[test]
    fn active_size_tracks_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = Arc::new(TableSchema::new(
            Arc::new(arrow_schema::Schema::empty()),
            vec![],
        ));
        let data = TableData::new(
            schema,
            MergingParams::new(MergeMode::Ordinary),
            MergeTreeOptions::new(),
            tmp.path().join("data"),
            tmp.path().join("tmp"),
        )
        .unwrap();
        data.register_part("all_1_1_0", 100);
        data.register_part("all_2_2_0", 50);
        assert_eq!(data.total_active_size(), 150);
        data.forget_part("all_1_1_0");
        assert_eq!(data.total_active_size(), 50);
    }
}
