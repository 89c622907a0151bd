//! RocksDB-backed workspace store.
//!
//! Column families:
//! - `workspaces`   — one record per workspace id
//! - `layers`       — layer records keyed by `workspace ‖ layer_id`
//! - `layer_owners` — `layer_id → workspace_id` (global layer id uniqueness)
//! - `highlights`, `arrows`, `underlines` — keyed by `layer ‖ annotation_id`
//! - `highlight_owners`, `arrow_owners`, `underline_owners` — `annotation_id → layer_id`
//!   (annotation ids are unique per kind across all layers)
//! - `editors`      — editor records keyed by `workspace ‖ editor_id (8 bytes BE)`
//! - `meta`         — store-wide counters (editor id sequence)
//!
//! Every key scope is length-prefixed (`u32 BE`), so a prefix scan over one
//! workspace or layer can never run into a neighbour whose id merely shares
//! leading bytes.
//!
//! Mutations are serialized through one writer lock and committed as a single
//! `WriteBatch`; reads that assemble a full workspace go through a RocksDB
//! snapshot. Together these keep multi-row reorders and re-indexing atomic for
//! every observer.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use super::model::{
    AnnotationCounts, Arrow, Editor, EditorRecord, Highlight, Layer, LayerRecord, Underline,
    WorkspaceRecord, WorkspaceState, DEFAULT_EDITOR_NAME,
};

const CF_WORKSPACES: &str = "workspaces";
const CF_LAYERS: &str = "layers";
const CF_LAYER_OWNERS: &str = "layer_owners";
const CF_HIGHLIGHTS: &str = "highlights";
const CF_ARROWS: &str = "arrows";
const CF_UNDERLINES: &str = "underlines";
const CF_HIGHLIGHT_OWNERS: &str = "highlight_owners";
const CF_ARROW_OWNERS: &str = "arrow_owners";
const CF_UNDERLINE_OWNERS: &str = "underline_owners";
const CF_EDITORS: &str = "editors";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[
    CF_WORKSPACES,
    CF_LAYERS,
    CF_LAYER_OWNERS,
    CF_HIGHLIGHTS,
    CF_ARROWS,
    CF_UNDERLINES,
    CF_HIGHLIGHT_OWNERS,
    CF_ARROW_OWNERS,
    CF_UNDERLINE_OWNERS,
    CF_EDITORS,
    CF_META,
];

/// Annotation record family paired with its owner index.
const ANNOTATION_FAMILIES: &[(&str, &str)] = &[
    (CF_HIGHLIGHTS, CF_HIGHLIGHT_OWNERS),
    (CF_ARROWS, CF_ARROW_OWNERS),
    (CF_UNDERLINES, CF_UNDERLINE_OWNERS),
];

/// Last editor id handed out.
const META_EDITOR_SEQ: &[u8] = b"editor_seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/referencer"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Storage errors. The Display text is forwarded to clients verbatim.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store writer lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// State owned by whoever holds the writer lock.
struct WriterState {
    last_editor_id: u64,
}

/// Durable storage for workspaces, layers, annotations and editor panes.
pub struct WorkspaceStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writer: Mutex<WriterState>,
}

impl WorkspaceStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let last_editor_id = Self::recover_editor_seq(&db)?;
        log::debug!(
            "Opened workspace store at {} (last editor id {last_editor_id})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            writer: Mutex::new(WriterState { last_editor_id }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_WORKSPACES | CF_LAYER_OWNERS | CF_HIGHLIGHT_OWNERS | CF_ARROW_OWNERS
            | CF_UNDERLINE_OWNERS | CF_META => {
                // Point lookups only
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)).max(1) as u64);
            }
            CF_EDITORS => {
                // Content is already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    fn recover_editor_seq(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        Ok(match db.get_cf(cf, META_EDITOR_SEQ)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        })
    }

    // ─── Workspaces ───────────────────────────────────────────────────

    /// Create the workspace and its default editor if the workspace is absent.
    ///
    /// Returns `true` when the workspace was created by this call.
    pub fn ensure_workspace(&self, workspace_id: &str) -> Result<bool, StoreError> {
        let mut writer = self.lock()?;
        let cf_ws = self.cf(CF_WORKSPACES)?;
        if self.db.get_cf(cf_ws, workspace_id.as_bytes())?.is_some() {
            return Ok(false);
        }

        let editor_id = writer.last_editor_id + 1;
        let editor = EditorRecord {
            id: editor_id,
            index: 0,
            name: DEFAULT_EDITOR_NAME.to_string(),
            visible: true,
            content: None,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_ws,
            workspace_id.as_bytes(),
            encode(&WorkspaceRecord { created_at: now_secs() })?,
        );
        batch.put_cf(self.cf(CF_EDITORS)?, editor_key(workspace_id, editor_id), encode(&editor)?);
        batch.put_cf(self.cf(CF_META)?, META_EDITOR_SEQ, editor_id.to_be_bytes());
        self.commit(batch)?;

        writer.last_editor_id = editor_id;
        log::info!("Created workspace {workspace_id}");
        Ok(true)
    }

    pub fn workspace_exists(&self, workspace_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_WORKSPACES)?;
        Ok(self.db.get_cf(cf, workspace_id.as_bytes())?.is_some())
    }

    /// List all workspace ids in the store.
    pub fn list_workspaces(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_WORKSPACES)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    /// Load the full workspace state from a consistent snapshot.
    ///
    /// Layers come back ordered by position and editors by index. Order among
    /// a layer's annotations is unspecified.
    pub fn load_workspace_state(&self, workspace_id: &str) -> Result<WorkspaceState, StoreError> {
        let snapshot = self.db.snapshot();
        let ws_prefix = scope_prefix(workspace_id);

        let cf_layers = self.cf(CF_LAYERS)?;
        let mut layer_records: Vec<LayerRecord> = collect_prefixed(
            snapshot.iterator_cf(cf_layers, IteratorMode::From(&ws_prefix, Direction::Forward)),
            &ws_prefix,
        )?;
        layer_records.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));

        let (cf_h, cf_a, cf_u) = (
            self.cf(CF_HIGHLIGHTS)?,
            self.cf(CF_ARROWS)?,
            self.cf(CF_UNDERLINES)?,
        );
        let mut layers = Vec::with_capacity(layer_records.len());
        for record in layer_records {
            let prefix = scope_prefix(&record.id);
            let highlights: Vec<Highlight> = collect_prefixed(
                snapshot.iterator_cf(cf_h, IteratorMode::From(&prefix, Direction::Forward)),
                &prefix,
            )?;
            let arrows: Vec<Arrow> = collect_prefixed(
                snapshot.iterator_cf(cf_a, IteratorMode::From(&prefix, Direction::Forward)),
                &prefix,
            )?;
            let underlines: Vec<Underline> = collect_prefixed(
                snapshot.iterator_cf(cf_u, IteratorMode::From(&prefix, Direction::Forward)),
                &prefix,
            )?;
            layers.push(Layer {
                id: record.id,
                name: record.name,
                color: record.color,
                visible: record.visible,
                highlights,
                arrows,
                underlines,
            });
        }

        let cf_editors = self.cf(CF_EDITORS)?;
        let mut editor_records: Vec<EditorRecord> = collect_prefixed(
            snapshot.iterator_cf(cf_editors, IteratorMode::From(&ws_prefix, Direction::Forward)),
            &ws_prefix,
        )?;
        editor_records.sort_by_key(|e| (e.index, e.id));
        let editors = editor_records
            .into_iter()
            .map(|record| Editor {
                content_json: record.content.as_deref().and_then(|c| decode_content(record.id, c)),
                index: record.index,
                name: record.name,
                visible: record.visible,
            })
            .collect();

        Ok(WorkspaceState {
            workspace_id: workspace_id.to_string(),
            layers,
            editors,
        })
    }

    // ─── Layers ───────────────────────────────────────────────────────

    /// Append a layer after the workspace's highest position.
    pub fn add_layer(
        &self,
        workspace_id: &str,
        layer_id: &str,
        name: &str,
        color: &str,
    ) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        self.require_workspace(workspace_id)?;
        let cf_owners = self.cf(CF_LAYER_OWNERS)?;
        if self.db.get_cf(cf_owners, layer_id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(format!("layer {layer_id}")));
        }

        let position = self
            .layers_in(workspace_id)?
            .iter()
            .map(|l| l.position)
            .max()
            .map_or(0, |max| max + 1);
        let record = LayerRecord {
            id: layer_id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            visible: true,
            position,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_LAYERS)?, scoped_key(workspace_id, layer_id.as_bytes()), encode(&record)?);
        batch.put_cf(cf_owners, layer_id.as_bytes(), workspace_id.as_bytes());
        self.commit(batch)
    }

    /// Delete a layer together with every annotation it owns, freeing their ids.
    pub fn remove_layer(&self, workspace_id: &str, layer_id: &str) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf_layers = self.cf(CF_LAYERS)?;
        let key = scoped_key(workspace_id, layer_id.as_bytes());
        if self.db.get_cf(cf_layers, &key)?.is_none() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_layers, &key);
        batch.delete_cf(self.cf(CF_LAYER_OWNERS)?, layer_id.as_bytes());

        let prefix = scope_prefix(layer_id);
        for (records, owners) in ANNOTATION_FAMILIES {
            let cf = self.cf(records)?;
            let cf_owners = self.cf(owners)?;
            for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                batch.delete_cf(cf_owners, &key[prefix.len()..]);
                batch.delete_cf(cf, &key);
            }
        }

        self.commit(batch)
    }

    pub fn update_layer_name(&self, workspace_id: &str, layer_id: &str, name: &str) -> Result<(), StoreError> {
        self.update_layer(workspace_id, layer_id, |layer| layer.name = name.to_string())
    }

    pub fn update_layer_color(&self, workspace_id: &str, layer_id: &str, color: &str) -> Result<(), StoreError> {
        self.update_layer(workspace_id, layer_id, |layer| layer.color = color.to_string())
    }

    pub fn toggle_layer_visibility(&self, workspace_id: &str, layer_id: &str) -> Result<(), StoreError> {
        self.update_layer(workspace_id, layer_id, |layer| layer.visible = !layer.visible)
    }

    /// Rewrite positions so that `layer_ids[i]` sits at position `i`.
    ///
    /// Ids that are not layers of this workspace are skipped.
    pub fn reorder_layers(&self, workspace_id: &str, layer_ids: &[String]) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(CF_LAYERS)?;
        let mut batch = WriteBatch::default();
        for (position, layer_id) in layer_ids.iter().enumerate() {
            let key = scoped_key(workspace_id, layer_id.as_bytes());
            if let Some(bytes) = self.db.get_cf(cf, &key)? {
                let mut record: LayerRecord = decode(&bytes)?;
                record.position = position as i64;
                batch.put_cf(cf, &key, encode(&record)?);
            }
        }
        self.commit(batch)
    }

    fn update_layer(
        &self,
        workspace_id: &str,
        layer_id: &str,
        apply: impl FnOnce(&mut LayerRecord),
    ) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(CF_LAYERS)?;
        let key = scoped_key(workspace_id, layer_id.as_bytes());
        let Some(bytes) = self.db.get_cf(cf, &key)? else {
            return Ok(());
        };
        let mut record: LayerRecord = decode(&bytes)?;
        apply(&mut record);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, encode(&record)?);
        self.commit(batch)
    }

    fn layers_in(&self, workspace_id: &str) -> Result<Vec<LayerRecord>, StoreError> {
        let prefix = scope_prefix(workspace_id);
        collect_prefixed(
            self.db
                .iterator_cf(self.cf(CF_LAYERS)?, IteratorMode::From(&prefix, Direction::Forward)),
            &prefix,
        )
    }

    // ─── Annotations ──────────────────────────────────────────────────

    pub fn add_highlight(&self, layer_id: &str, highlight: &Highlight) -> Result<(), StoreError> {
        self.insert_annotation(CF_HIGHLIGHTS, "highlight", layer_id, &highlight.id, highlight)
    }

    pub fn remove_highlight(&self, layer_id: &str, highlight_id: &str) -> Result<(), StoreError> {
        self.delete_annotation(CF_HIGHLIGHTS, layer_id, highlight_id)
    }

    pub fn update_highlight_annotation(
        &self,
        layer_id: &str,
        highlight_id: &str,
        annotation: &str,
    ) -> Result<(), StoreError> {
        self.update_annotation(CF_HIGHLIGHTS, layer_id, highlight_id, |h: &mut Highlight| {
            h.annotation = annotation.to_string()
        })
    }

    pub fn add_arrow(&self, layer_id: &str, arrow: &Arrow) -> Result<(), StoreError> {
        self.insert_annotation(CF_ARROWS, "arrow", layer_id, &arrow.id, arrow)
    }

    pub fn remove_arrow(&self, layer_id: &str, arrow_id: &str) -> Result<(), StoreError> {
        self.delete_annotation(CF_ARROWS, layer_id, arrow_id)
    }

    pub fn update_arrow_style(&self, layer_id: &str, arrow_id: &str, arrow_style: &str) -> Result<(), StoreError> {
        self.update_annotation(CF_ARROWS, layer_id, arrow_id, |a: &mut Arrow| {
            a.arrow_style = arrow_style.to_string()
        })
    }

    pub fn add_underline(&self, layer_id: &str, underline: &Underline) -> Result<(), StoreError> {
        self.insert_annotation(CF_UNDERLINES, "underline", layer_id, &underline.id, underline)
    }

    pub fn remove_underline(&self, layer_id: &str, underline_id: &str) -> Result<(), StoreError> {
        self.delete_annotation(CF_UNDERLINES, layer_id, underline_id)
    }

    /// Count the annotations currently attached to a layer.
    pub fn count_annotations(&self, layer_id: &str) -> Result<AnnotationCounts, StoreError> {
        let prefix = scope_prefix(layer_id);
        let count = |name: &str| -> Result<usize, StoreError> {
            let mut n = 0;
            for item in self.db.iterator_cf(self.cf(name)?, IteratorMode::From(&prefix, Direction::Forward)) {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                n += 1;
            }
            Ok(n)
        };
        Ok(AnnotationCounts {
            highlights: count(CF_HIGHLIGHTS)?,
            arrows: count(CF_ARROWS)?,
            underlines: count(CF_UNDERLINES)?,
        })
    }

    fn insert_annotation<T: Serialize>(
        &self,
        cf_name: &str,
        kind: &str,
        layer_id: &str,
        annotation_id: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        if self.db.get_cf(self.cf(CF_LAYER_OWNERS)?, layer_id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(format!("layer {layer_id}")));
        }
        let cf_owners = self.cf(owner_family(cf_name)?)?;
        if self.db.get_cf(cf_owners, annotation_id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(format!("{kind} {annotation_id}")));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(cf_name)?, scoped_key(layer_id, annotation_id.as_bytes()), encode(record)?);
        batch.put_cf(cf_owners, annotation_id.as_bytes(), layer_id.as_bytes());
        self.commit(batch)
    }

    fn delete_annotation(&self, cf_name: &str, layer_id: &str, annotation_id: &str) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(cf_name)?;
        let key = scoped_key(layer_id, annotation_id.as_bytes());
        // The id may belong to another layer; leave its owner entry alone
        if self.db.get_cf(cf, &key)?.is_none() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, &key);
        batch.delete_cf(self.cf(owner_family(cf_name)?)?, annotation_id.as_bytes());
        self.commit(batch)
    }

    fn update_annotation<T: Serialize + DeserializeOwned>(
        &self,
        cf_name: &str,
        layer_id: &str,
        annotation_id: &str,
        apply: impl FnOnce(&mut T),
    ) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(cf_name)?;
        let key = scoped_key(layer_id, annotation_id.as_bytes());
        let Some(bytes) = self.db.get_cf(cf, &key)? else {
            return Ok(());
        };
        let mut record: T = decode(&bytes)?;
        apply(&mut record);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, encode(&record)?);
        self.commit(batch)
    }

    // ─── Editors ──────────────────────────────────────────────────────

    /// Insert an editor at `index`. Existing editors are not shifted.
    pub fn add_editor(&self, workspace_id: &str, index: i64, name: &str) -> Result<(), StoreError> {
        let mut writer = self.lock()?;
        self.require_workspace(workspace_id)?;

        let editor_id = writer.last_editor_id + 1;
        let record = EditorRecord {
            id: editor_id,
            index,
            name: name.to_string(),
            visible: true,
            content: None,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_EDITORS)?, editor_key(workspace_id, editor_id), encode(&record)?);
        batch.put_cf(self.cf(CF_META)?, META_EDITOR_SEQ, editor_id.to_be_bytes());
        self.commit(batch)?;

        writer.last_editor_id = editor_id;
        Ok(())
    }

    /// Delete the editor(s) at `index`, then re-index the rest to `0..n`.
    pub fn remove_editor(&self, workspace_id: &str, index: i64) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(CF_EDITORS)?;
        let mut batch = WriteBatch::default();
        let mut next_index = 0i64;
        for mut record in self.editors_in(workspace_id)? {
            let key = editor_key(workspace_id, record.id);
            if record.index == index {
                batch.delete_cf(cf, &key);
                continue;
            }
            if record.index != next_index {
                record.index = next_index;
                batch.put_cf(cf, &key, encode(&record)?);
            }
            next_index += 1;
        }
        self.commit(batch)
    }

    pub fn update_section_name(&self, workspace_id: &str, index: i64, name: &str) -> Result<(), StoreError> {
        self.update_editors_at(workspace_id, index, |e| {
            e.name = name.to_string();
            Ok(())
        })
    }

    pub fn toggle_section_visibility(&self, workspace_id: &str, index: i64) -> Result<(), StoreError> {
        self.update_editors_at(workspace_id, index, |e| {
            e.visible = !e.visible;
            Ok(())
        })
    }

    /// Move editors so that the editor formerly at `permutation[i]` ends up at `i`.
    ///
    /// Old indices that match no editor are skipped.
    pub fn reorder_editors(&self, workspace_id: &str, permutation: &[i64]) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(CF_EDITORS)?;
        let by_index: HashMap<i64, EditorRecord> = self
            .editors_in(workspace_id)?
            .into_iter()
            .map(|e| (e.index, e))
            .collect();

        let mut batch = WriteBatch::default();
        for (new_index, old_index) in permutation.iter().enumerate() {
            let Some(record) = by_index.get(old_index) else {
                continue;
            };
            let mut moved = record.clone();
            moved.index = new_index as i64;
            batch.put_cf(cf, editor_key(workspace_id, moved.id), encode(&moved)?);
        }
        self.commit(batch)
    }

    /// Replace the content document of the editor(s) at `index`.
    pub fn update_editor_content(&self, workspace_id: &str, index: i64, content: &Value) -> Result<(), StoreError> {
        let json = serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        self.update_editors_at(workspace_id, index, |e| {
            e.content = Some(compressed.clone());
            Ok(())
        })
    }

    fn update_editors_at(
        &self,
        workspace_id: &str,
        index: i64,
        mut apply: impl FnMut(&mut EditorRecord) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let _writer = self.lock()?;
        let cf = self.cf(CF_EDITORS)?;
        let mut batch = WriteBatch::default();
        for mut record in self.editors_in(workspace_id)? {
            if record.index != index {
                continue;
            }
            apply(&mut record)?;
            batch.put_cf(cf, editor_key(workspace_id, record.id), encode(&record)?);
        }
        self.commit(batch)
    }

    /// Editors of a workspace ordered by (index, id).
    fn editors_in(&self, workspace_id: &str) -> Result<Vec<EditorRecord>, StoreError> {
        let prefix = scope_prefix(workspace_id);
        let mut editors: Vec<EditorRecord> = collect_prefixed(
            self.db
                .iterator_cf(self.cf(CF_EDITORS)?, IteratorMode::From(&prefix, Direction::Forward)),
            &prefix,
        )?;
        editors.sort_by_key(|e| (e.index, e.id));
        Ok(editors)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Force a memtable flush to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterState>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::Poisoned)
    }

    fn require_workspace(&self, workspace_id: &str) -> Result<(), StoreError> {
        if self.workspace_exists(workspace_id)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("workspace {workspace_id}")))
        }
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

/// `len(scope) ‖ scope`: the prefix shared by every key in one scope.
fn owner_family(records: &str) -> Result<&'static str, StoreError> {
    ANNOTATION_FAMILIES
        .iter()
        .find(|(name, _)| *name == records)
        .map(|(_, owners)| *owners)
        .ok_or_else(|| StoreError::Database(format!("No owner index for '{records}'")))
}

fn scope_prefix(scope: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + scope.len());
    prefix.extend_from_slice(&(scope.len() as u32).to_be_bytes());
    prefix.extend_from_slice(scope.as_bytes());
    prefix
}

fn scoped_key(scope: &str, id: &[u8]) -> Vec<u8> {
    let mut key = scope_prefix(scope);
    key.extend_from_slice(id);
    key
}

fn editor_key(workspace_id: &str, editor_id: u64) -> Vec<u8> {
    scoped_key(workspace_id, &editor_id.to_be_bytes())
}

/// Decode every value whose key starts with `prefix`, stopping at the first key past it.
fn collect_prefixed<T, I>(iter: I, prefix: &[u8]) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
    I: Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut out = Vec::new();
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push(decode(&value)?);
    }
    Ok(out)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Unreadable content is reported as absent rather than failing the snapshot.
fn decode_content(editor_id: u64, compressed: &[u8]) -> Option<Value> {
    let json = match lz4_flex::decompress_size_prepended(compressed) {
        Ok(json) => json,
        Err(e) => {
            log::warn!("Editor {editor_id}: corrupt content block: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Editor {editor_id}: unparseable content document: {e}");
            None
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
