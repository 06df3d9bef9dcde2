//! SQLite-backed store for content, steps, derivations, and results.
//!
//! [`SqliteStore`] persists everything the engine touches in a SQLite
//! database with WAL mode, transactions on every multi-row write, and
//! automatic schema migrations. Complex values are stored as canonical
//! JSON TEXT columns.
//!
//! Two write paths are transactional by contract:
//! - derivation creation/update runs the whole recipe flattening plus the
//!   derivation row write in one transaction, so a crash cannot leak a
//!   partial step tree;
//! - [`SqliteStore::commit_step_result`] writes the output blob, the
//!   result-cache row, and the step link together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use lmflow_core::canonical::canonicalize;
use lmflow_core::{
    CacheKey, ContentHash, DependencyNode, DerivationId, DocId, InputDescriptor, StepId,
    StepParams, Warning,
};

use crate::error::StorageError;
use crate::types::{Derivation, LinkedStepResult, ResolvedPin, StepResultRow};

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }

    // -----------------------------------------------------------------------
    // Content store
    // -----------------------------------------------------------------------

    /// Stores a content blob. Idempotent: duplicates are silently ignored.
    ///
    /// The caller always computes `hash` from `content`, so a hash
    /// collision with different bytes cannot occur here.
    pub fn put_content(&mut self, hash: &ContentHash, content: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO content_cache (content_hash, content) VALUES (?1, ?2)",
            params![hash.as_str(), content],
        )?;
        Ok(())
    }

    /// Fetches a content blob by hash.
    pub fn get_content(&self, hash: &ContentHash) -> Result<Option<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT content FROM content_cache WHERE content_hash = ?1")?;
        Ok(stmt
            .query_row(params![hash.as_str()], |row| row.get(0))
            .optional()?)
    }

    // -----------------------------------------------------------------------
    // Documents (pinned-path resolution)
    // -----------------------------------------------------------------------

    /// Creates or updates the document behind an absolute path.
    ///
    /// Document rows are owned by the filesystem collaborator; this helper
    /// exists for that collaborator and for tests.
    pub fn upsert_document(
        &mut self,
        absolute_path: &str,
        hash: &ContentHash,
    ) -> Result<DocId, StorageError> {
        let tx = self.conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT doc_id FROM document_paths WHERE absolute_path = ?1",
                params![absolute_path],
                |row| row.get(0),
            )
            .optional()?;
        let doc_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE documents SET content_hash = ?1 WHERE doc_id = ?2",
                    params![hash.as_str(), id],
                )?;
                DocId::new(id)
            }
            None => {
                let id = DocId::random();
                tx.execute(
                    "INSERT INTO documents (doc_id, content_hash) VALUES (?1, ?2)",
                    params![id.as_str(), hash.as_str()],
                )?;
                tx.execute(
                    "INSERT INTO document_paths (doc_id, absolute_path) VALUES (?1, ?2)",
                    params![id.as_str(), absolute_path],
                )?;
                id
            }
        };
        tx.commit()?;
        Ok(doc_id)
    }

    /// Looks up the document behind an absolute path.
    pub fn find_doc_by_path(&self, absolute_path: &str) -> Result<Option<DocId>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT doc_id FROM document_paths WHERE absolute_path = ?1")?;
        Ok(stmt
            .query_row(params![absolute_path], |row| row.get::<_, String>(0))
            .optional()?
            .map(DocId::new))
    }

    /// Looks up the current content hash of a document.
    pub fn get_document_hash(&self, doc_id: &DocId) -> Result<Option<ContentHash>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT content_hash FROM documents WHERE doc_id = ?1")?;
        Ok(stmt
            .query_row(params![doc_id.as_str()], |row| row.get::<_, String>(0))
            .optional()?
            .map(ContentHash::from_hex))
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Persists a flattened step, replacing its input-index rows.
    pub fn define_step(&mut self, step_params: &StepParams) -> Result<StepId, StorageError> {
        let tx = self.conn.transaction()?;
        let step_id = define_step_in_tx(&tx, step_params)?;
        tx.commit()?;
        Ok(step_id)
    }

    /// Loads a step's canonical parameters.
    pub fn get_step_params(&self, step_id: &StepId) -> Result<Option<StepParams>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT operation_params FROM steps WHERE step_id = ?1")?;
        let raw: Option<String> = stmt
            .query_row(params![step_id.as_str()], |row| row.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Derivations
    // -----------------------------------------------------------------------

    /// Flattens an external recipe and creates a derivation for it, all
    /// under one write transaction.
    pub fn create_derivation(
        &mut self,
        recipe: &StepParams,
        label: Option<&str>,
        dsl_expression: &str,
    ) -> Result<Derivation, StorageError> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        let (final_step_id, flattened) = deep_define_step(&tx, recipe)?;
        let derivation_id = allocate_slug(&tx, label)?;
        tx.execute(
            "INSERT INTO derivations (derivation_id, recipe_params, label, final_step_id, \
             dsl_expression, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                derivation_id.as_str(),
                canonicalize(&flattened)?,
                label,
                final_step_id.as_str(),
                dsl_expression,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(Derivation {
            derivation_id,
            recipe_params: flattened,
            label: label.map(str::to_string),
            final_step_id,
            dsl_expression: dsl_expression.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Re-flattens a recipe and rewrites an existing derivation in place.
    /// `created_at` is preserved; `updated_at` is refreshed. The previous
    /// step tree is left behind (reachability GC is future work).
    pub fn update_derivation(
        &mut self,
        id: &DerivationId,
        recipe: &StepParams,
        label: Option<&str>,
        dsl_expression: &str,
    ) -> Result<Derivation, StorageError> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        let created_at: Option<String> = tx
            .query_row(
                "SELECT created_at FROM derivations WHERE derivation_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let created_at = match created_at {
            Some(raw) => parse_timestamp(&raw)?,
            None => return Err(StorageError::DerivationNotFound(id.clone())),
        };
        let (final_step_id, flattened) = deep_define_step(&tx, recipe)?;
        tx.execute(
            "UPDATE derivations SET recipe_params = ?1, label = ?2, final_step_id = ?3, \
             dsl_expression = ?4, updated_at = ?5 WHERE derivation_id = ?6",
            params![
                canonicalize(&flattened)?,
                label,
                final_step_id.as_str(),
                dsl_expression,
                now.to_rfc3339(),
                id.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(Derivation {
            derivation_id: id.clone(),
            recipe_params: flattened,
            label: label.map(str::to_string),
            final_step_id,
            dsl_expression: dsl_expression.to_string(),
            created_at,
            updated_at: now,
        })
    }

    /// Removes a derivation row. Dangling steps and cache rows remain.
    pub fn delete_derivation(&mut self, id: &DerivationId) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM derivations WHERE derivation_id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Loads a derivation by slug.
    pub fn find_derivation(&self, id: &DerivationId) -> Result<Option<Derivation>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT derivation_id, recipe_params, label, final_step_id, dsl_expression, \
             created_at, updated_at FROM derivations WHERE derivation_id = ?1",
        )?;
        let raw = stmt
            .query_row(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;
        raw.map(derivation_from_raw).transpose()
    }

    /// Lists every derivation, oldest first.
    pub fn get_all_derivations(&self) -> Result<Vec<Derivation>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT derivation_id, recipe_params, label, final_step_id, dsl_expression, \
             created_at, updated_at FROM derivations ORDER BY created_at, derivation_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(derivation_from_raw(row?)?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Result cache
    // -----------------------------------------------------------------------

    /// Inserts a result-cache row; an existing row for the key wins.
    pub fn insert_step_result(&mut self, row: &StepResultRow) -> Result<(), StorageError> {
        insert_step_result_in_tx(&self.conn, row)
    }

    /// Points a step at a cache row, replacing any previous link.
    pub fn link_step_to_cache(
        &mut self,
        step_id: &StepId,
        cache_key: &CacheKey,
        dependency_tree: &[DependencyNode],
    ) -> Result<(), StorageError> {
        link_step_in_tx(&self.conn, step_id, cache_key, dependency_tree)
    }

    /// The atomic persistence boundary of a computed step: output blob,
    /// result-cache row, and step link commit together or not at all.
    pub fn commit_step_result(
        &mut self,
        step_id: &StepId,
        row: &StepResultRow,
        output: &str,
        dependency_tree: &[DependencyNode],
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO content_cache (content_hash, content) VALUES (?1, ?2)",
            params![row.output_content_hash.as_str(), output],
        )?;
        insert_step_result_in_tx(&tx, row)?;
        link_step_in_tx(&tx, step_id, &row.cache_key, dependency_tree)?;
        tx.commit()?;
        Ok(())
    }

    /// Loads a cache row by key.
    pub fn find_result_by_cache_key(
        &self,
        cache_key: &CacheKey,
    ) -> Result<Option<StepResultRow>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cache_key, output_content_hash, resolved_pinned_input_hashes, \
             input_content_hashes, warnings, computed_at FROM step_results WHERE cache_key = ?1",
        )?;
        let raw = stmt
            .query_row(params![cache_key.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;
        raw.map(result_row_from_raw).transpose()
    }

    /// Loads the cache row a step currently links to, with the step's own
    /// dependency tree.
    pub fn find_result_by_step(
        &self,
        step_id: &StepId,
    ) -> Result<Option<LinkedStepResult>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT r.cache_key, r.output_content_hash, r.resolved_pinned_input_hashes, \
             r.input_content_hashes, r.warnings, r.computed_at, l.dependency_tree \
             FROM step_result_links l JOIN step_results r ON r.cache_key = l.cache_key \
             WHERE l.step_id = ?1",
        )?;
        let raw = stmt
            .query_row(params![step_id.as_str()], |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ),
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;
        match raw {
            Some((row_raw, tree_json)) => Ok(Some(LinkedStepResult {
                row: result_row_from_raw(row_raw)?,
                dependency_tree: serde_json::from_str(&tree_json)?,
            })),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Embedding side tables
    // -----------------------------------------------------------------------

    /// Stores (or replaces) the embedding of a content blob.
    pub fn insert_embedding(
        &mut self,
        hash: &ContentHash,
        embedding: &[u8],
        model_name: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO hash_embeddings (content_hash, embedding, model_name) \
             VALUES (?1, ?2, ?3)",
            params![hash.as_str(), embedding, model_name],
        )?;
        Ok(())
    }

    /// Appends an embedding usage-log row.
    pub fn log_embedding_usage(
        &mut self,
        hash: &ContentHash,
        model_name: &str,
        prompt_tokens: u64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO embedding_usage_log (timestamp, content_hash, model_name, prompt_tokens) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                hash.as_str(),
                model_name,
                prompt_tokens as i64,
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Walks an external recipe, defining child steps for every inline
/// sub-recipe and replacing each with an `internal_step_link`. Returns the
/// root step id and the flattened parameters. Runs entirely inside the
/// caller's transaction.
fn deep_define_step(
    tx: &Transaction<'_>,
    recipe: &StepParams,
) -> Result<(StepId, StepParams), StorageError> {
    let mut flattened = recipe.clone();
    for input in &mut flattened.inputs {
        if let InputDescriptor::ComputedStep { step } = input {
            let (child_id, _) = deep_define_step(tx, step)?;
            *input = InputDescriptor::InternalStepLink {
                target_step_id: child_id,
            };
        }
    }
    let step_id = define_step_in_tx(tx, &flattened)?;
    Ok((step_id, flattened))
}

fn define_step_in_tx(tx: &Transaction<'_>, params: &StepParams) -> Result<StepId, StorageError> {
    if !params.is_flattened() {
        return Err(StorageError::Integrity {
            reason: "define_step requires a flattened recipe".to_string(),
        });
    }
    let step_id = StepId::random();
    tx.execute(
        "INSERT INTO steps (step_id, operation_params, created_at) VALUES (?1, ?2, ?3)",
        params![
            step_id.as_str(),
            canonicalize(params)?,
            Utc::now().to_rfc3339(),
        ],
    )?;

    // Replace this step's rows in the two input-index tables.
    tx.execute(
        "DELETE FROM step_input_content WHERE step_id = ?1",
        params![step_id.as_str()],
    )?;
    tx.execute(
        "DELETE FROM step_input_step WHERE consuming_step_id = ?1",
        params![step_id.as_str()],
    )?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO step_input_content (step_id, input_content_hash) \
             VALUES (?1, ?2)",
        )?;
        for hash in params.pinned_content_hashes() {
            stmt.execute(params![step_id.as_str(), hash.as_str()])?;
        }
    }
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO step_input_step (consuming_step_id, providing_step_id) \
             VALUES (?1, ?2)",
        )?;
        for provider in params.step_refs() {
            stmt.execute(params![step_id.as_str(), provider.as_str()])?;
        }
    }
    Ok(step_id)
}

/// Derives a collision-free slug from an optional label.
fn allocate_slug(
    tx: &Transaction<'_>,
    label: Option<&str>,
) -> Result<DerivationId, StorageError> {
    let base = slugify(label.unwrap_or("derivation"));
    let mut candidate = base.clone();
    let mut suffix = 2u32;
    loop {
        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM derivations WHERE derivation_id = ?1)",
            params![candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(DerivationId::new(candidate));
        }
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
}

fn slugify(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let collapsed: Vec<&str> = mapped.split('-').filter(|part| !part.is_empty()).collect();
    if collapsed.is_empty() {
        "derivation".to_string()
    } else {
        collapsed.join("-")
    }
}

fn insert_step_result_in_tx(
    conn: &Connection,
    row: &StepResultRow,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO step_results (cache_key, output_content_hash, \
         resolved_pinned_input_hashes, input_content_hashes, warnings, computed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.cache_key.as_str(),
            row.output_content_hash.as_str(),
            serde_json::to_string(&row.resolved_pinned_input_hashes)?,
            serde_json::to_string(&row.input_content_hashes)?,
            serde_json::to_string(&row.warnings)?,
            row.computed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn link_step_in_tx(
    conn: &Connection,
    step_id: &StepId,
    cache_key: &CacheKey,
    dependency_tree: &[DependencyNode],
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO step_result_links (step_id, cache_key, dependency_tree) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT(step_id) DO UPDATE SET cache_key = excluded.cache_key, \
         dependency_tree = excluded.dependency_tree",
        params![
            step_id.as_str(),
            cache_key.as_str(),
            serde_json::to_string(dependency_tree)?,
        ],
    )?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Integrity {
            reason: format!("unparseable timestamp {:?}: {}", raw, e),
        })
}

type RawDerivation = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
);

fn derivation_from_raw(raw: RawDerivation) -> Result<Derivation, StorageError> {
    let (id, recipe_json, label, final_step_id, dsl, created_at, updated_at) = raw;
    Ok(Derivation {
        derivation_id: DerivationId::new(id),
        recipe_params: serde_json::from_str(&recipe_json)?,
        label,
        final_step_id: StepId::new(final_step_id),
        dsl_expression: dsl,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

type RawResultRow = (String, String, String, String, String, String);

fn result_row_from_raw(raw: RawResultRow) -> Result<StepResultRow, StorageError> {
    let (cache_key, output_hash, pinned_json, inputs_json, warnings_json, computed_at) = raw;
    let resolved_pinned_input_hashes: BTreeMap<String, ResolvedPin> =
        serde_json::from_str(&pinned_json)?;
    let input_content_hashes: Vec<ContentHash> = serde_json::from_str(&inputs_json)?;
    let warnings: Vec<Warning> = serde_json::from_str(&warnings_json)?;
    Ok(StepResultRow {
        cache_key: CacheKey::from_hex(cache_key),
        output_content_hash: ContentHash::from_hex(output_hash),
        resolved_pinned_input_hashes,
        input_content_hashes,
        warnings,
        computed_at: parse_timestamp(&computed_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().expect("in-memory store")
    }

    fn result_row(key: &CacheKey, output: &str) -> StepResultRow {
        StepResultRow {
            cache_key: key.clone(),
            output_content_hash: ContentHash::of(output),
            resolved_pinned_input_hashes: BTreeMap::new(),
            input_content_hashes: vec![ContentHash::of("in")],
            warnings: vec![],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn put_content_is_idempotent() {
        let mut store = store();
        let hash = ContentHash::of("hello");
        store.put_content(&hash, "hello").unwrap();
        store.put_content(&hash, "hello").unwrap();
        assert_eq!(store.get_content(&hash).unwrap().as_deref(), Some("hello"));

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM content_cache", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_content_is_none() {
        let store = store();
        assert!(store.get_content(&ContentHash::of("nope")).unwrap().is_none());
    }

    #[test]
    fn document_resolution_follows_path_then_doc() {
        let mut store = store();
        let first = ContentHash::of("one");
        let doc = store.upsert_document("/p", &first).unwrap();
        assert_eq!(store.find_doc_by_path("/p").unwrap(), Some(doc.clone()));
        assert_eq!(store.get_document_hash(&doc).unwrap(), Some(first));

        // Replacing the content keeps the doc id stable.
        let second = ContentHash::of("two");
        let same_doc = store.upsert_document("/p", &second).unwrap();
        assert_eq!(same_doc, doc);
        assert_eq!(store.get_document_hash(&doc).unwrap(), Some(second));
    }

    #[test]
    fn define_step_roundtrips_params_and_writes_indexes() {
        let mut store = store();
        let params = StepParams::new(
            "concat",
            vec![
                InputDescriptor::Content {
                    hash: ContentHash::of("a"),
                },
                InputDescriptor::Constant {
                    value: "b".to_string(),
                },
            ],
        );
        let step_id = store.define_step(&params).unwrap();
        assert_eq!(store.get_step_params(&step_id).unwrap(), Some(params));

        let indexed: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM step_input_content WHERE step_id = ?1",
                params![step_id.as_str()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(indexed, 2);
    }

    #[test]
    fn define_step_rejects_unflattened_recipes() {
        let mut store = store();
        let nested = StepParams::new(
            "identity",
            vec![InputDescriptor::ComputedStep {
                step: Box::new(StepParams::new("identity", vec![])),
            }],
        );
        assert!(matches!(
            store.define_step(&nested),
            Err(StorageError::Integrity { .. })
        ));
    }

    #[test]
    fn create_derivation_flattens_inline_steps() {
        let mut store = store();
        let recipe = StepParams::new(
            "identity",
            vec![InputDescriptor::ComputedStep {
                step: Box::new(StepParams::new(
                    "identity",
                    vec![InputDescriptor::Constant {
                        value: "x".to_string(),
                    }],
                )),
            }],
        );
        let derivation = store.create_derivation(&recipe, Some("My Label"), "id(id('x'))").unwrap();
        assert_eq!(derivation.derivation_id.as_str(), "my-label");
        assert!(derivation.recipe_params.is_flattened());

        // The inline child became a persisted step of its own.
        let child_id = match &derivation.recipe_params.inputs[0] {
            InputDescriptor::InternalStepLink { target_step_id } => target_step_id.clone(),
            other => panic!("expected internal_step_link, got {:?}", other),
        };
        let child = store.get_step_params(&child_id).unwrap().unwrap();
        assert_eq!(child.operation, "identity");

        // And the root params stored on the derivation match the root step.
        let root = store
            .get_step_params(&derivation.final_step_id)
            .unwrap()
            .unwrap();
        assert_eq!(root, derivation.recipe_params);

        // The consuming/providing step index row exists.
        let linked: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM step_input_step WHERE consuming_step_id = ?1 \
                 AND providing_step_id = ?2",
                params![derivation.final_step_id.as_str(), child_id.as_str()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, 1);
    }

    #[test]
    fn slugs_avoid_collisions_with_numeric_suffixes() {
        let mut store = store();
        let recipe = StepParams::new(
            "identity",
            vec![InputDescriptor::Constant {
                value: "x".to_string(),
            }],
        );
        let a = store.create_derivation(&recipe, Some("Report"), "r").unwrap();
        let b = store.create_derivation(&recipe, Some("Report"), "r").unwrap();
        let c = store.create_derivation(&recipe, Some("Report"), "r").unwrap();
        assert_eq!(a.derivation_id.as_str(), "report");
        assert_eq!(b.derivation_id.as_str(), "report-2");
        assert_eq!(c.derivation_id.as_str(), "report-3");
    }

    #[test]
    fn slugify_handles_awkward_labels() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("--- "), "derivation");
        assert_eq!(slugify("Já 2×2"), "j-2-2");
    }

    #[test]
    fn update_preserves_created_at_and_allocates_fresh_steps() {
        let mut store = store();
        let recipe = StepParams::new(
            "identity",
            vec![InputDescriptor::Constant {
                value: "x".to_string(),
            }],
        );
        let created = store.create_derivation(&recipe, Some("doc"), "x").unwrap();

        let replacement = StepParams::new(
            "identity",
            vec![InputDescriptor::Constant {
                value: "y".to_string(),
            }],
        );
        let updated = store
            .update_derivation(&created.derivation_id, &replacement, Some("doc"), "y")
            .unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert_ne!(updated.final_step_id, created.final_step_id);

        // Steps are immutable: the old root step still exists.
        assert!(store.get_step_params(&created.final_step_id).unwrap().is_some());
    }

    #[test]
    fn update_of_missing_derivation_fails() {
        let mut store = store();
        let recipe = StepParams::new("identity", vec![]);
        assert!(matches!(
            store.update_derivation(&DerivationId::from("ghost"), &recipe, None, ""),
            Err(StorageError::DerivationNotFound(_))
        ));
    }

    #[test]
    fn delete_derivation_removes_only_the_row() {
        let mut store = store();
        let recipe = StepParams::new(
            "identity",
            vec![InputDescriptor::Constant {
                value: "x".to_string(),
            }],
        );
        let derivation = store.create_derivation(&recipe, Some("gone"), "x").unwrap();
        store.delete_derivation(&derivation.derivation_id).unwrap();
        assert!(store.find_derivation(&derivation.derivation_id).unwrap().is_none());
        assert!(store.get_step_params(&derivation.final_step_id).unwrap().is_some());
    }

    #[test]
    fn result_rows_are_first_writer_wins() {
        let mut store = store();
        let key = CacheKey::from_hex("k1");
        let first = result_row(&key, "first");
        let second = result_row(&key, "second");
        store.insert_step_result(&first).unwrap();
        store.insert_step_result(&second).unwrap();

        let loaded = store.find_result_by_cache_key(&key).unwrap().unwrap();
        assert_eq!(loaded.output_content_hash, first.output_content_hash);
    }

    #[test]
    fn step_links_upsert_and_join_results() {
        let mut store = store();
        let step_id = store
            .define_step(&StepParams::new(
                "identity",
                vec![InputDescriptor::Constant {
                    value: "x".to_string(),
                }],
            ))
            .unwrap();

        let key_a = CacheKey::from_hex("ka");
        let key_b = CacheKey::from_hex("kb");
        store.insert_step_result(&result_row(&key_a, "a")).unwrap();
        store.insert_step_result(&result_row(&key_b, "b")).unwrap();

        let tree_a = vec![DependencyNode::Constant {
            hash: ContentHash::of("x"),
        }];
        store.link_step_to_cache(&step_id, &key_a, &tree_a).unwrap();
        let linked = store.find_result_by_step(&step_id).unwrap().unwrap();
        assert_eq!(linked.row.cache_key, key_a);
        assert_eq!(linked.dependency_tree, tree_a);

        // Re-linking the same step replaces key and tree.
        store.link_step_to_cache(&step_id, &key_b, &[]).unwrap();
        let relinked = store.find_result_by_step(&step_id).unwrap().unwrap();
        assert_eq!(relinked.row.cache_key, key_b);
        assert!(relinked.dependency_tree.is_empty());
    }

    #[test]
    fn commit_step_result_writes_blob_row_and_link() {
        let mut store = store();
        let step_id = store
            .define_step(&StepParams::new(
                "identity",
                vec![InputDescriptor::Constant {
                    value: "x".to_string(),
                }],
            ))
            .unwrap();
        let key = CacheKey::from_hex("kc");
        let row = result_row(&key, "payload");
        store
            .commit_step_result(&step_id, &row, "payload", &[])
            .unwrap();

        assert_eq!(
            store.get_content(&row.output_content_hash).unwrap().as_deref(),
            Some("payload")
        );
        assert!(store.find_result_by_cache_key(&key).unwrap().is_some());
        assert_eq!(
            store.find_result_by_step(&step_id).unwrap().unwrap().row.cache_key,
            key
        );
    }

    #[test]
    fn warnings_roundtrip_through_result_rows() {
        let mut store = store();
        let key = CacheKey::from_hex("kw");
        let mut row = result_row(&key, "out");
        row.warnings = vec![Warning::InputTooLarge {
            input_length: 11,
            limit: 10,
        }];
        store.insert_step_result(&row).unwrap();
        let loaded = store.find_result_by_cache_key(&key).unwrap().unwrap();
        assert_eq!(loaded.warnings, row.warnings);
    }

    #[test]
    fn embedding_tables_accept_rows() {
        let mut store = store();
        let hash = ContentHash::of("emb");
        store.insert_embedding(&hash, &[0u8, 1, 2], "embedder-v1").unwrap();
        store.log_embedding_usage(&hash, "embedder-v1", 7).unwrap();

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM embedding_usage_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
