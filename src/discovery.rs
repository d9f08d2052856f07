//! Schema Discovery (C2): adapter-based discovery of native schemas, a
//! TTL+LRU cache keyed by system id, and schema comparison.

use crate::error::{InputError, MappingEngineError, Result};
use crate::typemap::{self, NativeTable};
use crate::types::{TableSchema, UniversalSchema, UniversalType};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a concrete system (Postgres, MySQL, a file source, ...) exposes to
/// the discovery service. Implementations live with the systems they talk
/// to; the engine only depends on this trait.
#[async_trait]
pub trait SystemAdapter: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn discover_schemas(&self) -> Result<Vec<NativeTable>>;
    async fn get_sample_data(
        &self,
        schema: &str,
        table: &str,
        options: SampleOptions,
    ) -> Result<Vec<serde_json::Value>>;
    async fn get_table_statistics(&self, schema: &str, table: &str) -> Result<Option<TableStatistics>> {
        let _ = (schema, table);
        Ok(None)
    }
    fn system_type(&self) -> &str;
}

#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    pub limit: usize,
    pub offset: usize,
    pub order_by: Option<String>,
    pub order_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableStatistics {
    pub row_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub system_id: String,
    pub schema: UniversalSchema,
    pub discovered_at: Instant,
}

struct CacheEntry {
    result: DiscoveryResult,
    inserted_at: Instant,
}

/// TTL + LRU-eviction cache, keyed by system id, per spec section 3's
/// "Schema discovery cache".
struct DiscoveryCache {
    entries: DashMap<String, CacheEntry>,
    order: parking_lot::Mutex<VecDeque<String>>,
    ttl: Duration,
    max_size: usize,
}

impl DiscoveryCache {
    fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: parking_lot::Mutex::new(VecDeque::new()),
            ttl,
            max_size,
        }
    }

    fn get(&self, key: &str) -> Option<DiscoveryResult> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.result.clone())
    }

    fn put(&self, key: String, result: DiscoveryResult) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            let evicted = self.order.lock().pop_front();
            if let Some(evicted) = evicted {
                self.entries.remove(&evicted);
            }
        }
        self.order.lock().push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.entries.remove(key);
        self.order.lock().retain(|k| k != key);
    }

    fn status(&self) -> (usize, usize) {
        (self.entries.len(), self.max_size)
    }
}

impl Clone for DiscoveryResult {
    fn clone(&self) -> Self {
        Self {
            system_id: self.system_id.clone(),
            schema: self.schema.clone(),
            discovered_at: self.discovered_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub compatibility_score: i32,
    pub warnings: Vec<String>,
    pub mapping_suggestions: Vec<String>,
}

/// Schema Discovery service (C2).
pub struct SchemaDiscoveryService {
    adapters: DashMap<String, Arc<dyn SystemAdapter>>,
    cache: DiscoveryCache,
}

impl SchemaDiscoveryService {
    pub fn new() -> Self {
        Self::with_cache_options(Duration::from_secs(3600), 1000)
    }

    pub fn with_cache_options(ttl: Duration, max_size: usize) -> Self {
        Self {
            adapters: DashMap::new(),
            cache: DiscoveryCache::new(ttl, max_size),
        }
    }

    pub fn register_adapter(&self, system_id: impl Into<String>, adapter: Arc<dyn SystemAdapter>) {
        self.adapters.insert(system_id.into(), adapter);
    }

    fn adapter_for(&self, system_id: &str) -> Result<Arc<dyn SystemAdapter>> {
        self.adapters
            .get(system_id)
            .map(|a| a.clone())
            .ok_or_else(|| {
                MappingEngineError::Input {
                    source: InputError::MappingValidation {
                        message: format!("no system adapter registered for '{system_id}' (SystemNotFound)"),
                    },
                }
            })
    }

    pub async fn discover(&self, system_id: &str, force_refresh: bool) -> Result<DiscoveryResult> {
        if !force_refresh {
            if let Some(cached) = self.cache.get(system_id) {
                return Ok(cached);
            }
        }

        let adapter = self.adapter_for(system_id)?;
        adapter.connect().await?;
        let tables = adapter.discover_schemas().await;
        adapter.disconnect().await.ok();
        let tables = tables?;

        let schema = typemap::map_schema(&tables, adapter.system_type());
        let result = DiscoveryResult {
            system_id: system_id.to_string(),
            schema,
            discovered_at: Instant::now(),
        };
        self.cache.put(system_id.to_string(), result.clone());
        Ok(result)
    }

    pub async fn get_sample_rows(
        &self,
        system_id: &str,
        schema: &str,
        table: &str,
        options: SampleOptions,
    ) -> Result<Vec<serde_json::Value>> {
        let adapter = self.adapter_for(system_id)?;
        adapter.get_sample_data(schema, table, options).await
    }

    pub async fn get_table_stats(
        &self,
        system_id: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<TableStatistics>> {
        let adapter = self.adapter_for(system_id)?;
        adapter.get_table_statistics(schema, table).await
    }

    pub fn invalidate_cache(&self, system_id: &str) {
        self.cache.invalidate(system_id);
    }

    pub fn cache_status(&self) -> (usize, usize) {
        self.cache.status()
    }

    /// Compares two schemas and scores compatibility per spec 4.2: start at
    /// 100, -5 per missing target column, -10 per incompatible type
    /// mismatch, warnings for nullability tightening, suggestions for
    /// compatible-but-different types.
    pub fn compare(&self, source: &UniversalSchema, target: &UniversalSchema) -> Comparison {
        let mut score: i32 = 100;
        let mut warnings = Vec::new();
        let mut mapping_suggestions = Vec::new();

        let source_table = source.tables.first();
        let target_table = target.tables.first();

        let (Some(source_table), Some(target_table)) = (source_table, target_table) else {
            return Comparison {
                compatibility_score: 0,
                warnings: vec!["one of the schemas has no tables to compare".to_string()],
                mapping_suggestions,
            };
        };

        for source_col in &source_table.columns {
            match find_column(target_table, &source_col.name) {
                None => {
                    score -= 5;
                    warnings.push(format!("target column '{}' is missing", source_col.name));
                }
                Some(target_col) => {
                    if is_incompatible(source_col.universal_type, target_col.universal_type) {
                        score -= 10;
                        warnings.push(format!(
                            "column '{}' type mismatch: {} -> {}",
                            source_col.name, source_col.universal_type, target_col.universal_type
                        ));
                    } else if source_col.universal_type != target_col.universal_type {
                        mapping_suggestions.push(format!(
                            "column '{}' can be mapped: {} -> {}",
                            source_col.name, source_col.universal_type, target_col.universal_type
                        ));
                    }
                    if source_col.nullable && !target_col.nullable {
                        warnings.push(format!(
                            "column '{}' tightens nullability (nullable -> not null)",
                            source_col.name
                        ));
                    }
                }
            }
        }

        Comparison {
            compatibility_score: score.max(0),
            warnings,
            mapping_suggestions,
        }
    }
}

impl Default for SchemaDiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

fn find_column<'a>(table: &'a TableSchema, name: &str) -> Option<&'a crate::types::ColumnSchema> {
    table.columns.iter().find(|c| c.name == name)
}

fn is_incompatible(source: UniversalType, target: UniversalType) -> bool {
    use UniversalType::*;
    if source == target {
        return false;
    }
    let numeric = |t: UniversalType| {
        matches!(
            t,
            Integer | Bigint | Smallint | Decimal | Numeric | Float | Double | Real
        )
    };
    let textual = |t: UniversalType| matches!(t, Varchar | Char | Text | Longtext);
    if numeric(source) && numeric(target) {
        return false;
    }
    if textual(source) && textual(target) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnSchema;

    fn column(name: &str, universal_type: UniversalType, nullable: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            universal_type,
            native_type: "x".into(),
            length: None,
            precision: None,
            scale: None,
            nullable,
            default_value: None,
            is_primary_key: false,
            is_foreign_key: false,
            is_unique: false,
            ordinal_position: 0,
            comment: None,
        }
    }

    #[test]
    fn compare_penalizes_missing_column() {
        let service = SchemaDiscoveryService::new();
        let source = UniversalSchema {
            system_type: "postgresql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![column("id", UniversalType::Integer, false)],
            }],
        };
        let target = UniversalSchema {
            system_type: "mysql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![],
            }],
        };
        let comparison = service.compare(&source, &target);
        assert_eq!(comparison.compatibility_score, 95);
    }

    #[test]
    fn compare_penalizes_incompatible_type() {
        let service = SchemaDiscoveryService::new();
        let source = UniversalSchema {
            system_type: "postgresql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![column("id", UniversalType::Integer, false)],
            }],
        };
        let target = UniversalSchema {
            system_type: "mysql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![column("id", UniversalType::Text, false)],
            }],
        };
        let comparison = service.compare(&source, &target);
        assert_eq!(comparison.compatibility_score, 90);
    }

    #[test]
    fn compare_suggests_compatible_numeric_widening() {
        let service = SchemaDiscoveryService::new();
        let source = UniversalSchema {
            system_type: "postgresql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![column("amount", UniversalType::Integer, false)],
            }],
        };
        let target = UniversalSchema {
            system_type: "mysql".into(),
            tables: vec![TableSchema {
                name: "t".into(),
                columns: vec![column("amount", UniversalType::Bigint, false)],
            }],
        };
        let comparison = service.compare(&source, &target);
        assert_eq!(comparison.compatibility_score, 100);
        assert_eq!(comparison.mapping_suggestions.len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_beyond_max_size() {
        let cache = DiscoveryCache::new(Duration::from_secs(60), 2);
        for i in 0..3 {
            cache.put(
                format!("sys{i}"),
                DiscoveryResult {
                    system_id: format!("sys{i}"),
                    schema: UniversalSchema::default(),
                    discovered_at: Instant::now(),
                },
            );
        }
        assert_eq!(cache.status().0, 2);
        assert!(cache.get("sys0").is_none());
        assert!(cache.get("sys2").is_some());
    }
}
