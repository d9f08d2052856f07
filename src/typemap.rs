//! Universal Type Mapper (C1): normalizes native column types, per source
//! system, into the closed `UniversalType` set with a confidence score.

use crate::types::{MappingSource, TableSchema, TypeMappingResult, TypeMetadata, UniversalSchema, UniversalType};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// One entry in the ordered pattern table: first match wins.
struct PatternEntry {
    pattern: &'static str,
    universal_type: UniversalType,
}

static PATTERN_TABLE: Lazy<Vec<PatternEntry>> = Lazy::new(|| {
    vec![
        PatternEntry { pattern: "varchar|char", universal_type: UniversalType::Varchar },
        PatternEntry { pattern: "text", universal_type: UniversalType::Text },
        PatternEntry { pattern: "bigint", universal_type: UniversalType::Bigint },
        PatternEntry { pattern: "int", universal_type: UniversalType::Integer },
        PatternEntry { pattern: "decimal|numeric", universal_type: UniversalType::Decimal },
        PatternEntry { pattern: "float|double|real", universal_type: UniversalType::Float },
        PatternEntry { pattern: "bool", universal_type: UniversalType::Boolean },
        PatternEntry { pattern: "timestamp|datetime", universal_type: UniversalType::Timestamp },
        PatternEntry { pattern: "date", universal_type: UniversalType::Date },
        PatternEntry { pattern: "time", universal_type: UniversalType::Time },
        PatternEntry { pattern: "json", universal_type: UniversalType::Json },
        PatternEntry { pattern: "blob|binary", universal_type: UniversalType::Binary },
    ]
});

static COMPILED_PATTERNS: Lazy<Vec<(regex::Regex, UniversalType)>> = Lazy::new(|| {
    PATTERN_TABLE
        .iter()
        .map(|e| (regex::Regex::new(e.pattern).expect("pattern table entries are valid regex"), e.universal_type))
        .collect()
});

static POSTGRESQL_DICTIONARY: Lazy<HashMap<&'static str, UniversalType>> = Lazy::new(|| {
    use UniversalType::*;
    HashMap::from([
        ("integer", Integer),
        ("int4", Integer),
        ("bigint", Bigint),
        ("int8", Bigint),
        ("smallint", Smallint),
        ("int2", Smallint),
        ("numeric", Numeric),
        ("decimal", Decimal),
        ("real", Real),
        ("double precision", Double),
        ("character varying", Varchar),
        ("varchar", Varchar),
        ("character", Char),
        ("char", Char),
        ("text", Text),
        ("date", Date),
        ("time", Time),
        ("timestamp", Timestamp),
        ("timestamp without time zone", Timestamp),
        ("timestamp with time zone", Timestamp),
        ("boolean", Boolean),
        ("bytea", Binary),
        ("json", Json),
        ("jsonb", Jsonb),
        ("uuid", Uuid),
    ])
});

static MYSQL_DICTIONARY: Lazy<HashMap<&'static str, UniversalType>> = Lazy::new(|| {
    use UniversalType::*;
    HashMap::from([
        ("int", Integer),
        ("integer", Integer),
        ("bigint", Bigint),
        ("smallint", Smallint),
        ("tinyint", Smallint),
        ("decimal", Decimal),
        ("numeric", Numeric),
        ("float", Float),
        ("double", Double),
        ("varchar", Varchar),
        ("char", Char),
        ("text", Text),
        ("longtext", Longtext),
        ("date", Date),
        ("time", Time),
        ("datetime", Datetime),
        ("timestamp", Timestamp),
        ("boolean", Boolean),
        ("bool", Boolean),
        ("binary", Binary),
        ("varbinary", Varbinary),
        ("blob", Blob),
        ("json", Json),
    ])
});

static DEFAULT_DICTIONARY: Lazy<HashMap<&'static str, UniversalType>> = Lazy::new(|| {
    use UniversalType::*;
    HashMap::from([
        ("integer", Integer),
        ("int", Integer),
        ("bigint", Bigint),
        ("smallint", Smallint),
        ("decimal", Decimal),
        ("numeric", Numeric),
        ("float", Float),
        ("double", Double),
        ("varchar", Varchar),
        ("char", Char),
        ("text", Text),
        ("date", Date),
        ("time", Time),
        ("datetime", Datetime),
        ("timestamp", Timestamp),
        ("boolean", Boolean),
        ("binary", Binary),
        ("json", Json),
        ("uuid", Uuid),
    ])
});

fn dictionary_for(system_type: &str) -> &'static HashMap<&'static str, UniversalType> {
    match system_type.to_ascii_lowercase().as_str() {
        "postgresql" | "postgres" => &POSTGRESQL_DICTIONARY,
        "mysql" | "mariadb" => &MYSQL_DICTIONARY,
        _ => &DEFAULT_DICTIONARY,
    }
}

fn mapping_source_for(system_type: &str) -> MappingSource {
    match system_type.to_ascii_lowercase().as_str() {
        "postgresql" | "postgres" => MappingSource::Postgresql,
        "mysql" | "mariadb" => MappingSource::Mysql,
        _ => MappingSource::Default,
    }
}

/// Strip a parenthesized parameter suffix, e.g. `"varchar(255)"` -> `"varchar"`.
fn strip_parameter_suffix(native_type: &str) -> &str {
    match native_type.find('(') {
        Some(idx) => native_type[..idx].trim(),
        None => native_type,
    }
}

/// Maps one native column type into the universal type system (C1).
///
/// Selection order follows spec section 4.1 exactly: normalize, exact match,
/// strip-suffix retry, special cases, ordered pattern table, else unknown.
pub fn map_type(native_type: &str, system_type: &str, metadata: Option<TypeMetadata>) -> TypeMappingResult {
    let normalized = native_type.trim().to_ascii_lowercase();
    let dictionary = dictionary_for(system_type);
    let source = mapping_source_for(system_type);
    let metadata = metadata.unwrap_or_default();

    if let Some(universal_type) = dictionary.get(normalized.as_str()) {
        return TypeMappingResult {
            universal_type: *universal_type,
            native_type: native_type.to_string(),
            system_type: system_type.to_string(),
            metadata,
            mapping_source: source,
            confidence: 0.95,
        };
    }

    // Special cases (spec 4.1 step 3) run before the generic strip-suffix
    // retry below, since stripping "tinyint(1)" down to "tinyint" would
    // otherwise shadow it with the dictionary's plain-tinyint entry.
    let is_mysql = matches!(source, MappingSource::Mysql);
    if is_mysql && normalized == "tinyint(1)" {
        return TypeMappingResult {
            universal_type: UniversalType::Boolean,
            native_type: native_type.to_string(),
            system_type: system_type.to_string(),
            metadata,
            mapping_source: source,
            confidence: 0.95,
        };
    }
    let is_postgres = matches!(source, MappingSource::Postgresql);
    if is_postgres && normalized.ends_with("[]") {
        return TypeMappingResult {
            universal_type: UniversalType::Array,
            native_type: native_type.to_string(),
            system_type: system_type.to_string(),
            metadata,
            mapping_source: source,
            confidence: 0.95,
        };
    }

    let stripped = strip_parameter_suffix(&normalized);
    if stripped != normalized {
        if let Some(universal_type) = dictionary.get(stripped) {
            return TypeMappingResult {
                universal_type: *universal_type,
                native_type: native_type.to_string(),
                system_type: system_type.to_string(),
                metadata,
                mapping_source: source,
                confidence: 0.95,
            };
        }
    }

    for (pattern, universal_type) in COMPILED_PATTERNS.iter() {
        if pattern.is_match(&normalized) {
            return TypeMappingResult {
                universal_type: *universal_type,
                native_type: native_type.to_string(),
                system_type: system_type.to_string(),
                metadata,
                mapping_source: MappingSource::Pattern,
                confidence: 0.5,
            };
        }
    }

    TypeMappingResult {
        universal_type: UniversalType::Unknown,
        native_type: native_type.to_string(),
        system_type: system_type.to_string(),
        metadata,
        mapping_source: MappingSource::Pattern,
        confidence: 0.0,
    }
}

/// Recursively maps a native schema (tables -> columns) into a
/// `UniversalSchema`, preserving column metadata alongside the universal type.
pub fn map_schema(native_tables: &[NativeTable], system_type: &str) -> UniversalSchema {
    let tables = native_tables
        .iter()
        .map(|table| crate::types::TableSchema {
            name: table.name.clone(),
            columns: table
                .columns
                .iter()
                .map(|col| {
                    let mapped = map_type(
                        &col.native_type,
                        system_type,
                        Some(TypeMetadata {
                            length: col.length,
                            precision: col.precision,
                            scale: col.scale,
                            nullable: Some(col.nullable),
                            default_value: col.default_value.clone(),
                        }),
                    );
                    crate::types::ColumnSchema {
                        name: col.name.clone(),
                        universal_type: mapped.universal_type,
                        native_type: col.native_type.clone(),
                        length: col.length,
                        precision: col.precision,
                        scale: col.scale,
                        nullable: col.nullable,
                        default_value: col.default_value.clone(),
                        is_primary_key: col.is_primary_key,
                        is_foreign_key: col.is_foreign_key,
                        is_unique: col.is_unique,
                        ordinal_position: col.ordinal_position,
                        comment: col.comment.clone(),
                    }
                })
                .collect(),
        })
        .collect::<Vec<TableSchema>>();

    UniversalSchema {
        system_type: system_type.to_string(),
        tables,
    }
}

/// Input shape `map_schema` consumes from a system adapter, ahead of
/// universal-type normalization.
#[derive(Debug, Clone)]
pub struct NativeTable {
    pub name: String,
    pub columns: Vec<NativeColumn>,
}

#[derive(Debug, Clone)]
pub struct NativeColumn {
    pub name: String,
    pub native_type: String,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
    pub default_value: Option<serde_json::Value>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub is_unique: bool,
    pub ordinal_position: u32,
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_dictionary_match_has_high_confidence() {
        let result = map_type("varchar", "postgresql", None);
        assert_eq!(result.universal_type, UniversalType::Varchar);
        assert_eq!(result.mapping_source, MappingSource::Postgresql);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn strips_parameter_suffix() {
        let result = map_type("varchar(255)", "mysql", None);
        assert_eq!(result.universal_type, UniversalType::Varchar);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn mysql_tinyint_one_is_boolean() {
        let result = map_type("tinyint(1)", "mysql", None);
        assert_eq!(result.universal_type, UniversalType::Boolean);
    }

    #[test]
    fn postgres_array_suffix() {
        let result = map_type("integer[]", "postgresql", None);
        assert_eq!(result.universal_type, UniversalType::Array);
    }

    #[test]
    fn pattern_fallback_for_unknown_system() {
        let result = map_type("custom_bigint_thing", "oracle", None);
        assert_eq!(result.universal_type, UniversalType::Bigint);
        assert_eq!(result.mapping_source, MappingSource::Pattern);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn no_match_is_unknown_with_zero_confidence() {
        let result = map_type("frobnicate", "oracle", None);
        assert_eq!(result.universal_type, UniversalType::Unknown);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn known_dictionaries_round_trip_with_high_confidence() {
        for (system, dict) in [
            ("postgresql", &*POSTGRESQL_DICTIONARY),
            ("mysql", &*MYSQL_DICTIONARY),
        ] {
            for native in dict.keys() {
                let result = map_type(native, system, None);
                assert_ne!(result.universal_type, UniversalType::Unknown, "{system}/{native}");
                assert!(result.confidence >= 0.95, "{system}/{native}");
            }
        }
    }
}
