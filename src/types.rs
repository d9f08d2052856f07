//! Core data model shared across the mapping engine: mappings, rules, the
//! universal type system, and the record representation records flow through
//! as.
//!
//! Records are represented as `serde_json::Value` — the engine is schema-aware
//! but not type-erased at the Rust level; rules operate structurally over
//! JSON the way the teacher's transformation stages operate structurally over
//! rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A JSON value standing in for one record flowing through the pipeline.
pub type Record = serde_json::Value;

/// A unique mapping identifier.
pub type MappingId = String;

/// Declarative specification of how a source record becomes a target record.
///
/// Immutable per version: constructing one validates the rule set (every
/// `target_field` is unique) once, up front, rather than on every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub version: u32,
    pub source_schema: Option<UniversalSchema>,
    pub target_schema: Option<UniversalSchema>,
    pub rules: Vec<Rule>,
    /// Optional named transformation hooks applied ahead of the rule list,
    /// carried the same way `preprocessing`/`postprocessing` are: as data the
    /// engine threads through, not a hardcoded function registry.
    #[serde(default)]
    pub transformations: Option<Vec<String>>,
    pub validation_rules: Vec<ValidationRule>,
    pub quality_rules: Vec<QualityRule>,
    pub preprocessing: Vec<String>,
    pub postprocessing: Vec<String>,
    pub aggregation: Option<AggregationSpec>,
    pub enrichment_rules: Vec<EnrichmentRule>,
    /// Fills target paths left undefined by the rule list, applied last by
    /// `FieldMappingStage` (spec section 4.3).
    #[serde(default)]
    pub default_values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub active: bool,
}

impl Mapping {
    /// Build a mapping, validating the invariants from the data model: every
    /// `target_field` unique within the rule set.
    pub fn new(id: impl Into<String>, version: u32, rules: Vec<Rule>) -> Result<Self, String> {
        let mapping = Self {
            id: id.into(),
            version,
            source_schema: None,
            target_schema: None,
            rules,
            transformations: None,
            validation_rules: Vec::new(),
            quality_rules: Vec::new(),
            preprocessing: Vec::new(),
            postprocessing: Vec::new(),
            aggregation: None,
            enrichment_rules: Vec::new(),
            default_values: HashMap::new(),
            description: None,
            tags: Vec::new(),
            active: true,
        };
        mapping.validate_rules()?;
        Ok(mapping)
    }

    pub fn validate_rules(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            let target = rule.target_field();
            if !seen.insert(target.to_string()) {
                return Err(format!("duplicate target_field '{target}' in rule set"));
            }
        }
        Ok(())
    }
}

/// One atomic transformation within a mapping.
///
/// Encoded as a tagged enum rather than a `type: String` discriminant plus a
/// loose bag of fields — invalid shapes are unrepresentable instead of
/// discovered at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Rule {
    Direct {
        source_field: String,
        target_field: String,
    },
    Transform {
        source_field: String,
        transform_type: String,
        target_field: String,
    },
    Concat {
        source_fields: Vec<String>,
        separator: String,
        target_field: String,
    },
    Split {
        source_field: String,
        split: SplitSpec,
        target_field: String,
    },
    Lookup {
        source_field: String,
        lookup_table: HashMap<String, serde_json::Value>,
        target_field: String,
    },
    Formula {
        formula: String,
        target_field: String,
    },
    Conditional {
        condition: ConditionSpec,
        source_field: String,
        true_value: serde_json::Value,
        false_value: serde_json::Value,
        target_field: String,
    },
    Aggregation {
        source: String,
        operation: AggregationOp,
        field: Option<String>,
        target_field: String,
    },
}

impl Rule {
    pub fn target_field(&self) -> &str {
        match self {
            Rule::Direct { target_field, .. }
            | Rule::Transform { target_field, .. }
            | Rule::Concat { target_field, .. }
            | Rule::Split { target_field, .. }
            | Rule::Lookup { target_field, .. }
            | Rule::Formula { target_field, .. }
            | Rule::Conditional { target_field, .. }
            | Rule::Aggregation { target_field, .. } => target_field,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Direct { .. } => "direct",
            Rule::Transform { .. } => "transform",
            Rule::Concat { .. } => "concat",
            Rule::Split { .. } => "split",
            Rule::Lookup { .. } => "lookup",
            Rule::Formula { .. } => "formula",
            Rule::Conditional { .. } => "conditional",
            Rule::Aggregation { .. } => "aggregation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitSpec {
    pub delimiter: String,
    pub index: Option<usize>,
    pub target_fields: Option<Vec<String>>,
}

/// A simple comparison condition evaluated against a dotted field path,
/// used by `Rule::Conditional`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSpec {
    pub group_by: Option<String>,
    pub field: String,
    pub operation: AggregationOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    pub field: String,
    pub rule: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityRule {
    pub name: String,
    pub field: String,
    pub check: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRule {
    pub target_field: String,
    pub source: EnrichmentSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EnrichmentSource {
    /// A static constant value merged into every record.
    Constant { value: serde_json::Value },
    /// A lookup against a named connection pool resource (C9).
    PoolLookup { pool: String, key_field: String },
}

/// The closed set of target-independent column types the Universal Type
/// Mapper normalizes every native type into (spec section 3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UniversalType {
    Integer,
    Bigint,
    Smallint,
    Decimal,
    Numeric,
    Float,
    Double,
    Real,
    Varchar,
    Char,
    Text,
    Longtext,
    Date,
    Time,
    Datetime,
    Timestamp,
    Boolean,
    Binary,
    Varbinary,
    Blob,
    Json,
    Jsonb,
    Array,
    Uuid,
    Unknown,
}

impl std::fmt::Display for UniversalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which dictionary or heuristic produced a `TypeMappingResult`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Postgresql,
    Mysql,
    Default,
    Pattern,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TypeMetadata {
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: Option<bool>,
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMappingResult {
    pub universal_type: UniversalType,
    pub native_type: String,
    pub system_type: String,
    pub metadata: TypeMetadata,
    pub mapping_source: MappingSource,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    pub universal_type: UniversalType,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UniversalSchema {
    pub system_type: String,
    pub tables: Vec<TableSchema>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_rejects_duplicate_target_fields() {
        let rules = vec![
            Rule::Direct {
                source_field: "id".into(),
                target_field: "customerId".into(),
            },
            Rule::Direct {
                source_field: "name".into(),
                target_field: "customerId".into(),
            },
        ];
        let result = Mapping::new("m1", 1, rules);
        assert!(result.is_err());
    }

    #[test]
    fn mapping_accepts_unique_target_fields() {
        let rules = vec![
            Rule::Direct {
                source_field: "id".into(),
                target_field: "customerId".into(),
            },
            Rule::Direct {
                source_field: "name".into(),
                target_field: "fullName".into(),
            },
        ];
        let mapping = Mapping::new("m1", 1, rules).unwrap();
        assert_eq!(mapping.rules.len(), 2);
    }

    #[test]
    fn rule_kind_and_target_field() {
        let rule = Rule::Concat {
            source_fields: vec!["a".into(), "b".into()],
            separator: ", ".into(),
            target_field: "combined".into(),
        };
        assert_eq!(rule.kind(), "concat");
        assert_eq!(rule.target_field(), "combined");
    }
}
