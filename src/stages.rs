//! Transformation Stages (C3): pluggable units composing a pipeline phase —
//! validation, sanitization, field-mapping, aggregation, quality-check, and
//! enrichment.

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, MappingEngineError, Result};
use crate::pool::ConnectionPoolRegistry;
use crate::types::{
    AggregationOp, ConditionOperator, ConditionSpec, EnrichmentRule, EnrichmentSource, Mapping,
    QualityRule, Record, Rule, ValidationRule,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Outcome of one stage's `apply`. Stages that only validate (DataValidation,
/// DataQualityCheck) return `data` unchanged.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub data: Record,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn passthrough(data: Record) -> Self {
        Self {
            data,
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// A named, possibly-failing transformation unit. Stages are shared across
/// concurrently executing pipelines (spec 4.4): they must be stateless with
/// respect to the data they process.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, input: &StageOutput, ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput>;
}

fn stage_error(stage: &str, message: impl Into<String>) -> MappingEngineError {
    ExecutionError::StageFailure {
        stage: stage.to_string(),
        message: message.into(),
    }
    .into()
}

/// A parsed dotted field path, e.g. `"address.city"` -> `["address", "city"]`.
/// Replaces reflective property access with an explicit representation and
/// explicit missing-field semantics (spec section 9 redesign note).
#[derive(Debug, Clone)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(|s| s.to_string()).collect())
    }

    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.0 {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn set(&self, root: &mut Value, new_value: Value) {
        if !root.is_object() {
            *root = Value::Object(Map::new());
        }
        let mut current = root;
        for (i, segment) in self.0.iter().enumerate() {
            let is_last = i == self.0.len() - 1;
            let obj = current.as_object_mut().expect("set() keeps current as an object");
            if is_last {
                obj.insert(segment.clone(), new_value);
                return;
            }
            current = obj
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
        }
    }
}

// ---------------------------------------------------------------------
// DataValidation
// ---------------------------------------------------------------------

pub struct DataValidationStage;

impl DataValidationStage {
    fn check_rule(input: &Record, rule: &ValidationRule) -> Option<String> {
        let path = FieldPath::parse(&rule.field);
        let value = path.get(input);
        let fails = match rule.rule.as_str() {
            "required" => value.is_none() || value == Some(&Value::Null),
            "string" => !matches!(value, Some(Value::String(_))),
            "number" => !matches!(value, Some(Value::Number(_))),
            "boolean" => !matches!(value, Some(Value::Bool(_))),
            "array" => !matches!(value, Some(Value::Array(_))),
            "object" => !matches!(value, Some(Value::Object(_))),
            _ => false,
        };
        if fails {
            Some(rule.message.clone().unwrap_or_else(|| {
                format!("field '{}' failed validation rule '{}'", rule.field, rule.rule)
            }))
        } else {
            None
        }
    }
}

#[async_trait]
impl Stage for DataValidationStage {
    fn name(&self) -> &'static str {
        "DataValidation"
    }

    async fn apply(&self, input: &StageOutput, ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        let mut errors = Vec::new();
        for rule in &mapping.validation_rules {
            if let Some(message) = Self::check_rule(&input.data, rule) {
                errors.push(message);
            }
        }
        let valid = errors.is_empty();
        if !valid && ctx.config.strict_mode {
            return Err(stage_error(self.name(), errors.join("; ")));
        }
        Ok(StageOutput {
            data: input.data.clone(),
            valid,
            errors,
            warnings: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------
// DataSanitization
// ---------------------------------------------------------------------

pub struct DataSanitizationStage;

const SENTINEL_VALUES: &[&str] = &["", "NULL", "null", "N/A", "n/a"];

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let normalized = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
            if SENTINEL_VALUES.contains(&normalized.as_str()) {
                Value::Null
            } else {
                Value::String(normalized)
            }
        }
        Value::Object(map) => {
            let sanitized: Map<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), sanitize_value(v))).collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl Stage for DataSanitizationStage {
    fn name(&self) -> &'static str {
        "DataSanitization"
    }

    async fn apply(&self, input: &StageOutput, _ctx: &mut ExecutionContext, _mapping: &Mapping) -> Result<StageOutput> {
        // Idempotent: sanitizing already-sanitized data is a no-op.
        Ok(StageOutput::passthrough(sanitize_value(&input.data)))
    }
}

// ---------------------------------------------------------------------
// FieldMapping
// ---------------------------------------------------------------------

pub struct FieldMappingStage;

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn evaluate_condition(spec: &ConditionSpec, input: &Record) -> bool {
    let path = FieldPath::parse(&spec.field);
    let actual = path.get(input);
    match spec.operator {
        ConditionOperator::Exists => actual.is_some() && actual != Some(&Value::Null),
        ConditionOperator::Eq => actual == Some(&spec.value),
        ConditionOperator::Ne => actual != Some(&spec.value),
        ConditionOperator::Contains => match (actual, &spec.value) {
            (Some(Value::String(a)), Value::String(b)) => a.contains(b.as_str()),
            (Some(Value::Array(items)), needle) => items.contains(needle),
            _ => false,
        },
        ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt | ConditionOperator::Lte => {
            match (actual.and_then(value_as_f64), value_as_f64(&spec.value)) {
                (Some(a), Some(b)) => match spec.operator {
                    ConditionOperator::Gt => a > b,
                    ConditionOperator::Gte => a >= b,
                    ConditionOperator::Lt => a < b,
                    ConditionOperator::Lte => a <= b,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
    }
}

/// Minimal recursive-descent evaluator for `Rule::Formula` expressions:
/// `+ - * /` over numeric literals, string literals (single-quoted), and
/// dotted field references, with parentheses. `+` concatenates when either
/// operand is a string.
struct FormulaEvaluator<'a> {
    tokens: Vec<Token>,
    pos: usize,
    record: &'a Record,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    StringLit(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(formula: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::StringLit(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum FormulaValue {
    Number(f64),
    Text(String),
}

impl<'a> FormulaEvaluator<'a> {
    fn new(tokens: Vec<Token>, record: &'a Record) -> Self {
        Self { tokens, pos: 0, record }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> std::result::Result<FormulaValue, String> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    let rhs = self.parse_term()?;
                    lhs = match (&lhs, &rhs) {
                        (FormulaValue::Number(a), FormulaValue::Number(b)) => FormulaValue::Number(a + b),
                        _ => FormulaValue::Text(format!("{}{}", to_text(&lhs), to_text(&rhs))),
                    };
                }
                Some(Token::Minus) => {
                    self.next();
                    let rhs = self.parse_term()?;
                    let a = to_number(&lhs)?;
                    let b = to_number(&rhs)?;
                    lhs = FormulaValue::Number(a - b);
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> std::result::Result<FormulaValue, String> {
        let mut lhs = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    let rhs = self.parse_factor()?;
                    lhs = FormulaValue::Number(to_number(&lhs)? * to_number(&rhs)?);
                }
                Some(Token::Slash) => {
                    self.next();
                    let rhs = self.parse_factor()?;
                    let divisor = to_number(&rhs)?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    lhs = FormulaValue::Number(to_number(&lhs)? / divisor);
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> std::result::Result<FormulaValue, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(FormulaValue::Number(n)),
            Some(Token::StringLit(s)) => Ok(FormulaValue::Text(s)),
            Some(Token::Ident(name)) => {
                let path = FieldPath::parse(&name);
                match path.get(self.record) {
                    Some(Value::Number(n)) => Ok(FormulaValue::Number(n.as_f64().unwrap_or(0.0))),
                    Some(Value::String(s)) => Ok(FormulaValue::Text(s.clone())),
                    Some(other) => Ok(FormulaValue::Text(value_to_string(other))),
                    None => Ok(FormulaValue::Text(String::new())),
                }
            }
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected closing parenthesis".to_string()),
                }
            }
            Some(Token::Minus) => {
                let value = self.parse_factor()?;
                Ok(FormulaValue::Number(-to_number(&value)?))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn to_number(value: &FormulaValue) -> std::result::Result<f64, String> {
    match value {
        FormulaValue::Number(n) => Ok(*n),
        FormulaValue::Text(s) => s.parse::<f64>().map_err(|_| format!("'{s}' is not numeric")),
    }
}

fn to_text(value: &FormulaValue) -> String {
    match value {
        FormulaValue::Number(n) => n.to_string(),
        FormulaValue::Text(s) => s.clone(),
    }
}

fn evaluate_formula(formula: &str, record: &Record) -> std::result::Result<Value, String> {
    let tokens = tokenize(formula)?;
    let mut evaluator = FormulaEvaluator::new(tokens, record);
    let result = evaluator.parse_expr()?;
    if evaluator.pos != evaluator.tokens.len() {
        return Err("trailing tokens in formula".to_string());
    }
    Ok(match result {
        FormulaValue::Number(n) => serde_json::json!(n),
        FormulaValue::Text(s) => Value::String(s),
    })
}

#[async_trait]
impl Stage for FieldMappingStage {
    fn name(&self) -> &'static str {
        "FieldMapping"
    }

    async fn apply(&self, input: &StageOutput, ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        let mut output = Value::Object(Map::new());
        let mut warnings = Vec::new();
        let source = &input.data;

        for rule in &mapping.rules {
            match rule {
                Rule::Direct { source_field, target_field } => {
                    let path = FieldPath::parse(source_field);
                    match path.get(source) {
                        Some(value) => FieldPath::parse(target_field).set(&mut output, value.clone()),
                        None if ctx.config.strict_mode => {
                            return Err(stage_error(
                                self.name(),
                                format!("missing source field '{source_field}'"),
                            ))
                        }
                        None => warnings.push(format!("source field '{source_field}' missing (lenient)")),
                    }
                }
                Rule::Transform {
                    source_field,
                    transform_type,
                    target_field,
                } => {
                    let path = FieldPath::parse(source_field);
                    if let Some(value) = path.get(source) {
                        let transformed = apply_transform(transform_type, value);
                        FieldPath::parse(target_field).set(&mut output, transformed);
                    } else if ctx.config.strict_mode {
                        return Err(stage_error(self.name(), format!("missing source field '{source_field}'")));
                    }
                }
                Rule::Concat {
                    source_fields,
                    separator,
                    target_field,
                } => {
                    let parts: Vec<String> = source_fields
                        .iter()
                        .map(|f| FieldPath::parse(f).get(source).map(value_to_string).unwrap_or_default())
                        .collect();
                    FieldPath::parse(target_field).set(&mut output, Value::String(parts.join(separator)));
                }
                Rule::Split {
                    source_field,
                    split,
                    target_field,
                } => {
                    let path = FieldPath::parse(source_field);
                    if let Some(Value::String(s)) = path.get(source) {
                        let parts: Vec<&str> = s.split(split.delimiter.as_str()).collect();
                        if let Some(target_fields) = &split.target_fields {
                            for (i, name) in target_fields.iter().enumerate() {
                                let part = parts.get(i).map(|p| Value::String(p.to_string())).unwrap_or(Value::Null);
                                FieldPath::parse(name).set(&mut output, part);
                            }
                        } else {
                            let idx = split.index.unwrap_or(0);
                            let part = parts.get(idx).map(|p| Value::String(p.to_string())).unwrap_or(Value::Null);
                            FieldPath::parse(target_field).set(&mut output, part);
                        }
                    }
                }
                Rule::Lookup {
                    source_field,
                    lookup_table,
                    target_field,
                } => {
                    let path = FieldPath::parse(source_field);
                    if let Some(key_value) = path.get(source) {
                        let key = value_to_string(key_value);
                        let looked_up = lookup_table.get(&key).cloned().unwrap_or(Value::Null);
                        FieldPath::parse(target_field).set(&mut output, looked_up);
                    }
                }
                Rule::Formula { formula, target_field } => match evaluate_formula(formula, source) {
                    Ok(value) => FieldPath::parse(target_field).set(&mut output, value),
                    Err(message) => {
                        if ctx.config.strict_mode {
                            return Err(stage_error(self.name(), format!("formula '{formula}' failed: {message}")));
                        }
                        warnings.push(format!("formula '{formula}' failed: {message}"));
                    }
                },
                Rule::Conditional {
                    condition,
                    source_field: _,
                    true_value,
                    false_value,
                    target_field,
                } => {
                    let chosen = if evaluate_condition(condition, source) {
                        true_value.clone()
                    } else {
                        false_value.clone()
                    };
                    FieldPath::parse(target_field).set(&mut output, chosen);
                }
                Rule::Aggregation {
                    source: source_path,
                    operation,
                    field,
                    target_field,
                } => {
                    let path = FieldPath::parse(source_path);
                    if let Some(Value::Array(items)) = path.get(source) {
                        let value = aggregate(items, *operation, field.as_deref());
                        FieldPath::parse(target_field).set(&mut output, value);
                    }
                }
            }
        }

        for (target_field, default_value) in &mapping.default_values {
            let path = FieldPath::parse(target_field);
            if path.get(&output).is_none() {
                path.set(&mut output, default_value.clone());
            }
        }

        Ok(StageOutput {
            data: output,
            valid: true,
            errors: Vec::new(),
            warnings,
        })
    }
}

fn apply_transform(transform_type: &str, value: &Value) -> Value {
    match transform_type {
        "uppercase" => Value::String(value_to_string(value).to_uppercase()),
        "lowercase" => Value::String(value_to_string(value).to_lowercase()),
        "trim" => Value::String(value_to_string(value).trim().to_string()),
        "to_string" => Value::String(value_to_string(value)),
        "to_number" => value_as_f64(value).map(|n| serde_json::json!(n)).unwrap_or(Value::Null),
        _ => value.clone(),
    }
}

pub fn aggregate(items: &[Value], operation: AggregationOp, field: Option<&str>) -> Value {
    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| match field {
            Some(f) => FieldPath::parse(f).get(item).and_then(value_as_f64),
            None => value_as_f64(item),
        })
        .collect();

    match operation {
        AggregationOp::Count => serde_json::json!(items.len()),
        AggregationOp::Sum => serde_json::json!(numbers.iter().sum::<f64>()),
        AggregationOp::Avg => {
            if numbers.is_empty() {
                Value::Null
            } else {
                serde_json::json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregationOp::Min => numbers
            .iter()
            .cloned()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.min(n))))
            .map(|n| serde_json::json!(n))
            .unwrap_or(Value::Null),
        AggregationOp::Max => numbers
            .iter()
            .cloned()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.max(n))))
            .map(|n| serde_json::json!(n))
            .unwrap_or(Value::Null),
    }
}

// ---------------------------------------------------------------------
// DataAggregation
// ---------------------------------------------------------------------

pub struct DataAggregationStage;

#[async_trait]
impl Stage for DataAggregationStage {
    fn name(&self) -> &'static str {
        "DataAggregation"
    }

    async fn apply(&self, input: &StageOutput, _ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        let Some(spec) = &mapping.aggregation else {
            return Ok(input.clone());
        };
        let mut output = input.data.clone();
        let items: Vec<Value> = match &input.data {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        if let Some(group_by) = &spec.group_by {
            let mut groups: std::collections::BTreeMap<String, Vec<Value>> = std::collections::BTreeMap::new();
            for item in &items {
                let key = FieldPath::parse(group_by).get(item).map(value_to_string).unwrap_or_default();
                groups.entry(key).or_default().push(item.clone());
            }
            let mut results = Vec::new();
            for (key, group_items) in groups {
                let mut row = Map::new();
                row.insert(group_by.clone(), Value::String(key));
                row.insert(
                    "value".to_string(),
                    aggregate(&group_items, spec.operation, Some(spec.field.as_str())),
                );
                results.push(Value::Object(row));
            }
            output = Value::Array(results);
        } else {
            let value = aggregate(&items, spec.operation, Some(spec.field.as_str()));
            output = value;
        }

        Ok(StageOutput::passthrough(output))
    }
}

impl Clone for StageOutput {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            valid: self.valid,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

// ---------------------------------------------------------------------
// DataQualityCheck
// ---------------------------------------------------------------------

pub struct DataQualityCheckStage {
    pub default_threshold: f64,
}

impl Default for DataQualityCheckStage {
    fn default() -> Self {
        Self { default_threshold: 0.8 }
    }
}

fn evaluate_quality_rule(record: &Record, rule: &QualityRule) -> bool {
    let path = FieldPath::parse(&rule.field);
    let value = path.get(record);
    match rule.check.as_str() {
        "not_null" => value.is_some() && value != Some(&Value::Null),
        "non_empty" => matches!(value, Some(Value::String(s)) if !s.is_empty()),
        "positive" => value.and_then(value_as_f64).map(|n| n > 0.0).unwrap_or(false),
        _ => true,
    }
}

#[async_trait]
impl Stage for DataQualityCheckStage {
    fn name(&self) -> &'static str {
        "DataQualityCheck"
    }

    async fn apply(&self, input: &StageOutput, ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        if mapping.quality_rules.is_empty() {
            return Ok(input.clone());
        }
        let total_weight: f64 = mapping.quality_rules.iter().map(|r| r.weight).sum();
        let earned: f64 = mapping
            .quality_rules
            .iter()
            .filter(|r| evaluate_quality_rule(&input.data, r))
            .map(|r| r.weight)
            .sum();
        let score = if total_weight > 0.0 { earned / total_weight } else { 1.0 };

        if score < self.default_threshold && ctx.config.strict_mode {
            return Err(stage_error(
                self.name(),
                format!("quality score {score:.2} below threshold {:.2}", self.default_threshold),
            ));
        }

        let mut output = input.clone();
        output.warnings.push(format!("quality score: {score:.2}"));
        Ok(output)
    }
}

// ---------------------------------------------------------------------
// DataEnrichment
// ---------------------------------------------------------------------

pub struct DataEnrichmentStage {
    pools: Arc<ConnectionPoolRegistry>,
}

impl DataEnrichmentStage {
    pub fn new(pools: Arc<ConnectionPoolRegistry>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl Stage for DataEnrichmentStage {
    fn name(&self) -> &'static str {
        "DataEnrichment"
    }

    async fn apply(&self, input: &StageOutput, _ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        let mut output = input.data.clone();
        let mut warnings = input.warnings.clone();

        for rule in &mapping.enrichment_rules {
            match &rule.source {
                EnrichmentSource::Constant { value } => {
                    FieldPath::parse(&rule.target_field).set(&mut output, value.clone());
                }
                EnrichmentSource::PoolLookup { pool, key_field } => {
                    let key = FieldPath::parse(key_field).get(&input.data).map(value_to_string);
                    match key {
                        Some(key) => match self.pools.lookup(pool, &key).await {
                            Ok(value) => FieldPath::parse(&rule.target_field).set(&mut output, value),
                            Err(err) => warnings.push(format!("enrichment lookup '{pool}' failed: {err}")),
                        },
                        None => warnings.push(format!("enrichment key field '{key_field}' missing")),
                    }
                }
            }
        }

        Ok(StageOutput {
            data: output,
            valid: input.valid,
            errors: input.errors.clone(),
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextMetadata};
    use crate::types::SplitSpec;

    fn ctx(strict: bool) -> ExecutionContext {
        ExecutionContext::new(
            ContextMetadata::default(),
            ContextConfig {
                strict_mode: strict,
                ..Default::default()
            },
        )
    }

    fn mapping_with_rules(rules: Vec<Rule>) -> Mapping {
        Mapping::new("m", 1, rules).unwrap()
    }

    #[tokio::test]
    async fn direct_mapping_copies_values() {
        let mapping = mapping_with_rules(vec![
            Rule::Direct { source_field: "id".into(), target_field: "customerId".into() },
            Rule::Direct { source_field: "name".into(), target_field: "fullName".into() },
        ]);
        let input = StageOutput::passthrough(serde_json::json!({"id": 12345, "name": "John Doe"}));
        let mut context = ctx(false);
        let output = FieldMappingStage.apply(&input, &mut context, &mapping).await.unwrap();
        assert_eq!(output.data, serde_json::json!({"customerId": 12345, "fullName": "John Doe"}));
    }

    #[tokio::test]
    async fn concat_and_aggregation_scenario() {
        let mapping = mapping_with_rules(vec![
            Rule::Concat {
                source_fields: vec!["address.street".into(), "address.city".into(), "address.zipCode".into()],
                separator: ", ".into(),
                target_field: "mailingAddress".into(),
            },
            Rule::Aggregation {
                source: "orders".into(),
                operation: AggregationOp::Sum,
                field: Some("amount".into()),
                target_field: "totalOrderValue".into(),
            },
        ]);
        let input = StageOutput::passthrough(serde_json::json!({
            "address": {"street": "123 Main St", "city": "Anytown", "zipCode": "12345"},
            "orders": [{"amount": 99.99}, {"amount": 149.50}, {"amount": 75.25}],
        }));
        let mut context = ctx(false);
        let output = FieldMappingStage.apply(&input, &mut context, &mapping).await.unwrap();
        assert_eq!(output.data["mailingAddress"], "123 Main St, Anytown, 12345");
        let total = output.data["totalOrderValue"].as_f64().unwrap();
        assert!((total - 324.74).abs() < 0.001);
    }

    #[tokio::test]
    async fn strict_mode_errors_on_missing_source_field() {
        let mapping = mapping_with_rules(vec![Rule::Direct {
            source_field: "missing".into(),
            target_field: "x".into(),
        }]);
        let input = StageOutput::passthrough(serde_json::json!({}));
        let mut context = ctx(true);
        let result = FieldMappingStage.apply(&input, &mut context, &mapping).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lenient_mode_produces_warning_on_missing_field() {
        let mapping = mapping_with_rules(vec![Rule::Direct {
            source_field: "missing".into(),
            target_field: "x".into(),
        }]);
        let input = StageOutput::passthrough(serde_json::json!({}));
        let mut context = ctx(false);
        let output = FieldMappingStage.apply(&input, &mut context, &mapping).await.unwrap();
        assert_eq!(output.warnings.len(), 1);
    }

    #[tokio::test]
    async fn default_values_fill_only_unset_targets() {
        let mut mapping = mapping_with_rules(vec![Rule::Direct {
            source_field: "id".into(),
            target_field: "customerId".into(),
        }]);
        mapping.default_values.insert("customerId".into(), serde_json::json!(0));
        mapping.default_values.insert("tier".into(), serde_json::json!("standard"));
        let input = StageOutput::passthrough(serde_json::json!({"id": 12345}));
        let mut context = ctx(false);
        let output = FieldMappingStage.apply(&input, &mut context, &mapping).await.unwrap();
        assert_eq!(output.data["customerId"], 12345);
        assert_eq!(output.data["tier"], "standard");
    }

    #[test]
    fn formula_evaluates_arithmetic() {
        let record = serde_json::json!({"a": 10, "b": 4});
        let value = evaluate_formula("a * 2 + b / 2", &record).unwrap();
        assert_eq!(value, serde_json::json!(22.0));
    }

    #[test]
    fn formula_concatenates_strings() {
        let record = serde_json::json!({"first": "John", "last": "Doe"});
        let value = evaluate_formula("first + ' ' + last", &record).unwrap();
        assert_eq!(value, Value::String("John Doe".to_string()));
    }

    #[test]
    fn conditional_picks_true_or_false_branch() {
        let spec = ConditionSpec {
            field: "age".into(),
            operator: ConditionOperator::Gte,
            value: serde_json::json!(18),
        };
        assert!(evaluate_condition(&spec, &serde_json::json!({"age": 21})));
        assert!(!evaluate_condition(&spec, &serde_json::json!({"age": 10})));
    }

    #[test]
    fn sanitization_trims_and_nullifies_sentinels() {
        let value = sanitize_value(&serde_json::json!({"name": "  John   Doe  ", "note": "N/A"}));
        assert_eq!(value["name"], "John Doe");
        assert_eq!(value["note"], Value::Null);
    }

    #[test]
    fn split_spec_extracts_indexed_part() {
        let mapping = mapping_with_rules(vec![Rule::Split {
            source_field: "full".into(),
            split: SplitSpec { delimiter: " ".into(), index: Some(1), target_fields: None },
            target_field: "last".into(),
        }]);
        assert_eq!(mapping.rules.len(), 1);
    }

    #[tokio::test]
    async fn quality_check_scores_against_threshold() {
        let mut mapping = mapping_with_rules(vec![]);
        mapping.quality_rules = vec![
            QualityRule { name: "has_id".into(), field: "id".into(), check: "not_null".into(), weight: 1.0 },
            QualityRule { name: "has_name".into(), field: "name".into(), check: "non_empty".into(), weight: 1.0 },
        ];
        let input = StageOutput::passthrough(serde_json::json!({"id": 1, "name": ""}));
        let mut context = ctx(false);
        let output = DataQualityCheckStage::default().apply(&input, &mut context, &mapping).await.unwrap();
        assert!(output.warnings.iter().any(|w| w.contains("0.50")));
    }
}
