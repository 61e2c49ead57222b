use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use polars::prelude::{DataFrame, IdxCa, NamedFrom, SchemaRef, Series};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::{DataError, MandiResult, ValidationError},
    schema::{
        CanonicalCol, bulk_block_deal_schema, corporate_action_schema, equity_bar_schema,
        index_constituent_schema, option_chain_schema, quarterly_financials_schema,
    },
    validate::rules::{BusinessRule, RuleParams, schema_rule_violations},
};

pub mod report;
pub mod rules;

/// Whether a violated rule blocks the row or merely reports it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

/// One rule violation, anchored to a row of the full frame (never a
/// slice-relative index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub row_index: usize,
    pub field: String,
    pub message: String,
    pub validator: String,
    pub severity: Severity,
}

/// Aggregate outcome of validating one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub critical_failures: usize,
    pub warnings: usize,
    pub error_details: Vec<Violation>,
    pub rules_applied: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    /// Distinct frame rows with at least one critical violation.
    pub fn critical_row_indices(&self) -> Vec<usize> {
        let mut rows: Vec<usize> = self
            .error_details
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .map(|v| v.row_index)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        rows.sort_unstable();
        rows
    }
}

/// A validation rule over a tabular frame.
///
/// The closed set of shapes keeps dispatch uniform: declared-schema
/// conformance, one of the built-in business rules, or a caller-supplied
/// predicate.
pub enum Rule {
    /// Column presence and dtype conformance against a declared schema.
    Schema(SchemaRef),
    Business(BusinessRule),
    Custom {
        name: String,
        func: Arc<dyn Fn(&DataFrame, usize) -> Vec<Violation> + Send + Sync>,
    },
}

impl Rule {
    pub fn name(&self) -> String {
        match self {
            Self::Schema(_) => "schema_conformance".to_string(),
            Self::Business(rule) => rule.to_string(),
            Self::Custom { name, .. } => name.clone(),
        }
    }
}

/// Cross-slice state so sliced processing reports exactly what
/// whole-frame processing would.
#[derive(Debug, Default)]
pub(crate) struct ValidatorState {
    pub(crate) seen_keys: HashSet<String>,
}

/// Declarative rule engine over a tabular frame.
///
/// Frames are processed in slices (default 10,000 rows) to bound
/// memory; results aggregate across slices and are invariant to the
/// slice size.
pub struct Validator {
    schema_name: String,
    rules: Vec<Rule>,
    params: RuleParams,
    slice_size: usize,
}

pub const DEFAULT_SLICE_SIZE: usize = 10_000;

impl Validator {
    /// Rule set for a known schema name: schema conformance plus every
    /// built-in business rule (each skips itself when its referenced
    /// columns are absent).
    pub fn for_schema(schema_name: &str) -> MandiResult<Self> {
        let schema = declared_schema(schema_name)
            .ok_or_else(|| ValidationError::UnknownSchema(schema_name.to_string()))?;

        let mut rules = vec![Rule::Schema(schema)];
        rules.extend(BusinessRule::all().map(Rule::Business));

        Ok(Self {
            schema_name: schema_name.to_string(),
            rules,
            params: RuleParams::default(),
            slice_size: DEFAULT_SLICE_SIZE,
        })
    }

    pub fn with_params(mut self, params: RuleParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size.max(1);
        self
    }

    /// Register a caller-supplied rule. The function receives each slice
    /// and its global row offset and must report global indices.
    pub fn with_custom_rule(
        mut self,
        name: impl Into<String>,
        severity: Severity,
        func: impl Fn(&DataFrame, usize) -> Vec<(usize, String, String)> + Send + Sync + 'static,
    ) -> MandiResult<Self> {
        let name = name.into();
        if self.rules.iter().any(|r| r.name() == name) {
            return Err(ValidationError::DuplicateRule(name).into());
        }
        let rule_name = name.clone();
        self.rules.push(Rule::Custom {
            name: name.clone(),
            func: Arc::new(move |slice, offset| {
                func(slice, offset)
                    .into_iter()
                    .map(|(row_index, field, message)| Violation {
                        row_index,
                        field,
                        message,
                        validator: rule_name.clone(),
                        severity,
                    })
                    .collect()
            }),
        });
        Ok(self)
    }

    #[tracing::instrument(skip_all, fields(schema_name = %self.schema_name))]
    pub fn validate(&self, df: &DataFrame) -> MandiResult<ValidationResult> {
        let total_rows = df.height();
        let mut violations: Vec<Violation> = Vec::new();
        let mut state = ValidatorState::default();

        tracing::info!(
            total_rows,
            slice_size = self.slice_size,
            rules = self.rules.len(),
            "validating_frame"
        );

        let mut offset = 0usize;
        while offset < total_rows {
            let len = self.slice_size.min(total_rows - offset);
            let slice = df.slice(offset as i64, len);

            for rule in &self.rules {
                match rule {
                    Rule::Schema(schema) => {
                        // Frame-level; evaluated once, on the first slice.
                        if offset == 0 {
                            violations.extend(schema_rule_violations(df, schema));
                        }
                    }
                    Rule::Business(rule) => {
                        violations.extend(rule.apply(&slice, offset, &self.params, &mut state));
                    }
                    Rule::Custom { func, .. } => {
                        violations.extend(func(&slice, offset));
                    }
                }
            }

            offset += len;
        }

        let critical_rows: HashSet<usize> = violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .map(|v| v.row_index)
            .collect();
        let critical_failures = violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count();
        let warnings = violations.len() - critical_failures;

        for violation in violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .take(5)
        {
            tracing::warn!(
                row_index = violation.row_index,
                field = %violation.field,
                validator = %violation.validator,
                message = %violation.message,
                "validation_error"
            );
        }

        let result = ValidationResult {
            total_rows,
            valid_rows: total_rows - critical_rows.len(),
            critical_failures,
            warnings,
            error_details: violations,
            rules_applied: self.rules.iter().map(Rule::name).collect(),
            timestamp: Utc::now(),
        };

        tracing::info!(
            total_rows,
            valid_rows = result.valid_rows,
            critical_failures,
            warnings,
            "validation_complete"
        );
        Ok(result)
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }
}

/// Declared frame schema for a validation schema name.
pub fn declared_schema(schema_name: &str) -> Option<SchemaRef> {
    match schema_name {
        "raw_equity_ohlc" | "normalized_equity_ohlc" => Some(equity_bar_schema()),
        "bulk_block_deals" => Some(bulk_block_deal_schema()),
        "index_constituents" => Some(index_constituent_schema()),
        "option_chain" => Some(option_chain_schema()),
        "corporate_actions" => Some(corporate_action_schema()),
        "quarterly_financials" => Some(quarterly_financials_schema()),
        _ => None,
    }
}

/// Extract the failed rows of a frame, annotated with the joined
/// violation messages and the schema name, for the quarantine sink.
pub fn quarantine_frame(
    df: &DataFrame,
    result: &ValidationResult,
    schema_name: &str,
) -> MandiResult<DataFrame> {
    let rows = result.critical_row_indices();
    let idx = IdxCa::from_vec(
        "idx".into(),
        rows.iter().map(|r| *r as polars::prelude::IdxSize).collect(),
    );

    let mut failed = df
        .take(&idx)
        .map_err(|e| DataError::Frame(e.to_string()))?;

    let messages: Vec<String> = rows
        .iter()
        .map(|row| {
            result
                .error_details
                .iter()
                .filter(|v| v.row_index == *row && v.severity == Severity::Critical)
                .map(|v| format!("{}: {}", v.field, v.message))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .collect();

    failed
        .with_column(Series::new(CanonicalCol::ValidationErrors.name(), messages))
        .map_err(|e| DataError::Frame(e.to_string()))?;
    failed
        .with_column(Series::new(
            CanonicalCol::SchemaName.name(),
            vec![schema_name.to_string(); rows.len()],
        ))
        .map_err(|e| DataError::Frame(e.to_string()))?;

    Ok(failed)
}
