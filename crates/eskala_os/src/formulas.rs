#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use eskala_kernel_contracts::actor::ActorContext;
use eskala_kernel_contracts::versioned::{EntryId, EntryVersion, VersionedEntry};
use eskala_kernel_contracts::Timestamp;
use eskala_storage::store::SupersedeOutcome;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::attribution::{resolve_batch, UserDirectory, SYSTEM_ACTOR};
use crate::formula_expr::FormulaExpression;
use crate::vkvs::{SupersedeRequest, VersionedConfigEngine, VersionedConfigError};

pub const FORMULAS_TABLE: &str = "formulas";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveFormula {
    pub entry_id: EntryId,
    pub formula_key: String,
    pub field_label: String,
    pub expression: String,
    pub description: Option<String>,
    /// e.g. "Profit - v3".
    pub status: String,
    pub version: EntryVersion,
    pub effective_from: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormFormula {
    pub formula_key: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaVersion {
    pub entry_id: EntryId,
    pub version: EntryVersion,
    pub expression: String,
    pub effective_from: Timestamp,
    pub effective_to: Option<Timestamp>,
    pub change_reason: String,
    pub changed_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaChange {
    pub history_id: u64,
    pub formula_key: String,
    pub field_label: String,
    pub old_expression: String,
    pub new_expression: String,
    pub old_version: u32,
    pub new_version: u32,
    pub changed_by: String,
    pub changed_at: Option<Timestamp>,
    pub change_reason: String,
}

/// "profit_investment_usd" -> "Profit Investment Usd".
pub fn field_label(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Form a formula belongs to, taken from its key prefix.
pub fn form_type(key: &str) -> String {
    match key.split_once('_') {
        Some((prefix, _)) => capitalize(prefix),
        None => "Unknown".to_string(),
    }
}

fn parse_expression(expression: &str) -> Result<FormulaExpression, VersionedConfigError> {
    FormulaExpression::parse(expression)
        .map_err(|err| VersionedConfigError::InvalidArgument(format!("malformed formula: {err}")))
}

/// The `formulas` dataset: one versioned arithmetic expression per form field.
#[derive(Clone)]
pub struct FormulaRegistry {
    engine: VersionedConfigEngine,
    directory: Arc<dyn UserDirectory>,
    history_limit: usize,
}

impl FormulaRegistry {
    pub fn new(
        engine: VersionedConfigEngine,
        directory: Arc<dyn UserDirectory>,
        history_limit: usize,
    ) -> Self {
        Self {
            engine,
            directory,
            history_limit,
        }
    }

    pub fn engine(&self) -> &VersionedConfigEngine {
        &self.engine
    }

    pub fn seed(
        &self,
        key: &str,
        expression: &str,
        description: Option<String>,
    ) -> Result<VersionedEntry, VersionedConfigError> {
        parse_expression(expression)?;
        self.engine.initialize(key, expression, description)
    }

    pub fn active(&self) -> Result<Vec<ActiveFormula>, VersionedConfigError> {
        Ok(self
            .engine
            .current_entries()?
            .into_iter()
            .map(|e| {
                let key = e.key.as_str().to_string();
                ActiveFormula {
                    entry_id: e.entry_id,
                    field_label: field_label(&key),
                    status: format!("{} - v{}", form_type(&key), e.version.0),
                    expression: e.value.as_str().to_string(),
                    description: e.description,
                    version: e.version,
                    effective_from: e.valid_from,
                    formula_key: key,
                }
            })
            .collect())
    }

    /// Field name (key minus its form prefix) -> formula, for one form.
    pub fn for_form(
        &self,
        form: &str,
    ) -> Result<BTreeMap<String, FormFormula>, VersionedConfigError> {
        Ok(self
            .engine
            .current_entries()?
            .into_iter()
            .filter_map(|e| {
                let key = e.key.as_str();
                let (prefix, field) = key.split_once('_')?;
                if !prefix.eq_ignore_ascii_case(form) {
                    return None;
                }
                Some((
                    field.to_string(),
                    FormFormula {
                        formula_key: key.to_string(),
                        expression: e.value.as_str().to_string(),
                    },
                ))
            })
            .collect())
    }

    pub fn current(&self, key: &str) -> Result<VersionedEntry, VersionedConfigError> {
        self.engine.get_current(key)
    }

    /// New expression, effective now.
    pub fn update(
        &self,
        key: &str,
        expression: &str,
        reason: &str,
        actor: ActorContext,
        expected_version: Option<EntryVersion>,
    ) -> Result<SupersedeOutcome, VersionedConfigError> {
        parse_expression(expression)?;
        self.engine.supersede(SupersedeRequest {
            key: key.to_string(),
            new_value: expression.to_string(),
            effective_at: self.engine.now(),
            reason: reason.to_string(),
            actor,
            expected_version,
        })
    }

    /// Every version of `key`, newest first, with who changed it and why.
    pub fn history(&self, key: &str) -> Result<Vec<FormulaVersion>, VersionedConfigError> {
        let versions = self.engine.history(key)?;
        if versions.is_empty() {
            return Err(VersionedConfigError::NotFound(format!(
                "{FORMULAS_TABLE}: no entry for key '{key}'"
            )));
        }
        let mut audits = Vec::with_capacity(versions.len());
        for v in &versions {
            audits.push(self.engine.audit_for_entry(v.entry_id)?.into_iter().next());
        }
        let present: Vec<_> = audits.iter().flatten().cloned().collect();
        let mut names = resolve_batch(&present, self.directory.as_ref()).into_iter();

        Ok(versions
            .into_iter()
            .zip(audits)
            .map(|(v, audit)| {
                let (change_reason, changed_by) = match audit {
                    Some(a) => (
                        a.diff.reason,
                        names.next().unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
                    ),
                    None => (format!("Version {}", v.version.0), SYSTEM_ACTOR.to_string()),
                };
                FormulaVersion {
                    entry_id: v.entry_id,
                    version: v.version,
                    expression: v.value.as_str().to_string(),
                    effective_from: v.valid_from,
                    effective_to: v.valid_to,
                    change_reason,
                    changed_by,
                }
            })
            .collect())
    }

    /// Recent changes across all formulas, newest first.
    ///
    /// With no audit rows at all, closed versions stand in for the missing log.
    pub fn changes(&self, limit: usize) -> Result<Vec<FormulaChange>, VersionedConfigError> {
        let limit = limit.min(self.history_limit);
        let records = self.engine.recent_audit(limit)?;
        if records.is_empty() {
            return self.changes_from_closed_versions(limit);
        }
        let names = resolve_batch(&records, self.directory.as_ref());
        let mut out = Vec::with_capacity(records.len());
        for (r, changed_by) in records.into_iter().zip(names) {
            let formula_key = self
                .engine
                .entry(r.subject_key)?
                .map(|e| e.key.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push(FormulaChange {
                history_id: r.record_id.0,
                field_label: field_label(&formula_key),
                formula_key,
                old_expression: r.diff.old_value.unwrap_or_else(|| "-".to_string()),
                new_expression: r.diff.new_value,
                old_version: r.diff.old_version.map(|v| v.0).unwrap_or(0),
                new_version: r.diff.new_version.0,
                changed_by,
                changed_at: Some(r.changed_at),
                change_reason: r.diff.reason,
            });
        }
        Ok(out)
    }

    fn changes_from_closed_versions(
        &self,
        limit: usize,
    ) -> Result<Vec<FormulaChange>, VersionedConfigError> {
        Ok(self
            .engine
            .closed_entries()?
            .into_iter()
            .take(limit)
            .map(|e| FormulaChange {
                history_id: e.entry_id.0,
                formula_key: e.key.as_str().to_string(),
                field_label: field_label(e.key.as_str()),
                old_expression: e.value.as_str().to_string(),
                new_expression: "See current version".to_string(),
                old_version: e.version.0,
                new_version: e.version.0.saturating_add(1),
                changed_by: SYSTEM_ACTOR.to_string(),
                changed_at: e.valid_to,
                change_reason: "Formula updated".to_string(),
            })
            .collect())
    }

    pub fn evaluate(
        &self,
        key: &str,
        bindings: &BTreeMap<String, Decimal>,
    ) -> Result<Decimal, VersionedConfigError> {
        let current = self.engine.get_current(key)?;
        parse_expression(current.value.as_str())?
            .evaluate(bindings)
            .map_err(|err| VersionedConfigError::InvalidArgument(err.to_string()))
    }
}
