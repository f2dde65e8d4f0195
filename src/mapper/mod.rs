use crate::error::TransferError;
use crate::models::ImportJob;
use serde::{Deserialize, Serialize};

/// Source-column value the management UI stores to mark a slot as ignored.
pub const IGNORE_SENTINEL: &str = "<-Ignore->";

/// One ordered mapping slot. Exactly one output column per rule: either a
/// source column carried through, or a constant injected in its place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMappingRule {
    #[serde(default)]
    pub source_column: Option<String>,
    pub target_column: String,
    #[serde(default)]
    pub constant_value: Option<String>,
}

/// Binding of one projection slot to a destination column. Slots are always
/// addressed by ordinal: a constant term and a real column each occupy
/// exactly one position in the source result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub source_ordinal: usize,
    pub target_column: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    /// Comma-joined projection terms for the source SELECT.
    pub select_list: String,
    pub bindings: Vec<ColumnBinding>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rebuilds mapping rules from the three parallel comma-delimited lists the
/// job table stores. Ignore-sentinel entries are dropped from the source
/// list before alignment, lists are zipped to the shorter of source/target,
/// and a missing or empty constant slot means "carry the source column".
pub fn rules_from_delimited_lists(
    source_list: &str,
    target_list: &str,
    constant_list: &str,
) -> Result<Vec<ColumnMappingRule>, TransferError> {
    let source_columns: Vec<String> = split_list(source_list)
        .into_iter()
        .filter(|value| value != IGNORE_SENTINEL)
        .collect();
    let target_columns = split_list(target_list);
    let constants = split_list_keep_empty(constant_list);

    if source_columns.is_empty() || target_columns.is_empty() {
        return Err(TransferError::Definition(
            "source or destination column list is empty after parsing".to_string(),
        ));
    }

    let len = source_columns.len().min(target_columns.len());
    let mut rules = Vec::with_capacity(len);
    for i in 0..len {
        let constant = constants
            .get(i)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());

        if let Some(constant) = constant {
            rules.push(ColumnMappingRule {
                source_column: None,
                target_column: target_columns[i].clone(),
                constant_value: Some(constant.to_string()),
            });
        } else {
            rules.push(ColumnMappingRule {
                source_column: Some(source_columns[i].clone()),
                target_column: target_columns[i].clone(),
                constant_value: None,
            });
        }
    }

    Ok(rules)
}

/// The constants list is positional: empty slots are significant and must
/// not collapse, unlike the column lists.
fn split_list_keep_empty(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|value| value.trim().to_string()).collect()
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn quote_constant(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Turns the ordered rule list into a source projection and an ordinal
/// column map. Pure string work; no database I/O happens here, so a
/// malformed mapping fails the job before any connection is touched.
pub fn resolve_mapping(rules: &[ColumnMappingRule]) -> Result<ResolvedMapping, TransferError> {
    if rules.is_empty() {
        return Err(TransferError::Definition(
            "no column mapping rules defined".to_string(),
        ));
    }

    let mut terms = Vec::with_capacity(rules.len());
    let mut bindings = Vec::with_capacity(rules.len());
    let mut ordinal = 0usize;

    for (index, rule) in rules.iter().enumerate() {
        let target = rule.target_column.trim();
        if target.is_empty() {
            return Err(TransferError::Definition(format!(
                "mapping rule {} has an empty target column",
                index + 1
            )));
        }

        match (
            rule.constant_value.as_deref().map(str::trim),
            rule.source_column.as_deref().map(str::trim),
        ) {
            (Some(constant), _) if !constant.is_empty() => {
                terms.push(format!(
                    "{} AS {}",
                    quote_constant(constant),
                    quote_identifier(target)
                ));
            }
            (_, Some(source)) if !source.is_empty() => {
                terms.push(quote_identifier(source));
            }
            _ => {
                return Err(TransferError::Definition(format!(
                    "mapping rule {} has neither a source column nor a constant",
                    index + 1
                )));
            }
        }

        bindings.push(ColumnBinding {
            source_ordinal: ordinal,
            target_column: target.to_string(),
        });
        ordinal += 1;
    }

    Ok(ResolvedMapping {
        select_list: terms.join(", "),
        bindings,
    })
}

/// Checks that the job names a source at all. Runs with the mapping
/// resolution, before any connection is opened, so a job missing both the
/// table and the query fails without touching the destination.
pub fn validate_source(job: &ImportJob) -> Result<(), TransferError> {
    if job.trimmed_source_query().is_none() && job.from_table.trim().is_empty() {
        return Err(TransferError::Definition(
            "job has neither a source table nor a source query".to_string(),
        ));
    }
    Ok(())
}

/// Final source query text. An ad-hoc query is wrapped as a derived table so
/// the projection applies on top of it; a plain table reference is bracket
/// quoted unless the author already quoted it.
pub fn build_source_query(job: &ImportJob, select_list: &str) -> Result<String, TransferError> {
    if let Some(query) = job.trimmed_source_query() {
        return Ok(format!(
            "SELECT {} FROM ({}) AS QueryResult",
            select_list, query
        ));
    }

    let table = job.from_table.trim();
    if table.is_empty() {
        return Err(TransferError::Definition(
            "job has neither a source table nor a source query".to_string(),
        ));
    }

    Ok(format!(
        "SELECT {} FROM {}",
        select_list,
        table_reference(table)
    ))
}

/// Bracket-quotes a plain table name; names the author already quoted (or
/// schema-qualified with brackets) pass through untouched.
pub fn table_reference(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.contains('[') || trimmed.contains(']') {
        trimmed.to_string()
    } else {
        quote_identifier(trimmed)
    }
}
