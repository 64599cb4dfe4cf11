//! Label selectors.
//!
//! Documents carry a [`LabelSelector`] (`matchLabels` + `matchExpressions`).
//! Before evaluation every selector is compiled into a [`Selector`], a flat
//! conjunction of [`Requirement`]s, so nothing is re-parsed per query.
//! Wherever a document takes a selector it also accepts the compact string
//! form `app=api,tier!=db,env in (prod,stage),!legacy,owner`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Why a selector was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("invalid label key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid label value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("operator {operator} on key '{key}' needs at least one value")]
    MissingValues { key: String, operator: String },

    #[error("operator {operator} on key '{key}' takes no values")]
    UnexpectedValues { key: String, operator: String },

    #[error("cannot parse selector term '{0}'")]
    Syntax(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Selector as written in a policy document. The empty selector selects
/// everything. Deserializes from either the structured form or the compact
/// string form; always serializes structured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "SelectorInput")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Selector that matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Parse the compact string form into its structured equivalent.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        Ok(Selector::parse(input)?.to_label_selector())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SelectorInput {
    Compact(String),
    Structured(StructuredSelector),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredSelector {
    #[serde(default)]
    match_labels: BTreeMap<String, String>,
    #[serde(default)]
    match_expressions: Vec<LabelSelectorRequirement>,
}

impl TryFrom<SelectorInput> for LabelSelector {
    type Error = SelectorError;

    fn try_from(input: SelectorInput) -> Result<Self, Self::Error> {
        match input {
            SelectorInput::Compact(s) => LabelSelector::parse(&s),
            SelectorInput::Structured(s) => Ok(LabelSelector {
                match_labels: s.match_labels,
                match_expressions: s.match_expressions,
            }),
        }
    }
}

/// One compiled predicate on a single label key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub op: Op,
}

/// Compiled selector: every requirement must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn compile(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = Vec::with_capacity(
            selector.match_labels.len() + selector.match_expressions.len(),
        );
        for (key, value) in &selector.match_labels {
            validate_label_key(key)?;
            validate_label_value(key, value)?;
            requirements.push(Requirement {
                key: key.clone(),
                op: Op::Equals(value.clone()),
            });
        }
        for expr in &selector.match_expressions {
            validate_label_key(&expr.key)?;
            for value in &expr.values {
                validate_label_value(&expr.key, value)?;
            }
            let values: BTreeSet<String> = expr.values.iter().cloned().collect();
            let op = match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if values.is_empty() => {
                    return Err(SelectorError::MissingValues {
                        key: expr.key.clone(),
                        operator: format!("{:?}", expr.operator),
                    });
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist if !values.is_empty() => {
                    return Err(SelectorError::UnexpectedValues {
                        key: expr.key.clone(),
                        operator: format!("{:?}", expr.operator),
                    });
                }
                SelectorOperator::In => Op::In(values),
                SelectorOperator::NotIn => Op::NotIn(values),
                SelectorOperator::Exists => Op::Exists,
                SelectorOperator::DoesNotExist => Op::DoesNotExist,
            };
            requirements.push(Requirement {
                key: expr.key.clone(),
                op,
            });
        }
        Ok(Self { requirements })
    }

    /// Parse the compact string form. The empty string selects everything.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for term in split_terms(input)? {
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    /// Structured form with the same meaning. `k!=v` becomes `NotIn [v]`,
    /// which also matches workloads without the key.
    pub fn to_label_selector(&self) -> LabelSelector {
        let mut out = LabelSelector::default();
        for req in &self.requirements {
            let (operator, values) = match &req.op {
                Op::Equals(v) if !out.match_labels.contains_key(&req.key) => {
                    out.match_labels.insert(req.key.clone(), v.clone());
                    continue;
                }
                Op::Equals(v) => (SelectorOperator::In, vec![v.clone()]),
                Op::NotEquals(v) => (SelectorOperator::NotIn, vec![v.clone()]),
                Op::In(vs) => (SelectorOperator::In, vs.iter().cloned().collect()),
                Op::NotIn(vs) => (SelectorOperator::NotIn, vs.iter().cloned().collect()),
                Op::Exists => (SelectorOperator::Exists, Vec::new()),
                Op::DoesNotExist => (SelectorOperator::DoesNotExist, Vec::new()),
            };
            out.match_expressions.push(LabelSelectorRequirement {
                key: req.key.clone(),
                operator,
                values,
            });
        }
        out
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match &r.op {
                Op::Equals(v) => format!("{}={}", r.key, v),
                Op::NotEquals(v) => format!("{}!={}", r.key, v),
                Op::In(vs) => format!("{} in ({})", r.key, join(vs)),
                Op::NotIn(vs) => format!("{} notin ({})", r.key, join(vs)),
                Op::Exists => r.key.clone(),
                Op::DoesNotExist => format!("!{}", r.key),
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Split on commas that are not inside a parenthesised value set.
fn split_terms(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::Syntax(input.to_string()))?;
            }
            ',' if depth == 0 => {
                terms.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Syntax(input.to_string()));
    }
    let last = input[start..].trim();
    if !last.is_empty() || !terms.is_empty() {
        terms.push(last);
    }
    if terms.iter().any(|t| t.is_empty()) {
        return Err(SelectorError::Syntax(input.to_string()));
    }
    Ok(terms)
}

fn parse_term(term: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        validate_label_key(key)?;
        return Ok(Requirement {
            key: key.to_string(),
            op: Op::DoesNotExist,
        });
    }
    if let Some((key, rest)) = term.split_once(" notin ") {
        return set_requirement(term, key, rest, false);
    }
    if let Some((key, rest)) = term.split_once(" in ") {
        return set_requirement(term, key, rest, true);
    }
    if let Some((key, value)) = term.split_once("!=") {
        let (key, value) = (key.trim(), value.trim());
        validate_label_key(key)?;
        validate_label_value(key, value)?;
        return Ok(Requirement {
            key: key.to_string(),
            op: Op::NotEquals(value.to_string()),
        });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let (key, value) = (key.trim(), value.trim());
        validate_label_key(key)?;
        validate_label_value(key, value)?;
        return Ok(Requirement {
            key: key.to_string(),
            op: Op::Equals(value.to_string()),
        });
    }
    if term.contains(char::is_whitespace) || term.contains(['(', ')']) {
        return Err(SelectorError::Syntax(term.to_string()));
    }
    validate_label_key(term)?;
    Ok(Requirement {
        key: term.to_string(),
        op: Op::Exists,
    })
}

fn set_requirement(term: &str, key: &str, rest: &str, is_in: bool) -> Result<Requirement, SelectorError> {
    let key = key.trim();
    validate_label_key(key)?;
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| SelectorError::Syntax(term.to_string()))?;
    let mut values = BTreeSet::new();
    for value in inner.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        validate_label_value(key, value)?;
        values.insert(value.to_string());
    }
    if values.is_empty() {
        return Err(SelectorError::MissingValues {
            key: key.to_string(),
            operator: if is_in { "In" } else { "NotIn" }.to_string(),
        });
    }
    Ok(Requirement {
        key: key.to_string(),
        op: if is_in { Op::In(values) } else { Op::NotIn(values) },
    })
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

fn is_label_token(s: &str) -> bool {
    s.len() <= 63
        && s.chars().all(is_label_char)
        && s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && s.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Keys are `[prefix/]name`: name is 1-63 alphanumerics plus `-_.`, the
/// optional prefix a lowercase DNS subdomain of at most 253 characters.
pub fn validate_label_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason: &str| SelectorError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if name.is_empty() {
        return Err(invalid("name part must not be empty"));
    }
    if !is_label_token(name) {
        return Err(invalid(
            "name part must be at most 63 alphanumerics, '-', '_' or '.', starting and ending alphanumeric",
        ));
    }
    if let Some(prefix) = prefix {
        let valid = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !label.starts_with('-')
                    && !label.ends_with('-')
            });
        if !valid {
            return Err(invalid("prefix must be a lowercase DNS subdomain"));
        }
    }
    Ok(())
}

/// Values are empty or a label token.
pub fn validate_label_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || is_label_token(value) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}
