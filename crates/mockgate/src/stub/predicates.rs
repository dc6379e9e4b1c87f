//! Compiled request matchers.
//!
//! Patterns are compiled once when a rule is inserted, so the per-request
//! match path touches only pre-built regexes and JSONPath queries. All
//! predicates fail closed: a missing header or body, malformed JSON, or a
//! predicate evaluation error is a non-match, never a request failure.

use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;

use crate::gateway::InboundRequest;
use crate::stub::types::{
    BodyMatch, BodyMode, BodyPredicate, BodyPredicateKind, MatchMethod, RequestMatcher, UrlMatch,
    UrlMatchKind, ValueMatch, ValueMatchKind,
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid url pattern '{pattern}': {source}")]
    InvalidUrlPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid pattern for header '{name}': {source}")]
    InvalidHeaderPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid body regex '{pattern}': {source}")]
    InvalidBodyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid JSONPath expression '{expr}': {source}")]
    InvalidJsonPath {
        expr: String,
        #[source]
        source: serde_json_path::ParseError,
    },
    #[error("body predicate {kind:?} is missing its '{field}' field")]
    MissingPredicateField {
        kind: BodyPredicateKind,
        field: &'static str,
    },
}

#[derive(Debug)]
pub struct CompiledRequestMatcher {
    method: MatchMethod,
    url: CompiledUrl,
    headers: Vec<(String, CompiledValue)>,
    body: Option<CompiledBody>,
}

#[derive(Debug)]
enum CompiledUrl {
    Exact(String),
    Loosened(Regex),
}

#[derive(Debug)]
enum CompiledValue {
    EqualTo(String),
    Matches(Regex),
    Contains(String),
}

#[derive(Debug)]
struct CompiledBody {
    mode: BodyMode,
    predicates: Vec<CompiledBodyPredicate>,
}

#[derive(Debug)]
enum CompiledBodyPredicate {
    EqualToJson {
        expected: Value,
        ignore_array_order: bool,
        ignore_extra_elements: bool,
    },
    JsonPath(JsonPath),
    Matches(Regex),
    Contains(String),
}

/// Anchors a user-supplied regex so it must cover the whole candidate.
fn full_match_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl CompiledRequestMatcher {
    pub fn compile(spec: &RequestMatcher) -> Result<Self, CompileError> {
        let url = compile_url(&spec.url)?;
        let mut headers = Vec::with_capacity(spec.headers.len());
        for (name, matcher) in &spec.headers {
            headers.push((name.to_ascii_lowercase(), compile_value(name, matcher)?));
        }
        let body = spec.body.as_ref().map(compile_body).transpose()?;
        Ok(CompiledRequestMatcher {
            method: spec.method,
            url,
            headers,
            body,
        })
    }

    pub fn matches(&self, request: &InboundRequest) -> bool {
        if self.method != MatchMethod::Any
            && !request.method.eq_ignore_ascii_case(self.method.as_str())
        {
            return false;
        }
        let candidate = request.path_and_query();
        let url_ok = match &self.url {
            CompiledUrl::Exact(value) => *value == candidate,
            CompiledUrl::Loosened(regex) => regex.is_match(&candidate),
        };
        if !url_ok {
            return false;
        }
        for (name, matcher) in &self.headers {
            let Some(value) = request.header(name) else {
                return false;
            };
            if !value_matches(matcher, value) {
                return false;
            }
        }
        match &self.body {
            Some(body) => body_matches(body, request.body_text().as_deref()),
            None => true,
        }
    }
}

fn compile_url(spec: &UrlMatch) -> Result<CompiledUrl, CompileError> {
    match spec.kind {
        UrlMatchKind::Exact => Ok(CompiledUrl::Exact(spec.value.clone())),
        UrlMatchKind::Loosened => full_match_regex(&spec.value)
            .map(CompiledUrl::Loosened)
            .map_err(|source| CompileError::InvalidUrlPattern {
                pattern: spec.value.clone(),
                source,
            }),
    }
}

fn compile_value(name: &str, spec: &ValueMatch) -> Result<CompiledValue, CompileError> {
    match spec.kind {
        ValueMatchKind::EqualTo => Ok(CompiledValue::EqualTo(spec.value.clone())),
        ValueMatchKind::Contains => Ok(CompiledValue::Contains(spec.value.clone())),
        ValueMatchKind::Matches => full_match_regex(&spec.value)
            .map(CompiledValue::Matches)
            .map_err(|source| CompileError::InvalidHeaderPattern {
                name: name.to_string(),
                source,
            }),
    }
}

fn compile_body(spec: &BodyMatch) -> Result<CompiledBody, CompileError> {
    let mut predicates = Vec::with_capacity(spec.matchers.len());
    for predicate in &spec.matchers {
        predicates.push(compile_body_predicate(predicate)?);
    }
    Ok(CompiledBody {
        mode: spec.mode,
        predicates,
    })
}

fn compile_body_predicate(spec: &BodyPredicate) -> Result<CompiledBodyPredicate, CompileError> {
    let compiled = match spec.kind {
        BodyPredicateKind::EqualToJson => {
            let expected = spec.value.clone().ok_or(CompileError::MissingPredicateField {
                kind: spec.kind,
                field: "value",
            })?;
            CompiledBodyPredicate::EqualToJson {
                expected,
                ignore_array_order: spec.ignore_array_order.unwrap_or(true),
                ignore_extra_elements: spec.ignore_extra_elements.unwrap_or(true),
            }
        }
        BodyPredicateKind::JsonPath => {
            let expr = spec.expr.as_deref().ok_or(CompileError::MissingPredicateField {
                kind: spec.kind,
                field: "expr",
            })?;
            let path = JsonPath::parse(expr).map_err(|source| CompileError::InvalidJsonPath {
                expr: expr.to_string(),
                source,
            })?;
            CompiledBodyPredicate::JsonPath(path)
        }
        BodyPredicateKind::Matches => {
            let expr = spec.expr.as_deref().ok_or(CompileError::MissingPredicateField {
                kind: spec.kind,
                field: "expr",
            })?;
            let regex = full_match_regex(expr).map_err(|source| CompileError::InvalidBodyPattern {
                pattern: expr.to_string(),
                source,
            })?;
            CompiledBodyPredicate::Matches(regex)
        }
        BodyPredicateKind::Contains => {
            let expr = spec.expr.as_deref().ok_or(CompileError::MissingPredicateField {
                kind: spec.kind,
                field: "expr",
            })?;
            CompiledBodyPredicate::Contains(expr.to_string())
        }
    };
    Ok(compiled)
}

fn value_matches(matcher: &CompiledValue, value: &str) -> bool {
    match matcher {
        CompiledValue::EqualTo(expected) => expected == value,
        CompiledValue::Matches(regex) => regex.is_match(value),
        CompiledValue::Contains(needle) => value.contains(needle.as_str()),
    }
}

fn body_matches(body: &CompiledBody, candidate: Option<&str>) -> bool {
    if body.predicates.is_empty() {
        return true;
    }
    let Some(raw) = candidate else {
        return false;
    };
    // Parsed lazily; only JSON-structural predicates need it.
    let parsed: Option<Value> = match body.mode {
        BodyMode::Json => serde_json::from_str(raw).ok(),
        BodyMode::Text => None,
    };
    body.predicates.iter().all(|predicate| match predicate {
        CompiledBodyPredicate::EqualToJson {
            expected,
            ignore_array_order,
            ignore_extra_elements,
        } => {
            if body.mode == BodyMode::Text {
                return true;
            }
            match &parsed {
                Some(actual) => {
                    json_equals(actual, expected, *ignore_array_order, *ignore_extra_elements)
                }
                None => false,
            }
        }
        CompiledBodyPredicate::JsonPath(path) => {
            if body.mode == BodyMode::Text {
                return true;
            }
            match &parsed {
                Some(actual) => path
                    .query(actual)
                    .all()
                    .iter()
                    .any(|node| !matches!(node, Value::Null | Value::Bool(false))),
                None => false,
            }
        }
        CompiledBodyPredicate::Matches(regex) => regex.is_match(raw),
        CompiledBodyPredicate::Contains(needle) => raw.contains(needle.as_str()),
    })
}

/// Structural equality with optional array-order and extra-element
/// tolerance. Extra-element tolerance applies to object keys and, in
/// unordered mode, to surplus array members.
fn json_equals(actual: &Value, expected: &Value, ignore_order: bool, ignore_extra: bool) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => {
            if !ignore_extra && actual.len() != expected.len() {
                return false;
            }
            expected.iter().all(|(key, expected_value)| {
                actual
                    .get(key)
                    .is_some_and(|actual_value| {
                        json_equals(actual_value, expected_value, ignore_order, ignore_extra)
                    })
            })
        }
        (Value::Array(actual), Value::Array(expected)) => {
            if ignore_order {
                if ignore_extra {
                    if actual.len() < expected.len() {
                        return false;
                    }
                } else if actual.len() != expected.len() {
                    return false;
                }
                let mut used = vec![false; actual.len()];
                expected.iter().all(|expected_value| {
                    actual.iter().enumerate().any(|(i, actual_value)| {
                        if used[i] {
                            return false;
                        }
                        if json_equals(actual_value, expected_value, ignore_order, ignore_extra) {
                            used[i] = true;
                            true
                        } else {
                            false
                        }
                    })
                })
            } else {
                let length_ok = if ignore_extra {
                    actual.len() >= expected.len()
                } else {
                    actual.len() == expected.len()
                };
                length_ok
                    && expected.iter().zip(actual.iter()).all(|(e, a)| {
                        json_equals(a, e, ignore_order, ignore_extra)
                    })
            }
        }
        _ => actual == expected,
    }
}
