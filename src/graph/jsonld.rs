//! JSON-LD (expanded form) encoding of statements and patterns
//!
//! Document shape: an array of node objects, or an object with `@graph`, or
//! a single node object. Each node has `@id` and predicate keys whose values
//! are arrays of `{"@id": ...}` or `{"@value": ..., "@type"?, "@language"?}`.
//! Node-level `@type` is read as `rdf:type`.
//!
//! In patterns, the IRI [`ANY`] in any position is a wildcard. A node with no
//! predicate keys matches any predicate and object; a predicate with an empty
//! value array matches any object.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{Term, Triple, TriplePattern};
use crate::error::{Result, SyncError};

/// Reserved IRI meaning "unconstrained".
pub const ANY: &str = "urn:graphsync:any";

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";

fn invalid(msg: impl Into<String>) -> SyncError {
    SyncError::InvalidGraph(msg.into())
}

fn parse_document(text: &str) -> Result<Option<Value>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

fn nodes(doc: &Value) -> Result<Vec<&Map<String, Value>>> {
    let items: Vec<&Value> = match doc {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("@graph") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => return Err(invalid("@graph must be an array")),
            None => vec![doc],
        },
        _ => return Err(invalid("expected a JSON array or object")),
    };

    items
        .into_iter()
        .map(|item| item.as_object().ok_or_else(|| invalid("node must be a JSON object")))
        .collect()
}

fn iri_position(iri: &str, wildcards: bool) -> Result<Option<String>> {
    if iri == ANY {
        if wildcards {
            return Ok(None);
        }
        return Err(invalid("wildcard not allowed in statements"));
    }
    Ok(Some(iri.to_string()))
}

fn parse_object(value: &Value) -> Result<Term> {
    match value {
        Value::String(s) => Ok(Term::literal(s.as_str())),
        Value::Bool(b) => Ok(Term::Literal {
            value: b.to_string(),
            datatype: Some(XSD_BOOLEAN.to_string()),
            language: None,
        }),
        Value::Number(n) => Ok(Term::Literal {
            value: n.to_string(),
            datatype: Some(if n.is_f64() { XSD_DOUBLE } else { XSD_INTEGER }.to_string()),
            language: None,
        }),
        Value::Object(obj) => {
            if let Some(id) = obj.get("@id") {
                let id = id.as_str().ok_or_else(|| invalid("@id must be a string"))?;
                return Ok(Term::iri(id));
            }
            let raw = obj.get("@value").ok_or_else(|| invalid("object needs @id or @value"))?;
            let value = match raw {
                Value::String(s) => s.clone(),
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(invalid("@value must be a scalar"));
                }
                other => other.to_string(),
            };
            let text_field = |key: &str| -> Result<Option<String>> {
                match obj.get(key) {
                    None => Ok(None),
                    Some(Value::String(s)) => Ok(Some(s.clone())),
                    Some(_) => Err(invalid(format!("{} must be a string", key))),
                }
            };
            Ok(Term::Literal {
                value,
                datatype: text_field("@type")?,
                language: text_field("@language")?,
            })
        }
        _ => Err(invalid("unsupported object value")),
    }
}

fn object_position(value: &Value, wildcards: bool) -> Result<Option<Term>> {
    match parse_object(value)? {
        Term::Iri(iri) if iri == ANY => iri_position(&iri, wildcards).map(|_| None),
        term => Ok(Some(term)),
    }
}

fn values(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    }
}

fn parse_value(doc: &Value, wildcards: bool) -> Result<Vec<TriplePattern>> {
    let mut patterns = Vec::new();

    for node in nodes(doc)? {
        let subject = match node.get("@id") {
            Some(Value::String(id)) => iri_position(id, wildcards)?,
            Some(_) => return Err(invalid("@id must be a string")),
            None => return Err(invalid("node without @id")),
        };

        let mut has_predicates = false;
        for (key, value) in node {
            let predicate = match key.as_str() {
                "@type" => Some(RDF_TYPE.to_string()),
                "@id" => continue,
                k if k.starts_with('@') => continue,
                k => iri_position(k, wildcards)?,
            };
            has_predicates = true;

            let objects = values(value);
            if objects.is_empty() && wildcards {
                patterns.push(TriplePattern {
                    subject: subject.clone(),
                    predicate: predicate.clone(),
                    object: None,
                });
            }
            for object in objects {
                let object = if key == "@type" {
                    let iri = object.as_str().ok_or_else(|| invalid("@type must be an IRI"))?;
                    object_position(&serde_json::json!({ "@id": iri }), wildcards)?
                } else {
                    object_position(object, wildcards)?
                };
                patterns.push(TriplePattern {
                    subject: subject.clone(),
                    predicate: predicate.clone(),
                    object,
                });
            }
        }

        if !has_predicates && wildcards {
            patterns.push(TriplePattern {
                subject,
                predicate: None,
                object: None,
            });
        }
    }

    Ok(patterns)
}

/// Statements from a parsed document value. Wildcards are rejected.
pub fn triples_from_value(doc: &Value) -> Result<Vec<Triple>> {
    parse_value(doc, false)?
        .into_iter()
        .map(|p| p.into_triple().ok_or_else(|| invalid("incomplete statement")))
        .collect()
}

/// Statements from payload text. Empty text is an empty graph.
pub fn parse_triples(text: &str) -> Result<Vec<Triple>> {
    match parse_document(text)? {
        Some(doc) => triples_from_value(&doc),
        None => Ok(Vec::new()),
    }
}

/// Query patterns from payload text. Empty text yields no patterns.
pub fn parse_patterns(text: &str) -> Result<Vec<TriplePattern>> {
    match parse_document(text)? {
        Some(doc) => parse_value(&doc, true),
        None => Ok(Vec::new()),
    }
}

fn object_value(term: &Term) -> Value {
    match term {
        Term::Iri(iri) => serde_json::json!({ "@id": iri }),
        Term::Literal { value, datatype, language } => {
            let mut obj = Map::new();
            obj.insert("@value".to_string(), Value::String(value.clone()));
            if let Some(dt) = datatype {
                obj.insert("@type".to_string(), Value::String(dt.clone()));
            }
            if let Some(lang) = language {
                obj.insert("@language".to_string(), Value::String(lang.clone()));
            }
            Value::Object(obj)
        }
    }
}

/// Expanded JSON-LD for `triples`, subjects and predicates in sorted order.
pub fn to_value<'a>(triples: impl IntoIterator<Item = &'a Triple>) -> Value {
    let mut grouped: BTreeMap<&str, BTreeMap<&str, Vec<&Term>>> = BTreeMap::new();
    for triple in triples {
        grouped
            .entry(triple.subject.as_str())
            .or_default()
            .entry(triple.predicate.as_str())
            .or_default()
            .push(&triple.object);
    }

    let nodes = grouped
        .into_iter()
        .map(|(subject, predicates)| {
            let mut node = Map::new();
            node.insert("@id".to_string(), Value::String(subject.to_string()));
            for (predicate, mut objects) in predicates {
                objects.sort();
                objects.dedup();
                node.insert(
                    predicate.to_string(),
                    Value::Array(objects.into_iter().map(object_value).collect()),
                );
            }
            Value::Object(node)
        })
        .collect();

    Value::Array(nodes)
}

pub fn to_string<'a>(triples: impl IntoIterator<Item = &'a Triple>) -> String {
    to_value(triples).to_string()
}

/// Expanded JSON-LD for patterns, with [`ANY`] standing in for wildcards.
pub fn patterns_to_string(patterns: &[TriplePattern]) -> String {
    let nodes: Vec<Value> = patterns
        .iter()
        .map(|pattern| {
            let mut node = Map::new();
            node.insert(
                "@id".to_string(),
                Value::String(pattern.subject.clone().unwrap_or_else(|| ANY.to_string())),
            );
            if pattern.predicate.is_some() || pattern.object.is_some() {
                let object = match &pattern.object {
                    Some(term) => object_value(term),
                    None => serde_json::json!({ "@id": ANY }),
                };
                node.insert(
                    pattern.predicate.clone().unwrap_or_else(|| ANY.to_string()),
                    Value::Array(vec![object]),
                );
            }
            Value::Object(node)
        })
        .collect();

    Value::Array(nodes).to_string()
}
