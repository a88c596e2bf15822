/// Query definitions for collections.
///
/// A [`Query`] is a selector (a conjunction of [`Filter`]s) plus sort, skip
/// and limit. Queries are plain data: the query cache keys them by their
/// canonical string, and collections evaluate them against stored documents.
///
/// Two queries that differ only in the order of their AND-ed filters (at any
/// nesting level) have the same canonical string and therefore share one
/// cache entry.
///
/// # Example
///
/// ```ignore
/// use koru_reactive::query::{Filter, Query};
///
/// let query = Query::new()
///     .filter(Filter::eq("category", "tools"))
///     .filter(Filter::gt("price", 10))
///     .sort_by("price", true)
///     .limit(20);
/// ```
use crate::storage::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// A filter condition on document fields. Field names use dot notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    /// Field equals value.
    Eq { field: String, value: JsonValue },
    /// Field not equals value (missing fields match).
    Ne { field: String, value: JsonValue },
    /// Field greater than value.
    Gt { field: String, value: JsonValue },
    /// Field greater than or equal to value.
    Gte { field: String, value: JsonValue },
    /// Field less than value.
    Lt { field: String, value: JsonValue },
    /// Field less than or equal to value.
    Lte { field: String, value: JsonValue },
    /// Field equals one of the values.
    In { field: String, values: Vec<JsonValue> },
    /// Field contains substring (strings), element (arrays) or key (objects).
    Contains { field: String, value: JsonValue },
    /// Field exists and is not null.
    Exists { field: String },
    /// Field matches regex pattern (strings only).
    Matches { field: String, pattern: String },
    /// Logical AND of multiple filters.
    And(Vec<Filter>),
    /// Logical OR of multiple filters.
    Or(Vec<Filter>),
    /// Logical NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    pub fn matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Evaluate this filter against a document body.
    pub fn matches_value(&self, value: &JsonValue) -> bool {
        match self {
            Filter::Eq {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| v == expected),
            Filter::Ne {
                field,
                value: expected,
            } => get_field(value, field).is_none_or(|v| v != expected),
            Filter::Gt {
                field,
                value: expected,
            } => get_field(value, field)
                .is_some_and(|v| compare_json(v, expected) == Some(Ordering::Greater)),
            Filter::Gte {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| {
                matches!(
                    compare_json(v, expected),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Filter::Lt {
                field,
                value: expected,
            } => get_field(value, field)
                .is_some_and(|v| compare_json(v, expected) == Some(Ordering::Less)),
            Filter::Lte {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| {
                matches!(
                    compare_json(v, expected),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }),
            Filter::In { field, values } => {
                get_field(value, field).is_some_and(|v| values.contains(v))
            }
            Filter::Contains {
                field,
                value: expected,
            } => get_field(value, field).is_some_and(|v| json_contains(v, expected)),
            Filter::Exists { field } => get_field(value, field).is_some_and(|v| !v.is_null()),
            Filter::Matches { field, pattern } => get_field(value, field)
                .and_then(JsonValue::as_str)
                .is_some_and(|s| regex::Regex::new(pattern).is_ok_and(|re| re.is_match(s))),
            Filter::And(filters) => filters.iter().all(|f| f.matches_value(value)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches_value(value)),
            Filter::Not(filter) => !filter.matches_value(value),
        }
    }

    /// Normalized copy: children of AND/OR sorted by their serialized form.
    fn normalized(&self) -> Filter {
        match self {
            Filter::And(filters) => Filter::And(normalize_all(filters)),
            Filter::Or(filters) => Filter::Or(normalize_all(filters)),
            Filter::Not(inner) => Filter::Not(Box::new(inner.normalized())),
            other => other.clone(),
        }
    }
}

fn normalize_all(filters: &[Filter]) -> Vec<Filter> {
    let mut keyed: Vec<(String, Filter)> = filters
        .iter()
        .map(|f| {
            let f = f.normalized();
            (serde_json::to_string(&f).unwrap_or_default(), f)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, f)| f).collect()
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub order: SortOrder,
}

impl SortBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// A query against one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter conditions (AND).
    pub selector: Vec<Filter>,
    /// Sort specifications, applied in order.
    pub sort: Vec<SortBy>,
    /// Number of results to skip.
    pub skip: Option<usize>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl Query {
    /// Create a query matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter condition.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.selector.push(filter);
        self
    }

    /// Add a sort specification.
    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort.push(if ascending {
            SortBy::asc(field)
        } else {
            SortBy::desc(field)
        });
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical string used as the query cache key.
    ///
    /// AND-ed filters are order-insensitive; sort order is significant.
    pub fn canonical_string(&self) -> String {
        let canonical = Query {
            selector: normalize_all(&self.selector),
            sort: self.sort.clone(),
            skip: self.skip.filter(|s| *s > 0),
            limit: self.limit,
        };
        serde_json::to_string(&canonical).expect("Query of JSON values should serialize")
    }

    /// Check if a document body matches the selector.
    pub fn matches(&self, value: &JsonValue) -> bool {
        self.selector.iter().all(|f| f.matches_value(value))
    }

    /// Evaluate this query over a set of documents.
    ///
    /// Documents are ordered by the sort specifications, then by id, so the
    /// result is deterministic regardless of storage iteration order.
    pub fn execute<I>(&self, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut results: Vec<Document> = documents
            .into_iter()
            .filter(|doc| self.matches(&doc.data))
            .collect();

        results.sort_by(|a, b| {
            for spec in &self.sort {
                let cmp = match (get_field(&a.data, &spec.field), get_field(&b.data, &spec.field)) {
                    (Some(av), Some(bv)) => compare_json(av, bv).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let cmp = match spec.order {
                    SortOrder::Asc => cmp,
                    SortOrder::Desc => cmp.reverse(),
                };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a.id.cmp(&b.id)
        });

        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        results.into_iter().skip(skip).take(limit).collect()
    }
}

/// Get a field from a JSON value using dot notation.
pub(crate) fn get_field<'a>(value: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for part in field.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Compare two JSON values. Null sorts first; mixed types are unordered.
fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Null, _) => Some(Ordering::Less),
        (_, JsonValue::Null) => Some(Ordering::Greater),
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn json_contains(container: &JsonValue, item: &JsonValue) -> bool {
    match container {
        JsonValue::String(s) => item.as_str().is_some_and(|sub| s.contains(sub)),
        JsonValue::Array(arr) => arr.contains(item),
        JsonValue::Object(map) => item.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, data: JsonValue) -> Document {
        Document::new(id, data)
    }

    #[test]
    fn test_canonical_ignores_filter_order() {
        let a = Query::new()
            .filter(Filter::eq("category", "tools"))
            .filter(Filter::gt("price", 10));
        let b = Query::new()
            .filter(Filter::gt("price", 10))
            .filter(Filter::eq("category", "tools"));
        assert_eq!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn test_canonical_normalizes_nested_or() {
        let a = Query::new().filter(Filter::or(vec![Filter::eq("a", 1), Filter::eq("b", 2)]));
        let b = Query::new().filter(Filter::or(vec![Filter::eq("b", 2), Filter::eq("a", 1)]));
        assert_eq!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn test_canonical_respects_sort_and_limit() {
        let base = Query::new().filter(Filter::eq("a", 1));
        assert_ne!(
            base.clone().sort_by("x", true).canonical_string(),
            base.clone().sort_by("x", false).canonical_string()
        );
        assert_ne!(
            base.clone().limit(1).canonical_string(),
            base.clone().canonical_string()
        );
        // skip(0) is the same as no skip.
        assert_eq!(
            base.clone().skip(0).canonical_string(),
            base.canonical_string()
        );
    }

    #[test]
    fn test_canonical_keys_are_distinct_for_unusual_values() {
        let queries = [
            Query::new(),
            Query::new().filter(Filter::eq("price", 1.5)),
            Query::new().filter(Filter::eq("price", json!(null))),
            Query::new().filter(Filter::eq("meta", json!({"k": [1, {"deep": true}]}))),
            Query::new().filter(Filter::not(Filter::matches("name", "^W.*\\d$"))),
            Query::new().filter(Filter::is_in("tag", vec![json!("a"), json!(2)])),
        ];
        let keys: std::collections::HashSet<String> =
            queries.iter().map(Query::canonical_string).collect();
        assert_eq!(keys.len(), queries.len());
        assert!(keys.iter().all(|k| !k.is_empty()));
    }

    #[test]
    fn test_filter_comparisons() {
        let value = json!({"name": "Widget", "price": 15, "tags": ["a", "b"], "meta": {"color": "red"}});

        assert!(Filter::eq("name", "Widget").matches_value(&value));
        assert!(Filter::ne("name", "Gadget").matches_value(&value));
        assert!(Filter::ne("missing", 1).matches_value(&value));
        assert!(Filter::gt("price", 10).matches_value(&value));
        assert!(Filter::gte("price", 15).matches_value(&value));
        assert!(!Filter::lt("price", 15).matches_value(&value));
        assert!(Filter::lte("price", 15).matches_value(&value));
        assert!(Filter::is_in("price", vec![json!(1), json!(15)]).matches_value(&value));
        assert!(Filter::contains("tags", "a").matches_value(&value));
        assert!(Filter::contains("name", "idg").matches_value(&value));
        assert!(Filter::exists("meta.color").matches_value(&value));
        assert!(!Filter::exists("meta.size").matches_value(&value));
        assert!(Filter::matches("name", "^Wid").matches_value(&value));
        assert!(Filter::not(Filter::eq("meta.color", "blue")).matches_value(&value));
    }

    #[test]
    fn test_execute_sort_skip_limit() {
        let docs = vec![
            doc("p1", json!({"price": 30})),
            doc("p2", json!({"price": 10})),
            doc("p3", json!({"price": 20})),
            doc("p4", json!({"price": 5, "hidden": true})),
        ];

        let query = Query::new()
            .filter(Filter::not(Filter::exists("hidden")))
            .sort_by("price", false)
            .skip(1)
            .limit(1);

        let result = query.execute(docs);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "p3");
    }

    #[test]
    fn test_execute_orders_by_id_without_sort() {
        let docs = vec![doc("b", json!({})), doc("a", json!({})), doc("c", json!({}))];
        let ids: Vec<String> = Query::new().execute(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
