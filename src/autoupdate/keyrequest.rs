//! Parsing and expansion of key requests.
//!
//! A request body is a JSON list of structured requests.  Each request names
//! a collection, ids and fields; a field is either plain (`null`) or a
//! relation whose stored value points at further objects:
//!
//! ```json
//! [{
//!     "ids": [1],
//!     "collection": "user",
//!     "fields": {
//!         "name": null,
//!         "group": {"type": "relation", "collection": "group", "fields": {"name": null}}
//!     }
//! }]
//! ```

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::datastore::Datastore;

/// A request that cannot be served.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The request structure is broken.
    #[error("{0}")]
    Syntax(String),
    /// The body is not valid JSON.
    #[error("{0}")]
    Json(serde_json::Error),
    /// The request does not match the stored data.
    #[error("invalid value in key {0}")]
    Value(String),
    /// A plain key is not of the `collection/id/field` form.
    #[error("Invalid keys")]
    InvalidKeys,
    /// Reading from the datastore failed while expanding.
    #[error("fetching keys: {0}")]
    Fetch(#[source] anyhow::Error),
}

impl RequestError {
    /// Stable kind name used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Syntax(_) | RequestError::InvalidKeys => "SyntaxError",
            RequestError::Json(_) => "JsonError",
            RequestError::Value(_) => "ValueError",
            RequestError::Fetch(_) => "FetchError",
        }
    }
}

/// One structured request for keys of a collection.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyRequest {
    /// Object ids within the collection.
    #[serde(default)]
    pub ids: Vec<u64>,
    /// Collection the ids belong to.  [`parse`] rejects requests without it.
    #[serde(default)]
    pub collection: Option<String>,
    /// Requested fields.  `None` is a plain value field.
    #[serde(default)]
    pub fields: HashMap<String, Option<Field>>,
}

/// A field that resolves to further keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Field {
    /// The field value holds the id (or ids) of related objects.
    Relation {
        /// Collection the related objects live in.
        collection: String,
        /// Fields requested on the related objects.
        #[serde(default)]
        fields: HashMap<String, Option<Field>>,
    },
}

/// Parses a request body into key requests.
pub fn parse(body: &[u8]) -> Result<Vec<KeyRequest>, RequestError> {
    let Some(start) = body.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Err(RequestError::Syntax("No data".to_string()));
    };
    // A broken body is the parser's error, a valid body of the wrong shape
    // is ours.
    if let Err(err) = serde_json::from_slice::<serde::de::IgnoredAny>(body) {
        return Err(RequestError::Json(err));
    }
    if body[start] != b'[' {
        return Err(RequestError::Syntax(format!(
            "wrong format at byte {}",
            start + 1
        )));
    }
    let requests: Vec<KeyRequest> = serde_json::from_slice(body).map_err(RequestError::Json)?;
    if requests.is_empty() {
        return Err(RequestError::Syntax("No data".to_string()));
    }
    for request in &requests {
        if request.collection.as_deref().unwrap_or_default().is_empty() {
            return Err(RequestError::Syntax("no collection".to_string()));
        }
    }
    Ok(requests)
}

/// Checks that every plain key is of the `collection/id/field` form.
pub fn validate_keys(keys: &[String]) -> Result<(), RequestError> {
    if keys.is_empty() || !keys.iter().all(|key| valid_key(key)) {
        return Err(RequestError::InvalidKeys);
    }
    Ok(())
}

fn valid_key(key: &str) -> bool {
    let mut parts = key.split('/');
    let (Some(collection), Some(id), Some(field), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    is_name(collection) && is_id(id) && is_name(field)
}

fn is_name(part: &str) -> bool {
    let mut chars = part.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_id(part: &str) -> bool {
    !part.is_empty() && !part.starts_with('0') && part.bytes().all(|b| b.is_ascii_digit())
}

struct Level {
    collection: String,
    ids: Vec<u64>,
    fields: HashMap<String, Option<Field>>,
}

/// Expands `requests` into a flat, deduplicated key list.
///
/// Relation fields are resolved through `datastore` level by level.  Keys are
/// collected at most once, which also bounds cyclic relation graphs: the walk
/// ends when a pass adds no new keys.
pub async fn expand(
    requests: &[KeyRequest],
    datastore: &Datastore,
) -> Result<Vec<String>, RequestError> {
    let mut keys: Vec<String> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut level: Vec<Level> = requests
        .iter()
        .map(|request| Level {
            collection: request.collection.clone().unwrap_or_default(),
            ids: request.ids.clone(),
            fields: request.fields.clone(),
        })
        .collect();

    while !level.is_empty() {
        let mut relation_keys: Vec<String> = Vec::new();
        let mut relations: Vec<(String, String, HashMap<String, Option<Field>>)> = Vec::new();
        for part in &level {
            for id in &part.ids {
                for (field, kind) in &part.fields {
                    let key = format!("{}/{}/{}", part.collection, id, field);
                    if !visited.insert(key.clone()) {
                        continue;
                    }
                    keys.push(key.clone());
                    if let Some(Field::Relation { collection, fields }) = kind {
                        relation_keys.push(key.clone());
                        relations.push((key, collection.clone(), fields.clone()));
                    }
                }
            }
        }
        if relation_keys.is_empty() {
            break;
        }

        let values = datastore
            .get(&relation_keys)
            .await
            .map_err(RequestError::Fetch)?;
        let mut next: Vec<Level> = Vec::new();
        for ((key, collection, fields), value) in relations.into_iter().zip(values) {
            // A key that does not exist upstream relates to nothing.
            let Some(value) = value else { continue };
            let ids = related_ids(&value).ok_or(RequestError::Value(key))?;
            if !ids.is_empty() {
                next.push(Level {
                    collection,
                    ids,
                    fields,
                });
            }
        }
        level = next;
    }

    Ok(keys)
}

/// The id or ids stored in a relation field.  `null` relates to nothing;
/// anything that is not an id or a list of ids is a value error.
fn related_ids(value: &[u8]) -> Option<Vec<u64>> {
    if let Ok(id) = serde_json::from_slice::<u64>(value) {
        return Some(vec![id]);
    }
    if let Ok(ids) = serde_json::from_slice::<Vec<u64>>(value) {
        return Some(ids);
    }
    if serde_json::from_slice::<()>(value).is_ok() {
        return Some(Vec::new());
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::datastore::upstream::MemoryUpstream;
    use crate::metrics::Metrics;
    use crate::topic::Topic;

    use super::*;

    #[test]
    fn parse_rejects_an_empty_body() {
        for body in [&b""[..], b"   ", b"[]"] {
            let err = parse(body).unwrap_err();
            assert_eq!(err.kind(), "SyntaxError");
            assert_eq!(err.to_string(), "No data");
        }
    }

    #[test]
    fn parse_rejects_broken_json_with_the_parser_message() {
        let err = parse(b"{5").unwrap_err();
        assert_eq!(err.kind(), "JsonError");
        assert!(
            err.to_string().starts_with("key must be a string"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn parse_rejects_a_non_list_root() {
        let err = parse(br#"{"ids":[1],"collection":"foo","fields":{}}"#).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert_eq!(err.to_string(), "wrong format at byte 1");

        let err = parse(br#"  42"#).unwrap_err();
        assert_eq!(err.to_string(), "wrong format at byte 3");
    }

    #[test]
    fn parse_rejects_a_missing_collection() {
        let err = parse(br#"[{"ids":[123]}]"#).unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert_eq!(err.to_string(), "no collection");
    }

    #[test]
    fn parse_accepts_plain_and_relation_fields() {
        let requests = parse(
            br#"[{
                "ids": [1, 2],
                "collection": "user",
                "fields": {
                    "name": null,
                    "group": {"type": "relation", "collection": "group", "fields": {"name": null}}
                }
            }]"#,
        )
        .unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ids, vec![1, 2]);
        assert_eq!(requests[0].collection.as_deref(), Some("user"));
        assert!(matches!(
            requests[0].fields.get("group"),
            Some(Some(Field::Relation { collection, .. })) if collection == "group"
        ));
        assert!(matches!(requests[0].fields.get("name"), Some(None)));
    }

    #[test]
    fn validate_keys_checks_the_key_form() {
        let ok = |keys: &[&str]| validate_keys(&keys.iter().map(|k| k.to_string()).collect::<Vec<_>>());
        assert!(ok(&["user/1/name", "user/2/name"]).is_ok());
        assert!(ok(&["key1"]).is_err());
        assert!(ok(&["user/0/name"]).is_err());
        assert!(ok(&["user/1/name/extra"]).is_err());
        assert!(ok(&[]).is_err());
    }

    fn datastore(upstream: &MemoryUpstream) -> Datastore {
        Datastore::new(
            Arc::new(upstream.clone()),
            upstream.changes(),
            Topic::default(),
            Arc::new(Metrics::default()),
        )
    }

    #[tokio::test]
    async fn expand_resolves_relations() {
        let upstream = MemoryUpstream::new();
        upstream.seed("user/1/group", "7");
        upstream.seed("group/7/name", r#""admins""#);
        let datastore = datastore(&upstream);

        let requests = parse(
            br#"[{
                "ids": [1],
                "collection": "user",
                "fields": {
                    "group": {"type": "relation", "collection": "group", "fields": {"name": null}}
                }
            }]"#,
        )
        .unwrap();

        let mut keys = expand(&requests, &datastore).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["group/7/name", "user/1/group"]);
    }

    #[tokio::test]
    async fn expand_follows_id_lists_and_missing_relations() {
        let upstream = MemoryUpstream::new();
        upstream.seed("user/1/groups", "[3, 4]");
        // user/2/groups does not exist and expands to nothing.
        let datastore = datastore(&upstream);

        let requests = parse(
            br#"[{
                "ids": [1, 2],
                "collection": "user",
                "fields": {
                    "groups": {"type": "relation", "collection": "group", "fields": {"name": null}}
                }
            }]"#,
        )
        .unwrap();

        let mut keys = expand(&requests, &datastore).await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["group/3/name", "group/4/name", "user/1/groups", "user/2/groups"]
        );
    }

    #[tokio::test]
    async fn expand_rejects_a_scalar_in_a_relation_field() {
        let upstream = MemoryUpstream::new();
        upstream.seed("foo/1/name", r#""Hello World""#);
        let datastore = datastore(&upstream);

        let requests = parse(
            br#"[{
                "ids": [1],
                "collection": "foo",
                "fields": {
                    "name": {"type": "relation", "collection": "bar", "fields": {}}
                }
            }]"#,
        )
        .unwrap();

        let err = expand(&requests, &datastore).await.unwrap_err();
        assert_eq!(err.kind(), "ValueError");
        assert_eq!(err.to_string(), "invalid value in key foo/1/name");
    }

    #[tokio::test]
    async fn expand_terminates_on_cyclic_relations() {
        let upstream = MemoryUpstream::new();
        upstream.seed("user/1/friend", "2");
        upstream.seed("user/2/friend", "1");
        let datastore = datastore(&upstream);

        // The relation is self-referential: user -> user -> user ...
        let body = br#"[{
            "ids": [1],
            "collection": "user",
            "fields": {
                "friend": {
                    "type": "relation",
                    "collection": "user",
                    "fields": {
                        "friend": {"type": "relation", "collection": "user", "fields": {}}
                    }
                }
            }
        }]"#;
        let requests = parse(body).unwrap();

        let mut keys = expand(&requests, &datastore).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user/1/friend", "user/2/friend"]);
    }
}
