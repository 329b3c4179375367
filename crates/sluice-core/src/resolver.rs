use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::config::ResolverMode;
use crate::data::SessionDataStore;
use crate::error::{Result, SluiceError};
use crate::types::SessionId;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z0-9_]+)*)\}").expect("valid placeholder regex")
    })
}

/// Walk a path such as `a.b.0`, `items[2].name` or `choices[0].message.content`.
///
/// Numeric segments index arrays. Returns `None` when any step is missing.
pub fn select_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for idx in indices.split('[').filter(|s| !s.is_empty()) {
            let idx = idx.strip_suffix(']')?.parse::<usize>().ok()?;
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// How a resolved value is written into the surrounding text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Substitution {
    /// The JSON serialization of the value; strings keep their quotes.
    #[default]
    Json,
    /// Strings inserted without quotes, other values as JSON.
    Inline,
}

impl Substitution {
    fn render(self, value: &Value) -> String {
        match (self, value) {
            (Self::Inline, Value::String(s)) => s.clone(),
            _ => value.to_string(),
        }
    }
}

/// True when `text` contains at least one `{key}` placeholder.
pub fn has_placeholder(text: &str) -> bool {
    placeholder_re().is_match(text)
}

/// Expands `{key}` and `{key.path}` placeholders against a session's data.
pub struct VariableResolver {
    store: Arc<SessionDataStore>,
    mode: ResolverMode,
}

impl VariableResolver {
    pub fn new(store: Arc<SessionDataStore>, mode: ResolverMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> ResolverMode {
        self.mode
    }

    /// Substitute each placeholder with the JSON serialization of its value.
    pub async fn resolve(&self, template: &str, session: &SessionId) -> Result<String> {
        self.render(template, session, &BTreeMap::new(), Substitution::Json).await
    }

    /// Like [`resolve`](Self::resolve) but string values go in without quotes.
    pub async fn resolve_inline(&self, template: &str, session: &SessionId) -> Result<String> {
        self.render(template, session, &BTreeMap::new(), Substitution::Inline).await
    }

    /// Resolve a template whose identifiers may be aliases for session keys.
    ///
    /// Identifiers found in `aliases` are looked up under the mapped key; all
    /// others are looked up directly.
    pub async fn resolve_with_aliases(
        &self,
        template: &str,
        session: &SessionId,
        aliases: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.render(template, session, aliases, Substitution::Json).await
    }

    async fn render(
        &self,
        template: &str,
        session: &SessionId,
        aliases: &BTreeMap<String, String>,
        style: Substitution,
    ) -> Result<String> {
        let values = self.lookup_all(template, session, aliases).await?;
        let re = placeholder_re();

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in re.captures_iter(template) {
            let (Some(whole), Some(ident)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let path = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            out.push_str(&template[last..whole.start()]);
            let resolved = values
                .get(ident.as_str())
                .and_then(|v| v.as_ref())
                .and_then(|v| select_path(v, path));
            match resolved {
                Some(v) => out.push_str(&style.render(v)),
                None if self.mode == ResolverMode::Strict => {
                    return Err(SluiceError::DataNotFound {
                        key: whole.as_str().trim_matches(|c| c == '{' || c == '}').to_string(),
                    });
                }
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Resolve every string inside a JSON value.
    ///
    /// A string that consists of exactly one placeholder is replaced by the
    /// referenced value itself, keeping its structure. Placeholders embedded in
    /// longer strings are substituted inline.
    pub fn resolve_value<'a>(&'a self, value: &'a Value, session: &'a SessionId) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match value {
                Value::String(s) => {
                    if let Some(v) = self.resolve_whole(s, session).await? {
                        return Ok(v);
                    }
                    Ok(Value::String(self.resolve_inline(s, session).await?))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_value(item, session).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.resolve_value(v, session).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }

    async fn resolve_whole(&self, s: &str, session: &SessionId) -> Result<Option<Value>> {
        let Some(caps) = placeholder_re().captures(s) else {
            return Ok(None);
        };
        let (Some(whole), Some(ident)) = (caps.get(0), caps.get(1)) else {
            return Ok(None);
        };
        if whole.start() != 0 || whole.end() != s.len() {
            return Ok(None);
        }
        let ident = ident.as_str().to_string();
        let path = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        let root = self.store.get(session, &ident).await?;
        Ok(root.as_ref().and_then(|v| select_path(v, &path)).cloned())
    }

    /// One store lookup per distinct identifier.
    async fn lookup_all(
        &self,
        template: &str,
        session: &SessionId,
        aliases: &BTreeMap<String, String>,
    ) -> Result<HashMap<String, Option<Value>>> {
        let mut idents: Vec<&str> = placeholder_re()
            .captures_iter(template)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        idents.dedup();

        let mut values = HashMap::new();
        for ident in idents {
            if values.contains_key(ident) {
                continue;
            }
            let key = aliases.get(ident).map(String::as_str).unwrap_or(ident);
            let value = self.store.get(session, key).await?;
            if value.is_none() {
                debug!(session_id = %session, key, "Placeholder has no session data");
            }
            values.insert(ident.to_string(), value);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::store;
    use serde_json::json;

    fn resolver(mode: ResolverMode) -> (Arc<SessionDataStore>, VariableResolver) {
        let store = Arc::new(store());
        (store.clone(), VariableResolver::new(store, mode))
    }

    #[test]
    fn test_select_path() {
        let v = json!({"choices": [{"message": {"content": "hi"}}], "n": [[1, 2], [3]]});
        assert_eq!(select_path(&v, "choices[0].message.content"), Some(&json!("hi")));
        assert_eq!(select_path(&v, "choices.0.message.content"), Some(&json!("hi")));
        assert_eq!(select_path(&v, "n[1][0]"), Some(&json!(3)));
        assert_eq!(select_path(&v, ""), Some(&v));
        assert_eq!(select_path(&v, "choices[5]"), None);
        assert_eq!(select_path(&v, "missing.deeper"), None);
    }

    #[tokio::test]
    async fn test_substitutes_written_key() {
        let (store, r) = resolver(ResolverMode::Permissive);
        let sid = SessionId::from_str("s1");
        store.put(&sid, "x", json!("world"), "n", None).await.unwrap();
        store.put(&sid, "cfg", json!({"limit": 5, "tags": ["a", "b"]}), "n", None).await.unwrap();

        let out = r.resolve("hello {x}, {x}!", &sid).await.unwrap();
        assert_eq!(out, "hello \"world\", \"world\"!");

        let out = r.resolve("LIMIT {cfg.limit} tag={cfg.tags.1} all={cfg.tags}", &sid).await.unwrap();
        assert_eq!(out, "LIMIT 5 tag=\"b\" all=[\"a\",\"b\"]");
    }

    #[tokio::test]
    async fn test_inline_substitution_leaves_strings_bare() {
        let (store, r) = resolver(ResolverMode::Permissive);
        let sid = SessionId::from_str("s1");
        store.put(&sid, "region", json!("eu west"), "n", None).await.unwrap();
        store.put(&sid, "page", json!(2), "n", None).await.unwrap();

        let out = r.resolve_inline("https://api/{region}?page={page}", &sid).await.unwrap();
        assert_eq!(out, "https://api/eu west?page=2");
        assert_eq!(r.resolve("{region}", &sid).await.unwrap(), "\"eu west\"");
    }

    #[test]
    fn test_has_placeholder() {
        assert!(has_placeholder("SELECT * FROM t WHERE id = {id}"));
        assert!(has_placeholder("{rows.0.name}"));
        assert!(!has_placeholder("SELECT '{\"a\": 1}' FROM t"));
        assert!(!has_placeholder("no braces {} here"));
    }

    #[tokio::test]
    async fn test_empty_store_leaves_placeholder() {
        let (_store, r) = resolver(ResolverMode::Permissive);
        let sid = SessionId::from_str("s1");
        assert_eq!(r.resolve("{x}", &sid).await.unwrap(), "{x}");
        assert_eq!(r.resolve("{x.y} and {}", &sid).await.unwrap(), "{x.y} and {}");
    }

    #[tokio::test]
    async fn test_strict_mode_fails_on_missing() {
        let (store, r) = resolver(ResolverMode::Strict);
        let sid = SessionId::from_str("s1");
        store.put(&sid, "obj", json!({"a": 1}), "n", None).await.unwrap();
        assert_eq!(r.resolve("{obj.a}", &sid).await.unwrap(), "1");

        let err = r.resolve("{obj.b}", &sid).await.unwrap_err();
        assert!(matches!(err, SluiceError::DataNotFound { key } if key == "obj.b"));
    }

    #[tokio::test]
    async fn test_aliases() {
        let (store, r) = resolver(ResolverMode::Permissive);
        let sid = SessionId::from_str("s1");
        store.put(&sid, "news_rows", json!([{"title": "t1"}]), "n", None).await.unwrap();
        let aliases = BTreeMap::from([("articles".to_string(), "news_rows".to_string())]);
        let out = r
            .resolve_with_aliases("First: {articles.0.title}", &sid, &aliases)
            .await
            .unwrap();
        assert_eq!(out, "First: \"t1\"");
    }

    #[tokio::test]
    async fn test_resolve_value_keeps_structure() {
        let (store, r) = resolver(ResolverMode::Permissive);
        let sid = SessionId::from_str("s1");
        store.put(&sid, "rows", json!([1, 2]), "n", None).await.unwrap();
        store.put(&sid, "name", json!("ada"), "n", None).await.unwrap();

        let body = json!({"items": "{rows}", "greeting": "hi {name}", "n": 3, "nested": ["{name}"]});
        let out = r.resolve_value(&body, &sid).await.unwrap();
        assert_eq!(out, json!({"items": [1, 2], "greeting": "hi ada", "n": 3, "nested": ["ada"]}));
    }
}
