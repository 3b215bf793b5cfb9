use std::str::FromStr;

use url::form_urlencoded;

use crate::keymap::KeyMap;

/// Parsed query string, preserving repeated keys in request order.
///
/// actix's query extractors flatten repeated keys, but transform order is
/// carried by repeated `fn` parameters, so the raw pair list is kept.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn parse(query_string: &str) -> Self {
        Query {
            pairs: form_urlencoded::parse(query_string.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    /// First value bound under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values bound under `key`, in request order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Look up a parameter by canonical name, falling back to its short alias.
/// Returns `None` when neither is bound; never errors.
pub fn get_param<'a>(query: &'a Query, keymap: &KeyMap, name: &str) -> Option<&'a str> {
    query
        .get(name)
        .or_else(|| keymap.alias(name).and_then(|alias| query.get(alias)))
}

pub fn parse_param<T: FromStr>(s: Option<&str>, default: T) -> T {
    s.and_then(|p| p.parse::<T>().ok()).unwrap_or(default)
}

/// Per-request view of the query string plus the effective keymap, handed to
/// every transformer.
#[derive(Clone, Debug)]
pub struct TransformArgs {
    pub query: Query,
    pub keymap: KeyMap,
}

impl TransformArgs {
    pub fn new(query: Query, keymap: KeyMap) -> Self {
        TransformArgs { query, keymap }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        get_param(&self.query, &self.keymap, name)
    }

    pub fn param<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn param_or<T: FromStr>(&self, name: &str, default: T) -> T {
        parse_param(self.get(name), default)
    }

    /// Boolean-ish switch: present and not literally "false".
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(v) if v != "false")
    }
}

/// Serialize transformation parameters into the query-string form the routes
/// consume. The front-end counterpart of the parameter resolver.
///
/// ```
/// use actix_images::asset_url;
///
/// let url = asset_url("/images/cat.png", [("fn", "resize"), ("rw", "100")]);
/// assert_eq!(url, "/images/cat.png?fn=resize&rw=100");
/// ```
pub fn asset_url<'a, I>(path: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    let qs = serializer.finish();

    if qs.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{qs}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_alias_resolves() {
        let query = Query::parse("rw=50");
        let km = KeyMap::default();
        assert_eq!(get_param(&query, &km, "resizeWidth"), Some("50"));
    }

    #[test]
    fn canonical_name_wins_over_alias() {
        let query = Query::parse("resizeWidth=50&rw=99");
        let km = KeyMap::default();
        assert_eq!(get_param(&query, &km, "resizeWidth"), Some("50"));
    }

    #[test]
    fn absent_param_is_none() {
        let query = Query::parse("rw=50");
        let km = KeyMap::default();
        assert_eq!(get_param(&query, &km, "rotateDegrees"), None);
    }

    #[test]
    fn repeated_keys_keep_order() {
        let query = Query::parse("fn=resize&rw=10&fn=rotate");
        let fns: Vec<&str> = query.get_all("fn").collect();
        assert_eq!(fns, vec!["resize", "rotate"]);
    }

    #[test]
    fn percent_decoding_applies() {
        let query = Query::parse("fn=resize&name=a%20b");
        assert_eq!(query.get("name"), Some("a b"));
    }

    #[test]
    fn parse_param_falls_back_on_garbage() {
        assert_eq!(parse_param::<u32>(Some("12"), 5), 12);
        assert_eq!(parse_param::<u32>(Some("twelve"), 5), 5);
        assert_eq!(parse_param::<u32>(None, 5), 5);
    }

    #[test]
    fn flag_semantics() {
        let args = TransformArgs::new(Query::parse("nocache=1"), KeyMap::default());
        assert!(args.flag("noCache"));
        let args = TransformArgs::new(Query::parse("nocache=false"), KeyMap::default());
        assert!(!args.flag("noCache"));
        let args = TransformArgs::new(Query::parse(""), KeyMap::default());
        assert!(!args.flag("noCache"));
    }

    #[test]
    fn asset_url_without_params_is_the_path() {
        assert_eq!(asset_url("/images/cat.png", []), "/images/cat.png");
    }

    #[test]
    fn asset_url_encodes_values() {
        let url = asset_url("/images/cat.png", [("fn", "rotate"), ("rd", "-45")]);
        assert_eq!(url, "/images/cat.png?fn=rotate&rd=-45");
    }
}
