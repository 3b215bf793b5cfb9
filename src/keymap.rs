use std::collections::HashMap;

/// Short query-string aliases for the canonical transformer parameter names.
///
/// Requests may use either form: `?resizeWidth=100` and `?rw=100` are
/// equivalent. Lookups always try the canonical name first.
#[derive(Clone, Debug)]
pub struct KeyMap {
    aliases: HashMap<String, String>,
}

const BUILTIN: &[(&str, &str)] = &[
    ("blurRadius", "br"),
    ("blurSigma", "bs"),
    ("cropWidth", "cw"),
    ("cropHeight", "ch"),
    ("cropStartX", "cx"),
    ("cropStartY", "cy"),
    ("noCache", "nocache"),
    ("rotateDegrees", "rd"),
    ("resizeHeight", "rh"),
    ("resizeWidth", "rw"),
    ("quality", "q"),
];

impl Default for KeyMap {
    fn default() -> Self {
        KeyMap {
            aliases: BUILTIN
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl KeyMap {
    /// Merge custom aliases over the builtin table. Caller-supplied pairs win
    /// on collision; builtins that are not overridden survive.
    pub fn extend<I, K, V>(mut self, custom: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, alias) in custom {
            self.aliases.insert(key.into(), alias.into());
        }
        self
    }

    /// Short alias registered for a canonical parameter name, if any.
    pub fn alias(&self, canonical: &str) -> Option<&str> {
        self.aliases.get(canonical).map(String::as_str)
    }
}
