use std::{
    collections::{BTreeMap, HashMap},
    env,
    sync::LazyLock,
};

use regex::{Captures, Regex};

static BRACED_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced variable pattern is valid")
});
static SIMPLE_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("simple variable pattern is valid")
});

/// Lookup table used when expanding task commands.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    /// User variables layered over `ENV_<KEY>` and `PWD`. User values win.
    pub fn with_builtins(user: &BTreeMap<String, String>) -> Self {
        let mut values = HashMap::new();

        for (key, value) in env::vars() {
            values.insert(format!("ENV_{}", key), value);
        }

        if let Ok(pwd) = env::current_dir() {
            values.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
        }

        for (key, value) in user {
            values.insert(key.clone(), value.clone());
        }

        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Expands `${NAME}` then `$NAME`. Unknown names are left as written.
pub fn substitute_variables(text: &str, variables: &Variables) -> String {
    let braced = BRACED_VARIABLE.replace_all(text, |caps: &Captures| lookup(caps, variables));
    SIMPLE_VARIABLE
        .replace_all(&braced, |caps: &Captures| lookup(caps, variables))
        .into_owned()
}

fn lookup(caps: &Captures, variables: &Variables) -> String {
    variables
        .get(&caps[1])
        .map(str::to_string)
        .unwrap_or_else(|| caps[0].to_string())
}
