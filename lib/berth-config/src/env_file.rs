use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use berth_error::generic_error;
use indexmap::IndexMap;
use tracing::debug;

use crate::ConfigurationError;

/// A named set of `KEY=VALUE` pairs shared by every service that references it.
///
/// Sources are loaded once per activation and handed out behind an `Arc`, so every service that references a source
/// sees exactly the same values. Keys keep the order in which they appear in the file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigurationSource {
    name: String,
    path: PathBuf,
    values: Arc<IndexMap<String, String>>,
}

impl ConfigurationSource {
    /// Loads a configuration source from a flat `KEY=VALUE` file.
    ///
    /// Blank lines, `#` comments, quoted values, and `export` prefixes are accepted. `$VAR` and `${VAR}` references
    /// outside single quotes are expanded against earlier keys in the same file, and only those: the environment of
    /// the calling process is never consulted.
    ///
    /// # Errors
    ///
    /// If the file does not exist, cannot be read, contains a line that is not a valid assignment, or references a key
    /// not defined earlier in the file, an error will be returned.
    pub fn load<N, P>(name: N, path: P) -> Result<Self, ConfigurationError>
    where
        N: Into<String>,
        P: AsRef<Path>,
    {
        let name = name.into();
        let path = path.as_ref().to_path_buf();

        if !path.is_file() {
            return Err(ConfigurationError::MissingSource { name, path });
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigurationError::Unreadable {
            name: name.clone(),
            path: path.clone(),
            source,
        })?;
        let marked = mark_expansions(&contents);

        let mut values = IndexMap::new();
        for entry in dotenvy::from_read_iter(marked.as_bytes()) {
            let (key, value) = entry.map_err(|e| map_dotenv_error(&name, &path, e))?;
            let value = expand(&value, &values).map_err(|reference| ConfigurationError::UndefinedReference {
                name: name.clone(),
                path: path.clone(),
                key: key.clone(),
                reference,
            })?;
            values.insert(key, value);
        }

        debug!(source = %name, path = %path.display(), keys = values.len(), "Loaded configuration source.");

        Ok(Self {
            name,
            path,
            values: Arc::new(values),
        })
    }

    /// Creates a configuration source from in-memory pairs.
    pub fn from_pairs<N, I, K, V>(name: N, pairs: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            path: PathBuf::new(),
            values: Arc::new(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    /// Name of the source, as referenced by services.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the source was loaded from, or an empty path for in-memory sources.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterates over all key/value pairs in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the source has no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds the environment for `service`: every key of this source, followed by the service's own extra keys.
    ///
    /// # Errors
    ///
    /// If any extra key is already provided by this source, an error will be returned. Services sharing a source must
    /// never observe different values for the same key.
    pub fn compose(
        &self, service: &str, extra: &IndexMap<String, String>,
    ) -> Result<IndexMap<String, String>, ConfigurationError> {
        let mut composed = (*self.values).clone();
        for (key, value) in extra {
            if composed.contains_key(key) {
                return Err(ConfigurationError::ConflictingKey {
                    service: service.to_string(),
                    key: key.clone(),
                    source_name: self.name.clone(),
                });
            }
            composed.insert(key.clone(), value.clone());
        }
        Ok(composed)
    }
}

/// Stands in for every `$` dotenvy would otherwise expand, since dotenvy resolves references against the process
/// environment before the file itself.
const EXPANSION_MARKER: char = '\u{E000}';

/// Replaces each unescaped `$` outside single quotes and comments with [`EXPANSION_MARKER`].
fn mark_expansions(contents: &str) -> String {
    let mut marked = String::with_capacity(contents.len());
    let mut chars = contents.chars();
    let (mut single, mut double, mut comment) = (false, false, false);
    let mut after_space = true;

    while let Some(c) = chars.next() {
        if comment {
            comment = c != '\n';
            marked.push(c);
            after_space = true;
            continue;
        }

        match c {
            '\\' if !single => {
                marked.push(c);
                if let Some(escaped) = chars.next() {
                    marked.push(escaped);
                }
                after_space = false;
                continue;
            }
            '$' if !single => {
                marked.push(EXPANSION_MARKER);
                after_space = false;
                continue;
            }
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '#' if !single && !double && after_space => comment = true,
            _ => {}
        }

        marked.push(c);
        after_space = c.is_whitespace();
    }

    marked
}

/// Expands marked references in `value` against `resolved`, returning the name of the first undefined reference.
fn expand(value: &str, resolved: &IndexMap<String, String>) -> Result<String, String> {
    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(idx) = rest.find(EXPANSION_MARKER) {
        expanded.push_str(&rest[..idx]);
        rest = &rest[idx + EXPANSION_MARKER.len_utf8()..];

        let (reference, remainder) = match rest.strip_prefix('{') {
            Some(block) => match block.find('}') {
                Some(end) => (&block[..end], &block[end + 1..]),
                None => ("", rest),
            },
            None => {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                (&rest[..end], &rest[end..])
            }
        };

        // A `$` that doesn't start a reference is kept as is.
        if reference.is_empty() {
            expanded.push('$');
            continue;
        }

        match resolved.get(reference) {
            Some(resolved_value) => expanded.push_str(resolved_value),
            None => return Err(reference.to_string()),
        }
        rest = remainder;
    }

    expanded.push_str(rest);
    Ok(expanded)
}

fn map_dotenv_error(name: &str, path: &Path, e: dotenvy::Error) -> ConfigurationError {
    if let dotenvy::Error::LineParse(line, _) = &e {
        return ConfigurationError::Malformed {
            name: name.to_string(),
            path: path.to_path_buf(),
            line: line.replace(EXPANSION_MARKER, "$"),
        };
    }

    if let dotenvy::Error::Io(io) = e {
        return ConfigurationError::Unreadable {
            name: name.to_string(),
            path: path.to_path_buf(),
            source: io,
        };
    }

    ConfigurationError::Generic {
        source: generic_error!("failed to parse '{}': {}", path.display(), e),
    }
}
