//! Parsing of `android-info.txt` style requirement manifests.
//!
//! A manifest is a list of `key=value|value` lines, optionally prefixed with
//! `require ` or scoped to one product with `require-for-product:<product> `.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use zip::ZipArchive;

pub const ANDROID_INFO_FILE_NAME: &str = "android-info.txt";
pub const BOOTLOADER_VERSION_KEY: &str = "version-bootloader";
pub const BASEBAND_VERSION_KEY: &str = "version-baseband";
pub const BOARD_KEY: &str = "board";
pub const PRODUCT_KEY: &str = "product";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequirementError {
    #[error("failed to read requirements from {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("{archive} does not contain {}", ANDROID_INFO_FILE_NAME)]
    MissingManifest { archive: String },

    #[error("malformed requirement on line {line}: '{text}'")]
    Malformed { line: usize, text: String },

    #[error("requirement manifest contains no requirements")]
    Empty,
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-key filters applied while parsing. Rejected values are dropped.
#[derive(Default)]
pub struct Constraints {
    predicates: HashMap<String, Predicate>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.insert(key.into(), Box::new(predicate));
        self
    }

    fn accepts(&self, key: &str, value: &str) -> bool {
        self.predicates
            .get(key)
            .map_or(true, |predicate| predicate(value))
    }
}

/// Requirements keyed by product scope (`None` is the global scope).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementMap {
    scopes: HashMap<Option<String>, HashMap<String, Vec<String>>>,
}

impl RequirementMap {
    /// Acceptable values for `key`, looking in the product scope first and
    /// falling back to the global scope.
    pub fn values(&self, key: &str, product: Option<&str>) -> Option<&[String]> {
        if let Some(product) = product {
            let scoped = self
                .scopes
                .get(&Some(product.to_string()))
                .and_then(|entries| entries.get(key));
            if let Some(values) = scoped {
                return Some(values.as_slice());
            }
        }
        self.scopes
            .get(&None)
            .and_then(|entries| entries.get(key))
            .map(|values| values.as_slice())
    }

    /// Newest acceptable value for `key`.
    ///
    /// "Newest" is the lexicographically greatest string, so `1.2.0` sorts after
    /// `1.10.0`. Callers rely on this ordering; it is not a semantic version compare.
    pub fn required_version(&self, key: &str, product: Option<&str>) -> Option<&str> {
        self.values(key, product)?
            .iter()
            .max()
            .map(|value| value.as_str())
    }

    pub fn required_bootloader_version(&self, product: Option<&str>) -> Option<&str> {
        self.required_version(BOOTLOADER_VERSION_KEY, product)
    }

    pub fn required_baseband_version(&self, product: Option<&str>) -> Option<&str> {
        self.required_version(BASEBAND_VERSION_KEY, product)
    }

    /// Global `board` values, else global `product` values. `None` means unconstrained.
    pub fn required_boards(&self) -> Option<&[String]> {
        let global = self.scopes.get(&None)?;
        global
            .get(BOARD_KEY)
            .or_else(|| global.get(PRODUCT_KEY))
            .map(|values| values.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.values().all(|entries| entries.is_empty())
    }

    /// A key whose values were all rejected is left absent so lookups fall back.
    fn insert(&mut self, product: Option<String>, key: String, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        self.scopes
            .entry(product)
            .or_default()
            .entry(key)
            .or_default()
            .extend(values);
    }
}

fn product_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^require-for-product:(\S+)\s+(.*?)=(.*)$").expect("valid product regex")
    })
}

fn plain_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:require\s+)?(.*?)=(.*)$").expect("valid plain regex"))
}

pub fn resolve(text: &str, constraints: &Constraints) -> Result<RequirementMap, RequirementError> {
    let mut map = RequirementMap::default();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (product, key, values) = if let Some(caps) = product_line_re().captures(line) {
            (Some(caps[1].to_string()), caps[2].trim().to_string(), caps[3].to_string())
        } else if let Some(caps) = plain_line_re().captures(line) {
            (None, caps[1].trim().to_string(), caps[2].to_string())
        } else {
            continue;
        };
        if key.is_empty() {
            return Err(RequirementError::Malformed {
                line: index + 1,
                text: line.to_string(),
            });
        }
        let accepted = values
            .split('|')
            .map(|value| value.trim().to_string())
            .filter(|value| constraints.accepts(&key, value))
            .collect::<Vec<_>>();
        map.insert(product, key, accepted);
    }
    if map.is_empty() {
        return Err(RequirementError::Empty);
    }
    Ok(map)
}

pub fn resolve_file(path: &Path, constraints: &Constraints) -> Result<RequirementMap, RequirementError> {
    let text = std::fs::read_to_string(path).map_err(|err| RequirementError::Unreadable {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    resolve(&text, constraints)
}

/// Reads the manifest out of a device image archive.
pub fn resolve_archive(
    archive_path: &Path,
    constraints: &Constraints,
) -> Result<RequirementMap, RequirementError> {
    let unreadable = |reason: String| RequirementError::Unreadable {
        path: archive_path.display().to_string(),
        reason,
    };
    let file = File::open(archive_path).map_err(|err| unreadable(err.to_string()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| unreadable(err.to_string()))?;
    let mut entry = match archive.by_name(ANDROID_INFO_FILE_NAME) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(RequirementError::MissingManifest {
                archive: archive_path.display().to_string(),
            })
        }
        Err(err) => return Err(unreadable(err.to_string())),
    };
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|err| unreadable(err.to_string()))?;
    resolve(&text, constraints)
}
