//! Path aliases
//!
//! Maps URL prefixes to filesystem directories so handlers can translate a
//! request path into a real file path.

use crate::config::read_toml;
use crate::error::RuntimeResult;
use crate::router::PathTreeDictionary;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: PathTreeDictionary<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct AliasesFile {
    #[serde(default)]
    aliases: BTreeMap<String, PathBuf>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prefix: &str, dir: impl Into<PathBuf>) {
        self.aliases.insert(prefix, dir.into());
    }

    /// Load an `[aliases]` table mapping URL prefixes to directories
    pub fn load(path: &Path) -> RuntimeResult<Self> {
        let file: AliasesFile = read_toml(path)?;
        let mut table = Self::new();
        for (prefix, dir) in file.aliases {
            table.add(&prefix, dir);
        }
        debug!(aliases = table.len(), path = %path.display(), "Loaded aliases");
        Ok(table)
    }

    /// Filesystem path for `url_path`, or `None` if no alias covers it
    ///
    /// Parent-directory segments are dropped so the result stays under
    /// the alias directory.
    pub fn translate(&self, url_path: &str) -> Option<PathBuf> {
        let matched = self.aliases.lookup(url_path)?;
        let mut real = matched.value.clone();
        for segment in url_path[matched.offset..].split(['/', '\\']) {
            match segment {
                "" | "." | ".." => {}
                segment => real.push(segment),
            }
        }
        Some(real)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_translate() {
        let mut table = AliasTable::new();
        table.add("/docs", "/srv/docs");
        table.add("/", "/srv/www");

        assert_eq!(
            table.translate("/docs/guide/index.html"),
            Some(PathBuf::from("/srv/docs/guide/index.html"))
        );
        assert_eq!(table.translate("/logo.png"), Some(PathBuf::from("/srv/www/logo.png")));
        assert_eq!(
            table.translate("/docs/../../etc/passwd"),
            Some(PathBuf::from("/srv/docs/etc/passwd"))
        );
    }

    #[test]
    fn test_uncovered_path() {
        let mut table = AliasTable::new();
        table.add("/docs", "/srv/docs");
        assert_eq!(table.translate("/images/a.png"), None);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aliases]\n\"/files\" = \"/data/files\"").unwrap();
        let table = AliasTable::load(file.path()).unwrap();
        assert_eq!(
            table.translate("/files/a.txt"),
            Some(PathBuf::from("/data/files/a.txt"))
        );
    }
}
