//! HTTP Basic authentication realms
//!
//! Realms are keyed by the path prefix they protect, in the same
//! [`PathTreeDictionary`] the router uses. The table is built before the
//! listener starts and only read afterwards.

use crate::config::read_toml;
use crate::error::{RuntimeError, RuntimeResult};
use crate::router::PathTreeDictionary;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Auth type recorded for requests authenticated by a realm
pub const BASIC_AUTH: &str = "Basic";

/// A named set of username/password credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    name: String,
    users: HashMap<String, String>,
}

impl Realm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.add_user(username, password);
        self
    }

    pub fn add_user(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compare a username/password pair against the stored credentials
    pub fn check(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    /// Validate an `Authorization` header value, returning the username
    pub fn authenticate(&self, authorization: Option<&str>) -> Option<String> {
        let (username, password) = parse_basic_credentials(authorization?)?;
        if self.check(&username, &password) {
            Some(username)
        } else {
            debug!(realm = %self.name, user = %username, "Credentials rejected");
            None
        }
    }

    /// Value of the `WWW-Authenticate` challenge header
    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.name)
    }
}

/// Decode `Basic base64(user:password)`, splitting on the first colon
pub fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let header = header.trim();
    let (scheme, encoded) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(BASIC_AUTH) {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Realms keyed by the path prefixes they protect
#[derive(Debug, Default)]
pub struct RealmTable {
    realms: PathTreeDictionary<Arc<Realm>>,
}

#[derive(Debug, Deserialize)]
struct RealmsFile {
    #[serde(default)]
    realm: Vec<RealmEntry>,
}

#[derive(Debug, Deserialize)]
struct RealmEntry {
    name: String,
    paths: Vec<String>,
    #[serde(default)]
    users: HashMap<String, String>,
}

impl RealmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `path` and everything under it with `realm`
    pub fn protect(&mut self, path: &str, realm: Arc<Realm>) {
        self.realms.insert(path, realm);
    }

    /// Realm guarding `path`, if any
    pub fn find(&self, path: &str) -> Option<&Realm> {
        self.realms.lookup(path).map(|m| m.value.as_ref())
    }

    /// Load realms from a TOML file of `[[realm]]` tables
    pub fn load(path: &Path) -> RuntimeResult<Self> {
        let file: RealmsFile = read_toml(path)?;
        let mut table = Self::new();
        for entry in file.realm {
            if entry.paths.is_empty() {
                return Err(RuntimeError::config(format!(
                    "realm {} protects no paths",
                    entry.name
                )));
            }
            let realm = Arc::new(Realm {
                name: entry.name,
                users: entry.users,
            });
            for protected in &entry.paths {
                table.protect(protected, Arc::clone(&realm));
            }
        }
        debug!(paths = table.len(), path = %path.display(), "Loaded realms");
        Ok(table)
    }

    /// Number of protected path prefixes
    pub fn len(&self) -> usize {
        self.realms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }
}
