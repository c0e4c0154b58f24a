//! Path Tree Dictionary
//!
//! Segment-indexed trie used for handler routing, realm lookup and path
//! aliases. Patterns are split on `/` or `\`; lookup walks the request path
//! one segment at a time and remembers the last node that carries a value.
//! The character offset of that match splits the path into the matched
//! prefix (servlet path) and the remainder (path info).

use std::collections::HashMap;

/// A node in the path tree
#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    children: HashMap<String, Node<V>>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }
}

/// Longest-prefix dictionary keyed by path segments
#[derive(Debug)]
pub struct PathTreeDictionary<V> {
    root: Node<V>,
    len: usize,
}

/// Result of a successful lookup
#[derive(Debug, PartialEq, Eq)]
pub struct PathMatch<'a, V> {
    /// Value bound to the longest registered prefix
    pub value: &'a V,
    /// Byte offset in the looked-up path where the match ends
    pub offset: usize,
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Iterate the non-empty segments of `path` with the byte offset each one ends at
fn segments(path: &str) -> impl Iterator<Item = (&str, usize)> {
    let mut start = 0;
    let mut parts = Vec::new();
    for (idx, c) in path.char_indices() {
        if is_separator(c) {
            if idx > start {
                parts.push((&path[start..idx], idx));
            }
            start = idx + c.len_utf8();
        }
    }
    if start < path.len() {
        parts.push((&path[start..], path.len()));
    }
    parts.into_iter()
}

impl<V> PathTreeDictionary<V> {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Bind `value` to `pattern`, returning the value it replaces
    pub fn insert(&mut self, pattern: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        for (segment, _) in segments(pattern) {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(Node::new);
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Find the value registered for the longest prefix of `path`
    pub fn lookup(&self, path: &str) -> Option<PathMatch<'_, V>> {
        let mut best = self.root.value.as_ref().map(|value| PathMatch { value, offset: 0 });
        let mut node = &self.root;

        for (segment, end) in segments(path) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if let Some(value) = node.value.as_ref() {
                        best = Some(PathMatch { value, offset: end });
                    }
                }
                None => break,
            }
        }

        best
    }

    /// Value bound to exactly `pattern`
    pub fn get(&self, pattern: &str) -> Option<&V> {
        let mut node = &self.root;
        for (segment, _) in segments(pattern) {
            node = node.children.get(segment)?;
        }
        node.value.as_ref()
    }

    /// Number of bound patterns
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if nothing is bound
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<V> Default for PathTreeDictionary<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `path` at a match offset into (servlet path, path info)
pub fn split_at_match(path: &str, offset: usize) -> (&str, Option<&str>) {
    let (matched, rest) = path.split_at(offset.min(path.len()));
    if rest.is_empty() {
        (matched, None)
    } else {
        (matched, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(patterns: &[&'static str]) -> PathTreeDictionary<&'static str> {
        let mut dict = PathTreeDictionary::new();
        for pattern in patterns {
            dict.insert(pattern, *pattern);
        }
        dict
    }

    #[test]
    fn test_longest_prefix_wins() {
        let dict = dict(&["/", "/api", "/api/users"]);

        let m = dict.lookup("/api/users/42").unwrap();
        assert_eq!(*m.value, "/api/users");
        assert_eq!(m.offset, "/api/users".len());

        let m = dict.lookup("/api/orders").unwrap();
        assert_eq!(*m.value, "/api");
        assert_eq!(m.offset, 4);

        let m = dict.lookup("/other").unwrap();
        assert_eq!(*m.value, "/");
        assert_eq!(m.offset, 0);
    }

    #[test]
    fn test_root_guarantees_match() {
        let dict = dict(&["/"]);
        for path in ["", "/", "/a", "/a/b/c", "\\win\\path"] {
            assert!(dict.lookup(path).is_some(), "no match for {path:?}");
        }
    }

    #[test]
    fn test_no_root_can_miss() {
        let dict = dict(&["/admin"]);
        assert!(dict.lookup("/public").is_none());
        assert!(dict.lookup("/").is_none());
    }

    #[test]
    fn test_segment_boundaries_respected() {
        let dict = dict(&["/admin"]);
        assert!(dict.lookup("/administrator").is_none());
        assert_eq!(*dict.lookup("/admin/").unwrap().value, "/admin");
    }

    #[test]
    fn test_intermediate_nodes_do_not_match() {
        let dict = dict(&["/", "/a/b/c"]);
        let m = dict.lookup("/a/b/x").unwrap();
        assert_eq!(*m.value, "/");
        assert_eq!(m.offset, 0);
    }

    #[test]
    fn test_backslash_separators() {
        let dict = dict(&["\\cgi-bin"]);
        let m = dict.lookup("/cgi-bin/script").unwrap();
        assert_eq!(*m.value, "\\cgi-bin");
        assert_eq!(m.offset, 8);
    }

    #[test]
    fn test_insert_replaces() {
        let mut dict = PathTreeDictionary::new();
        assert!(dict.insert("/x", 1).is_none());
        assert_eq!(dict.insert("/x", 2), Some(1));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("/x"), Some(&2));
        assert_eq!(dict.get("/y"), None);
    }

    #[test]
    fn test_split_at_match() {
        assert_eq!(split_at_match("/api/users/42", 10), ("/api/users", Some("/42")));
        assert_eq!(split_at_match("/api", 4), ("/api", None));
        assert_eq!(split_at_match("/x", 0), ("", Some("/x")));
    }

    #[test]
    fn test_longest_prefix_over_many_patterns() {
        let patterns = ["/", "/a", "/a/b", "/a/b/c/d", "/b", "/b/c"];
        let dict = dict(&patterns);
        let paths = ["/a/b/c", "/a/b/c/d/e", "/b/c/d", "/c", "/a", "/b/x"];

        for path in paths {
            let expected = patterns
                .iter()
                .filter(|p| {
                    let p = p.trim_end_matches('/');
                    path == p || path.starts_with(&format!("{p}/"))
                })
                .max_by_key(|p| p.len())
                .unwrap();
            assert_eq!(dict.lookup(path).unwrap().value, expected, "path {path}");
        }
    }
}
