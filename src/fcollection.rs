//! A collection of named functions, with optional categories.
//!
//! Registration is explicit: built-ins and user extensions alike are
//! handed over as `(name, value)` pairs. A filter regex can be set to
//! accept the conventional prefixed names (`fixer_NAME`,
//! `file_NAME`, ...) during bulk loading; the named capture groups
//! `name` (and `category`, when the collection is categorized) yield
//! the registration key.

use std::collections::BTreeMap;

use regex::Regex;

#[derive(thiserror::Error, Debug)]
pub enum FCollectionError {
    #[error("unknown category {0:?}")]
    CategoryNotFound(String),

    #[error("no function named {0:?}")]
    FunctionNotFound(String),

    #[error("filter regex {0:?} does not define the required named groups")]
    InvalidFilterRegex(String),
}

/// Key of the single pseudo-category used when the collection is not
/// categorized.
const FLAT: &str = "";

pub struct FCollection<V> {
    use_categories: bool,
    lists: BTreeMap<String, BTreeMap<String, V>>,
    filter_regex: Option<Regex>,
}

impl<V> FCollection<V> {
    pub fn new() -> Self {
        let mut lists = BTreeMap::new();
        lists.insert(FLAT.to_owned(), BTreeMap::new());
        Self {
            use_categories: false,
            lists,
            filter_regex: None,
        }
    }

    pub fn with_categories<S: Into<String>>(categories: impl IntoIterator<Item = S>) -> Self {
        let lists: BTreeMap<String, BTreeMap<String, V>> = categories
            .into_iter()
            .map(|c| (c.into(), BTreeMap::new()))
            .collect();
        assert!(!lists.is_empty(), "at least one category is required");
        Self {
            use_categories: true,
            lists,
            filter_regex: None,
        }
    }

    /// The regex must define a capture group named `name` matching
    /// the registration key, and, if the collection is categorized,
    /// one named `category`.
    pub fn set_filter_regex(&mut self, filter_regex: &str) -> Result<(), FCollectionError> {
        let invalid = || FCollectionError::InvalidFilterRegex(filter_regex.to_owned());
        let regex = Regex::new(filter_regex).map_err(|_| invalid())?;
        let groups: Vec<&str> = regex.capture_names().flatten().collect();
        if !groups.contains(&"name") || (self.use_categories && !groups.contains(&"category")) {
            return Err(invalid());
        }
        self.filter_regex = Some(regex);
        Ok(())
    }

    fn list_mut(
        &mut self,
        category: Option<&str>,
    ) -> Result<&mut BTreeMap<String, V>, FCollectionError> {
        let key = if self.use_categories {
            category.unwrap_or(FLAT)
        } else {
            FLAT
        };
        self.lists
            .get_mut(key)
            .ok_or_else(|| FCollectionError::CategoryNotFound(key.to_owned()))
    }

    fn list(&self, category: Option<&str>) -> Result<&BTreeMap<String, V>, FCollectionError> {
        let key = if self.use_categories {
            category.unwrap_or(FLAT)
        } else {
            FLAT
        };
        self.lists
            .get(key)
            .ok_or_else(|| FCollectionError::CategoryNotFound(key.to_owned()))
    }

    /// Add a function, or replace an existing one.
    pub fn set(
        &mut self,
        fname: impl Into<String>,
        f: V,
        category: Option<&str>,
    ) -> Result<(), FCollectionError> {
        self.list_mut(category)?.insert(fname.into(), f);
        Ok(())
    }

    pub fn delete(&mut self, fname: &str, category: Option<&str>) -> Result<(), FCollectionError> {
        self.list_mut(category)?
            .remove(fname)
            .map(|_| ())
            .ok_or_else(|| FCollectionError::FunctionNotFound(fname.to_owned()))
    }

    pub fn get(&self, fname: &str, category: Option<&str>) -> Result<&V, FCollectionError> {
        self.list(category)?
            .get(fname)
            .ok_or_else(|| FCollectionError::FunctionNotFound(fname.to_owned()))
    }

    pub fn contains(&self, fname: &str, category: Option<&str>) -> bool {
        self.get(fname, category).is_ok()
    }

    /// All functions of a category, in name order.
    pub fn get_all(&self, category: Option<&str>) -> Result<Vec<&V>, FCollectionError> {
        Ok(self.list(category)?.values().collect())
    }

    /// Register every entry whose declared name matches the filter
    /// regex; names that do not match are ignored (a module may
    /// export helpers that are not collection functions).
    pub fn load_entries<S: AsRef<str>>(
        &mut self,
        entries: impl IntoIterator<Item = (S, V)>,
    ) -> Result<(), FCollectionError> {
        let regex = self
            .filter_regex
            .clone()
            .ok_or_else(|| FCollectionError::InvalidFilterRegex(String::new()))?;
        for (declared, f) in entries {
            if let Some(captures) = regex.captures(declared.as_ref()) {
                let name = captures
                    .name("name")
                    .expect("checked in set_filter_regex")
                    .as_str()
                    .to_owned();
                let category = if self.use_categories {
                    captures.name("category").map(|m| m.as_str().to_owned())
                } else {
                    None
                };
                self.set(name, f, category.as_deref())?;
            }
        }
        Ok(())
    }
}

impl<V> Default for FCollection<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_flat_collection() {
        let mut c: FCollection<u32> = FCollection::new();
        c.set("a", 1, None).unwrap();
        c.set("b", 2, None).unwrap();
        assert_eq!(*c.get("a", None).unwrap(), 1);
        assert!(matches!(
            c.get("z", None),
            Err(FCollectionError::FunctionNotFound(_))
        ));
        c.delete("a", None).unwrap();
        assert!(c.get("a", None).is_err());
    }

    #[test]
    fn t_categories() {
        let mut c: FCollection<u32> = FCollection::with_categories(["file", "folder"]);
        c.set("exists", 1, Some("file")).unwrap();
        assert!(c.contains("exists", Some("file")));
        assert!(!c.contains("exists", Some("folder")));
        assert!(matches!(
            c.set("x", 9, Some("global")),
            Err(FCollectionError::CategoryNotFound(_))
        ));
    }

    #[test]
    fn t_filter_regex_loading() {
        let mut c: FCollection<u32> = FCollection::new();
        c.set_filter_regex(r"^fixer_(?P<name>[A-Za-z0-9_]+)$").unwrap();
        c.load_entries([("fixer_intFloats", 1), ("helper", 2)])
            .unwrap();
        assert!(c.contains("intFloats", None));
        assert!(!c.contains("helper", None));
    }

    #[test]
    fn t_filter_regex_requires_groups() {
        let mut c: FCollection<u32> = FCollection::with_categories(["file"]);
        assert!(matches!(
            c.set_filter_regex(r"^(?P<name>.+)$"),
            Err(FCollectionError::InvalidFilterRegex(_))
        ));
        c.set_filter_regex(r"^(?P<category>file)_(?P<name>.+)$")
            .unwrap();
    }
}
