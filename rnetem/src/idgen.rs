//! Short-id allocation for nodes and bridges.
//!
//! Generated kernel-interface names embed a short per-project id instead of
//! the full node name: interface names are capped at 15 characters and the
//! id keeps them readable. Ids are unique within a project; uniqueness
//! across projects comes from the project id also embedded in every name.

use std::collections::HashSet;
use std::sync::Mutex;

/// Derive the short form of a name: the two characters at `[len-3, len-1)`,
/// or the whole name when it is two characters or shorter.
///
/// Taking the *penultimate* slice keeps the trailing digit of conventional
/// names out of the id ("router1" and "router2" both map to "er" and get
/// disambiguated by the counter instead of colliding on interface names).
pub fn short_name(name: &str) -> &str {
    if name.len() <= 2 {
        return name;
    }
    &name[name.len() - 3..name.len() - 1]
}

/// Thread-safe allocator of per-project short ids.
#[derive(Debug, Default)]
pub struct IdGenerator {
    used: Mutex<HashSet<String>>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the short id for `name`. On collision with an id already
    /// issued in this project, a counter is appended until the id is free.
    pub fn get_id(&self, name: &str) -> String {
        let base = short_name(name);
        let mut used = self.used.lock().expect("id pool poisoned");

        if used.insert(base.to_string()) {
            return base.to_string();
        }

        let mut counter = 0usize;
        loop {
            let candidate = format!("{base}{counter}");
            if used.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Release the whole pool.
    pub fn close(&self) {
        self.used.lock().expect("id pool poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_policy() {
        assert_eq!(short_name("r1"), "r1");
        assert_eq!(short_name("a"), "a");
        assert_eq!(short_name("br0"), "br");
        assert_eq!(short_name("router1"), "er");
        assert_eq!(short_name("switch12"), "h1");
    }

    #[test]
    fn collisions_get_a_counter() {
        let generator = IdGenerator::new();
        assert_eq!(generator.get_id("router1"), "er");
        assert_eq!(generator.get_id("router2"), "er0");
        assert_eq!(generator.get_id("router3"), "er1");
        // unrelated names are unaffected
        assert_eq!(generator.get_id("h1"), "h1");
    }

    #[test]
    fn ids_are_distinct_within_a_project() {
        let generator = IdGenerator::new();
        let names = ["r1", "r2", "router1", "router2", "host1", "host2", "br0"];
        let mut seen = HashSet::new();
        for name in names {
            assert!(seen.insert(generator.get_id(name)), "duplicate id for {name}");
        }
    }

    #[test]
    fn close_releases_the_pool() {
        let generator = IdGenerator::new();
        assert_eq!(generator.get_id("router1"), "er");
        generator.close();
        assert_eq!(generator.get_id("router2"), "er");
    }
}
