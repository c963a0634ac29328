//! The three pipeline stages and their top-level composition.

pub mod data;
pub mod evaluation;
pub mod experiment;
pub mod model;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Disambiguates repeated output-directory keys with a monotonically
/// increasing suffix. The counters are pipeline-instance state: a fresh
/// pipeline starts counting from zero again, but within one instance a
/// directory name is never reused.
#[derive(Debug, Default)]
pub struct DirCounter {
    counts: HashMap<String, usize>,
}

impl DirCounter {
    /// Creates a counter with no claimed keys.
    pub fn new() -> DirCounter {
        DirCounter {
            counts: HashMap::new(),
        }
    }

    /// Claims the next occurrence of `key` under `parent`.
    pub fn claim(&mut self, parent: &Path, key: &str) -> PathBuf {
        let count = self.counts.entry(key.to_owned()).or_insert(0);
        let dir = parent.join(format!("{}_{}", key, count));
        *count += 1;
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_get_increasing_suffixes() {
        let mut counter = DirCounter::new();
        let parent = Path::new("/tmp/experiment");

        assert_eq!(counter.claim(parent, "movies_ratings"), parent.join("movies_ratings_0"));
        assert_eq!(counter.claim(parent, "movies_ratings"), parent.join("movies_ratings_1"));
        assert_eq!(counter.claim(parent, "books_ratings"), parent.join("books_ratings_0"));
    }

    #[test]
    fn fresh_instances_restart_counting() {
        let parent = Path::new("/tmp/experiment");
        let first = DirCounter::new().claim(parent, "movies");
        let second = DirCounter::new().claim(parent, "movies");
        assert_eq!(first, second);
    }
}
