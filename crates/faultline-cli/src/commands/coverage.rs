//! Coverage file summary.

use std::path::Path;

use anyhow::{Context, Result};
use faultline_decide::{TrieStats, VisitedTrie};

use crate::style::{print_info_table, print_warn};

pub fn run(path: &Path, window: usize) -> Result<()> {
    if !path.exists() {
        print_warn(&format!("{} does not exist yet", path.display()));
        return Ok(());
    }
    let trie = VisitedTrie::load_or_new(path, window)
        .with_context(|| format!("Failed to read coverage from {}", path.display()))?;
    let rows = rows(&trie.stats(), window);
    let entries: Vec<(&str, &str)> = rows.iter().map(|(k, v)| (*k, v.as_str())).collect();
    print_info_table(&entries);
    Ok(())
}

fn rows(stats: &TrieStats, window: usize) -> Vec<(&'static str, String)> {
    vec![
        ("Window", window.to_string()),
        ("Distinct tokens", stats.tokens.to_string()),
        ("Trie nodes", stats.nodes.to_string()),
        ("Deepest chain", stats.max_depth.to_string()),
        ("Visits", stats.total_visits.to_string()),
        ("Carried visits", stats.carried_visits.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_trie_is_summarized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited");

        let mut trie = VisitedTrie::new(3);
        trie.start_txn(&["n0", "s1"]).unwrap();
        trie.register_child(7);
        trie.end_txn();
        trie.save(&path).unwrap();

        let loaded = VisitedTrie::load_or_new(&path, 3).unwrap();
        let rows = rows(&loaded.stats(), 3);
        assert_eq!(rows[0].1, "3");
        assert!(rows[4].1.parse::<u64>().unwrap() >= 1);
        assert!(run(&path, 3).is_ok());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), 10).is_ok());
    }
}
