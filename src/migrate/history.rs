use std::collections::HashMap;

use crate::error::MigrationError;
use crate::migrate::script::RevisionScript;

/// The revision scripts arranged into their single linear chain, base first.
#[derive(Debug, Clone, Default)]
pub struct History {
    chain: Vec<RevisionScript>,
}

impl History {
    /// Links scripts by their `down_revision` pointers and rejects anything
    /// that is not exactly one unbranched chain.
    pub fn from_scripts(scripts: Vec<RevisionScript>) -> Result<Self, MigrationError> {
        if scripts.is_empty() {
            return Ok(Self::default());
        }

        let mut by_revision: HashMap<String, RevisionScript> = HashMap::new();
        for script in scripts {
            if let Some(existing) = by_revision.get(&script.revision) {
                return Err(MigrationError::BrokenChain(format!(
                    "revision {} is defined by both {} and {}",
                    script.revision,
                    existing.path.display(),
                    script.path.display()
                )));
            }
            by_revision.insert(script.revision.clone(), script);
        }

        let mut bases = Vec::new();
        let mut children: HashMap<&str, &str> = HashMap::new();
        for script in by_revision.values() {
            match &script.down_revision {
                None => bases.push(script.revision.as_str()),
                Some(parent) => {
                    if !by_revision.contains_key(parent) {
                        return Err(MigrationError::BrokenChain(format!(
                            "revision {} points at unknown parent {}",
                            script.revision, parent
                        )));
                    }
                    if let Some(sibling) = children.insert(parent.as_str(), script.revision.as_str()) {
                        let (a, b) = ordered_pair(sibling, &script.revision);
                        return Err(MigrationError::BrokenChain(format!(
                            "revisions {} and {} both follow {}; merge them into one line",
                            a, b, parent
                        )));
                    }
                }
            }
        }

        bases.sort_unstable();
        let base = match bases.as_slice() {
            [base] => base.to_string(),
            [] => {
                return Err(MigrationError::BrokenChain(
                    "no base revision (every script names a parent)".into(),
                ))
            }
            many => {
                return Err(MigrationError::BrokenChain(format!(
                    "multiple base revisions: {}",
                    many.join(", ")
                )))
            }
        };

        let mut order = vec![base];
        while let Some(next) = children.get(order[order.len() - 1].as_str()) {
            order.push(next.to_string());
        }

        if order.len() != by_revision.len() {
            return Err(MigrationError::BrokenChain(format!(
                "{} revision(s) are not reachable from base {}",
                by_revision.len() - order.len(),
                order[0]
            )));
        }

        let chain = order
            .iter()
            .filter_map(|rev| by_revision.remove(rev))
            .collect();
        Ok(Self { chain })
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RevisionScript> {
        self.chain.iter()
    }

    pub fn head(&self) -> Option<&RevisionScript> {
        self.chain.last()
    }

    pub fn get(&self, revision: &str) -> Option<&RevisionScript> {
        self.chain.iter().find(|s| s.revision == revision)
    }

    pub fn position(&self, revision: &str) -> Option<usize> {
        self.chain.iter().position(|s| s.revision == revision)
    }

    /// Scripts after `current` up to and including `target` (head when
    /// `None`). Empty when `target` is already applied.
    pub fn pending(
        &self,
        current: Option<&str>,
        target: Option<&str>,
    ) -> Result<&[RevisionScript], MigrationError> {
        let start = match current {
            None => 0,
            Some(rev) => {
                self.position(rev)
                    .ok_or_else(|| MigrationError::UnknownRevision(rev.to_string()))?
                    + 1
            }
        };
        let end = match target {
            None => self.chain.len(),
            Some(rev) => {
                self.position(rev)
                    .ok_or_else(|| MigrationError::UnknownRevision(rev.to_string()))?
                    + 1
            }
        };

        if end <= start {
            Ok(&[])
        } else {
            Ok(&self.chain[start..end])
        }
    }
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn script(revision: &str, parent: Option<&str>) -> RevisionScript {
        RevisionScript {
            revision: revision.to_string(),
            down_revision: parent.map(str::to_string),
            message: format!("step {}", revision),
            created: None,
            sql: "SELECT 1;".to_string(),
            path: PathBuf::from(format!("{}.sql", revision)),
        }
    }

    #[test]
    fn test_orders_chain_from_base() {
        let history = History::from_scripts(vec![
            script("ccc", Some("bbb")),
            script("aaa", None),
            script("bbb", Some("aaa")),
        ])
        .unwrap();

        let order: Vec<_> = history.iter().map(|s| s.revision.as_str()).collect();
        assert_eq!(order, vec!["aaa", "bbb", "ccc"]);
        assert_eq!(history.head().unwrap().revision, "ccc");
    }

    #[test]
    fn test_pending_ranges() {
        let history = History::from_scripts(vec![
            script("aaa", None),
            script("bbb", Some("aaa")),
            script("ccc", Some("bbb")),
        ])
        .unwrap();

        let revs = |s: &[RevisionScript]| s.iter().map(|s| s.revision.clone()).collect::<Vec<_>>();

        assert_eq!(revs(history.pending(None, None).unwrap()), vec!["aaa", "bbb", "ccc"]);
        assert_eq!(revs(history.pending(Some("aaa"), None).unwrap()), vec!["bbb", "ccc"]);
        assert_eq!(revs(history.pending(None, Some("bbb")).unwrap()), vec!["aaa", "bbb"]);
        assert!(history.pending(Some("ccc"), None).unwrap().is_empty());
        assert!(history.pending(Some("ccc"), Some("aaa")).unwrap().is_empty());
        assert!(matches!(
            history.pending(Some("zzz"), None),
            Err(MigrationError::UnknownRevision(_))
        ));
    }

    #[test]
    fn test_rejects_branches() {
        let err = History::from_scripts(vec![
            script("aaa", None),
            script("bbb", Some("aaa")),
            script("ccc", Some("aaa")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("bbb and ccc both follow aaa"), "{}", err);
    }

    #[test]
    fn test_rejects_missing_parent_and_duplicates() {
        assert!(matches!(
            History::from_scripts(vec![script("aaa", None), script("bbb", Some("zzz"))]),
            Err(MigrationError::BrokenChain(_))
        ));
        assert!(matches!(
            History::from_scripts(vec![script("aaa", None), script("aaa", None)]),
            Err(MigrationError::BrokenChain(_))
        ));
        assert!(matches!(
            History::from_scripts(vec![script("aaa", None), script("bbb", None)]),
            Err(MigrationError::BrokenChain(_))
        ));
    }

    #[test]
    fn test_rejects_cycles() {
        let err = History::from_scripts(vec![
            script("aaa", None),
            script("bbb", Some("ccc")),
            script("ccc", Some("bbb")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("not reachable"), "{}", err);
    }
}
