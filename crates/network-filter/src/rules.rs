//! File-backed store for the blocked-domain and blocked-keyword collections.
//!
//! Readers take [`RuleSnapshot`]s, which clone two `Arc`s under the read lock.
//! Writers swap a freshly built [`RuleSet`] under the write lock and persist
//! afterwards, so disk I/O never blocks the decision path.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use {
    tokio::{fs, io::AsyncWriteExt, sync::Mutex},
    tracing::{debug, info, instrument, warn},
};

#[cfg(feature = "metrics")]
use netwatch_metrics::{counter, definitions, gauge};

use crate::{Error, Result, RuleKind, RuleSet, RuleSnapshot};

/// Read a rule file. A missing file yields an empty set.
///
/// Blank lines and lines starting with `#` are skipped; everything else is
/// trimmed and lower-cased.
pub async fn load(path: &Path) -> Result<RuleSet> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RuleSet::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(RuleSet::from_entries(
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#')),
    ))
}

/// Write `rules` sorted, one per line, replacing the file.
///
/// The content goes to a hidden sibling first and is renamed into place, so
/// readers see either the old file or the complete new one.
pub async fn save(path: &Path, rules: &RuleSet) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let mut out = String::new();
    for rule in rules {
        out.push_str(rule.as_str());
        out.push('\n');
    }

    let tmp = temp_path(path);
    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(out.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;
    if written.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    written
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

pub struct RuleStore {
    domains_path: PathBuf,
    keywords_path: PathBuf,
    rules: RwLock<RuleSnapshot>,
    /// Serializes file writes; never held while taking the write lock.
    persist: Mutex<()>,
}

impl RuleStore {
    /// Create a store backed by the two rule files, loading whatever exists.
    pub async fn open(
        domains_path: impl Into<PathBuf>,
        keywords_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let store = Self::empty(domains_path.into(), keywords_path.into());
        store.reload().await?;
        Ok(store)
    }

    fn empty(domains_path: PathBuf, keywords_path: PathBuf) -> Self {
        Self {
            domains_path,
            keywords_path,
            rules: RwLock::new(RuleSnapshot::default()),
            persist: Mutex::new(()),
        }
    }

    /// Re-read both rule files from disk and swap them in.
    pub async fn reload(&self) -> Result<()> {
        let domains = load(&self.domains_path).await?;
        info!(path = %self.domains_path.display(), count = domains.len(), "loaded domain rules");
        let keywords = load(&self.keywords_path).await?;
        info!(path = %self.keywords_path.display(), count = keywords.len(), "loaded keyword rules");

        let snapshot = RuleSnapshot::new(domains, keywords);
        #[cfg(feature = "metrics")]
        for kind in RuleKind::ALL {
            record_rule_gauge(kind, snapshot.get(kind).len());
        }
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    /// Consistent copy of both collections.
    pub fn snapshot(&self) -> RuleSnapshot {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(domain_count, keyword_count)`.
    pub fn counts(&self) -> (usize, usize) {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        (rules.domains.len(), rules.keywords.len())
    }

    pub fn path(&self, kind: RuleKind) -> &Path {
        match kind {
            RuleKind::Domains => &self.domains_path,
            RuleKind::Keywords => &self.keywords_path,
        }
    }

    /// Swap in `rules` for `kind`, then persist.
    ///
    /// The in-memory swap is kept even when the write fails; the failure is
    /// returned as [`Error::Persist`] for the caller to surface.
    #[instrument(skip(self, rules), fields(kind = %kind, count = rules.len()))]
    pub async fn replace(&self, kind: RuleKind, rules: RuleSet) -> Result<()> {
        let count = rules.len();
        self.swap(kind, rules);
        debug!("rules swapped in memory");
        #[cfg(feature = "metrics")]
        record_rule_gauge(kind, count);

        self.persist(kind).await.inspect(|_| {
            info!(count, "rules saved");
        })
    }

    fn swap(&self, kind: RuleKind, rules: RuleSet) {
        let mut current = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rules = Arc::new(rules);
        match kind {
            RuleKind::Domains => current.domains = rules,
            RuleKind::Keywords => current.keywords = rules,
        }
    }

    /// Write the current collection for `kind` to its file.
    ///
    /// Re-reading under the persist mutex means concurrent writers leave the
    /// file matching the last in-memory swap.
    async fn persist(&self, kind: RuleKind) -> Result<()> {
        let _guard = self.persist.lock().await;
        let snapshot = self.snapshot();
        let rules = match kind {
            RuleKind::Domains => snapshot.domains,
            RuleKind::Keywords => snapshot.keywords,
        };
        let path = self.path(kind);
        save(path, &rules).await.map_err(|source| {
            warn!(path = %path.display(), error = %source, "failed to save rules");
            #[cfg(feature = "metrics")]
            counter!(definitions::FILTER_RULE_PERSIST_FAILURES_TOTAL).increment(1);
            Error::Persist {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

#[cfg(feature = "metrics")]
fn record_rule_gauge(kind: RuleKind, count: usize) {
    gauge!(definitions::FILTER_RULES, definitions::labels::KIND => kind.as_str())
        .set(count as f64);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, crate::Rule, std::fs as std_fs};

    async fn store_in(dir: &Path) -> RuleStore {
        RuleStore::open(dir.join("blocked_domains.txt"), dir.join("blocked_keywords.txt"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.txt")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std_fs::write(
            &path,
            "# ad networks\n\nAds.Example.com\n  tracker.net  \n   # indented comment\nads.example.com\n",
        )
        .unwrap();

        let rules = load(&path).await.unwrap();
        assert_eq!(rules.to_strings(), vec!["ads.example.com", "tracker.net"]);
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std_fs::write(&path, "b.com\na.com\nB.COM\n").unwrap();
        assert_eq!(load(&path).await.unwrap(), load(&path).await.unwrap());
    }

    #[tokio::test]
    async fn save_writes_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rules.txt");
        save(&path, &RuleSet::from_entries(["zeta", "alpha"]))
            .await
            .unwrap();
        assert_eq!(std_fs::read_to_string(&path).unwrap(), "alpha\nzeta\n");
    }

    #[tokio::test]
    async fn save_replaces_whole_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std_fs::write(&path, "old-a\nold-b\nold-c\n").unwrap();

        save(&path, &RuleSet::from_entries(["new"])).await.unwrap();
        assert_eq!(std_fs::read_to_string(&path).unwrap(), "new\n");
        let names: Vec<_> = std_fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["rules.txt"]);
    }

    #[tokio::test]
    async fn failed_save_leaves_target_and_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Renaming a file over a non-empty directory fails.
        let target = dir.path().join("rules.txt");
        std_fs::create_dir(&target).unwrap();
        std_fs::write(target.join("keep"), "x").unwrap();

        assert!(save(&target, &RuleSet::from_entries(["a"])).await.is_err());
        assert!(target.join("keep").exists());
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn replace_swaps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let input = RuleSet::from_entries(["Ads.Example.COM", " ads.example.com ", ""]);
        store.replace(RuleKind::Domains, input).await.unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.domains.to_strings(), vec!["ads.example.com"]);
        assert!(snap.keywords.is_empty());
        assert_eq!(store.counts(), (1, 0));
        assert_eq!(
            std_fs::read_to_string(dir.path().join("blocked_domains.txt")).unwrap(),
            "ads.example.com\n"
        );

        // A fresh store sees the persisted rules.
        let reopened = store_in(dir.path()).await;
        assert_eq!(reopened.snapshot().domains, snap.domains);
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store
            .replace(RuleKind::Keywords, RuleSet::from_entries(["casino"]))
            .await
            .unwrap();
        let before = store.snapshot();
        store
            .replace(RuleKind::Keywords, RuleSet::from_entries(["poker"]))
            .await
            .unwrap();

        assert!(before.keywords.contains("casino"));
        assert!(store.snapshot().keywords.contains("poker"));
    }

    #[tokio::test]
    async fn persist_failure_keeps_in_memory_swap() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the write fail.
        let blocked = dir.path().join("blocked_domains.txt");
        std_fs::create_dir(&blocked).unwrap();
        std_fs::write(blocked.join("keep"), "x").unwrap();
        let store = RuleStore::empty(blocked.clone(), dir.path().join("blocked_keywords.txt"));

        let err = store
            .replace(RuleKind::Domains, RuleSet::from_entries(["evil.com"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persist { ref path, .. } if *path == blocked));
        assert!(store.snapshot().domains.contains("evil.com"));
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        assert_eq!(store.counts(), (0, 0));

        std_fs::write(dir.path().join("blocked_keywords.txt"), "casino\npoker\n").unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.counts(), (0, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replace_and_snapshot_never_tear() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()).await);
        let sets: Vec<RuleSet> = (0..4)
            .map(|i| (0..5).map(|j| Rule::parse(&format!("w{i}-r{j}")).unwrap()).collect())
            .collect();

        let writers: Vec<_> = sets
            .iter()
            .cloned()
            .map(|set| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let _ = store.replace(RuleKind::Domains, set.clone()).await;
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            let sets = sets.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snap = store.snapshot();
                    assert!(snap.domains.is_empty() || sets.iter().any(|s| *s == *snap.domains));
                    tokio::task::yield_now().await;
                }
            })
        };

        for w in writers {
            w.await.unwrap();
        }
        reader.await.unwrap();

        // The file converges on whatever is in memory.
        let on_disk = load(&dir.path().join("blocked_domains.txt")).await.unwrap();
        assert_eq!(on_disk, *store.snapshot().domains);
    }
}
