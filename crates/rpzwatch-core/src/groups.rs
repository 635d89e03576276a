//! Domain Group Registry
//!
//! Groups root domains that appeared together in one redirect chain. The
//! relation is kept symmetric and transitively closed: when a new chain links
//! two previously separate groups, every member of the merged group lists
//! every other member.
//!
//! ## Persisted Format
//!
//! ```json
//! {
//!   "a.example": ["b.example", "c.example"],
//!   "b.example": ["a.example", "c.example"],
//!   "c.example": ["a.example", "b.example"]
//! }
//! ```
//!
//! The merge is computed with a disjoint-set forest built from the stored
//! adjacency, then flattened back into that format.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::StorageConfig;
use crate::domains::root_domain;
use crate::error::Result;
use crate::persist::JsonFile;

/// Root domain → every other member of its group
pub type GroupMapping = BTreeMap<String, BTreeSet<String>>;

/// File-backed registry of domain equivalence groups
#[derive(Debug, Clone)]
pub struct DomainGroupRegistry {
    file: JsonFile,
}

impl DomainGroupRegistry {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            file: JsonFile::new(path, lock_timeout),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.groups_path.clone(), config.lock_timeout())
    }

    /// Merge the domains of one redirect chain into the mapping
    ///
    /// Names are collapsed to their root; chains with fewer than two distinct
    /// roots are ignored. The read-merge-write runs under the file lock and
    /// the file is only rewritten when the mapping actually changed.
    ///
    /// # Returns
    ///
    /// Whether the persisted mapping changed
    pub async fn record_chain<I, S>(&self, domains: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roots: BTreeSet<String> = domains
            .into_iter()
            .map(|d| root_domain(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        if roots.len() < 2 {
            return Ok(false);
        }

        let changed = self
            .file
            .update(|mapping: &mut GroupMapping| {
                let changed = merge_chain(mapping, &roots);
                (changed, changed)
            })
            .await?;

        if changed {
            tracing::info!("Domain group updated: {:?}", roots);
        }
        Ok(changed)
    }

    /// Current group members of `domain`'s root, sorted; empty if ungrouped
    pub async fn related_domains(&self, domain: &str) -> Result<Vec<String>> {
        let mapping: GroupMapping = self.file.load().await?;
        Ok(mapping
            .get(&root_domain(domain))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Full persisted mapping
    pub async fn mapping(&self) -> Result<GroupMapping> {
        self.file.load().await
    }
}

/// Merge `roots` into `mapping` in place
///
/// Every domain connected to the chain through any stored link ends up
/// listing the whole connected set minus itself. Groups not touched by the
/// chain are left as they are.
///
/// Returns whether anything changed.
pub fn merge_chain(mapping: &mut GroupMapping, roots: &BTreeSet<String>) -> bool {
    let Some(first) = roots.iter().next() else {
        return false;
    };

    let mut forest = DisjointSet::default();
    for (domain, members) in mapping.iter() {
        for member in members {
            forest.union(domain, member);
        }
    }
    for root in roots {
        forest.union(first, root);
    }

    let merged = forest.component_of(first);
    let mut changed = false;
    for domain in &merged {
        let mut others = merged.clone();
        others.remove(domain);
        if mapping.get(domain) != Some(&others) {
            mapping.insert(domain.clone(), others);
            changed = true;
        }
    }
    changed
}

/// Union-find over domain names with path compression and union by rank
#[derive(Debug, Default)]
struct DisjointSet {
    index: HashMap<String, usize>,
    names: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len();
        self.index.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, id: usize) -> usize {
        let mut root = id;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = id;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let a = self.id(a);
        let b = self.id(b);
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    fn component_of(&mut self, name: &str) -> BTreeSet<String> {
        let target = self.id(name);
        let target = self.find(target);
        let members: Vec<usize> = (0..self.names.len())
            .filter(|&id| self.find(id) == target)
            .collect();
        members.into_iter().map(|id| self.names[id].clone()).collect()
    }
}
