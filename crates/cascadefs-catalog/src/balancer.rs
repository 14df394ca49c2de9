//! Weight-based catalog balancing
//!
//! An overweight catalog is partitioned by turning well-sized
//! subdirectories into nested catalogs. The balancer only needs two
//! capabilities from the tree: path lookups and the split operation, so it
//! is a free function over the [`BalanceTarget`] trait rather than a
//! manager method.
//!
//! Cut selection walks into the heaviest subdirectory whose subtree weight
//! reaches `min_weight`, as deep as such candidates exist, and cuts at the
//! deepest one. After balancing, a catalog is either within `max_weight`
//! or contains no subdirectory worth splitting out.

use crate::entry::DirectoryEntry;
use crate::error::CatalogError;
use tracing::debug;

/// The balancer's window into the catalog tree
pub trait BalanceTarget {
    /// The entry at `path`, if any
    fn entry(&self, path: &str) -> Option<DirectoryEntry>;

    /// Immediate children of a directory within its catalog, as
    /// (full path, entry) pairs. Nested mountpoint rows appear here;
    /// rows inside other catalogs do not.
    fn children(&self, dir_path: &str) -> Vec<(String, DirectoryEntry)>;

    /// Split: root a new nested catalog at `mountpoint`
    fn create_nested_catalog(&mut self, mountpoint: &str) -> Result<(), CatalogError>;
}

struct WeightNode {
    path: String,
    weight: u32,
    is_catalog: bool,
    is_directory: bool,
    children: Vec<WeightNode>,
}

fn build_node(
    target: &dyn BalanceTarget,
    path: &str,
    entry: &DirectoryEntry,
    is_catalog_root: bool,
) -> WeightNode {
    let is_catalog = !is_catalog_root && entry.is_nested_mountpoint;
    let is_directory = entry.is_directory();
    let mut node = WeightNode {
        path: path.to_string(),
        weight: 1,
        is_catalog,
        is_directory,
        children: Vec::new(),
    };
    if is_directory && !is_catalog {
        for (child_path, child_entry) in target.children(path) {
            let child = build_node(target, &child_path, &child_entry, false);
            node.weight += child.weight;
            node.children.push(child);
        }
    }
    node
}

/// The deepest cut candidate along the heaviest-eligible-child chain, or
/// None when no subdirectory reaches `min_weight`
fn choose_cut(node: &WeightNode, min_weight: u32) -> Option<String> {
    let best = node
        .children
        .iter()
        .filter(|c| c.is_directory && !c.is_catalog && c.weight >= min_weight)
        .max_by_key(|c| c.weight)?;
    Some(choose_cut(best, min_weight).unwrap_or_else(|| best.path.clone()))
}

/// Partition the catalog rooted at `catalog_root` until its weight drops
/// to `max_weight` or no cut candidate remains. Returns the mountpoints
/// created, in order.
pub fn balance(
    target: &mut dyn BalanceTarget,
    catalog_root: &str,
    max_weight: u32,
    min_weight: u32,
) -> Result<Vec<String>, CatalogError> {
    let mut created = Vec::new();
    loop {
        let root_entry = target
            .entry(catalog_root)
            .ok_or_else(|| CatalogError::EntryNotFound(catalog_root.to_string()))?;
        let tree = build_node(target, catalog_root, &root_entry, true);
        if tree.weight <= max_weight {
            break;
        }
        let Some(cut) = choose_cut(&tree, min_weight) else {
            debug!(
                catalog = catalog_root,
                weight = tree.weight,
                "overweight catalog has no splittable subdirectory"
            );
            break;
        };
        debug!(catalog = catalog_root, cut = %cut, "balancer cutting subtree");
        target.create_nested_catalog(&cut)?;
        created.push(cut);
    }
    Ok(created)
}
