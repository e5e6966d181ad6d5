//! LOD octree over the block grid.
//!
//! Level 0 holds one leaf per full-resolution block. Each coarser level
//! groups 2x2x2 nodes of the level below (fewer at the grid edges) until a
//! single root remains, so a node at level `l` stands for block
//! `(x, y, z, l)`. Nodes live in one arena and link to each other by index,
//! so the whole tree is dropped as a unit.

use std::collections::{HashSet, VecDeque};

use glam::{UVec3, Vec3};
use tracing::{debug, trace};

use crate::index::geometry::{Aabb, ViewVolume, Visibility};
use crate::volume::block::{BlockIndex, VolumeMetadata};

/// Index of a node in the arena.
pub type NodeId = u32;

#[derive(Debug, Clone)]
pub struct OctreeNode {
    /// Bounds in volume space.
    pub bounds: Aabb,
    pub level: u32,
    pub index: BlockIndex,
    pub parent: Option<NodeId>,
    pub children: [Option<NodeId>; 8],
}

/// Immutable LOD octree.
#[derive(Debug, Clone)]
pub struct LodOctree {
    nodes: Vec<OctreeNode>,
    /// Level-0 nodes in grid order (x fastest).
    leaves: Vec<NodeId>,
    root: NodeId,
    levels: u32,
}

impl LodOctree {
    /// Build the tree for a volume's full-resolution block grid.
    pub fn build(meta: &VolumeMetadata) -> Self {
        Self::build_grid(meta.dimensions, meta.block_length, meta.spacing)
    }

    /// Build from voxel dimensions, unpadded block length and voxel spacing.
    pub fn build_grid(dimensions: UVec3, block_length: u32, spacing: Vec3) -> Self {
        let block_length = block_length.max(1);
        let dims = dimensions.max(UVec3::ONE);
        let mut grid = (dims + UVec3::splat(block_length - 1)) / block_length;

        let mut nodes: Vec<OctreeNode> = Vec::with_capacity(grid.element_product() as usize * 8 / 7 + 1);
        let mut level_ids: Vec<NodeId> = Vec::with_capacity(grid.element_product() as usize);

        for z in 0..grid.z {
            for y in 0..grid.y {
                for x in 0..grid.x {
                    let cell = UVec3::new(x, y, z);
                    let min = (cell * block_length).as_vec3();
                    let max = ((cell + UVec3::ONE) * block_length).min(dims).as_vec3();
                    level_ids.push(nodes.len() as NodeId);
                    nodes.push(OctreeNode {
                        bounds: Aabb::new(min, max),
                        level: 0,
                        index: BlockIndex::new(x as i32, y as i32, z as i32, 0),
                        parent: None,
                        children: [None; 8],
                    });
                }
            }
        }
        let leaves = level_ids.clone();

        let mut level = 0;
        while level_ids.len() > 1 {
            level += 1;
            let parent_grid = (grid + UVec3::ONE) / 2;
            let mut parent_ids = Vec::with_capacity(parent_grid.element_product() as usize);

            for z in 0..parent_grid.z {
                for y in 0..parent_grid.y {
                    for x in 0..parent_grid.x {
                        let parent_id = nodes.len() as NodeId;
                        let mut children = [None; 8];
                        let mut bounds: Option<Aabb> = None;

                        for (octant, child) in children.iter_mut().enumerate() {
                            let offset = UVec3::new(
                                octant as u32 & 1,
                                (octant as u32 >> 1) & 1,
                                (octant as u32 >> 2) & 1,
                            );
                            let c = UVec3::new(x, y, z) * 2 + offset;
                            if c.cmpge(grid).any() {
                                continue;
                            }
                            let id = level_ids[((c.z * grid.y + c.y) * grid.x + c.x) as usize];
                            let node = &mut nodes[id as usize];
                            node.parent = Some(parent_id);
                            bounds = Some(match bounds {
                                Some(b) => b.union(&node.bounds),
                                None => node.bounds,
                            });
                            *child = Some(id);
                        }

                        if let Some(bounds) = bounds {
                            parent_ids.push(parent_id);
                            nodes.push(OctreeNode {
                                bounds,
                                level,
                                index: BlockIndex::new(x as i32, y as i32, z as i32, level as i32),
                                parent: None,
                                children,
                            });
                        }
                    }
                }
            }

            level_ids = parent_ids;
            grid = parent_grid;
        }

        for node in &mut nodes {
            node.bounds = node.bounds.scaled(spacing);
        }

        let root = level_ids[0];
        debug!(
            nodes = nodes.len(),
            leaves = leaves.len(),
            levels = level + 1,
            "Built LOD octree"
        );

        Self {
            nodes,
            leaves,
            root,
            levels: level + 1,
        }
    }

    /// Replace this tree with one built for `meta`.
    pub fn rebuild(&mut self, meta: &VolumeMetadata) {
        *self = Self::build(meta);
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id as usize]
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of levels; the root sits at `levels() - 1`.
    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// All blocks at exactly `level` that intersect `region`.
    pub fn query_level(&self, region: &impl ViewVolume, level: u32) -> Vec<BlockIndex> {
        let mut out = Vec::new();
        if level >= self.levels {
            debug!(level, levels = self.levels, "Query level above root");
            return out;
        }

        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            let node = self.node(id);
            match region.classify(&node.bounds) {
                Visibility::Invisible => {}
                Visibility::FullyVisible => self.collect_level(id, level, &mut out),
                Visibility::Intersecting if node.level == level => out.push(node.index),
                Visibility::Intersecting => queue.extend(node.children.iter().flatten()),
            }
        }

        trace!(level, blocks = out.len(), "Fixed-level query");
        out
    }

    /// Blocks intersecting `region`, each at the level its distance to `eye`
    /// calls for.
    ///
    /// A leaf at distance `d` uses the smallest level `i` with
    /// `d < lod_distances[i]`, or `lod_distances.len()` if none matches,
    /// capped at the root. Blocks covered by another selected block are
    /// dropped, so the result does not overlap.
    pub fn query_lod(
        &self,
        region: &impl ViewVolume,
        eye: Vec3,
        lod_distances: &[f32],
    ) -> Vec<BlockIndex> {
        let leaves = self.intersecting_leaves(region);
        let max_level = self.levels - 1;

        let mut selected: HashSet<NodeId> = HashSet::new();
        for leaf in leaves {
            let distance = self.node(leaf).bounds.center().distance(eye);
            let level = select_level(distance, lod_distances).min(max_level);
            let mut id = leaf;
            for _ in 0..level {
                match self.node(id).parent {
                    Some(parent) => id = parent,
                    None => break,
                }
            }
            selected.insert(id);
        }

        let mut out: Vec<BlockIndex> = selected
            .iter()
            .filter(|&&id| !self.has_selected_ancestor(id, &selected))
            .map(|&id| self.node(id).index)
            .collect();
        out.sort_by_key(|b| (b.lod, b.z, b.y, b.x));

        trace!(blocks = out.len(), "Distance LOD query");
        out
    }

    fn intersecting_leaves(&self, region: &impl ViewVolume) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            let node = self.node(id);
            if region.classify(&node.bounds) == Visibility::Invisible {
                continue;
            }
            if node.level == 0 {
                out.push(id);
            } else {
                queue.extend(node.children.iter().flatten());
            }
        }
        out
    }

    fn collect_level(&self, id: NodeId, level: u32, out: &mut Vec<BlockIndex>) {
        let node = self.node(id);
        if node.level == level {
            out.push(node.index);
        } else if node.level > level {
            for &child in node.children.iter().flatten() {
                self.collect_level(child, level, out);
            }
        }
    }

    fn has_selected_ancestor(&self, id: NodeId, selected: &HashSet<NodeId>) -> bool {
        let mut current = self.node(id).parent;
        while let Some(parent) = current {
            if selected.contains(&parent) {
                return true;
            }
            current = self.node(parent).parent;
        }
        false
    }
}

/// Smallest level whose distance threshold exceeds `distance`.
pub fn select_level(distance: f32, lod_distances: &[f32]) -> u32 {
    lod_distances
        .iter()
        .position(|&limit| distance < limit)
        .unwrap_or(lod_distances.len()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_512() -> LodOctree {
        LodOctree::build_grid(UVec3::splat(512), 128, Vec3::ONE)
    }

    #[test]
    fn test_build_counts() {
        let tree = tree_512();
        // 64 leaves + 8 + 1
        assert_eq!(tree.leaf_count(), 64);
        assert_eq!(tree.node_count(), 73);
        assert_eq!(tree.levels(), 3);
        assert_eq!(tree.node(tree.root()).index, BlockIndex::new(0, 0, 0, 2));
    }

    #[test]
    fn test_uneven_grid_pads_missing_children() {
        let tree = LodOctree::build_grid(UVec3::new(300, 128, 128), 128, Vec3::ONE);
        // 3x1x1 leaves → 2x1x1 → 1
        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.node_count(), 6);

        let root = tree.node(tree.root());
        assert_eq!(root.bounds.max, Vec3::new(300.0, 128.0, 128.0));
    }

    #[test]
    fn test_spacing_scales_bounds() {
        let tree = LodOctree::build_grid(UVec3::splat(256), 128, Vec3::new(0.5, 1.0, 2.0));
        let root = tree.node(tree.root());
        assert_eq!(root.bounds.max, Vec3::new(128.0, 256.0, 512.0));
    }

    #[test]
    fn test_parent_links() {
        let tree = tree_512();
        let leaf = tree.leaves[0];
        let parent = tree.node(leaf).parent.unwrap();
        assert_eq!(tree.node(parent).level, 1);
        assert!(tree.node(parent).children.contains(&Some(leaf)));
    }

    #[test]
    fn test_select_level() {
        let table = [100.0, 200.0, 400.0];
        assert_eq!(select_level(10.0, &table), 0);
        assert_eq!(select_level(150.0, &table), 1);
        assert_eq!(select_level(1000.0, &table), 3);
        assert_eq!(select_level(5.0, &[]), 0);
    }

    #[test]
    fn test_partial_box_query() {
        let tree = tree_512();
        let region = Aabb::new(Vec3::ZERO, Vec3::splat(200.0));
        let blocks = tree.query_level(&region, 0);
        assert_eq!(blocks.len(), 8);
        assert!(blocks.iter().all(|b| b.x < 2 && b.y < 2 && b.z < 2));

        let coarse = tree.query_level(&region, 1);
        assert_eq!(coarse, vec![BlockIndex::new(0, 0, 0, 1)]);

        assert!(tree.query_level(&region, 5).is_empty());
    }
}
