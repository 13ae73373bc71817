//! A* search over the X/Z cell grid
//!
//! Eight-directional steps: orthogonal cost 10, diagonal cost 14. The open and
//! closed sets are plain vectors scanned linearly, which is fine for the
//! bounded radii paths are requested over; `limit` caps the closed set so a
//! search for an unreachable cell terminates.

use glam::{IVec2, Vec3};

/// Cost of an orthogonal step
pub const ORTHOGONAL_COST: u32 = 10;
/// Cost of a diagonal step (10 * sqrt 2, rounded)
pub const DIAGONAL_COST: u32 = 14;

const DIRECTIONS: [IVec2; 8] = [
    IVec2::new(1, 0),
    IVec2::new(-1, 0),
    IVec2::new(0, 1),
    IVec2::new(0, -1),
    IVec2::new(1, 1),
    IVec2::new(1, -1),
    IVec2::new(-1, 1),
    IVec2::new(-1, -1),
];

/// What the search needs to know about the world
pub trait PathGrid {
    fn is_passable(&self, x: i32, z: i32) -> bool;

    /// Surface height sampled for each waypoint
    fn height(&self, _x: i32, _z: i32) -> f32 {
        0.0
    }
}

/// Search-graph node, alive for one search
#[derive(Clone, Copy, Debug)]
pub struct PathNode {
    pub pos: IVec2,
    pub parent: Option<usize>,
    pub g: u32,
    pub h: u32,
}

impl PathNode {
    pub fn f(&self) -> u32 {
        self.g + self.h
    }
}

/// Result of a search. Empty means no route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Path {
    pub origin: IVec2,
    /// Cells after the origin, in walking order
    pub cells: Vec<IVec2>,
    /// `cells` lifted to world positions at their surface height
    pub waypoints: Vec<Vec3>,
    pub cost: u32,
}

impl Path {
    fn empty(origin: IVec2) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Last cell, if any
    pub fn destination(&self) -> Option<IVec2> {
        self.cells.last().copied()
    }
}

/// Cost of a single step between adjacent cells
pub fn step_cost(from: IVec2, to: IVec2) -> u32 {
    if from.x != to.x && from.y != to.y {
        DIAGONAL_COST
    } else {
        ORTHOGONAL_COST
    }
}

/// Octile distance: the exact cost on an open grid
pub fn octile(a: IVec2, b: IVec2) -> u32 {
    let d = (a - b).abs();
    let (lo, hi) = (d.x.min(d.y) as u32, d.x.max(d.y) as u32);
    DIAGONAL_COST * lo + ORTHOGONAL_COST * (hi - lo)
}

/// Find a path from `source` to `target` expanding at most `limit` nodes.
///
/// An impassable target is replaced by its passable neighbor closest to the
/// source. Exhausting the open set or the limit yields an empty path.
pub fn find_path(grid: &impl PathGrid, source: IVec2, target: IVec2, limit: usize) -> Path {
    if source == target {
        return Path::empty(source);
    }

    let target = if grid.is_passable(target.x, target.y) {
        target
    } else {
        match DIRECTIONS
            .iter()
            .map(|d| target + *d)
            .filter(|n| grid.is_passable(n.x, n.y))
            .min_by_key(|n| octile(source, *n))
        {
            Some(retarget) => {
                log::trace!("Target {} blocked, retargeting to {}", target, retarget);
                retarget
            }
            None => return Path::empty(source),
        }
    };
    if target == source {
        return Path::empty(source);
    }

    let mut nodes = vec![PathNode {
        pos: source,
        parent: None,
        g: 0,
        h: octile(source, target),
    }];
    let mut open: Vec<usize> = vec![0];
    let mut closed: Vec<usize> = Vec::new();
    let limit = limit.max(1);

    while !open.is_empty() {
        // Lowest f, ties to lowest h
        let mut best = 0;
        for i in 1..open.len() {
            let (a, b) = (&nodes[open[i]], &nodes[open[best]]);
            if (a.f(), a.h) < (b.f(), b.h) {
                best = i;
            }
        }
        let current = open.swap_remove(best);
        let node = nodes[current];

        if node.pos == target {
            return reconstruct(grid, &nodes, current, source);
        }

        closed.push(current);
        if closed.len() >= limit {
            log::debug!(
                "Path search {} -> {} gave up after {} nodes",
                source,
                target,
                closed.len()
            );
            return Path::empty(source);
        }

        for dir in DIRECTIONS {
            let pos = node.pos + dir;
            if closed.iter().any(|&i| nodes[i].pos == pos) {
                continue;
            }
            if !grid.is_passable(pos.x, pos.y) {
                continue;
            }

            let g = node.g + step_cost(node.pos, pos);
            match open.iter().find(|&&i| nodes[i].pos == pos) {
                Some(&i) => {
                    if g < nodes[i].g {
                        nodes[i].g = g;
                        nodes[i].parent = Some(current);
                    }
                }
                None => {
                    nodes.push(PathNode {
                        pos,
                        parent: Some(current),
                        g,
                        h: octile(pos, target),
                    });
                    open.push(nodes.len() - 1);
                }
            }
        }
    }

    Path::empty(source)
}

fn reconstruct(grid: &impl PathGrid, nodes: &[PathNode], goal: usize, origin: IVec2) -> Path {
    let mut cells = Vec::new();
    let mut cursor = Some(goal);
    while let Some(i) = cursor {
        let node = &nodes[i];
        if node.parent.is_none() {
            break;
        }
        cells.push(node.pos);
        cursor = node.parent;
    }
    cells.reverse();

    let waypoints = cells
        .iter()
        .map(|c| Vec3::new(c.x as f32, grid.height(c.x, c.y), c.y as f32))
        .collect();

    Path {
        origin,
        cells,
        waypoints,
        cost: nodes[goal].g,
    }
}
