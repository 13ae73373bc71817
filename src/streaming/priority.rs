//! Priority queue of chunks to activate, nearest to the viewpoint first

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::{IVec3, Vec3};

use crate::streaming::coord::ChunkCoord;

/// Priority information for a chunk
#[derive(Clone, Copy, Debug)]
pub struct ChunkPriority {
    pub coord: ChunkCoord,
    pub priority: f32, // Higher = more important
    pub distance: f32, // Viewpoint to chunk center
}

impl ChunkPriority {
    /// Priority of a chunk for a viewpoint. Flat volumes measure on X/Z only.
    pub fn calculate(coord: ChunkCoord, viewpoint: Vec3, dims: [usize; 3], flat: bool) -> Self {
        let distance = planar(coord.world_center(dims), flat).distance(planar(viewpoint, flat));
        Self {
            coord,
            priority: 1.0 / (distance + 1.0),
            distance,
        }
    }
}

fn planar(v: Vec3, flat: bool) -> Vec3 {
    if flat { Vec3::new(v.x, 0.0, v.z) } else { v }
}

/// Distance from `point` to the closest point of the chunk's box
fn box_distance(coord: ChunkCoord, point: Vec3, dims: [usize; 3], flat: bool) -> f32 {
    let min = coord.origin_cell(dims).as_vec3();
    let max = min + Vec3::new(dims[0] as f32, dims[1] as f32, dims[2] as f32);
    let point = planar(point, flat);
    let (min, max) = (planar(min, flat), planar(max, flat));
    point.clamp(min, max).distance(point)
}

// BinaryHeap is a max-heap: highest priority pops first
impl Eq for ChunkPriority {}

impl PartialEq for ChunkPriority {
    fn eq(&self, other: &Self) -> bool {
        self.coord == other.coord
    }
}

impl Ord for ChunkPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Coordinate tie-break keeps pop order deterministic
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.coord.cmp(&self.coord))
    }
}

impl PartialOrd for ChunkPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Chunks inside the interest radius, ordered for activation
pub struct ActivationQueue {
    heap: BinaryHeap<ChunkPriority>,
    radius: f32,
}

impl ActivationQueue {
    pub fn new(radius: f32) -> Self {
        Self {
            heap: BinaryHeap::new(),
            radius,
        }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, priority: ChunkPriority) {
        self.heap.push(priority);
    }

    pub fn pop(&mut self) -> Option<ChunkPriority> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Refill with every chunk whose box lies within the radius of `viewpoint`.
    ///
    /// The chunk containing the viewpoint is always included. Flat volumes
    /// only scan chunk Y = 0.
    pub fn update(&mut self, viewpoint: Vec3, dims: [usize; 3], flat: bool) {
        self.clear();

        let cell = viewpoint.floor().as_ivec3();
        let center = ChunkCoord::from_cell(IVec3::new(cell.x, if flat { 0 } else { cell.y }, cell.z), dims);
        let reach = |extent: usize| (self.radius / extent as f32).ceil() as i32 + 1;
        let (rx, rz) = (reach(dims[0]), reach(dims[2]));
        let ry = if flat { 0 } else { reach(dims[1]) };

        for dy in -ry..=ry {
            for dz in -rz..=rz {
                for dx in -rx..=rx {
                    let coord = ChunkCoord::new(center.x + dx, center.y + dy, center.z + dz);
                    if coord != center && box_distance(coord, viewpoint, dims, flat) > self.radius {
                        continue;
                    }
                    self.push(ChunkPriority::calculate(coord, viewpoint, dims, flat));
                }
            }
        }
    }

    /// Drain in priority order
    pub fn drain_ordered(&mut self) -> Vec<ChunkCoord> {
        std::iter::from_fn(|| self.heap.pop()).map(|p| p.coord).collect()
    }
}
