//! # Arena モジュール
//!
//! AIコアが要求する空間クエリ（レイキャスト・経路探索）の参照実装です。
//!
//! 矩形の歩行可能領域と軸平行ボックスの障害物で構成される平坦なフィールドを
//! 表現します。経路探索は格子グラフ上のA*（`pathfinding`クレート）で行い、
//! 直線で到達できる場合は格子を使わず直線経路を返します。

use pathfinding::prelude::{astar, bfs};
use serde::{Deserialize, Serialize};

use crate::models::{
    common::{AgentId, Vec3},
    traits::{BodySphere, Collider, ILineOfSight, INavMesh, LayerMask, RayHit, RayQuery},
};

/// 歩行可能領域の境界（XY平面）
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    pub fn is_valid(&self) -> bool {
        self.min_x < self.max_x && self.min_y < self.max_y
    }
}

/// 軸平行ボックスの障害物
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BoxObstacle {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoxObstacle {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// 足元（XY投影）が`margin`だけ膨らませた範囲に入っているか
    fn footprint_contains(&self, point: Vec3, margin: f64) -> bool {
        point.x >= self.min.x - margin
            && point.x <= self.max.x + margin
            && point.y >= self.min.y - margin
            && point.y <= self.max.y + margin
    }

    /// スラブ法によるレイとの交差距離
    fn ray_intersection(&self, origin: Vec3, dir: Vec3) -> Option<f64> {
        let mut t_min = 0.0_f64;
        let mut t_max = f64::INFINITY;
        let axes = [
            (origin.x, dir.x, self.min.x, self.max.x),
            (origin.y, dir.y, self.min.y, self.max.y),
            (origin.z, dir.z, self.min.z, self.max.z),
        ];
        for (o, d, lo, hi) in axes {
            if d.abs() < 1e-12 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (t1, t2) = {
                let a = (lo - o) * inv;
                let b = (hi - o) * inv;
                if a <= b { (a, b) } else { (b, a) }
            };
            t_min = t_min.max(t1);
            t_max = t_max.min(t2);
            if t_min > t_max {
                return None;
            }
        }
        Some(t_min)
    }
}

fn ray_sphere(origin: Vec3, dir: Vec3, sphere: &BodySphere) -> Option<f64> {
    let oc = origin - sphere.center;
    let c = oc.dot(&oc) - sphere.radius * sphere.radius;
    if c <= 0.0 {
        // 始点が球の内部
        return Some(0.0);
    }
    let b = oc.dot(&dir);
    if b > 0.0 {
        return None;
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    Some(-b - disc.sqrt())
}

type Cell = (i32, i32);

/// 平坦なフィールドの空間クエリ実装
#[derive(Debug, Clone)]
pub struct Arena {
    bounds: Bounds,
    obstacles: Vec<BoxObstacle>,
    cell_size: f64,
    /// 障害物の足元を膨らませる量（エージェントの半径相当）
    clearance: f64,
    cols: i32,
    rows: i32,
    walkable: Vec<bool>,
    target_body: Option<BodySphere>,
    agent_bodies: Vec<(AgentId, BodySphere)>,
}

impl Arena {
    pub fn new(bounds: Bounds, obstacles: Vec<BoxObstacle>, cell_size: f64, clearance: f64) -> Self {
        let cell_size = if cell_size > 0.0 { cell_size } else { 1.0 };
        let cols = (((bounds.max_x - bounds.min_x) / cell_size).ceil() as i32).max(1);
        let rows = (((bounds.max_y - bounds.min_y) / cell_size).ceil() as i32).max(1);

        let mut arena = Self {
            bounds,
            obstacles,
            cell_size,
            clearance: clearance.max(0.0),
            cols,
            rows,
            walkable: Vec::new(),
            target_body: None,
            agent_bodies: Vec::new(),
        };
        let walkable: Vec<bool> = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (col, row)))
            .map(|cell| arena.is_walkable_point(arena.cell_center(cell)))
            .collect();
        arena.walkable = walkable;
        arena
    }

    /// 障害物のない平原
    pub fn open(bounds: Bounds) -> Self {
        Self::new(bounds, Vec::new(), 1.0, 0.0)
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn obstacles(&self) -> &[BoxObstacle] {
        &self.obstacles
    }

    /// 点が歩行可能か（領域内かつ障害物の足元でない）
    pub fn is_walkable_point(&self, point: Vec3) -> bool {
        self.bounds.contains(point)
            && !self
                .obstacles
                .iter()
                .any(|obstacle| obstacle.footprint_contains(point, self.clearance))
    }

    fn cell_of(&self, point: Vec3) -> Option<Cell> {
        if !self.bounds.contains(point) {
            return None;
        }
        let col = (((point.x - self.bounds.min_x) / self.cell_size).floor() as i32).min(self.cols - 1);
        let row = (((point.y - self.bounds.min_y) / self.cell_size).floor() as i32).min(self.rows - 1);
        Some((col, row))
    }

    fn cell_center(&self, (col, row): Cell) -> Vec3 {
        Vec3::new(
            self.bounds.min_x + (col as f64 + 0.5) * self.cell_size,
            self.bounds.min_y + (row as f64 + 0.5) * self.cell_size,
            0.0,
        )
    }

    fn is_walkable_cell(&self, (col, row): Cell) -> bool {
        if col < 0 || row < 0 || col >= self.cols || row >= self.rows {
            return false;
        }
        self.walkable[(row * self.cols + col) as usize]
    }

    /// 角抜けを許さない8近傍
    fn neighbours(&self, (col, row): Cell) -> Vec<(Cell, u32)> {
        let mut result = Vec::with_capacity(8);
        for dc in -1..=1 {
            for dr in -1..=1 {
                if dc == 0 && dr == 0 {
                    continue;
                }
                let next = (col + dc, row + dr);
                if !self.is_walkable_cell(next) {
                    continue;
                }
                if dc != 0 && dr != 0 {
                    if !self.is_walkable_cell((col + dc, row)) || !self.is_walkable_cell((col, row + dr)) {
                        continue;
                    }
                    result.push((next, 14));
                } else {
                    result.push((next, 10));
                }
            }
        }
        result
    }

    /// 始点のセル（障害物際にいる場合は最寄りの歩行可能セル）
    fn start_cell(&self, point: Vec3) -> Option<Cell> {
        let cell = self.cell_of(point)?;
        if self.is_walkable_cell(cell) {
            return Some(cell);
        }
        let snapped = self.sample_position(point, self.cell_size * 2.0)?;
        self.cell_of(snapped).filter(|c| self.is_walkable_cell(*c))
    }

    /// 目的地に対応する到達セル
    ///
    /// 目的地のセル中心が障害物際で歩けない場合は、目的地まで直進できる
    /// 隣接セルを到達セルとします。
    fn goal_cells(&self, to: Vec3) -> Vec<Cell> {
        let Some(cell) = self.cell_of(to) else {
            return Vec::new();
        };
        if self.is_walkable_cell(cell) {
            return vec![cell];
        }
        let (col, row) = cell;
        (-1..=1)
            .flat_map(|dc| (-1..=1).map(move |dr| (col + dc, row + dr)))
            .filter(|next| *next != cell && self.is_walkable_cell(*next))
            .filter(|next| self.segment_clear(self.cell_center(*next), to))
            .collect()
    }

    /// XY平面の線分が歩行可能領域だけを通るか
    fn segment_clear(&self, from: Vec3, to: Vec3) -> bool {
        let length = from.distance_xy(&to);
        let step = (self.cell_size * 0.25).max(0.05);
        let samples = (length / step).ceil() as usize;
        (0..=samples).all(|i| {
            let t = if samples == 0 { 1.0 } else { i as f64 / samples as f64 };
            let point = from + (to - from) * t;
            // 始点自体は障害物際でも許容する
            i == 0 || self.is_walkable_point(point)
        })
    }
}

impl ILineOfSight for Arena {
    fn raycast(&self, query: &RayQuery) -> Option<RayHit> {
        let dir = query.direction.normalized();
        if dir.is_near_zero() {
            return None;
        }

        let mut best: Option<(f64, Collider)> = None;
        let mut consider = |t: f64, collider: Collider| {
            if t <= query.max_distance && best.is_none_or(|(best_t, _)| t < best_t) {
                best = Some((t, collider));
            }
        };

        if query.mask.contains(LayerMask::OBSTACLE) {
            for obstacle in &self.obstacles {
                if let Some(t) = obstacle.ray_intersection(query.origin, dir) {
                    consider(t, Collider::Obstacle);
                }
            }
        }
        if query.mask.contains(LayerMask::TARGET) {
            if let Some(body) = &self.target_body {
                if let Some(t) = ray_sphere(query.origin, dir, body) {
                    consider(t, Collider::Target);
                }
            }
        }
        if query.mask.contains(LayerMask::AGENT) {
            for (id, body) in &self.agent_bodies {
                if Some(*id) == query.ignore {
                    continue;
                }
                if let Some(t) = ray_sphere(query.origin, dir, body) {
                    consider(t, Collider::Agent(*id));
                }
            }
        }

        best.map(|(distance, collider)| RayHit {
            point: query.origin + dir * distance,
            distance,
            collider,
        })
    }

    fn sync_bodies(&mut self, target: Option<BodySphere>, agents: &[(AgentId, BodySphere)]) {
        self.target_body = target;
        self.agent_bodies.clear();
        self.agent_bodies.extend_from_slice(agents);
    }
}

impl INavMesh for Arena {
    fn path_exists(&self, from: Vec3, to: Vec3) -> bool {
        if !self.is_walkable_point(to) {
            return false;
        }
        if self.segment_clear(from, to) {
            return true;
        }
        let Some(start) = self.start_cell(from) else {
            return false;
        };
        let goals = self.goal_cells(to);
        if goals.is_empty() {
            return false;
        }
        bfs(
            &start,
            |cell| self.neighbours(*cell).into_iter().map(|(next, _)| next),
            |cell| goals.contains(cell),
        )
        .is_some()
    }

    fn find_path(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
        if !self.is_walkable_point(to) {
            return None;
        }
        if self.segment_clear(from, to) {
            return Some(vec![to]);
        }

        let start = self.start_cell(from)?;
        let goals = self.goal_cells(to);
        if goals.is_empty() {
            return None;
        }
        let (cells, _cost) = astar(
            &start,
            |cell| self.neighbours(*cell),
            |&(col, row)| {
                goals
                    .iter()
                    .map(|goal| {
                        let dx = (col - goal.0).unsigned_abs();
                        let dy = (row - goal.1).unsigned_abs();
                        10 * dx.max(dy) + 4 * dx.min(dy)
                    })
                    .min()
                    .unwrap_or(0)
            },
            |cell| goals.contains(cell),
        )?;

        // 始点セルは現在地なので除く。目的地のセルに着いた場合はその中心を正確な目的地に置き換える
        let mut corners: Vec<Vec3> = cells
            .iter()
            .skip(1)
            .map(|cell| self.cell_center(*cell))
            .collect();
        if cells.last().copied() == self.cell_of(to) {
            corners.pop();
        }
        corners.push(to);
        Some(corners)
    }

    fn sample_position(&self, position: Vec3, max_distance: f64) -> Option<Vec3> {
        let flat = position.flattened();
        if self.is_walkable_point(flat) {
            return Some(flat);
        }

        let reach = (max_distance / self.cell_size).ceil() as i32;
        let (col0, row0) = (
            ((flat.x - self.bounds.min_x) / self.cell_size).floor() as i32,
            ((flat.y - self.bounds.min_y) / self.cell_size).floor() as i32,
        );
        let mut best: Option<(f64, Vec3)> = None;
        for dc in -reach..=reach {
            for dr in -reach..=reach {
                let cell = (col0 + dc, row0 + dr);
                if !self.is_walkable_cell(cell) {
                    continue;
                }
                let center = self.cell_center(cell);
                let distance = center.distance_xy(&flat);
                if distance <= max_distance && best.is_none_or(|(d, _)| distance < d) {
                    best = Some((distance, center));
                }
            }
        }
        best.map(|(_, point)| point)
    }
}
