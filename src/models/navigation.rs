use std::collections::VecDeque;

use crate::models::{
    common::{Vec3, forward_from_yaw, yaw_towards},
    traits::INavMesh,
};

/// 同一目的地とみなす距離（これ未満の変更では再計画しない）
const REPLAN_EPSILON: f64 = 0.05;

/// ナビゲーションエージェント
///
/// エージェントの位置・向き・速度を所有し、目的地までの経路（折れ点列）に沿って
/// 移動させます。AIの各状態はこの構造体を通してのみ移動を指示します。
#[derive(Debug, Clone)]
pub struct NavAgent {
    position: Vec3,
    /// 方位角（度）
    yaw_deg: f64,
    velocity: Vec3,
    speed: f64,
    destination: Option<Vec3>,
    corners: VecDeque<Vec3>,
    /// 最後の経路計画が成功したか
    path_valid: bool,
    is_stopped: bool,
}

impl NavAgent {
    pub fn new(position: Vec3, yaw_deg: f64, speed: f64) -> Self {
        Self {
            position,
            yaw_deg,
            velocity: Vec3::ZERO,
            speed,
            destination: None,
            corners: VecDeque::new(),
            path_valid: false,
            is_stopped: false,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn yaw_deg(&self) -> f64 {
        self.yaw_deg
    }

    pub fn forward(&self) -> Vec3 {
        forward_from_yaw(self.yaw_deg)
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.max(0.0);
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.is_stopped = stopped;
        if stopped {
            self.velocity = Vec3::ZERO;
        }
    }

    pub fn destination(&self) -> Option<Vec3> {
        self.destination
    }

    /// 目的地を設定し、必要なら経路を再計画する
    ///
    /// # 戻り値
    ///
    /// 目的地までの経路が存在する場合はtrue
    pub fn set_destination<M: INavMesh + ?Sized>(&mut self, destination: Vec3, mesh: &M) -> bool {
        if let Some(current) = self.destination {
            if current.distance(&destination) < REPLAN_EPSILON {
                return self.path_valid;
            }
        }

        self.destination = Some(destination);
        self.corners.clear();
        match mesh.find_path(self.position, destination) {
            Some(corners) => {
                self.corners.extend(corners);
                self.path_valid = true;
            }
            None => {
                self.path_valid = false;
            }
        }
        self.path_valid
    }

    /// 目的地と経路を破棄する
    pub fn clear_destination(&mut self) {
        self.destination = None;
        self.corners.clear();
        self.path_valid = false;
        self.velocity = Vec3::ZERO;
    }

    /// 未消化の経路があるか
    pub fn has_path(&self) -> bool {
        !self.corners.is_empty()
    }

    /// 経路に沿った残り距離（経路がなければ0）
    pub fn remaining_distance(&self) -> f64 {
        let mut total = 0.0;
        let mut from = self.position;
        for corner in &self.corners {
            total += from.distance(corner);
            from = *corner;
        }
        total
    }

    /// 指定点の方向を向く（水平回転のみ）
    pub fn face_towards(&mut self, point: Vec3) {
        if let Some(yaw) = yaw_towards(self.position, point) {
            self.yaw_deg = yaw;
        }
    }

    pub fn set_yaw(&mut self, yaw_deg: f64) {
        self.yaw_deg = yaw_deg;
    }

    /// 1ティック分移動する
    pub fn advance(&mut self, dt: f64) {
        if self.is_stopped || self.corners.is_empty() || dt <= 0.0 {
            self.velocity = Vec3::ZERO;
            return;
        }

        let start = self.position;
        let mut budget = self.speed * dt;
        while budget > 0.0 {
            let Some(next) = self.corners.front().copied() else {
                break;
            };
            let distance = self.position.distance(&next);
            if distance <= budget {
                // 折れ点に到達
                self.position = next;
                budget -= distance;
                self.corners.pop_front();
            } else {
                self.position = self.position + (next - self.position) * (budget / distance);
                budget = 0.0;
            }
        }

        let moved = self.position - start;
        self.velocity = moved * (1.0 / dt);
        if let Some(yaw) = yaw_towards(start, self.position) {
            self.yaw_deg = yaw;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 常に直線経路を返すナビメッシュ
    struct OpenField;

    impl INavMesh for OpenField {
        fn path_exists(&self, _from: Vec3, _to: Vec3) -> bool {
            true
        }

        fn find_path(&self, _from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
            Some(vec![to])
        }

        fn sample_position(&self, position: Vec3, _max_distance: f64) -> Option<Vec3> {
            Some(position)
        }
    }

    /// どこにも行けないナビメッシュ
    struct Blocked;

    impl INavMesh for Blocked {
        fn path_exists(&self, _from: Vec3, _to: Vec3) -> bool {
            false
        }

        fn find_path(&self, _from: Vec3, _to: Vec3) -> Option<Vec<Vec3>> {
            None
        }

        fn sample_position(&self, _position: Vec3, _max_distance: f64) -> Option<Vec3> {
            None
        }
    }

    #[test]
    fn test_advance_snaps_onto_destination() {
        let mut nav = NavAgent::new(Vec3::ZERO, 0.0, 2.0);
        assert!(nav.set_destination(Vec3::new(1.0, 0.0, 0.0), &OpenField));
        assert!((nav.remaining_distance() - 1.0).abs() < 1e-12);

        nav.advance(1.0);
        assert_eq!(nav.position(), Vec3::new(1.0, 0.0, 0.0));
        assert!(!nav.has_path());
        assert_eq!(nav.remaining_distance(), 0.0);
    }

    #[test]
    fn test_stopped_agent_does_not_move() {
        let mut nav = NavAgent::new(Vec3::ZERO, 0.0, 2.0);
        nav.set_destination(Vec3::new(10.0, 0.0, 0.0), &OpenField);
        nav.set_stopped(true);
        nav.advance(0.5);
        assert_eq!(nav.position(), Vec3::ZERO);
        assert!(nav.velocity().is_near_zero());

        nav.set_stopped(false);
        nav.advance(0.5);
        assert!((nav.position().x - 1.0).abs() < 1e-12);
        assert!((nav.velocity().length() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unreachable_destination_has_no_path() {
        let mut nav = NavAgent::new(Vec3::ZERO, 0.0, 2.0);
        assert!(!nav.set_destination(Vec3::new(5.0, 5.0, 0.0), &Blocked));
        assert!(!nav.has_path());
        nav.advance(1.0);
        assert_eq!(nav.position(), Vec3::ZERO);
    }

    #[test]
    fn test_movement_turns_agent() {
        let mut nav = NavAgent::new(Vec3::ZERO, 0.0, 1.0);
        nav.set_destination(Vec3::new(0.0, 3.0, 0.0), &OpenField);
        nav.advance(1.0);
        assert!((nav.yaw_deg() - 90.0).abs() < 1e-9);
    }
}
