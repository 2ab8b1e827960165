use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{
    common::Vec3,
    traits::{BodySphere, DamageOutcome, IDamageable},
    weapon::{Weapon, WeaponProfile},
};

/// ターゲットの反撃設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetWeaponConfig {
    /// 反撃を行う最大距離（m）
    pub engage_range_m: f64,
    #[serde(default)]
    pub profile: WeaponProfile,
}

/// 分隊が交戦する敵対ターゲット
///
/// 巡回ルートを一定速度でループ移動します。体力が0になると死亡し、
/// 以降は知覚に対して存在しない（None）ものとして扱われます。
#[derive(Debug, Clone)]
pub struct Target {
    pub position: Vec3,
    /// 巡回ルート（空なら静止）
    pub route: Vec<Vec3>,
    /// 次に向かうルート点
    pub current_leg: usize,
    /// 移動速度（m/s）
    pub speed: f64,
    health: f64,
    pub max_health: f64,
    /// 衝突判定球の半径（m）
    pub body_radius: f64,
    /// 胸の高さ（m）
    pub chest_height: f64,
    pub weapon: Option<Weapon>,
    pub engage_range: f64,
}

impl Target {
    pub fn new(position: Vec3, route: Vec<Vec3>, speed: f64, health: f64) -> Self {
        Self {
            position,
            route,
            current_leg: 0,
            speed,
            health,
            max_health: health,
            body_radius: 0.5,
            chest_height: 1.0,
            weapon: None,
            engage_range: 0.0,
        }
    }

    /// 反撃用の武器を持たせる
    pub fn with_weapon(mut self, config: &TargetWeaponConfig) -> Self {
        self.weapon = Some(Weapon::new(config.profile.clone()));
        self.engage_range = config.engage_range_m;
        self
    }

    /// 生存中ならその位置
    pub fn visible_position(&self) -> Option<Vec3> {
        self.is_alive().then_some(self.position)
    }

    pub fn chest(&self) -> Vec3 {
        self.position + Vec3::UP * self.chest_height
    }

    /// 衝突判定球（死亡時はNone）
    pub fn body(&self) -> Option<BodySphere> {
        self.is_alive().then(|| BodySphere {
            center: self.chest(),
            radius: self.body_radius,
        })
    }

    /// ルートに沿って移動
    pub fn tick(&mut self, dt: f64) {
        if !self.is_alive() || self.route.is_empty() || self.speed <= 0.0 {
            return;
        }

        let mut budget = self.speed * dt;
        // ルート1周分より多くは処理しない
        let mut legs_left = self.route.len() + 1;
        while budget > 0.0 && legs_left > 0 {
            let next = self.route[self.current_leg % self.route.len()];
            let distance = self.position.distance(&next);
            if distance <= budget {
                self.position = next;
                budget -= distance;
                self.current_leg = (self.current_leg + 1) % self.route.len();
                legs_left -= 1;
            } else {
                self.position = self.position + (next - self.position) * (budget / distance);
                budget = 0.0;
            }
        }
    }
}

impl IDamageable for Target {
    fn take_damage(&mut self, amount: f64) -> DamageOutcome {
        if !self.is_alive() {
            return DamageOutcome::AlreadyDead;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
            info!(position = %self.position, "TARGET_KILLED: ターゲットを撃破しました");
            DamageOutcome::Killed
        } else {
            DamageOutcome::Survived(self.health)
        }
    }

    fn health(&self) -> f64 {
        self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_loops() {
        let route = vec![Vec3::new(2.0, 0.0, 0.0), Vec3::new(2.0, 2.0, 0.0), Vec3::ZERO];
        let mut target = Target::new(Vec3::ZERO, route, 1.0, 100.0);

        target.tick(3.0);
        assert_eq!(target.position, Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(target.current_leg, 1);

        // 残り1 + 対角2.83 で始点へ戻り、次の区間へ入る
        target.tick(4.0);
        assert_eq!(target.current_leg, 0);
        assert!(target.position.x > 0.0 && target.position.y.abs() < 1e-9);
    }

    #[test]
    fn test_dead_target_is_absent() {
        let mut target = Target::new(Vec3::ZERO, Vec::new(), 0.0, 30.0);
        assert_eq!(target.take_damage(10.0), DamageOutcome::Survived(20.0));
        assert!(target.visible_position().is_some());

        assert_eq!(target.take_damage(25.0), DamageOutcome::Killed);
        assert_eq!(target.take_damage(5.0), DamageOutcome::AlreadyDead);
        assert!(target.visible_position().is_none());
        assert!(target.body().is_none());
    }
}
