use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::models::traits::{FireOutcome, IWeapon};

/// 時刻比較の許容誤差（秒）
const TIME_EPSILON: f64 = 1e-9;

/// 武器の性能パラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WeaponProfile {
    pub name: String,
    /// 毎分発射数
    pub fire_rate_rpm: u32,
    /// 1発あたりのダメージ
    pub damage: f64,
    /// 敵AI用のダメージ倍率
    pub damage_multiplier: f64,
    pub magazine_size: u32,
    pub reload_time_s: f64,
    /// 予備弾数（弾倉内を除く）
    pub reserve_ammo: u32,
}

impl Default for WeaponProfile {
    fn default() -> Self {
        Self {
            name: "rifle".to_string(),
            fire_rate_rpm: 600,
            damage: 20.0,
            damage_multiplier: 0.5,
            magazine_size: 30,
            reload_time_s: 2.0,
            reserve_ammo: 120,
        }
    }
}

/// 発射記録
#[derive(Debug, Clone)]
pub struct ShotRecord {
    pub timestamp: f64,
    pub ammo_after: u32,
}

/// 射撃統計情報
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShotStats {
    pub shots_fired: usize,
    pub reloads: usize,
    pub ammo_in_mag: u32,
    pub reserve_ammo: u32,
}

/// エージェントの武器
///
/// 連射レート（RPM）とリロード時間で発射を制限します。弾道は扱わず、
/// 命中判定は呼び出し側（ワールド）が行います。
#[derive(Debug, Clone)]
pub struct Weapon {
    pub profile: WeaponProfile,
    ammo_in_mag: u32,
    reserve_ammo: u32,
    last_shot_time: Option<f64>,
    last_reload_time: Option<f64>,
    reload_count: usize,
    shot_history: Vec<ShotRecord>,
}

impl Weapon {
    pub fn new(profile: WeaponProfile) -> Self {
        Self {
            ammo_in_mag: profile.magazine_size,
            reserve_ammo: profile.reserve_ammo,
            profile,
            last_shot_time: None,
            last_reload_time: None,
            reload_count: 0,
            shot_history: Vec::new(),
        }
    }

    /// 発射間隔（秒）
    pub fn time_between_shots(&self) -> f64 {
        if self.profile.fire_rate_rpm == 0 {
            f64::INFINITY
        } else {
            60.0 / self.profile.fire_rate_rpm as f64
        }
    }

    /// 命中時に与えるダメージ
    pub fn effective_damage(&self) -> f64 {
        self.profile.damage * self.profile.damage_multiplier
    }

    pub fn shot_stats(&self) -> ShotStats {
        ShotStats {
            shots_fired: self.shot_history.len(),
            reloads: self.reload_count,
            ammo_in_mag: self.ammo_in_mag,
            reserve_ammo: self.reserve_ammo,
        }
    }

    /// 最近の発射記録を取得
    pub fn recent_shots(&self, count: usize) -> &[ShotRecord] {
        let start = self.shot_history.len().saturating_sub(count);
        &self.shot_history[start..]
    }
}

impl IWeapon for Weapon {
    fn fire(&mut self, now: f64) -> FireOutcome {
        if self.is_reloading(now) {
            return FireOutcome::Reloading;
        }

        if self.ammo_in_mag == 0 {
            if self.reserve_ammo == 0 {
                return FireOutcome::OutOfAmmo;
            }
            self.reload(now);
            return FireOutcome::Empty;
        }

        if self.cooldown_remaining(now) > TIME_EPSILON {
            return FireOutcome::Cooldown;
        }

        self.ammo_in_mag -= 1;
        self.last_shot_time = Some(now);
        self.shot_history.push(ShotRecord { timestamp: now, ammo_after: self.ammo_in_mag });
        trace!(weapon = %self.profile.name, ammo = self.ammo_in_mag, "WEAPON_FIRED: 発射しました");

        FireOutcome::Fired { damage: self.effective_damage() }
    }

    fn reload(&mut self, now: f64) {
        if self.reserve_ammo == 0 {
            return;
        }
        let needed = self.profile.magazine_size.saturating_sub(self.ammo_in_mag);
        let loaded = needed.min(self.reserve_ammo);
        self.ammo_in_mag += loaded;
        self.reserve_ammo -= loaded;
        self.last_reload_time = Some(now);
        self.reload_count += 1;
        debug!(
            weapon = %self.profile.name,
            ammo = self.ammo_in_mag,
            reserve = self.reserve_ammo,
            "WEAPON_RELOAD: リロードを開始しました"
        );
    }

    fn ammo_in_mag(&self) -> u32 {
        self.ammo_in_mag
    }

    fn reserve_ammo(&self) -> u32 {
        self.reserve_ammo
    }

    fn is_reloading(&self, now: f64) -> bool {
        self.last_reload_time
            .is_some_and(|t| now - t < self.profile.reload_time_s - TIME_EPSILON)
    }

    fn cooldown_remaining(&self, now: f64) -> f64 {
        match self.last_shot_time {
            Some(t) => (self.time_between_shots() - (now - t)).max(0.0),
            None => 0.0,
        }
    }
}
