use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{
    common::{AgentId, AgentStatus, CoverId, Posture, Vec3},
    navigation::NavAgent,
    perception::{Perception, PerceptionTuning},
    traits::{DamageOutcome, IDamageable},
    weapon::{Weapon, WeaponProfile},
};

/// 行動の調整パラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BehaviorTuning {
    /// 巡回点への到着判定距離（m）
    pub patrol_arrival_m: f64,
    /// 通常移動速度（m/s）
    pub normal_speed: f64,
    /// 隊形位置からこれ以上離れたら追いつき速度にする（m）
    pub catch_up_distance_m: f64,
    pub catch_up_speed: f64,
    /// カバーへ向かう速度（m/s）
    pub move_to_cover_speed: f64,
    /// カバー地点への到着判定距離（m）
    pub cover_arrival_m: f64,
    /// カバーに隠れてから覗き撃ちを始めるまで（秒）
    pub peek_delay_s: f64,
    /// 覗き撃ちで射撃を続ける時間（秒）
    pub shoot_duration_s: f64,
    /// 覗き込み時の1ステップの横移動量（m）
    pub peek_step_m: f64,
    /// 横移動先を歩行可能点へ補正する範囲（m）
    pub peek_sample_radius_m: f64,
    /// 見回し動作の時間（秒）
    pub search_duration_s: f64,
    /// 見回しの振れ幅（度）
    pub search_sweep_deg: f64,
    /// 見回しの角速度（rad/s）
    pub search_sweep_rate: f64,
    /// 接近をやめて射撃を始める距離（m）
    pub stopping_distance_m: f64,
    /// 死亡からシミュレーション除去までの時間（秒）
    pub destroy_delay_s: f64,
}

impl Default for BehaviorTuning {
    fn default() -> Self {
        Self {
            patrol_arrival_m: 0.5,
            normal_speed: 2.0,
            catch_up_distance_m: 2.0,
            catch_up_speed: 6.0,
            move_to_cover_speed: 3.0,
            cover_arrival_m: 0.1,
            peek_delay_s: 1.5,
            shoot_duration_s: 2.0,
            peek_step_m: 0.1,
            peek_sample_radius_m: 10.0,
            search_duration_s: 3.0,
            search_sweep_deg: 45.0,
            search_sweep_rate: 1.5,
            stopping_distance_m: 10.0,
            destroy_delay_s: 2.0,
        }
    }
}

/// 隊形オフセット（指揮官のローカル座標系、右・前方向）
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct FormationOffset {
    pub right: f64,
    pub forward: f64,
}

/// 状態の種類（ログ・集計用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Patrol,
    FollowCommander,
    Attack,
    MoveToCover,
    BehindCover,
    PeekShoot,
    Search,
    Death,
}

impl StateKind {
    pub const ALL: [StateKind; 8] = [
        StateKind::Patrol,
        StateKind::FollowCommander,
        StateKind::Attack,
        StateKind::MoveToCover,
        StateKind::BehindCover,
        StateKind::PeekShoot,
        StateKind::Search,
        StateKind::Death,
    ];
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Patrol => "Patrol",
            StateKind::FollowCommander => "FollowCommander",
            StateKind::Attack => "Attack",
            StateKind::MoveToCover => "MoveToCover",
            StateKind::BehindCover => "BehindCover",
            StateKind::PeekShoot => "PeekShoot",
            StateKind::Search => "Search",
            StateKind::Death => "Death",
        };
        f.write_str(name)
    }
}

/// エージェントの現在状態
///
/// 各状態が必要とするデータ（タイマー・対象カバー等）を持つタグ付き列挙型です。
/// 状態の置き換えは`World::change_state`だけが行います。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AgentState {
    Patrol,
    FollowCommander,
    Attack,
    MoveToCover {
        cover: CoverId,
    },
    BehindCover {
        cover: CoverId,
        /// カバーに入ってからの経過時間
        dwell: f64,
    },
    PeekShoot {
        cover: CoverId,
        /// 覗き込む横方向（カバーからターゲットへの軸に垂直）
        lateral: Vec3,
        /// 射線確保後の射撃経過時間
        shoot_timer: f64,
    },
    Search {
        position: Vec3,
        /// 見回しの経過時間
        sweep_timer: f64,
        /// 見回し開始時の向き
        base_yaw: Option<f64>,
    },
    Death {
        elapsed: f64,
    },
}

impl AgentState {
    pub fn search(position: Vec3) -> Self {
        AgentState::Search { position, sweep_timer: 0.0, base_yaw: None }
    }

    pub fn behind_cover(cover: CoverId) -> Self {
        AgentState::BehindCover { cover, dwell: 0.0 }
    }

    pub fn kind(&self) -> StateKind {
        match self {
            AgentState::Patrol => StateKind::Patrol,
            AgentState::FollowCommander => StateKind::FollowCommander,
            AgentState::Attack => StateKind::Attack,
            AgentState::MoveToCover { .. } => StateKind::MoveToCover,
            AgentState::BehindCover { .. } => StateKind::BehindCover,
            AgentState::PeekShoot { .. } => StateKind::PeekShoot,
            AgentState::Search { .. } => StateKind::Search,
            AgentState::Death { .. } => StateKind::Death,
        }
    }

    /// 交戦グループ（Attack/MoveToCover/BehindCover/PeekShoot）か
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            AgentState::Attack
                | AgentState::MoveToCover { .. }
                | AgentState::BehindCover { .. }
                | AgentState::PeekShoot { .. }
        )
    }

    /// 有効なカバー占有を前提とする状態なら、そのカバー
    pub fn required_cover(&self) -> Option<CoverId> {
        match self {
            AgentState::MoveToCover { cover }
            | AgentState::BehindCover { cover, .. }
            | AgentState::PeekShoot { cover, .. } => Some(*cover),
            _ => None,
        }
    }
}

/// スポーン時に与えるエージェントの設定
#[derive(Debug, Clone)]
pub struct AgentSpawn {
    pub name: String,
    pub position: Vec3,
    pub yaw_deg: f64,
    pub health: f64,
    pub waypoints: Vec<Vec3>,
    pub formation_offset: FormationOffset,
    pub behavior: BehaviorTuning,
    pub perception: PerceptionTuning,
    pub weapon: WeaponProfile,
}

impl AgentSpawn {
    pub fn at(name: &str, position: Vec3) -> Self {
        Self {
            name: name.to_string(),
            position,
            yaw_deg: 0.0,
            health: 100.0,
            waypoints: Vec::new(),
            formation_offset: FormationOffset::default(),
            behavior: BehaviorTuning::default(),
            perception: PerceptionTuning::default(),
            weapon: WeaponProfile::default(),
        }
    }
}

/// AI制御のエージェント
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub nav: NavAgent,
    health: f64,
    pub max_health: f64,
    pub status: AgentStatus,
    pub state: AgentState,
    pub waypoints: Vec<Vec3>,
    /// 巡回で現在向かっている巡回点の添字
    pub current_waypoint: usize,
    /// 指揮官（随伴者のみ）
    pub commander: Option<AgentId>,
    pub formation_offset: FormationOffset,
    pub perception: Perception,
    pub weapon: Weapon,
    /// 占有中のカバー
    pub held_cover: Option<CoverId>,
    pub posture: Posture,
    /// このティックで既に状態遷移したか（ステップ開始時にクリア）
    pub transitioned_this_tick: bool,
    /// これまでの状態遷移回数
    pub transition_count: usize,
    pub tuning: BehaviorTuning,
}

impl Agent {
    /// エージェントを生成する（初期状態は呼び出し側が`default_state`で決める）
    pub fn new(id: AgentId, spawn: AgentSpawn, commander: Option<AgentId>) -> Self {
        Self {
            id,
            name: spawn.name,
            nav: NavAgent::new(spawn.position, spawn.yaw_deg, spawn.behavior.normal_speed),
            health: spawn.health,
            max_health: spawn.health,
            status: AgentStatus::Active,
            state: AgentState::Patrol,
            waypoints: spawn.waypoints,
            current_waypoint: 0,
            commander,
            formation_offset: spawn.formation_offset,
            perception: Perception::new(spawn.perception),
            weapon: Weapon::new(spawn.weapon),
            held_cover: None,
            posture: Posture::Standing,
            transitioned_this_tick: false,
            transition_count: 0,
            tuning: spawn.behavior,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.nav.position()
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// 交戦していないときの既定状態
    ///
    /// 巡回点があればPatrol、指揮官がいればFollowCommander、
    /// どちらもなければその場で待機するPatrol。
    pub fn default_state(&self) -> AgentState {
        if !self.waypoints.is_empty() {
            AgentState::Patrol
        } else if self.commander.is_some() {
            AgentState::FollowCommander
        } else {
            AgentState::Patrol
        }
    }

    /// 最終発見位置があればSearch、なければ既定状態
    pub fn search_or_default(&self) -> AgentState {
        match self.perception.last_seen_position() {
            Some(position) => AgentState::search(position),
            None => self.default_state(),
        }
    }

    /// 射撃・視線の基準点
    pub fn eye(&self) -> Vec3 {
        self.position() + Vec3::UP * self.perception.tuning.eye_height_m
    }
}

impl IDamageable for Agent {
    fn take_damage(&mut self, amount: f64) -> DamageOutcome {
        if !self.is_active() {
            return DamageOutcome::AlreadyDead;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
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
    fn test_default_state_selection() {
        let mut spawn = AgentSpawn::at("lead", Vec3::ZERO);
        spawn.waypoints = vec![Vec3::new(5.0, 0.0, 0.0)];
        let commander = Agent::new(AgentId(0), spawn, None);
        assert_eq!(commander.default_state(), AgentState::Patrol);

        let follower = Agent::new(AgentId(1), AgentSpawn::at("f", Vec3::ZERO), Some(AgentId(0)));
        assert_eq!(follower.default_state(), AgentState::FollowCommander);

        let loner = Agent::new(AgentId(2), AgentSpawn::at("l", Vec3::ZERO), None);
        assert_eq!(loner.default_state(), AgentState::Patrol);
        assert_eq!(loner.search_or_default(), AgentState::Patrol);
    }

    #[test]
    fn test_behavior_defaults() {
        let tuning = BehaviorTuning::default();
        assert_eq!(tuning.peek_step_m, 0.1);
        assert_eq!(tuning.peek_sample_radius_m, 10.0);
        assert_eq!(tuning.stopping_distance_m, 10.0);
        assert_eq!(tuning.destroy_delay_s, 2.0);
    }

    #[test]
    fn test_engaged_group() {
        let cover = CoverId(0);
        assert!(AgentState::Attack.is_engaged());
        assert!(AgentState::MoveToCover { cover }.is_engaged());
        assert!(AgentState::behind_cover(cover).is_engaged());
        assert!(!AgentState::search(Vec3::ZERO).is_engaged());
        assert!(!AgentState::Death { elapsed: 0.0 }.is_engaged());
        assert_eq!(AgentState::behind_cover(cover).required_cover(), Some(cover));
        assert_eq!(AgentState::Attack.required_cover(), None);
    }

    #[test]
    fn test_damage_reduces_health() {
        let mut agent = Agent::new(AgentId(0), AgentSpawn::at("a", Vec3::ZERO), None);
        assert_eq!(agent.take_damage(40.0), DamageOutcome::Survived(60.0));
        assert_eq!(agent.take_damage(60.0), DamageOutcome::Killed);
        assert!(!agent.is_alive());
    }
}
