use bitflags::bitflags;

use crate::models::common::{AgentId, Vec3};

bitflags! {
    /// レイキャストが衝突判定を行うレイヤー
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct LayerMask: u8 {
        const OBSTACLE = 1 << 0;
        const TARGET   = 1 << 1;
        const AGENT    = 1 << 2;
    }
}

/// レイキャスト要求
#[derive(Debug, Clone, Copy)]
pub struct RayQuery {
    pub origin: Vec3,
    /// 正規化されていなくてもよい（実装側で正規化する）
    pub direction: Vec3,
    pub max_distance: f64,
    pub mask: LayerMask,
    /// 自分自身のジオメトリを無視するためのID
    pub ignore: Option<AgentId>,
}

/// レイが最初に当たったコライダー
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Collider {
    Obstacle,
    Target,
    Agent(AgentId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub point: Vec3,
    pub distance: f64,
    pub collider: Collider,
}

/// 衝突判定用の球体（ターゲットや各エージェントの体）
#[derive(Debug, Clone, Copy)]
pub struct BodySphere {
    pub center: Vec3,
    pub radius: f64,
}

/// 視線判定コラボレーター
pub trait ILineOfSight {
    /// レイキャスト（当たらなければNone）
    fn raycast(&self, query: &RayQuery) -> Option<RayHit>;

    /// 毎ステップ、ターゲットとエージェントの現在位置を通知する
    fn sync_bodies(&mut self, _target: Option<BodySphere>, _agents: &[(AgentId, BodySphere)]) {}
}

/// 経路探索コラボレーター
pub trait INavMesh {
    /// 完全な経路が存在するか
    fn path_exists(&self, from: Vec3, to: Vec3) -> bool;

    /// 経路の折れ点列（終点を含む）。到達不能ならNone
    fn find_path(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>>;

    /// `position`から`max_distance`以内で最も近い歩行可能点
    fn sample_position(&self, position: Vec3, max_distance: f64) -> Option<Vec3>;
}

/// AIコアが要求する空間クエリ一式
pub trait ISpatialQuery: ILineOfSight + INavMesh {}

impl<T: ILineOfSight + INavMesh> ISpatialQuery for T {}

/// 射撃結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FireOutcome {
    /// 1発発射した
    Fired { damage: f64 },
    /// リロード中
    Reloading,
    /// 弾倉が空だったのでリロードを開始した
    Empty,
    /// 連射レート制限中
    Cooldown,
    /// 予備弾もない
    OutOfAmmo,
}

/// 武器コラボレーター（エージェント毎）
pub trait IWeapon {
    fn fire(&mut self, now: f64) -> FireOutcome;

    fn reload(&mut self, now: f64);

    fn ammo_in_mag(&self) -> u32;

    fn reserve_ammo(&self) -> u32;

    fn is_reloading(&self, now: f64) -> bool;

    /// 次弾発射可能までの残り時間（秒）
    fn cooldown_remaining(&self, now: f64) -> f64;
}

/// ダメージ結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamageOutcome {
    /// 生存（残り体力）
    Survived(f64),
    /// このダメージで死亡した
    Killed,
    /// 既に死亡していた
    AlreadyDead,
}

/// ダメージを受けられるもの
pub trait IDamageable {
    fn take_damage(&mut self, amount: f64) -> DamageOutcome;

    fn health(&self) -> f64;

    fn is_alive(&self) -> bool {
        self.health() > 0.0
    }
}
