// 基本的なデータ型と数学ユーティリティ
pub mod common;

// AIコアが要求するコラボレーターのインターフェース（trait）定義
pub mod traits;

// 空間クエリの実装（移動・地形）
pub mod navigation;
pub mod arena;

// 各ユニットの実装
pub mod perception;
pub mod cover;
pub mod weapon;
pub mod squad;
pub mod target;

// エージェントと状態機械
pub mod agent;
pub mod state_machine;
pub mod world;

// 便利な re-export
pub use common::*;
pub use traits::*;
pub use agent::{Agent, AgentSpawn, AgentState, BehaviorTuning, FormationOffset, StateKind};
pub use arena::{Arena, BoxObstacle, Bounds};
pub use cover::{Concealment, CoverPoint, CoverRegistry};
pub use navigation::NavAgent;
pub use perception::{DetectionEvent, DetectionEventType, DetectionStats, Perception, PerceptionSnapshot, PerceptionTuning};
pub use squad::{SquadCoordinator, SquadRegistry, SquadTuning};
pub use target::Target;
pub use weapon::{ShotRecord, ShotStats, Weapon, WeaponProfile};
pub use world::{World, WorldStats};
