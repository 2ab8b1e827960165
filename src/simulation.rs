//! # Simulation モジュール
//!
//! 分隊AIシミュレーションの中核となるシミュレーションエンジンを提供します。
//!
//! シナリオ設定から地形・カバーポイント・ターゲット・AIエージェントを構築し、
//! 固定時間刻み（Δt）のメインループでワールドを進めます。
//!
//! ## シミュレーション処理順序
//!
//! 各時間刻みにおいて、以下の順序で処理が実行されます：
//!
//! 1. **遷移フラグのクリア**: 1ティック1遷移の判定をリセット
//! 2. **ターゲット処理**: ルートに沿った移動
//! 3. **衝突体の同期**: 視線判定用にターゲットと各エージェントの位置を通知
//! 4. **エージェント処理**: ID順に知覚 → 遷移ドライバ → 状態処理
//! 5. **ターゲットの反撃**
//! 6. **移動処理**: 各エージェントの経路追従
//! 7. **除去処理**: 破棄時刻を過ぎたエージェントの除去
//!
//! ## 使用例
//!
//! ```no_run
//! use squadsim::scenario::ScenarioConfig;
//! use squadsim::simulation::SimulationEngine;
//!
//! let config = ScenarioConfig::from_file("scenarios/ambush.yaml")?;
//! let mut engine = SimulationEngine::new(config, 1);
//! engine.initialize()?;
//! engine.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::models::{
    agent::{AgentSpawn, StateKind},
    arena::{Arena, BoxObstacle, Bounds},
    common::AgentId,
    target::Target,
    traits::IDamageable,
    world::World,
};
use crate::scenario::{AgentConfig, ScenarioConfig, ScenarioError};

/// 暴走防止のステップ上限
const MAX_STEPS: u64 = 1_000_000;

/// シミュレーションエラー
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("エージェント {agent} の指揮官 {commander} が見つかりません")]
    UnknownCommander { agent: String, commander: String },
    #[error("エージェントIDが重複しています: {0}")]
    DuplicateAgent(String),
    #[error("シミュレーションが初期化されていません")]
    NotInitialized,
}

/// シミュレーション結果の統計
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    pub steps: u64,
    pub elapsed_s: f64,
    pub shots_fired: usize,
    pub hits: usize,
    pub target_shots: usize,
    pub agents_killed: usize,
    pub promotions: usize,
    pub alerts: usize,
    pub transitions: usize,
    pub target_alive: bool,
    pub census: Vec<(StateKind, usize)>,
}

impl SimulationStats {
    pub fn print_summary(&self) {
        println!("=== シミュレーション結果 ===");
        println!("経過時間: {:.1}秒 ({}ステップ)", self.elapsed_s, self.steps);
        let accuracy = if self.shots_fired > 0 {
            self.hits as f64 / self.shots_fired as f64 * 100.0
        } else {
            0.0
        };
        println!("射撃: {}発 / 命中: {}発 ({:.1}%)", self.shots_fired, self.hits, accuracy);
        println!("ターゲットの反撃: {}発", self.target_shots);
        println!("戦死: {}体  指揮官昇格: {}回  分隊警報: {}回", self.agents_killed, self.promotions, self.alerts);
        println!("状態遷移: {}回", self.transitions);
        println!("ターゲット: {}", if self.target_alive { "生存" } else { "撃破" });
        println!("最終状態:");
        for (kind, count) in &self.census {
            if *count > 0 {
                println!("  {}: {}体", kind, count);
            }
        }
    }
}

pub struct SimulationEngine {
    pub current_time: f64,
    pub dt: f64,
    pub max_time: f64,
    pub seed: u64,
    pub step_count: u64,

    pub world: World<Arena>,
    /// シナリオ上のIDからワールド内のハンドルへの対応
    pub agent_ids: HashMap<String, AgentId>,
    initialized: bool,

    pub scenario_config: ScenarioConfig,
    pub verbose_level: u8,
}

impl SimulationEngine {
    pub fn new(scenario: ScenarioConfig, verbose_level: u8) -> Self {
        let region = scenario.world.region_rect;
        let bounds = Bounds {
            min_x: region.xmin_m,
            max_x: region.xmax_m,
            min_y: region.ymin_m,
            max_y: region.ymax_m,
        };
        let obstacles = scenario
            .world
            .obstacles
            .iter()
            .map(|o| BoxObstacle::new(o.min.to_vec3(), o.max.to_vec3()))
            .collect();
        let arena = Arena::new(bounds, obstacles, scenario.world.nav_cell_m, scenario.world.agent_clearance_m);

        Self {
            current_time: 0.0,
            dt: scenario.sim.dt_s,
            max_time: scenario.sim.t_max_s,
            seed: scenario.sim.seed,
            step_count: 0,
            world: World::new(arena),
            agent_ids: HashMap::new(),
            initialized: false,
            scenario_config: scenario,
            verbose_level,
        }
    }

    pub fn initialize(&mut self) -> Result<(), SimulationError> {
        if self.initialized {
            return Ok(());
        }
        if self.verbose_level > 0 {
            info!("シミュレーションエンジンを初期化中...");
        }

        self.scenario_config.validate()?;
        self.initialize_target();
        self.initialize_cover_points();
        self.initialize_agents()?;
        self.initialized = true;

        if self.verbose_level > 0 {
            info!("初期化完了:");
            info!("  エージェント: {}体", self.world.active_agent_count());
            info!("  分隊: {}", self.world.squads.len());
            info!("  カバーポイント: {}箇所", self.world.covers.len());
            info!("  障害物: {}個", self.world.spatial().obstacles().len());
        }

        Ok(())
    }

    fn initialize_target(&mut self) {
        let Some(config) = &self.scenario_config.target else {
            return;
        };
        let route = config.route.iter().map(|p| p.to_vec3()).collect();
        let mut target = Target::new(config.position.to_vec3(), route, config.speed_mps, config.health);
        target.body_radius = config.body_radius_m;
        if let Some(weapon) = &config.weapon {
            target = target.with_weapon(weapon);
        }

        if self.verbose_level > 1 {
            debug!("ターゲット初期化: 位置 {} ルート {}点", target.position, target.route.len());
        }
        self.world.set_target(target);
    }

    fn initialize_cover_points(&mut self) {
        for cover in &self.scenario_config.cover_points {
            let id = self.world.register_cover(cover.position.to_vec3(), cover.concealment);
            if self.verbose_level > 1 {
                debug!("カバーポイント初期化: {} ({:?})", id, cover.concealment);
            }
        }
    }

    /// 指揮官を先に、随伴者を後に生成する
    fn initialize_agents(&mut self) -> Result<(), SimulationError> {
        let tolerance = self.scenario_config.defaults.squad.formation_tolerance;
        let (leaders, followers): (Vec<&AgentConfig>, Vec<&AgentConfig>) = self
            .scenario_config
            .agents
            .iter()
            .partition(|a| a.commander.is_none());

        for config in leaders.into_iter().chain(followers) {
            if self.agent_ids.contains_key(&config.id) {
                return Err(SimulationError::DuplicateAgent(config.id.clone()));
            }
            let commander = match &config.commander {
                Some(name) => Some(*self.agent_ids.get(name).ok_or_else(|| SimulationError::UnknownCommander {
                    agent: config.id.clone(),
                    commander: name.clone(),
                })?),
                None => None,
            };

            let defaults = &self.scenario_config.defaults;
            let spawn = AgentSpawn {
                name: config.id.clone(),
                position: config.position.to_vec3(),
                yaw_deg: config.yaw_deg,
                health: config.health,
                waypoints: config.waypoints.iter().map(|p| p.to_vec3()).collect(),
                formation_offset: config.formation_offset,
                behavior: config.behavior.clone().unwrap_or_else(|| defaults.behavior.clone()),
                perception: config.perception.clone().unwrap_or_else(|| defaults.perception.clone()),
                weapon: config.weapon.clone().unwrap_or_else(|| defaults.weapon.clone()),
            };
            let id = self.world.spawn(spawn, commander, tolerance);
            self.agent_ids.insert(config.id.clone(), id);

            if self.verbose_level > 1 {
                debug!("エージェント初期化: {} -> {} (指揮官: {:?})", config.id, id, config.commander);
            }
        }

        Ok(())
    }

    pub fn run(&mut self) -> Result<SimulationStats, SimulationError> {
        if !self.initialized {
            return Err(SimulationError::NotInitialized);
        }
        info!("=== シミュレーション実行開始 ===");

        while self.current_time < self.max_time {
            self.step();

            if self.verbose_level > 2 {
                trace!("時刻: {:.1}秒 (ステップ: {})", self.current_time, self.step_count);
            }

            if self.step_count % 100 == 0 && self.verbose_level > 0 {
                let progress = (self.current_time / self.max_time) * 100.0;
                info!("進行状況: {:.1}% ({:.1}/{:.1}秒)", progress, self.current_time, self.max_time);
            }

            if self.world.active_agent_count() == 0 {
                info!("全エージェントが戦闘不能になりました");
                break;
            }
            if self.world.target.as_ref().is_some_and(|t| !t.is_alive()) {
                info!("ターゲットが撃破されました");
                break;
            }
            if self.step_count >= MAX_STEPS {
                break;
            }
        }

        let stats = self.stats();
        info!("=== シミュレーション完了 ===");
        info!("実行時間: {:.1}秒", self.current_time);
        info!("総ステップ数: {}", self.step_count);
        info!("射撃: {}発 命中: {}発 戦死: {}体", stats.shots_fired, stats.hits, stats.agents_killed);

        Ok(stats)
    }

    pub fn step(&mut self) {
        self.world.step(self.dt);
        self.current_time = self.world.now();
        self.step_count += 1;
    }

    pub fn stats(&self) -> SimulationStats {
        let world = &self.world.stats;
        SimulationStats {
            steps: self.step_count,
            elapsed_s: self.current_time,
            shots_fired: world.shots_fired,
            hits: world.hits,
            target_shots: world.target_shots,
            agents_killed: world.agents_killed,
            promotions: world.promotions,
            alerts: world.alerts,
            transitions: world.transitions,
            target_alive: self.world.target.as_ref().is_none_or(|t| t.is_alive()),
            census: self.world.state_census(),
        }
    }

    /// シナリオ上のIDでエージェントを引く
    pub fn agent_id(&self, name: &str) -> Option<AgentId> {
        self.agent_ids.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::AgentState;

    const SQUAD: &str = r#"
meta:
  version: "1.0"
  name: squad-test
sim:
  dt_s: 0.1
  t_max_s: 60.0
world:
  region_rect: { xmin_m: -40, xmax_m: 40, ymin_m: -40, ymax_m: 40 }
target:
  position: { x_m: 12, y_m: 0 }
  health: 100000
agents:
  - id: F1
    position: { x_m: -2, y_m: 2 }
    commander: LEAD
    formation_offset: { right: -2, forward: -2 }
  - id: LEAD
    position: { x_m: 0, y_m: 0 }
    waypoints:
      - { x_m: 5, y_m: 0 }
      - { x_m: 0, y_m: 0 }
  - id: F2
    position: { x_m: -2, y_m: -2 }
    commander: LEAD
    formation_offset: { right: 2, forward: -2 }
"#;

    fn engine() -> SimulationEngine {
        let config = ScenarioConfig::from_yaml_str(SQUAD).unwrap();
        let mut engine = SimulationEngine::new(config, 0);
        engine.initialize().unwrap();
        engine
    }

    #[test]
    fn test_commanders_spawn_before_followers() {
        let engine = engine();
        let lead = engine.agent_id("LEAD").unwrap();
        let f1 = engine.agent_id("F1").unwrap();
        assert_eq!(lead, AgentId(0));
        let squad = engine.world.squads.squad_of_commander(lead).unwrap();
        assert_eq!(squad.followers().len(), 2);
        assert_eq!(engine.world.agent(f1).unwrap().state, AgentState::FollowCommander);
    }

    #[test]
    fn test_run_requires_initialize() {
        let config = ScenarioConfig::from_yaml_str(SQUAD).unwrap();
        let mut engine = SimulationEngine::new(config, 0);
        assert!(matches!(engine.run(), Err(SimulationError::NotInitialized)));
    }

    #[test]
    fn test_squad_engages_visible_target() {
        let mut engine = engine();
        for _ in 0..40 {
            engine.step();
        }
        let stats = engine.stats();
        assert!(stats.alerts >= 1);
        let engaged = engine.world.agents().filter(|a| a.state.is_engaged()).count();
        assert_eq!(engaged, 3);
        assert!(stats.shots_fired > 0);
    }
}
