use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    agent::{BehaviorTuning, FormationOffset},
    common::Vec3,
    cover::Concealment,
    perception::PerceptionTuning,
    squad::SquadTuning,
    target::TargetWeaponConfig,
    weapon::WeaponProfile,
};

/// シナリオメタデータ
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// シミュレーション設定
#[derive(Debug, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub dt_s: f64,
    pub t_max_s: f64,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RegionRect {
    pub xmin_m: f64,
    pub xmax_m: f64,
    pub ymin_m: f64,
    pub ymax_m: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Position2D {
    pub x_m: f64,
    pub y_m: f64,
}

impl Position2D {
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x_m, self.y_m, 0.0)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Position3D {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl Position3D {
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x_m, self.y_m, self.z_m)
    }
}

/// 直方体の障害物
#[derive(Debug, Deserialize, Serialize)]
pub struct ObstacleConfig {
    pub min: Position3D,
    pub max: Position3D,
}

/// 世界設定
#[derive(Debug, Deserialize, Serialize)]
pub struct WorldConfig {
    pub region_rect: RegionRect,
    /// 経路探索グリッドのセルサイズ（m）
    #[serde(default = "default_nav_cell")]
    pub nav_cell_m: f64,
    /// 障害物からの最小離隔（m）
    #[serde(default = "default_clearance")]
    pub agent_clearance_m: f64,
    #[serde(default)]
    pub obstacles: Vec<ObstacleConfig>,
}

fn default_nav_cell() -> f64 {
    0.5
}

fn default_clearance() -> f64 {
    0.3
}

/// ターゲット（分隊が交戦する相手）の設定
#[derive(Debug, Deserialize, Serialize)]
pub struct TargetConfig {
    pub position: Position2D,
    #[serde(default)]
    pub route: Vec<Position2D>,
    #[serde(default)]
    pub speed_mps: f64,
    pub health: f64,
    #[serde(default = "default_body_radius")]
    pub body_radius_m: f64,
    /// 反撃しない場合は省略
    #[serde(default)]
    pub weapon: Option<TargetWeaponConfig>,
}

fn default_body_radius() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CoverPointConfig {
    pub position: Position2D,
    #[serde(default)]
    pub concealment: Concealment,
}

/// AIエージェントの設定
#[derive(Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    pub id: String,
    pub position: Position2D,
    #[serde(default)]
    pub yaw_deg: f64,
    #[serde(default = "default_health")]
    pub health: f64,
    #[serde(default)]
    pub waypoints: Vec<Position2D>,
    /// 指揮官のID（随伴者のみ）
    #[serde(default)]
    pub commander: Option<String>,
    #[serde(default)]
    pub formation_offset: FormationOffset,
    /// 個別の調整値（指定時は既定値を置き換える）
    #[serde(default)]
    pub behavior: Option<BehaviorTuning>,
    #[serde(default)]
    pub perception: Option<PerceptionTuning>,
    #[serde(default)]
    pub weapon: Option<WeaponProfile>,
}

fn default_health() -> f64 {
    100.0
}

/// 全エージェント共通の既定値
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub behavior: BehaviorTuning,
    pub perception: PerceptionTuning,
    pub weapon: WeaponProfile,
    pub squad: SquadTuning,
}

/// 完全なシナリオ設定
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub world: WorldConfig,
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub cover_points: Vec<CoverPointConfig>,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path).map_err(|e| ScenarioError::Io(path.to_path_buf(), e))?;
        let config = Self::from_yaml_str(&contents).map_err(|e| match e {
            ScenarioError::Parse(_, err) => ScenarioError::Parse(path.to_path_buf(), err),
            other => other,
        })?;

        Ok(config)
    }

    /// YAML文字列からシナリオ設定を読み込み
    pub fn from_yaml_str(contents: &str) -> Result<Self, ScenarioError> {
        let config: ScenarioConfig =
            serde_yaml::from_str(contents).map_err(|e| ScenarioError::Parse(PathBuf::from("<string>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定の検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.sim.dt_s <= 0.0 {
            return Err(ScenarioError::Validation("dt_s must be positive".to_string()));
        }
        if self.sim.t_max_s <= 0.0 {
            return Err(ScenarioError::Validation("t_max_s must be positive".to_string()));
        }
        if self.world.nav_cell_m <= 0.0 {
            return Err(ScenarioError::Validation("nav_cell_m must be positive".to_string()));
        }

        let region = &self.world.region_rect;
        if region.xmin_m >= region.xmax_m || region.ymin_m >= region.ymax_m {
            return Err(ScenarioError::Validation("Invalid region bounds".to_string()));
        }

        if let Some(target) = &self.target {
            if target.health <= 0.0 {
                return Err(ScenarioError::Validation("target health must be positive".to_string()));
            }
            self.check_in_bounds("target", target.position)?;
            for point in &target.route {
                self.check_in_bounds("target route", *point)?;
            }
        }

        for (index, cover) in self.cover_points.iter().enumerate() {
            self.check_in_bounds(&format!("cover point #{}", index), cover.position)?;
        }

        let mut ids = HashSet::new();
        for agent in &self.agents {
            if !ids.insert(agent.id.as_str()) {
                return Err(ScenarioError::Validation(format!("Duplicate agent id {}", agent.id)));
            }
            if agent.health <= 0.0 {
                return Err(ScenarioError::Validation(format!("Agent {} health must be positive", agent.id)));
            }
            self.check_in_bounds(&format!("agent {}", agent.id), agent.position)?;
            for point in &agent.waypoints {
                self.check_in_bounds(&format!("agent {} waypoint", agent.id), *point)?;
            }
        }

        let commanders: HashMap<&str, Option<&str>> = self
            .agents
            .iter()
            .map(|a| (a.id.as_str(), a.commander.as_deref()))
            .collect();
        for agent in &self.agents {
            let Some(commander) = agent.commander.as_deref() else {
                continue;
            };
            if commander == agent.id {
                return Err(ScenarioError::Validation(format!("Agent {} cannot command itself", agent.id)));
            }
            match commanders.get(commander) {
                None => {
                    return Err(ScenarioError::Validation(format!(
                        "Agent {} references unknown commander {}",
                        agent.id, commander
                    )));
                }
                Some(Some(upper)) => {
                    // 分隊は1階層のみ
                    return Err(ScenarioError::Validation(format!(
                        "Commander {} of agent {} itself follows {}",
                        commander, agent.id, upper
                    )));
                }
                Some(None) => {}
            }
        }

        Ok(())
    }

    fn check_in_bounds(&self, what: &str, position: Position2D) -> Result<(), ScenarioError> {
        if self.is_position_in_bounds(position.x_m, position.y_m) {
            Ok(())
        } else {
            Err(ScenarioError::Validation(format!(
                "{} ({:.1}, {:.1}) outside region bounds",
                what, position.x_m, position.y_m
            )))
        }
    }

    /// 位置が領域内かどうかをチェック
    fn is_position_in_bounds(&self, x: f64, y: f64) -> bool {
        let region = &self.world.region_rect;
        x >= region.xmin_m && x <= region.xmax_m && y >= region.ymin_m && y <= region.ymax_m
    }

    /// 指揮官（他のエージェントを率いる者）のID一覧
    pub fn commander_ids(&self) -> HashSet<&str> {
        self.agents.iter().filter_map(|a| a.commander.as_deref()).collect()
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("時間刻み: {:.3}秒", self.sim.dt_s);
        println!("最大時間: {:.1}秒 ({:.1}分)", self.sim.t_max_s, self.sim.t_max_s / 60.0);
        println!("シード値: {}", self.sim.seed);
        println!();

        println!("=== 地形 ===");
        let region = &self.world.region_rect;
        println!(
            "領域: x[{:.0}, {:.0}] y[{:.0}, {:.0}]",
            region.xmin_m, region.xmax_m, region.ymin_m, region.ymax_m
        );
        println!("障害物: {}個", self.world.obstacles.len());
        println!("カバーポイント: {}箇所", self.cover_points.len());
        println!();

        println!("=== 分隊 ===");
        let commanders = self.commander_ids();
        println!("エージェント: {}体 (分隊: {})", self.agents.len(), commanders.len());
        for agent in &self.agents {
            let role = match &agent.commander {
                Some(commander) => format!("随伴 -> {}", commander),
                None if commanders.contains(agent.id.as_str()) => "指揮官".to_string(),
                None => "単独".to_string(),
            };
            println!("  {}: {} (巡回点: {})", agent.id, role, agent.waypoints.len());
        }
        println!();

        println!("=== ターゲット ===");
        match &self.target {
            Some(target) => {
                println!(
                    "体力: {:.0}  ルート: {}点  速度: {:.1}m/s  反撃: {}",
                    target.health,
                    target.route.len(),
                    target.speed_mps,
                    if target.weapon.is_some() { "あり" } else { "なし" }
                );
            }
            None => println!("なし"),
        }
    }
}

/// シナリオ読み込みエラー
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("シナリオファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("ファイル読み込みエラー {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("YAML解析エラー {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("設定検証エラー: {0}")]
    Validation(String),
}
