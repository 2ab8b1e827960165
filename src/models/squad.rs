use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::common::{AgentId, Vec3};

/// 分隊の調整パラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SquadTuning {
    /// 隊形が整ったとみなす指揮官からの距離（m）
    pub formation_tolerance: f64,
}

impl Default for SquadTuning {
    fn default() -> Self {
        Self { formation_tolerance: 5.0 }
    }
}

/// 分隊コーディネーター
///
/// 1人の指揮官と0人以上の随伴者の関係を保持します。エージェント本体は所有せず、
/// ハンドル（`AgentId`）で参照するだけです。
#[derive(Debug, Clone)]
pub struct SquadCoordinator {
    pub commander: AgentId,
    followers: Vec<AgentId>,
    pub formation_tolerance: f64,
    /// 巡回開始前に隊形が一度揃ったか
    pub has_grouped_up: bool,
}

impl SquadCoordinator {
    pub fn new(commander: AgentId, followers: Vec<AgentId>, formation_tolerance: f64) -> Self {
        Self {
            commander,
            followers,
            formation_tolerance,
            has_grouped_up: false,
        }
    }

    pub fn followers(&self) -> &[AgentId] {
        &self.followers
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.followers.contains(&agent)
    }

    pub fn add_follower(&mut self, agent: AgentId) {
        if agent != self.commander && !self.contains(agent) {
            self.followers.push(agent);
        }
    }

    /// 随伴者リストから外す（含まれていなければfalse）
    pub fn remove_follower(&mut self, agent: AgentId) -> bool {
        let before = self.followers.len();
        self.followers.retain(|id| *id != agent);
        before != self.followers.len()
    }

    /// 全随伴者が指揮官から許容距離内にいるか
    ///
    /// # 引数
    ///
    /// * `commander_position` - 指揮官の現在位置
    /// * `position_of` - 随伴者の位置を引く関数（既に存在しない随伴者はNone）
    pub fn all_followers_in_formation<F>(&self, commander_position: Vec3, position_of: F) -> bool
    where
        F: Fn(AgentId) -> Option<Vec3>,
    {
        self.followers.iter().all(|id| match position_of(*id) {
            Some(position) => position.distance(&commander_position) <= self.formation_tolerance,
            None => true,
        })
    }

    /// 昇格させる随伴者を選ぶ（旧指揮官の位置に最も近い者、同距離ならリストの先頭側）
    pub fn nearest_follower<F>(&self, from: Vec3, position_of: F) -> Option<AgentId>
    where
        F: Fn(AgentId) -> Option<Vec3>,
    {
        let mut best: Option<(AgentId, f64)> = None;
        for id in &self.followers {
            let Some(position) = position_of(*id) else {
                continue;
            };
            let distance = position.distance(&from);
            if best.is_none_or(|(_, best_distance)| distance < best_distance) {
                best = Some((*id, distance));
            }
        }
        best.map(|(id, _)| id)
    }
}

/// 指揮官IDをキーとする分隊の一覧（ワールドが所有）
#[derive(Debug, Default)]
pub struct SquadRegistry {
    squads: BTreeMap<AgentId, SquadCoordinator>,
}

impl SquadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分隊を登録する（同じ指揮官の既存分隊は置き換えられる）
    pub fn insert(&mut self, squad: SquadCoordinator) {
        debug!(
            commander_id = %squad.commander,
            followers = squad.followers.len(),
            "SQUAD_FORMED: 分隊を編成しました"
        );
        self.squads.insert(squad.commander, squad);
    }

    pub fn remove(&mut self, commander: AgentId) -> Option<SquadCoordinator> {
        self.squads.remove(&commander)
    }

    pub fn squad_of_commander(&self, commander: AgentId) -> Option<&SquadCoordinator> {
        self.squads.get(&commander)
    }

    pub fn squad_of_commander_mut(&mut self, commander: AgentId) -> Option<&mut SquadCoordinator> {
        self.squads.get_mut(&commander)
    }

    pub fn is_commander(&self, agent: AgentId) -> bool {
        self.squads.contains_key(&agent)
    }

    /// 随伴者の指揮官を引く
    pub fn commander_of(&self, follower: AgentId) -> Option<AgentId> {
        self.squads
            .values()
            .find(|squad| squad.contains(follower))
            .map(|squad| squad.commander)
    }

    /// 指定エージェントを随伴者として含む分隊の数
    pub fn memberships(&self, follower: AgentId) -> usize {
        self.squads.values().filter(|squad| squad.contains(follower)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SquadCoordinator> {
        self.squads.values()
    }

    pub fn len(&self) -> usize {
        self.squads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.squads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(id: AgentId) -> Option<Vec3> {
        match id.0 {
            1 => Some(Vec3::new(3.0, 0.0, 0.0)),
            2 => Some(Vec3::new(0.0, 7.0, 0.0)),
            3 => Some(Vec3::new(-3.0, 0.0, 0.0)),
            _ => None,
        }
    }

    #[test]
    fn test_formation_check_uses_tolerance() {
        let squad = SquadCoordinator::new(AgentId(0), vec![AgentId(1), AgentId(2)], 5.0);
        assert!(!squad.all_followers_in_formation(Vec3::ZERO, positions));

        let squad = SquadCoordinator::new(AgentId(0), vec![AgentId(1), AgentId(2)], 7.0);
        assert!(squad.all_followers_in_formation(Vec3::ZERO, positions));

        let empty = SquadCoordinator::new(AgentId(0), Vec::new(), 1.0);
        assert!(empty.all_followers_in_formation(Vec3::ZERO, positions));
    }

    #[test]
    fn test_nearest_follower_prefers_first_on_tie() {
        let squad = SquadCoordinator::new(AgentId(0), vec![AgentId(2), AgentId(3), AgentId(1)], 5.0);
        // 1と3はどちらも距離3、リストで先に来る3が選ばれる
        assert_eq!(squad.nearest_follower(Vec3::ZERO, positions), Some(AgentId(3)));

        let empty = SquadCoordinator::new(AgentId(0), Vec::new(), 5.0);
        assert_eq!(empty.nearest_follower(Vec3::ZERO, positions), None);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = SquadRegistry::new();
        let mut squad = SquadCoordinator::new(AgentId(0), vec![AgentId(1)], 5.0);
        squad.add_follower(AgentId(2));
        squad.add_follower(AgentId(2));
        squad.add_follower(AgentId(0));
        assert_eq!(squad.followers(), &[AgentId(1), AgentId(2)]);
        registry.insert(squad);

        assert!(registry.is_commander(AgentId(0)));
        assert_eq!(registry.commander_of(AgentId(2)), Some(AgentId(0)));
        assert_eq!(registry.memberships(AgentId(2)), 1);

        let squad = registry.squad_of_commander_mut(AgentId(0)).unwrap();
        assert!(squad.remove_follower(AgentId(2)));
        assert!(!squad.remove_follower(AgentId(2)));
        assert_eq!(registry.commander_of(AgentId(2)), None);
    }
}
