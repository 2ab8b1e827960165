use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::models::{
    common::{AgentId, CoverId, Vec3},
    traits::{Collider, ILineOfSight, INavMesh, LayerMask, RayQuery},
};

/// カバー地点の遮蔽高さ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Concealment {
    /// 立ったまま隠れられる
    #[default]
    Standing,
    /// しゃがむ必要がある
    Crouching,
}

/// カバーポイント
#[derive(Debug, Clone)]
pub struct CoverPoint {
    pub id: CoverId,
    pub position: Vec3,
    pub concealment: Concealment,
    /// 占有しているエージェント
    pub claimed_by: Option<AgentId>,
}

impl CoverPoint {
    pub fn is_taken(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// 遮蔽判定レイの始点の高さ（カバー地点から）
const COVER_RAY_HEIGHT: f64 = 0.5;
/// 遮蔽判定レイの終点の高さ（ターゲットの頭付近）
const THREAT_HEAD_HEIGHT: f64 = 1.0;

/// カバーレジストリ
///
/// シミュレーションワールドが所有するカバーポイントの管理者です。
/// 占有は`claim`/`release`を通してのみ変更され、1地点を同時に占有できるのは
/// 1エージェントだけです。
#[derive(Debug, Default)]
pub struct CoverRegistry {
    /// `CoverId`を添字とするスロット（登録解除済みはNone）
    slots: Vec<Option<CoverPoint>>,
}

impl CoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// カバーポイントを登録する
    pub fn register(&mut self, position: Vec3, concealment: Concealment) -> CoverId {
        let id = CoverId(self.slots.len() as u32);
        self.slots.push(Some(CoverPoint {
            id,
            position,
            concealment,
            claimed_by: None,
        }));
        id
    }

    /// カバーポイントの登録を解除する
    pub fn unregister(&mut self, id: CoverId) -> Option<CoverPoint> {
        self.slots.get_mut(id.index()).and_then(Option::take)
    }

    pub fn get(&self, id: CoverId) -> Option<&CoverPoint> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoverPoint> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 占有者
    pub fn holder(&self, id: CoverId) -> Option<AgentId> {
        self.get(id).and_then(|point| point.claimed_by)
    }

    /// 占有を試みる（既に占有されていれば何もせずfalse）
    pub fn claim(&mut self, id: CoverId, agent: AgentId) -> bool {
        let Some(point) = self.slots.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        if point.is_taken() {
            return false;
        }
        point.claimed_by = Some(agent);
        debug!(cover_id = %id, agent_id = %agent, "COVER_CLAIMED: カバーポイントを占有しました");
        true
    }

    /// 占有を解除する（占有者に関係なく、何度呼んでもよい）
    pub fn release(&mut self, id: CoverId) {
        if let Some(point) = self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            if let Some(agent) = point.claimed_by.take() {
                debug!(cover_id = %id, agent_id = %agent, "COVER_RELEASED: カバーポイントを解放しました");
            }
        }
    }

    /// 指定エージェントが占有している全ての地点を解放する
    pub fn release_all_held_by(&mut self, agent: AgentId) -> usize {
        let mut released = 0;
        for point in self.slots.iter_mut().flatten() {
            if point.claimed_by == Some(agent) {
                point.claimed_by = None;
                released += 1;
            }
        }
        released
    }

    /// `threat`から見てカバー地点が遮蔽されているか
    ///
    /// カバー地点の少し上からターゲットの頭へレイを飛ばし、ターゲット以外の
    /// 何かに当たれば遮蔽あり。エージェントの体は判定対象外です。
    pub fn has_cover_from<L: ILineOfSight + ?Sized>(&self, point: Vec3, threat: Vec3, los: &L) -> bool {
        let from = point + Vec3::UP * COVER_RAY_HEIGHT;
        let to = threat + Vec3::UP * THREAT_HEAD_HEIGHT;
        let query = RayQuery {
            origin: from,
            direction: to - from,
            max_distance: from.distance(&to),
            mask: LayerMask::OBSTACLE | LayerMask::TARGET,
            ignore: None,
        };
        match los.raycast(&query) {
            Some(hit) => hit.collider != Collider::Target,
            None => false,
        }
    }

    /// 最寄りの利用可能なカバーポイントを探す
    ///
    /// 占有済み・遮蔽なしの地点を除外し、直線距離が最も近く、かつ完全な経路が
    /// 存在する地点を返します。近くても到達できない地点は飛ばされます。
    ///
    /// # 引数
    ///
    /// * `from` - 探索するエージェントの位置
    /// * `threat` - 身を隠したいターゲットの位置
    /// * `seeker` - 探索するエージェント（ログ用）
    /// * `spatial` - 視線判定・経路探索コラボレーター
    pub fn find_nearest_available<S: ILineOfSight + INavMesh + ?Sized>(
        &self,
        from: Vec3,
        threat: Vec3,
        seeker: AgentId,
        spatial: &S,
    ) -> Option<CoverId> {
        let mut best: Option<CoverId> = None;
        let mut best_distance = f64::INFINITY;

        for point in self.iter() {
            if point.is_taken() {
                continue;
            }
            if !self.has_cover_from(point.position, threat, spatial) {
                trace!(cover_id = %point.id, agent_id = %seeker, "COVER_EXPOSED: 遮蔽のない地点を除外しました");
                continue;
            }

            let distance = from.distance(&point.position);
            if distance < best_distance {
                if spatial.path_exists(from, point.position) {
                    best_distance = distance;
                    best = Some(point.id);
                } else {
                    trace!(cover_id = %point.id, agent_id = %seeker, "COVER_UNREACHABLE: 到達できない地点を除外しました");
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::traits::{INavMesh, RayHit};
    use proptest::prelude::*;

    /// 全地点が遮蔽され、`unreachable`以外へは経路があるテスト用の空間
    struct FakeSpatial {
        unreachable: Vec<Vec3>,
        exposed: Vec<Vec3>,
    }

    impl FakeSpatial {
        fn open() -> Self {
            Self { unreachable: Vec::new(), exposed: Vec::new() }
        }
    }

    impl ILineOfSight for FakeSpatial {
        fn raycast(&self, query: &RayQuery) -> Option<RayHit> {
            let base = query.origin - Vec3::UP * COVER_RAY_HEIGHT;
            let collider = if self.exposed.iter().any(|p| p.distance(&base) < 1e-9) {
                Collider::Target
            } else {
                Collider::Obstacle
            };
            Some(RayHit { point: query.origin, distance: 0.5, collider })
        }
    }

    impl INavMesh for FakeSpatial {
        fn path_exists(&self, _from: Vec3, to: Vec3) -> bool {
            !self.unreachable.iter().any(|p| p.distance(&to) < 1e-9)
        }

        fn find_path(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
            self.path_exists(from, to).then(|| vec![to])
        }

        fn sample_position(&self, position: Vec3, _max_distance: f64) -> Option<Vec3> {
            Some(position)
        }
    }

    const SEEKER: AgentId = AgentId(7);
    const THREAT: Vec3 = Vec3::new(30.0, 0.0, 0.0);

    #[test]
    fn test_empty_registry_returns_none() {
        let registry = CoverRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.find_nearest_available(Vec3::ZERO, THREAT, SEEKER, &FakeSpatial::open()), None);
    }

    #[test]
    fn test_single_valid_point_is_returned() {
        let mut registry = CoverRegistry::new();
        let id = registry.register(Vec3::new(4.0, 0.0, 0.0), Concealment::Standing);
        assert_eq!(
            registry.find_nearest_available(Vec3::ZERO, THREAT, SEEKER, &FakeSpatial::open()),
            Some(id)
        );
    }

    #[test]
    fn test_closer_unreachable_point_is_skipped() {
        let mut registry = CoverRegistry::new();
        let a = Vec3::new(2.0, 0.0, 0.0);
        let b = Vec3::new(8.0, 0.0, 0.0);
        registry.register(a, Concealment::Standing);
        let b_id = registry.register(b, Concealment::Crouching);

        let spatial = FakeSpatial { unreachable: vec![a], exposed: Vec::new() };
        assert_eq!(registry.find_nearest_available(Vec3::ZERO, THREAT, SEEKER, &spatial), Some(b_id));
    }

    #[test]
    fn test_taken_and_exposed_points_are_skipped() {
        let mut registry = CoverRegistry::new();
        let near = registry.register(Vec3::new(1.0, 0.0, 0.0), Concealment::Standing);
        let exposed = Vec3::new(2.0, 0.0, 0.0);
        registry.register(exposed, Concealment::Standing);
        let far = registry.register(Vec3::new(9.0, 0.0, 0.0), Concealment::Standing);
        assert!(registry.claim(near, AgentId(1)));

        let spatial = FakeSpatial { unreachable: Vec::new(), exposed: vec![exposed] };
        assert_eq!(registry.find_nearest_available(Vec3::ZERO, THREAT, SEEKER, &spatial), Some(far));

        assert!(registry.claim(far, AgentId(2)));
        assert_eq!(registry.find_nearest_available(Vec3::ZERO, THREAT, SEEKER, &spatial), None);
    }

    #[test]
    fn test_claim_is_exclusive_and_release_idempotent() {
        let mut registry = CoverRegistry::new();
        let id = registry.register(Vec3::ZERO, Concealment::Standing);

        assert!(registry.claim(id, AgentId(1)));
        assert!(!registry.claim(id, AgentId(2)));
        assert_eq!(registry.holder(id), Some(AgentId(1)));

        registry.release(id);
        registry.release(id);
        assert_eq!(registry.holder(id), None);
        assert!(registry.claim(id, AgentId(2)));
    }

    #[test]
    fn test_unregister_keeps_other_ids_stable() {
        let mut registry = CoverRegistry::new();
        let a = registry.register(Vec3::ZERO, Concealment::Standing);
        let b = registry.register(Vec3::new(1.0, 0.0, 0.0), Concealment::Crouching);

        assert!(registry.unregister(a).is_some());
        assert!(registry.unregister(a).is_none());
        assert!(!registry.claim(a, AgentId(1)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(b).unwrap().concealment, Concealment::Crouching);
    }

    #[test]
    fn test_release_all_held_by() {
        let mut registry = CoverRegistry::new();
        let a = registry.register(Vec3::ZERO, Concealment::Standing);
        let b = registry.register(Vec3::new(1.0, 0.0, 0.0), Concealment::Standing);
        registry.claim(a, AgentId(3));
        registry.claim(b, AgentId(4));

        assert_eq!(registry.release_all_held_by(AgentId(3)), 1);
        assert_eq!(registry.holder(a), None);
        assert_eq!(registry.holder(b), Some(AgentId(4)));
    }

    proptest! {
        #[test]
        fn prop_claims_never_overlap(ops in proptest::collection::vec((0u32..4, 0u32..5, any::<bool>()), 1..200)) {
            let mut registry = CoverRegistry::new();
            let ids: Vec<CoverId> = (0..4).map(|i| registry.register(Vec3::new(i as f64, 0.0, 0.0), Concealment::Standing)).collect();
            let mut owners: Vec<Option<AgentId>> = vec![None; ids.len()];

            for (cover, agent, is_claim) in ops {
                let id = ids[cover as usize];
                let agent = AgentId(agent);
                if is_claim {
                    let was_free = owners[cover as usize].is_none();
                    prop_assert_eq!(registry.claim(id, agent), was_free);
                    if was_free {
                        owners[cover as usize] = Some(agent);
                    }
                } else {
                    registry.release(id);
                    owners[cover as usize] = None;
                }
                prop_assert_eq!(registry.holder(id), owners[cover as usize]);
            }
        }
    }
}
