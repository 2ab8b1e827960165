use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{
    common::{AgentId, Vec3},
    traits::{Collider, ILineOfSight, LayerMask, RayQuery},
};

/// 視覚の調整パラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PerceptionTuning {
    /// 視認距離（m）
    pub range_m: f64,
    /// 視野角（度、全角）
    pub fov_deg: f64,
    /// 発見までに必要な連続視認時間（秒）
    pub aggression_time_s: f64,
    /// 視界外での視認タイマー減衰率（秒あたり）
    pub detection_drop_per_s: f64,
    /// 最終発見からSearchへ移るまでの時間（秒）
    pub search_timeout_s: f64,
    /// 目の高さ（m）
    pub eye_height_m: f64,
    /// ターゲットの胸の高さ（m）
    pub target_chest_height_m: f64,
    /// 検知履歴を保持する秒数
    pub history_window_s: f64,
}

impl Default for PerceptionTuning {
    fn default() -> Self {
        Self {
            range_m: 25.0,
            fov_deg: 110.0,
            aggression_time_s: 1.0,
            detection_drop_per_s: 10.0,
            search_timeout_s: 20.0,
            eye_height_m: 1.5,
            target_chest_height_m: 1.0,
            history_window_s: 60.0,
        }
    }
}

/// 1ティック分の知覚結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerceptionSnapshot {
    pub can_see_target: bool,
    pub last_seen_position: Option<Vec3>,
    pub last_seen_time: Option<f64>,
}

/// 検知イベントの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionEventType {
    /// 視認タイマーが閾値に達した
    Detected,
    /// 視認タイマーが0まで減衰した
    Lost,
    /// 分隊の仲間から位置を共有された
    Shared,
}

#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub timestamp: f64,
    pub target_position: Option<Vec3>,
    pub event_type: DetectionEventType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionStats {
    pub detections: usize,
    pub losses: usize,
    pub shared: usize,
}

/// 知覚ユニット
///
/// 視野角・視線判定・攻撃性タイマーでターゲットの発見を判定し、
/// 最終発見位置と時刻を保持します。エージェントの状態は変更しません。
#[derive(Debug, Clone)]
pub struct Perception {
    pub tuning: PerceptionTuning,
    visible_timer: f64,
    target_in_view: bool,
    can_see_target: bool,
    last_seen_position: Option<Vec3>,
    last_seen_time: Option<f64>,
    /// 分隊への警報を出したか（交戦毎に1回）
    pub has_alerted_squad: bool,
    history: Vec<DetectionEvent>,
}

impl Perception {
    pub fn new(tuning: PerceptionTuning) -> Self {
        Self {
            tuning,
            visible_timer: 0.0,
            target_in_view: false,
            can_see_target: false,
            last_seen_position: None,
            last_seen_time: None,
            has_alerted_squad: false,
            history: Vec::new(),
        }
    }

    /// 1ティック分の知覚処理
    ///
    /// # 引数
    ///
    /// * `dt` - 経過時間（秒）
    /// * `now` - 現在のシミュレーション時刻（秒）
    /// * `position` - エージェントの足元位置
    /// * `forward` - エージェントの前方ベクトル
    /// * `target` - ターゲット位置（未解決・死亡時はNone）
    /// * `los` - 視線判定コラボレーター
    /// * `self_id` - 自分のID（自分の体を無視するため）
    pub fn tick<L: ILineOfSight + ?Sized>(
        &mut self,
        dt: f64,
        now: f64,
        position: Vec3,
        forward: Vec3,
        target: Option<Vec3>,
        los: &L,
        self_id: AgentId,
    ) -> PerceptionSnapshot {
        self.target_in_view = match target {
            Some(target_position) => self.is_in_view(position, forward, target_position, los, self_id),
            None => false,
        };

        if self.target_in_view {
            self.visible_timer = (self.visible_timer + dt).min(self.tuning.aggression_time_s);
            if self.visible_timer >= self.tuning.aggression_time_s {
                if !self.can_see_target {
                    self.record(now, target, DetectionEventType::Detected);
                    debug!(
                        agent_id = %self_id,
                        target = ?target,
                        "TARGET_DETECTED: ターゲットを発見しました"
                    );
                }
                self.can_see_target = true;
                self.last_seen_position = target;
                self.last_seen_time = Some(now);
            }
        } else {
            self.visible_timer = (self.visible_timer - dt * self.tuning.detection_drop_per_s).max(0.0);
            if self.visible_timer <= 0.0 && self.can_see_target {
                self.can_see_target = false;
                self.record(now, self.last_seen_position, DetectionEventType::Lost);
                debug!(
                    agent_id = %self_id,
                    last_seen = ?self.last_seen_position,
                    "TARGET_LOST: ターゲットを見失いました"
                );
            }
        }

        self.prune_history(now);
        self.snapshot()
    }

    /// 視野角・距離・遮蔽の判定
    fn is_in_view<L: ILineOfSight + ?Sized>(
        &self,
        position: Vec3,
        forward: Vec3,
        target: Vec3,
        los: &L,
        self_id: AgentId,
    ) -> bool {
        let to_target = target - position;
        if to_target.flattened().length() > self.tuning.range_m {
            return false;
        }
        if forward.flattened().angle_between_deg(&to_target.flattened()) > self.tuning.fov_deg * 0.5 {
            return false;
        }

        let eye = position + Vec3::UP * self.tuning.eye_height_m;
        let aim = target + Vec3::UP * self.tuning.target_chest_height_m;
        let query = RayQuery {
            origin: eye,
            direction: aim - eye,
            max_distance: self.tuning.range_m + self.tuning.eye_height_m,
            mask: LayerMask::all(),
            ignore: Some(self_id),
        };
        matches!(los.raycast(&query), Some(hit) if hit.collider == Collider::Target)
    }

    /// 分隊の仲間から共有されたターゲット位置を記録する
    pub fn share_sighting(&mut self, position: Vec3, now: f64) {
        self.last_seen_position = Some(position);
        self.last_seen_time = Some(now);
        self.record(now, Some(position), DetectionEventType::Shared);
    }

    /// 交戦情報を破棄する（平常行動へ戻るとき）
    pub fn forget(&mut self) {
        self.visible_timer = 0.0;
        self.can_see_target = false;
        self.last_seen_position = None;
        self.last_seen_time = None;
        self.has_alerted_squad = false;
    }

    pub fn snapshot(&self) -> PerceptionSnapshot {
        PerceptionSnapshot {
            can_see_target: self.can_see_target,
            last_seen_position: self.last_seen_position,
            last_seen_time: self.last_seen_time,
        }
    }

    pub fn can_see_target(&self) -> bool {
        self.can_see_target
    }

    pub fn target_in_view(&self) -> bool {
        self.target_in_view
    }

    pub fn visible_timer(&self) -> f64 {
        self.visible_timer
    }

    pub fn last_seen_position(&self) -> Option<Vec3> {
        self.last_seen_position
    }

    pub fn last_seen_time(&self) -> Option<f64> {
        self.last_seen_time
    }

    /// 最終発見からの経過時間（情報がなければNone）
    pub fn time_since_last_seen(&self, now: f64) -> Option<f64> {
        self.last_seen_time.map(|t| now - t)
    }

    fn record(&mut self, timestamp: f64, target_position: Option<Vec3>, event_type: DetectionEventType) {
        self.history.push(DetectionEvent { timestamp, target_position, event_type });
    }

    fn prune_history(&mut self, now: f64) {
        let cutoff = now - self.tuning.history_window_s;
        self.history.retain(|event| event.timestamp >= cutoff);
    }

    pub fn history(&self) -> &[DetectionEvent] {
        &self.history
    }

    pub fn detection_stats(&self) -> DetectionStats {
        let count = |kind: DetectionEventType| self.history.iter().filter(|e| e.event_type == kind).count();
        DetectionStats {
            detections: count(DetectionEventType::Detected),
            losses: count(DetectionEventType::Lost),
            shared: count(DetectionEventType::Shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        arena::{Arena, BoxObstacle, Bounds},
        traits::BodySphere,
    };

    const ME: AgentId = AgentId(0);
    const DT: f64 = 0.1;

    fn arena_with_target(target: Vec3, obstacles: Vec<BoxObstacle>) -> Arena {
        let bounds = Bounds { min_x: -50.0, max_x: 50.0, min_y: -50.0, max_y: 50.0 };
        let mut arena = Arena::new(bounds, obstacles, 1.0, 0.0);
        arena.sync_bodies(
            Some(BodySphere { center: target + Vec3::UP * 1.0, radius: 0.5 }),
            &[(ME, BodySphere { center: Vec3::new(0.0, 0.0, 1.0), radius: 0.4 })],
        );
        arena
    }

    fn tuning() -> PerceptionTuning {
        PerceptionTuning {
            aggression_time_s: 1.0,
            detection_drop_per_s: 2.0,
            ..PerceptionTuning::default()
        }
    }

    /// `seconds`秒分ティックして最後のスナップショットを返す
    fn run(
        perception: &mut Perception,
        arena: &Arena,
        target: Option<Vec3>,
        start: f64,
        seconds: f64,
    ) -> PerceptionSnapshot {
        let ticks = (seconds / DT).round() as usize;
        let mut snapshot = perception.snapshot();
        for i in 0..ticks {
            let now = start + (i + 1) as f64 * DT;
            snapshot = perception.tick(DT, now, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), target, arena, ME);
        }
        snapshot
    }

    #[test]
    fn test_detection_requires_aggression_time() {
        let target = Vec3::new(10.0, 0.0, 0.0);
        let arena = arena_with_target(target, Vec::new());
        let mut perception = Perception::new(tuning());

        let snapshot = run(&mut perception, &arena, Some(target), 0.0, 0.5);
        assert!(!snapshot.can_see_target);
        assert!(snapshot.last_seen_position.is_none());

        let snapshot = run(&mut perception, &arena, Some(target), 0.5, 0.6);
        assert!(snapshot.can_see_target);
        assert_eq!(snapshot.last_seen_position, Some(target));
        assert!(snapshot.last_seen_time.unwrap() > 0.9);
    }

    #[test]
    fn test_target_outside_fov_is_not_seen() {
        // 真後ろ
        let target = Vec3::new(-10.0, 0.0, 0.0);
        let arena = arena_with_target(target, Vec::new());
        let mut perception = Perception::new(tuning());

        let snapshot = run(&mut perception, &arena, Some(target), 0.0, 3.0);
        assert!(!snapshot.can_see_target);
        assert_eq!(perception.visible_timer(), 0.0);
    }

    #[test]
    fn test_occluded_target_is_not_seen() {
        let target = Vec3::new(10.0, 0.0, 0.0);
        let wall = BoxObstacle::new(Vec3::new(4.0, -3.0, 0.0), Vec3::new(5.0, 3.0, 3.0));
        let arena = arena_with_target(target, vec![wall]);
        let mut perception = Perception::new(tuning());

        let snapshot = run(&mut perception, &arena, Some(target), 0.0, 3.0);
        assert!(!snapshot.can_see_target);
    }

    #[test]
    fn test_visibility_decays_gradually() {
        let target = Vec3::new(10.0, 0.0, 0.0);
        let arena = arena_with_target(target, Vec::new());
        let mut perception = Perception::new(tuning());
        assert!(run(&mut perception, &arena, Some(target), 0.0, 1.5).can_see_target);

        // 視界から外れても減衰率2/秒なので0.3秒後はまだ見えている扱い
        let snapshot = run(&mut perception, &arena, None, 1.5, 0.3);
        assert!(snapshot.can_see_target);
        assert_eq!(snapshot.last_seen_position, Some(target));

        // タイマー1.0が0になるまで0.5秒
        let snapshot = run(&mut perception, &arena, None, 1.8, 0.3);
        assert!(!snapshot.can_see_target);
        // 最終発見情報は保持される
        assert_eq!(snapshot.last_seen_position, Some(target));
        assert_eq!(perception.detection_stats().losses, 1);
    }

    #[test]
    fn test_missing_target_is_not_visible() {
        let arena = arena_with_target(Vec3::new(5.0, 0.0, 0.0), Vec::new());
        let mut perception = Perception::new(tuning());
        let snapshot = run(&mut perception, &arena, None, 0.0, 2.0);
        assert!(!snapshot.can_see_target);
        assert!(!perception.target_in_view());
    }

    #[test]
    fn test_shared_sighting_and_forget() {
        let mut perception = Perception::new(tuning());
        perception.share_sighting(Vec3::new(3.0, 4.0, 0.0), 12.0);
        assert!(!perception.can_see_target());
        assert_eq!(perception.time_since_last_seen(15.0), Some(3.0));
        assert_eq!(perception.detection_stats().shared, 1);

        perception.has_alerted_squad = true;
        perception.forget();
        assert!(perception.last_seen_position().is_none());
        assert!(!perception.has_alerted_squad);
    }
}
