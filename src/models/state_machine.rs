//! 各状態の1ティック分の処理
//!
//! 状態処理はエージェント自身とカバーレジストリだけを変更し、状態遷移・分隊警報・
//! 射撃の命中判定は`StepOutcome`としてワールドへ返します。

use tracing::{trace, warn};

use crate::models::{
    agent::{Agent, AgentState},
    common::{Posture, Vec3, forward_from_yaw, right_from_yaw},
    cover::{Concealment, CoverRegistry},
    traits::{Collider, FireOutcome, ISpatialQuery, IWeapon, LayerMask, RayQuery},
};

/// 指揮官の位置と向き（随伴者の隊形計算用）
#[derive(Debug, Clone, Copy)]
pub struct CommanderView {
    pub position: Vec3,
    pub yaw_deg: f64,
}

/// 状態処理に渡すワールドの読み取り専用情報
pub struct TickContext<'a, S: ISpatialQuery + ?Sized> {
    pub now: f64,
    pub dt: f64,
    /// 生存しているターゲットの位置
    pub target: Option<Vec3>,
    pub spatial: &'a S,
    pub commander: Option<CommanderView>,
    /// 指揮官として巡回を始めてよいか（隊形が揃っているか）
    pub formation_ready: bool,
}

/// 状態処理の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub transition: Option<AgentState>,
    /// 分隊へ警報を出すターゲット位置
    pub alert: Option<Vec3>,
    /// 発射した弾のダメージ
    pub shot: Option<f64>,
}

impl StepOutcome {
    fn transition(state: AgentState) -> Self {
        Self { transition: Some(state), ..Self::default() }
    }
}

/// 射線判定・覗き込み判定で使う目の高さ
const PEEK_EYE_HEIGHT: f64 = 1.0;
/// Attackで停止距離に達したとみなす余裕
const STOPPING_SLACK: f64 = 0.01;

/// 現在の状態を1ティック分実行する
pub fn execute<S: ISpatialQuery + ?Sized>(
    agent: &mut Agent,
    covers: &mut CoverRegistry,
    ctx: &TickContext<'_, S>,
) -> StepOutcome {
    match agent.state {
        AgentState::Patrol => patrol(agent, ctx),
        AgentState::FollowCommander => follow_commander(agent, ctx),
        AgentState::Attack => attack(agent, covers, ctx),
        AgentState::MoveToCover { .. } => move_to_cover(agent, covers, ctx),
        AgentState::BehindCover { .. } => behind_cover(agent, covers, ctx),
        AgentState::PeekShoot { .. } => peek_shoot(agent, ctx),
        AgentState::Search { .. } => search(agent, ctx),
        AgentState::Death { .. } => {
            agent.nav.set_stopped(true);
            StepOutcome::default()
        }
    }
}

/// 交戦中に狙う位置（実位置、なければ最終発見位置）
fn engagement_target<S: ISpatialQuery + ?Sized>(agent: &Agent, ctx: &TickContext<'_, S>) -> Option<Vec3> {
    ctx.target.or(agent.perception.last_seen_position())
}

fn patrol<S: ISpatialQuery + ?Sized>(agent: &mut Agent, ctx: &TickContext<'_, S>) -> StepOutcome {
    if agent.waypoints.is_empty() || !ctx.formation_ready {
        agent.nav.set_stopped(true);
        return StepOutcome::default();
    }

    agent.nav.set_stopped(false);
    agent.nav.set_speed(agent.tuning.normal_speed);

    let count = agent.waypoints.len();
    agent.current_waypoint %= count;
    let waypoint = agent.waypoints[agent.current_waypoint];
    if agent.position().distance_xy(&waypoint) < agent.tuning.patrol_arrival_m {
        agent.current_waypoint = (agent.current_waypoint + 1) % count;
        trace!(agent_id = %agent.id, waypoint = agent.current_waypoint, "PATROL_WAYPOINT: 次の巡回点へ向かいます");
    }
    let next = agent.waypoints[agent.current_waypoint];
    agent.nav.set_destination(next, ctx.spatial);
    StepOutcome::default()
}

fn follow_commander<S: ISpatialQuery + ?Sized>(agent: &mut Agent, ctx: &TickContext<'_, S>) -> StepOutcome {
    let Some(commander) = ctx.commander else {
        warn!(agent_id = %agent.id, "FOLLOW_NO_COMMANDER: 指揮官がいないため既定状態へ戻ります");
        return StepOutcome::transition(AgentState::Patrol);
    };

    let offset = right_from_yaw(commander.yaw_deg) * agent.formation_offset.right
        + forward_from_yaw(commander.yaw_deg) * agent.formation_offset.forward;
    let slot = commander.position + offset;

    agent.nav.set_stopped(false);
    agent.nav.set_destination(slot, ctx.spatial);
    let speed = if agent.position().distance(&slot) > agent.tuning.catch_up_distance_m {
        agent.tuning.catch_up_speed
    } else {
        agent.tuning.normal_speed
    };
    agent.nav.set_speed(speed);
    StepOutcome::default()
}

fn attack<S: ISpatialQuery + ?Sized>(
    agent: &mut Agent,
    covers: &mut CoverRegistry,
    ctx: &TickContext<'_, S>,
) -> StepOutcome {
    let Some(target) = engagement_target(agent, ctx) else {
        warn!(agent_id = %agent.id, "ATTACK_NO_TARGET: 攻撃対象が不明です");
        return StepOutcome::transition(agent.search_or_default());
    };

    let mut outcome = StepOutcome::default();
    if !agent.perception.has_alerted_squad {
        agent.perception.has_alerted_squad = true;
        outcome.alert = Some(target);
    }

    if agent.held_cover.is_none() {
        if let Some(cover) = covers.find_nearest_available(agent.position(), target, agent.id, ctx.spatial) {
            if covers.claim(cover, agent.id) {
                agent.held_cover = Some(cover);
                outcome.transition = Some(AgentState::MoveToCover { cover });
                return outcome;
            }
        }
    }

    // カバーなし: 停止距離まで接近して射撃
    let position = agent.position();
    let to_target = (target - position).flattened();
    let distance = to_target.length();
    let stopping = agent.tuning.stopping_distance_m;
    if distance <= stopping + STOPPING_SLACK {
        agent.nav.clear_destination();
        agent.nav.set_stopped(true);
        agent.nav.face_towards(target);
        outcome.shot = fire(agent, ctx.now);
    } else {
        let stand_off = target - to_target.normalized() * stopping;
        agent.nav.set_stopped(false);
        agent.nav.set_speed(agent.tuning.normal_speed);
        if !agent.nav.set_destination(stand_off, ctx.spatial) {
            agent.nav.set_destination(target.flattened(), ctx.spatial);
        }
    }
    outcome
}

fn move_to_cover<S: ISpatialQuery + ?Sized>(
    agent: &mut Agent,
    covers: &mut CoverRegistry,
    ctx: &TickContext<'_, S>,
) -> StepOutcome {
    let AgentState::MoveToCover { cover } = agent.state else {
        return StepOutcome::default();
    };
    let Some(point) = covers.get(cover).map(|p| p.position) else {
        warn!(agent_id = %agent.id, cover_id = %cover, "COVER_MISSING: カバーポイントが存在しません");
        agent.held_cover = None;
        return StepOutcome::transition(AgentState::Attack);
    };

    if agent.position().distance_xy(&point) <= agent.tuning.cover_arrival_m {
        agent.nav.set_speed(agent.tuning.normal_speed);
        agent.nav.set_stopped(true);
        return StepOutcome::transition(AgentState::behind_cover(cover));
    }

    agent.nav.set_stopped(false);
    agent.nav.set_speed(agent.tuning.move_to_cover_speed);
    // 目的地が同じ間は経路が再計画されないので到達可能性を毎回確かめる
    let reachable = agent.nav.set_destination(point, ctx.spatial) && ctx.spatial.path_exists(agent.position(), point);
    if !reachable {
        // 占有後に経路が失われた
        warn!(agent_id = %agent.id, cover_id = %cover, "COVER_UNREACHABLE: カバーへの経路がありません");
        covers.release(cover);
        agent.held_cover = None;
        return StepOutcome::transition(AgentState::Attack);
    }
    StepOutcome::default()
}

fn behind_cover<S: ISpatialQuery + ?Sized>(
    agent: &mut Agent,
    covers: &CoverRegistry,
    ctx: &TickContext<'_, S>,
) -> StepOutcome {
    let AgentState::BehindCover { cover, dwell } = agent.state else {
        return StepOutcome::default();
    };

    agent.nav.set_stopped(true);
    let target = engagement_target(agent, ctx);
    if let Some(target) = target {
        agent.nav.face_towards(target);
    }
    if covers.get(cover).is_some_and(|p| p.concealment == Concealment::Crouching) {
        agent.posture = Posture::Crouching;
    }

    let dwell = dwell + ctx.dt;
    if dwell < agent.tuning.peek_delay_s {
        agent.state = AgentState::BehindCover { cover, dwell };
        return StepOutcome::default();
    }

    let origin = covers.get(cover).map_or(agent.position(), |p| p.position);
    let axis = target.map_or(Vec3::ZERO, |t| (t - origin).flattened().normalized());
    let mut lateral = Vec3::UP.cross(&axis).flattened().normalized();
    if lateral.is_near_zero() {
        lateral = Vec3::new(1.0, 0.0, 0.0);
    }
    StepOutcome::transition(AgentState::PeekShoot { cover, lateral, shoot_timer: 0.0 })
}

fn peek_shoot<S: ISpatialQuery + ?Sized>(agent: &mut Agent, ctx: &TickContext<'_, S>) -> StepOutcome {
    let AgentState::PeekShoot { cover, lateral, shoot_timer } = agent.state else {
        return StepOutcome::default();
    };
    let Some(target) = engagement_target(agent, ctx) else {
        return StepOutcome::transition(AgentState::behind_cover(cover));
    };

    agent.nav.set_stopped(false);
    let position = agent.position();
    if !has_line_of_sight(position, target, ctx.spatial) {
        let step = agent.tuning.peek_step_m;
        let radius = agent.tuning.peek_sample_radius_m;
        let sidestep = ctx
            .spatial
            .sample_position(position + lateral * step, radius)
            .or_else(|| ctx.spatial.sample_position(position - lateral * step, radius));
        match sidestep {
            Some(point) => {
                agent.nav.set_destination(point, ctx.spatial);
            }
            None => {
                trace!(agent_id = %agent.id, "PEEK_BLOCKED: 左右どちらにも覗き込めません");
                agent.nav.set_stopped(true);
            }
        }
        return StepOutcome::default();
    }

    agent.nav.set_stopped(true);
    agent.nav.face_towards(target);
    let shot = fire(agent, ctx.now);
    let shoot_timer = shoot_timer + ctx.dt;
    if shoot_timer >= agent.tuning.shoot_duration_s {
        return StepOutcome {
            transition: Some(AgentState::behind_cover(cover)),
            shot,
            ..StepOutcome::default()
        };
    }
    agent.state = AgentState::PeekShoot { cover, lateral, shoot_timer };
    StepOutcome { shot, ..StepOutcome::default() }
}

fn search<S: ISpatialQuery + ?Sized>(agent: &mut Agent, ctx: &TickContext<'_, S>) -> StepOutcome {
    let AgentState::Search { position, sweep_timer, base_yaw } = agent.state else {
        return StepOutcome::default();
    };

    let arrived = match base_yaw {
        Some(_) => true,
        None => {
            agent.nav.set_destination(position, ctx.spatial);
            !agent.nav.has_path() || agent.position().distance_xy(&position) <= agent.tuning.patrol_arrival_m
        }
    };
    if !arrived {
        return StepOutcome::default();
    }

    agent.nav.set_stopped(true);
    let base_yaw = base_yaw.unwrap_or(agent.nav.yaw_deg());
    let sweep_timer = sweep_timer + ctx.dt;
    let sweep = (sweep_timer * agent.tuning.search_sweep_rate).sin() * agent.tuning.search_sweep_deg;
    agent.nav.set_yaw(base_yaw + sweep);

    if sweep_timer >= agent.tuning.search_duration_s {
        agent.nav.set_yaw(base_yaw);
        agent.perception.forget();
        return StepOutcome::transition(agent.default_state());
    }
    agent.state = AgentState::Search { position, sweep_timer, base_yaw: Some(base_yaw) };
    StepOutcome::default()
}

/// 覗き込み位置からターゲットが見えるか（味方の体は無視）
fn has_line_of_sight<S: ISpatialQuery + ?Sized>(position: Vec3, target: Vec3, spatial: &S) -> bool {
    let from = position + Vec3::UP * PEEK_EYE_HEIGHT;
    let to = target + Vec3::UP * PEEK_EYE_HEIGHT;
    let query = RayQuery {
        origin: from,
        direction: to - from,
        max_distance: from.distance(&to),
        mask: LayerMask::OBSTACLE | LayerMask::TARGET,
        ignore: None,
    };
    matches!(spatial.raycast(&query), Some(hit) if hit.collider == Collider::Target)
}

/// 1回引き金を引く（連射レート・リロードで制限される）
fn fire(agent: &mut Agent, now: f64) -> Option<f64> {
    match agent.weapon.fire(now) {
        FireOutcome::Fired { damage } => Some(damage),
        FireOutcome::Empty => {
            trace!(agent_id = %agent.id, "WEAPON_EMPTY: リロードします");
            None
        }
        FireOutcome::OutOfAmmo => {
            trace!(agent_id = %agent.id, "WEAPON_OUT_OF_AMMO: 弾切れです");
            None
        }
        FireOutcome::Reloading | FireOutcome::Cooldown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        agent::AgentSpawn,
        common::AgentId,
        traits::{ILineOfSight, INavMesh, RayHit},
    };

    /// 直線経路・視線はテストごとに切り替えられる空間
    struct Field {
        clear_sight: bool,
        walkable: bool,
    }

    impl ILineOfSight for Field {
        fn raycast(&self, query: &RayQuery) -> Option<RayHit> {
            let collider = if self.clear_sight { Collider::Target } else { Collider::Obstacle };
            Some(RayHit { point: query.origin, distance: 1.0, collider })
        }
    }

    impl INavMesh for Field {
        fn path_exists(&self, _from: Vec3, _to: Vec3) -> bool {
            self.walkable
        }

        fn find_path(&self, _from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
            self.walkable.then(|| vec![to])
        }

        fn sample_position(&self, position: Vec3, _max_distance: f64) -> Option<Vec3> {
            self.walkable.then_some(position)
        }
    }

    fn ctx<'a>(field: &'a Field, target: Option<Vec3>) -> TickContext<'a, Field> {
        TickContext {
            now: 0.0,
            dt: 0.1,
            target,
            spatial: field,
            commander: None,
            formation_ready: true,
        }
    }

    fn agent_at(position: Vec3) -> Agent {
        Agent::new(AgentId(0), AgentSpawn::at("a", position), None)
    }

    #[test]
    fn test_patrol_advances_waypoint_on_arrival() {
        let field = Field { clear_sight: false, walkable: true };
        let mut agent = agent_at(Vec3::new(0.2, 0.0, 0.0));
        agent.waypoints = vec![Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0)];
        let mut covers = CoverRegistry::new();

        execute(&mut agent, &mut covers, &ctx(&field, None));
        assert_eq!(agent.current_waypoint, 1);
        assert_eq!(agent.nav.destination(), Some(Vec3::new(10.0, 0.0, 0.0)));
    }

    #[test]
    fn test_patrol_holds_until_formation_ready() {
        let field = Field { clear_sight: false, walkable: true };
        let mut agent = agent_at(Vec3::ZERO);
        agent.waypoints = vec![Vec3::new(10.0, 0.0, 0.0)];
        let mut covers = CoverRegistry::new();
        let mut context = ctx(&field, None);
        context.formation_ready = false;

        execute(&mut agent, &mut covers, &context);
        assert!(agent.nav.is_stopped());
        assert!(agent.nav.destination().is_none());
    }

    #[test]
    fn test_follower_catches_up_to_formation_slot() {
        let field = Field { clear_sight: false, walkable: true };
        let mut agent = agent_at(Vec3::new(-10.0, 0.0, 0.0));
        agent.formation_offset.right = 2.0;
        let mut covers = CoverRegistry::new();
        let mut context = ctx(&field, None);
        context.commander = Some(CommanderView { position: Vec3::ZERO, yaw_deg: 90.0 });

        agent.state = AgentState::FollowCommander;
        execute(&mut agent, &mut covers, &context);
        // 北向きの指揮官の右は東
        let slot = agent.nav.destination().unwrap();
        assert!((slot.x - 2.0).abs() < 1e-9 && slot.y.abs() < 1e-9);
        assert_eq!(agent.nav.speed(), agent.tuning.catch_up_speed);
    }

    #[test]
    fn test_attack_claims_cover_and_alerts_once() {
        let field = Field { clear_sight: false, walkable: true };
        let mut agent = agent_at(Vec3::ZERO);
        agent.state = AgentState::Attack;
        let mut covers = CoverRegistry::new();
        let cover = covers.register(Vec3::new(3.0, 0.0, 0.0), Concealment::Standing);
        let target = Some(Vec3::new(20.0, 0.0, 0.0));

        let outcome = execute(&mut agent, &mut covers, &ctx(&field, target));
        assert_eq!(outcome.alert, target);
        assert_eq!(outcome.transition, Some(AgentState::MoveToCover { cover }));
        assert_eq!(covers.holder(cover), Some(AgentId(0)));

        // 2回目は警報しない
        agent.held_cover = None;
        covers.release(cover);
        let outcome = execute(&mut agent, &mut covers, &ctx(&field, target));
        assert_eq!(outcome.alert, None);
    }

    #[test]
    fn test_peek_shoot_stops_when_both_sides_blocked() {
        let field = Field { clear_sight: false, walkable: false };
        let mut agent = agent_at(Vec3::ZERO);
        let mut covers = CoverRegistry::new();
        let cover = covers.register(Vec3::ZERO, Concealment::Standing);
        agent.state = AgentState::PeekShoot { cover, lateral: Vec3::new(0.0, 1.0, 0.0), shoot_timer: 0.0 };

        let outcome = execute(&mut agent, &mut covers, &ctx(&field, Some(Vec3::new(15.0, 0.0, 0.0))));
        assert_eq!(outcome, StepOutcome::default());
        assert!(agent.nav.is_stopped());
        assert_eq!(agent.state.kind(), crate::models::agent::StateKind::PeekShoot);
    }

    #[test]
    fn test_peek_shoot_returns_to_cover_after_duration() {
        let field = Field { clear_sight: true, walkable: true };
        let mut agent = agent_at(Vec3::ZERO);
        let mut covers = CoverRegistry::new();
        let cover = covers.register(Vec3::ZERO, Concealment::Standing);
        agent.state = AgentState::PeekShoot { cover, lateral: Vec3::new(0.0, 1.0, 0.0), shoot_timer: 1.95 };

        let outcome = execute(&mut agent, &mut covers, &ctx(&field, Some(Vec3::new(15.0, 0.0, 0.0))));
        assert!(outcome.shot.is_some());
        assert_eq!(outcome.transition, Some(AgentState::behind_cover(cover)));
    }

    #[test]
    fn test_search_sweeps_then_returns_to_default() {
        let field = Field { clear_sight: false, walkable: true };
        let mut agent = agent_at(Vec3::ZERO);
        agent.perception.share_sighting(Vec3::ZERO, 0.0);
        agent.state = AgentState::search(Vec3::ZERO);
        let mut covers = CoverRegistry::new();

        let mut result = None;
        for _ in 0..40 {
            let outcome = execute(&mut agent, &mut covers, &ctx(&field, None));
            if outcome.transition.is_some() {
                result = outcome.transition;
                break;
            }
        }
        assert_eq!(result, Some(AgentState::Patrol));
        assert!(agent.perception.last_seen_position().is_none());
    }
}
