use tracing::{debug, info, trace, warn};

use crate::models::{
    agent::{Agent, AgentSpawn, AgentState, StateKind},
    common::{AgentId, AgentStatus, CoverId, Posture, Vec3},
    cover::{Concealment, CoverRegistry},
    squad::{SquadCoordinator, SquadRegistry},
    state_machine::{self, CommanderView, StepOutcome, TickContext},
    target::Target,
    traits::{
        BodySphere, Collider, DamageOutcome, FireOutcome, IDamageable, ISpatialQuery, IWeapon, LayerMask, RayQuery,
    },
};

/// エージェントの衝突判定球の中心高さ
const AGENT_BODY_HEIGHT: f64 = 1.0;
const AGENT_BODY_RADIUS: f64 = 0.4;

/// ワールドの累積統計
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldStats {
    pub shots_fired: usize,
    pub hits: usize,
    pub target_shots: usize,
    pub agents_killed: usize,
    pub promotions: usize,
    pub alerts: usize,
    pub transitions: usize,
    pub invalid_entries: usize,
}

/// シミュレーションワールド
///
/// エージェントのアリーナ、カバーレジストリ、分隊レジストリ、ターゲット、
/// 空間クエリコラボレーターを所有します。エージェント間の参照はすべて
/// `AgentId`経由で解決します。
pub struct World<S: ISpatialQuery> {
    spatial: S,
    agents: Vec<Option<Agent>>,
    pub covers: CoverRegistry,
    pub squads: SquadRegistry,
    pub target: Option<Target>,
    now: f64,
    pub stats: WorldStats,
}

impl<S: ISpatialQuery> World<S> {
    pub fn new(spatial: S) -> Self {
        Self {
            spatial,
            agents: Vec::new(),
            covers: CoverRegistry::new(),
            squads: SquadRegistry::new(),
            target: None,
            now: 0.0,
            stats: WorldStats::default(),
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn spatial(&self) -> &S {
        &self.spatial
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub fn register_cover(&mut self, position: Vec3, concealment: Concealment) -> CoverId {
        self.covers.register(position, concealment)
    }

    /// エージェントを生成する
    ///
    /// 初期状態は巡回点・指揮官の有無から決まります。指揮官を指定した場合は
    /// その指揮官の分隊へ随伴者として加わります（分隊がなければ作られます）。
    pub fn spawn(&mut self, spawn: AgentSpawn, commander: Option<AgentId>, formation_tolerance: f64) -> AgentId {
        let id = AgentId(self.agents.len() as u32);
        let commander = commander.filter(|c| *c != id && self.agent(*c).is_some());
        let mut agent = Agent::new(id, spawn, commander);
        agent.state = agent.default_state();
        debug!(
            agent_id = %id,
            name = %agent.name,
            state = %agent.state.kind(),
            "AGENT_SPAWNED: エージェントを生成しました"
        );
        self.agents.push(Some(agent));

        if let Some(commander) = commander {
            match self.squads.squad_of_commander_mut(commander) {
                Some(squad) => squad.add_follower(id),
                None => self
                    .squads
                    .insert(SquadCoordinator::new(commander, vec![id], formation_tolerance)),
            }
        }
        id
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id.index()).and_then(Option::as_ref)
    }

    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter().flatten()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents().map(|agent| agent.id).collect()
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents().filter(|agent| agent.is_active()).count()
    }

    /// 状態ごとのエージェント数
    pub fn state_census(&self) -> Vec<(StateKind, usize)> {
        StateKind::ALL
            .iter()
            .map(|kind| (*kind, self.agents().filter(|a| a.state.kind() == *kind).count()))
            .collect()
    }

    /// エージェントが属する分隊の指揮官（自分が指揮官なら自分）
    pub fn squad_leader_of(&self, id: AgentId) -> Option<AgentId> {
        if self.squads.is_commander(id) {
            return Some(id);
        }
        self.agent(id).and_then(|agent| agent.commander)
    }

    /// 状態を置き換える唯一の入口
    ///
    /// 死亡したエージェントは遷移しません。前提を満たさない状態への遷移は
    /// 警告を出して安全な状態へ置き換えます。
    ///
    /// # 戻り値
    ///
    /// 遷移が行われた場合はtrue
    pub fn change_state(&mut self, id: AgentId, requested: AgentState) -> bool {
        let Some(agent) = self.agents.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        if !agent.is_active() {
            return false;
        }

        let mut next = requested;
        let cover_valid = |agent: &Agent, state: &AgentState, covers: &CoverRegistry| match state.required_cover() {
            Some(cover) => agent.held_cover == Some(cover) && covers.holder(cover) == Some(agent.id),
            None => true,
        };
        if !cover_valid(agent, &next, &self.covers) {
            let fallback = agent.search_or_default();
            warn!(
                agent_id = %id,
                requested = %next.kind(),
                fallback = %fallback.kind(),
                "INVALID_STATE_ENTRY: 有効なカバー占有がありません"
            );
            self.stats.invalid_entries += 1;
            next = fallback;
        }
        if matches!(next, AgentState::Search { .. }) && agent.perception.last_seen_position().is_none() {
            let fallback = agent.default_state();
            warn!(
                agent_id = %id,
                fallback = %fallback.kind(),
                "INVALID_STATE_ENTRY: 最終発見情報がないためSearchに入れません"
            );
            self.stats.invalid_entries += 1;
            next = fallback;
        }
        if matches!(next, AgentState::Death { .. }) {
            // 死亡はdieからのみ
            return false;
        }

        let from = agent.state.kind();
        if !next.is_engaged() {
            if let Some(cover) = agent.held_cover.take() {
                self.covers.release(cover);
            }
            agent.posture = Posture::Standing;
        }

        // 前状態の移動パラメータを破棄
        agent.nav.clear_destination();
        agent.nav.set_speed(agent.tuning.normal_speed);
        agent.nav.set_stopped(matches!(next, AgentState::BehindCover { .. }));

        agent.state = next;
        agent.transitioned_this_tick = true;
        agent.transition_count += 1;
        self.stats.transitions += 1;
        debug!(agent_id = %id, from = %from, to = %next.kind(), "AGENT_STATE_TRANSITION: 状態が遷移しました");

        if matches!(next, AgentState::Patrol) {
            if let Some(squad) = self.squads.squad_of_commander_mut(id) {
                squad.has_grouped_up = false;
            }
        }
        true
    }

    /// 外部からのダメージ
    pub fn take_damage(&mut self, id: AgentId, amount: f64) -> DamageOutcome {
        let Some(agent) = self.agent_mut(id) else {
            return DamageOutcome::AlreadyDead;
        };
        let outcome = agent.take_damage(amount);
        if outcome == DamageOutcome::Killed {
            self.die(id);
        }
        outcome
    }

    /// 死亡処理（どの状態からでも）
    ///
    /// 移動を止め、カバーを解放し、分隊から抜けます。指揮官だった場合は後継者を
    /// 昇格させます。シミュレーションからの除去は一定時間後です。
    pub fn die(&mut self, id: AgentId) -> bool {
        let Some(agent) = self.agents.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        if !agent.is_active() {
            return false;
        }

        let from = agent.state.kind();
        agent.status = AgentStatus::Dead;
        agent.state = AgentState::Death { elapsed: 0.0 };
        agent.transitioned_this_tick = true;
        agent.transition_count += 1;
        agent.nav.clear_destination();
        agent.nav.set_stopped(true);
        agent.held_cover = None;
        let commander = agent.commander.take();
        self.covers.release_all_held_by(id);
        self.stats.agents_killed += 1;
        info!(agent_id = %id, from = %from, "AGENT_DIED: エージェントが死亡しました");

        if let Some(commander) = commander {
            if let Some(squad) = self.squads.squad_of_commander_mut(commander) {
                squad.remove_follower(id);
            }
        }
        if self.squads.is_commander(id) {
            self.promote_successor(id);
        }
        true
    }

    /// 後継の指揮官を昇格させる
    ///
    /// 随伴者がいなければ何もしません（分隊は解散）。
    pub fn promote_successor(&mut self, old_commander: AgentId) -> Option<AgentId> {
        let squad = self.squads.remove(old_commander)?;
        let Some(origin) = self.agent(old_commander).map(Agent::position) else {
            warn!(agent_id = %old_commander, "SQUAD_INCONSISTENT: 旧指揮官が存在しません");
            return None;
        };

        let successor = squad.nearest_follower(origin, |f| {
            self.agent(f).filter(|a| a.is_active()).map(Agent::position)
        });
        let Some(successor) = successor else {
            info!(agent_id = %old_commander, "SQUAD_DISBANDED: 後継者がいないため分隊を解散しました");
            return None;
        };

        let (waypoints, current_waypoint) = self
            .agent(old_commander)
            .map(|a| (a.waypoints.clone(), a.current_waypoint))
            .unwrap_or_default();
        let remaining: Vec<AgentId> = squad
            .followers()
            .iter()
            .copied()
            .filter(|f| *f != successor)
            .collect();

        if let Some(new_commander) = self.agent_mut(successor) {
            new_commander.waypoints = waypoints;
            new_commander.current_waypoint = current_waypoint;
            new_commander.commander = None;
        }
        self.squads
            .insert(SquadCoordinator::new(successor, remaining.clone(), squad.formation_tolerance));

        for follower in &remaining {
            if let Some(agent) = self.agent_mut(*follower) {
                agent.commander = Some(successor);
            }
            self.change_state(*follower, AgentState::FollowCommander);
        }
        self.change_state(successor, AgentState::Patrol);

        self.stats.promotions += 1;
        info!(
            old_commander = %old_commander,
            new_commander = %successor,
            followers = remaining.len(),
            waypoint = current_waypoint,
            "SQUAD_COMMANDER_PROMOTED: 新しい指揮官を昇格させました"
        );
        Some(successor)
    }

    /// 分隊全体に警報を出す
    ///
    /// 交戦していない生存メンバーをAttackへ遷移させ、ターゲット位置を共有します。
    /// 既に交戦中のメンバーには何もしません。
    ///
    /// # 戻り値
    ///
    /// 遷移させたメンバー数
    pub fn alert_all(&mut self, commander: AgentId, target_position: Vec3) -> usize {
        let mut members = vec![commander];
        if let Some(squad) = self.squads.squad_of_commander(commander) {
            members.extend_from_slice(squad.followers());
        }

        let now = self.now;
        let mut alerted = 0;
        for member in members {
            let Some(agent) = self.agent_mut(member) else {
                continue;
            };
            if !agent.is_active() || agent.state.is_engaged() {
                continue;
            }
            agent.perception.share_sighting(target_position, now);
            agent.perception.has_alerted_squad = true;
            if self.change_state(member, AgentState::Attack) {
                alerted += 1;
            }
        }

        self.stats.alerts += 1;
        info!(
            commander_id = %commander,
            target = %target_position,
            alerted,
            "SQUAD_ALERT: 分隊に警報を出しました"
        );
        alerted
    }

    /// 1ステップ進める
    pub fn step(&mut self, dt: f64) {
        for agent in self.agents.iter_mut().flatten() {
            agent.transitioned_this_tick = false;
        }

        if let Some(target) = self.target.as_mut() {
            target.tick(dt);
        }
        self.sync_bodies();

        for id in self.agent_ids() {
            self.tick_agent(id, dt);
        }
        self.target_fire();

        for agent in self.agents.iter_mut().flatten() {
            if agent.is_active() {
                agent.nav.advance(dt);
            }
        }
        self.remove_destroyed();
        self.now += dt;
    }

    /// 衝突判定コラボレーターへ現在の体の位置を通知
    fn sync_bodies(&mut self) {
        let target = self.target.as_ref().and_then(Target::body);
        let bodies: Vec<(AgentId, BodySphere)> = self
            .agents()
            .filter(|agent| agent.is_active())
            .map(|agent| {
                (
                    agent.id,
                    BodySphere {
                        center: agent.position() + Vec3::UP * AGENT_BODY_HEIGHT,
                        radius: AGENT_BODY_RADIUS,
                    },
                )
            })
            .collect();
        self.spatial.sync_bodies(target, &bodies);
    }

    /// 1エージェント分のティック（知覚 → 遷移ドライバ → 状態処理）
    pub fn tick_agent(&mut self, id: AgentId, dt: f64) {
        let now = self.now;
        let target_position = self.target.as_ref().and_then(Target::visible_position);

        let Some(agent) = self.agents.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        match agent.status {
            AgentStatus::Active => {}
            AgentStatus::Dead => {
                if let AgentState::Death { elapsed } = agent.state {
                    let elapsed = elapsed + dt;
                    agent.state = AgentState::Death { elapsed };
                    if elapsed >= agent.tuning.destroy_delay_s {
                        agent.status = AgentStatus::Destroyed;
                    }
                }
                return;
            }
            AgentStatus::Destroyed => return,
        }

        let snapshot = agent.perception.tick(
            dt,
            now,
            agent.nav.position(),
            agent.nav.forward(),
            target_position,
            &self.spatial,
            id,
        );

        let engaged = agent.state.is_engaged();
        if snapshot.can_see_target && !engaged {
            self.change_state(id, AgentState::Attack);
        } else if !snapshot.can_see_target && engaged {
            let timeout = agent.perception.tuning.search_timeout_s;
            let timed_out = agent.perception.time_since_last_seen(now).is_none_or(|t| t > timeout);
            if timed_out {
                agent.posture = Posture::Standing;
                let next = agent.search_or_default();
                self.change_state(id, next);
            }
        }

        let commander = self.commander_view(id);
        let patrolling = self.agent(id).is_some_and(|a| a.state == AgentState::Patrol);
        let formation_ready = !patrolling || self.formation_ready(id);
        let Some(agent) = self.agents.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        if agent.transitioned_this_tick {
            return;
        }

        let ctx = TickContext {
            now,
            dt,
            target: target_position,
            spatial: &self.spatial,
            commander,
            formation_ready,
        };
        let outcome = state_machine::execute(agent, &mut self.covers, &ctx);
        self.apply_outcome(id, outcome);
    }

    fn commander_view(&self, id: AgentId) -> Option<CommanderView> {
        let commander = self.agent(id)?.commander?;
        self.agent(commander)
            .filter(|c| c.is_active())
            .map(|c| CommanderView { position: c.position(), yaw_deg: c.nav.yaw_deg() })
    }

    /// 指揮官が巡回を始めてよいか（初回は隊形が揃うまで待つ）
    fn formation_ready(&mut self, id: AgentId) -> bool {
        let Some(squad) = self.squads.squad_of_commander(id) else {
            return true;
        };
        if squad.has_grouped_up {
            return true;
        }
        let Some(origin) = self.agent(id).map(Agent::position) else {
            return true;
        };
        let ready = squad.all_followers_in_formation(origin, |f| {
            self.agent(f).filter(|a| a.is_active()).map(Agent::position)
        });
        if ready {
            if let Some(squad) = self.squads.squad_of_commander_mut(id) {
                squad.has_grouped_up = true;
            }
            debug!(commander_id = %id, "SQUAD_GROUPED_UP: 隊形が揃いました");
        }
        ready
    }

    fn apply_outcome(&mut self, id: AgentId, outcome: StepOutcome) {
        if let Some(damage) = outcome.shot {
            self.resolve_shot(id, damage);
        }
        if let Some(next) = outcome.transition {
            self.change_state(id, next);
        }
        if let Some(position) = outcome.alert {
            match self.squad_leader_of(id) {
                Some(leader) => {
                    self.alert_all(leader, position);
                }
                None => trace!(agent_id = %id, "SQUAD_ALERT_SKIPPED: 分隊に属していません"),
            }
        }
    }

    /// 射撃の命中判定（銃口からターゲットの胸への射線）
    fn resolve_shot(&mut self, shooter: AgentId, damage: f64) {
        self.stats.shots_fired += 1;
        let Some(muzzle) = self.agent(shooter).map(Agent::eye) else {
            return;
        };
        let Some(target) = self.target.as_mut().filter(|t| t.is_alive()) else {
            return;
        };
        let aim = target.chest();
        let query = RayQuery {
            origin: muzzle,
            direction: aim - muzzle,
            max_distance: muzzle.distance(&aim) + target.body_radius,
            mask: LayerMask::all(),
            ignore: Some(shooter),
        };
        match self.spatial.raycast(&query) {
            Some(hit) if hit.collider == Collider::Target => {
                self.stats.hits += 1;
                let outcome = target.take_damage(damage);
                trace!(agent_id = %shooter, outcome = ?outcome, "SHOT_HIT: ターゲットに命中しました");
            }
            other => {
                trace!(agent_id = %shooter, hit = ?other.map(|h| h.collider), "SHOT_MISSED: 射線が遮られました");
            }
        }
    }

    /// ターゲットの反撃（射程内で射線の通る最寄りのエージェントを撃つ）
    fn target_fire(&mut self) {
        let now = self.now;
        let Some(target) = self.target.as_ref().filter(|t| t.is_alive() && t.weapon.is_some()) else {
            return;
        };
        let origin = target.chest();
        let range = target.engage_range;

        let mut victim: Option<(AgentId, f64)> = None;
        for agent in self.agents().filter(|a| a.is_active()) {
            let center = agent.position() + Vec3::UP * AGENT_BODY_HEIGHT;
            let distance = origin.distance(&center);
            if distance > range || victim.is_some_and(|(_, best)| best <= distance) {
                continue;
            }
            let query = RayQuery {
                origin,
                direction: center - origin,
                max_distance: distance + AGENT_BODY_RADIUS,
                mask: LayerMask::OBSTACLE | LayerMask::AGENT,
                ignore: None,
            };
            if matches!(self.spatial.raycast(&query), Some(hit) if hit.collider == Collider::Agent(agent.id)) {
                victim = Some((agent.id, distance));
            }
        }
        let Some((victim, _)) = victim else {
            return;
        };

        let Some(weapon) = self.target.as_mut().and_then(|t| t.weapon.as_mut()) else {
            return;
        };
        if let FireOutcome::Fired { damage } = weapon.fire(now) {
            self.stats.target_shots += 1;
            let outcome = self.take_damage(victim, damage);
            trace!(agent_id = %victim, outcome = ?outcome, "TARGET_FIRED: ターゲットが反撃しました");
        }
    }

    /// 破棄時刻を過ぎたエージェントをアリーナから除去する
    pub fn remove_destroyed(&mut self) -> Vec<AgentId> {
        let mut removed = Vec::new();
        for slot in self.agents.iter_mut() {
            if slot.as_ref().is_some_and(|a| a.status == AgentStatus::Destroyed) {
                if let Some(agent) = slot.take() {
                    debug!(agent_id = %agent.id, "AGENT_DESTROYED: エージェントを除去しました");
                    removed.push(agent.id);
                }
            }
        }
        removed
    }
}
