//! Election state machine.
//!
//! `Elector` holds no timers and does no IO. The caller is responsible for:
//! - Feeding every election message received from peers to `handle_message()`
//! - Calling `tick()` once `next_deadline()` has passed
//! - Acting on the returned `ElectionEffect`s (broadcasting, running callbacks)
//!
//! The async driver in [`super::leader`] does exactly that.

use super::config::ElectionConfig;
use super::messages::{ElectionAction, ElectionMessage, ElectionToken, Precedence};
use std::time::Duration;
use tracing::{debug, info};

/// Which half of the application window a candidate is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRound {
    /// First APPLY sent, waiting for objections.
    First,
    /// Second APPLY sent as a liveness re-check.
    Recheck,
}

/// An application in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub round: ApplyRound,
    /// When the current response window closes (ms).
    pub deadline: u64,
    /// Set once something told us to give up. Checked when the window closes.
    pub conceded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Applying(Application),
    Leader,
    /// Terminal.
    Dead,
}

/// Why an elector stopped being leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeposeReason {
    /// `depose()` called locally.
    Requested,
    /// A dictator applied while we led as a non-dictator.
    Coup,
    /// Another leader that outranks us announced itself.
    Outranked,
    /// `die()` called locally.
    Death,
}

/// Something the caller must do on the elector's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEffect {
    /// Post this message to every peer on the channel.
    Broadcast(ElectionMessage),
    /// We just won an election.
    BecameLeader,
    /// We were leader and no longer are.
    Deposed(DeposeReason),
    /// Some elector (possibly us) is confirmed leader.
    LeaderConfirmed,
}

#[derive(Debug, Clone, Copy)]
enum WindowStep {
    Nothing,
    GiveUp,
    Recheck,
    Win,
}

pub struct Elector {
    dictator: bool,
    response_time: Duration,
    fallback_interval: Duration,
    token: ElectionToken,
    phase: Phase,
    /// Token of the leader we last heard from (ours when leading).
    leader: Option<ElectionToken>,
    /// Next fallback retry, present while awaiting leadership.
    retry_at: Option<u64>,
}

impl Elector {
    /// Create an idle elector. `response_time` is the already-resolved
    /// objection window (see [`ElectionConfig::response_time`]).
    pub fn new(config: &ElectionConfig, response_time: Duration) -> Self {
        Self {
            dictator: config.dictator,
            response_time,
            fallback_interval: config.fallback_interval,
            token: ElectionToken::generate(),
            phase: Phase::Idle,
            leader: None,
            retry_at: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn token(&self) -> &ElectionToken {
        &self.token
    }

    pub fn is_dictator(&self) -> bool {
        self.dictator
    }

    pub fn is_leader(&self) -> bool {
        self.phase == Phase::Leader
    }

    pub fn is_dead(&self) -> bool {
        self.phase == Phase::Dead
    }

    pub fn is_applying(&self) -> bool {
        matches!(self.phase, Phase::Applying(_))
    }

    /// True while some elector (possibly us) is known to lead.
    pub fn leader_exists(&self) -> bool {
        self.leader.is_some()
    }

    /// True while retrying for leadership on the fallback interval.
    pub fn is_awaiting(&self) -> bool {
        self.retry_at.is_some()
    }

    pub fn response_time(&self) -> Duration {
        self.response_time
    }

    pub fn precedence(&self) -> Precedence {
        Precedence::new(self.dictator, self.token.clone())
    }

    /// Earliest time `tick()` has work to do, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let window = match &self.phase {
            Phase::Applying(app) => Some(app.deadline),
            Phase::Leader | Phase::Dead => return None,
            Phase::Idle => None,
        };
        match (window, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start competing for leadership until we win, die or get deposed.
    ///
    /// Applies once immediately, then again every fallback interval and
    /// whenever a DEATH is heard.
    pub fn await_leadership(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        if matches!(self.phase, Phase::Leader | Phase::Dead) {
            return Vec::new();
        }
        self.retry_at = Some(now_ms + millis(self.fallback_interval));
        self.apply_once(now_ms)
    }

    /// Send one APPLY with a fresh token. No-op unless idle.
    pub fn apply_once(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        self.token = ElectionToken::generate();
        self.phase = Phase::Applying(Application {
            round: ApplyRound::First,
            deadline: now_ms + millis(self.response_time),
            conceded: false,
        });
        debug!(token = %self.token, dictator = self.dictator, "Applying for leadership");
        vec![ElectionEffect::Broadcast(ElectionMessage::apply(
            self.token.clone(),
            self.dictator,
        ))]
    }

    /// Process a message from a peer.
    pub fn handle_message(&mut self, msg: ElectionMessage, now_ms: u64) -> Vec<ElectionEffect> {
        if self.is_dead() || msg.token == self.token {
            return Vec::new();
        }
        match msg.action {
            ElectionAction::Apply => self.on_apply(&msg),
            ElectionAction::Tell => self.on_tell(&msg),
            ElectionAction::Death => self.on_death(&msg, now_ms),
        }
    }

    fn on_apply(&mut self, msg: &ElectionMessage) -> Vec<ElectionEffect> {
        let theirs = msg.precedence();
        let mine = self.precedence();
        match &mut self.phase {
            Phase::Leader if msg.dictator && !self.dictator => {
                info!(dictator = %msg.token, "Dictator applied, stepping down");
                self.depose_with(DeposeReason::Coup)
            }
            Phase::Leader => {
                debug!(challenger = %msg.token, "Answering challenger");
                vec![ElectionEffect::Broadcast(ElectionMessage::tell(
                    self.token.clone(),
                    self.dictator,
                ))]
            }
            Phase::Applying(app) => {
                if theirs.beats(&mine) && !app.conceded {
                    debug!(rival = %msg.token, "Outranked by rival applicant, conceding");
                    app.conceded = true;
                }
                Vec::new()
            }
            Phase::Idle | Phase::Dead => Vec::new(),
        }
    }

    fn on_tell(&mut self, msg: &ElectionMessage) -> Vec<ElectionEffect> {
        let theirs = msg.precedence();
        let mine = self.precedence();
        let mut effects = Vec::new();

        match &mut self.phase {
            Phase::Applying(app) => {
                // A dictator applicant ignores non-dictator leaders; they step
                // down as soon as they see its APPLY.
                if msg.dictator || !self.dictator {
                    debug!(leader = %msg.token, "Leader already exists, conceding");
                    app.conceded = true;
                }
            }
            Phase::Leader => {
                if theirs.beats(&mine) {
                    info!(leader = %msg.token, "Another leader outranks us, stepping down");
                    effects.extend(self.depose_with(DeposeReason::Outranked));
                } else {
                    // Split brain after lost messages: remind the weaker leader.
                    effects.push(ElectionEffect::Broadcast(ElectionMessage::tell(
                        self.token.clone(),
                        self.dictator,
                    )));
                    return effects;
                }
            }
            Phase::Idle | Phase::Dead => {}
        }

        self.leader = Some(msg.token.clone());
        effects.push(ElectionEffect::LeaderConfirmed);
        effects
    }

    fn on_death(&mut self, msg: &ElectionMessage, now_ms: u64) -> Vec<ElectionEffect> {
        if self.leader.as_ref() == Some(&msg.token) {
            debug!(leader = %msg.token, "Leader died");
            self.leader = None;
        }
        if self.is_awaiting() {
            self.apply_once(now_ms)
        } else {
            Vec::new()
        }
    }

    /// Advance timers: close response windows and fire fallback retries.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        let step = match &mut self.phase {
            Phase::Applying(app) if app.deadline <= now_ms => {
                if app.conceded {
                    WindowStep::GiveUp
                } else if app.round == ApplyRound::First {
                    app.round = ApplyRound::Recheck;
                    app.deadline = now_ms + millis(self.response_time);
                    WindowStep::Recheck
                } else {
                    WindowStep::Win
                }
            }
            _ => WindowStep::Nothing,
        };

        match step {
            WindowStep::Nothing => {}
            WindowStep::GiveUp => {
                debug!(token = %self.token, "Application abandoned");
                self.phase = Phase::Idle;
            }
            WindowStep::Recheck => {
                effects.push(ElectionEffect::Broadcast(ElectionMessage::apply(
                    self.token.clone(),
                    self.dictator,
                )));
            }
            WindowStep::Win => effects.extend(self.become_leader()),
        }

        if let Some(at) = self.retry_at {
            if at <= now_ms && self.phase != Phase::Leader {
                self.retry_at = Some(now_ms + millis(self.fallback_interval));
                effects.extend(self.apply_once(now_ms));
            }
        }

        effects
    }

    fn become_leader(&mut self) -> Vec<ElectionEffect> {
        info!(token = %self.token, dictator = self.dictator, "Became leader");
        self.phase = Phase::Leader;
        self.retry_at = None;
        self.leader = Some(self.token.clone());
        vec![
            ElectionEffect::Broadcast(ElectionMessage::tell(self.token.clone(), self.dictator)),
            ElectionEffect::BecameLeader,
            ElectionEffect::LeaderConfirmed,
        ]
    }

    /// Stop leading (or stop competing) and clear every pending timer.
    pub fn depose(&mut self) -> Vec<ElectionEffect> {
        self.depose_with(DeposeReason::Requested)
    }

    fn depose_with(&mut self, reason: DeposeReason) -> Vec<ElectionEffect> {
        let was_leader = self.is_leader();
        self.retry_at = None;
        if !self.is_dead() {
            self.phase = Phase::Idle;
        }
        if self.leader.as_ref() == Some(&self.token) {
            self.leader = None;
        }
        if was_leader {
            vec![ElectionEffect::Deposed(reason)]
        } else {
            Vec::new()
        }
    }

    /// Depose, announce DEATH and become permanently dead. Idempotent.
    pub fn die(&mut self) -> Vec<ElectionEffect> {
        if self.is_dead() {
            return Vec::new();
        }
        let mut effects = self.depose_with(DeposeReason::Death);
        self.phase = Phase::Dead;
        info!(token = %self.token, "Elector died");
        effects.push(ElectionEffect::Broadcast(ElectionMessage::death(
            self.token.clone(),
            self.dictator,
        )));
        effects
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
