//! Join/leave orchestration, substitute backfill, reset-in-place voting,
//! and expiration sweeps.
//!
//! Every method here runs either on the dispatcher's treat thread (via the
//! handler) or on the reaper timer thread; the `Lifecycle` itself sits
//! behind one mutex, and session state is only touched through registry
//! guards. Rules-engine errors are reported to the offending participant
//! and never tear down a session; guards release on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use parlor_net::connection::{ConnId, Connection};
use parlor_net::dispatcher::DispatcherHandle;
use parlor_types::rules::{GameRules, RuleEvent};
use parlor_types::store::{AccountStore, SeatOutcome};
use parlor_types::{SeatIndex, VOTE_MIN_VERSION};

use crate::registry::{LockError, SessionGuard, SessionRegistry};
use crate::session::{ResetVote, SessionState};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Idle lifetime of a session; activity refreshes it.
    pub session_ttl: Duration,
    /// Sessions this close to expiry get a warning each sweep.
    pub warning_window: Duration,
    /// Randomized pairwise swaps applied to the idle-substitute pool before
    /// picking, so backfill load spreads instead of always landing on the
    /// same participant.
    pub shuffle_swaps: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 60),
            warning_window: Duration::from_secs(5 * 60),
            shuffle_swaps: 8,
        }
    }
}

/// Factory for a new session's rules payload.
pub type RulesFactory = Box<dyn Fn(&str) -> Box<dyn GameRules> + Send>;

/// A vacated seat waiting for the specific automated participant asked to
/// fill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstituteRequest {
    pub session: String,
    pub seat: SeatIndex,
    pub bot: ConnId,
}

struct BotSlot {
    conn: Arc<Connection>,
    /// Session this bot is seated in or was asked to fill; `None` = idle.
    assignment: Option<String>,
}

/// Bounded randomized pairwise swaps over `0..len`; the fairness shuffle.
fn shuffle_order(rng: &mut StdRng, len: usize, swaps: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if len > 1 {
        for _ in 0..swaps {
            let i = rng.gen_range(0..len);
            let j = rng.gen_range(0..len);
            order.swap(i, j);
        }
    }
    order
}

fn relay_events(state: &SessionState, name: &str, events: &[RuleEvent]) {
    for event in events {
        match event {
            RuleEvent::All(text) => state.broadcast(&format!("event {} {}", name, text)),
            RuleEvent::Seat(seat, text) => {
                state.send_seat(*seat, &format!("event {} {}", name, text))
            }
        }
    }
}

fn player_of(conn: &Arc<Connection>) -> String {
    conn.key().unwrap_or("?").to_string()
}

pub struct Lifecycle {
    registry: Arc<SessionRegistry>,
    dispatcher: DispatcherHandle,
    store: Arc<dyn AccountStore>,
    new_rules: RulesFactory,
    config: LifecycleConfig,
    rng: StdRng,
    bots: HashMap<ConnId, BotSlot>,
    pending_subs: HashMap<String, Vec<SubstituteRequest>>,
    /// Sessions each connection belongs to, for disconnect cleanup.
    memberships: HashMap<ConnId, Vec<String>>,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: DispatcherHandle,
        store: Arc<dyn AccountStore>,
        new_rules: RulesFactory,
        config: LifecycleConfig,
    ) -> Self {
        Self::with_rng(
            registry,
            dispatcher,
            store,
            new_rules,
            config,
            StdRng::from_entropy(),
        )
    }

    /// Seeded variant for deterministic tests.
    pub fn with_rng(
        registry: Arc<SessionRegistry>,
        dispatcher: DispatcherHandle,
        store: Arc<dyn AccountStore>,
        new_rules: RulesFactory,
        config: LifecycleConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            store,
            new_rules,
            config,
            rng,
            bots: HashMap::new(),
            pending_subs: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pending_substitutes(&self, session: &str) -> Vec<SubstituteRequest> {
        self.pending_subs
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    /// Automated participants currently enrolled.
    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    fn lock_or_report(&self, conn: &Arc<Connection>, name: &str) -> Option<SessionGuard> {
        match self.registry.lock_session(name) {
            Ok(guard) => Some(guard),
            Err(LockError::NoSuchSession) => {
                conn.put(&format!("error no-such-session {}", name));
                None
            }
            Err(e) => {
                warn!(target: "lifecycle", "lock '{}' failed: {}", name, e);
                conn.put(&format!("error session-busy {}", name));
                None
            }
        }
    }

    /// Enroll an automated participant into the substitute pool.
    pub fn register_bot(&mut self, conn: &Arc<Connection>) {
        self.bots.insert(
            conn.id(),
            BotSlot {
                conn: conn.clone(),
                assignment: None,
            },
        );
        conn.put("ok enlist");
        info!(target: "lifecycle", "{} enlisted as substitute", conn.id());
    }

    /// Join a session, creating it on first reference. A seat request rides
    /// along when given.
    pub fn join(&mut self, conn: &Arc<Connection>, name: &str, seat: Option<SeatIndex>) {
        if !self.registry.contains(name) {
            match self.registry.lock_global() {
                Ok(global) => {
                    let rules = (self.new_rules)(name);
                    if self.registry.create_session(
                        &global,
                        name,
                        rules,
                        self.config.session_ttl,
                    ) {
                        self.dispatcher.broadcast(&format!("session {} created", name));
                    }
                }
                Err(e) => {
                    error!(target: "lifecycle", "global lock failed: {}", e);
                    conn.put("error registry-busy");
                    return;
                }
            }
        }

        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };

        {
            let mut state = guard.state();
            let min = state.rules.min_version();
            if conn.version() < min {
                conn.put(&format!(
                    "error version-too-low session {} requires {}",
                    name, min
                ));
                return;
            }
            if !state.add_member(conn.clone()) {
                conn.put(&format!("error already-joined {}", name));
                return;
            }
            self.memberships
                .entry(conn.id())
                .or_default()
                .push(name.to_string());

            let player = player_of(conn);
            state.broadcast(&format!("joined {} {}", name, player));
            conn.put(&format!("ok join {}", name));
            conn.put(&format!("state {} {}", name, state.rules.serialize_state()));
            state.refresh_expiry(self.config.session_ttl);
        }

        if let Some(seat) = seat {
            self.seat_locked(conn, &guard, seat);
        }
    }

    /// Take a seat in a session already joined.
    pub fn sit(&mut self, conn: &Arc<Connection>, name: &str, seat: SeatIndex) {
        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };
        self.seat_locked(conn, &guard, seat);
    }

    fn seat_locked(&mut self, conn: &Arc<Connection>, guard: &SessionGuard, seat: SeatIndex) {
        let name = guard.name().to_string();
        let mut state = guard.state();

        if !state.is_member(conn) {
            conn.put(&format!("error not-in-session {}", name));
            return;
        }
        if state.seat_of(conn).is_some() {
            conn.put(&format!("error already-seated {}", name));
            return;
        }
        if !state.rules.is_seat_vacant(seat) {
            conn.put(&format!("error seat-taken {} {}", name, seat));
            return;
        }

        let turn_before = state.rules.current_turn_seat();
        if let Err(e) = state.rules.occupy(seat) {
            conn.put(&format!("error cannot-sit {} {}", name, e));
            return;
        }
        state.seats[seat.get()] = Some(conn.clone());
        state.broadcast(&format!("sat {} {} {}", name, player_of(conn), seat));
        state.refresh_expiry(self.config.session_ttl);

        self.settle_substitute_requests(conn, &name, seat);
        if conn.is_automated() {
            if let Some(slot) = self.bots.get_mut(&conn.id()) {
                slot.assignment = Some(name.clone());
            }
        }

        // Filling the last empty seat starts the game; filling the on-turn
        // seat (a substitute arriving mid-stall) re-issues the turn prompt.
        let turn_after = state.rules.current_turn_seat();
        if turn_before.is_none() {
            if let Some(turn) = turn_after {
                state.broadcast(&format!("event {} game-start", name));
                state.send_seat(turn, &format!("event {} your-turn", name));
            }
        } else if turn_after == Some(seat) {
            state.send_seat(seat, &format!("event {} your-turn", name));
        }
    }

    /// Drop any pending request for this seat: the filler's own request
    /// completes, anyone else's is cancelled and their bot released.
    fn settle_substitute_requests(&mut self, filler: &Arc<Connection>, name: &str, seat: SeatIndex) {
        let reqs = match self.pending_subs.get_mut(name) {
            Some(r) => r,
            None => return,
        };
        let mut released = Vec::new();
        reqs.retain(|req| {
            if req.seat != seat {
                return true;
            }
            if req.bot != filler.id() {
                released.push(req.bot);
            }
            false
        });
        if reqs.is_empty() {
            self.pending_subs.remove(name);
        }
        for bot_id in released {
            if let Some(slot) = self.bots.get_mut(&bot_id) {
                slot.assignment = None;
                slot.conn.put(&format!("sub-cancel {} {}", name, seat));
            }
        }
    }

    /// Voluntary leave.
    pub fn leave(&mut self, conn: &Arc<Connection>, name: &str) {
        if self.depart(conn, name) {
            conn.put(&format!("ok leave {}", name));
        } else {
            conn.put(&format!("error not-in-session {}", name));
        }
    }

    /// Shared leave/disconnect path. Returns false if the connection was not
    /// a member.
    fn depart(&mut self, conn: &Arc<Connection>, name: &str) -> bool {
        let guard = match self.registry.lock_session(name) {
            Ok(g) => g,
            Err(_) => return false,
        };

        let mut destroy_after = false;
        {
            let mut state = guard.state();
            if !state.remove_member(conn) {
                return false;
            }
            if let Some(list) = self.memberships.get_mut(&conn.id()) {
                list.retain(|s| s != name);
            }
            state.broadcast(&format!("left {} {}", name, player_of(conn)));

            if let Some(seat) = state.seat_of(conn) {
                state.seats[seat.get()] = None;
                let was_turn = state.rules.current_turn_seat() == Some(seat);
                if let Err(e) = state.rules.vacate(seat) {
                    warn!(target: "lifecycle", "vacate {} in '{}': {}", seat, name, e);
                }
                if conn.is_automated() {
                    if let Some(slot) = self.bots.get_mut(&conn.id()) {
                        slot.assignment = None;
                    }
                }
                if !state.rules.is_over() && state.rules.seat_needs_substitute(seat) {
                    self.backfill(name, &mut state, seat, was_turn);
                }
            }

            if state.human_count() == 0 {
                destroy_after = true;
                // Seated bots go back to the idle pool.
                let seated: Vec<Arc<Connection>> =
                    state.seats.iter().flatten().cloned().collect();
                for c in seated {
                    if c.is_automated() {
                        if let Some(slot) = self.bots.get_mut(&c.id()) {
                            slot.assignment = None;
                        }
                        c.put(&format!("released {}", name));
                    }
                }
            } else {
                state.refresh_expiry(self.config.session_ttl);
            }
        }
        drop(guard);

        if destroy_after {
            self.destroy(name);
        }
        true
    }

    /// Pick an idle automated participant (fairness-shuffled) for a vacated
    /// seat, or keep the session moving without one.
    fn backfill(&mut self, name: &str, state: &mut SessionState, seat: SeatIndex, was_turn: bool) {
        let idle: Vec<ConnId> = self
            .bots
            .iter()
            .filter(|(_, slot)| slot.assignment.is_none() && slot.conn.is_connected())
            .map(|(id, _)| *id)
            .collect();

        if !idle.is_empty() {
            let order = shuffle_order(&mut self.rng, idle.len(), self.config.shuffle_swaps);
            let chosen = idle[order[0]];
            if let Some(slot) = self.bots.get_mut(&chosen) {
                slot.assignment = Some(name.to_string());
                slot.conn.put(&format!("sub {} {}", name, seat));
            }
            self.pending_subs
                .entry(name.to_string())
                .or_default()
                .push(SubstituteRequest {
                    session: name.to_string(),
                    seat,
                    bot: chosen,
                });
            state.broadcast(&format!(
                "event {} substitute requested for seat {}",
                name, seat
            ));
            return;
        }

        // Nobody to ask. Never silent: the remaining players hear about it.
        if was_turn {
            if state.rules.can_advance_turn() {
                match state.rules.advance_turn() {
                    Ok(events) => relay_events(state, name, &events),
                    Err(e) => warn!(target: "lifecycle", "advance in '{}': {}", name, e),
                }
            } else {
                let events = state.rules.abort_turn();
                relay_events(state, name, &events);
            }
        }
        state.broadcast(&format!(
            "event {} seat {} abandoned, no substitute available",
            name, seat
        ));
    }

    /// Apply a game move for the seat this connection holds.
    pub fn apply_move(&mut self, conn: &Arc<Connection>, name: &str, text: &str) {
        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };
        let mut state = guard.state();

        let seat = match state.seat_of(conn) {
            Some(s) => s,
            None => {
                conn.put(&format!("error not-seated {}", name));
                return;
            }
        };

        let was_over = state.rules.is_over();
        match state.rules.apply_command(seat, text) {
            Ok(events) => {
                relay_events(&state, name, &events);
                state.refresh_expiry(self.config.session_ttl);
                if !was_over && state.rules.is_over() {
                    self.record_outcomes(name, &state);
                }
            }
            Err(e) => {
                // Session-logic error: report and continue.
                conn.put(&format!("error illegal-move {} {}", name, e));
            }
        }
    }

    fn record_outcomes(&self, name: &str, state: &SessionState) {
        let standings = state.rules.final_standings();
        let outcomes: Vec<SeatOutcome> = standings
            .iter()
            .enumerate()
            .filter_map(|(i, (score, won))| {
                state.occupant(SeatIndex::new(i)).map(|c| SeatOutcome {
                    player: player_of(c),
                    score: *score,
                    won: *won,
                })
            })
            .collect();
        if let Err(e) = self.store.record_outcome(name, &outcomes) {
            error!(target: "lifecycle", "recording outcome of '{}': {}", name, e);
        }
    }

    /// Relay table talk.
    pub fn say(&mut self, conn: &Arc<Connection>, name: &str, text: &str) {
        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };
        let state = guard.state();
        if !state.is_member(conn) {
            conn.put(&format!("error not-in-session {}", name));
            return;
        }
        state.broadcast(&format!("say {} {} {}", name, player_of(conn), text));
    }

    /// Open (or immediately execute) a reset-in-place.
    pub fn reset_request(&mut self, conn: &Arc<Connection>, name: &str) {
        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };
        let mut state = guard.state();

        let seat = match state.seat_of(conn) {
            Some(s) => s,
            None => {
                conn.put(&format!("error not-seated {}", name));
                return;
            }
        };

        // A second request while a vote runs is a no-op, not an error; an
        // error would read like the in-flight vote ended.
        if state.reset_vote.is_some() {
            return;
        }

        let humans = state.seated_humans();
        if humans.len() < 2 {
            self.perform_reset(name, &mut state);
            return;
        }

        let mut vote = ResetVote::new(state.rules.seat_count(), seat);
        for (s, c) in &humans {
            if *s == seat {
                continue;
            }
            if c.version() >= VOTE_MIN_VERSION {
                vote.expect(*s);
            } else {
                // Policy: clients too old to see the prompt count as "yes";
                // silence must not become a veto.
                vote.auto_yes(*s);
            }
        }

        if vote.expected_seats().is_empty() {
            self.perform_reset(name, &mut state);
            return;
        }

        for s in vote.expected_seats() {
            state.send_seat(*s, &format!("reset-vote {} {}", name, seat));
        }
        state.broadcast(&format!("event {} reset requested by seat {}", name, seat));
        state.reset_vote = Some(vote);
    }

    /// Register one seat's vote on an open reset.
    pub fn reset_vote(&mut self, conn: &Arc<Connection>, name: &str, yes: bool) {
        let guard = match self.lock_or_report(conn, name) {
            Some(g) => g,
            None => return,
        };
        let mut state = guard.state();

        let seat = match state.seat_of(conn) {
            Some(s) => s,
            None => {
                conn.put(&format!("error not-seated {}", name));
                return;
            }
        };

        let vote = match state.reset_vote.as_mut() {
            Some(v) => v,
            None => {
                conn.put(&format!("error no-vote-active {}", name));
                return;
            }
        };

        if !vote.record(seat, yes) {
            // Duplicate or unexpected ballot; intentionally ignored.
            return;
        }

        if !yes {
            state.reset_vote = None;
            state.broadcast(&format!("reset-rejected {}", name));
            return;
        }

        if vote.complete() {
            state.reset_vote = None;
            self.perform_reset(name, &mut state);
        }
    }

    /// Rebuild the session payload in place: humans keep their seats without
    /// re-authenticating, automated seats re-enter through backfill.
    fn perform_reset(&mut self, name: &str, state: &mut SessionState) {
        let humans = state.seated_humans();
        let bot_seats: Vec<(SeatIndex, Arc<Connection>)> = state
            .seats
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some(c) if c.is_automated() => Some((SeatIndex::new(i), c.clone())),
                _ => None,
            })
            .collect();

        // Automated participants are not carried over.
        for (_, bot) in &bot_seats {
            state.remove_member(bot);
            if let Some(list) = self.memberships.get_mut(&bot.id()) {
                list.retain(|s| s != name);
            }
            if let Some(slot) = self.bots.get_mut(&bot.id()) {
                slot.assignment = None;
            }
            bot.put(&format!("released {}", name));
        }

        state.rules = state.rules.renewed();
        let seat_count = state.rules.seat_count();
        state.seats = (0..seat_count).map(|_| None).collect();
        state.reset_vote = None;

        for (seat, conn) in &humans {
            if let Err(e) = state.rules.occupy(*seat) {
                warn!(target: "lifecycle", "re-seating {} in '{}': {}", seat, name, e);
                continue;
            }
            state.seats[seat.get()] = Some(conn.clone());
        }

        state.broadcast(&format!("reset-done {}", name));
        state.broadcast(&format!("state {} {}", name, state.rules.serialize_state()));
        state.refresh_expiry(self.config.session_ttl);
        info!(target: "lifecycle", "session '{}' reset in place", name);

        for (seat, _) in bot_seats {
            self.backfill(name, state, seat, false);
        }
    }

    /// Periodic sweep, invoked by the reaper timer. Past-expiry sessions are
    /// destroyed with a deletion notice; sessions inside the warning window
    /// get one warning per sweep.
    pub fn check_expired(&mut self, now: Instant) {
        let names = self.registry.session_names();
        let mut doomed = Vec::new();

        for name in names {
            let guard = match self.registry.lock_session(&name) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let state = guard.state();
            if now >= state.expires_at {
                state.broadcast(&format!("event {} expired", name));
                doomed.push(name.clone());
            } else if state.expires_at - now <= self.config.warning_window {
                let remaining = (state.expires_at - now).as_secs();
                state.broadcast(&format!("event {} expiring-in {}s", name, remaining));
            }
        }

        for name in doomed {
            self.destroy(&name);
        }
    }

    fn destroy(&mut self, name: &str) {
        let destroyed = match self.registry.lock_global() {
            Ok(global) => self.registry.destroy_session(&global, name),
            Err(e) => {
                error!(target: "lifecycle", "global lock for destroy '{}': {}", name, e);
                false
            }
        };
        if !destroyed {
            return;
        }

        self.dispatcher.broadcast(&format!("session {} destroyed", name));
        if let Some(reqs) = self.pending_subs.remove(name) {
            for req in reqs {
                if let Some(slot) = self.bots.get_mut(&req.bot) {
                    slot.assignment = None;
                }
            }
        }
        for list in self.memberships.values_mut() {
            list.retain(|s| s != name);
        }
    }

    /// Disconnect cleanup: leave everything, release bot bookkeeping, retry
    /// substitute requests that were waiting on the vanished connection.
    pub fn connection_closed(&mut self, conn: &Arc<Connection>) {
        let sessions = self.memberships.remove(&conn.id()).unwrap_or_default();
        for name in sessions {
            self.depart(conn, &name);
        }

        if conn.is_automated() {
            self.bots.remove(&conn.id());
            let mut retries = Vec::new();
            for (name, reqs) in self.pending_subs.iter_mut() {
                reqs.retain(|req| {
                    if req.bot == conn.id() {
                        retries.push((name.clone(), req.seat));
                        false
                    } else {
                        true
                    }
                });
            }
            self.pending_subs.retain(|_, reqs| !reqs.is_empty());

            for (name, seat) in retries {
                if let Ok(guard) = self.registry.lock_session(&name) {
                    let mut state = guard.state();
                    if !state.rules.is_over() && state.rules.seat_needs_substitute(seat) {
                        let was_turn = state.rules.current_turn_seat() == Some(seat);
                        self.backfill(&name, &mut state, seat, was_turn);
                    }
                }
            }
        }
    }
}
