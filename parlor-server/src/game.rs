//! Bundled reference rules engine.
//!
//! A deliberately small turn-based game: seats fill, the turn rotates, each
//! seat either passes or bids-then-commits points, and the game ends after a
//! fixed number of rounds. It exists so the server binary and the test suite
//! can exercise every lifecycle path (seating, turn advance, substitute
//! stalls, forced aborts, resets) through the same `GameRules` seam a real
//! engine would use.

use parlor_types::rules::{GameRules, RuleEvent, RulesError};
use parlor_types::SeatIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeatState {
    Vacant,
    Occupied,
    /// Vacated mid-game; play stalls here until a substitute sits down.
    NeedsSub,
}

pub struct RoundRobinGame {
    min_version: i32,
    rounds_limit: usize,
    seats: Vec<SeatState>,
    scores: Vec<i64>,
    turn: usize,
    round: usize,
    started: bool,
    over: bool,
    /// In-flight bid of the seat on turn; discarded by an abort.
    pending_bid: Option<i64>,
}

impl RoundRobinGame {
    pub fn new(seat_count: usize, rounds_limit: usize, min_version: i32) -> Self {
        Self {
            min_version,
            rounds_limit,
            seats: vec![SeatState::Vacant; seat_count],
            scores: vec![0; seat_count],
            turn: 0,
            round: 0,
            started: false,
            over: false,
            pending_bid: None,
        }
    }

    fn check_seat(&self, seat: SeatIndex) -> Result<usize, RulesError> {
        let i = seat.get();
        if i >= self.seats.len() {
            return Err(RulesError::BadSeat(seat));
        }
        Ok(i)
    }

    /// Move the turn to the next seat, bumping the round on wraparound.
    fn rotate(&mut self, events: &mut Vec<RuleEvent>) {
        self.turn = (self.turn + 1) % self.seats.len();
        if self.turn == 0 {
            self.round += 1;
            if self.round >= self.rounds_limit {
                self.over = true;
                events.push(RuleEvent::All(format!(
                    "game-over scores {:?}",
                    self.scores
                )));
                return;
            }
        }
        events.push(RuleEvent::Seat(SeatIndex::new(self.turn), "your-turn".into()));
    }
}

impl GameRules for RoundRobinGame {
    fn seat_count(&self) -> usize {
        self.seats.len()
    }

    fn min_version(&self) -> i32 {
        self.min_version
    }

    fn is_over(&self) -> bool {
        self.over
    }

    fn is_seat_vacant(&self, seat: SeatIndex) -> bool {
        self.seats
            .get(seat.get())
            .map(|s| matches!(s, SeatState::Vacant | SeatState::NeedsSub))
            .unwrap_or(false)
    }

    fn seat_needs_substitute(&self, seat: SeatIndex) -> bool {
        self.seats
            .get(seat.get())
            .map(|s| *s == SeatState::NeedsSub)
            .unwrap_or(false)
    }

    fn current_turn_seat(&self) -> Option<SeatIndex> {
        if self.started && !self.over {
            Some(SeatIndex::new(self.turn))
        } else {
            None
        }
    }

    fn occupy(&mut self, seat: SeatIndex) -> Result<(), RulesError> {
        let i = self.check_seat(seat)?;
        match self.seats[i] {
            SeatState::Occupied => Err(RulesError::BadState(format!("seat {} taken", seat))),
            SeatState::Vacant | SeatState::NeedsSub => {
                self.seats[i] = SeatState::Occupied;
                if !self.started && self.seats.iter().all(|s| *s == SeatState::Occupied) {
                    self.started = true;
                    self.turn = 0;
                }
                Ok(())
            }
        }
    }

    fn vacate(&mut self, seat: SeatIndex) -> Result<(), RulesError> {
        let i = self.check_seat(seat)?;
        if self.seats[i] != SeatState::Occupied {
            return Err(RulesError::BadState(format!("seat {} not occupied", seat)));
        }
        self.seats[i] = if self.started && !self.over {
            SeatState::NeedsSub
        } else {
            SeatState::Vacant
        };
        Ok(())
    }

    fn apply_command(
        &mut self,
        seat: SeatIndex,
        command: &str,
    ) -> Result<Vec<RuleEvent>, RulesError> {
        let i = self.check_seat(seat)?;
        if !self.started {
            return Err(RulesError::BadState("game not started".into()));
        }
        if self.over {
            return Err(RulesError::BadState("game over".into()));
        }
        if i != self.turn {
            return Err(RulesError::IllegalMove("not your turn".into()));
        }

        let mut parts = command.split_whitespace();
        let mut events = Vec::new();
        match parts.next() {
            Some("pass") => {
                self.pending_bid = None;
                events.push(RuleEvent::All(format!("seat {} passes", seat)));
                self.rotate(&mut events);
                Ok(events)
            }
            Some("bid") => {
                let amount: i64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| RulesError::IllegalMove("bid needs an amount".into()))?;
                self.pending_bid = Some(amount);
                events.push(RuleEvent::All(format!("seat {} bids {}", seat, amount)));
                events.push(RuleEvent::Seat(seat, "bid-pending commit-or-pass".into()));
                Ok(events)
            }
            Some("commit") => {
                let amount = self
                    .pending_bid
                    .take()
                    .ok_or_else(|| RulesError::IllegalMove("nothing to commit".into()))?;
                self.scores[i] += amount;
                events.push(RuleEvent::All(format!(
                    "seat {} scores {} (total {})",
                    seat, amount, self.scores[i]
                )));
                self.rotate(&mut events);
                Ok(events)
            }
            Some(other) => Err(RulesError::IllegalMove(format!("unknown move '{}'", other))),
            None => Err(RulesError::IllegalMove("empty move".into())),
        }
    }

    fn can_advance_turn(&self) -> bool {
        self.started && !self.over && self.pending_bid.is_none()
    }

    fn advance_turn(&mut self) -> Result<Vec<RuleEvent>, RulesError> {
        if !self.can_advance_turn() {
            return Err(RulesError::BadState("turn cannot be skipped".into()));
        }
        let mut events = vec![RuleEvent::All(format!("seat {} turn skipped", self.turn))];
        self.rotate(&mut events);
        Ok(events)
    }

    fn abort_turn(&mut self) -> Vec<RuleEvent> {
        let mut events = Vec::new();
        if let Some(amount) = self.pending_bid.take() {
            events.push(RuleEvent::All(format!(
                "seat {} turn aborted, bid {} discarded",
                self.turn, amount
            )));
        } else {
            events.push(RuleEvent::All(format!("seat {} turn aborted", self.turn)));
        }
        if self.started && !self.over {
            self.rotate(&mut events);
        }
        events
    }

    fn serialize_state(&self) -> String {
        serde_json::json!({
            "seats": self.seats.iter().map(|s| match s {
                SeatState::Vacant => "vacant",
                SeatState::Occupied => "occupied",
                SeatState::NeedsSub => "needs-sub",
            }).collect::<Vec<_>>(),
            "scores": self.scores,
            "turn": self.turn,
            "round": self.round,
            "rounds": self.rounds_limit,
            "started": self.started,
            "over": self.over,
        })
        .to_string()
    }

    fn final_standings(&self) -> Vec<(i64, bool)> {
        let best = self.scores.iter().copied().max().unwrap_or(0);
        self.scores
            .iter()
            .map(|&s| (s, s == best))
            .collect()
    }

    /// Scores carry across a reset; seating and turn state do not.
    fn renewed(&self) -> Box<dyn GameRules> {
        let mut next = Self::new(self.seats.len(), self.rounds_limit, self.min_version);
        next.scores = self.scores.clone();
        Box::new(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seated_game() -> RoundRobinGame {
        let mut game = RoundRobinGame::new(3, 2, 1);
        for i in 0..3 {
            game.occupy(SeatIndex::new(i)).unwrap();
        }
        game
    }

    #[test]
    fn starts_when_all_seats_fill() {
        let mut game = RoundRobinGame::new(2, 1, 1);
        assert_eq!(game.current_turn_seat(), None);
        game.occupy(SeatIndex::new(0)).unwrap();
        assert_eq!(game.current_turn_seat(), None);
        game.occupy(SeatIndex::new(1)).unwrap();
        assert_eq!(game.current_turn_seat(), Some(SeatIndex::new(0)));
    }

    #[test]
    fn occupied_seat_rejects_second_occupant() {
        let mut game = RoundRobinGame::new(2, 1, 1);
        game.occupy(SeatIndex::new(0)).unwrap();
        assert!(game.occupy(SeatIndex::new(0)).is_err());
    }

    #[test]
    fn pass_rotates_turn() {
        let mut game = seated_game();
        let events = game.apply_command(SeatIndex::new(0), "pass").unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RuleEvent::Seat(s, t) if s.get() == 1 && t == "your-turn")));
        assert_eq!(game.current_turn_seat(), Some(SeatIndex::new(1)));
    }

    #[test]
    fn out_of_turn_move_rejected() {
        let mut game = seated_game();
        assert!(matches!(
            game.apply_command(SeatIndex::new(2), "pass"),
            Err(RulesError::IllegalMove(_))
        ));
    }

    #[test]
    fn bid_commit_scores() {
        let mut game = seated_game();
        game.apply_command(SeatIndex::new(0), "bid 5").unwrap();
        assert!(!game.can_advance_turn(), "pending bid blocks a skip");
        game.apply_command(SeatIndex::new(0), "commit").unwrap();
        assert_eq!(game.final_standings()[0].0, 5);
        assert_eq!(game.current_turn_seat(), Some(SeatIndex::new(1)));
    }

    #[test]
    fn commit_without_bid_rejected() {
        let mut game = seated_game();
        assert!(game.apply_command(SeatIndex::new(0), "commit").is_err());
    }

    #[test]
    fn mid_game_vacate_needs_substitute() {
        let mut game = seated_game();
        game.vacate(SeatIndex::new(1)).unwrap();
        assert!(game.seat_needs_substitute(SeatIndex::new(1)));
        assert!(game.is_seat_vacant(SeatIndex::new(1)), "substitute can sit");
        game.occupy(SeatIndex::new(1)).unwrap();
        assert!(!game.seat_needs_substitute(SeatIndex::new(1)));
    }

    #[test]
    fn pre_game_vacate_stays_vacant() {
        let mut game = RoundRobinGame::new(3, 2, 1);
        game.occupy(SeatIndex::new(0)).unwrap();
        game.vacate(SeatIndex::new(0)).unwrap();
        assert!(!game.seat_needs_substitute(SeatIndex::new(0)));
    }

    #[test]
    fn abort_discards_pending_bid() {
        let mut game = seated_game();
        game.apply_command(SeatIndex::new(0), "bid 9").unwrap();
        let events = game.abort_turn();
        assert!(matches!(&events[0], RuleEvent::All(t) if t.contains("discarded")));
        assert_eq!(game.current_turn_seat(), Some(SeatIndex::new(1)));
        // The bid never scored.
        assert_eq!(game.final_standings()[0].0, 0);
    }

    #[test]
    fn game_ends_after_round_limit() {
        let mut game = seated_game(); // 3 seats, 2 rounds
        for _ in 0..2 {
            for seat in 0..3 {
                game.apply_command(SeatIndex::new(seat), "pass").unwrap();
            }
        }
        assert!(game.is_over());
        assert_eq!(game.current_turn_seat(), None);
        assert!(game.apply_command(SeatIndex::new(0), "pass").is_err());
    }

    #[test]
    fn renewed_carries_scores_only() {
        let mut game = seated_game();
        game.apply_command(SeatIndex::new(0), "bid 7").unwrap();
        game.apply_command(SeatIndex::new(0), "commit").unwrap();

        let next = game.renewed();
        assert_eq!(next.final_standings()[0].0, 7);
        assert!(next.is_seat_vacant(SeatIndex::new(0)));
        assert_eq!(next.current_turn_seat(), None);
        assert!(!next.is_over());
    }

    #[test]
    fn state_serializes_to_json() {
        let game = seated_game();
        let state: serde_json::Value = serde_json::from_str(&game.serialize_state()).unwrap();
        assert_eq!(state["started"], true);
        assert_eq!(state["seats"][0], "occupied");
    }
}
