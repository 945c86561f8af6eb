//! Per-connection round lifecycle accumulator.
//!
//! Each source task owns one `RoundAggregate` and feeds every decoded
//! envelope through [`RoundAggregate::apply`], which mutates the running
//! round and returns the side effects the driver has to perform:
//! broadcasts, an immediate finalize, or a deferred finalize when the
//! round ended before a usable multiplier arrived. The accumulator never
//! does I/O and never sleeps, so message handling stays strictly
//! sequential per source.

use crate::protocol::normalize::{
    CMD_CHANGE_STATE, CMD_ONLINE_PLAYERS, CMD_ROUND_CHART_INFO, CMD_UPDATE_BETS,
    CMD_UPDATE_CASHOUTS, CMD_X,
};
use crate::protocol::Envelope;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// Wire state ids sent by `changeState`.
const STATE_BET: i64 = 1;
const STATE_RUN: i64 = 2;
const STATE_END: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Bet,
    Run,
    End,
}

/// Live view of the running aggregate, broadcast on every message.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRound {
    pub round_id: Option<String>,
    pub bets_count: i64,
    pub total_bet_amount: f64,
    pub online_players: i64,
    pub current_multiplier: f64,
    pub max_multiplier: f64,
    pub total_cashout: f64,
    pub lifecycle: Lifecycle,
}

/// Finalized view handed to the persistence coordinator. A missing
/// round id is synthesized there, not here.
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub round_id: Option<String>,
    pub bets_count: i64,
    pub total_bet_amount: f64,
    pub online_players: i64,
    pub max_multiplier: f64,
    pub total_cashout: f64,
}

/// Side effects the connection driver performs after a message.
#[derive(Debug, Clone)]
pub enum Effect {
    /// A new betting phase opened.
    NewRound,
    /// Live multiplier tick.
    Multiplier(f64),
    /// Chart-info payload observed.
    ChartInfo {
        round_id: Option<String>,
        max_multiplier: f64,
    },
    /// Live aggregate snapshot, emitted for every processed message.
    Live(LiveRound),
    /// Persist the snapshot now.
    Finalize(RoundSnapshot),
    /// Round ended without a usable multiplier; persist after a short
    /// grace window unless one arrives first.
    FinalizeAfterGrace,
}

#[derive(Debug)]
pub struct RoundAggregate {
    round_id: Option<String>,
    bets_count: i64,
    total_bet_amount: f64,
    online_players: i64,
    current_multiplier: f64,
    max_multiplier: f64,
    total_cashout: f64,
    seen_cashouts: HashSet<String>,
    lifecycle: Lifecycle,
}

impl Default for RoundAggregate {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundAggregate {
    pub fn new() -> Self {
        Self {
            round_id: None,
            bets_count: 0,
            total_bet_amount: 0.0,
            online_players: 0,
            current_multiplier: 0.0,
            max_multiplier: 0.0,
            total_cashout: 0.0,
            seen_cashouts: HashSet::new(),
            lifecycle: Lifecycle::Bet,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round_id.as_deref()
    }

    /// A snapshot is worth persisting once a positive finite crash
    /// multiplier is known.
    pub fn has_usable_multiplier(&self) -> bool {
        self.max_multiplier.is_finite() && self.max_multiplier > 0.0
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.round_id.clone(),
            bets_count: self.bets_count,
            total_bet_amount: self.total_bet_amount,
            online_players: self.online_players,
            max_multiplier: self.max_multiplier,
            total_cashout: self.total_cashout,
        }
    }

    pub fn live(&self) -> LiveRound {
        LiveRound {
            round_id: self.round_id.clone(),
            bets_count: self.bets_count,
            total_bet_amount: self.total_bet_amount,
            online_players: self.online_players,
            current_multiplier: self.current_multiplier,
            max_multiplier: self.max_multiplier,
            total_cashout: self.total_cashout,
            lifecycle: self.lifecycle,
        }
    }

    /// Clear the round. Player count carries over, it is a property of
    /// the table rather than of one round.
    pub fn reset(&mut self) {
        let online_players = self.online_players;
        *self = Self::new();
        self.online_players = online_players;
    }

    pub fn apply(&mut self, envelope: &Envelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        match envelope.command.as_str() {
            CMD_UPDATE_BETS => self.apply_bets(&envelope.params),
            CMD_ONLINE_PLAYERS => self.apply_online_players(&envelope.params),
            CMD_CHANGE_STATE => self.apply_change_state(&envelope.params, &mut effects),
            CMD_X => self.apply_x(&envelope.params, &mut effects),
            CMD_UPDATE_CASHOUTS => self.apply_cashouts(&envelope.params),
            CMD_ROUND_CHART_INFO => self.apply_chart_info(&envelope.params, &mut effects),
            _ => {}
        }
        effects.push(Effect::Live(self.live()));
        effects
    }

    fn apply_bets(&mut self, params: &Value) {
        if let Some(count) = field_i64(params, &["betsCount"]) {
            self.bets_count = self.bets_count.max(count);
        }
        match params.get("bets").and_then(Value::as_array) {
            Some(bets) => {
                // Itemized list wins over any precomputed total
                self.bets_count = self.bets_count.max(bets.len() as i64);
                self.total_bet_amount = bets
                    .iter()
                    .filter_map(|b| field_f64(b, &["bet", "betAmount", "amount"]))
                    .sum();
            }
            None => {
                if let Some(total) = field_f64(params, &["totalBetAmount", "totalBets"]) {
                    self.total_bet_amount = total;
                }
            }
        }
        self.lifecycle = Lifecycle::Bet;
    }

    fn apply_online_players(&mut self, params: &Value) {
        let count = field_i64(params, &["onlinePlayers", "players"])
            .or_else(|| params.as_i64());
        if let Some(count) = count {
            self.online_players = count;
        }
    }

    fn apply_change_state(&mut self, params: &Value, effects: &mut Vec<Effect>) {
        let Some(state) = field_i64(params, &["newStateId", "stateId"]) else {
            return;
        };
        match state {
            STATE_BET => {
                self.lifecycle = Lifecycle::Bet;
                self.current_multiplier = 0.0;
                if let Some(round_id) = field_string(params, &["roundId", "round_id"]) {
                    self.round_id = Some(round_id);
                }
                effects.push(Effect::NewRound);
            }
            STATE_RUN => {
                self.lifecycle = Lifecycle::Run;
                self.current_multiplier = 0.0;
                if self.round_id.is_none() {
                    self.round_id = field_string(params, &["roundId", "round_id"]);
                }
            }
            STATE_END => {
                self.lifecycle = Lifecycle::End;
                if self.round_id.is_none() {
                    self.round_id = field_string(params, &["roundId", "round_id"]);
                }
                // Some servers tuck the crash value into the state change
                if let Some(crash) = field_f64(params, &["crashX", "crash", "x"]) {
                    if crash > self.max_multiplier {
                        self.max_multiplier = crash;
                        self.current_multiplier = crash;
                    }
                }
                if self.has_usable_multiplier() {
                    effects.push(Effect::Finalize(self.snapshot()));
                } else {
                    effects.push(Effect::FinalizeAfterGrace);
                }
            }
            _ => {}
        }
    }

    fn apply_x(&mut self, params: &Value, effects: &mut Vec<Effect>) {
        if let Some(crash) = field_f64(params, &["crashX"]) {
            // Terminal: the round ended at this multiplier
            self.max_multiplier = crash;
            self.current_multiplier = crash;
            self.lifecycle = Lifecycle::End;
            effects.push(Effect::Finalize(self.snapshot()));
            return;
        }
        let live = field_f64(params, &["x"]).or_else(|| params.as_f64());
        if let Some(live) = live {
            self.current_multiplier = live;
            if live > self.max_multiplier {
                self.max_multiplier = live;
            }
            self.lifecycle = Lifecycle::Run;
            effects.push(Effect::Multiplier(live));
        }
    }

    fn apply_cashouts(&mut self, params: &Value) {
        let entries = params
            .get("cashouts")
            .or_else(|| params.get("cashOuts"))
            .and_then(Value::as_array);
        let Some(entries) = entries else {
            return;
        };
        for entry in entries {
            let player = field_string(entry, &["player", "user", "userId"]).unwrap_or_default();
            let bet = field_f64(entry, &["bet", "betAmount"]).unwrap_or(0.0);
            let multiplier = field_f64(entry, &["multiplier", "x"]).unwrap_or(0.0);
            // One payout per (player, bet, multiplier) per round
            let key = format!("{}:{:.4}:{:.4}", player, bet, multiplier);
            if !self.seen_cashouts.insert(key) {
                continue;
            }
            let payout = field_f64(entry, &["payout", "cashout", "winAmount"])
                .unwrap_or(bet * multiplier);
            self.total_cashout += payout;
        }
    }

    fn apply_chart_info(&mut self, params: &Value, effects: &mut Vec<Effect>) {
        if let Some(round_id) = field_string(params, &["roundId", "round_id"]) {
            self.round_id = Some(round_id);
        }
        if let Some(max) = field_f64(params, &["maxMultiplier"]) {
            if max > self.max_multiplier {
                self.max_multiplier = max;
            }
        }
        effects.push(Effect::ChartInfo {
            round_id: self.round_id.clone(),
            max_multiplier: self.max_multiplier,
        });
        // Backup finalize path; the coordinator makes duplicates idempotent
        if self.lifecycle == Lifecycle::End || self.has_usable_multiplier() {
            effects.push(Effect::Finalize(self.snapshot()));
        }
    }
}

/// Numeric field that may arrive as a number or a numeric string.
fn field_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    let field = keys.iter().find_map(|k| value.get(*k))?;
    match field {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_i64(value: &Value, keys: &[&str]) -> Option<i64> {
    field_f64(value, keys).map(|f| f as i64)
}

/// Identifier field that may arrive as a string or a number.
fn field_string(value: &Value, keys: &[&str]) -> Option<String> {
    let field = keys.iter().find_map(|k| value.get(*k))?;
    match field {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
