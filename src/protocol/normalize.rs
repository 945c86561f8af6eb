//! Envelope normalization.
//!
//! Decoded frames arrive in whatever shape the upstream server chose:
//! an explicit {command, params} object, a positional array, or a bare
//! payload whose command has to be inferred from which fields it
//! carries. The inference table is an ordered rule list so each rule is
//! testable on its own and the precedence is visible in one place.

use super::Envelope;
use serde_json::{Map, Value};

pub const CMD_UPDATE_BETS: &str = "updateCurrentBets";
pub const CMD_ONLINE_PLAYERS: &str = "onlinePlayers";
pub const CMD_CHANGE_STATE: &str = "changeState";
pub const CMD_UPDATE_CASHOUTS: &str = "updateCurrentCashOuts";
pub const CMD_X: &str = "x";
pub const CMD_ROUND_CHART_INFO: &str = "roundChartInfo";
pub const CMD_UNKNOWN: &str = "unknown";

struct InferenceRule {
    command: &'static str,
    applies: fn(&Map<String, Value>) -> bool,
}

/// Field-presence rules, evaluated in order; first match wins.
const RULES: &[InferenceRule] = &[
    InferenceRule {
        command: CMD_UPDATE_BETS,
        applies: |m| m.contains_key("betsCount") || m.contains_key("bets"),
    },
    InferenceRule {
        command: CMD_ONLINE_PLAYERS,
        applies: |m| m.contains_key("onlinePlayers"),
    },
    InferenceRule {
        command: CMD_CHANGE_STATE,
        applies: |m| m.contains_key("newStateId") || m.contains_key("stateId"),
    },
    InferenceRule {
        command: CMD_UPDATE_CASHOUTS,
        applies: |m| m.contains_key("cashouts") || m.contains_key("cashOuts"),
    },
    InferenceRule {
        command: CMD_X,
        applies: |m| m.contains_key("crashX") || m.contains_key("x"),
    },
    InferenceRule {
        command: CMD_ROUND_CHART_INFO,
        applies: |m| m.contains_key("roundId") && m.contains_key("maxMultiplier"),
    },
];

/// How many nested payload levels to look through. Tag-length-value
/// frames wrap the command envelope under a "p" key once or twice.
const MAX_UNWRAP: usize = 2;

pub fn to_envelope(value: Value) -> Envelope {
    shape(value, 0)
}

fn shape(value: Value, depth: usize) -> Envelope {
    match value {
        Value::Object(map) => shape_object(map, depth),
        Value::Array(items) => shape_array(items),
        other => Envelope {
            command: CMD_UNKNOWN.to_string(),
            params: other,
        },
    }
}

fn shape_object(map: Map<String, Value>, depth: usize) -> Envelope {
    // Already {command, params}-shaped: pass through.
    if let Some(command) = string_field(&map, &["command", "c"]) {
        let params = map
            .get("params")
            .or_else(|| map.get("p"))
            .cloned()
            .unwrap_or(Value::Null);
        return Envelope { command, params };
    }

    for rule in RULES {
        if (rule.applies)(&map) {
            return Envelope {
                command: rule.command.to_string(),
                params: Value::Object(map),
            };
        }
    }

    // No match at this level: look one payload level down before giving
    // up, the command envelope may be wrapped under "p".
    if depth < MAX_UNWRAP {
        if let Some(inner) = map.get("p").or_else(|| map.get("params")) {
            if inner.is_object() || inner.is_array() {
                let envelope = shape(inner.clone(), depth + 1);
                if envelope.command != CMD_UNKNOWN {
                    return envelope;
                }
            }
        }
    }

    Envelope {
        command: CMD_UNKNOWN.to_string(),
        params: Value::Object(map),
    }
}

fn shape_array(items: Vec<Value>) -> Envelope {
    // [command, params] or [tag, command, params]
    if let Some(Value::String(command)) = items.first() {
        return Envelope {
            command: command.clone(),
            params: items.get(1).cloned().unwrap_or(Value::Null),
        };
    }
    if let Some(Value::String(command)) = items.get(1) {
        return Envelope {
            command: command.clone(),
            params: items.get(2).cloned().unwrap_or(Value::Null),
        };
    }
    Envelope {
        command: CMD_UNKNOWN.to_string(),
        params: Value::Array(items),
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_command_passthrough() {
        let env = to_envelope(json!({"command": "changeState", "params": {"newStateId": 2}}));
        assert_eq!(env.command, "changeState");
        assert_eq!(env.params, json!({"newStateId": 2}));

        let env = to_envelope(json!({"c": "x", "p": {"x": 1.07}}));
        assert_eq!(env.command, "x");
        assert_eq!(env.params, json!({"x": 1.07}));
    }

    #[test]
    fn test_array_forms() {
        let env = to_envelope(json!(["onlinePlayers", {"onlinePlayers": 412}]));
        assert_eq!(env.command, "onlinePlayers");

        let env = to_envelope(json!([42, "x", {"crashX": 3.2}]));
        assert_eq!(env.command, "x");
        assert_eq!(env.params, json!({"crashX": 3.2}));
    }

    #[test]
    fn test_field_presence_inference() {
        assert_eq!(to_envelope(json!({"betsCount": 12})).command, CMD_UPDATE_BETS);
        assert_eq!(to_envelope(json!({"bets": []})).command, CMD_UPDATE_BETS);
        assert_eq!(
            to_envelope(json!({"onlinePlayers": 9})).command,
            CMD_ONLINE_PLAYERS
        );
        assert_eq!(
            to_envelope(json!({"stateId": 3})).command,
            CMD_CHANGE_STATE
        );
        assert_eq!(
            to_envelope(json!({"cashOuts": []})).command,
            CMD_UPDATE_CASHOUTS
        );
        assert_eq!(to_envelope(json!({"crashX": 1.0})).command, CMD_X);
        assert_eq!(to_envelope(json!({"x": 1.0})).command, CMD_X);
        assert_eq!(
            to_envelope(json!({"roundId": "r1", "maxMultiplier": 2.0})).command,
            CMD_ROUND_CHART_INFO
        );
    }

    #[test]
    fn test_rules_fire_in_declared_order() {
        // betsCount outranks x when both are present
        let env = to_envelope(json!({"betsCount": 3, "x": 1.5}));
        assert_eq!(env.command, CMD_UPDATE_BETS);

        // roundId+maxMultiplier only wins when nothing earlier matched
        let env = to_envelope(json!({"roundId": "r", "maxMultiplier": 2.0, "x": 1.1}));
        assert_eq!(env.command, CMD_X);
    }

    #[test]
    fn test_nested_payload_unwrap() {
        let env = to_envelope(json!({"a": 13, "p": {"c": "changeState", "p": {"newStateId": 1}}}));
        assert_eq!(env.command, "changeState");
        assert_eq!(env.params, json!({"newStateId": 1}));
    }

    #[test]
    fn test_unknown_keeps_payload() {
        let env = to_envelope(json!({"foo": 1}));
        assert_eq!(env.command, CMD_UNKNOWN);
        assert_eq!(env.params, json!({"foo": 1}));

        let env = to_envelope(json!(17));
        assert_eq!(env.command, CMD_UNKNOWN);
    }
}
