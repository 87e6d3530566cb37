//! Condition engine (spec.md section 4.6): the edge-triggered evaluator
//! shared by the push manager and the trigger manager. Each consumer
//! owns one `ConditionEngine` per configured push/trigger and drives it
//! from its own 100ms ticker, executing side effects for whatever
//! `tick` reports fired.

use crate::value::{TagValue, ValueVariant};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "changed")]
    Changed,
    #[serde(rename = "truthy")]
    Truthy,
    #[serde(rename = "falsy")]
    Falsy,
}

/// One `{PLC, Tag, Operator, Value}` clause (spec.md section 3).
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    pub plc: String,
    pub tag: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownMode {
    Global,
    PerCondition,
}

impl Default for CooldownMode {
    fn default() -> Self {
        CooldownMode::Global
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Armed,
    Firing,
    WaitingClear,
    Cooldown,
}

#[derive(Debug, Clone)]
struct ConditionState {
    last_met: bool,
    last_value: Option<ValueVariant>,
    phase: Phase,
    last_send_at: Option<Instant>,
}

impl ConditionState {
    fn new() -> Self {
        ConditionState {
            last_met: false,
            last_value: None,
            phase: Phase::Armed,
            last_send_at: None,
        }
    }
}

/// Looks up a tag's current value by `(plc, tag)`; implemented by the
/// PLC manager's read-side for real use, by test fixtures otherwise.
pub trait ValueLookup {
    fn lookup(&self, plc: &str, tag: &str) -> Option<TagValue>;
}

impl<F> ValueLookup for F
where
    F: Fn(&str, &str) -> Option<TagValue>,
{
    fn lookup(&self, plc: &str, tag: &str) -> Option<TagValue> {
        self(plc, tag)
    }
}

/// A condition set plus its cooldown state machine. Global mode keeps a
/// single shared phase across all conditions (any rising edge fires,
/// the clear criterion is every condition false); per-condition mode
/// gives every condition its own independent phase, so one firing
/// condition never blocks another from rising (spec.md scenario 6).
pub struct ConditionEngine {
    conditions: Vec<ConditionSpec>,
    cooldown_mode: CooldownMode,
    cooldown_min: Duration,
    states: Vec<ConditionState>,
    global_phase: Phase,
    global_last_send_at: Option<Instant>,
}

fn duration_from_secs(secs: f64) -> Duration {
    if secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(secs)
    }
}

impl ConditionEngine {
    pub fn new(conditions: Vec<ConditionSpec>, cooldown_mode: CooldownMode, cooldown_min_secs: f64) -> Self {
        let states = conditions.iter().map(|_| ConditionState::new()).collect();
        ConditionEngine {
            conditions,
            cooldown_mode,
            cooldown_min: duration_from_secs(cooldown_min_secs),
            states,
            global_phase: Phase::Armed,
            global_last_send_at: None,
        }
    }

    pub fn conditions(&self) -> &[ConditionSpec] {
        &self.conditions
    }

    /// Advances the state machine one tick, returning the indices of
    /// conditions that should fire their side effect right now. Call
    /// `complete_firing` for each returned index once the side effect
    /// has run.
    pub fn tick(&mut self, now: Instant, lookup: &dyn ValueLookup) -> Vec<usize> {
        let mut met = Vec::with_capacity(self.conditions.len());
        for (i, spec) in self.conditions.iter().enumerate() {
            let current = lookup.lookup(&spec.plc, &spec.tag);
            met.push(evaluate(spec.operator, current.as_ref(), &spec.value, &mut self.states[i].last_value));
        }

        let fired = match self.cooldown_mode {
            CooldownMode::Global => self.tick_global(now, &met),
            CooldownMode::PerCondition => self.tick_per_condition(now, &met),
        };

        for (i, m) in met.into_iter().enumerate() {
            self.states[i].last_met = m;
        }
        fired
    }

    fn tick_global(&mut self, now: Instant, met: &[bool]) -> Vec<usize> {
        let mut fired = Vec::new();
        match self.global_phase {
            Phase::Armed => {
                for (i, &m) in met.iter().enumerate() {
                    if m && !self.states[i].last_met {
                        self.global_phase = Phase::Firing;
                        self.global_last_send_at = Some(now);
                        fired.push(i);
                        break;
                    }
                }
            }
            Phase::Firing => {}
            Phase::WaitingClear => {
                if met.iter().all(|m| !m) {
                    self.global_phase = if self.cooldown_min.is_zero() { Phase::Armed } else { Phase::Cooldown };
                }
            }
            Phase::Cooldown => {
                if let Some(sent) = self.global_last_send_at {
                    if now.duration_since(sent) >= self.cooldown_min {
                        self.global_phase = Phase::Armed;
                    }
                }
            }
        }
        fired
    }

    fn tick_per_condition(&mut self, now: Instant, met: &[bool]) -> Vec<usize> {
        let mut fired = Vec::new();
        for (i, &m) in met.iter().enumerate() {
            let rising = m && !self.states[i].last_met;
            match self.states[i].phase {
                Phase::Armed => {
                    if rising {
                        self.states[i].phase = Phase::Firing;
                        self.states[i].last_send_at = Some(now);
                        fired.push(i);
                    }
                }
                Phase::Firing => {}
                Phase::WaitingClear => {
                    if !m {
                        self.states[i].phase = if self.cooldown_min.is_zero() { Phase::Armed } else { Phase::Cooldown };
                    }
                }
                Phase::Cooldown => {
                    if let Some(sent) = self.states[i].last_send_at {
                        if now.duration_since(sent) >= self.cooldown_min {
                            self.states[i].phase = Phase::Armed;
                        }
                    }
                }
            }
        }
        fired
    }

    /// Marks a fired condition's side effect as done (success or
    /// terminal error alike — spec.md section 4.6 sends both paths to
    /// `WaitingClear` so a retryable failure never spams).
    pub fn complete_firing(&mut self, index: usize) {
        match self.cooldown_mode {
            CooldownMode::Global => self.global_phase = Phase::WaitingClear,
            CooldownMode::PerCondition => self.states[index].phase = Phase::WaitingClear,
        }
    }
}

fn truthy(value: &ValueVariant) -> bool {
    match value {
        ValueVariant::Bool(b) => *b,
        ValueVariant::Int(i) => *i != 0,
        ValueVariant::Uint(u) => *u != 0,
        ValueVariant::Float(f) => *f != 0.0,
        ValueVariant::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

fn as_f64(value: &ValueVariant) -> Option<f64> {
    match value {
        ValueVariant::Int(i) => Some(*i as f64),
        ValueVariant::Uint(u) => Some(*u as f64),
        ValueVariant::Float(f) => Some(*f),
        ValueVariant::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn target_as_f64(target: &JsonValue) -> Option<f64> {
    target.as_f64().or_else(|| target.as_str().and_then(|s| s.parse().ok()))
}

fn target_as_bool(target: &JsonValue) -> Option<bool> {
    target
        .as_bool()
        .or_else(|| target.as_i64().map(|n| n != 0))
        .or_else(|| target.as_str().map(|s| s.eq_ignore_ascii_case("true")))
}

fn evaluate(op: Operator, current: Option<&TagValue>, target: &JsonValue, last_value: &mut Option<ValueVariant>) -> bool {
    if op == Operator::Changed {
        let current_value = current.map(|t| t.value.clone());
        let changed = matches!((&current_value, &*last_value), (Some(c), Some(p)) if c != p);
        *last_value = current_value;
        return changed;
    }

    let Some(current) = current else { return false };
    *last_value = Some(current.value.clone());

    if op == Operator::Truthy || op == Operator::Falsy {
        let t = truthy(&current.value);
        return if op == Operator::Truthy { t } else { !t };
    }

    match &current.value {
        ValueVariant::Bool(b) => {
            let Some(t) = target_as_bool(target) else { return false };
            compare_ord(op, *b as u8, t as u8)
        }
        ValueVariant::String(s) => {
            let Some(t) = target.as_str() else { return false };
            compare_ord(op, s.as_str(), t)
        }
        other => {
            let (Some(c), Some(t)) = (as_f64(other), target_as_f64(target)) else { return false };
            match op {
                Operator::Eq => c == t,
                Operator::Ne => c != t,
                Operator::Lt => c < t,
                Operator::Le => c <= t,
                Operator::Gt => c > t,
                Operator::Ge => c >= t,
                _ => false,
            }
        }
    }
}

fn compare_ord<T: PartialOrd + PartialEq>(op: Operator, a: T, b: T) -> bool {
    match op {
        Operator::Eq => a == b,
        Operator::Ne => a != b,
        Operator::Lt => a < b,
        Operator::Le => a <= b,
        Operator::Gt => a > b,
        Operator::Ge => a >= b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Quality;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn spec(op: Operator, value: JsonValue) -> ConditionSpec {
        ConditionSpec { plc: "plc1".into(), tag: "alarm".into(), operator: op, value }
    }

    struct Fixture(HashMap<(String, String), TagValue>);

    impl ValueLookup for Fixture {
        fn lookup(&self, plc: &str, tag: &str) -> Option<TagValue> {
            self.0.get(&(plc.to_string(), tag.to_string())).cloned()
        }
    }

    fn fixture(value: ValueVariant) -> Fixture {
        let mut m = HashMap::new();
        m.insert(("plc1".to_string(), "alarm".to_string()), TagValue::new(value, Quality::Good));
        Fixture(m)
    }

    #[test]
    fn scenario_eq_true_cooldown_zero_fires_once_then_again_after_clear() {
        let mut engine = ConditionEngine::new(vec![spec(Operator::Eq, serde_json::json!(true))], CooldownMode::Global, 0.0);
        let t0 = Instant::now();

        let fired = engine.tick(t0, &fixture(ValueVariant::Bool(false)));
        assert!(fired.is_empty());

        let fired = engine.tick(t0, &fixture(ValueVariant::Bool(true)));
        assert_eq!(fired, vec![0]);
        engine.complete_firing(0);

        // Alarm stays true: no second fire while waiting to clear.
        let fired = engine.tick(t0 + StdDuration::from_millis(500), &fixture(ValueVariant::Bool(true)));
        assert!(fired.is_empty());

        let fired = engine.tick(t0 + StdDuration::from_millis(600), &fixture(ValueVariant::Bool(false)));
        assert!(fired.is_empty()); // clears, moves to Armed

        let fired = engine.tick(t0 + StdDuration::from_millis(700), &fixture(ValueVariant::Bool(true)));
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn per_condition_mode_fires_independently() {
        let conditions = vec![
            ConditionSpec { plc: "plc1".into(), tag: "a".into(), operator: Operator::Truthy, value: JsonValue::Null },
            ConditionSpec { plc: "plc1".into(), tag: "b".into(), operator: Operator::Truthy, value: JsonValue::Null },
        ];
        let mut engine = ConditionEngine::new(conditions, CooldownMode::PerCondition, 1.0);
        let t0 = Instant::now();

        let mut values = HashMap::new();
        values.insert(("plc1".to_string(), "a".to_string()), TagValue::new(ValueVariant::Bool(true), Quality::Good));
        values.insert(("plc1".to_string(), "b".to_string()), TagValue::new(ValueVariant::Bool(true), Quality::Good));
        let both_true = Fixture(values);

        let fired = engine.tick(t0, &both_true);
        assert_eq!(fired, vec![0, 1]);
        engine.complete_firing(0);
        engine.complete_firing(1);

        // condition 0 clears, condition 1 stays true: only 0 can re-arm and re-fire.
        let mut mixed = HashMap::new();
        mixed.insert(("plc1".to_string(), "a".to_string()), TagValue::new(ValueVariant::Bool(false), Quality::Good));
        mixed.insert(("plc1".to_string(), "b".to_string()), TagValue::new(ValueVariant::Bool(true), Quality::Good));
        let fired = engine.tick(t0 + StdDuration::from_millis(50), &Fixture(mixed));
        assert!(fired.is_empty());
    }

    #[test]
    fn changed_operator_requires_two_observations() {
        let spec = ConditionSpec { plc: "plc1".into(), tag: "alarm".into(), operator: Operator::Changed, value: JsonValue::Null };
        let mut engine = ConditionEngine::new(vec![spec], CooldownMode::Global, 0.0);
        let t0 = Instant::now();

        let fired = engine.tick(t0, &fixture(ValueVariant::Int(1)));
        assert!(fired.is_empty(), "first observation never counts as a change");

        let fired = engine.tick(t0, &fixture(ValueVariant::Int(2)));
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn idempotent_in_waiting_clear() {
        let mut engine = ConditionEngine::new(vec![spec(Operator::Eq, serde_json::json!(true))], CooldownMode::Global, 0.0);
        let t0 = Instant::now();
        engine.tick(t0, &fixture(ValueVariant::Bool(false)));
        let fired = engine.tick(t0, &fixture(ValueVariant::Bool(true)));
        assert_eq!(fired, vec![0]);
        engine.complete_firing(0);

        for _ in 0..5 {
            let fired = engine.tick(t0, &fixture(ValueVariant::Bool(true)));
            assert!(fired.is_empty());
        }
    }
}
