//! Event gates: the last stage before an event is handed to the collector.
//! Grounded in `original_source/dcnum/feat/gate.py`'s `Gate` base class,
//! narrowed to size-based filtering only; the original's full online
//! polygon gating rule set is out of scope here.

use crate::data::typed_array::{EventData, TypedArray};

pub trait Gate: Send + Sync {
    fn ppid_code(&self) -> &'static str;
    fn accept(&self, event: &EventData) -> bool;
}

/// Accepts every event. The default when no gate is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpGate;

impl Gate for NoOpGate {
    fn ppid_code(&self) -> &'static str {
        "norm"
    }

    fn accept(&self, _event: &EventData) -> bool {
        true
    }
}

/// Rejects events whose `area_um` feature falls outside `[min_area, max_area]`.
/// Events lacking an `area_um` feature are accepted (nothing to gate on).
#[derive(Debug, Clone, Copy)]
pub struct SizeGate {
    pub min_area: f64,
    pub max_area: f64,
}

impl SizeGate {
    pub fn new(min_area: f64, max_area: f64) -> Self {
        Self { min_area, max_area }
    }
}

impl Gate for SizeGate {
    fn ppid_code(&self) -> &'static str {
        "size"
    }

    fn accept(&self, event: &EventData) -> bool {
        match event.get("area_um") {
            Some(TypedArray::F64 { data, .. }) => data
                .first()
                .map(|&a| a >= self.min_area && a <= self.max_area)
                .unwrap_or(true),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_area(area: f64) -> EventData {
        let mut ev = EventData::new();
        ev.insert(
            "area_um".to_string(),
            TypedArray::F64 {
                data: vec![area],
                shape: vec![1],
            },
        );
        ev
    }

    #[test]
    fn noop_gate_accepts_everything() {
        let gate = NoOpGate;
        assert!(gate.accept(&EventData::new()));
        assert!(gate.accept(&event_with_area(0.0)));
    }

    #[test]
    fn size_gate_rejects_outside_bounds() {
        let gate = SizeGate::new(10.0, 100.0);
        assert!(gate.accept(&event_with_area(50.0)));
        assert!(!gate.accept(&event_with_area(5.0)));
        assert!(!gate.accept(&event_with_area(200.0)));
    }

    #[test]
    fn size_gate_accepts_when_feature_absent() {
        let gate = SizeGate::new(10.0, 100.0);
        assert!(gate.accept(&EventData::new()));
    }
}
