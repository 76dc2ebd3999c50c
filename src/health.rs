//! Grid voltage and split-phase balance evaluators.

use std::fmt;

/// Below this heavier leg current a phase imbalance is never reported.
pub const PHASE_MIN_LOAD_AMPS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridStatus {
    Normal,
    Brownout,
    Surge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Balanced,
    Warning,
    Disabled,
}

impl fmt::Display for GridStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GridStatus::Normal => "Normal",
            GridStatus::Brownout => "Brownout",
            GridStatus::Surge => "Surge",
        })
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseStatus::Balanced => "Balanced",
            PhaseStatus::Warning => "Warning",
            PhaseStatus::Disabled => "Disabled",
        })
    }
}

pub fn evaluate_grid(voltage: f64, low: f64, high: f64) -> GridStatus {
    if voltage < low {
        GridStatus::Brownout
    } else if voltage > high {
        GridStatus::Surge
    } else {
        GridStatus::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBalance {
    pub imbalance_pct: f64,
    pub status: PhaseStatus,
}

pub fn evaluate_phase(amps_a: f64, amps_b: f64, threshold_pct: f64) -> PhaseBalance {
    let heavier = amps_a.max(amps_b);
    let imbalance_pct = if heavier == 0.0 {
        0.0
    } else {
        (amps_a - amps_b).abs() / heavier * 100.0
    };
    let status = if imbalance_pct > threshold_pct && heavier > PHASE_MIN_LOAD_AMPS {
        PhaseStatus::Warning
    } else {
        PhaseStatus::Balanced
    };
    PhaseBalance {
        imbalance_pct,
        status,
    }
}
