//! Separable trigonometric bases for the imperfection surface.
//!
//! With `bz = k·π·z/H` and `bt = n·θ` the variants expand
//!
//! | variant | terms | axial number k (row m) | edge behaviour |
//! |---|---|---|---|
//! | `HalfSine` | sin bz·sin bt, sin bz·cos bt | m + 1 | w = 0 at z = 0 and z = H |
//! | `HalfCosine` | cos bz·sin bt, cos bz·cos bt | m | ∂w/∂z = 0 at both edges, edge values free |
//! | `CompleteFourier` | all four products | sine m + 1, cosine m | none |
//!
//! Circumferential orders run over n = 0..n0. The `sin(0·θ)` column vanishes
//! identically, so its coefficients are pinned to zero.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BasisFunction {
    HalfSine,
    #[default]
    HalfCosine,
    CompleteFourier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axial {
    Sin,
    Cos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Circumferential {
    Sin,
    Cos,
}

/// One product `axial(k π z / H) · circumferential(n θ)` of a basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component {
    pub axial: Axial,
    pub circumferential: Circumferential,
}

const fn component(axial: Axial, circumferential: Circumferential) -> Component {
    Component {
        axial,
        circumferential,
    }
}

const HALF_SINE: [Component; 2] = [
    component(Axial::Sin, Circumferential::Sin),
    component(Axial::Sin, Circumferential::Cos),
];

const HALF_COSINE: [Component; 2] = [
    component(Axial::Cos, Circumferential::Sin),
    component(Axial::Cos, Circumferential::Cos),
];

const COMPLETE: [Component; 4] = [
    component(Axial::Sin, Circumferential::Sin),
    component(Axial::Sin, Circumferential::Cos),
    component(Axial::Cos, Circumferential::Sin),
    component(Axial::Cos, Circumferential::Cos),
];

impl BasisFunction {
    /// Component order used for coefficient blocks in memory and on disk.
    pub fn components(&self) -> &'static [Component] {
        match self {
            BasisFunction::HalfSine => &HALF_SINE,
            BasisFunction::HalfCosine => &HALF_COSINE,
            BasisFunction::CompleteFourier => &COMPLETE,
        }
    }

    /// Legacy integer selector: 1 half-sine, 2 half-cosine, 3 complete.
    pub fn from_funcnum(funcnum: u8) -> Option<Self> {
        match funcnum {
            1 => Some(BasisFunction::HalfSine),
            2 => Some(BasisFunction::HalfCosine),
            3 => Some(BasisFunction::CompleteFourier),
            _ => None,
        }
    }

    pub fn funcnum(&self) -> u8 {
        match self {
            BasisFunction::HalfSine => 1,
            BasisFunction::HalfCosine => 2,
            BasisFunction::CompleteFourier => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BasisFunction::HalfSine => "half_sine",
            BasisFunction::HalfCosine => "half_cosine",
            BasisFunction::CompleteFourier => "complete_fourier",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "half_sine" => Some(BasisFunction::HalfSine),
            "half_cosine" => Some(BasisFunction::HalfCosine),
            "complete_fourier" => Some(BasisFunction::CompleteFourier),
            _ => None,
        }
    }
}

impl Axial {
    /// Axial wave number of mode row `m`.
    pub fn wave_number(&self, m: usize) -> usize {
        match self {
            Axial::Sin => m + 1,
            Axial::Cos => m,
        }
    }

    pub fn eval(&self, m: usize, z: f64, height: f64) -> f64 {
        let arg = self.wave_number(m) as f64 * PI * z / height;
        match self {
            Axial::Sin => arg.sin(),
            Axial::Cos => arg.cos(),
        }
    }
}

impl Circumferential {
    pub fn eval(&self, n: usize, theta: f64) -> f64 {
        let arg = n as f64 * theta;
        match self {
            Circumferential::Sin => arg.sin(),
            Circumferential::Cos => arg.cos(),
        }
    }

    /// Whether order `n` contributes a non-zero column.
    pub fn is_active(&self, n: usize) -> bool {
        !(matches!(self, Circumferential::Sin) && n == 0)
    }
}

/// Active unknown of the least-squares system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub component: usize,
    pub m: usize,
    pub n: usize,
}

/// Enumerates the active terms in a fixed order: component block, then m, then n.
pub fn active_terms(basis: BasisFunction, m_modes: &[usize], n_modes: &[usize]) -> Vec<Term> {
    let mut terms = Vec::new();
    for (c, comp) in basis.components().iter().enumerate() {
        for &m in m_modes {
            for &n in n_modes {
                if comp.circumferential.is_active(n) {
                    terms.push(Term { component: c, m, n });
                }
            }
        }
    }
    terms
}

/// Precomputed axial and circumferential factors at one (θ, z) location.
pub(crate) struct ModeTable {
    pub axial_sin: Vec<f64>,
    pub axial_cos: Vec<f64>,
    pub circ_sin: Vec<f64>,
    pub circ_cos: Vec<f64>,
}

impl ModeTable {
    pub fn new(m0: usize, n0: usize, theta: f64, z: f64, height: f64) -> Self {
        Self {
            axial_sin: (0..m0).map(|m| Axial::Sin.eval(m, z, height)).collect(),
            axial_cos: (0..m0).map(|m| Axial::Cos.eval(m, z, height)).collect(),
            circ_sin: (0..n0).map(|n| Circumferential::Sin.eval(n, theta)).collect(),
            circ_cos: (0..n0).map(|n| Circumferential::Cos.eval(n, theta)).collect(),
        }
    }

    pub fn value(&self, comp: &Component, m: usize, n: usize) -> f64 {
        let a = match comp.axial {
            Axial::Sin => self.axial_sin[m],
            Axial::Cos => self.axial_cos[m],
        };
        let c = match comp.circumferential {
            Circumferential::Sin => self.circ_sin[n],
            Circumferential::Cos => self.circ_cos[n],
        };
        a * c
    }
}
