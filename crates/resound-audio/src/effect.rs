//! Effects
//!
//! Biquad filter effects bound to a mixer. Parameters are plain data until
//! `apply` pushes them to the backend on the owning thread; the first apply
//! installs a native filter, later ones update it in place.

use std::f64::consts::PI;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use resound_core::{AtomicHandle, Pending};
use resound_platform::{BiquadCoefficients, BiquadType, FilterHandle};
use serde::{Deserialize, Serialize};

use crate::context::AudioContext;
use crate::mixer::Mixer;

/// Filter shape exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterKind {
    LowPass,
    HighPass,
    BandPass,
    BandPassQ,
    Notch,
    #[default]
    AllPass,
    PeakingEq,
    LowShelf,
    HighShelf,
}

impl FilterKind {
    /// Native biquad shape for this kind
    pub fn native(self) -> BiquadType {
        match self {
            Self::LowPass => BiquadType::LowPass,
            Self::HighPass => BiquadType::HighPass,
            Self::BandPass => BiquadType::BandPass,
            Self::BandPassQ => BiquadType::BandPassQ,
            Self::Notch => BiquadType::Notch,
            Self::AllPass => BiquadType::AllPass,
            Self::PeakingEq => BiquadType::PeakingEq,
            Self::LowShelf => BiquadType::LowShelf,
            Self::HighShelf => BiquadType::HighShelf,
        }
    }
}

/// Biquad filter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadParameters {
    pub kind: FilterKind,
    /// Gain in dB, used by peaking and shelf filters
    pub gain_db: f64,
    /// Center or cutoff frequency in Hz
    pub center_hz: f64,
    pub q: f64,
}

impl Default for BiquadParameters {
    fn default() -> Self {
        Self {
            kind: FilterKind::AllPass,
            gain_db: 0.0,
            center_hz: 1000.0,
            q: std::f64::consts::FRAC_1_SQRT_2,
        }
    }
}

impl BiquadParameters {
    /// Compute normalized coefficients (RBJ audio EQ cookbook)
    pub fn coefficients(&self, sample_rate: u32) -> BiquadCoefficients {
        let fs = f64::from(sample_rate.max(1));
        let f0 = self.center_hz.clamp(1.0, fs * 0.49);
        let q = self.q.max(1e-4);

        let w0 = 2.0 * PI * f0 / fs;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let a = 10f64.powf(self.gain_db / 40.0);
        let sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match self.kind {
            FilterKind::LowPass => (
                (1.0 - cos_w0) / 2.0,
                1.0 - cos_w0,
                (1.0 - cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::HighPass => (
                (1.0 + cos_w0) / 2.0,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::BandPass => (
                sin_w0 / 2.0,
                0.0,
                -sin_w0 / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::BandPassQ => (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
            FilterKind::Notch => (1.0, -2.0 * cos_w0, 1.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
            FilterKind::AllPass => (
                1.0 - alpha,
                -2.0 * cos_w0,
                1.0 + alpha,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterKind::PeakingEq => (
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
            FilterKind::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos_w0 + sqrt_a_alpha),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                a * ((a + 1.0) - (a - 1.0) * cos_w0 - sqrt_a_alpha),
                (a + 1.0) + (a - 1.0) * cos_w0 + sqrt_a_alpha,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                (a + 1.0) + (a - 1.0) * cos_w0 - sqrt_a_alpha,
            ),
            FilterKind::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos_w0 + sqrt_a_alpha),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                a * ((a + 1.0) + (a - 1.0) * cos_w0 - sqrt_a_alpha),
                (a + 1.0) - (a - 1.0) * cos_w0 + sqrt_a_alpha,
                2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                (a + 1.0) - (a - 1.0) * cos_w0 - sqrt_a_alpha,
            ),
        };

        BiquadCoefficients {
            kind: self.kind.native(),
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Effect payload, by effect kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EffectParameters {
    BiquadFilter(BiquadParameters),
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self::BiquadFilter(BiquadParameters::default())
    }
}

/// A DSP effect slot on a mixer.
///
/// Lower priorities are processed first; equal priorities keep the order in
/// which they were applied.
pub struct Effect {
    ctx: AudioContext,
    mixer: Weak<Mixer>,
    self_ref: Weak<Effect>,
    priority: i32,
    parameters: Mutex<EffectParameters>,
    filter: AtomicHandle<FilterHandle>,
}

impl Effect {
    pub(crate) fn new(ctx: AudioContext, mixer: Weak<Mixer>, priority: i32) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            ctx,
            mixer,
            self_ref: self_ref.clone(),
            priority,
            parameters: Mutex::new(EffectParameters::default()),
            filter: AtomicHandle::empty(),
        })
    }

    /// Get the priority
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Get the current parameters
    pub fn parameters(&self) -> EffectParameters {
        *self.parameters.lock()
    }

    /// Replace the parameters. Takes effect on the next [`Effect::apply`].
    pub fn set_parameters(&self, parameters: EffectParameters) {
        *self.parameters.lock() = parameters;
    }

    /// Whether a native filter is currently installed
    pub fn is_applied(&self) -> bool {
        !self.filter.is_empty()
    }

    /// Push the parameters to the mixer's native filter chain
    pub fn apply(&self) -> Pending<()> {
        match self.self_ref.upgrade() {
            Some(effect) => self.ctx.schedule("effect_apply", move || effect.apply_internal()),
            None => Pending::ready(()),
        }
    }

    /// Take the effect out of the native filter chain
    pub fn remove(&self) -> Pending<()> {
        match self.self_ref.upgrade() {
            Some(effect) => self.ctx.schedule("effect_remove", move || effect.remove_internal()),
            None => Pending::ready(()),
        }
    }

    fn apply_internal(self: &Arc<Self>) {
        let Some(mixer) = self.mixer.upgrade().filter(|m| !m.is_disposed()) else {
            log::debug!("Effect applied after its mixer was disposed");
            return;
        };
        let Some(mixer_handle) = mixer.handle() else {
            return;
        };

        let sample_rate = self.ctx.backend.audio_spec().sample_rate;
        let coefficients = match self.parameters() {
            EffectParameters::BiquadFilter(parameters) => parameters.coefficients(sample_rate),
        };

        if let Some(filter) = self.filter.load() {
            self.ctx
                .backend
                .update_biquad_filter(mixer_handle, filter, coefficients);
            return;
        }

        match self
            .ctx
            .backend
            .apply_biquad_filter(mixer_handle, coefficients, self.priority)
        {
            Some(filter) => {
                self.filter.install(filter);
                mixer.effect_chain().insert(self);
            }
            None => log::error!("Failed to apply biquad filter to mixer '{}'", mixer.identifier()),
        }
    }

    fn remove_internal(&self) {
        let Some(filter) = self.filter.take() else {
            return;
        };
        let Some(mixer) = self.mixer.upgrade() else {
            return;
        };

        mixer.effect_chain().remove(self);
        if let Some(mixer_handle) = mixer.handle() {
            self.ctx.backend.remove_biquad_filter(mixer_handle, filter);
        }
    }

    /// Hand the native filter to the mixer being disposed
    pub(crate) fn take_filter(&self) -> Option<FilterHandle> {
        self.filter.take()
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        let Some(filter) = self.filter.take() else {
            return;
        };
        let mixer = self.mixer.clone();
        let backend = self.ctx.backend.clone();
        self.ctx.post("effect_drop", move || {
            if let Some(handle) = mixer.upgrade().and_then(|m| m.handle()) {
                backend.remove_biquad_filter(handle, filter);
            }
        });
    }
}

struct ChainEntry {
    priority: i32,
    sequence: u64,
    effect: Weak<Effect>,
}

/// Applied effects of a mixer in processing order
#[derive(Default)]
pub struct EffectChain {
    entries: Vec<ChainEntry>,
    next_sequence: u64,
}

impl EffectChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, effect: &Arc<Effect>) {
        self.prune();
        let priority = effect.priority();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let index = self.entries.partition_point(|e| e.priority <= priority);
        self.entries.insert(
            index,
            ChainEntry {
                priority,
                sequence,
                effect: Arc::downgrade(effect),
            },
        );
    }

    pub(crate) fn remove(&mut self, effect: &Effect) {
        self.entries
            .retain(|e| !std::ptr::eq(e.effect.as_ptr(), effect) && e.effect.strong_count() > 0);
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Effect>> {
        self.entries
            .drain(..)
            .filter_map(|e| e.effect.upgrade())
            .collect()
    }

    fn prune(&mut self) {
        self.entries.retain(|e| e.effect.strong_count() > 0);
    }

    /// Live effects in processing order
    pub fn effects(&self) -> Vec<Arc<Effect>> {
        self.entries
            .iter()
            .filter_map(|e| e.effect.upgrade())
            .collect()
    }

    /// `(priority, sequence)` of every live entry in processing order
    pub fn order(&self) -> Vec<(i32, u64)> {
        self.entries
            .iter()
            .filter(|e| e.effect.strong_count() > 0)
            .map(|e| (e.priority, e.sequence))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.effect.strong_count() > 0)
            .count()
    }

    /// Check whether the chain has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
