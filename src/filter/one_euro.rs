use std::fmt;
use std::time::Instant;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// One-Euro filter tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    /// Sample rate assumed when no interval can be measured (Hz)
    pub frequency: f32,
    /// Cutoff at rest (Hz)
    pub min_cutoff: f32,
    /// Cutoff increase per unit of speed
    pub beta: f32,
    /// Cutoff of the derivative low-pass (Hz)
    pub d_cutoff: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            frequency: 60.0,
            min_cutoff: 0.5,
            beta: 0.0001,
            d_cutoff: 0.1,
        }
    }
}

/// alpha = 1 / (1 + tau/Te), tau = 1/(2*pi*fc)
pub fn smoothing_factor(te: f32, cutoff: f32) -> f32 {
    let r = 2.0 * std::f32::consts::PI * cutoff * te;
    r / (r + 1.0)
}

/// A value the One-Euro filter can smooth.
pub trait Smoothable: Copy + fmt::Debug {
    /// Rate of change of the value
    type Velocity: Copy + fmt::Debug;

    fn zero_velocity() -> Self::Velocity;

    /// `(to - from) * rate`
    fn velocity(from: &Self, to: &Self, rate: f32) -> Self::Velocity;

    fn speed(velocity: &Self::Velocity) -> f32;

    fn blend_velocity(from: &Self::Velocity, to: &Self::Velocity, alpha: f32) -> Self::Velocity;

    /// Exponential smoothing step from `from` toward `to`.
    fn blend(from: &Self, to: &Self, alpha: f32) -> Self;
}

impl Smoothable for Vector3<f32> {
    type Velocity = Vector3<f32>;

    fn zero_velocity() -> Self::Velocity {
        Vector3::zeros()
    }

    fn velocity(from: &Self, to: &Self, rate: f32) -> Self::Velocity {
        (to - from) * rate
    }

    fn speed(velocity: &Self::Velocity) -> f32 {
        velocity.norm()
    }

    fn blend_velocity(from: &Self::Velocity, to: &Self::Velocity, alpha: f32) -> Self::Velocity {
        from.lerp(to, alpha)
    }

    fn blend(from: &Self, to: &Self, alpha: f32) -> Self {
        from.lerp(to, alpha)
    }
}

/// Spherical interpolation along the shortest arc, renormalized.
pub fn slerp_shortest(
    from: &UnitQuaternion<f32>,
    to: &UnitQuaternion<f32>,
    alpha: f32,
) -> UnitQuaternion<f32> {
    let to = if from.coords.dot(&to.coords) < 0.0 {
        UnitQuaternion::new_unchecked(-to.into_inner())
    } else {
        *to
    };
    // try_slerp gives up when both ends are (nearly) equal
    let blended = from
        .try_slerp(&to, alpha, 1.0e-6)
        .unwrap_or_else(|| from.nlerp(&to, alpha));
    UnitQuaternion::new_normalize(blended.into_inner())
}

impl Smoothable for UnitQuaternion<f32> {
    /// Angular velocity, axis * rad/s
    type Velocity = Vector3<f32>;

    fn zero_velocity() -> Self::Velocity {
        Vector3::zeros()
    }

    fn velocity(from: &Self, to: &Self, rate: f32) -> Self::Velocity {
        // rotation_to yields the shortest arc (angle in [0, pi])
        from.rotation_to(to).scaled_axis() * rate
    }

    fn speed(velocity: &Self::Velocity) -> f32 {
        velocity.norm()
    }

    fn blend_velocity(from: &Self::Velocity, to: &Self::Velocity, alpha: f32) -> Self::Velocity {
        from.lerp(to, alpha)
    }

    fn blend(from: &Self, to: &Self, alpha: f32) -> Self {
        slerp_shortest(from, to, alpha)
    }
}

/// Per-channel filter memory
#[derive(Debug, Clone, Copy)]
pub struct FilterState<T: Smoothable> {
    pub value: T,
    pub derivative: T::Velocity,
    pub last_time: Instant,
}

/// Adaptive low-pass filter: the cutoff rises with the estimated speed, so
/// slow motion is smoothed heavily and fast motion lags little.
#[derive(Debug, Clone)]
pub struct OneEuroFilter<T: Smoothable> {
    params: FilterParams,
    state: Option<FilterState<T>>,
}

impl<T: Smoothable> OneEuroFilter<T> {
    pub fn new(params: FilterParams) -> Self {
        Self { params, state: None }
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    pub fn state(&self) -> Option<&FilterState<T>> {
        self.state.as_ref()
    }

    pub fn filter(&mut self, value: T, now: Instant) -> T {
        let Some(state) = self.state.as_mut() else {
            self.state = Some(FilterState {
                value,
                derivative: T::zero_velocity(),
                last_time: now,
            });
            return value;
        };

        let elapsed = now.saturating_duration_since(state.last_time).as_secs_f32();
        let rate = if elapsed > 0.0 {
            1.0 / elapsed
        } else {
            self.params.frequency
        };
        let te = 1.0 / rate;

        let dx = T::velocity(&state.value, &value, rate);
        let edx = T::blend_velocity(
            &state.derivative,
            &dx,
            smoothing_factor(te, self.params.d_cutoff),
        );
        let cutoff = self.params.min_cutoff + self.params.beta * T::speed(&edx);
        let filtered = T::blend(&state.value, &value, smoothing_factor(te, cutoff));

        *state = FilterState {
            value: filtered,
            derivative: edx,
            last_time: now,
        };
        filtered
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}
