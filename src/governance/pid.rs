//! PID controller driving the Adaptive Governor's concurrency cap
//! (spec.md §4.6). Grounded on the teacher crate's
//! `governance::retry::adaptive::compute` in spirit (clamp-everything,
//! reset-on-non-finite discipline) though the control law itself is new:
//! the teacher computes a one-shot backoff duration, this computes a
//! closed-loop correction each sample period.

#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.05,
            kd: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PidState {
    integral: f64,
    previous_error: f64,
    last_output: f64,
}

impl Default for PidState {
    fn default() -> Self {
        Self {
            integral: 0.0,
            previous_error: 0.0,
            last_output: 0.0,
        }
    }
}

/// Bound on the integral term to prevent windup (spec.md §3 "PID State").
const INTEGRAL_MAX: f64 = 10_000.0;

impl PidState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    /// One control step. `dt_secs` must be > 0. Returns the raw
    /// (unrounded) output; callers apply it as `cap -= round(output)`.
    /// On a non-finite result the state is reset and `None` is returned so
    /// the caller can fall back to `max_streams` (spec.md §4.6, P6).
    pub fn step(&mut self, measured_ttft_ms: f64, target_ttft_ms: f64, dt_secs: f64, gains: PidGains) -> Option<f64> {
        let error = measured_ttft_ms - target_ttft_ms;
        let integral = (self.integral + error * dt_secs).clamp(-INTEGRAL_MAX, INTEGRAL_MAX);
        let derivative = if dt_secs > 0.0 {
            (error - self.previous_error) / dt_secs
        } else {
            0.0
        };
        let output = gains.kp * error + gains.ki * integral + gains.kd * derivative;

        if !output.is_finite() {
            self.reset();
            return None;
        }

        self.integral = integral;
        self.previous_error = error;
        self.last_output = output;
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_error_decreases_output_is_positive() {
        let mut state = PidState::default();
        let output = state.step(600.0, 200.0, 1.0, PidGains::default()).unwrap();
        assert!(output > 0.0, "TTFT above target should push the cap down");
    }

    #[test]
    fn non_finite_output_resets_state() {
        let mut state = PidState::default();
        state.integral = f64::MAX;
        let gains = PidGains {
            kp: 1.0,
            ki: f64::MAX,
            kd: 0.0,
        };
        let result = state.step(f64::MAX, 0.0, 1.0, gains);
        assert!(result.is_none());
        assert_eq!(state.last_output, 0.0);
        assert_eq!(state.integral, 0.0);
    }
}
