//! Clamping of computed kick changes to the safe envelope of a plane.
use super::Plane;
use crate::error::KickError;

/// Safe envelope of one plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneLimits {
    pub max_kick: f64,
    pub max_delta_kick: f64,
    /// Fraction of the computed change applied
    pub corr_factor: f64,
    /// Changes at or below this magnitude are not applied
    pub tolerance: f64,
}

/// Turn current kicks and computed Δkicks into the kicks to apply.
///
/// Returns `None` for correctors that must not be touched (their Δkick was
/// negligible). Fails, leaving every corrector alone, if any current kick is
/// already above `max_kick`.
pub fn process_kicks(
    plane: Plane,
    kicks: &[f64],
    deltas: &[f64],
    limits: &PlaneLimits,
) -> Result<Vec<Option<f64>>, KickError> {
    if kicks.len() != deltas.len() {
        return Err(KickError::LengthMismatch(
            plane.label(),
            kicks.len(),
            deltas.len(),
        ));
    }
    let active: Vec<bool> = deltas.iter().map(|d| d.abs() > limits.tolerance).collect();
    let mut dk: Vec<f64> = deltas
        .iter()
        .zip(active.iter())
        .map(|(d, on)| if *on { d * limits.corr_factor } else { 0.0 })
        .collect();

    if kicks.iter().any(|k| k.abs() > limits.max_kick) {
        return Err(KickError::AboveMaxKick(plane.label()));
    }

    let largest = dk.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
    let mut factor1 = 1.0;
    if largest > limits.max_delta_kick {
        factor1 = limits.max_delta_kick / largest;
        dk.iter_mut().for_each(|d| *d *= factor1);
    }

    let mut factor2 = 1.0;
    let outside = kicks
        .iter()
        .zip(dk.iter())
        .any(|(k, d)| (k + d).abs() > limits.max_kick);
    if outside {
        // Largest uniform scale keeping every entry inside [-max, max]
        let mut plane_limit = f64::INFINITY;
        for (k, d) in kicks.iter().zip(dk.iter()) {
            if *d == 0.0 {
                continue;
            }
            let upper = (limits.max_kick - k) / d;
            let lower = (-limits.max_kick - k) / d;
            plane_limit = plane_limit.min(upper.max(lower));
        }
        factor2 = plane_limit.clamp(0.0, 1.0);
        dk.iter_mut().for_each(|d| *d *= factor2);
    }

    let factor = factor1 * factor2;
    if factor < 1.0 {
        spdlog::warn!(
            "Plane {plane}: Δkicks scaled down to {:.2}% to respect the kick limits",
            factor * 100.0
        );
    }

    Ok(kicks
        .iter()
        .zip(dk.iter())
        .zip(active.iter())
        .map(|((k, d), on)| {
            on.then(|| (k + d).clamp(-limits.max_kick, limits.max_kick))
        })
        .collect())
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PlaneLimits {
        PlaneLimits {
            max_kick: 10.0,
            max_delta_kick: 2.0,
            corr_factor: 1.0,
            tolerance: 1e-3,
        }
    }

    #[test]
    fn test_small_deltas_are_untouched() {
        let out = process_kicks(Plane::H, &[1.0, 2.0, 3.0], &[0.5, 0.0, 1e-4], &limits()).unwrap();
        assert_eq!(out, vec![Some(1.5), None, None]);
    }

    #[test]
    fn test_corr_factor_scales() {
        let mut lim = limits();
        lim.corr_factor = 0.5;
        let out = process_kicks(Plane::V, &[0.0, 0.0], &[1.0, -1.0], &lim).unwrap();
        assert_eq!(out, vec![Some(0.5), Some(-0.5)]);
    }

    #[test]
    fn test_max_delta_kick_rescales_uniformly() {
        let out = process_kicks(Plane::H, &[0.0, 0.0], &[4.0, -1.0], &limits()).unwrap();
        assert_eq!(out, vec![Some(2.0), Some(-0.5)]);
    }

    #[test]
    fn test_max_kick_bounds_the_result() {
        // 9 + 2 would exceed 10: the whole plane is scaled by 0.5
        let out = process_kicks(Plane::H, &[9.0, 0.0], &[2.0, 2.0], &limits()).unwrap();
        assert_eq!(out, vec![Some(10.0), Some(1.0)]);
        let out = process_kicks(Plane::H, &[-9.5, 3.0], &[-1.0, 1.0], &limits()).unwrap();
        assert_eq!(out, vec![Some(-10.0), Some(3.5)]);
    }

    #[test]
    fn test_kick_above_max_aborts() {
        let err = process_kicks(Plane::H, &[10.5, 0.0], &[0.1, 0.1], &limits()).unwrap_err();
        assert_eq!(err.to_string(), "Kicks above MaxKickH");
    }

    #[test]
    fn test_envelope_over_many_inputs() {
        let lim = limits();
        for i in 0..200 {
            let x = i as f64;
            let kicks: Vec<f64> = (0..8).map(|j| ((x * 0.37 + j as f64 * 1.3).sin()) * 10.0).collect();
            let deltas: Vec<f64> = (0..8)
                .map(|j| if j == 3 { 0.0 } else { (x * 0.11 + j as f64).cos() * 7.0 })
                .collect();
            let out = process_kicks(Plane::V, &kicks, &deltas, &lim).unwrap();
            for ((k, new), d) in kicks.iter().zip(out.iter()).zip(deltas.iter()) {
                match new {
                    Some(new) => {
                        assert!(new.abs() <= lim.max_kick + 1e-12);
                        assert!((new - k).abs() <= lim.max_delta_kick + 1e-12);
                    }
                    None => assert!(d.abs() <= lim.tolerance),
                }
            }
        }
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            process_kicks(Plane::RF, &[1.0], &[], &limits()),
            Err(KickError::LengthMismatch("RF", 1, 0))
        ));
    }
}
