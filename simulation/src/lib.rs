//! Toy simulation hosted as a puppet.
//!
//! Every time step produces a field of `n` values, publishes it as `data`
//! (with the step number as `t`) and yields so an analysis can look at it.
//! Usage: `simulation [n] [steps]`, defaults 50 and 3.

use marionette::guest;
use std::{
    ffi::CStr,
    os::raw::{c_char, c_int},
};
use tracing::info;

marionette::export_puppet_hooks!();

const DEFAULT_POINTS: usize = 50;
const DEFAULT_STEPS: i32 = 3;

unsafe fn argument<T: std::str::FromStr>(argc: c_int, argv: *mut *mut c_char, index: c_int) -> Option<T> {
    if index >= argc || argv.is_null() {
        return None;
    }
    let arg = *argv.add(index as usize);
    if arg.is_null() {
        return None;
    }

    CStr::from_ptr(arg).to_str().ok()?.parse().ok()
}

/// deterministic stand-in for a solver step
pub fn field(points: usize, step: i32) -> Vec<f32> {
    (0..points)
        .map(|i| ((i * 7 + step as usize * 3) % 13) as f32 / 13.0)
        .collect()
}

pub fn run(points: usize, steps: i32) -> c_int {
    let group = guest::group().unwrap_or_else(|| "standalone".to_string());

    for step in 0..steps {
        let data = field(points, step);
        let sum: f32 = data.iter().sum();
        info!(group, step, sum, "Simulation step");

        guest::save_int("t", step);
        guest::save_array("data", &data);
        // data has to stay alive until the analysis ran
        guest::yield_to_host();

        if guest::is_stop_requested() {
            info!(step, "Stop requested");
            break;
        }
    }

    0
}

/// # Safety
/// `argv` must hold `argc` valid C strings.
// the test harness brings its own `main`
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn main(argc: c_int, argv: *mut *mut c_char) -> c_int {
    let points = argument(argc, argv, 1).unwrap_or(DEFAULT_POINTS);
    let steps = argument(argc, argv, 2).unwrap_or(DEFAULT_STEPS);

    run(points, steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn standalone_run_completes() {
        assert!(!guest::is_engine_active());
        assert_eq!(run(8, 2), 0);
    }

    #[test]
    pub fn field_is_deterministic() {
        assert_eq!(field(4, 1), field(4, 1));
        assert_eq!(field(13, 0).len(), 13);
        assert!(field(20, 5).iter().all(|value| (0.0..1.0).contains(value)));
    }
}
