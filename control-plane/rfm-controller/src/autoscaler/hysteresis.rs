use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_SCALE_DOWN_DELAY_SECS: i64 = 600;

pub struct HysteresisInput {
    pub prev_desired: Option<i64>,
    pub last_scale_out: Option<DateTime<Utc>>,
    /// Per-target override; falls back to the 10 minute default.
    pub scale_down_delay_secs: Option<i64>,
    pub new_demand: i64,
    pub now: DateTime<Utc>,
}

/// Scale-down damper. Scale-up is always adopted immediately; a scale-down
/// is suppressed until the grace window after the last scale-out elapses.
pub fn apply_hysteresis(input: HysteresisInput) -> i64 {
    let prev = match input.prev_desired {
        None => return input.new_demand,
        Some(prev) => prev,
    };
    if prev < input.new_demand {
        return input.new_demand;
    }
    let last = match input.last_scale_out {
        None => return input.new_demand,
        Some(last) => last,
    };
    let delay = Duration::seconds(
        input
            .scale_down_delay_secs
            .unwrap_or(DEFAULT_SCALE_DOWN_DELAY_SECS),
    );
    if last + delay <= input.now {
        input.new_demand
    } else {
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(secs_ago)
    }

    #[test]
    fn no_prior_status_adopts_demand() {
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: None,
            last_scale_out: None,
            scale_down_delay_secs: None,
            new_demand: 4,
            now: Utc::now(),
        });
        assert_eq!(got, 4);
    }

    #[test]
    fn scale_up_is_immediate() {
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(2),
            last_scale_out: Some(at(0)),
            scale_down_delay_secs: Some(600),
            new_demand: 5,
            now: Utc::now(),
        });
        assert_eq!(got, 5);
    }

    #[test]
    fn scale_down_suppressed_inside_window() {
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(3),
            last_scale_out: Some(at(0)),
            scale_down_delay_secs: None,
            new_demand: 2,
            now: Utc::now(),
        });
        assert_eq!(got, 3);
    }

    #[test]
    fn scale_down_allowed_after_window() {
        let now = Utc::now();
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(3),
            last_scale_out: Some(now - Duration::seconds(601)),
            scale_down_delay_secs: Some(600),
            new_demand: 2,
            now,
        });
        assert_eq!(got, 2);
    }

    #[test]
    fn scale_down_allowed_exactly_at_window_boundary() {
        let now = Utc::now();
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(3),
            last_scale_out: Some(now - Duration::seconds(600)),
            scale_down_delay_secs: Some(600),
            new_demand: 2,
            now,
        });
        assert_eq!(got, 2);
    }

    #[test]
    fn unset_last_scale_out_adopts_demand() {
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(3),
            last_scale_out: None,
            scale_down_delay_secs: Some(600),
            new_demand: 1,
            now: Utc::now(),
        });
        assert_eq!(got, 1);
    }

    #[test]
    fn per_target_override_shortens_window() {
        let now = Utc::now();
        let got = apply_hysteresis(HysteresisInput {
            prev_desired: Some(3),
            last_scale_out: Some(now - Duration::seconds(30)),
            scale_down_delay_secs: Some(20),
            new_demand: 2,
            now,
        });
        assert_eq!(got, 2);
    }
}
