// Property coverage for the uptime percentage formula (spec §8 "Uptime
// bounds"): for any non-negative `participated <= total`, the resulting
// percentage stays within `[0, 100]`.

use bigdecimal::BigDecimal;
use num_traits::FromPrimitive;
use quickcheck_macros::quickcheck;

fn uptime_percentage(participated: u32, total: u32) -> BigDecimal {
    if total == 0 {
        return BigDecimal::from(0);
    }
    let participated = participated.min(total);
    BigDecimal::from_f64(f64::from(participated) / f64::from(total) * 100.0).unwrap_or_else(|| BigDecimal::from(0))
}

#[quickcheck]
fn uptime_percentage_stays_within_bounds(participated: u32, total: u32) -> bool {
    let pct = uptime_percentage(participated, total);
    pct >= BigDecimal::from(0) && pct <= BigDecimal::from(100)
}

#[quickcheck]
fn full_participation_is_one_hundred_percent(total: u32) -> bool {
    if total == 0 {
        return true;
    }
    uptime_percentage(total, total) == BigDecimal::from(100)
}
