//! Built-in operator catalogue.

pub mod accumulator;
pub mod expression;
pub mod window;

use chrono::{DateTime, Months, Utc};

use crate::context::Context;
use crate::error::{Error, Result};

/// Register every built-in operator into `ctx`.
pub fn register_defaults(ctx: &mut Context) {
    ctx.add_operators(crate::predicates::query_operators())
        .add_operators(crate::query::query_operators())
        .add_operators(crate::predicates::expression_operators())
        .add_operators(expression::operators())
        .add_operators(accumulator::operators())
        .add_operators(window::operators());
}

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Shift a millisecond timestamp by `amount` calendar `unit`s.
///
/// Month-based units clamp to the end of shorter months (Jan 31 + 1 month
/// is the last day of February).
pub fn date_add(millis: i64, unit: &str, amount: i64) -> Result<i64> {
    let overflow = || Error::evaluation("$dateAdd", "date out of range");
    let fixed = |step: i64| {
        amount
            .checked_mul(step)
            .and_then(|delta| millis.checked_add(delta))
            .ok_or_else(overflow)
    };
    match unit {
        "millisecond" => fixed(1),
        "second" => fixed(MILLIS_PER_SECOND),
        "minute" => fixed(MILLIS_PER_MINUTE),
        "hour" => fixed(MILLIS_PER_HOUR),
        "day" => fixed(MILLIS_PER_DAY),
        "week" => fixed(7 * MILLIS_PER_DAY),
        "month" | "quarter" | "year" => {
            let per_unit = match unit {
                "year" => 12,
                "quarter" => 3,
                _ => 1,
            };
            let months = amount.checked_mul(per_unit).ok_or_else(overflow)?;
            let start: DateTime<Utc> = DateTime::from_timestamp_millis(millis).ok_or_else(overflow)?;
            let count = u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?;
            let shifted = if months >= 0 {
                start.checked_add_months(Months::new(count))
            } else {
                start.checked_sub_months(Months::new(count))
            };
            shifted.map(|dt| dt.timestamp_millis()).ok_or_else(overflow)
        }
        other => Err(Error::evaluation(
            "$dateAdd",
            format!("unknown time unit '{other}'"),
        )),
    }
}
