//! Money validation and arithmetic for metric merging.

use crate::error::Error;
use crate::proto::Money;

const NANOS_PER_UNIT: i128 = 1_000_000_000;
const MAX_NANOS: i32 = 999_999_999;

/// Largest representable amount in total nanos: `i64::MAX` units and
/// maximal sign-consistent nanos.
const MAX_TOTAL_NANOS: i128 = i64::MAX as i128 * NANOS_PER_UNIT + MAX_NANOS as i128;
const MIN_TOTAL_NANOS: i128 = i64::MIN as i128 * NANOS_PER_UNIT - MAX_NANOS as i128;

fn total_nanos(money: &Money) -> i128 {
    money.units as i128 * NANOS_PER_UNIT + money.nanos as i128
}

fn from_total_nanos(currency_code: String, total: i128) -> Money {
    // Rust's truncating division keeps the remainder sign-consistent
    // with the quotient.
    Money {
        currency_code,
        units: (total / NANOS_PER_UNIT) as i64,
        nanos: (total % NANOS_PER_UNIT) as i32,
    }
}

/// Checks that a money value is well formed: a three-letter currency
/// code, nanos within `±999_999_999`, and units/nanos agreeing in
/// sign.
pub fn validate_money(money: &Money) -> Result<(), Error> {
    if money.currency_code.len() != 3
        || !money.currency_code.bytes().all(|b| b.is_ascii_alphabetic())
    {
        return Err(Error::InvalidMoney(format!(
            "currency code \"{}\" must be three letters",
            money.currency_code
        )));
    }
    if money.nanos < -MAX_NANOS || money.nanos > MAX_NANOS {
        return Err(Error::InvalidMoney(format!(
            "nanos {} out of range",
            money.nanos
        )));
    }
    if (money.units > 0 && money.nanos < 0) || (money.units < 0 && money.nanos > 0) {
        return Err(Error::InvalidMoney(
            "units and nanos disagree in sign".into(),
        ));
    }
    Ok(())
}

/// The sign of the amount: -1, 0 or 1.
pub fn amount_sign(money: &Money) -> i32 {
    total_nanos(money).signum() as i32
}

/// Adds two amounts, failing with `CurrencyMismatch` on differing
/// currencies and `MoneyOutOfRange` on overflow.
pub fn try_add_money(a: &Money, b: &Money) -> Result<Money, Error> {
    if a.currency_code != b.currency_code {
        return Err(Error::CurrencyMismatch {
            left: a.currency_code.clone(),
            right: b.currency_code.clone(),
        });
    }
    let total = total_nanos(a) + total_nanos(b);
    if !(MIN_TOTAL_NANOS..=MAX_TOTAL_NANOS).contains(&total) {
        return Err(Error::MoneyOutOfRange);
    }
    Ok(from_total_nanos(a.currency_code.clone(), total))
}

/// Adds two amounts of the same currency, clamping to the
/// representable range instead of overflowing. Agrees with
/// [`try_add_money`] whenever that succeeds.
pub fn saturating_add_money(a: &Money, b: &Money) -> Money {
    let total = (total_nanos(a) + total_nanos(b)).clamp(MIN_TOTAL_NANOS, MAX_TOTAL_NANOS);
    from_total_nanos(a.currency_code.clone(), total)
}
