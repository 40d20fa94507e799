use rust_decimal::prelude::*;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

/// Lossy f64 -> Decimal conversion for prices coming off the wire; takes
/// the shortest decimal representation (0.49f64 becomes exactly 0.49).
/// NaN/inf collapse to zero; callers validate prices before the money path.
pub fn dec(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default()
}

pub fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dec_handles_garbage_floats() {
        assert_eq!(dec(f64::NAN), Decimal::ZERO);
        assert_eq!(dec(0.48), Decimal::new(48, 2));
        assert_eq!(dec(0.49) + dec(0.48), Decimal::new(97, 2));
        assert_eq!(dec_to_f64(Decimal::new(975, 3)), 0.975);
    }
}
