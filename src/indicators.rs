//! Small technical-analysis helpers operating on plain price slices.

pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    Some(prices[prices.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Relative Strength Index with Wilder's smoothing, 0..100.
/// Needs `period + 1` prices (most recent last).
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;

    for i in period..deltas.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

/// Short-vs-long SMA crossover with a 1% dead band.
pub fn trend_strength(prices: &[f64], short_window: usize, long_window: usize) -> Trend {
    let (Some(short), Some(long)) = (sma(prices, short_window), sma(prices, long_window)) else {
        return Trend::Neutral;
    };
    if short > long * 1.01 {
        Trend::Up
    } else if short < long * 0.99 {
        Trend::Down
    } else {
        Trend::Neutral
    }
}
