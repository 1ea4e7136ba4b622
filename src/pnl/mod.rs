use crate::models::Direction;

/// Gross P&L before fees.
///
/// Leverage multiplies the price move; the notional is quote-currency
/// exposure at entry.
pub fn gross_pnl(
    direction: Direction,
    entry_price: f64,
    exit_price: f64,
    notional: f64,
    leverage: f64,
) -> f64 {
    let price_delta = match direction {
        Direction::Long => exit_price - entry_price,
        Direction::Short => entry_price - exit_price,
    };
    (price_delta / entry_price) * notional * leverage
}

/// Net P&L after round-trip fees.
///
/// Fees are charged on notional per side (entry + exit), independent of
/// leverage, matching exchange fee conventions.
pub fn net_pnl(
    direction: Direction,
    entry_price: f64,
    exit_price: f64,
    notional: f64,
    leverage: f64,
    fee_rate_per_side: f64,
) -> f64 {
    gross_pnl(direction, entry_price, exit_price, notional, leverage)
        - notional * fee_rate_per_side * 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_long_profit() {
        // +10% move on 100 notional at 1x = +10 gross, -0.2 fees
        let pnl = net_pnl(Direction::Long, 100.0, 110.0, 100.0, 1.0, 0.001);
        assert!((pnl - 9.8).abs() < EPS);
    }

    #[test]
    fn test_short_profit() {
        // Shorts gain when price falls
        let pnl = net_pnl(Direction::Short, 100.0, 90.0, 100.0, 1.0, 0.001);
        assert!((pnl - 9.8).abs() < EPS);
    }

    #[test]
    fn test_leverage_multiplies_gross_not_fees() {
        let gross = gross_pnl(Direction::Long, 100.0, 101.0, 100.0, 10.0);
        assert!((gross - 10.0).abs() < EPS);

        // Fees stay on notional regardless of leverage
        let net = net_pnl(Direction::Long, 100.0, 101.0, 100.0, 10.0, 0.001);
        assert!((net - 9.8).abs() < EPS);
    }

    #[test]
    fn test_zero_move_costs_round_trip_fees() {
        // Flat exit = fees only: -2 * notional * fee
        for notional in [1.0, 100.0, 12345.0] {
            for fee in [0.0, 0.0005, 0.001] {
                let pnl = net_pnl(Direction::Long, 250.0, 250.0, notional, 3.0, fee);
                assert!((pnl + 2.0 * notional * fee).abs() < EPS);
            }
        }
    }

    #[test]
    fn test_long_and_short_are_mirrored() {
        for exit in [55000.0, 60000.0, 62500.0] {
            let long = gross_pnl(Direction::Long, 60000.0, exit, 100.0, 2.0);
            let short = gross_pnl(Direction::Short, 60000.0, exit, 100.0, 2.0);
            assert!((long + short).abs() < EPS);
        }
    }

    #[test]
    fn test_worked_example_btc_small_move() {
        // Long BTCUSDT, entry 60000, notional 100, 1x, 0.001/side.
        // 60100: gross = (100/60000)*100 = 0.1667, net = -0.0333
        let pnl = net_pnl(Direction::Long, 60000.0, 60100.0, 100.0, 1.0, 0.001);
        assert!((pnl - (100.0 / 60000.0 * 100.0 - 0.2)).abs() < EPS);
        assert!(pnl < 0.01);

        // 60200: gross = 0.3333, net = 0.1333 -> above a $0.01 floor
        let pnl = net_pnl(Direction::Long, 60000.0, 60200.0, 100.0, 1.0, 0.001);
        assert!((pnl - (200.0 / 60000.0 * 100.0 - 0.2)).abs() < EPS);
        assert!(pnl > 0.01);
    }
}
