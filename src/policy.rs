//! Policy Validator / Sizer (§4.4). Hard-rule order is first-failure-wins;
//! sizing only runs once every rule has passed. `PolicyParams` is the single
//! source of thresholds also read by `facts::gating_facts`, so the two can
//! never drift apart (§9's "cyclic entanglement" fix).

use crate::api::{PolicyVerdict, PortfolioContext, Side, TradePlan, ValidateMarket, Verdict};
use crate::config::PolicyParams;

pub fn validate(
    plan: &TradePlan,
    market: &ValidateMarket,
    portfolio: &PortfolioContext,
    params: &PolicyParams,
    decision_id: &str,
) -> PolicyVerdict {
    let reject = |reason: String| PolicyVerdict {
        verdict: Verdict::Rejected,
        reason,
        adjusted_size: 0,
        decision_id: decision_id.to_string(),
    };

    if portfolio.realized_pnl_today <= params.daily_kill_switch {
        return reject(format!(
            "daily kill-switch tripped: realized P&L {:.2} <= {:.2}",
            portfolio.realized_pnl_today, params.daily_kill_switch
        ));
    }
    if portfolio.open_positions >= params.max_positions {
        return reject(format!(
            "position cap reached: {} open >= {} max",
            portfolio.open_positions, params.max_positions
        ));
    }
    if market.avg_dollar_vol < params.min_dollar_adv {
        return reject(format!(
            "liquidity below floor: dollar ADV {:.0} < {:.0}",
            market.avg_dollar_vol, params.min_dollar_adv
        ));
    }
    let spread_bps = if market.price > 0.0 { market.spread / market.price * 1e4 } else { f64::MAX };
    if market.spread > params.spread_cents_max || spread_bps > params.spread_bps_max {
        return reject(format!(
            "spread too wide: {:.4} ({:.1} bps) exceeds {:.4}/{:.1} bps",
            market.spread, spread_bps, params.spread_cents_max, params.spread_bps_max
        ));
    }
    if let Err(reason) = plan_sanity(plan, market, params) {
        return reject(reason);
    }

    let worst_entry = worst_case_entry(plan, market, params);
    let risk_per_share = (worst_entry - plan.stop_price).abs();
    if risk_per_share <= 0.0 {
        return reject("risk_per_share is zero or negative, cannot size".to_string());
    }

    let max_shares_by_ticket = (params.max_ticket / worst_entry).floor() as i64;
    let max_shares_by_loss = (params.max_per_trade_loss / risk_per_share).floor() as i64;
    let max_shares_by_adv = (params.pct_adv_cap * market.avg_dollar_vol / worst_entry).floor() as i64;

    let adjusted_size = max_shares_by_ticket.min(max_shares_by_loss).min(max_shares_by_adv).max(0);

    if adjusted_size == 0 {
        return PolicyVerdict {
            verdict: Verdict::Review,
            reason: format!(
                "all sizing caps resolved to zero shares (ticket={max_shares_by_ticket}, \
                 loss={max_shares_by_loss}, adv={max_shares_by_adv})"
            ),
            adjusted_size: 0,
            decision_id: decision_id.to_string(),
        };
    }

    PolicyVerdict {
        verdict: Verdict::Approved,
        reason: format!(
            "approved: sized to {adjusted_size} shares (ticket={max_shares_by_ticket}, \
             loss={max_shares_by_loss}, adv={max_shares_by_adv})"
        ),
        adjusted_size,
        decision_id: decision_id.to_string(),
    }
}

/// `entry + spread/2 + SLIPPAGE_BPS*entry/1e4`, symmetric for shorts (§4.4).
fn worst_case_entry(plan: &TradePlan, market: &ValidateMarket, params: &PolicyParams) -> f64 {
    let half_spread = market.spread / 2.0;
    let slippage = params.slippage_bps * plan.entry_price / 1e4;
    match plan.side() {
        Side::Long => plan.entry_price + half_spread + slippage,
        Side::Short => plan.entry_price - half_spread - slippage,
    }
}

fn plan_sanity(plan: &TradePlan, market: &ValidateMarket, params: &PolicyParams) -> Result<(), String> {
    if !plan.entry_price.is_finite() || plan.entry_price <= 0.0 {
        return Err("entry_price must be finite and positive".to_string());
    }
    if market.price > 0.0 {
        let drift_bps = (plan.entry_price - market.price).abs() / market.price * 1e4;
        if drift_bps > params.max_entry_drift_bps {
            return Err(format!(
                "entry price too far from market: {:.2} vs market {:.2} ({:.1} bps > {:.1} bps max)",
                plan.entry_price, market.price, drift_bps, params.max_entry_drift_bps
            ));
        }
    }
    if !plan.stop_price.is_finite() || plan.stop_price <= 0.0 {
        return Err("stop_price must be finite and positive".to_string());
    }
    if plan.target_prices.is_empty() || plan.target_prices.iter().any(|t| !t.is_finite() || *t <= 0.0) {
        return Err("target_prices must be non-empty and all finite and positive".to_string());
    }
    let side = plan.side();
    let first_target = plan.target_prices[0];
    match side {
        Side::Long => {
            if plan.entry_price <= plan.stop_price {
                return Err("long plan requires entry_price > stop_price".to_string());
            }
            if first_target <= plan.entry_price {
                return Err("long plan requires target above entry".to_string());
            }
        }
        Side::Short => {
            if plan.entry_price >= plan.stop_price {
                return Err("short plan requires entry_price < stop_price".to_string());
            }
            if first_target >= plan.entry_price {
                return Err("short plan requires target below entry".to_string());
            }
        }
    }
    let risk = (plan.entry_price - plan.stop_price).abs();
    let reward = (first_target - plan.entry_price).abs();
    if risk > 0.0 && reward / risk < 0.1 {
        return Err("reward:risk implausibly small".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EntryType;

    fn long_plan() -> TradePlan {
        TradePlan {
            ticker: "AAPL".to_string(),
            entry_type: EntryType::Limit,
            entry_price: 100.0,
            stop_price: 98.0,
            target_prices: vec![106.0],
            timeout_days: 5,
            confidence: 0.6,
            reason: "x".to_string(),
            schema_version: "ProposeResponseV1".to_string(),
        }
    }

    fn healthy_market() -> ValidateMarket {
        ValidateMarket { price: 100.0, spread: 0.02, avg_dollar_vol: 50_000_000.0 }
    }

    fn healthy_portfolio() -> PortfolioContext {
        PortfolioContext { open_positions: 1, realized_pnl_today: 0.0 }
    }

    #[test]
    fn approves_and_sizes_a_healthy_plan() {
        let params = PolicyParams::from_env();
        let verdict = validate(&long_plan(), &healthy_market(), &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Approved);
        assert!(verdict.adjusted_size > 0);
    }

    #[test]
    fn kill_switch_rejects_before_anything_else() {
        let params = PolicyParams::from_env();
        let portfolio = PortfolioContext { open_positions: 0, realized_pnl_today: -5000.0 };
        let verdict = validate(&long_plan(), &healthy_market(), &portfolio, &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
        assert_eq!(verdict.adjusted_size, 0);
        assert!(verdict.reason.contains("kill-switch"));
    }

    #[test]
    fn wide_spread_rejects() {
        let params = PolicyParams::from_env();
        let market = ValidateMarket { price: 100.0, spread: 5.0, avg_dollar_vol: 50_000_000.0 };
        let verdict = validate(&long_plan(), &market, &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
        assert!(verdict.reason.contains("spread"));
    }

    #[test]
    fn position_cap_rejects() {
        let params = PolicyParams::from_env();
        let portfolio = PortfolioContext { open_positions: params.max_positions, realized_pnl_today: 0.0 };
        let verdict = validate(&long_plan(), &healthy_market(), &portfolio, &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
        assert!(verdict.reason.contains("position cap"));
    }

    #[test]
    fn thin_liquidity_rejects() {
        let params = PolicyParams::from_env();
        let market = ValidateMarket { price: 100.0, spread: 0.02, avg_dollar_vol: 1000.0 };
        let verdict = validate(&long_plan(), &market, &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
        assert!(verdict.reason.contains("liquidity"));
    }

    #[test]
    fn zero_sizing_becomes_review() {
        let mut params = PolicyParams::from_env();
        params.max_ticket = 1.0;
        let verdict = validate(&long_plan(), &healthy_market(), &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Review);
        assert_eq!(verdict.adjusted_size, 0);
    }

    #[test]
    fn plan_with_inverted_target_fails_sanity() {
        let mut plan = long_plan();
        plan.target_prices = vec![90.0];
        let params = PolicyParams::from_env();
        let verdict = validate(&plan, &healthy_market(), &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
    }

    #[test]
    fn entry_far_from_market_price_rejects() {
        let mut plan = long_plan();
        plan.entry_price = 140.0; // market is 100.0, 40% away
        plan.stop_price = 138.0;
        plan.target_prices = vec![146.0];
        let params = PolicyParams::from_env();
        let verdict = validate(&plan, &healthy_market(), &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Rejected);
        assert!(verdict.reason.contains("entry"), "unexpected reason: {}", verdict.reason);
        assert!(verdict.reason.contains("market"), "unexpected reason: {}", verdict.reason);
    }

    #[test]
    fn entry_within_bound_of_market_price_passes_sanity() {
        let params = PolicyParams::from_env();
        let verdict = validate(&long_plan(), &healthy_market(), &healthy_portfolio(), &params, "d1");
        assert_eq!(verdict.verdict, Verdict::Approved);
    }
}
