//! Pure validation of order placements.
//!
//! The validator maps `(account, book, request, fee rates, limits)` to either
//! an accepted `(direction, amount, leverage)` triple — `amount` being the
//! fee-aware reservation in the natural spend currency — or a typed
//! [`OrderErrorCode`]. It mutates the payload only to round values to the
//! configured increments and to tighten IOC volumes to the matchable amount.

use crate::accounting::Account;
use crate::book::{OrderBook, OrderDirection, StpFlag, TimeInForce};
use crate::decimal::{dec1p, round};
use crate::exchange::fees::Fees;
use crate::exchange::messages::{PlaceOrderLimitPayload, PlaceOrderMarketPayload};
use crate::types::AgentId;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Typed order-placement failure, surfaced verbatim in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderErrorCode {
    #[error("VALID")]
    Valid,
    #[error("NONEXISTENT_ACCOUNT")]
    NonexistentAccount,
    #[error("INSUFFICIENT_BASE")]
    InsufficientBase,
    #[error("INSUFFICIENT_QUOTE")]
    InsufficientQuote,
    #[error("EMPTY_BOOK")]
    EmptyBook,
    #[error("PRICE_INCREMENT_VIOLATED")]
    PriceIncrementViolated,
    #[error("VOLUME_INCREMENT_VIOLATED")]
    VolumeIncrementViolated,
    #[error("EXCEEDING_LOAN")]
    ExceedingLoan,
    #[error("CONTRACT_VIOLATION")]
    ContractViolation,
    #[error("INVALID_LEVERAGE")]
    InvalidLeverage,
    #[error("INVALID_VOLUME")]
    InvalidVolume,
    #[error("INVALID_PRICE")]
    InvalidPrice,
    #[error("EXCEEDING_MAX_ORDERS")]
    ExceedingMaxOrders,
    #[error("DUAL_POSITION")]
    DualPosition,
    #[error("MINIMUM_ORDER_SIZE_VIOLATION")]
    MinimumOrderSizeViolation,
}

/// Rounding increments and optional per-account limits.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorParams {
    pub price_increment_decimals: u32,
    pub volume_increment_decimals: u32,
    pub base_increment_decimals: u32,
    pub quote_increment_decimals: u32,
    pub min_order_size: Option<Decimal>,
    pub max_open_orders: Option<usize>,
}

/// An accepted placement: the reservation to make.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Validation {
    pub direction: OrderDirection,
    /// Amount of the natural spend currency to reserve: fee-aware quote
    /// cost for BUY, base volume for SELL; for leveraged orders the
    /// collateral share.
    pub amount: Decimal,
    pub leverage: Decimal,
}

/// Stateless placement validator bound to its rounding parameters.
#[derive(Debug, Clone, Copy)]
pub struct OrderPlacementValidator {
    params: ValidatorParams,
}

impl OrderPlacementValidator {
    #[must_use]
    pub fn new(params: ValidatorParams) -> Self {
        Self { params }
    }

    #[must_use]
    pub fn params(&self) -> &ValidatorParams {
        &self.params
    }

    /// Validate a market-order placement.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_market_order_placement(
        &self,
        account: &Account,
        book: &OrderBook,
        payload: &mut PlaceOrderMarketPayload,
        fee_rates: Fees,
        max_leverage: Decimal,
        max_loan: Decimal,
        agent_id: AgentId,
    ) -> Result<Validation, OrderErrorCode> {
        payload.volume = round(payload.volume, self.params.volume_increment_decimals);
        payload.leverage = round(payload.leverage, self.params.volume_increment_decimals);

        self.check_common(
            account,
            book.id(),
            payload.volume,
            payload.leverage,
            payload.direction,
            max_leverage,
        )?;

        let total_volume = round(
            payload.volume * dec1p(payload.leverage),
            self.params.volume_increment_decimals,
        );
        let balances = account.at(book.id());

        match payload.direction {
            OrderDirection::Buy => {
                if book.sell_levels().is_empty() {
                    return Err(OrderErrorCode::EmptyBook);
                }
                let (cost, _) = self.buy_taker_cost(
                    book,
                    agent_id,
                    None,
                    total_volume,
                    fee_rates.taker,
                    payload.stp_flag,
                );
                let cost = round(cost, self.params.quote_increment_decimals);
                if payload.leverage == Decimal::ZERO {
                    if !balances.quote.can_reserve(cost) {
                        return Err(OrderErrorCode::InsufficientQuote);
                    }
                    Ok(Validation {
                        direction: payload.direction,
                        amount: cost,
                        leverage: payload.leverage,
                    })
                } else {
                    let collateral = round(
                        cost / dec1p(payload.leverage),
                        self.params.quote_increment_decimals,
                    );
                    let price = book.best_ask();
                    if !balances.can_borrow(collateral, price, payload.direction)
                        || collateral * payload.leverage + balances.total_loan_in_quote(price)
                            > max_loan
                    {
                        return Err(OrderErrorCode::ExceedingLoan);
                    }
                    Ok(Validation {
                        direction: payload.direction,
                        amount: collateral,
                        leverage: payload.leverage,
                    })
                }
            }
            OrderDirection::Sell => {
                if book.buy_levels().is_empty() {
                    return Err(OrderErrorCode::EmptyBook);
                }
                if payload.leverage == Decimal::ZERO {
                    if !balances.base.can_reserve(payload.volume) {
                        return Err(OrderErrorCode::InsufficientBase);
                    }
                } else {
                    let price = book.best_bid();
                    if !balances.can_borrow(payload.volume, price, payload.direction)
                        || payload.volume * payload.leverage + balances.total_loan_in_quote(price)
                            > max_loan
                    {
                        return Err(OrderErrorCode::ExceedingLoan);
                    }
                }
                Ok(Validation {
                    direction: payload.direction,
                    amount: payload.volume,
                    leverage: payload.leverage,
                })
            }
        }
    }

    /// Validate a limit-order placement.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_limit_order_placement(
        &self,
        account: &Account,
        book: &OrderBook,
        payload: &mut PlaceOrderLimitPayload,
        fee_rates: Fees,
        max_leverage: Decimal,
        max_loan: Decimal,
        agent_id: AgentId,
    ) -> Result<Validation, OrderErrorCode> {
        payload.price = round(payload.price, self.params.price_increment_decimals);
        payload.volume = round(payload.volume, self.params.volume_increment_decimals);
        payload.leverage = round(payload.leverage, self.params.volume_increment_decimals);

        if payload.price <= Decimal::ZERO {
            return Err(OrderErrorCode::InvalidPrice);
        }
        self.check_common(
            account,
            book.id(),
            payload.volume,
            payload.leverage,
            payload.direction,
            max_leverage,
        )?;

        if !self.check_time_in_force(book, payload, agent_id) {
            return Err(OrderErrorCode::ContractViolation);
        }
        if payload.post_only && !self.check_post_only(book, payload, agent_id) {
            return Err(OrderErrorCode::ContractViolation);
        }

        let total_volume = round(
            payload.volume * dec1p(payload.leverage),
            self.params.volume_increment_decimals,
        );
        let balances = account.at(book.id());

        match payload.direction {
            OrderDirection::Buy => {
                let (taker_cost, taker_volume) = self.buy_taker_cost(
                    book,
                    agent_id,
                    Some(payload.price),
                    total_volume,
                    fee_rates.taker,
                    payload.stp_flag,
                );
                let taker_cost = round(taker_cost, self.params.quote_increment_decimals);
                let maker_volume = total_volume - taker_volume;
                let maker_cost = round(
                    payload.price * maker_volume * dec1p(fee_rates.maker),
                    self.params.quote_increment_decimals,
                );
                let cost = round(
                    taker_cost + maker_cost,
                    self.params.quote_increment_decimals,
                );

                if payload.leverage == Decimal::ZERO {
                    if !balances.quote.can_reserve(cost) {
                        return Err(OrderErrorCode::InsufficientQuote);
                    }
                    Ok(Validation {
                        direction: payload.direction,
                        amount: cost,
                        leverage: payload.leverage,
                    })
                } else {
                    let collateral = round(
                        cost / dec1p(payload.leverage),
                        self.params.quote_increment_decimals,
                    );
                    if !balances.can_borrow(collateral, payload.price, payload.direction)
                        || collateral * payload.leverage
                            + balances.total_loan_in_quote(payload.price)
                            > max_loan
                    {
                        return Err(OrderErrorCode::ExceedingLoan);
                    }
                    Ok(Validation {
                        direction: payload.direction,
                        amount: collateral,
                        leverage: payload.leverage,
                    })
                }
            }
            OrderDirection::Sell => {
                if payload.leverage == Decimal::ZERO {
                    if !balances.base.can_reserve(payload.volume) {
                        return Err(OrderErrorCode::InsufficientBase);
                    }
                } else if !balances.can_borrow(payload.volume, payload.price, payload.direction)
                    || payload.volume * payload.leverage
                        + balances.total_loan_in_quote(payload.price)
                        > max_loan
                {
                    return Err(OrderErrorCode::ExceedingLoan);
                }
                Ok(Validation {
                    direction: payload.direction,
                    amount: payload.volume,
                    leverage: payload.leverage,
                })
            }
        }
    }

    fn check_common(
        &self,
        account: &Account,
        book_id: crate::types::BookId,
        volume: Decimal,
        leverage: Decimal,
        direction: OrderDirection,
        max_leverage: Decimal,
    ) -> Result<(), OrderErrorCode> {
        if leverage < Decimal::ZERO || leverage > max_leverage {
            return Err(OrderErrorCode::InvalidLeverage);
        }
        if volume <= Decimal::ZERO {
            return Err(OrderErrorCode::InvalidVolume);
        }
        if let Some(min) = self.params.min_order_size {
            if volume < min {
                return Err(OrderErrorCode::MinimumOrderSizeViolation);
            }
        }
        if let Some(cap) = self.params.max_open_orders {
            if account.active_orders(book_id).len() >= cap {
                return Err(OrderErrorCode::ExceedingMaxOrders);
            }
        }
        if leverage > Decimal::ZERO {
            let balances = account.at(book_id);
            let opposite = direction.opposite();
            if balances
                .loans()
                .values()
                .any(|loan| loan.direction() == opposite)
            {
                return Err(OrderErrorCode::DualPosition);
            }
        }
        Ok(())
    }

    fn check_time_in_force(
        &self,
        book: &OrderBook,
        payload: &mut PlaceOrderLimitPayload,
        agent_id: AgentId,
    ) -> bool {
        match payload.time_in_force {
            TimeInForce::Ioc => self.check_ioc(book, payload, agent_id),
            TimeInForce::Fok => self.check_fok(book, payload, agent_id),
            TimeInForce::Gtc | TimeInForce::Gtt => true,
        }
    }

    /// IOC: some volume must be matchable now; the payload volume tightens
    /// to it and the residual is dropped by design.
    fn check_ioc(
        &self,
        book: &OrderBook,
        payload: &mut PlaceOrderLimitPayload,
        agent_id: AgentId,
    ) -> bool {
        if payload.post_only {
            return false;
        }
        let total_volume = round(
            payload.volume * dec1p(payload.leverage),
            self.params.volume_increment_decimals,
        );
        let Some(matchable) = self.matchable_volume(
            book,
            agent_id,
            payload.direction,
            Some(payload.price),
            total_volume,
            payload.stp_flag,
        ) else {
            return false;
        };
        if matchable == Decimal::ZERO {
            return false;
        }
        payload.volume = round(
            matchable / dec1p(payload.leverage),
            self.params.volume_increment_decimals,
        );
        true
    }

    /// FOK: the whole leveraged volume must be matchable atomically before
    /// any reservation is made.
    fn check_fok(
        &self,
        book: &OrderBook,
        payload: &PlaceOrderLimitPayload,
        agent_id: AgentId,
    ) -> bool {
        if payload.post_only {
            return false;
        }
        let total_volume = round(
            payload.volume * dec1p(payload.leverage),
            self.params.volume_increment_decimals,
        );
        match self.matchable_volume(
            book,
            agent_id,
            payload.direction,
            Some(payload.price),
            total_volume,
            payload.stp_flag,
        ) {
            Some(matchable) => matchable == total_volume,
            None => false,
        }
    }

    /// Post-only: the order must not match at submission.
    fn check_post_only(
        &self,
        book: &OrderBook,
        payload: &PlaceOrderLimitPayload,
        agent_id: AgentId,
    ) -> bool {
        if matches!(payload.time_in_force, TimeInForce::Ioc | TimeInForce::Fok) {
            return false;
        }
        let opposite_empty = match payload.direction {
            OrderDirection::Buy => book.sell_levels().is_empty(),
            OrderDirection::Sell => book.buy_levels().is_empty(),
        };
        if opposite_empty {
            return true;
        }

        match payload.stp_flag {
            StpFlag::CancelResting => {
                // own resting orders would be cancelled, not matched; only a
                // foreign order in the crossed range violates post-only
                self.walk_crossed(book, payload, |order_id, _| {
                    let own = book
                        .client_context(order_id)
                        .is_some_and(|c| c.agent_id == agent_id);
                    if own { Walk::Continue } else { Walk::Fail }
                })
            }
            StpFlag::DecrementCancel => {
                let total_volume = round(
                    payload.volume * dec1p(payload.leverage),
                    self.params.volume_increment_decimals,
                );
                let mut to_remove = Decimal::ZERO;
                self.walk_crossed(book, payload, |order_id, tick_volume| {
                    let own = book
                        .client_context(order_id)
                        .is_some_and(|c| c.agent_id == agent_id);
                    if !own {
                        return Walk::Fail;
                    }
                    if tick_volume >= total_volume - to_remove {
                        return Walk::Fail;
                    }
                    to_remove += tick_volume;
                    Walk::Continue
                })
            }
            _ => match payload.direction {
                OrderDirection::Buy => payload.price < book.best_ask(),
                OrderDirection::Sell => payload.price > book.best_bid(),
            },
        }
    }

    /// Walk every resting order in the price range the payload would cross,
    /// best level first. Returns false as soon as the callback fails.
    fn walk_crossed(
        &self,
        book: &OrderBook,
        payload: &PlaceOrderLimitPayload,
        mut visit: impl FnMut(crate::types::OrderId, Decimal) -> Walk,
    ) -> bool {
        match payload.direction {
            OrderDirection::Buy => {
                for level in book.sell_levels() {
                    if level.price() > payload.price {
                        break;
                    }
                    for order in level.orders() {
                        let tick_volume =
                            round(order.total_volume(), self.params.volume_increment_decimals);
                        if visit(order.header.id, tick_volume) == Walk::Fail {
                            return false;
                        }
                    }
                }
            }
            OrderDirection::Sell => {
                for level in book.buy_levels().iter().rev() {
                    if level.price() < payload.price {
                        break;
                    }
                    for order in level.orders() {
                        let tick_volume =
                            round(order.total_volume(), self.params.volume_increment_decimals);
                        if visit(order.header.id, tick_volume) == Walk::Fail {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Volume matchable right now, price-bounded, honoring the STP flag:
    /// own resting orders are skipped under CO and abort the calculation
    /// (`None`) under CN/CB.
    fn matchable_volume(
        &self,
        book: &OrderBook,
        agent_id: AgentId,
        direction: OrderDirection,
        limit_price: Option<Decimal>,
        total_volume: Decimal,
        stp: StpFlag,
    ) -> Option<Decimal> {
        let mut volume = Decimal::ZERO;
        let levels: Box<dyn Iterator<Item = &crate::book::TickLevel>> = match direction {
            OrderDirection::Buy => Box::new(book.sell_levels().iter()),
            OrderDirection::Sell => Box::new(book.buy_levels().iter().rev()),
        };
        for level in levels {
            if let Some(limit) = limit_price {
                match direction {
                    OrderDirection::Buy if limit < level.price() => return Some(volume),
                    OrderDirection::Sell if limit > level.price() => return Some(volume),
                    _ => {}
                }
            }
            for order in level.orders() {
                let own = book
                    .client_context(order.header.id)
                    .is_some_and(|c| c.agent_id == agent_id);
                if own {
                    match stp {
                        StpFlag::CancelResting => continue,
                        StpFlag::CancelAggressing | StpFlag::CancelBoth => return None,
                        StpFlag::None | StpFlag::DecrementCancel => {}
                    }
                }
                let tick_volume =
                    round(order.total_volume(), self.params.volume_increment_decimals);
                if volume + tick_volume > total_volume {
                    return Some(total_volume);
                }
                volume += tick_volume;
            }
        }
        Some(volume)
    }

    /// Fee-adjusted quote cost of the volume matchable now for a BUY,
    /// walking asks best-first, skipping own resting orders under any STP
    /// mode that would not trade against them. Returns `(cost, volume)`.
    fn buy_taker_cost(
        &self,
        book: &OrderBook,
        agent_id: AgentId,
        limit_price: Option<Decimal>,
        total_volume: Decimal,
        taker_rate: Decimal,
        stp: StpFlag,
    ) -> (Decimal, Decimal) {
        let mut cost = Decimal::ZERO;
        let mut volume = Decimal::ZERO;
        for level in book.sell_levels() {
            if let Some(limit) = limit_price {
                if limit < level.price() {
                    return (cost, volume);
                }
            }
            for order in level.orders() {
                if matches!(
                    stp,
                    StpFlag::CancelResting | StpFlag::CancelAggressing | StpFlag::CancelBoth
                ) && book
                    .client_context(order.header.id)
                    .is_some_and(|c| c.agent_id == agent_id)
                {
                    continue;
                }
                let tick_volume = order.total_volume();
                let fill = if volume + tick_volume >= total_volume {
                    total_volume - volume
                } else {
                    tick_volume
                };
                cost += round(
                    level.price() * fill * dec1p(taker_rate),
                    self.params.quote_increment_decimals,
                );
                volume += fill;
                if volume == total_volume {
                    return (cost, volume);
                }
            }
        }
        (cost, volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Continue,
    Fail,
}
