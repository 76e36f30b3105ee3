//! Per-(agent, book) margin ledger: a base and a quote [`Balance`] plus the
//! loan and collateral state of leveraged positions.
//!
//! All mutation funnels through [`make_reservation`](Balances::make_reservation),
//! [`free_reservation`](Balances::free_reservation) and
//! [`commit`](Balances::commit); each re-checks the aggregate loan and
//! collateral invariants on exit and panics on a breach.

use crate::accounting::balance::{Balance, FreeError, ReserveError};
use crate::accounting::collateral::Collateral;
use crate::accounting::loan::{Loan, RoundParams};
use crate::accounting::margin::margin_call_price;
use crate::book::{OrderDirection, SettleFlag};
use crate::decimal::{fma, round, round_up};
use crate::types::OrderId;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Amounts actually reserved or released, per currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReservationAmounts {
    pub base: Decimal,
    pub quote: Decimal,
}

/// Construction parameters for a [`Balances`].
#[derive(Debug, Clone)]
pub struct BalancesDesc {
    pub base: Balance,
    pub quote: Balance,
    pub round_params: RoundParams,
    pub maintenance_margin: Decimal,
}

/// The margin account of one agent on one book.
#[derive(Debug, Clone, Serialize)]
pub struct Balances {
    pub base: Balance,
    pub quote: Balance,
    buy_leverages: HashMap<OrderId, Decimal>,
    sell_leverages: HashMap<OrderId, Decimal>,
    loans: BTreeMap<OrderId, Loan>,
    base_loan: Decimal,
    quote_loan: Decimal,
    base_collateral: Decimal,
    quote_collateral: Decimal,
    #[serde(skip)]
    round_params: RoundParams,
    #[serde(skip)]
    maintenance_margin: Decimal,
}

impl Balances {
    #[must_use]
    pub fn new(desc: BalancesDesc) -> Self {
        Self {
            base: desc.base,
            quote: desc.quote,
            buy_leverages: HashMap::new(),
            sell_leverages: HashMap::new(),
            loans: BTreeMap::new(),
            base_loan: Decimal::ZERO,
            quote_loan: Decimal::ZERO,
            base_collateral: Decimal::ZERO,
            quote_collateral: Decimal::ZERO,
            round_params: desc.round_params,
            maintenance_margin: desc.maintenance_margin,
        }
    }

    #[must_use]
    pub fn round_params(&self) -> RoundParams {
        self.round_params
    }

    /// Leverage recorded for an order on the given side; zero when none.
    #[must_use]
    pub fn get_leverage(&self, id: OrderId, direction: OrderDirection) -> Decimal {
        let map = match direction {
            OrderDirection::Buy => &self.buy_leverages,
            OrderDirection::Sell => &self.sell_leverages,
        };
        map.get(&id).copied().unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn loan(&self, id: OrderId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    #[must_use]
    pub fn loans(&self) -> &BTreeMap<OrderId, Loan> {
        &self.loans
    }

    #[must_use]
    pub fn base_loan(&self) -> Decimal {
        self.base_loan
    }

    #[must_use]
    pub fn quote_loan(&self) -> Decimal {
        self.quote_loan
    }

    #[must_use]
    pub fn base_collateral(&self) -> Decimal {
        self.base_collateral
    }

    #[must_use]
    pub fn quote_collateral(&self) -> Decimal {
        self.quote_collateral
    }

    /// Outstanding loans valued in quote at `price`.
    #[must_use]
    pub fn total_loan_in_quote(&self, price: Decimal) -> Decimal {
        fma(self.base_loan, price, self.quote_loan)
    }

    /// Total cash value of the account in quote at `price`.
    #[must_use]
    pub fn wealth(&self, price: Decimal) -> Decimal {
        fma(self.base.total(), price, self.quote.total())
    }

    /// The order's reservation valued in quote at `price`.
    #[must_use]
    pub fn reservation_in_quote(&self, id: OrderId, price: Decimal) -> Decimal {
        fma(
            self.base.reservation(id).unwrap_or(Decimal::ZERO),
            price,
            self.quote.reservation(id).unwrap_or(Decimal::ZERO),
        )
    }

    /// Whether the free funds across both currencies cover `collateral_amount`
    /// of the natural spend currency at `price`.
    #[must_use]
    pub fn can_borrow(
        &self,
        collateral_amount: Decimal,
        price: Decimal,
        direction: OrderDirection,
    ) -> bool {
        match direction {
            // collateral measured in quote
            OrderDirection::Buy => {
                fma(self.base.free(), price, self.quote.free()) >= collateral_amount
            }
            // collateral measured in base; compare values in quote to avoid
            // a division
            OrderDirection::Sell => {
                fma(self.base.free(), price, self.quote.free()) >= collateral_amount * price
            }
        }
    }

    /// Earmark `amount` of the natural spend currency for an order. For a
    /// leveraged order the collateral is split natural-side-first across the
    /// two currencies at `price`, and a [`Loan`] of `amount * leverage` is
    /// opened with its margin-call price.
    pub fn make_reservation(
        &mut self,
        id: OrderId,
        price: Decimal,
        _best_bid: Decimal,
        _best_ask: Decimal,
        amount: Decimal,
        leverage: Decimal,
        direction: OrderDirection,
    ) -> Result<ReservationAmounts, ReserveError> {
        let amount = self.round_natural(amount, direction);

        if leverage == Decimal::ZERO {
            let reserved = match direction {
                OrderDirection::Buy => ReservationAmounts {
                    base: Decimal::ZERO,
                    quote: self.quote.make_reservation(id, amount)?,
                },
                OrderDirection::Sell => ReservationAmounts {
                    base: self.base.make_reservation(id, amount)?,
                    quote: Decimal::ZERO,
                },
            };
            return Ok(reserved);
        }

        let reserved = match direction {
            OrderDirection::Buy => {
                let natural = amount.min(self.quote.free());
                let quote = self.quote.make_reservation(id, natural)?;
                let remainder = amount - quote;
                let base = if remainder > Decimal::ZERO {
                    let base_leg = crate::decimal::round_down(
                        remainder / price,
                        self.round_params.base_decimals,
                    );
                    match self.base.make_reservation(id, base_leg) {
                        Ok(reserved) => reserved,
                        Err(e) => {
                            self.quote.try_free_reservation(id, None);
                            return Err(e);
                        }
                    }
                } else {
                    Decimal::ZERO
                };
                ReservationAmounts { base, quote }
            }
            OrderDirection::Sell => {
                let natural = amount.min(self.base.free());
                let base = self.base.make_reservation(id, natural)?;
                let remainder = amount - base;
                let quote = if remainder > Decimal::ZERO {
                    let quote_leg =
                        round(remainder * price, self.round_params.quote_decimals);
                    match self.quote.make_reservation(id, quote_leg) {
                        Ok(reserved) => reserved,
                        Err(e) => {
                            self.base.try_free_reservation(id, None);
                            return Err(e);
                        }
                    }
                } else {
                    Decimal::ZERO
                };
                ReservationAmounts { base, quote }
            }
        };

        let loan_amount = self.round_natural(amount * leverage, direction);
        let call_price = margin_call_price(price, leverage, direction, self.maintenance_margin);
        self.loans.insert(
            id,
            Loan::new(
                loan_amount,
                direction,
                leverage,
                Collateral::new(reserved.base, reserved.quote),
                call_price,
            ),
        );
        match direction {
            OrderDirection::Buy => {
                self.buy_leverages.insert(id, leverage);
                self.quote_loan += loan_amount;
            }
            OrderDirection::Sell => {
                self.sell_leverages.insert(id, leverage);
                self.base_loan += loan_amount;
            }
        }
        self.base_collateral += reserved.base;
        self.quote_collateral += reserved.quote;
        trace!(
            order = id,
            %loan_amount,
            %call_price,
            "margin reservation with loan"
        );

        self.check_loan_consistency("make_reservation");
        Ok(reserved)
    }

    /// Release part or all of an order's reservation. For leveraged orders a
    /// full release dissolves the loan; a partial release of `amount`
    /// (natural units) frees the cross-currency leg first at `price` and
    /// scales the loan down proportionally.
    pub fn free_reservation(
        &mut self,
        id: OrderId,
        price: Decimal,
        _best_bid: Decimal,
        _best_ask: Decimal,
        direction: OrderDirection,
        amount: Option<Decimal>,
    ) -> Result<ReservationAmounts, FreeError> {
        let leverage = self.get_leverage(id, direction);

        if leverage == Decimal::ZERO {
            let freed = match direction {
                OrderDirection::Buy => ReservationAmounts {
                    base: Decimal::ZERO,
                    quote: self.quote.free_reservation(id, amount)?,
                },
                OrderDirection::Sell => ReservationAmounts {
                    base: self.base.free_reservation(id, amount)?,
                    quote: Decimal::ZERO,
                },
            };
            return Ok(freed);
        }

        let freed = match amount {
            None => {
                let freed = ReservationAmounts {
                    base: self.base.try_free_reservation(id, None),
                    quote: self.quote.try_free_reservation(id, None),
                };
                self.dissolve_loan(id, direction);
                freed
            }
            Some(amount) => {
                let freed = match direction {
                    OrderDirection::Sell => {
                        // free the quote leg first, valued at `price`
                        let quote_leg = self.quote.reservation(id).unwrap_or(Decimal::ZERO);
                        let quote_in_base = if price > Decimal::ZERO {
                            quote_leg / price
                        } else {
                            Decimal::ZERO
                        };
                        if amount <= quote_in_base {
                            let quote = self.quote.free_reservation_up_to(
                                id,
                                round(amount * price, self.round_params.quote_decimals),
                            );
                            ReservationAmounts {
                                base: Decimal::ZERO,
                                quote,
                            }
                        } else {
                            let quote = self.quote.try_free_reservation(id, None);
                            let base_leg = round_up(
                                amount - quote_in_base,
                                self.round_params.base_decimals,
                            );
                            let base = self.base.free_reservation_up_to(id, base_leg);
                            ReservationAmounts { base, quote }
                        }
                    }
                    OrderDirection::Buy => {
                        // free the base leg first, valued at `price`
                        let base_leg = self.base.reservation(id).unwrap_or(Decimal::ZERO);
                        let base_in_quote = base_leg * price;
                        if amount <= base_in_quote && price > Decimal::ZERO {
                            let base = self.base.free_reservation_up_to(
                                id,
                                round(amount / price, self.round_params.base_decimals),
                            );
                            ReservationAmounts {
                                base,
                                quote: Decimal::ZERO,
                            }
                        } else {
                            let base = self.base.try_free_reservation(id, None);
                            let quote_leg = round_up(
                                amount - base_in_quote,
                                self.round_params.quote_decimals,
                            );
                            let quote = self.quote.free_reservation_up_to(id, quote_leg);
                            ReservationAmounts { base, quote }
                        }
                    }
                };

                // scale the loan down by the freed share of the position
                let reduction = self.round_natural(amount * leverage, direction);
                if let Some(loan) = self.loans.get_mut(&id) {
                    let applied = loan.reduce_principal(reduction);
                    let released = loan.consume_collateral(freed.base, freed.quote);
                    self.base_collateral -= released.base;
                    self.quote_collateral -= released.quote;
                    match direction {
                        OrderDirection::Buy => self.quote_loan -= applied,
                        OrderDirection::Sell => self.base_loan -= applied,
                    }
                    if loan.amount() == Decimal::ZERO {
                        self.dissolve_loan(id, direction);
                    }
                }
                freed
            }
        };

        self.check_loan_consistency("free_reservation");
        Ok(freed)
    }

    /// Apply one fill to this side of a trade.
    ///
    /// For a BUY fill, `amount + fee` quote is consumed — drawing the
    /// order's loan first, then the quote reservation, then free quote, then
    /// base converted at the touch — and `counter_amount` base is credited.
    /// SELL mirrors the two currencies, with the fee taken out of the quote
    /// proceeds. Opposite-direction loans are settled with the acquired
    /// currency per `settle_flag`.
    ///
    /// Returns `(order_id, margin_call_price)` for every loan fully settled,
    /// so the caller can purge its margin-call tracking.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        order_id: OrderId,
        direction: OrderDirection,
        amount: Decimal,
        counter_amount: Decimal,
        fee: Decimal,
        best_bid: Decimal,
        best_ask: Decimal,
        margin_call: Decimal,
        settle_flag: SettleFlag,
    ) -> Vec<(OrderId, Decimal)> {
        let settled = match direction {
            OrderDirection::Buy => {
                let spend = round(amount + fee, self.round_params.quote_decimals);
                let leverage = self.get_leverage(order_id, OrderDirection::Buy);
                let mut remaining = spend;

                if leverage > Decimal::ZERO {
                    if let Some(loan) = self.loans.get_mut(&order_id) {
                        remaining -= loan.draw(remaining);
                        loan.set_margin_call_price(margin_call);
                    }
                }
                remaining = self.consume_quote(order_id, remaining, leverage);
                if remaining > Decimal::ZERO {
                    let px = conversion_price(best_ask, best_bid);
                    let base_needed = round(remaining / px, self.round_params.base_decimals);
                    self.consume_base_exact(order_id, base_needed, leverage);
                }
                self.base.deposit(counter_amount);

                let px = conversion_price(best_bid, best_ask);
                self.settle_loans(OrderDirection::Sell, counter_amount, px, settle_flag)
            }
            OrderDirection::Sell => {
                let spend = round(amount, self.round_params.base_decimals);
                let leverage = self.get_leverage(order_id, OrderDirection::Sell);
                let mut remaining = spend;

                if leverage > Decimal::ZERO {
                    if let Some(loan) = self.loans.get_mut(&order_id) {
                        remaining -= loan.draw(remaining);
                        loan.set_margin_call_price(margin_call);
                    }
                }
                remaining = self.consume_base(order_id, remaining, leverage);
                if remaining > Decimal::ZERO {
                    let px = conversion_price(best_bid, best_ask);
                    let quote_needed = round(remaining * px, self.round_params.quote_decimals);
                    self.consume_quote_exact(order_id, quote_needed, leverage);
                }
                let proceeds = round(counter_amount - fee, self.round_params.quote_decimals);
                self.quote.deposit(proceeds);

                let px = conversion_price(best_bid, best_ask);
                self.settle_loans(OrderDirection::Buy, proceeds, px, settle_flag)
            }
        };

        self.check_loan_consistency("commit");
        settled
    }

    /// Consume up to `remaining` quote: the order's reservation first, then
    /// free funds. Returns what is still owed.
    fn consume_quote(&mut self, order_id: OrderId, remaining: Decimal, leverage: Decimal) -> Decimal {
        let mut remaining = remaining;
        if remaining <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let from_reservation = remaining.min(self.quote.reservation(order_id).unwrap_or(Decimal::ZERO));
        if from_reservation > Decimal::ZERO {
            self.quote.void_reservation(order_id, Some(from_reservation));
            if leverage > Decimal::ZERO {
                if let Some(loan) = self.loans.get_mut(&order_id) {
                    let consumed = loan.consume_collateral(Decimal::ZERO, from_reservation);
                    self.quote_collateral -= consumed.quote;
                }
            }
            remaining -= from_reservation;
        }
        if remaining > Decimal::ZERO {
            let from_free = remaining.min(self.quote.free());
            if from_free > Decimal::ZERO {
                self.quote.withdraw(from_free);
                remaining -= from_free;
            }
        }
        remaining
    }

    fn consume_base(&mut self, order_id: OrderId, remaining: Decimal, leverage: Decimal) -> Decimal {
        let mut remaining = remaining;
        if remaining <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let from_reservation = remaining.min(self.base.reservation(order_id).unwrap_or(Decimal::ZERO));
        if from_reservation > Decimal::ZERO {
            self.base.void_reservation(order_id, Some(from_reservation));
            if leverage > Decimal::ZERO {
                if let Some(loan) = self.loans.get_mut(&order_id) {
                    let consumed = loan.consume_collateral(from_reservation, Decimal::ZERO);
                    self.base_collateral -= consumed.base;
                }
            }
            remaining -= from_reservation;
        }
        if remaining > Decimal::ZERO {
            let from_free = remaining.min(self.base.free());
            if from_free > Decimal::ZERO {
                self.base.withdraw(from_free);
                remaining -= from_free;
            }
        }
        remaining
    }

    /// Consume exactly `needed` base for the cross-currency leg of a commit.
    ///
    /// # Panics
    /// When the reservation and free funds together cannot cover it; the
    /// validator's funds check makes that a caller bug.
    fn consume_base_exact(&mut self, order_id: OrderId, needed: Decimal, leverage: Decimal) {
        let left = self.consume_base(order_id, needed, leverage);
        assert!(
            left == Decimal::ZERO,
            "commit under-funded by {left} base for order #{order_id}",
        );
    }

    fn consume_quote_exact(&mut self, order_id: OrderId, needed: Decimal, leverage: Decimal) {
        let left = self.consume_quote(order_id, needed, leverage);
        assert!(
            left == Decimal::ZERO,
            "commit under-funded by {left} quote for order #{order_id}",
        );
    }

    /// Repay loans of `direction` with up to `available` units of their
    /// currency, FIFO by order id or targeted by the settle flag. Released
    /// collateral returns to the free funds to the extent it is still
    /// reserved.
    fn settle_loans(
        &mut self,
        direction: OrderDirection,
        available: Decimal,
        price: Decimal,
        settle_flag: SettleFlag,
    ) -> Vec<(OrderId, Decimal)> {
        let mut fully_settled = Vec::new();
        if available <= Decimal::ZERO {
            return fully_settled;
        }

        let candidates: Vec<OrderId> = match settle_flag {
            SettleFlag::Order(target)
                if self.loans.get(&target).map(Loan::direction) == Some(direction) =>
            {
                vec![target]
            }
            _ => self
                .loans
                .iter()
                .filter(|(_, loan)| loan.direction() == direction)
                .map(|(id, _)| *id)
                .collect(),
        };

        let mut available = available;
        for loan_id in candidates {
            if available <= Decimal::ZERO {
                break;
            }
            let outstanding = self.loans.get(&loan_id).map_or(Decimal::ZERO, Loan::amount);
            if outstanding <= Decimal::ZERO {
                continue;
            }
            let repayable = match direction {
                OrderDirection::Sell => available.min(outstanding).min(self.base.free()),
                OrderDirection::Buy => available.min(outstanding).min(self.quote.free()),
            };
            if repayable <= Decimal::ZERO {
                continue;
            }

            let loan = self.loans.get_mut(&loan_id).expect("candidate exists");
            let released = loan.settle(repayable, price, &self.round_params);
            let fully = loan.amount() == Decimal::ZERO;

            // released collateral becomes free again where still reserved
            self.base.free_reservation_up_to(loan_id, released.base);
            self.quote.free_reservation_up_to(loan_id, released.quote);
            self.base_collateral -= released.base;
            self.quote_collateral -= released.quote;

            // surrender the repayment currency
            match direction {
                OrderDirection::Sell => {
                    self.base.withdraw(repayable);
                    self.base_loan -= repayable;
                }
                OrderDirection::Buy => {
                    self.quote.withdraw(repayable);
                    self.quote_loan -= repayable;
                }
            }
            available -= repayable;
            trace!(loan = loan_id, repaid = %repayable, fully, "loan settlement");

            if fully {
                let loan = self.loans.remove(&loan_id).expect("still present");
                match direction {
                    OrderDirection::Buy => self.buy_leverages.remove(&loan_id),
                    OrderDirection::Sell => self.sell_leverages.remove(&loan_id),
                };
                fully_settled.push((loan_id, loan.margin_call_price()));
            }
        }
        fully_settled
    }

    fn dissolve_loan(&mut self, id: OrderId, direction: OrderDirection) {
        match direction {
            OrderDirection::Buy => self.buy_leverages.remove(&id),
            OrderDirection::Sell => self.sell_leverages.remove(&id),
        };
        if let Some(loan) = self.loans.remove(&id) {
            match loan.direction() {
                OrderDirection::Buy => self.quote_loan -= loan.amount(),
                OrderDirection::Sell => self.base_loan -= loan.amount(),
            }
            self.base_collateral -= loan.collateral().base;
            self.quote_collateral -= loan.collateral().quote;
        }
    }

    fn round_natural(&self, amount: Decimal, direction: OrderDirection) -> Decimal {
        match direction {
            OrderDirection::Buy => round(amount, self.round_params.quote_decimals),
            OrderDirection::Sell => round(amount, self.round_params.base_decimals),
        }
    }

    fn check_loan_consistency(&self, ctx: &str) {
        let mut base_loan = Decimal::ZERO;
        let mut quote_loan = Decimal::ZERO;
        let mut collateral = Collateral::default();
        for loan in self.loans.values() {
            match loan.direction() {
                OrderDirection::Buy => quote_loan += loan.amount(),
                OrderDirection::Sell => base_loan += loan.amount(),
            }
            collateral += *loan.collateral();
        }
        assert!(
            base_loan == self.base_loan && quote_loan == self.quote_loan,
            "{ctx}: loan aggregates ({}, {}) diverge from per-loan sums ({base_loan}, {quote_loan})",
            self.base_loan,
            self.quote_loan,
        );
        assert!(
            collateral.base == self.base_collateral && collateral.quote == self.quote_collateral,
            "{ctx}: collateral aggregates ({}, {}) diverge from per-loan sums ({}, {})",
            self.base_collateral,
            self.quote_collateral,
            collateral.base,
            collateral.quote,
        );
        for (id, loan) in &self.loans {
            let leverage = self.get_leverage(*id, loan.direction());
            assert!(
                leverage > Decimal::ZERO,
                "{ctx}: loan for order #{id} exists without recorded leverage",
            );
        }
    }
}

/// First non-zero of the two touch prices.
fn conversion_price(preferred: Decimal, fallback: Decimal) -> Decimal {
    if preferred > Decimal::ZERO {
        preferred
    } else {
        fallback
    }
}
