//! Single-currency ledger with the `free + reserved = total` invariant and a
//! per-order reservation map.
//!
//! Recoverable failures (a reservation that cannot be made or freed) come
//! back as typed errors. Arithmetic-contract breaches are bugs in the caller
//! and panic with a diagnostic; the simulation must halt on them.

use crate::decimal::{round, round_opt};
use crate::types::OrderId;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Classification of an attempted reservation release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreeStatus {
    Freeable,
    NegativeAmount,
    AmountExceedsReservation,
    NonexistentReservation,
    NonexistentReservationAndAmount,
    NonexistentReservationAndNegativeAmount,
}

/// Details of a non-freeable release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("cannot free reservation for order #{order_id}: {status:?} (amount {amount:?}, reservation {reservation:?})")]
pub struct FreeError {
    pub order_id: OrderId,
    pub amount: Option<Decimal>,
    pub reservation: Option<Decimal>,
    pub status: FreeStatus,
}

/// Why a reservation could not be made.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ReserveError {
    #[error("reservation amount cannot be negative: {0}")]
    NegativeAmount(Decimal),
    #[error("cannot reserve {amount} with free balance {free}")]
    Unreservable { amount: Decimal, free: Decimal },
}

/// A single-currency balance: free and reserved funds plus the map of open
/// reservations keyed by order id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Balance {
    free: Decimal,
    reserved: Decimal,
    total: Decimal,
    reservations: BTreeMap<OrderId, Decimal>,
    symbol: String,
    rounding_decimals: u32,
}

impl Balance {
    /// Create a balance holding `total`, all free.
    ///
    /// # Panics
    /// On a negative initial total; configuration must not produce one.
    #[must_use]
    pub fn new(total: Decimal, symbol: &str, rounding_decimals: u32) -> Self {
        let total = round(total, rounding_decimals);
        assert!(
            total >= Decimal::ZERO,
            "initial balance must be non-negative, was {total}"
        );
        Self {
            free: total,
            reserved: Decimal::ZERO,
            total,
            reservations: BTreeMap::new(),
            symbol: symbol.to_string(),
            rounding_decimals,
        }
    }

    #[must_use]
    #[inline]
    pub fn free(&self) -> Decimal {
        self.free
    }

    #[must_use]
    #[inline]
    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    #[must_use]
    #[inline]
    pub fn total(&self) -> Decimal {
        self.total
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn rounding_decimals(&self) -> u32 {
        self.rounding_decimals
    }

    /// The open reservation for an order, if any.
    #[must_use]
    pub fn reservation(&self, id: OrderId) -> Option<Decimal> {
        self.reservations.get(&id).copied()
    }

    #[must_use]
    pub fn reservations(&self) -> &BTreeMap<OrderId, Decimal> {
        &self.reservations
    }

    /// Whether `amount` can be earmarked out of the free funds.
    #[must_use]
    pub fn can_reserve(&self, amount: Decimal) -> bool {
        let amount = self.round_amount(amount);
        amount > Decimal::ZERO && amount <= self.free
    }

    /// Classify a release attempt without mutating anything.
    #[must_use]
    pub fn can_free(&self, id: OrderId, amount: Option<Decimal>) -> FreeStatus {
        let amount = round_opt(amount, self.rounding_decimals);
        let Some(reservation) = self.reservation(id) else {
            return match amount {
                Some(a) if a > Decimal::ZERO => FreeStatus::NonexistentReservation,
                Some(_) => FreeStatus::NonexistentReservationAndNegativeAmount,
                None => FreeStatus::NonexistentReservationAndAmount,
            };
        };
        match amount {
            Some(a) if a > reservation => FreeStatus::AmountExceedsReservation,
            Some(a) if a < Decimal::ZERO => FreeStatus::NegativeAmount,
            _ => FreeStatus::Freeable,
        }
    }

    /// Add funds to the free side.
    pub fn deposit(&mut self, amount: Decimal) {
        let amount = self.round_amount(amount);
        self.free += amount;
        self.total += amount;
        self.check_consistency("deposit");
    }

    /// Remove funds from the free side. The complement of [`Self::deposit`],
    /// used when a commit consumes cash beyond the order's reservation.
    ///
    /// # Panics
    /// When `amount` exceeds the free funds; callers check first.
    pub fn withdraw(&mut self, amount: Decimal) {
        let amount = self.round_amount(amount);
        assert!(
            amount <= self.free,
            "withdrawal of {amount} exceeds free balance {self}",
        );
        self.free -= amount;
        self.total -= amount;
        self.check_consistency("withdraw");
    }

    /// Earmark `amount` of the free funds for an order. Rounds to the
    /// configured decimals; a zero rounded amount is a no-op.
    ///
    /// Returns the amount actually reserved.
    pub fn make_reservation(&mut self, id: OrderId, amount: Decimal) -> Result<Decimal, ReserveError> {
        if amount < Decimal::ZERO {
            return Err(ReserveError::NegativeAmount(amount));
        }
        let amount = self.round_amount(amount);
        if amount == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        if !self.can_reserve(amount) {
            return Err(ReserveError::Unreservable {
                amount,
                free: self.free,
            });
        }

        self.free -= amount;
        self.reserved += amount;
        *self.reservations.entry(id).or_default() += amount;

        self.check_consistency("make_reservation");
        let reservation_sum: Decimal = self.reservations.values().copied().sum();
        assert!(
            reservation_sum == self.reserved,
            "total reservation {} does not match the sum of reservations {} after reserving {} for order #{} | {}",
            self.reserved,
            reservation_sum,
            amount,
            id,
            self,
        );
        Ok(amount)
    }

    /// Release a reservation back to the free funds. An omitted `amount`
    /// releases the whole reservation; a zeroed entry is removed from the map.
    ///
    /// Returns the amount actually freed.
    pub fn free_reservation(
        &mut self,
        id: OrderId,
        amount: Option<Decimal>,
    ) -> Result<Decimal, FreeError> {
        let amount = round_opt(amount, self.rounding_decimals);

        let status = self.can_free(id, amount);
        if status != FreeStatus::Freeable {
            return Err(FreeError {
                order_id: id,
                amount,
                reservation: self.reservation(id),
                status,
            });
        }

        let freed = match amount {
            None => self.reservations.remove(&id).expect("checked by can_free"),
            Some(a) => {
                let reservation = self.reservations.get_mut(&id).expect("checked by can_free");
                *reservation -= a;
                assert!(
                    *reservation >= Decimal::ZERO,
                    "negative reservation {reservation} for order #{id} after freeing {a}",
                );
                if *reservation == Decimal::ZERO {
                    self.reservations.remove(&id);
                }
                a
            }
        };

        self.free += freed;
        self.reserved -= freed;

        assert!(
            !(self.reserved > Decimal::ZERO && self.reservations.is_empty()),
            "no reservations left but {} still reserved after freeing order #{id}",
            self.reserved,
        );
        self.check_consistency("free_reservation");
        Ok(freed)
    }

    /// [`Self::free_reservation`] with the failure absorbed to zero.
    pub fn try_free_reservation(&mut self, id: OrderId, amount: Option<Decimal>) -> Decimal {
        self.free_reservation(id, amount).unwrap_or(Decimal::ZERO)
    }

    /// Free up to `cap` of the reservation, clamped to what is actually
    /// reserved. Returns the amount freed.
    pub fn free_reservation_up_to(&mut self, id: OrderId, cap: Decimal) -> Decimal {
        let Some(reservation) = self.reservation(id) else {
            return Decimal::ZERO;
        };
        let amount = cap.min(reservation);
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.try_free_reservation(id, Some(amount))
    }

    /// Free a reservation and consume the same amount outright: the funds
    /// leave the balance without a cash receipt (collateral consumption).
    pub fn void_reservation(&mut self, id: OrderId, amount: Option<Decimal>) {
        if self.reservation(id).is_none() {
            return;
        }
        let freed = self.try_free_reservation(id, amount);
        self.free -= freed;
        self.total -= freed;
        self.check_consistency("void_reservation");
    }

    fn round_amount(&self, amount: Decimal) -> Decimal {
        round(amount, self.rounding_decimals)
    }

    fn check_consistency(&self, ctx: &str) {
        assert!(
            self.total == self.free + self.reserved,
            "{ctx}: inconsistent accounting, total {} != free {} + reserved {}",
            self.total,
            self.free,
            self.reserved,
        );
        assert!(
            self.total >= Decimal::ZERO && self.free >= Decimal::ZERO && self.reserved >= Decimal::ZERO,
            "{ctx}: negative values in accounting {self}",
        );
    }
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} | {})", self.total, self.free, self.reserved)
    }
}
