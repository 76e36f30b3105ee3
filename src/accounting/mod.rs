//! Accounts, balances, loans and margin arithmetic.

mod account;
mod balance;
mod balances;
mod collateral;
mod loan;
mod margin;

pub use account::{account_from_template, Account, AccountRegistry, AccountTemplate};
pub use balance::{Balance, FreeError, FreeStatus, ReserveError};
pub use balances::{Balances, BalancesDesc, ReservationAmounts};
pub use collateral::Collateral;
pub use loan::{Loan, RoundParams};
pub use margin::margin_call_price;
