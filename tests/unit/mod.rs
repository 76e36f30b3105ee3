//! Integration tests driving the exchange through its request surface.

mod common;
mod fee_tier_tests;
mod invariant_tests;
mod margin_tests;
mod scenario_tests;
