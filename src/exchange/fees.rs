//! Tiered maker/taker fee schedule with per-agent rolling volume history,
//! plus the wrapper layering per-agent-class overrides behind a
//! reader-writer lock.

use crate::types::{AgentId, BookId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// Maker and taker amounts (or rates) of one trade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    pub maker: Decimal,
    pub taker: Decimal,
}

/// One bucket of the fee schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Rolled trade volume (in quote) required to reach this tier.
    pub volume_required: Decimal,
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

/// Construction failures of a [`FeePolicy`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeePolicyError {
    #[error("fee policy requires at least one tier")]
    NoTiers,
    #[error("fee rate {0} outside the open interval (-1, 1)")]
    RateOutOfRange(Decimal),
    #[error("tiers must have strictly increasing volume requirements, got {0} after {1}")]
    NonIncreasingTiers(Decimal, Decimal),
    #[error("history must have at least one slot")]
    NoHistorySlots,
    #[error("slot period must be positive")]
    ZeroSlotPeriod,
}

/// Tiered fee schedule with a rolling per-(agent, book) volume history.
///
/// The newest bucket accumulates the current slot's trades; tier assignment
/// happens on slot boundaries from the rolled sum, after which the buckets
/// shift left and the newest zeroes out.
#[derive(Debug, Clone, Serialize)]
pub struct FeePolicy {
    history_slots: usize,
    slot_period: Timestamp,
    tiers: Vec<Tier>,
    agent_tiers: HashMap<AgentId, HashMap<BookId, usize>>,
    agent_volumes: HashMap<AgentId, HashMap<BookId, Vec<Decimal>>>,
}

impl FeePolicy {
    pub fn new(
        history_slots: usize,
        slot_period: Timestamp,
        mut tiers: Vec<Tier>,
    ) -> Result<Self, FeePolicyError> {
        if history_slots == 0 {
            return Err(FeePolicyError::NoHistorySlots);
        }
        if slot_period == 0 {
            return Err(FeePolicyError::ZeroSlotPeriod);
        }
        if tiers.is_empty() {
            return Err(FeePolicyError::NoTiers);
        }
        tiers.sort_by(|a, b| a.volume_required.cmp(&b.volume_required));
        for window in tiers.windows(2) {
            if window[0].volume_required == window[1].volume_required {
                return Err(FeePolicyError::NonIncreasingTiers(
                    window[1].volume_required,
                    window[0].volume_required,
                ));
            }
        }
        for tier in &tiers {
            for rate in [tier.maker_rate, tier.taker_rate] {
                if rate <= Decimal::NEGATIVE_ONE || rate >= Decimal::ONE {
                    return Err(FeePolicyError::RateOutOfRange(rate));
                }
            }
        }
        Ok(Self {
            history_slots,
            slot_period,
            tiers,
            agent_tiers: HashMap::new(),
            agent_volumes: HashMap::new(),
        })
    }

    #[must_use]
    pub fn history_slots(&self) -> usize {
        self.history_slots
    }

    #[must_use]
    pub fn slot_period(&self) -> Timestamp {
        self.slot_period
    }

    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// The agent's current maker/taker rates on a book.
    #[must_use]
    pub fn get_rates(&self, book_id: BookId, agent_id: AgentId) -> Fees {
        let tier = self.tier_for_agent(book_id, agent_id);
        Fees {
            maker: tier.maker_rate,
            taker: tier.taker_rate,
        }
    }

    /// The agent's current tier index on a book.
    #[must_use]
    pub fn tier_index(&self, book_id: BookId, agent_id: AgentId) -> usize {
        self.agent_tiers
            .get(&agent_id)
            .and_then(|books| books.get(&book_id))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the agent's volume buckets on a book.
    #[must_use]
    pub fn agent_volume(&self, book_id: BookId, agent_id: AgentId) -> Decimal {
        self.agent_volumes
            .get(&agent_id)
            .and_then(|books| books.get(&book_id))
            .map(|buckets| buckets.iter().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Rolling history snapshot for persistence.
    #[must_use]
    pub fn volume_history(&self, book_id: BookId, agent_id: AgentId) -> Option<&[Decimal]> {
        self.agent_volumes
            .get(&agent_id)
            .and_then(|books| books.get(&book_id))
            .map(Vec::as_slice)
    }

    /// Add traded quote volume into the agent's newest bucket.
    pub fn update_history(&mut self, book_id: BookId, agent_id: AgentId, volume: Decimal) {
        let buckets = self
            .agent_volumes
            .entry(agent_id)
            .or_default()
            .entry(book_id)
            .or_insert_with(|| vec![Decimal::ZERO; self.history_slots]);
        *buckets.last_mut().expect("history has at least one slot") += volume;
    }

    /// Re-assign every agent's tier from its rolled volume, then shift the
    /// buckets left and zero the newest.
    pub fn update_agents_tiers(&mut self) {
        for (agent_id, book_volumes) in &mut self.agent_volumes {
            for (book_id, buckets) in book_volumes {
                let total: Decimal = buckets.iter().copied().sum();
                let mut idx: isize = -1;
                for tier in &self.tiers {
                    if total < tier.volume_required {
                        break;
                    }
                    idx += 1;
                }
                let idx = idx.max(0) as usize;
                let previous = self
                    .agent_tiers
                    .entry(*agent_id)
                    .or_default()
                    .insert(*book_id, idx);
                if previous != Some(idx) {
                    debug!(
                        agent = *agent_id,
                        book = *book_id,
                        volume = %total,
                        tier = idx,
                        "fee tier updated"
                    );
                }
                buckets.rotate_left(1);
                *buckets.last_mut().expect("non-empty") = Decimal::ZERO;
            }
        }
    }

    /// Zero every agent's history and tier.
    pub fn reset_history(&mut self) {
        for books in self.agent_volumes.values_mut() {
            for buckets in books.values_mut() {
                buckets.fill(Decimal::ZERO);
            }
        }
        for books in self.agent_tiers.values_mut() {
            for tier in books.values_mut() {
                *tier = 0;
            }
        }
    }

    /// Zero the history and tier of the given agents only.
    pub fn reset_history_for(&mut self, agent_ids: &HashSet<AgentId>) {
        for (agent_id, books) in &mut self.agent_volumes {
            if !agent_ids.contains(agent_id) {
                continue;
            }
            for buckets in books.values_mut() {
                buckets.fill(Decimal::ZERO);
            }
        }
        for (agent_id, books) in &mut self.agent_tiers {
            if !agent_ids.contains(agent_id) {
                continue;
            }
            for tier in books.values_mut() {
                *tier = 0;
            }
        }
    }

    fn tier_for_agent(&self, book_id: BookId, agent_id: AgentId) -> &Tier {
        &self.tiers[self.tier_index(book_id, agent_id).min(self.tiers.len() - 1)]
    }
}

/// Fee policy with per-agent-class overrides keyed by agent base name.
///
/// Mutation windows are short and explicit; callers share the wrapper across
/// simulation threads as a [`SharedFeePolicy`] and take the lock per call.
#[derive(Debug)]
pub struct FeePolicyWrapper {
    default_policy: FeePolicy,
    overrides: HashMap<String, FeePolicy>,
    agent_base_names: HashMap<AgentId, String>,
}

/// A fee-policy wrapper shared between simulation instances.
pub type SharedFeePolicy = Arc<RwLock<FeePolicyWrapper>>;

impl FeePolicyWrapper {
    #[must_use]
    pub fn new(default_policy: FeePolicy) -> Self {
        Self {
            default_policy,
            overrides: HashMap::new(),
            agent_base_names: HashMap::new(),
        }
    }

    /// Wrap into the shared, lock-guarded form.
    #[must_use]
    pub fn into_shared(self) -> SharedFeePolicy {
        Arc::new(RwLock::new(self))
    }

    /// Install an override policy for an agent class.
    pub fn add_override(&mut self, agent_base_name: &str, policy: FeePolicy) {
        self.overrides.insert(agent_base_name.to_string(), policy);
    }

    /// Whether an override exists for the given agent class.
    #[must_use]
    pub fn contains(&self, agent_base_name: &str) -> bool {
        self.overrides.contains_key(agent_base_name)
    }

    /// Record the base name an agent resolves through.
    pub fn register_agent(&mut self, agent_id: AgentId, base_name: Option<String>) {
        if let Some(base_name) = base_name {
            self.agent_base_names.insert(agent_id, base_name);
        }
    }

    #[must_use]
    pub fn get_rates(&self, book_id: BookId, agent_id: AgentId) -> Fees {
        self.policy_for(agent_id).get_rates(book_id, agent_id)
    }

    /// Maker/taker fee amounts for a trade of `volume` at `price`: the
    /// maker rate is indexed by the resting agent, the taker rate by the
    /// aggressing agent.
    #[must_use]
    pub fn calculate_fees(
        &self,
        book_id: BookId,
        resting_agent_id: AgentId,
        aggressing_agent_id: AgentId,
        volume: Decimal,
        price: Decimal,
    ) -> Fees {
        let notional = volume * price;
        Fees {
            maker: self.get_rates(book_id, resting_agent_id).maker * notional,
            taker: self.get_rates(book_id, aggressing_agent_id).taker * notional,
        }
    }

    #[must_use]
    pub fn agent_volume(&self, book_id: BookId, agent_id: AgentId) -> Decimal {
        self.policy_for(agent_id).agent_volume(book_id, agent_id)
    }

    #[must_use]
    pub fn tier_index(&self, book_id: BookId, agent_id: AgentId) -> usize {
        self.policy_for(agent_id).tier_index(book_id, agent_id)
    }

    #[must_use]
    pub fn volume_history(&self, book_id: BookId, agent_id: AgentId) -> Option<&[Decimal]> {
        self.policy_for(agent_id).volume_history(book_id, agent_id)
    }

    /// Add traded volume to the agent's history in every policy, so a later
    /// override change sees a consistent record.
    pub fn update_history(&mut self, book_id: BookId, agent_id: AgentId, volume: Decimal) {
        self.default_policy.update_history(book_id, agent_id, volume);
        for policy in self.overrides.values_mut() {
            policy.update_history(book_id, agent_id, volume);
        }
    }

    /// Fire tier updates for every policy whose slot boundary `time` hits.
    pub fn update_agents_tiers(&mut self, time: Timestamp) {
        if time % self.default_policy.slot_period() == 0 {
            self.default_policy.update_agents_tiers();
        }
        for policy in self.overrides.values_mut() {
            if time % policy.slot_period() == 0 {
                policy.update_agents_tiers();
            }
        }
    }

    pub fn reset_history(&mut self) {
        self.default_policy.reset_history();
        for policy in self.overrides.values_mut() {
            policy.reset_history();
        }
    }

    pub fn reset_history_for(&mut self, agent_ids: &HashSet<AgentId>) {
        self.default_policy.reset_history_for(agent_ids);
        for policy in self.overrides.values_mut() {
            policy.reset_history_for(agent_ids);
        }
    }

    fn policy_for(&self, agent_id: AgentId) -> &FeePolicy {
        self.agent_base_names
            .get(&agent_id)
            .and_then(|name| self.overrides.get(name))
            .unwrap_or(&self.default_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tiers() -> Vec<Tier> {
        vec![
            Tier {
                volume_required: Decimal::ZERO,
                maker_rate: dec!(0.001),
                taker_rate: dec!(0.002),
            },
            Tier {
                volume_required: dec!(1000),
                maker_rate: dec!(0.0005),
                taker_rate: dec!(0.001),
            },
            Tier {
                volume_required: dec!(10000),
                maker_rate: Decimal::ZERO,
                taker_rate: dec!(0.0005),
            },
        ]
    }

    #[test]
    fn construction_rejects_bad_schedules() {
        assert_eq!(
            FeePolicy::new(3, 100, vec![]).unwrap_err(),
            FeePolicyError::NoTiers
        );
        let mut dup = tiers();
        dup[1].volume_required = Decimal::ZERO;
        assert!(matches!(
            FeePolicy::new(3, 100, dup).unwrap_err(),
            FeePolicyError::NonIncreasingTiers(..)
        ));
        let mut bad_rate = tiers();
        bad_rate[0].taker_rate = Decimal::ONE;
        assert!(matches!(
            FeePolicy::new(3, 100, bad_rate).unwrap_err(),
            FeePolicyError::RateOutOfRange(_)
        ));
        assert_eq!(
            FeePolicy::new(0, 100, tiers()).unwrap_err(),
            FeePolicyError::NoHistorySlots
        );
    }

    #[test]
    fn fresh_agents_sit_in_the_lowest_tier() {
        let policy = FeePolicy::new(3, 100, tiers()).unwrap();
        let rates = policy.get_rates(0, -1);
        assert_eq!(rates.maker, dec!(0.001));
        assert_eq!(rates.taker, dec!(0.002));
    }

    #[test]
    fn tiers_follow_the_rolled_volume() {
        let mut policy = FeePolicy::new(3, 100, tiers()).unwrap();
        policy.update_history(0, -1, dec!(1500));
        // volume still sits in the newest bucket until the slot rolls
        assert_eq!(policy.tier_index(0, -1), 0);
        policy.update_agents_tiers();
        assert_eq!(policy.tier_index(0, -1), 1);
        assert_eq!(policy.get_rates(0, -1).taker, dec!(0.001));
    }

    #[test]
    fn history_rolls_out_after_enough_slots() {
        let mut policy = FeePolicy::new(2, 100, tiers()).unwrap();
        policy.update_history(0, -1, dec!(2000));
        policy.update_agents_tiers();
        assert_eq!(policy.tier_index(0, -1), 1);
        // still inside the two-slot window
        policy.update_agents_tiers();
        assert_eq!(policy.tier_index(0, -1), 1);
        assert_eq!(policy.agent_volume(0, -1), Decimal::ZERO);
        // the volume has shifted out; the next boundary demotes
        policy.update_agents_tiers();
        assert_eq!(policy.tier_index(0, -1), 0);
    }

    #[test]
    fn wrapper_prefers_the_class_override() {
        let default_policy = FeePolicy::new(3, 100, tiers()).unwrap();
        let zero = FeePolicy::new(
            3,
            100,
            vec![Tier {
                volume_required: Decimal::ZERO,
                maker_rate: Decimal::ZERO,
                taker_rate: Decimal::ZERO,
            }],
        )
        .unwrap();
        let mut wrapper = FeePolicyWrapper::new(default_policy);
        wrapper.add_override("mm_", zero);
        wrapper.register_agent(-3, Some("mm_".to_string()));
        wrapper.register_agent(-4, Some("hft_".to_string()));

        assert!(wrapper.contains("mm_"));
        assert_eq!(wrapper.get_rates(0, -3).taker, Decimal::ZERO);
        assert_eq!(wrapper.get_rates(0, -4).taker, dec!(0.002));
    }

    #[test]
    fn calculate_fees_indexes_each_side_independently() {
        let wrapper = FeePolicyWrapper::new(FeePolicy::new(3, 100, tiers()).unwrap());
        let fees = wrapper.calculate_fees(0, -1, -2, dec!(2), dec!(100));
        assert_eq!(fees.maker, dec!(0.2));
        assert_eq!(fees.taker, dec!(0.4));
    }

    #[test]
    fn reset_for_a_subset_leaves_others_untouched() {
        let mut policy = FeePolicy::new(3, 100, tiers()).unwrap();
        policy.update_history(0, -1, dec!(5000));
        policy.update_history(0, -2, dec!(5000));
        policy.update_agents_tiers();
        policy.reset_history_for(&HashSet::from([-1]));
        assert_eq!(policy.tier_index(0, -1), 0);
        assert_eq!(policy.tier_index(0, -2), 1);
    }

    #[test]
    fn wrapper_tier_updates_respect_each_slot_period() {
        let default_policy = FeePolicy::new(2, 100, tiers()).unwrap();
        let slow = FeePolicy::new(2, 300, tiers()).unwrap();
        let mut wrapper = FeePolicyWrapper::new(default_policy);
        wrapper.add_override("slow_", slow);
        wrapper.register_agent(-5, Some("slow_".to_string()));
        wrapper.update_history(0, -5, dec!(2000));

        wrapper.update_agents_tiers(100);
        // default policy rolled, override did not
        assert_eq!(wrapper.tier_index(0, -5), 0);
        wrapper.update_agents_tiers(300);
        assert_eq!(wrapper.tier_index(0, -5), 1);
    }
}
