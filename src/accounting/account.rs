//! Agent accounts and the registry mapping agent identifiers to them.

use crate::accounting::balance::Balance;
use crate::accounting::balances::{Balances, BalancesDesc};
use crate::accounting::loan::RoundParams;
use crate::types::{AgentId, BookId, OrderId};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Initial holdings every registered account starts from.
#[derive(Debug, Clone, Copy)]
pub struct AccountTemplate {
    pub base_total: Decimal,
    pub quote_total: Decimal,
}

/// One agent's state across all books: a [`Balances`] and the set of active
/// order ids per book.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    holdings: Vec<Balances>,
    active_orders: Vec<BTreeSet<OrderId>>,
}

impl Account {
    #[must_use]
    pub fn new(holdings: Vec<Balances>) -> Self {
        let books = holdings.len();
        Self {
            holdings,
            active_orders: vec![BTreeSet::new(); books],
        }
    }

    #[must_use]
    pub fn book_count(&self) -> usize {
        self.holdings.len()
    }

    #[must_use]
    pub fn at(&self, book_id: BookId) -> &Balances {
        &self.holdings[book_id as usize]
    }

    pub fn at_mut(&mut self, book_id: BookId) -> &mut Balances {
        &mut self.holdings[book_id as usize]
    }

    #[must_use]
    pub fn active_orders(&self, book_id: BookId) -> &BTreeSet<OrderId> {
        &self.active_orders[book_id as usize]
    }

    pub fn register_order(&mut self, book_id: BookId, order_id: OrderId) {
        self.active_orders[book_id as usize].insert(order_id);
    }

    pub fn unregister_order(&mut self, book_id: BookId, order_id: OrderId) -> bool {
        self.active_orders[book_id as usize].remove(&order_id)
    }

    #[must_use]
    pub fn has_active_order(&self, book_id: BookId, order_id: OrderId) -> bool {
        self.active_orders[book_id as usize].contains(&order_id)
    }
}

/// Registry of all accounts, addressable by numeric agent id or by the local
/// string name of a simulated agent.
///
/// Remote agents carry non-negative ids assigned by their transport; local
/// agents are allocated ids downward from `-1` at registration.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: HashMap<AgentId, Account>,
    names_to_ids: HashMap<String, AgentId>,
    ids_to_names: HashMap<AgentId, String>,
    next_local_id: AgentId,
}

impl AccountRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            names_to_ids: HashMap::new(),
            ids_to_names: HashMap::new(),
            next_local_id: -1,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    #[must_use]
    pub fn contains(&self, agent_id: AgentId) -> bool {
        self.accounts.contains_key(&agent_id)
    }

    #[must_use]
    pub fn get(&self, agent_id: AgentId) -> Option<&Account> {
        self.accounts.get(&agent_id)
    }

    pub fn get_mut(&mut self, agent_id: AgentId) -> Option<&mut Account> {
        self.accounts.get_mut(&agent_id)
    }

    /// Numeric id of a locally named agent.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<AgentId> {
        self.names_to_ids.get(name).copied()
    }

    /// Local name of an agent, if it has one.
    #[must_use]
    pub fn name_of(&self, agent_id: AgentId) -> Option<&str> {
        self.ids_to_names.get(&agent_id).map(String::as_str)
    }

    /// The agent's class name: its local name with any trailing numeric
    /// suffix stripped (`"hft_12"` → `"hft_"`). Used to look up per-class
    /// fee-policy overrides.
    #[must_use]
    pub fn agent_base_name(&self, agent_id: AgentId) -> Option<String> {
        let name = self.name_of(agent_id)?;
        Some(name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
    }

    /// Register a remote agent under its transport-assigned id.
    pub fn register_remote(&mut self, agent_id: AgentId, account: Account) {
        debug!(agent = agent_id, "registering remote agent");
        self.accounts.insert(agent_id, account);
    }

    /// Register a local agent by name, allocating the next negative id.
    pub fn register_local(&mut self, name: &str, account: Account) -> AgentId {
        if let Some(existing) = self.id_of(name) {
            return existing;
        }
        let agent_id = self.next_local_id;
        self.next_local_id -= 1;
        self.names_to_ids.insert(name.to_string(), agent_id);
        self.ids_to_names.insert(agent_id, name.to_string());
        self.accounts.insert(agent_id, account);
        debug!(agent = agent_id, name, "registering local agent");
        agent_id
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &Account)> {
        self.accounts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&AgentId, &mut Account)> {
        self.accounts.iter_mut()
    }
}

/// Build a fresh account from a template, one [`Balances`] per book.
#[must_use]
pub fn account_from_template(
    template: AccountTemplate,
    books: usize,
    round_params: RoundParams,
    maintenance_margin: Decimal,
) -> Account {
    let holdings = (0..books)
        .map(|_| {
            Balances::new(BalancesDesc {
                base: Balance::new(template.base_total, "", round_params.base_decimals),
                quote: Balance::new(template.quote_total, "", round_params.quote_decimals),
                round_params,
                maintenance_margin,
            })
        })
        .collect();
    Account::new(holdings)
}
