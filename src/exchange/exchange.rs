//! The multi-book exchange front door.
//!
//! Accepts request messages, dispatches them through the clearing manager
//! and the books, assembles exactly one response (or typed error) per
//! request, maintains the subscription registries and the per-book L3 event
//! record.

use crate::accounting::{account_from_template, AccountRegistry, AccountTemplate, RoundParams};
use crate::book::{
    Currency, LimitOrderArgs, MarketOrderArgs, MatchOutcome, Order, OrderBook, OrderClientContext,
    OrderContext, OrderDirection, SettleFlag, StpFlag, TimeInForce, TradeContext, TradeListener,
};
use crate::decimal::round;
use crate::exchange::clearing::{ClearingManager, OrderDesc};
use crate::exchange::config::{ConfigError, ExchangeConfig};
use crate::exchange::events::{CancellationEvent, L3Event, L3Record, OrderEvent, TradeEvent};
use crate::exchange::fees::{FeePolicyWrapper, SharedFeePolicy};
use crate::exchange::messages::{
    ErrorResponse, ExchangeEvent, ExchangeRequest, ExchangeResponse, Notification,
    PlaceOrderLimitPayload, PlaceOrderMarketPayload, RequestOutcome,
};
use crate::exchange::validator::{OrderErrorCode, OrderPlacementValidator, ValidatorParams};
use crate::types::{AgentId, BookId, OrderId, Timestamp};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info};

type HandlerResult = (Result<ExchangeResponse, ErrorResponse>, Vec<Notification>);

/// Per-(agent, book) fee state, for the persisted layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeStateSnapshot {
    pub tier_index: usize,
    pub history: Vec<Decimal>,
}

/// A multi-book exchange: books, accounts, clearing, event record and
/// subscriptions.
pub struct MultiBookExchange {
    config: ExchangeConfig,
    books: Vec<OrderBook>,
    accounts: AccountRegistry,
    clearing: ClearingManager,
    l3_records: Vec<L3Record>,
    retain_record: bool,
    trade_listener: Option<TradeListener>,
    market_order_subscribers: BTreeSet<AgentId>,
    limit_order_subscribers: BTreeSet<AgentId>,
    trade_subscribers: BTreeSet<AgentId>,
    trade_by_order_subscribers: HashMap<(BookId, OrderId), BTreeSet<AgentId>>,
}

impl MultiBookExchange {
    /// Build an exchange with its own fee policy from the configuration.
    pub fn new(config: ExchangeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = FeePolicyWrapper::new(config.fee_policy.build()?).into_shared();
        Self::with_shared_fee_policy(config, shared)
    }

    /// Build an exchange around a fee policy shared with other simulation
    /// instances.
    pub fn with_shared_fee_policy(
        config: ExchangeConfig,
        fee_policy: SharedFeePolicy,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let validator = OrderPlacementValidator::new(ValidatorParams {
            price_increment_decimals: config.price_decimals,
            volume_increment_decimals: config.volume_decimals,
            base_increment_decimals: config.base_decimals,
            quote_increment_decimals: config.quote_decimals,
            min_order_size: config.min_order_size,
            max_open_orders: config.max_open_orders,
        });
        let clearing = ClearingManager::new(validator, fee_policy, config.maintenance_margin);
        let books = (0..config.books)
            .map(|book_id| OrderBook::new(book_id, config.volume_decimals))
            .collect();
        let l3_records = (0..config.books).map(|_| L3Record::default()).collect();
        info!(books = config.books, "exchange created");
        Ok(Self {
            config,
            books,
            accounts: AccountRegistry::new(),
            clearing,
            l3_records,
            retain_record: false,
            trade_listener: None,
            market_order_subscribers: BTreeSet::new(),
            limit_order_subscribers: BTreeSet::new(),
            trade_subscribers: BTreeSet::new(),
            trade_by_order_subscribers: HashMap::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    #[must_use]
    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    #[must_use]
    pub fn book(&self, book_id: BookId) -> Option<&OrderBook> {
        self.books.get(book_id as usize)
    }

    #[must_use]
    pub fn clearing(&self) -> &ClearingManager {
        &self.clearing
    }

    /// Whether to append events to the per-book L3 records.
    pub fn retain_record(&mut self, flag: bool) {
        self.retain_record = flag;
    }

    #[must_use]
    pub fn l3_record(&self, book_id: BookId) -> Option<&L3Record> {
        self.l3_records.get(book_id as usize)
    }

    /// Install the synchronous listener invoked for every cleared trade.
    pub fn set_trade_listener(&mut self, listener: TradeListener) {
        self.trade_listener = Some(listener);
    }

    /// Register a locally simulated agent by name; allocates a negative id
    /// and seeds the account from the configured template.
    pub fn register_local_agent(&mut self, name: &str) -> AgentId {
        let account = self.template_account();
        let agent_id = self.accounts.register_local(name, account);
        let base_name = self.accounts.agent_base_name(agent_id);
        self.clearing
            .fee_policy()
            .write()
            .expect("fee policy lock poisoned")
            .register_agent(agent_id, base_name);
        agent_id
    }

    /// Register a remote agent under its transport-assigned non-negative id.
    pub fn register_remote_agent(&mut self, agent_id: AgentId) {
        let account = self.template_account();
        self.accounts.register_remote(agent_id, account);
    }

    /// Per-(agent, book) fee state for the persisted layout.
    #[must_use]
    pub fn fee_state(&self, book_id: BookId, agent_id: AgentId) -> FeeStateSnapshot {
        let policy = self
            .clearing
            .fee_policy()
            .read()
            .expect("fee policy lock poisoned");
        FeeStateSnapshot {
            tier_index: policy.tier_index(book_id, agent_id),
            history: policy
                .volume_history(book_id, agent_id)
                .map(<[Decimal]>::to_vec)
                .unwrap_or_default(),
        }
    }

    /// Fire the slot-boundary fee-tier update.
    pub fn update_fee_tiers(&self, time: Timestamp) {
        self.clearing.update_fee_tiers(time);
    }

    /// Handle one request message, producing exactly one response or error
    /// plus the event notifications to dispatch.
    pub fn handle_request(
        &mut self,
        agent_id: AgentId,
        request: ExchangeRequest,
        timestamp: Timestamp,
    ) -> RequestOutcome {
        let echo = request.clone();
        let (response, notifications) = match request {
            ExchangeRequest::PlaceOrderMarket(mut payload) => {
                self.place_market_order(agent_id, &mut payload, timestamp)
            }
            ExchangeRequest::PlaceOrderLimit(mut payload) => {
                self.place_limit_order(agent_id, &mut payload, timestamp)
            }
            ExchangeRequest::CancelOrders {
                book_id,
                cancellations,
            } => self.cancel_orders(agent_id, book_id, &cancellations, timestamp),
            ExchangeRequest::ClosePositions { book_id, positions } => {
                self.close_positions(agent_id, book_id, &positions, timestamp)
            }
            ExchangeRequest::RetrieveL1 { book_id } => (self.retrieve_l1(book_id), Vec::new()),
            ExchangeRequest::RetrieveBook { book_id, depth } => {
                (self.retrieve_book(book_id, depth), Vec::new())
            }
            ExchangeRequest::RetrieveOrders { book_id, order_ids } => {
                (self.retrieve_orders(book_id, &order_ids), Vec::new())
            }
            ExchangeRequest::ResetAgent { agent_ids } => {
                (self.reset_agents(agent_id, &agent_ids, timestamp), Vec::new())
            }
            ExchangeRequest::SubscribeEventOrderMarket => {
                self.market_order_subscribers.insert(agent_id);
                (Ok(ExchangeResponse::ResponseSubscribe), Vec::new())
            }
            ExchangeRequest::SubscribeEventOrderLimit => {
                self.limit_order_subscribers.insert(agent_id);
                (Ok(ExchangeResponse::ResponseSubscribe), Vec::new())
            }
            ExchangeRequest::SubscribeEventTrade => {
                self.trade_subscribers.insert(agent_id);
                (Ok(ExchangeResponse::ResponseSubscribe), Vec::new())
            }
            ExchangeRequest::SubscribeEventTradeByOrder { book_id, order_id } => {
                self.trade_by_order_subscribers
                    .entry((book_id, order_id))
                    .or_default()
                    .insert(agent_id);
                (Ok(ExchangeResponse::ResponseSubscribe), Vec::new())
            }
        };
        RequestOutcome {
            request: echo,
            response,
            notifications,
        }
    }

    /// Liquidate every position whose margin-call price is crossed by the
    /// reference price, force-closing each as an opposite market order that
    /// settles against the called loan.
    pub fn check_margin_calls(
        &mut self,
        book_id: BookId,
        reference_price: Decimal,
        timestamp: Timestamp,
    ) -> Vec<Notification> {
        let calls = self.clearing.check_margin_call(book_id, reference_price);
        let mut notifications = Vec::new();
        for call in calls {
            let Some(payload) = self.force_close_payload(book_id, call.agent_id, call.order_id)
            else {
                continue;
            };
            let mut payload = payload;
            let (response, mut notes) =
                self.place_market_order(call.agent_id, &mut payload, timestamp);
            if let Err(err) = response {
                error!(
                    agent = call.agent_id,
                    order = call.order_id,
                    code = %err.code,
                    "force-close rejected"
                );
                continue;
            }
            notifications.append(&mut notes);
        }
        notifications
    }

    /// Cancel a GTT order whose expiry message fired. Unknown or already
    /// gone ids are a no-op returning false.
    pub fn expire_order(
        &mut self,
        book_id: BookId,
        order_id: OrderId,
        timestamp: Timestamp,
    ) -> bool {
        let Some(book_index) = self.book_index(book_id) else {
            return false;
        };
        let Some(ctx) = self.books[book_index].client_context(order_id) else {
            return false;
        };
        let Some(outcome) = self.books[book_index].cancel_order(order_id, None) else {
            return false;
        };
        self.clearing.handle_cancel_order(
            &mut self.accounts,
            &self.books[book_index],
            ctx.agent_id,
            order_id,
            outcome.order.header.direction,
            outcome.order.price,
            outcome.volume_cancelled,
            true,
        );
        self.record_cancellation(book_id, order_id, ctx.agent_id, outcome.volume_cancelled, timestamp);
        true
    }

    fn place_market_order(
        &mut self,
        agent_id: AgentId,
        payload: &mut PlaceOrderMarketPayload,
        timestamp: Timestamp,
    ) -> HandlerResult {
        let Some(book_index) = self.book_index(payload.book_id) else {
            return (Err(unknown_book(payload.book_id)), Vec::new());
        };
        if let Err(code) = self.convert_quote_volume(
            book_index,
            payload.direction,
            payload.currency,
            &mut payload.volume,
        ) {
            return (Err(ErrorResponse::new(code)), Vec::new());
        }
        payload.currency = Currency::Base;

        let validation = match self.clearing.handle_order(
            &mut self.accounts,
            &self.books[book_index],
            self.config.max_leverage,
            self.config.max_loan,
            OrderDesc::Market { agent_id, payload },
        ) {
            Ok(validation) => validation,
            Err(code) => return (Err(ErrorResponse::new(code)), Vec::new()),
        };

        let book_id = payload.book_id;
        let order_id = self.books[book_index].order_factory().counter_state();
        self.accounts
            .get_mut(agent_id)
            .expect("validated account")
            .register_order(book_id, order_id);

        let (order, outcome) = self.books[book_index].place_market_order(
            MarketOrderArgs {
                direction: payload.direction,
                timestamp,
                volume: payload.volume,
                leverage: validation.leverage,
                stp_flag: payload.stp_flag,
                settle_flag: payload.settle_flag,
            },
            OrderClientContext::new(agent_id, payload.client_order_id),
        );
        debug_assert_eq!(order.header.id, order_id);

        if self.retain_record {
            self.l3_records[book_index].push(L3Event::Order(OrderEvent {
                timestamp,
                order: Order::Market(order.clone()),
                context: OrderContext::new(agent_id, book_id, payload.client_order_id),
            }));
        }
        let mut notifications = self.notify_market_order(book_id, order_id, agent_id, payload);
        notifications.extend(self.process_outcome(book_index, &outcome, timestamp));

        // market orders never rest; release whatever the fills left behind
        self.clearing.finalize_order(
            &mut self.accounts,
            book_id,
            agent_id,
            order_id,
            payload.direction,
            !outcome.trades.is_empty(),
        );

        (
            Ok(ExchangeResponse::ResponsePlaceOrderMarket {
                book_id,
                order_id,
                client_order_id: payload.client_order_id,
            }),
            notifications,
        )
    }

    fn place_limit_order(
        &mut self,
        agent_id: AgentId,
        payload: &mut PlaceOrderLimitPayload,
        timestamp: Timestamp,
    ) -> HandlerResult {
        let Some(book_index) = self.book_index(payload.book_id) else {
            return (Err(unknown_book(payload.book_id)), Vec::new());
        };
        if payload.time_in_force == TimeInForce::Gtt && payload.expiry_period.is_none() {
            return (
                Err(ErrorResponse::with_message(
                    OrderErrorCode::ContractViolation,
                    "GTT order without an expiry period",
                )),
                Vec::new(),
            );
        }
        if let Err(code) = self.convert_quote_volume(
            book_index,
            payload.direction,
            payload.currency,
            &mut payload.volume,
        ) {
            return (Err(ErrorResponse::new(code)), Vec::new());
        }
        payload.currency = Currency::Base;

        let validation = match self.clearing.handle_order(
            &mut self.accounts,
            &self.books[book_index],
            self.config.max_leverage,
            self.config.max_loan,
            OrderDesc::Limit { agent_id, payload },
        ) {
            Ok(validation) => validation,
            Err(code) => return (Err(ErrorResponse::new(code)), Vec::new()),
        };

        let book_id = payload.book_id;
        let order_id = self.books[book_index].order_factory().counter_state();
        self.accounts
            .get_mut(agent_id)
            .expect("validated account")
            .register_order(book_id, order_id);

        let (order, outcome) = self.books[book_index].place_limit_order(
            LimitOrderArgs {
                direction: payload.direction,
                timestamp,
                volume: payload.volume,
                price: payload.price,
                leverage: validation.leverage,
                stp_flag: payload.stp_flag,
                settle_flag: payload.settle_flag,
                post_only: payload.post_only,
                time_in_force: payload.time_in_force,
                expiry_period: payload.expiry_period,
            },
            OrderClientContext::new(agent_id, payload.client_order_id),
        );
        debug_assert_eq!(order.header.id, order_id);

        if self.retain_record {
            self.l3_records[book_index].push(L3Event::Order(OrderEvent {
                timestamp,
                order: Order::Limit(order.clone()),
                context: OrderContext::new(agent_id, book_id, payload.client_order_id),
            }));
        }
        let mut notifications = self.notify_limit_order(book_id, order_id, agent_id, payload);
        notifications.extend(self.process_outcome(book_index, &outcome, timestamp));

        if !outcome.rested {
            self.clearing.finalize_order(
                &mut self.accounts,
                book_id,
                agent_id,
                order_id,
                payload.direction,
                !outcome.trades.is_empty(),
            );
        }

        let expiry_time = (payload.time_in_force == TimeInForce::Gtt)
            .then(|| timestamp + payload.expiry_period.unwrap_or_default());
        (
            Ok(ExchangeResponse::ResponsePlaceOrderLimit {
                book_id,
                order_id,
                client_order_id: payload.client_order_id,
                expiry_time,
            }),
            notifications,
        )
    }

    fn cancel_orders(
        &mut self,
        agent_id: AgentId,
        book_id: BookId,
        cancellations: &[crate::exchange::messages::CancellationItem],
        timestamp: Timestamp,
    ) -> HandlerResult {
        let Some(book_index) = self.book_index(book_id) else {
            return (Err(unknown_book(book_id)), Vec::new());
        };
        let mut cancelled = Vec::new();
        for item in cancellations {
            let owner = self.books[book_index]
                .client_context(item.order_id)
                .map(|c| c.agent_id);
            // cancelling someone else's order, like cancelling an unknown
            // id, changes nothing
            if owner != Some(agent_id) {
                continue;
            }
            let Some(outcome) = self.books[book_index].cancel_order(item.order_id, item.volume)
            else {
                continue;
            };
            self.clearing.handle_cancel_order(
                &mut self.accounts,
                &self.books[book_index],
                agent_id,
                item.order_id,
                outcome.order.header.direction,
                outcome.order.price,
                outcome.volume_cancelled,
                outcome.removed,
            );
            self.record_cancellation(
                book_id,
                item.order_id,
                agent_id,
                outcome.volume_cancelled,
                timestamp,
            );
            cancelled.push(item.order_id);
        }
        (
            Ok(ExchangeResponse::ResponseCancelOrders { book_id, cancelled }),
            Vec::new(),
        )
    }

    fn close_positions(
        &mut self,
        agent_id: AgentId,
        book_id: BookId,
        positions: &[crate::exchange::messages::ClosePositionItem],
        timestamp: Timestamp,
    ) -> HandlerResult {
        if self.book_index(book_id).is_none() {
            return (Err(unknown_book(book_id)), Vec::new());
        }
        if !self.accounts.contains(agent_id) {
            return (
                Err(ErrorResponse::new(OrderErrorCode::NonexistentAccount)),
                Vec::new(),
            );
        }
        let mut closed = Vec::new();
        let mut notifications = Vec::new();
        for item in positions {
            let Some(mut payload) =
                self.close_payload(book_id, agent_id, item.order_id, item.volume)
            else {
                continue;
            };
            let (response, mut notes) =
                self.place_market_order(agent_id, &mut payload, timestamp);
            notifications.append(&mut notes);
            match response {
                Ok(_) => closed.push(item.order_id),
                Err(err) => {
                    debug!(
                        agent = agent_id,
                        order = item.order_id,
                        code = %err.code,
                        "close-position order rejected"
                    );
                }
            }
        }
        (
            Ok(ExchangeResponse::ResponseClosePositions { book_id, closed }),
            notifications,
        )
    }

    fn retrieve_l1(&self, book_id: BookId) -> Result<ExchangeResponse, ErrorResponse> {
        let Some(book) = self.book(book_id) else {
            return Err(unknown_book(book_id));
        };
        Ok(ExchangeResponse::ResponseRetrieveL1 {
            book_id,
            snapshot: book.l1_snapshot(),
        })
    }

    fn retrieve_book(
        &self,
        book_id: BookId,
        depth: usize,
    ) -> Result<ExchangeResponse, ErrorResponse> {
        let Some(book) = self.book(book_id) else {
            return Err(unknown_book(book_id));
        };
        Ok(ExchangeResponse::ResponseRetrieveBook {
            book_id,
            bids: book.bid_levels(depth),
            asks: book.ask_levels(depth),
        })
    }

    fn retrieve_orders(
        &self,
        book_id: BookId,
        order_ids: &[OrderId],
    ) -> Result<ExchangeResponse, ErrorResponse> {
        let Some(book) = self.book(book_id) else {
            return Err(unknown_book(book_id));
        };
        Ok(ExchangeResponse::ResponseRetrieveOrders {
            book_id,
            orders: order_ids.iter().filter_map(|id| book.order(*id)).collect(),
        })
    }

    fn reset_agents(
        &mut self,
        requester: AgentId,
        agent_ids: &[AgentId],
        timestamp: Timestamp,
    ) -> Result<ExchangeResponse, ErrorResponse> {
        let targets: Vec<AgentId> = if agent_ids.is_empty() {
            vec![requester]
        } else {
            agent_ids.to_vec()
        };
        let mut reset = Vec::new();
        for target in targets {
            if !self.accounts.contains(target) {
                continue;
            }
            // drop the agent's resting orders before rebuilding the account
            for book_index in 0..self.books.len() {
                let book_id = self.books[book_index].id();
                for order_id in self.books[book_index].resting_order_ids_of(target) {
                    if let Some(outcome) = self.books[book_index].cancel_order(order_id, None) {
                        self.record_cancellation(
                            book_id,
                            order_id,
                            target,
                            outcome.volume_cancelled,
                            timestamp,
                        );
                    }
                }
            }
            let fresh = self.template_account();
            *self
                .accounts
                .get_mut(target)
                .expect("checked contains above") = fresh;
            self.clearing
                .fee_policy()
                .write()
                .expect("fee policy lock poisoned")
                .reset_history_for(&HashSet::from([target]));
            info!(agent = target, "agent reset");
            reset.push(target);
        }
        Ok(ExchangeResponse::ResponseResetAgent { agent_ids: reset })
    }

    /// Clear each emitted trade synchronously, in emission order, and turn
    /// STP cancellations into record entries and reservation releases.
    fn process_outcome(
        &mut self,
        book_index: usize,
        outcome: &MatchOutcome,
        timestamp: Timestamp,
    ) -> Vec<Notification> {
        let book_id = self.books[book_index].id();
        let mut notifications = Vec::new();

        for emission in &outcome.trades {
            let fees = self
                .clearing
                .handle_trade(&mut self.accounts, book_id, emission);
            let context = TradeContext {
                book_id,
                aggressing_agent_id: emission.aggressing.agent_id,
                resting_agent_id: emission.resting.agent_id,
                fees,
            };
            if self.retain_record {
                self.l3_records[book_index].push(L3Event::Trade(TradeEvent {
                    trade: emission.trade.clone(),
                    context,
                }));
            }
            if let Some(listener) = &self.trade_listener {
                listener(&emission.trade, &context);
            }

            let client_order_id = self.books[book_index]
                .client_context(emission.aggressing.order_id)
                .and_then(|c| c.client_order_id);
            for recipient in &self.trade_subscribers {
                notifications.push(Notification {
                    recipient: *recipient,
                    event: ExchangeEvent::EventTrade {
                        book_id,
                        trade: emission.trade.clone(),
                        context,
                        client_order_id,
                    },
                });
            }
            for order_id in [emission.aggressing.order_id, emission.resting.order_id] {
                if let Some(subscribers) =
                    self.trade_by_order_subscribers.get(&(book_id, order_id))
                {
                    for recipient in subscribers {
                        notifications.push(Notification {
                            recipient: *recipient,
                            event: ExchangeEvent::EventTrade {
                                book_id,
                                trade: emission.trade.clone(),
                                context,
                                client_order_id,
                            },
                        });
                    }
                }
            }

            if emission.resting.fully_filled_by(emission.trade.volume) {
                self.clearing.finalize_order(
                    &mut self.accounts,
                    book_id,
                    emission.resting.agent_id,
                    emission.resting.order_id,
                    emission.resting.direction,
                    true,
                );
            }
        }

        for cancellation in &outcome.stp_cancellations {
            if let Some(price) = cancellation.price {
                // a resting order cut by self-trade prevention
                self.clearing.handle_cancel_order(
                    &mut self.accounts,
                    &self.books[book_index],
                    cancellation.agent_id,
                    cancellation.order_id,
                    cancellation.direction,
                    price,
                    cancellation.volume_cancelled,
                    cancellation.removed,
                );
            } else if let Some(order) = self.books[book_index].order(cancellation.order_id) {
                // the incoming side was decremented but rested anyway; free
                // the annihilated share like a partial cancel. A fully cut
                // incoming is released by finalize_order instead.
                self.clearing.handle_cancel_order(
                    &mut self.accounts,
                    &self.books[book_index],
                    cancellation.agent_id,
                    cancellation.order_id,
                    cancellation.direction,
                    order.price,
                    cancellation.volume_cancelled,
                    false,
                );
            }
            self.record_cancellation(
                book_id,
                cancellation.order_id,
                cancellation.agent_id,
                cancellation.volume_cancelled,
                timestamp,
            );
        }

        notifications
    }

    fn notify_market_order(
        &self,
        book_id: BookId,
        order_id: OrderId,
        agent_id: AgentId,
        payload: &PlaceOrderMarketPayload,
    ) -> Vec<Notification> {
        self.market_order_subscribers
            .iter()
            .map(|recipient| Notification {
                recipient: *recipient,
                event: ExchangeEvent::EventOrderMarket {
                    book_id,
                    order_id,
                    agent_id,
                    direction: payload.direction,
                    volume: payload.volume,
                },
            })
            .collect()
    }

    fn notify_limit_order(
        &self,
        book_id: BookId,
        order_id: OrderId,
        agent_id: AgentId,
        payload: &PlaceOrderLimitPayload,
    ) -> Vec<Notification> {
        self.limit_order_subscribers
            .iter()
            .map(|recipient| Notification {
                recipient: *recipient,
                event: ExchangeEvent::EventOrderLimit {
                    book_id,
                    order_id,
                    agent_id,
                    direction: payload.direction,
                    volume: payload.volume,
                    price: payload.price,
                },
            })
            .collect()
    }

    fn record_cancellation(
        &mut self,
        book_id: BookId,
        order_id: OrderId,
        agent_id: AgentId,
        volume: Decimal,
        timestamp: Timestamp,
    ) {
        if !self.retain_record {
            return;
        }
        self.l3_records[book_id as usize].push(L3Event::Cancellation(CancellationEvent {
            timestamp,
            book_id,
            order_id,
            agent_id,
            volume,
        }));
    }

    /// Convert a quote-denominated volume to base at the touch.
    fn convert_quote_volume(
        &self,
        book_index: usize,
        direction: OrderDirection,
        currency: Currency,
        volume: &mut Decimal,
    ) -> Result<(), OrderErrorCode> {
        if currency == Currency::Base {
            return Ok(());
        }
        let touch = match direction {
            OrderDirection::Buy => self.books[book_index].best_ask(),
            OrderDirection::Sell => self.books[book_index].best_bid(),
        };
        if touch <= Decimal::ZERO {
            return Err(OrderErrorCode::EmptyBook);
        }
        *volume = round(*volume / touch, self.config.volume_decimals);
        Ok(())
    }

    /// Sizing of the market order that closes (part of) a loan-backed
    /// position. Quote-denominated BUY loans are raised by selling base at
    /// the bid; base-denominated SELL loans by buying the base back.
    fn close_payload(
        &self,
        book_id: BookId,
        agent_id: AgentId,
        order_id: OrderId,
        requested: Option<Decimal>,
    ) -> Option<PlaceOrderMarketPayload> {
        let balances = self.accounts.get(agent_id)?.at(book_id);
        let loan = balances.loan(order_id)?;
        let outstanding = loan.amount();
        let amount = requested.unwrap_or(outstanding).min(outstanding);
        if amount <= Decimal::ZERO {
            return None;
        }
        let book = self.book(book_id)?;
        let volume = match loan.direction() {
            OrderDirection::Buy => {
                let bid = book.best_bid();
                if bid <= Decimal::ZERO {
                    return None;
                }
                round(amount / bid, self.config.volume_decimals)
            }
            OrderDirection::Sell => round(amount, self.config.volume_decimals),
        };
        if volume <= Decimal::ZERO {
            return None;
        }
        Some(PlaceOrderMarketPayload {
            direction: loan.direction().opposite(),
            volume,
            leverage: Decimal::ZERO,
            book_id,
            currency: Currency::Base,
            client_order_id: None,
            stp_flag: StpFlag::None,
            settle_flag: SettleFlag::Order(order_id),
        })
    }

    fn force_close_payload(
        &self,
        book_id: BookId,
        agent_id: AgentId,
        order_id: OrderId,
    ) -> Option<PlaceOrderMarketPayload> {
        self.close_payload(book_id, agent_id, order_id, None)
    }

    fn template_account(&self) -> crate::accounting::Account {
        account_from_template(
            AccountTemplate {
                base_total: self.config.initial_base,
                quote_total: self.config.initial_quote,
            },
            self.books.len(),
            RoundParams {
                base_decimals: self.config.base_decimals,
                quote_decimals: self.config.quote_decimals,
            },
            self.config.maintenance_margin,
        )
    }

    fn book_index(&self, book_id: BookId) -> Option<usize> {
        let index = book_id as usize;
        (index < self.books.len()).then_some(index)
    }
}

fn unknown_book(book_id: BookId) -> ErrorResponse {
    ErrorResponse::with_message(
        OrderErrorCode::ContractViolation,
        format!("unknown book #{book_id}"),
    )
}
