//! Single-order lifecycle: placement, cancellation, fill, exit and settlement.
//!
//! ```text
//! PendingPrice --activation--> Open (market) | PendingLimit (limit)
//! Open / PendingLimit --fill--> Filled --exit--> Closed(reason)
//! PendingLimit --price runs away--> Cancelled
//! ```
//!
//! Every transition takes the candle it happens on; nothing here reads a
//! clock. Randomised costs draw from the caller's seeded `StdRng`.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::accounting::{self, CostModel, FeeRole};
use crate::candle::Candle;
pub use crate::config::OrderType;
use crate::config::TradeConfig;
use crate::pivot::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::Long => Side::Buy,
            Signal::Short => Side::Sell,
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        self == Side::Buy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PendingLimit,
    PendingPrice,
    Filled,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    Timeout,
    EndOfData,
    Forced,
}

impl ExitReason {
    /// Maker for resting take-profit orders, taker for everything else.
    pub fn fee_role(self) -> FeeRole {
        match self {
            ExitReason::TakeProfit => FeeRole::Maker,
            _ => FeeRole::Taker,
        }
    }
}

/// Order parameters taken from [`TradeConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderParams {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub order_distance_pct: f64,
    pub cancel_threshold_pct: f64,
    /// A position times out on the first candle whose time is at least this
    /// far past the fill time (`elapsed >= max`).
    pub max_trade_time_ms: Option<i64>,
    pub leverage: f64,
}

impl From<&TradeConfig> for OrderParams {
    fn from(t: &TradeConfig) -> Self {
        Self {
            take_profit_pct: t.take_profit_pct,
            stop_loss_pct: t.stop_loss_pct,
            order_distance_pct: t.order_distance_pct,
            cancel_threshold_pct: t.cancel_threshold_pct,
            max_trade_time_ms: t.max_trade_time_ms(),
            leverage: t.leverage,
        }
    }
}

/// What the runner asks the machine to place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub order_type: OrderType,
    /// Pivot or cascade execution price the order is anchored to.
    pub reference_price: f64,
    /// Average recent swing of the signalling timeframe, in percent.
    pub avg_swing_pct: f64,
    pub placed_time: i64,
    /// Earliest candle time the order may act on.
    pub activation_time: i64,
    pub trade_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    Waiting,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: usize,
    pub side: Side,
    pub order_type: OrderType,
    pub reference_price: f64,
    /// Limit price, or the reference price for market orders.
    pub price: f64,
    pub placed_time: i64,
    pub activation_time: i64,
    pub status: OrderStatus,
    pub trade_size: f64,
    pub leverage: f64,
    pub avg_swing_pct: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub fill_price: Option<f64>,
    pub fill_time: Option<i64>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    /// Best move from entry seen while filled, percent.
    pub max_favorable_excursion: f64,
    /// Worst move from entry seen while filled, percent (zero or negative).
    pub max_adverse_excursion: f64,
    pub entry_fee_pct: f64,
    pub exit_fee_pct: f64,
    pub funding_pct: f64,
    #[serde(skip)]
    funding_slot: i64,
}

/// Closed order plus its ledger effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub order: Order,
    pub pnl_percent: f64,
    pub pnl_value: f64,
    pub capital_before: f64,
    pub capital_after: f64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
    pub duration_ms: i64,
}

impl Trade {
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.order.exit_reason
    }
}

fn tp_sl(side: Side, entry: f64, params: &OrderParams) -> (f64, f64) {
    let tp = params.take_profit_pct / 100.0;
    let sl = params.stop_loss_pct / 100.0;
    match side {
        Side::Buy => (entry * (1.0 + tp), entry * (1.0 - sl)),
        Side::Sell => (entry * (1.0 - tp), entry * (1.0 + sl)),
    }
}

impl Order {
    /// Place an order. Limit orders are offset from the reference by
    /// `avg_swing * order_distance_pct`; with no swing history there is no
    /// offset to compute and nothing is placed.
    pub fn place(id: usize, req: &OrderRequest, params: &OrderParams) -> Option<Order> {
        if req.reference_price <= 0.0 || req.trade_size <= 0.0 {
            return None;
        }
        let price = match req.order_type {
            OrderType::Market => req.reference_price,
            OrderType::Limit => {
                if req.avg_swing_pct <= 0.0 {
                    return None;
                }
                let offset = req.reference_price * req.avg_swing_pct / 100.0 * params.order_distance_pct / 100.0;
                match req.side {
                    Side::Buy => req.reference_price - offset,
                    Side::Sell => req.reference_price + offset,
                }
            }
        };
        let status = if req.activation_time > req.placed_time {
            OrderStatus::PendingPrice
        } else {
            Self::active_status(req.order_type)
        };
        let (take_profit_price, stop_loss_price) = tp_sl(req.side, price, params);
        Some(Order {
            id,
            side: req.side,
            order_type: req.order_type,
            reference_price: req.reference_price,
            price,
            placed_time: req.placed_time,
            activation_time: req.activation_time,
            status,
            trade_size: req.trade_size,
            leverage: params.leverage,
            avg_swing_pct: req.avg_swing_pct,
            take_profit_price,
            stop_loss_price,
            fill_price: None,
            fill_time: None,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            entry_fee_pct: 0.0,
            exit_fee_pct: 0.0,
            funding_pct: 0.0,
            funding_slot: 0,
        })
    }

    fn active_status(order_type: OrderType) -> OrderStatus {
        match order_type {
            OrderType::Market => OrderStatus::Open,
            OrderType::Limit => OrderStatus::PendingLimit,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        !matches!(self.status, OrderStatus::Cancelled | OrderStatus::Closed)
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    #[inline]
    pub fn notional(&self) -> f64 {
        self.trade_size * self.leverage
    }

    /// Drive an unfilled order through one candle: activation, then
    /// cancellation, then fill.
    pub fn step_pending(
        &mut self,
        candle: &Candle,
        params: &OrderParams,
        costs: &CostModel,
        rng: &mut StdRng,
    ) -> PendingOutcome {
        if self.status == OrderStatus::PendingPrice {
            if candle.time < self.activation_time {
                return PendingOutcome::Waiting;
            }
            self.status = Self::active_status(self.order_type);
        }

        match self.status {
            OrderStatus::Open => {
                self.fill_market(candle, params, costs, rng);
                PendingOutcome::Filled
            }
            OrderStatus::PendingLimit => {
                if self.should_cancel(candle, params) {
                    self.status = OrderStatus::Cancelled;
                    self.exit_time = Some(candle.time);
                    return PendingOutcome::Cancelled;
                }
                let touched = match self.side {
                    Side::Buy => candle.low <= self.price,
                    Side::Sell => candle.high >= self.price,
                };
                if touched {
                    self.fill(candle.clamp(self.price), candle.time, FeeRole::Maker, params, costs);
                    PendingOutcome::Filled
                } else {
                    PendingOutcome::Waiting
                }
            }
            _ => PendingOutcome::Waiting,
        }
    }

    fn should_cancel(&self, candle: &Candle, params: &OrderParams) -> bool {
        if self.avg_swing_pct <= 0.0 {
            return false;
        }
        let distance = self.avg_swing_pct / 100.0 * params.cancel_threshold_pct / 100.0;
        match self.side {
            Side::Buy => candle.high >= self.reference_price * (1.0 + distance),
            Side::Sell => candle.low <= self.reference_price * (1.0 - distance),
        }
    }

    /// Fill at the candle close, slipped against the trader and kept inside
    /// the candle's range.
    pub fn fill_market(&mut self, candle: &Candle, params: &OrderParams, costs: &CostModel, rng: &mut StdRng) {
        let slipped = costs
            .slippage
            .apply(candle.close, self.side.is_long(), self.notional(), rng);
        self.fill(candle.clamp(slipped), candle.time, FeeRole::Taker, params, costs);
    }

    fn fill(&mut self, price: f64, time: i64, role: FeeRole, params: &OrderParams, costs: &CostModel) {
        let (tp, sl) = tp_sl(self.side, price, params);
        self.status = OrderStatus::Filled;
        self.fill_price = Some(price);
        self.fill_time = Some(time);
        self.take_profit_price = tp;
        self.stop_loss_price = sl;
        self.entry_fee_pct = costs.fees.role_pct(role);
        self.funding_slot = costs.funding.slot(time);
    }

    /// Evaluate exits for one candle after the fill candle. Stop-loss wins
    /// when both levels are inside the same candle; either one beats a
    /// timeout reached on the same candle.
    pub fn step_filled(
        &mut self,
        candle: &Candle,
        params: &OrderParams,
        costs: &CostModel,
        rng: &mut StdRng,
    ) -> Option<ExitReason> {
        let (Some(entry), Some(fill_time)) = (self.fill_price, self.fill_time) else {
            return None;
        };
        if self.status != OrderStatus::Filled || candle.time <= fill_time {
            return None;
        }

        let slot = costs.funding.slot(candle.time);
        if slot > self.funding_slot {
            self.funding_pct += costs.funding.accrue(slot - self.funding_slot, rng);
            self.funding_slot = slot;
        }

        self.update_excursions(entry, candle);

        let long = self.side.is_long();
        let (sl_hit, tp_hit) = if long {
            (candle.low <= self.stop_loss_price, candle.high >= self.take_profit_price)
        } else {
            (candle.high >= self.stop_loss_price, candle.low <= self.take_profit_price)
        };

        let exit = if sl_hit {
            // A gap through the stop fills at the open.
            let level = if long {
                self.stop_loss_price.min(candle.open)
            } else {
                self.stop_loss_price.max(candle.open)
            };
            Some((ExitReason::StopLoss, level))
        } else if tp_hit {
            Some((ExitReason::TakeProfit, self.take_profit_price))
        } else if params
            .max_trade_time_ms
            .is_some_and(|max| candle.time - fill_time >= max)
        {
            Some((ExitReason::Timeout, candle.close))
        } else {
            None
        };

        let (reason, level) = exit?;
        self.close_at(level, candle, reason, costs, rng);
        Some(reason)
    }

    fn update_excursions(&mut self, entry: f64, candle: &Candle) {
        if entry <= 0.0 {
            return;
        }
        let up = (candle.high - entry) / entry * 100.0;
        let down = (candle.low - entry) / entry * 100.0;
        let (favorable, adverse) = match self.side {
            Side::Buy => (up, down),
            Side::Sell => (-down, -up),
        };
        self.max_favorable_excursion = self.max_favorable_excursion.max(favorable);
        self.max_adverse_excursion = self.max_adverse_excursion.min(adverse);
    }

    fn close_at(&mut self, level: f64, candle: &Candle, reason: ExitReason, costs: &CostModel, rng: &mut StdRng) {
        // The exit trade is the opposite side of the position.
        let buying = !self.side.is_long();
        let slipped = costs.slippage.apply(level, buying, self.notional(), rng);
        self.status = OrderStatus::Closed;
        self.exit_price = Some(candle.clamp(slipped));
        self.exit_time = Some(candle.time);
        self.exit_reason = Some(reason);
        self.exit_fee_pct = costs.fees.role_pct(reason.fee_role());
    }

    /// Close a filled position at the candle close (end of data, manual).
    pub fn force_close(&mut self, candle: &Candle, reason: ExitReason, costs: &CostModel, rng: &mut StdRng) {
        if self.status != OrderStatus::Filled {
            return;
        }
        if let Some(entry) = self.fill_price {
            if self.fill_time.is_some_and(|t| candle.time > t) {
                self.update_excursions(entry, candle);
            }
        }
        self.close_at(candle.close, candle, reason, costs, rng);
    }

    /// Cancel an order that never filled.
    pub fn cancel(&mut self, time: i64) {
        if matches!(
            self.status,
            OrderStatus::Open | OrderStatus::PendingLimit | OrderStatus::PendingPrice
        ) {
            self.status = OrderStatus::Cancelled;
            self.exit_time = Some(time);
        }
    }

    /// Settle a closed order against the ledger.
    pub fn settle(self, capital_before: f64) -> Option<Trade> {
        let (entry, exit) = (self.fill_price?, self.exit_price?);
        let (fill_time, exit_time) = (self.fill_time?, self.exit_time?);
        let ret = accounting::trade_return(
            self.side.is_long(),
            entry,
            exit,
            self.leverage,
            self.entry_fee_pct,
            self.exit_fee_pct,
            self.funding_pct,
        );
        let s = accounting::settle(capital_before, self.trade_size, ret.return_pct);
        Some(Trade {
            pnl_percent: s.pnl_percent,
            pnl_value: s.pnl_value,
            capital_before: s.capital_before,
            capital_after: s.capital_after,
            max_favorable_excursion: self.max_favorable_excursion,
            max_adverse_excursion: self.max_adverse_excursion,
            duration_ms: exit_time - fill_time,
            order: self,
        })
    }
}
