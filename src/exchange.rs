pub mod binance;
pub mod upbit;

use error_stack::{Report, bail};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::ExchangeError;
use crate::model::{Candle, ExchangeKind, Interval, OrderBook, Trade};

/// Abstraction over a cryptocurrency exchange.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn Exchange`).
pub trait Exchange: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Fetch up to `limit` historical candles via REST, oldest first.
    fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>>;

    /// Fetch the current order book via REST, truncated to `limit` levels.
    fn fetch_order_book(
        &self,
        symbol: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<OrderBook, Report<ExchangeError>>>;

    /// Open a streaming trade subscription for one market.
    ///
    /// The returned feed owns a pump task holding the WebSocket connection;
    /// dropping the feed tears the connection down.
    fn watch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<TradeFeed, Report<ExchangeError>>>;

    /// Open a throttled order-book subscription maintaining the latest
    /// snapshot for one market.
    fn watch_order_book(
        &self,
        symbol: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<OrderBookFeed, Report<ExchangeError>>>;
}

/// Handle to a live trade subscription.
pub struct TradeFeed {
    exchange: ExchangeKind,
    rx: mpsc::Receiver<Trade>,
    cancel: CancellationToken,
}

impl TradeFeed {
    pub fn new(
        exchange: ExchangeKind,
        rx: mpsc::Receiver<Trade>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exchange,
            rx,
            cancel,
        }
    }

    /// Await the next delivered trade and drain whatever else is already
    /// queued, preserving delivery order. Errors once the pump is gone.
    pub async fn next_batch(&mut self) -> Result<Vec<Trade>, Report<ExchangeError>> {
        let Some(first) = self.rx.recv().await else {
            bail!(ExchangeError::StreamClosed {
                exchange: self.exchange.to_string(),
            });
        };
        let mut batch = vec![first];
        while let Ok(trade) = self.rx.try_recv() {
            batch.push(trade);
        }
        Ok(batch)
    }
}

impl Drop for TradeFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a live order-book subscription holding the latest snapshot.
pub struct OrderBookFeed {
    rx: watch::Receiver<Option<OrderBook>>,
    cancel: CancellationToken,
}

impl OrderBookFeed {
    pub fn new(rx: watch::Receiver<Option<OrderBook>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Most recent snapshot, if one arrived yet.
    pub fn latest(&self) -> Option<OrderBook> {
        self.rx.borrow().clone()
    }

    /// False once the pump task has dropped its sender.
    pub fn is_alive(&self) -> bool {
        self.rx.has_changed().is_ok()
    }
}

impl Drop for OrderBookFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
