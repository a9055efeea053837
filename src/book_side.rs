//! One side of an order book: a price-sorted ladder of FIFO queues plus an
//! id index for O(log P) cancel.
//!
//! Bids iterate highest price first, asks lowest first. Within a price
//! level the queue order is arrival order. `best` lazily discards terminal
//! or empty heads, so a returned order always has positive remaining
//! quantity and an active status.

use crate::types::{Order, OrderId, Quantity, Side};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Price ladder for one side of one symbol. Owns its resting orders.
#[derive(Debug)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<Decimal, VecDeque<OrderId>>,
    orders: HashMap<OrderId, Order>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
            orders: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.orders.contains_key(&order_id)
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn order_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&order_id)
    }

    /// Rests `order` at the tail of its price level's FIFO.
    pub fn insert(&mut self, order: Order) {
        debug_assert_eq!(order.side, self.side);
        debug_assert!(order.remaining > 0 && order.is_active());
        self.levels
            .entry(order.price)
            .or_default()
            .push_back(order.order_id);
        self.orders.insert(order.order_id, order);
    }

    /// Removes an order from its level queue and the index. Returns the
    /// removed order, or `None` if it is not resting here.
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&order_id)?;
        if let Some(queue) = self.levels.get_mut(&order.price) {
            queue.retain(|id| *id != order_id);
            if queue.is_empty() {
                self.levels.remove(&order.price);
            }
        }
        Some(order)
    }

    /// The first active order at the best price, discarding terminal or
    /// zero-remainder heads along the way.
    pub fn best_id(&mut self) -> Option<OrderId> {
        loop {
            let price = *match self.side {
                Side::Buy => self.levels.keys().next_back()?,
                Side::Sell => self.levels.keys().next()?,
            };
            let queue = self.levels.get_mut(&price)?;
            while let Some(head) = queue.front().copied() {
                match self.orders.get(&head) {
                    Some(o) if o.is_active() && o.remaining > 0 => return Some(head),
                    _ => {
                        queue.pop_front();
                        self.orders.remove(&head);
                    }
                }
            }
            self.levels.remove(&price);
        }
    }

    pub fn best(&mut self) -> Option<&Order> {
        let id = self.best_id()?;
        self.orders.get(&id)
    }

    /// Price of the best active order.
    pub fn best_price(&mut self) -> Option<Decimal> {
        let id = self.best_id()?;
        self.orders.get(&id).map(|o| o.price)
    }

    /// Active quantity at the best price level.
    pub fn best_quantity(&mut self) -> Quantity {
        match self.best_price() {
            Some(price) => self.quantity_at(price),
            None => 0,
        }
    }

    /// Up to `levels` aggregated `(price, active quantity)` pairs from the
    /// best price inward.
    pub fn depth(&self, levels: usize) -> Vec<(Decimal, Quantity)> {
        let mut out = Vec::with_capacity(levels.min(self.levels.len()));
        let prices: Box<dyn Iterator<Item = &Decimal> + '_> = match self.side {
            Side::Buy => Box::new(self.levels.keys().rev()),
            Side::Sell => Box::new(self.levels.keys()),
        };
        for &price in prices {
            if out.len() >= levels {
                break;
            }
            let qty = self.quantity_at(price);
            if qty > 0 {
                out.push((price, qty));
            }
        }
        out
    }

    /// Total active quantity available at `limit` or better, for FOK
    /// pre-scans. `None` means any price (market aggressor).
    pub fn available_at_or_better(&self, limit: Option<Decimal>) -> Quantity {
        self.levels
            .iter()
            .filter(|(price, _)| match (self.side, limit) {
                (_, None) => true,
                // A buy aggressor takes asks priced at or below its limit;
                // a sell aggressor takes bids at or above.
                (Side::Sell, Some(l)) => **price <= l,
                (Side::Buy, Some(l)) => **price >= l,
            })
            .flat_map(|(_, queue)| queue.iter())
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.is_active())
            .map(|o| o.remaining)
            .sum()
    }

    /// Total active resting quantity on this side.
    pub fn total_quantity(&self) -> Quantity {
        self.orders
            .values()
            .filter(|o| o.is_active())
            .map(|o| o.remaining)
            .sum()
    }

    /// All resting orders, unordered.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    fn quantity_at(&self, price: Decimal) -> Quantity {
        self.levels
            .get(&price)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| self.orders.get(id))
                    .filter(|o| o.is_active())
                    .map(|o| o.remaining)
                    .sum()
            })
            .unwrap_or(0)
    }
}
