use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::ledger::models::{Amount, Currency};

/// A request for `amount_due` of `currency` to be paid to `owner`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub currency: Currency,
    pub amount_due: Amount,
    pub owner: Uuid,
    /// Platform username of the expected payer, enables an internal route
    pub payer_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn new(owner: Uuid, currency: Currency, amount_due: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            currency,
            amount_due,
            owner,
            payer_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_payer(mut self, payer_ref: &str) -> Self {
        self.payer_ref = Some(payer_ref.to_string());
        self
    }
}

/// Half-open block range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub start: u64,
    pub end: u64,
}

impl BlockWindow {
    pub fn new(start: u64, lifetime: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(lifetime),
        }
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.start <= block_number && block_number < self.end
    }

    pub fn overlaps(&self, other: &BlockWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_expired(&self, head: u64) -> bool {
        head >= self.end
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Internal,
    Blockchain,
    Channel,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Internal => "internal",
            RouteKind::Blockchain => "blockchain",
            RouteKind::Channel => "channel",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rail-specific part of a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RouteDetails {
    Internal { payer: Uuid },
    Blockchain { chain_id: u64, account: String, window: BlockWindow },
    Channel { node: String, identifier: u64, window: TimeWindow },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRoute {
    pub id: Uuid,
    pub order_id: Uuid,
    pub details: RouteDetails,
    pub created_at: DateTime<Utc>,
}

impl PaymentRoute {
    pub fn new(order_id: Uuid, details: RouteDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            details,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RouteKind {
        match self.details {
            RouteDetails::Internal { .. } => RouteKind::Internal,
            RouteDetails::Blockchain { .. } => RouteKind::Blockchain,
            RouteDetails::Channel { .. } => RouteKind::Channel,
        }
    }

    /// Rail key a payer must use: account address, channel identifier or payer id
    pub fn identifier(&self) -> String {
        match &self.details {
            RouteDetails::Internal { payer } => payer.to_string(),
            RouteDetails::Blockchain { account, .. } => account.clone(),
            RouteDetails::Channel { identifier, .. } => identifier.to_string(),
        }
    }

    /// Internal routes never expire. `head` is the route chain's head, if known.
    pub fn is_expired(&self, head: Option<u64>, now: DateTime<Utc>) -> bool {
        match &self.details {
            RouteDetails::Internal { .. } => false,
            RouteDetails::Blockchain { window, .. } => head.map_or(false, |h| window.is_expired(h)),
            RouteDetails::Channel { window, .. } => window.is_expired(now),
        }
    }
}

/// Rail-specific part of a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PaymentDetails {
    Blockchain {
        chain_id: u64,
        tx_hash: String,
        block_hash: String,
        block_number: u64,
        sender: String,
    },
    Channel {
        node: String,
        sender: String,
        identifier: u64,
    },
    Internal {
        payer: Uuid,
        transfer_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub route_id: Uuid,
    pub amount: Amount,
    pub currency: Currency,
    /// Unique per rail: tx hash, channel event key or transfer id
    pub rail_identifier: String,
    pub observed_at: DateTime<Utc>,
    pub details: PaymentDetails,
}

impl Payment {
    pub fn block_number(&self) -> Option<u64> {
        match &self.details {
            PaymentDetails::Blockchain { block_number, .. } => Some(*block_number),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl PaymentConfirmation {
    pub fn for_payment(payment_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Paid,
    Confirmed,
    Expired,
}

/// Derived view of an order, recomputed on every read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_paid: Amount,
    pub total_confirmed: Amount,
}

impl OrderSummary {
    /// Orders without routes are still open: nothing can expire them.
    pub fn compute(
        order: &PaymentOrder,
        routes: &[PaymentRoute],
        payments: &[Payment],
        confirmed: &HashSet<Uuid>,
        head: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_paid: Amount = payments.iter().map(|p| p.amount).sum();
        let total_confirmed: Amount = payments
            .iter()
            .filter(|p| confirmed.contains(&p.id))
            .map(|p| p.amount)
            .sum();

        let status = if total_confirmed >= order.amount_due {
            OrderStatus::Confirmed
        } else if total_paid >= order.amount_due {
            OrderStatus::Paid
        } else if !routes.is_empty() && routes.iter().all(|r| r.is_expired(head, now)) {
            OrderStatus::Expired
        } else {
            OrderStatus::Open
        };

        Self {
            order_id: order.id,
            status,
            total_paid,
            total_confirmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order(amount_due: Amount) -> PaymentOrder {
        PaymentOrder::new(Uuid::new_v4(), Currency::native(1, "ETH", 18), amount_due)
    }

    fn blockchain_route(order: &PaymentOrder, start: u64, end: u64) -> PaymentRoute {
        PaymentRoute::new(
            order.id,
            RouteDetails::Blockchain {
                chain_id: 1,
                account: "0xabc".into(),
                window: BlockWindow { start, end },
            },
        )
    }

    fn payment(order: &PaymentOrder, route: &PaymentRoute, amount: Amount) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            order_id: order.id,
            route_id: route.id,
            amount,
            currency: order.currency.clone(),
            rail_identifier: format!("0x{}", Uuid::new_v4().simple()),
            observed_at: Utc::now(),
            details: PaymentDetails::Blockchain {
                chain_id: 1,
                tx_hash: "0x01".into(),
                block_hash: "0x02".into(),
                block_number: 120,
                sender: "0xpayer".into(),
            },
        }
    }

    #[test]
    fn test_block_window_bounds() {
        let window = BlockWindow::new(100, 50);
        assert_eq!(window.end, 150);
        assert!(window.contains(100));
        assert!(window.contains(149));
        assert!(!window.contains(150));
        assert!(window.overlaps(&BlockWindow::new(110, 50)));
        assert!(!window.overlaps(&BlockWindow::new(150, 50)));
        assert!(!window.is_expired(149));
        assert!(window.is_expired(150));
    }

    #[test]
    fn test_time_window_expiry() {
        let now = Utc::now();
        let window = TimeWindow {
            start: now,
            end: now + Duration::seconds(900),
        };
        assert!(window.contains(now));
        assert!(!window.is_expired(now + Duration::seconds(899)));
        assert!(window.is_expired(now + Duration::seconds(900)));
    }

    #[test]
    fn test_status_progression() {
        let order = order(10);
        let route = blockchain_route(&order, 100, 150);
        let routes = vec![route.clone()];
        let now = Utc::now();

        let summary = OrderSummary::compute(&order, &routes, &[], &HashSet::new(), Some(110), now);
        assert_eq!(summary.status, OrderStatus::Open);

        let paid = payment(&order, &route, 10);
        let payments = vec![paid.clone()];
        let summary =
            OrderSummary::compute(&order, &routes, &payments, &HashSet::new(), Some(124), now);
        assert_eq!(summary.status, OrderStatus::Paid);
        assert_eq!(summary.total_paid, 10);

        let confirmed: HashSet<Uuid> = [paid.id].into_iter().collect();
        let summary = OrderSummary::compute(&order, &routes, &payments, &confirmed, Some(125), now);
        assert_eq!(summary.status, OrderStatus::Confirmed);
        assert_eq!(summary.total_confirmed, 10);
    }

    #[test]
    fn test_status_expired_only_when_unpaid() {
        let order = order(10);
        let route = blockchain_route(&order, 100, 150);
        let routes = vec![route.clone()];
        let now = Utc::now();

        let summary = OrderSummary::compute(&order, &routes, &[], &HashSet::new(), Some(150), now);
        assert_eq!(summary.status, OrderStatus::Expired);

        // A partial payment does not keep the order alive once its routes are gone
        let partial = vec![payment(&order, &route, 4)];
        let summary =
            OrderSummary::compute(&order, &routes, &partial, &HashSet::new(), Some(150), now);
        assert_eq!(summary.status, OrderStatus::Expired);

        let full = vec![payment(&order, &route, 10)];
        let summary =
            OrderSummary::compute(&order, &routes, &full, &HashSet::new(), Some(150), now);
        assert_eq!(summary.status, OrderStatus::Paid);
    }

    #[test]
    fn test_order_without_routes_stays_open() {
        let order = order(10);
        let summary =
            OrderSummary::compute(&order, &[], &[], &HashSet::new(), Some(1000), Utc::now());
        assert_eq!(summary.status, OrderStatus::Open);
    }
}
