//! In-process order services: inventory, payment and shipping.
//!
//! Each service derives its ids from the task's idempotency key, so a task
//! re-executed after a crash upserts the same reservation, transaction or
//! shipment instead of creating a second one. Failure behaviour is driven
//! by [`OrderSettings`] so demos and tests can exercise every saga path.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::RegistryBuilder;
use crate::domain::{TaskFailure, TaskResult};
use crate::saga::order::{
    Order, COMPENSATE_INVENTORY, CREATE_SHIPMENT, PROCESS_PAYMENT, REFUND_PAYMENT,
    RESERVE_INVENTORY,
};

use super::{decode, encode, ActivityContext};

/// Simulation knobs for the order services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSettings {
    /// Units available per product id; products not listed are unlimited
    #[serde(default)]
    pub stock: HashMap<String, u32>,

    /// Payments above this amount are declined
    #[serde(default)]
    pub payment_limit: Option<f64>,

    /// Every shipment request fails
    #[serde(default)]
    pub shipping_unavailable: bool,

    /// Every refund request fails
    #[serde(default)]
    pub refunds_unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub order_id: String,
    pub quantities: BTreeMap<String, u32>,
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub transaction_id: String,
    pub order_id: String,
    pub customer_id: String,
    pub amount: f64,
    pub refunded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub tracking_id: String,
    pub order_id: String,
}

#[derive(Debug, Default)]
struct Ledger {
    stock: HashMap<String, u32>,
    reservations: BTreeMap<String, Reservation>,
    payments: BTreeMap<String, Payment>,
    shipments: BTreeMap<String, Shipment>,
    invocations: HashMap<String, u32>,
}

/// Shared state behind the order activities
#[derive(Debug, Clone)]
pub struct OrderServices {
    settings: OrderSettings,
    ledger: Arc<Mutex<Ledger>>,
}

impl OrderServices {
    pub fn new(settings: OrderSettings) -> Self {
        let ledger = Ledger {
            stock: settings.stock.clone(),
            ..Ledger::default()
        };
        Self {
            settings,
            ledger: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Register the five order activities on a registry builder
    pub fn register(&self, builder: RegistryBuilder) -> RegistryBuilder {
        let reserve = self.clone();
        let release = self.clone();
        let pay = self.clone();
        let refund = self.clone();
        let ship = self.clone();

        builder
            .activity_fn(RESERVE_INVENTORY, move |ctx, input| {
                let services = reserve.clone();
                async move { services.reserve_inventory(&ctx, input) }
            })
            .activity_fn(COMPENSATE_INVENTORY, move |ctx, input| {
                let services = release.clone();
                async move { services.release_inventory(&ctx, input) }
            })
            .activity_fn(PROCESS_PAYMENT, move |ctx, input| {
                let services = pay.clone();
                async move { services.process_payment(&ctx, input) }
            })
            .activity_fn(REFUND_PAYMENT, move |ctx, input| {
                let services = refund.clone();
                async move { services.refund_payment(&ctx, input) }
            })
            .activity_fn(CREATE_SHIPMENT, move |ctx, input| {
                let services = ship.clone();
                async move { services.create_shipment(&ctx, input) }
            })
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn count(&self, ledger: &mut Ledger, activity: &str) {
        *ledger.invocations.entry(activity.to_string()).or_default() += 1;
    }

    /// How many times an activity was invoked
    pub fn invocations(&self, activity: &str) -> u32 {
        self.ledger().invocations.get(activity).copied().unwrap_or(0)
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.ledger().reservations.values().cloned().collect()
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.ledger().payments.values().cloned().collect()
    }

    pub fn shipments(&self) -> Vec<Shipment> {
        self.ledger().shipments.values().cloned().collect()
    }

    /// Remaining stock for a product, `None` when unlimited
    pub fn stock(&self, product_id: &str) -> Option<u32> {
        self.ledger().stock.get(product_id).copied()
    }

    fn reserve_inventory(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let order: Order = decode(input)?;
        let mut ledger = self.ledger();
        self.count(&mut ledger, RESERVE_INVENTORY);

        if order.id.trim().is_empty() {
            return Err(TaskFailure::business("Order id is required."));
        }
        if order.items.is_empty() {
            return Err(TaskFailure::business(format!("Order {} has no items.", order.id)));
        }

        let reservation_id = ctx.stable_id("INV");
        if ledger.reservations.contains_key(&reservation_id) {
            return encode(&reservation_id);
        }

        let mut quantities: BTreeMap<String, u32> = BTreeMap::new();
        for item in &order.items {
            let total = quantities.entry(item.product_id.clone()).or_default();
            *total = total.checked_add(item.quantity).ok_or_else(|| {
                TaskFailure::business(format!("Quantity for product {} is too large.", item.product_id))
            })?;
        }

        for (product_id, requested) in &quantities {
            if let Some(available) = ledger.stock.get(product_id) {
                if requested > available {
                    return Err(TaskFailure::business(format!(
                        "Insufficient stock for product {}: requested {}, available {}",
                        product_id, requested, available
                    )));
                }
            }
        }

        for (product_id, requested) in &quantities {
            if let Some(available) = ledger.stock.get_mut(product_id) {
                *available -= requested;
            }
        }

        info!(order_id = %order.id, %reservation_id, items = order.items.len(), "Reserved inventory");
        ledger.reservations.insert(
            reservation_id.clone(),
            Reservation {
                reservation_id: reservation_id.clone(),
                order_id: order.id,
                quantities,
                released: false,
            },
        );

        encode(&reservation_id)
    }

    fn release_inventory(&self, _ctx: &ActivityContext, input: Value) -> TaskResult {
        let reservation_id: String = decode(input)?;
        let mut ledger = self.ledger();
        self.count(&mut ledger, COMPENSATE_INVENTORY);

        let Some(reservation) = ledger.reservations.get_mut(&reservation_id) else {
            return Err(TaskFailure::business(format!("Unknown reservation {}", reservation_id)));
        };
        if reservation.released {
            return Ok(Value::Null);
        }
        reservation.released = true;
        let quantities = reservation.quantities.clone();

        for (product_id, quantity) in quantities {
            if let Some(available) = ledger.stock.get_mut(&product_id) {
                *available += quantity;
            }
        }

        info!(%reservation_id, "Released inventory reservation as part of saga compensation");
        Ok(Value::Null)
    }

    fn process_payment(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let order: Order = decode(input)?;
        let mut ledger = self.ledger();
        self.count(&mut ledger, PROCESS_PAYMENT);

        if order.customer_id.trim().is_empty() {
            return Err(TaskFailure::business("Customer id is required."));
        }
        let amount = order.total_amount();
        if amount <= 0.0 {
            return Err(TaskFailure::business("Payment amount must be positive."));
        }
        if let Some(limit) = self.settings.payment_limit {
            if amount > limit {
                return Err(TaskFailure::business(format!(
                    "Payment declined: amount {:.2} exceeds limit {:.2}",
                    amount, limit
                )));
            }
        }

        let transaction_id = ctx.stable_id("TXN");
        ledger
            .payments
            .entry(transaction_id.clone())
            .or_insert_with(|| Payment {
                transaction_id: transaction_id.clone(),
                order_id: order.id.clone(),
                customer_id: order.customer_id.clone(),
                amount,
                refunded: false,
            });

        info!(order_id = %order.id, %transaction_id, amount, "Processed payment");
        encode(&transaction_id)
    }

    fn refund_payment(&self, _ctx: &ActivityContext, input: Value) -> TaskResult {
        let transaction_id: String = decode(input)?;
        let mut ledger = self.ledger();
        self.count(&mut ledger, REFUND_PAYMENT);

        if self.settings.refunds_unavailable {
            warn!(%transaction_id, "Refund service unavailable");
            return Err(TaskFailure::transient("Refund service unavailable"));
        }

        let Some(payment) = ledger.payments.get_mut(&transaction_id) else {
            return Err(TaskFailure::business(format!("Unknown transaction {}", transaction_id)));
        };
        payment.refunded = true;

        info!(%transaction_id, "Refunded payment as part of saga compensation");
        Ok(Value::Null)
    }

    fn create_shipment(&self, ctx: &ActivityContext, input: Value) -> TaskResult {
        let order: Order = decode(input)?;
        let mut ledger = self.ledger();
        self.count(&mut ledger, CREATE_SHIPMENT);

        if self.settings.shipping_unavailable {
            return Err(TaskFailure::business("No carrier available for this order"));
        }

        let tracking_id = ctx.stable_id("SHIP");
        ledger
            .shipments
            .entry(tracking_id.clone())
            .or_insert_with(|| Shipment {
                tracking_id: tracking_id.clone(),
                order_id: order.id.clone(),
            });

        info!(order_id = %order.id, %tracking_id, "Created shipment");
        encode(&tracking_id)
    }
}
