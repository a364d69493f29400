//! Order fulfillment saga.
//!
//! Steps and their compensations:
//! 1. ReserveInventory -> CompensateInventory (reservation id)
//! 2. ProcessPayment   -> RefundPayment (transaction id)
//! 3. CreateShipment   (nothing to undo; its token is the tracking id)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::{decode_input, encode_output, Interrupt, Orchestration, OrchestrationContext};

use super::coordinator::{run_saga, CompensationFailure};
use super::definition::{SagaDefinition, SagaStep};

pub const ORDER_SAGA: &str = "OrderSagaOrchestrator";

pub const RESERVE_INVENTORY: &str = "ReserveInventory";
pub const COMPENSATE_INVENTORY: &str = "CompensateInventory";
pub const PROCESS_PAYMENT: &str = "ProcessPayment";
pub const REFUND_PAYMENT: &str = "RefundPayment";
pub const CREATE_SHIPMENT: &str = "CreateShipment";

/// A customer order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,

    #[serde(default)]
    pub status: OrderStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Order {
    pub fn new(id: impl Into<String>, customer_id: impl Into<String>, items: Vec<OrderItem>) -> Self {
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            items,
            status: OrderStatus::Pending,
            created_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// Sum of quantity x unit price over all items
    pub fn total_amount(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.quantity as f64 * item.unit_price)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl OrderItem {
    pub fn new(product_id: impl Into<String>, product_name: impl Into<String>, quantity: u32, unit_price: f64) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            unit_price,
        }
    }
}

/// Lifecycle of an order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    InventoryReserved,
    PaymentProcessed,
    Shipped,
    Completed,
    Failed,
    Compensating,
    Cancelled,
}

/// Final disposition of an order saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub is_success: bool,
    pub order_id: String,
    pub final_status: OrderStatus,

    #[serde(default)]
    pub tracking_id: Option<String>,

    #[serde(default)]
    pub failure_step: Option<String>,

    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Compensation activities that ran, in order
    #[serde(default)]
    pub compensated_steps: Vec<String>,

    /// Compensations that need manual intervention
    #[serde(default)]
    pub failed_compensations: Vec<CompensationFailure>,
}

/// The order saga's step list
pub fn order_saga_definition() -> SagaDefinition {
    SagaDefinition::new(
        ORDER_SAGA,
        vec![
            SagaStep::new(RESERVE_INVENTORY, RESERVE_INVENTORY)
                .with_compensation(COMPENSATE_INVENTORY)
                .with_label("Inventory reservation"),
            SagaStep::new(PROCESS_PAYMENT, PROCESS_PAYMENT)
                .with_compensation(REFUND_PAYMENT)
                .with_label("Payment processing"),
            SagaStep::new(CREATE_SHIPMENT, CREATE_SHIPMENT).with_label("Shipment creation"),
        ],
    )
}

/// Orchestration taking an [`Order`] and returning an [`OrderResult`]
pub struct OrderSagaOrchestration {
    definition: SagaDefinition,
}

impl Default for OrderSagaOrchestration {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderSagaOrchestration {
    pub fn new() -> Self {
        Self {
            definition: order_saga_definition(),
        }
    }
}

impl Orchestration for OrderSagaOrchestration {
    fn run(&self, ctx: &mut OrchestrationContext, input: Value) -> Result<Value, Interrupt> {
        let order: Order = decode_input(input)?;
        let order_input = encode_output(&order)?;

        if !ctx.is_replaying() {
            info!(order_id = %order.id, total = order.total_amount(), "Starting order saga");
        }

        let outcome = run_saga(ctx, &self.definition, &order.id, &order_input)?;
        let success = outcome.is_success();
        let state = outcome.into_state();

        let result = OrderResult {
            is_success: success,
            order_id: order.id,
            final_status: if success { OrderStatus::Completed } else { OrderStatus::Failed },
            tracking_id: if success {
                state
                    .token(CREATE_SHIPMENT)
                    .and_then(|token| token.as_str())
                    .map(str::to_string)
            } else {
                None
            },
            failure_step: state.failure_step,
            failure_reason: state.failure_reason,
            compensated_steps: state.compensation_activities,
            failed_compensations: state.failed_compensations,
        };

        encode_output(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_amount() {
        let order = Order::new(
            "o1",
            "c1",
            vec![
                OrderItem::new("p1", "Widget", 2, 10.0),
                OrderItem::new("p2", "Gadget", 1, 5.5),
            ],
        );
        assert!((order.total_amount() - 25.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_definition_shape() {
        let definition = order_saga_definition();
        assert!(definition.validate().is_ok());

        let compensations: Vec<Option<&str>> = definition
            .steps
            .iter()
            .map(|s| s.compensation.as_deref())
            .collect();
        assert_eq!(
            compensations,
            vec![Some(COMPENSATE_INVENTORY), Some(REFUND_PAYMENT), None]
        );
    }

    #[test]
    fn test_order_status_serialization() {
        let json = serde_json::to_string(&OrderStatus::InventoryReserved).unwrap();
        assert_eq!(json, "\"inventory_reserved\"");
    }
}
