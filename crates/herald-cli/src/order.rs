//! The order event published by `herald produce-order`

use herald_client::DeliveryReport;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user: String,
    pub item: String,
    pub quantity: u32,
}

impl Order {
    /// A new order with a random id
    pub fn new(user: impl Into<String>, item: impl Into<String>, quantity: u32) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            user: user.into(),
            item: item.into(),
            quantity,
        }
    }
}

/// Log the outcome of one delivery
pub fn delivery_report(report: DeliveryReport) {
    match report.error() {
        Some(err) => error!("Delivery failed: {}", err),
        None => {
            info!(
                "Successfully delivered: {}",
                String::from_utf8_lossy(&report.value)
            );
            info!(
                "Delivered to topic: {} : partition {} : at offset {}",
                report.topic,
                report.partition().unwrap_or_default(),
                report.offset().unwrap_or_default()
            );
        }
    }
}
