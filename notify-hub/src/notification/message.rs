//! Display text for notifications.
//!
//! Message text is opaque to the engine. Producers usually send a ready
//! `message`; when they don't, a [`MessageComposer`] fills one in from the
//! payload fields.

use super::envelope::EventEnvelope;

/// Produces the display text for an accepted event.
pub trait MessageComposer: Send + Sync {
    fn compose(&self, envelope: &EventEnvelope) -> String;
}

/// Uses the payload's `message` when present, otherwise a short per-kind line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultComposer;

impl MessageComposer for DefaultComposer {
    fn compose(&self, envelope: &EventEnvelope) -> String {
        if let Some(message) = envelope.str_field("message") {
            return message.to_string();
        }

        let field = |key: &str| {
            envelope
                .id_field(key)
                .unwrap_or_else(|| "unknown".to_string())
        };

        match envelope.kind.as_str() {
            "order.created" => format!("New order #{}", field("orderNumber")),
            "order.statusChanged" => {
                format!("Order {} is now {}", field("orderId"), field("status"))
            }
            "task.assigned" => format!(
                "New task: {} x {}",
                field("quantity"),
                envelope.str_field("productName").unwrap_or("item")
            ),
            "task.started" => format!("Task {} started", field("taskId")),
            "task.completed" => format!("Task {} completed", field("taskId")),
            "return.created" => format!("New return {}", field("returnId")),
            "return.statusChanged" => {
                format!("Return {} {}", field("returnId"), field("status"))
            }
            "sale.created" => format!("New sale {}", field("saleId")),
            other => format!("Notification: {}", other),
        }
    }
}
