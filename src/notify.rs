use async_trait::async_trait;
use rust_decimal::Decimal;

/// Outbound customer notifications. Fire-and-forget from the core's point of
/// view: implementations handle (and log) their own failures, callers never
/// treat a missed email as a checkout or reconciliation failure.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_order_confirmation(&self, email: &str, order_number: &str, total: Decimal);

    async fn send_refund_confirmation(&self, email: &str, order_number: &str, amount: Decimal);
}

/// Default dispatcher that writes notifications to the log. The real email
/// transport lives outside this service.
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn send_order_confirmation(&self, email: &str, order_number: &str, total: Decimal) {
        tracing::info!(%email, order_number, %total, "order confirmation sent");
    }

    async fn send_refund_confirmation(&self, email: &str, order_number: &str, amount: Decimal) {
        tracing::info!(%email, order_number, %amount, "refund confirmation sent");
    }
}
