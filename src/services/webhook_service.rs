use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DbErr, EntityTrait};
use uuid::Uuid;

use crate::{
    entity::webhook_events::{ActiveModel as WebhookEventActive, Column as EventCol, Entity as WebhookEvents},
    error::AppResult,
    models::OrderStatus,
    payments::{GatewayEvent, construct_event},
    response::{ApiResponse, Meta},
    services::order_service,
    state::AppState,
};

/// Reconcile one signed gateway event against order state.
///
/// A bad signature propagates as a 401 so the gateway retries. Everything
/// past the signature check is acknowledged with 200 even when processing
/// fails: the gateway must stop redelivering, and per-event failures are
/// logged instead of surfaced.
pub async fn handle_gateway_event(
    state: &AppState,
    payload: &[u8],
    signature_header: &str,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let event = construct_event(payload, signature_header, &state.config.stripe_webhook_secret)?;

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "gateway event received");

    // Delivery is at-least-once; a previously seen event id is acknowledged
    // and skipped so notifications are never re-sent.
    if !record_event(state, &event).await? {
        tracing::info!(event_id = %event.id, "duplicate gateway event skipped");
        return Ok(acknowledged());
    }

    match event.event_type.as_str() {
        "payment_intent.succeeded" => handle_payment_succeeded(state, &event).await,
        "payment_intent.payment_failed" => handle_payment_failed(state, &event).await,
        "charge.refunded" => handle_refund(state, &event).await,
        other => {
            tracing::info!(event_type = %other, "unhandled gateway event type");
        }
    }

    Ok(acknowledged())
}

async fn handle_payment_succeeded(state: &AppState, event: &GatewayEvent) {
    let Some(order_id) = order_id_from(event) else {
        return;
    };

    match order_service::set_order_status(state, order_id, OrderStatus::Processing).await {
        Ok((order, changed)) => {
            if changed {
                if let Some(email) = event.data.object.metadata.user_email.as_deref() {
                    state
                        .notifier
                        .send_order_confirmation(email, &order.order_number, order.total_amount)
                        .await;
                }
            }
        }
        Err(err) => {
            tracing::error!(%order_id, error = %err, "failed to mark order as processing");
        }
    }
}

async fn handle_payment_failed(state: &AppState, event: &GatewayEvent) {
    let Some(order_id) = order_id_from(event) else {
        return;
    };

    if let Err(err) = order_service::set_order_status(state, order_id, OrderStatus::Cancelled).await
    {
        tracing::error!(%order_id, error = %err, "failed to cancel order after payment failure");
    }
}

async fn handle_refund(state: &AppState, event: &GatewayEvent) {
    let Some(order_id) = order_id_from(event) else {
        return;
    };

    match order_service::set_order_status(state, order_id, OrderStatus::Refunded).await {
        Ok((order, changed)) => {
            if changed {
                let metadata = &event.data.object.metadata;
                if let Some(email) = metadata.user_email.as_deref() {
                    let amount = refunded_amount(event).unwrap_or(order.total_amount);
                    let order_number = metadata
                        .order_number
                        .as_deref()
                        .unwrap_or(&order.order_number);
                    state
                        .notifier
                        .send_refund_confirmation(email, order_number, amount)
                        .await;
                }
            }
        }
        Err(err) => {
            tracing::error!(%order_id, error = %err, "failed to mark order as refunded");
        }
    }
}

// The gateway reports refunds in minor currency units.
fn refunded_amount(event: &GatewayEvent) -> Option<Decimal> {
    event
        .data
        .object
        .amount_refunded
        .map(|cents| Decimal::from(cents) / Decimal::from(100))
}

// Unparseable metadata drops the event (logged, acknowledged, not retried).
fn order_id_from(event: &GatewayEvent) -> Option<Uuid> {
    let raw = match event.data.object.metadata.order_id.as_deref() {
        Some(raw) => raw,
        None => {
            tracing::warn!(event_id = %event.id, "gateway event has no order_id metadata");
            return None;
        }
    };
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(event_id = %event.id, order_id = raw, "unparseable order id in event metadata");
            None
        }
    }
}

/// Insert the event id into the dedup ledger. Returns false when the id was
/// already recorded.
async fn record_event(state: &AppState, event: &GatewayEvent) -> AppResult<bool> {
    let active = WebhookEventActive {
        id: Set(event.id.clone()),
        event_type: Set(event.event_type.clone()),
        received_at: Set(Utc::now().into()),
    };
    let insert = WebhookEvents::insert(active)
        .on_conflict(OnConflict::column(EventCol::Id).do_nothing().to_owned())
        .exec(&state.orm)
        .await;
    match insert {
        Ok(_) => Ok(true),
        Err(DbErr::RecordNotInserted) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn acknowledged() -> ApiResponse<serde_json::Value> {
    ApiResponse::success("ok", serde_json::json!({}), Some(Meta::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_metadata(order_id: Option<&str>) -> GatewayEvent {
        let metadata = match order_id {
            Some(id) => format!(r#"{{"order_id":"{id}"}}"#),
            None => "{}".to_string(),
        };
        let payload = format!(
            r#"{{"id":"evt_1","type":"payment_intent.succeeded","data":{{"object":{{"id":"pi_1","metadata":{metadata}}}}}}}"#
        );
        serde_json::from_str(&payload).unwrap()
    }

    #[test]
    fn order_id_parses_from_metadata() {
        let id = Uuid::new_v4();
        let event = event_with_metadata(Some(&id.to_string()));
        assert_eq!(order_id_from(&event), Some(id));
    }

    #[test]
    fn missing_or_garbage_order_id_drops_the_event() {
        assert_eq!(order_id_from(&event_with_metadata(None)), None);
        assert_eq!(order_id_from(&event_with_metadata(Some("not-a-uuid"))), None);
    }

    #[test]
    fn refund_amount_converts_from_minor_units() {
        let payload = r#"{"id":"evt_2","type":"charge.refunded","data":{"object":{"id":"ch_1","amount_refunded":6175}}}"#;
        let event: GatewayEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(
            refunded_amount(&event),
            Some(rust_decimal_macros::dec!(61.75))
        );
    }
}
