use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::{DbPool, OrmConn},
    notify::NotificationDispatcher,
    payments::PaymentGateway,
};

/// Shared application state. The payment gateway and notification dispatcher
/// are injected here once at startup; nothing reads ambient global config.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
    pub config: AppConfig,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}
