//! Payment and shipping activities and the workers that host them.

pub mod payment;
pub mod shipping;

use std::sync::Arc;

use activity::{ActivityDispatcher, Worker};

pub use payment::{InMemoryPaymentService, Payment, PaymentActivities, PaymentService};
pub use shipping::{
    InMemoryShippingService, Shipment, ShippingActivities, ShippingService,
    UNSHIPPABLE_PRODUCT_ID,
};

use crate::order_fulfillment::{DEBIT_PAYMENT, REFUND_PAYMENT, SHIP_ORDER};

/// A worker on `task_queue` serving `debitPayment` and `refundPayment`.
pub fn payment_worker<P>(
    task_queue: impl Into<String>,
    dispatcher: ActivityDispatcher,
    service: P,
    max_concurrency: usize,
) -> Worker
where
    P: PaymentService + 'static,
{
    let handler = Arc::new(PaymentActivities::new(service));
    Worker::new(task_queue, dispatcher)
        .register(DEBIT_PAYMENT, handler.clone())
        .register(REFUND_PAYMENT, handler)
        .with_max_concurrency(max_concurrency)
}

/// A worker on `task_queue` serving `shipOrder`.
pub fn shipping_worker<S>(
    task_queue: impl Into<String>,
    dispatcher: ActivityDispatcher,
    service: S,
    max_concurrency: usize,
) -> Worker
where
    S: ShippingService + 'static,
{
    Worker::new(task_queue, dispatcher)
        .register(SHIP_ORDER, Arc::new(ShippingActivities::new(service)))
        .with_max_concurrency(max_concurrency)
}
