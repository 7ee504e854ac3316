//! Saga coordination on top of the workflow engine.
//!
//! A [`SagaDefinition`] is an ordered list of steps, each a forward
//! activity with an optional compensation. [`SagaCoordinator`] runs the
//! steps in order and, on the first terminal failure or an observed
//! cancellation, compensates the completed steps in reverse order.
//! [`SagaWorkflow`] makes a definition runnable by the engine.
//!
//! The order fulfillment saga:
//! 1. Debit payment (compensated by a refund)
//! 2. Ship the order

pub mod coordinator;
pub mod definition;
pub mod error;
pub mod order_fulfillment;
pub mod services;
pub mod state;

pub use coordinator::{SagaCoordinator, SagaOutcome, SagaWorkflow};
pub use definition::{ActivitySpec, SagaDefinition, Step, StepOutcome};
pub use error::{Result, SagaError};
pub use order_fulfillment::{OrderFulfillmentConfig, OrderInput};
pub use services::{
    InMemoryPaymentService, InMemoryShippingService, Payment, PaymentService, Shipment,
    ShippingService, payment_worker, shipping_worker,
};
pub use state::{SagaRunState, SagaState};
