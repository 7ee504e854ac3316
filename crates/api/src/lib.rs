//! HTTP front end and explicit bootstrap for the order fulfillment saga.
//!
//! [`bootstrap`] wires the workflow engine to a history store and starts
//! the payment and shipping workers. [`create_app`] exposes starting an
//! order, querying and cancelling executions, health and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::time::Duration;

use activity::{ActivityDispatcher, WorkerHandle};
use axum::Router;
use axum::routing::{get, post};
use engine::WorkflowEngine;
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryPaymentService, InMemoryShippingService, order_fulfillment, payment_worker,
    shipping_worker,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: WorkflowEngine,
    pub config: Config,
    /// Source of order ids for requests that omit one.
    pub next_order_id: AtomicI64,
}

impl AppState {
    pub fn new(engine: WorkflowEngine, config: Config) -> Self {
        Self {
            engine,
            config,
            next_order_id: AtomicI64::new(1),
        }
    }
}

/// The running engine with its activity workers.
pub struct Services {
    pub engine: WorkflowEngine,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
    pub workers: Vec<WorkerHandle>,
}

impl Services {
    /// Stops the engine, then drains every worker within `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.engine.shutdown();
        for worker in self.workers {
            let task_queue = worker.task_queue().to_string();
            if !worker.shutdown(grace).await {
                tracing::warn!(%task_queue, "worker did not drain before shutdown");
            }
        }
    }
}

/// Registers the order fulfillment workflow on a new engine and starts
/// one payment and one shipping worker.
pub fn bootstrap(config: &Config, store: Arc<dyn EventStore>) -> Services {
    let dispatcher = ActivityDispatcher::default();
    let engine = WorkflowEngine::new(store, dispatcher.clone());
    engine.register(Arc::new(order_fulfillment::workflow(
        &config.order_fulfillment(),
    )));

    let payment = InMemoryPaymentService::new();
    let shipping = InMemoryShippingService::new();
    let workers = vec![
        payment_worker(
            config.payment_task_queue.clone(),
            dispatcher.clone(),
            payment.clone(),
            config.worker_concurrency,
        )
        .start(),
        shipping_worker(
            config.shipping_task_queue.clone(),
            dispatcher,
            shipping.clone(),
            config.worker_concurrency,
        )
        .start(),
    ];
    tracing::info!(
        payment_queue = %config.payment_task_queue,
        shipping_queue = %config.shipping_task_queue,
        concurrency = config.worker_concurrency,
        "activity workers started"
    );

    Services {
        engine,
        payment,
        shipping,
        workers,
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/workflows/{id}", get(routes::workflows::status))
        .route("/workflows/{id}/history", get(routes::workflows::history))
        .route("/workflows/{id}/cancel", post(routes::workflows::cancel))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
