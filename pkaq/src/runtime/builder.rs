use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::dispatch::JobDispatcher;
use crate::events::InProcEventBus;
use crate::queue::{AdmissionQueue, LeaseExpiryScanner};
use crate::store::LifecycleStore;

use super::supervisor::{OrchestratorRuntime, OrchestratorRuntimeConfig};

/// Builder for constructing an `OrchestratorRuntime` with explicit dependencies.
///
/// The queue, store and dispatcher are required. Without an event bus a
/// private one is created; pass a shared bus to observe lifecycle events
/// from outside.
///
/// # Example
///
/// ```ignore
/// use pkaq::*;
///
/// let runtime = OrchestratorRuntimeBuilder::new(config)
///     .with_queue(queue)
///     .with_store(store)
///     .with_dispatcher(dispatcher)
///     .build()?;
/// ```
pub struct OrchestratorRuntimeBuilder<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    config: OrchestratorRuntimeConfig,
    queue: Option<Arc<Q>>,
    store: Option<Arc<S>>,
    dispatcher: Option<Arc<D>>,
    events: Option<Arc<InProcEventBus>>,
}

impl<Q, S, D> fmt::Debug for OrchestratorRuntimeBuilder<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("dispatcher_set", &self.dispatcher.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.queue.is_some() {
            debug.field("queue_type", &type_name::<Q>());
        }
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.dispatcher.is_some() {
            debug.field("dispatcher_type", &type_name::<D>());
        }

        debug.finish()
    }
}

impl<Q, S, D> OrchestratorRuntimeBuilder<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    pub fn new(config: OrchestratorRuntimeConfig) -> Self {
        Self {
            config,
            queue: None,
            store: None,
            dispatcher: None,
            events: None,
        }
    }

    /// Set the admission queue.
    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the lifecycle store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<D>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the `OrchestratorRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime<Q, S, D>> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;
        let events = self.events.unwrap_or_default();

        Ok(OrchestratorRuntime::new(
            self.config,
            queue,
            store,
            dispatcher,
            events,
        ))
    }
}
