use std::sync::Arc;

use stocktake_audit::{AuditSession, AuditSessionId, SessionEvent};
use stocktake_core::{Aggregate, AggregateId, BranchId, DomainError};
use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus};
use stocktake_infra::{
    command_dispatcher::{CommandDispatcher, DispatchError},
    event_store::{EventStore, InMemoryEventStore, StoredEvent},
    idempotency::{IdempotencyStore, InMemoryIdempotencyStore},
    open_audits::{ClaimOutcome, InMemoryOpenAuditRegistry, OpenAuditRegistry, RegistryError},
    projections::{
        AUDIT_AGGREGATE, AuditItemsPage, AuditItemsQuery, AuditSessionRow, AuditSessionsProjection,
        BarcodeCatalogProjection, CatalogRow, PRODUCT_AGGREGATE, ProductCatalogProjection,
        ProductRow, RECEIPT_AGGREGATE, StockUnitsProjection,
    },
    read_model::InMemoryBranchStore,
    serial_sequence::AtomicSerialSequence,
};
use stocktake_products::ProductId;
use stocktake_receiving::{GoodsReceipt, GoodsReceiptId, ReceiptEvent};
use stocktake_serials::{PrintableLabel, SequenceError, SerialBlock, SerialNumber, SerialSequence};
use stocktake_stock::{StockUnit, StockUnitId};

#[cfg(feature = "postgres")]
use stocktake_infra::{event_store::PostgresEventStore, serial_sequence::PostgresSerialSequence};
#[cfg(feature = "postgres")]
use sqlx::PgPool;

type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;

type ProductsProjection =
    ProductCatalogProjection<Arc<InMemoryBranchStore<ProductId, ProductRow>>>;
type StockProjection = StockUnitsProjection<Arc<InMemoryBranchStore<StockUnitId, StockUnit>>>;
type CatalogProjection = BarcodeCatalogProjection<Arc<InMemoryBranchStore<SerialNumber, CatalogRow>>>;
type SessionsProjection =
    AuditSessionsProjection<Arc<InMemoryBranchStore<AuditSessionId, AuditSessionRow>>>;

// Type-erased dispatcher for in-memory implementations
type InMemoryDispatcher = CommandDispatcher<Arc<InMemoryEventStore>, Bus>;

// Type-erased dispatcher for persistent implementations
#[cfg(feature = "postgres")]
type PersistentDispatcher = CommandDispatcher<Arc<PostgresEventStore>, Bus>;

#[derive(Clone)]
pub enum AppServices {
    InMemory {
        dispatcher: Arc<InMemoryDispatcher>,
        event_store: Arc<InMemoryEventStore>,
        event_bus: Bus,
        products_projection: Arc<ProductsProjection>,
        stock_projection: Arc<StockProjection>,
        catalog_projection: Arc<CatalogProjection>,
        sessions_projection: Arc<SessionsProjection>,
        sequence: Arc<dyn SerialSequence>,
        registry: Arc<InMemoryOpenAuditRegistry>,
        idempotency: Arc<InMemoryIdempotencyStore>,
    },
    #[cfg(feature = "postgres")]
    Persistent {
        dispatcher: Arc<PersistentDispatcher>,
        event_store: Arc<PostgresEventStore>,
        event_bus: Bus,
        products_projection: Arc<ProductsProjection>,
        stock_projection: Arc<StockProjection>,
        catalog_projection: Arc<CatalogProjection>,
        sessions_projection: Arc<SessionsProjection>,
        sequence: Arc<dyn SerialSequence>,
        registry: Arc<InMemoryOpenAuditRegistry>,
        idempotency: Arc<InMemoryIdempotencyStore>,
    },
}

pub async fn build_services() -> AppServices {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "postgres")]
        {
            return build_persistent_services().await;
        }
        #[cfg(not(feature = "postgres"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but postgres feature not enabled, falling back to in-memory"
            );
            return build_in_memory_services();
        }
    }

    build_in_memory_services()
}

struct Projections {
    products: Arc<ProductsProjection>,
    stock: Arc<StockProjection>,
    catalog: Arc<CatalogProjection>,
    sessions: Arc<SessionsProjection>,
}

fn build_projections() -> Projections {
    Projections {
        products: Arc::new(ProductCatalogProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        ))),
        stock: Arc::new(StockUnitsProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        ))),
        catalog: Arc::new(BarcodeCatalogProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        ))),
        sessions: Arc::new(AuditSessionsProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        ))),
    }
}

/// Background subscriber: bus -> projections.
///
/// Stock units consume both receipt posts and audit confirmations, so
/// receipt and audit envelopes fan out to two projections each.
fn spawn_projection_worker(bus: &Bus, projections: &Projections) {
    let sub = bus.subscribe();
    let products = projections.products.clone();
    let stock = projections.stock.clone();
    let catalog = projections.catalog.clone();
    let sessions = projections.sessions.clone();

    tokio::task::spawn_blocking(move || loop {
        match sub.recv() {
            Ok(env) => {
                let at = env.aggregate_type().to_string();

                let apply_ok = match at.as_str() {
                    PRODUCT_AGGREGATE => products.apply_envelope(&env).map_err(|e| e.to_string()),
                    RECEIPT_AGGREGATE => {
                        if let Err(e) = stock.apply_envelope(&env) {
                            Err(e.to_string())
                        } else if let Err(e) = catalog.apply_envelope(&env) {
                            Err(e.to_string())
                        } else {
                            Ok(())
                        }
                    }
                    AUDIT_AGGREGATE => {
                        if let Err(e) = sessions.apply_envelope(&env) {
                            Err(e.to_string())
                        } else if let Err(e) = stock.apply_envelope(&env) {
                            Err(e.to_string())
                        } else {
                            Ok(())
                        }
                    }
                    _ => Ok(()),
                };

                if let Err(e) = apply_ok {
                    tracing::warn!("projection apply failed: {e}");
                }
            }
            Err(_) => break,
        }
    });
}

fn build_in_memory_services() -> AppServices {
    // In-memory infra wiring (dev/test): store + bus + projections.
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let projections = build_projections();
    spawn_projection_worker(&bus, &projections);

    let dispatcher: Arc<InMemoryDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));

    AppServices::InMemory {
        dispatcher,
        event_store: store,
        event_bus: bus,
        products_projection: projections.products,
        stock_projection: projections.stock,
        catalog_projection: projections.catalog,
        sessions_projection: projections.sessions,
        sequence: Arc::new(AtomicSerialSequence::default()),
        registry: Arc::new(InMemoryOpenAuditRegistry::new()),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
    }
}

#[cfg(feature = "postgres")]
async fn build_persistent_services() -> AppServices {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");

    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    let store = Arc::new(PostgresEventStore::new(pool.clone()));
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    // Projections rebuild from the event stream on restart; their read
    // models stay in-memory (can be swapped to Postgres later).
    let projections = build_projections();
    spawn_projection_worker(&bus, &projections);

    let dispatcher: Arc<PersistentDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));

    AppServices::Persistent {
        dispatcher,
        event_store: store,
        event_bus: bus,
        products_projection: projections.products,
        stock_projection: projections.stock,
        catalog_projection: projections.catalog,
        sessions_projection: projections.sessions,
        sequence: Arc::new(PostgresSerialSequence::new(pool)),
        registry: Arc::new(InMemoryOpenAuditRegistry::new()),
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
    }
}

impl AppServices {
    pub fn dispatch<A>(
        &self,
        branch_id: BranchId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(BranchId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stocktake_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        match self {
            AppServices::InMemory { dispatcher, .. } => dispatcher.dispatch::<A>(
                branch_id,
                aggregate_id,
                aggregate_type,
                command,
                make_aggregate,
            ),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { dispatcher, .. } => dispatcher.dispatch::<A>(
                branch_id,
                aggregate_id,
                aggregate_type,
                command,
                make_aggregate,
            ),
        }
    }

    /// Dispatch with bounded retries on optimistic-concurrency conflicts.
    ///
    /// Used for scans, where the outcome must be re-decided against the
    /// fresh stream when a concurrent scan won the append race.
    pub fn dispatch_retrying<A>(
        &self,
        branch_id: BranchId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(BranchId, AggregateId) -> A,
        max_retries: u32,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stocktake_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        match self {
            AppServices::InMemory { dispatcher, .. } => dispatcher.dispatch_retrying::<A>(
                branch_id,
                aggregate_id,
                aggregate_type,
                command,
                make_aggregate,
                max_retries,
            ),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { dispatcher, .. } => dispatcher.dispatch_retrying::<A>(
                branch_id,
                aggregate_id,
                aggregate_type,
                command,
                make_aggregate,
                max_retries,
            ),
        }
    }

    /// Rehydrate a receipt from its stream (command-side state, not a
    /// projection). The post flow needs the draft's lines to size the
    /// serial reservation before dispatching.
    pub fn receipt_state(
        &self,
        branch_id: BranchId,
        receipt_id: GoodsReceiptId,
    ) -> Result<GoodsReceipt, DispatchError> {
        let history = match self {
            AppServices::InMemory { event_store, .. } => {
                event_store.load_stream(branch_id, receipt_id.0)?
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { event_store, .. } => {
                event_store.load_stream(branch_id, receipt_id.0)?
            }
        };

        let mut sorted = history;
        sorted.sort_by_key(|e| e.sequence_number);

        let mut receipt = GoodsReceipt::empty(receipt_id);
        for stored in sorted {
            let ev: ReceiptEvent = serde_json::from_value(stored.payload)
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            receipt.apply(&ev);
        }
        Ok(receipt)
    }

    /// Rehydrate an audit session from its stream.
    ///
    /// The idempotent start path reports the open session's expected count,
    /// which must come from the committed events rather than a projection
    /// that may not have caught up yet.
    pub fn session_state(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<AuditSession, DispatchError> {
        let history = match self {
            AppServices::InMemory { event_store, .. } => {
                event_store.load_stream(branch_id, session_id.0)?
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { event_store, .. } => {
                event_store.load_stream(branch_id, session_id.0)?
            }
        };

        let mut sorted = history;
        sorted.sort_by_key(|e| e.sequence_number);

        let mut session = AuditSession::empty(session_id);
        for stored in sorted {
            let ev: SessionEvent = serde_json::from_value(stored.payload)
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            session.apply(&ev);
        }
        Ok(session)
    }

    pub fn reserve_serials(&self, quantity: u32) -> Result<SerialBlock, SequenceError> {
        match self {
            AppServices::InMemory { sequence, .. } => sequence.reserve(quantity),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { sequence, .. } => sequence.reserve(quantity),
        }
    }

    pub fn claim_open_audit(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<ClaimOutcome, RegistryError> {
        match self {
            AppServices::InMemory { registry, .. } => registry.claim(branch_id, session_id),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { registry, .. } => registry.claim(branch_id, session_id),
        }
    }

    pub fn release_open_audit(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<(), RegistryError> {
        match self {
            AppServices::InMemory { registry, .. } => registry.release(branch_id, session_id),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { registry, .. } => registry.release(branch_id, session_id),
        }
    }

    pub fn idempotent_response(&self, branch_id: BranchId, key: &str) -> Option<serde_json::Value> {
        match self {
            AppServices::InMemory { idempotency, .. } => idempotency.get(branch_id, key),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { idempotency, .. } => idempotency.get(branch_id, key),
        }
    }

    pub fn record_idempotent_response(
        &self,
        branch_id: BranchId,
        key: &str,
        response: serde_json::Value,
    ) {
        match self {
            AppServices::InMemory { idempotency, .. } => idempotency.put(branch_id, key, response),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { idempotency, .. } => idempotency.put(branch_id, key, response),
        }
    }

    pub fn products_get(&self, branch_id: BranchId, product_id: &ProductId) -> Option<ProductRow> {
        match self {
            AppServices::InMemory { products_projection, .. } => {
                products_projection.get(branch_id, product_id)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { products_projection, .. } => {
                products_projection.get(branch_id, product_id)
            }
        }
    }

    pub fn products_list(&self, branch_id: BranchId) -> Vec<ProductRow> {
        match self {
            AppServices::InMemory { products_projection, .. } => products_projection.list(branch_id),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { products_projection, .. } => products_projection.list(branch_id),
        }
    }

    pub fn stock_on_shelf(&self, branch_id: BranchId) -> Vec<StockUnit> {
        match self {
            AppServices::InMemory { stock_projection, .. } => stock_projection.list_on_shelf(branch_id),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { stock_projection, .. } => stock_projection.list_on_shelf(branch_id),
        }
    }

    pub fn stock_get(&self, branch_id: BranchId, unit_id: &StockUnitId) -> Option<StockUnit> {
        match self {
            AppServices::InMemory { stock_projection, .. } => stock_projection.get(branch_id, unit_id),
            #[cfg(feature = "postgres")]
            AppServices::Persistent { stock_projection, .. } => stock_projection.get(branch_id, unit_id),
        }
    }

    /// Resolve a serial across all branches.
    ///
    /// Scan ingestion must see units issued to other branches (they classify
    /// as unexpected), so this lookup spans the global serial space.
    pub fn catalog_resolve_anywhere(
        &self,
        serial: SerialNumber,
    ) -> Option<(BranchId, CatalogRow)> {
        match self {
            AppServices::InMemory { catalog_projection, .. } => {
                catalog_projection.resolve_anywhere(serial)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { catalog_projection, .. } => {
                catalog_projection.resolve_anywhere(serial)
            }
        }
    }

    pub fn catalog_for_receipt(
        &self,
        branch_id: BranchId,
        receipt_id: GoodsReceiptId,
    ) -> Vec<CatalogRow> {
        match self {
            AppServices::InMemory { catalog_projection, .. } => {
                catalog_projection.list_for_receipt(branch_id, receipt_id)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { catalog_projection, .. } => {
                catalog_projection.list_for_receipt(branch_id, receipt_id)
            }
        }
    }

    pub fn labels_for_receipt(
        &self,
        branch_id: BranchId,
        receipt_id: GoodsReceiptId,
        copies: u32,
    ) -> Vec<PrintableLabel> {
        match self {
            AppServices::InMemory { catalog_projection, .. } => {
                catalog_projection.labels_for_receipt(branch_id, receipt_id, copies)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { catalog_projection, .. } => {
                catalog_projection.labels_for_receipt(branch_id, receipt_id, copies)
            }
        }
    }

    pub fn sessions_get(
        &self,
        branch_id: BranchId,
        session_id: &AuditSessionId,
    ) -> Option<AuditSessionRow> {
        match self {
            AppServices::InMemory { sessions_projection, .. } => {
                sessions_projection.get(branch_id, session_id)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { sessions_projection, .. } => {
                sessions_projection.get(branch_id, session_id)
            }
        }
    }

    pub fn sessions_items(
        &self,
        branch_id: BranchId,
        session_id: &AuditSessionId,
        query: &AuditItemsQuery,
    ) -> Option<AuditItemsPage> {
        match self {
            AppServices::InMemory { sessions_projection, .. } => {
                sessions_projection.items(branch_id, session_id, query)
            }
            #[cfg(feature = "postgres")]
            AppServices::Persistent { sessions_projection, .. } => {
                sessions_projection.items(branch_id, session_id, query)
            }
        }
    }
}
