use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::Utc;
use stocktake_audit::{
    AuditSession, AuditSessionId, ExpectedUnit, RecordScan, SessionCommand, StartAudit,
};
use stocktake_core::{AggregateId, BranchId};
use stocktake_events::{EventEnvelope, InMemoryEventBus};
use stocktake_infra::command_dispatcher::CommandDispatcher;
use stocktake_infra::event_store::InMemoryEventStore;
use stocktake_products::ProductId;
use stocktake_serials::{ScanMode, SerialNumber};
use stocktake_stock::StockUnitId;

type Dispatcher =
    CommandDispatcher<InMemoryEventStore, Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>>;

fn setup() -> Dispatcher {
    let store = InMemoryEventStore::new();
    let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> =
        Arc::new(InMemoryEventBus::new());
    CommandDispatcher::new(store, bus)
}

fn start_session(dispatcher: &Dispatcher, branch_id: BranchId, expected: usize) -> AuditSessionId {
    let session_id = AuditSessionId::new(AggregateId::new());
    let expected: Vec<ExpectedUnit> = (0..expected)
        .map(|i| ExpectedUnit {
            unit_id: StockUnitId::new(AggregateId::new()),
            serial: SerialNumber::from_counter(i as u64 + 1),
            product_id: ProductId::new(AggregateId::new()),
            product_name: "Widget".to_string(),
        })
        .collect();

    dispatcher
        .dispatch(
            branch_id,
            session_id.0,
            "audit.session",
            SessionCommand::StartAudit(StartAudit {
                branch_id,
                session_id,
                expected,
                occurred_at: Utc::now(),
            }),
            |_, id| AuditSession::empty(AuditSessionId::new(id)),
        )
        .unwrap();

    session_id
}

/// Scan dispatch latency as the session's event history grows: each scan
/// replays the full stream before deciding.
fn bench_scan_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_dispatch");
    group.throughput(Throughput::Elements(1));

    for snapshot_size in [100usize, 1_000] {
        group.bench_function(format!("snapshot_{snapshot_size}"), |b| {
            let dispatcher = setup();
            let branch_id = BranchId::new();
            let session_id = start_session(&dispatcher, branch_id, snapshot_size);
            let mut next = 0u64;

            b.iter(|| {
                next += 1;
                let serial = SerialNumber::from_counter(next % snapshot_size as u64 + 1);
                dispatcher
                    .dispatch(
                        branch_id,
                        session_id.0,
                        "audit.session",
                        SessionCommand::RecordScan(RecordScan {
                            branch_id,
                            session_id,
                            serial: black_box(serial),
                            code: serial.as_label_code(),
                            mode: ScanMode::Barcode,
                            occurred_at: Utc::now(),
                        }),
                        |_, id| AuditSession::empty(AuditSessionId::new(id)),
                    )
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scan_dispatch);
criterion_main!(benches);
