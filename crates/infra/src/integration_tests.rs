//! Integration tests for the full event-sourced pipeline.
//!
//! Command → EventStore → EventBus → Projections → ReadModels

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use stocktake_audit::{
        AuditSession, AuditSessionId, AuditStatus, ConfirmAudit, ExpectedUnit, RecordScan,
        ResolutionStrategy, ScanOutcome, SessionCommand, SessionEvent, StartAudit,
    };
    use stocktake_core::{AggregateId, BranchId};
    use stocktake_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use stocktake_products::ProductId;
    use stocktake_receiving::{
        AddReceiptLine, CreateReceipt, GoodsReceipt, GoodsReceiptId, IssuedUnit,
        MarkLabelsPrinted, PostReceipt, ReceiptCommand,
    };
    use stocktake_serials::{ScanMode, SerialNumber, SerialSequence};
    use stocktake_stock::{StockStatus, StockUnit, StockUnitId};

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{
        AUDIT_AGGREGATE, AuditSessionRow, AuditSessionsProjection, BarcodeCatalogProjection,
        CatalogRow, RECEIPT_AGGREGATE, StockUnitsProjection,
    };
    use crate::read_model::InMemoryBranchStore;
    use crate::serial_sequence::AtomicSerialSequence;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;
    type Dispatcher = Arc<CommandDispatcher<Arc<InMemoryEventStore>, Bus>>;
    type StockUnits =
        Arc<StockUnitsProjection<Arc<InMemoryBranchStore<StockUnitId, StockUnit>>>>;
    type Catalog =
        Arc<BarcodeCatalogProjection<Arc<InMemoryBranchStore<SerialNumber, CatalogRow>>>>;
    type Sessions =
        Arc<AuditSessionsProjection<Arc<InMemoryBranchStore<AuditSessionId, AuditSessionRow>>>>;

    struct Pipeline {
        dispatcher: Dispatcher,
        sequence: AtomicSerialSequence,
        stock_units: StockUnits,
        catalog: Catalog,
        sessions: Sessions,
    }

    fn setup() -> Pipeline {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = Arc::new(CommandDispatcher::new(store, bus.clone()));

        let stock_units = Arc::new(StockUnitsProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        )));
        let catalog = Arc::new(BarcodeCatalogProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        )));
        let sessions = Arc::new(AuditSessionsProjection::new(Arc::new(
            InMemoryBranchStore::new(),
        )));

        // One subscriber thread per projection, subscribed before any events
        // are published.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

        let units = stock_units.clone();
        let units_bus = bus.clone();
        let units_ready = ready_tx.clone();
        std::thread::spawn(move || {
            let sub = units_bus.subscribe();
            let _ = units_ready.send(());
            while let Ok(env) = sub.recv() {
                if let Err(e) = units.apply_envelope(&env) {
                    eprintln!("stock units projection failed: {e:?}");
                }
            }
        });

        let cat = catalog.clone();
        let cat_bus = bus.clone();
        let cat_ready = ready_tx.clone();
        std::thread::spawn(move || {
            let sub = cat_bus.subscribe();
            let _ = cat_ready.send(());
            while let Ok(env) = sub.recv() {
                if let Err(e) = cat.apply_envelope(&env) {
                    eprintln!("barcode catalog projection failed: {e:?}");
                }
            }
        });

        let sess = sessions.clone();
        let sess_bus = bus.clone();
        std::thread::spawn(move || {
            let sub = sess_bus.subscribe();
            let _ = ready_tx.send(());
            while let Ok(env) = sub.recv() {
                if let Err(e) = sess.apply_envelope(&env) {
                    eprintln!("audit sessions projection failed: {e:?}");
                }
            }
        });

        for _ in 0..3 {
            let _ = ready_rx.recv_timeout(std::time::Duration::from_secs(1));
        }

        Pipeline {
            dispatcher,
            sequence: AtomicSerialSequence::default(),
            stock_units,
            catalog,
            sessions,
        }
    }

    fn wait_for_processing() {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    /// Create, fill and post a receipt of `quantity` units, returning the
    /// issued units.
    fn post_receipt(
        pipeline: &Pipeline,
        branch_id: BranchId,
        product_id: ProductId,
        quantity: u32,
    ) -> (GoodsReceiptId, Vec<IssuedUnit>) {
        let receipt_id = GoodsReceiptId::new(AggregateId::new());

        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                receipt_id.0,
                RECEIPT_AGGREGATE,
                ReceiptCommand::CreateReceipt(CreateReceipt {
                    branch_id,
                    receipt_id,
                    reference: None,
                    occurred_at: Utc::now(),
                }),
                |_, id| GoodsReceipt::empty(GoodsReceiptId::new(id)),
            )
            .unwrap();

        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                receipt_id.0,
                RECEIPT_AGGREGATE,
                ReceiptCommand::AddReceiptLine(AddReceiptLine {
                    branch_id,
                    receipt_id,
                    product_id,
                    quantity,
                    occurred_at: Utc::now(),
                }),
                |_, id| GoodsReceipt::empty(GoodsReceiptId::new(id)),
            )
            .unwrap();

        let block = pipeline.sequence.reserve(quantity).unwrap();
        let issued: Vec<IssuedUnit> = block
            .serials()
            .map(|serial| IssuedUnit {
                unit_id: StockUnitId::new(AggregateId::new()),
                serial,
                product_id,
                line_no: 1,
            })
            .collect();

        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                receipt_id.0,
                RECEIPT_AGGREGATE,
                ReceiptCommand::PostReceipt(PostReceipt {
                    branch_id,
                    receipt_id,
                    issued: issued.clone(),
                    occurred_at: Utc::now(),
                }),
                |_, id| GoodsReceipt::empty(GoodsReceiptId::new(id)),
            )
            .unwrap();

        (receipt_id, issued)
    }

    fn start_audit(pipeline: &Pipeline, branch_id: BranchId) -> AuditSessionId {
        let session_id = AuditSessionId::new(AggregateId::new());
        let expected: Vec<ExpectedUnit> = pipeline
            .stock_units
            .list_on_shelf(branch_id)
            .into_iter()
            .map(|u| ExpectedUnit {
                unit_id: u.id,
                serial: u.serial,
                product_id: u.product_id,
                product_name: "Widget".to_string(),
            })
            .collect();

        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                session_id.0,
                AUDIT_AGGREGATE,
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

    fn scan(
        pipeline: &Pipeline,
        branch_id: BranchId,
        session_id: AuditSessionId,
        serial: SerialNumber,
    ) -> ScanOutcome {
        let committed = pipeline
            .dispatcher
            .dispatch_retrying(
                branch_id,
                session_id.0,
                AUDIT_AGGREGATE,
                SessionCommand::RecordScan(RecordScan {
                    branch_id,
                    session_id,
                    serial,
                    code: serial.as_label_code(),
                    mode: ScanMode::Barcode,
                    occurred_at: Utc::now(),
                }),
                |_, id| AuditSession::empty(AuditSessionId::new(id)),
                5,
            )
            .unwrap();

        let payload: SessionEvent = serde_json::from_value(committed[0].payload.clone()).unwrap();
        match payload {
            SessionEvent::ScanRecorded(e) => e.outcome,
            other => panic!("Expected ScanRecorded event, got {other:?}"),
        }
    }

    #[test]
    fn posting_a_receipt_materializes_units_and_catalog_rows() {
        let pipeline = setup();
        let branch_id = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (receipt_id, issued) = post_receipt(&pipeline, branch_id, product_id, 3);
        wait_for_processing();

        let on_shelf = pipeline.stock_units.list_on_shelf(branch_id);
        assert_eq!(on_shelf.len(), 3);
        assert!(on_shelf.iter().all(|u| u.status == StockStatus::InStock));

        let rows = pipeline.catalog.list_for_receipt(branch_id, receipt_id);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.printed));

        // Serials resolve back to the units they were issued to.
        let row = pipeline
            .catalog
            .resolve(branch_id, issued[0].serial)
            .unwrap();
        assert_eq!(row.unit_id, issued[0].unit_id);
    }

    #[test]
    fn marking_labels_printed_updates_the_catalog_once() {
        let pipeline = setup();
        let branch_id = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (receipt_id, _) = post_receipt(&pipeline, branch_id, product_id, 2);

        let mark = ReceiptCommand::MarkLabelsPrinted(MarkLabelsPrinted {
            branch_id,
            receipt_id,
            serials: None,
            occurred_at: Utc::now(),
        });

        let first = pipeline
            .dispatcher
            .dispatch(
                branch_id,
                receipt_id.0,
                RECEIPT_AGGREGATE,
                mark.clone(),
                |_, id| GoodsReceipt::empty(GoodsReceiptId::new(id)),
            )
            .unwrap();
        assert_eq!(first.len(), 1);

        // Second call is a no-op, not an error.
        let second = pipeline
            .dispatcher
            .dispatch(
                branch_id,
                receipt_id.0,
                RECEIPT_AGGREGATE,
                mark,
                |_, id| GoodsReceipt::empty(GoodsReceiptId::new(id)),
            )
            .unwrap();
        assert!(second.is_empty());

        wait_for_processing();
        let rows = pipeline.catalog.list_for_receipt(branch_id, receipt_id);
        assert!(rows.iter().all(|r| r.printed));
    }

    #[test]
    fn audit_lifecycle_updates_session_and_stock_read_models() {
        let pipeline = setup();
        let branch_id = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (_, issued) = post_receipt(&pipeline, branch_id, product_id, 3);
        wait_for_processing();

        let session_id = start_audit(&pipeline, branch_id);
        wait_for_processing();

        let row = pipeline.sessions.get(branch_id, &session_id).unwrap();
        assert_eq!(row.status, AuditStatus::Draft);
        assert_eq!(row.expected_count(), 3);
        assert_eq!(row.scanned_count(), 0);

        // Scan the first unit twice; the second scan does not recount.
        assert_eq!(
            scan(&pipeline, branch_id, session_id, issued[0].serial),
            ScanOutcome::Matched
        );
        assert_eq!(
            scan(&pipeline, branch_id, session_id, issued[0].serial),
            ScanOutcome::AlreadyScanned
        );
        wait_for_processing();

        let row = pipeline.sessions.get(branch_id, &session_id).unwrap();
        assert_eq!(row.scanned_count(), 1);
        assert_eq!(row.missing_count(), 2);

        // Confirm with MARK_LOST; the two missing units get written off.
        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                session_id.0,
                AUDIT_AGGREGATE,
                SessionCommand::ConfirmAudit(ConfirmAudit {
                    branch_id,
                    session_id,
                    strategy: ResolutionStrategy::MarkLost,
                    occurred_at: Utc::now(),
                }),
                |_, id| AuditSession::empty(AuditSessionId::new(id)),
            )
            .unwrap();
        wait_for_processing();

        let row = pipeline.sessions.get(branch_id, &session_id).unwrap();
        assert_eq!(row.status, AuditStatus::Confirmed);
        assert_eq!(row.strategy, Some(ResolutionStrategy::MarkLost));

        let scanned_unit = pipeline
            .stock_units
            .get(branch_id, &issued[0].unit_id)
            .unwrap();
        assert_eq!(scanned_unit.status, StockStatus::InStock);

        for missing in &issued[1..] {
            let unit = pipeline.stock_units.get(branch_id, &missing.unit_id).unwrap();
            assert_eq!(unit.status, StockStatus::Lost);
            assert_eq!(unit.history.len(), 2);
        }

        // The write-off removed the units from the next snapshot.
        assert_eq!(pipeline.stock_units.list_on_shelf(branch_id).len(), 1);
    }

    #[test]
    fn scan_after_confirm_is_rejected_as_conflict() {
        let pipeline = setup();
        let branch_id = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (_, issued) = post_receipt(&pipeline, branch_id, product_id, 1);
        wait_for_processing();
        let session_id = start_audit(&pipeline, branch_id);

        pipeline
            .dispatcher
            .dispatch(
                branch_id,
                session_id.0,
                AUDIT_AGGREGATE,
                SessionCommand::ConfirmAudit(ConfirmAudit {
                    branch_id,
                    session_id,
                    strategy: ResolutionStrategy::MarkPending,
                    occurred_at: Utc::now(),
                }),
                |_, id| AuditSession::empty(AuditSessionId::new(id)),
            )
            .unwrap();

        let result = pipeline.dispatcher.dispatch(
            branch_id,
            session_id.0,
            AUDIT_AGGREGATE,
            SessionCommand::RecordScan(RecordScan {
                branch_id,
                session_id,
                serial: issued[0].serial,
                code: issued[0].serial.as_label_code(),
                mode: ScanMode::Barcode,
                occurred_at: Utc::now(),
            }),
            |_, id| AuditSession::empty(AuditSessionId::new(id)),
        );

        assert!(matches!(result, Err(DispatchError::Conflict(_))));
    }

    #[test]
    fn concurrent_scans_of_one_serial_match_exactly_once() {
        let pipeline = setup();
        let branch_id = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (_, issued) = post_receipt(&pipeline, branch_id, product_id, 1);
        wait_for_processing();
        let session_id = start_audit(&pipeline, branch_id);
        let serial = issued[0].serial;

        let dispatcher = pipeline.dispatcher.clone();
        let matched = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let matched = matched.clone();
                std::thread::spawn(move || {
                    let committed = dispatcher
                        .dispatch_retrying(
                            branch_id,
                            session_id.0,
                            AUDIT_AGGREGATE,
                            SessionCommand::RecordScan(RecordScan {
                                branch_id,
                                session_id,
                                serial,
                                code: serial.as_label_code(),
                                mode: ScanMode::Barcode,
                                occurred_at: Utc::now(),
                            }),
                            |_, id| AuditSession::empty(AuditSessionId::new(id)),
                            10,
                        )
                        .unwrap();

                    let payload: SessionEvent =
                        serde_json::from_value(committed[0].payload.clone()).unwrap();
                    if let SessionEvent::ScanRecorded(e) = payload {
                        if e.outcome == ScanOutcome::Matched {
                            matched.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one of the racers observed the first match; the others
        // were re-decided against the fresh stream and saw a repeat.
        assert_eq!(matched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn branch_isolation_in_read_models() {
        let pipeline = setup();
        let branch_a = BranchId::new();
        let branch_b = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        post_receipt(&pipeline, branch_a, product_id, 2);
        post_receipt(&pipeline, branch_b, product_id, 1);
        wait_for_processing();

        assert_eq!(pipeline.stock_units.list_on_shelf(branch_a).len(), 2);
        assert_eq!(pipeline.stock_units.list_on_shelf(branch_b).len(), 1);

        // A serial issued to branch A stays out of branch B's partition,
        // but the global lookup still knows who issued it.
        let a_units = pipeline.stock_units.list_on_shelf(branch_a);
        assert!(pipeline.catalog.resolve(branch_b, a_units[0].serial).is_none());
        let (owner, row) = pipeline
            .catalog
            .resolve_anywhere(a_units[0].serial)
            .unwrap();
        assert_eq!(owner, branch_a);
        assert_eq!(row.serial, a_units[0].serial);
    }

    #[test]
    fn scanning_a_serial_from_another_branch_is_unexpected() {
        let pipeline = setup();
        let branch_a = BranchId::new();
        let branch_b = BranchId::new();
        let product_id = ProductId::new(AggregateId::new());

        let (_, a_issued) = post_receipt(&pipeline, branch_a, product_id, 1);
        post_receipt(&pipeline, branch_b, product_id, 1);
        wait_for_processing();

        let session_id = start_audit(&pipeline, branch_b);
        let foreign = a_issued[0].serial;
        let (owner, _) = pipeline.catalog.resolve_anywhere(foreign).unwrap();
        assert_eq!(owner, branch_a);

        let committed = pipeline
            .dispatcher
            .dispatch(
                branch_b,
                session_id.0,
                AUDIT_AGGREGATE,
                SessionCommand::RecordScan(RecordScan {
                    branch_id: branch_b,
                    session_id,
                    serial: foreign,
                    code: foreign.as_label_code(),
                    mode: ScanMode::Barcode,
                    occurred_at: Utc::now(),
                }),
                |_, id| AuditSession::empty(AuditSessionId::new(id)),
            )
            .unwrap();

        let payload: SessionEvent = serde_json::from_value(committed[0].payload.clone()).unwrap();
        match payload {
            SessionEvent::ScanRecorded(e) => assert_eq!(e.outcome, ScanOutcome::Unexpected),
            other => panic!("expected a scan record, got {other:?}"),
        }
    }
}
