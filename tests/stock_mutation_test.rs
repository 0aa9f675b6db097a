mod common;

use assert_matches::assert_matches;
use common::TestLedger;
use uuid::Uuid;
use warehouse_ledger::{
    db::begin_transaction,
    dto::{
        AdjustStockRequest, DeductForSaleRequest, ReceiveStockRequest,
        RestoreForCancellationRequest, TransferStockRequest,
    },
    entities::{MovementDirection, MovementType, ReferenceType},
    errors::{ErrorKind, ServiceError},
    events::Event,
};

fn transfer(from: Uuid, to: Uuid, product_id: Uuid, quantity: i32) -> TransferStockRequest {
    TransferStockRequest {
        source_warehouse_id: from,
        destination_warehouse_id: to,
        product_id,
        quantity,
        reason: "rebalance".to_string(),
        notes: Some("weekly rebalance".to_string()),
    }
}

#[tokio::test]
async fn adjustment_creates_missing_record() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;

    let record = ledger
        .stock
        .adjust_stock(
            AdjustStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 50,
                reason: "Initial stock".to_string(),
                notes: None,
            },
            ledger.actor,
        )
        .await
        .expect("adjust");

    assert_eq!(record.quantity, 50);
    assert_eq!(record.low_stock_threshold, 10);
    assert!(record.last_restocked_at.is_some());

    let movements = ledger.movements_for(wh.id, product.id).await;
    assert_eq!(movements.len(), 1);
    let movement = &movements[0];
    assert_eq!(movement.movement_type, MovementType::Adjustment);
    assert_eq!(movement.direction, MovementDirection::In);
    assert_eq!(movement.quantity, 50);
    assert_eq!(movement.reference_type, Some(ReferenceType::Adjustment));
    assert_eq!(movement.reason.as_deref(), Some("Initial stock"));
    assert_eq!(movement.performed_by, ledger.actor);

    assert_eq!(ledger.product_total(product.id).await, 50);
}

#[tokio::test]
async fn overdrawn_adjustment_changes_nothing() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh.id, product.id, 50).await;

    let err = ledger
        .stock
        .adjust_stock(
            AdjustStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: -60,
                reason: "oops".to_string(),
                notes: None,
            },
            ledger.actor,
        )
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InsufficientStock {
            available: 50,
            requested: 60,
            ..
        }
    );
    assert_eq!(ledger.quantity(wh.id, product.id).await, 50);
    assert_eq!(ledger.movements_for(wh.id, product.id).await.len(), 1);
    assert_eq!(ledger.product_total(product.id).await, 50);
}

#[tokio::test]
async fn negative_adjustment_cannot_seed_a_record() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;

    let err = ledger.adjust(wh.id, product.id, -1).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidAdjustment(_));
    assert_eq!(
        err.to_string(),
        "Invalid adjustment: Cannot adjust stock below zero for a new stock record"
    );
    assert!(ledger.all_movements().await.is_empty());
}

#[tokio::test]
async fn negative_adjustment_records_an_out_movement() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh.id, product.id, 20).await;
    let seeded = ledger.stock.get_product_stock(wh.id, product.id).await.unwrap();

    let record = ledger.adjust(wh.id, product.id, -20).await.unwrap();
    assert_eq!(record.quantity, 0);
    // Removing stock is not a restock.
    assert_eq!(record.last_restocked_at, seeded.record.last_restocked_at);

    let movements = ledger.movements_for(wh.id, product.id).await;
    let out = movements
        .iter()
        .find(|m| m.direction == MovementDirection::Out)
        .expect("out movement");
    assert_eq!(out.quantity, 20);
    assert_eq!(out.signed_quantity(), -20);
    assert_eq!(ledger.product_total(product.id).await, 0);
}

#[tokio::test]
async fn adjustment_requires_known_warehouse_and_product() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;

    let err = ledger.adjust(Uuid::new_v4(), product.id, 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "Not found: Warehouse not found");

    let err = ledger.adjust(wh.id, Uuid::new_v4(), 5).await.unwrap_err();
    assert_eq!(err.to_string(), "Not found: Product not found");
    assert!(ledger.all_movements().await.is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_write() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;

    let err = ledger.adjust(wh.id, product.id, 0).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = ledger
        .stock
        .adjust_stock(
            AdjustStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 5,
                reason: "  x ".to_string(),
                notes: None,
            },
            ledger.actor,
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = ledger
        .stock
        .receive_stock(
            ReceiveStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 0,
                purchase_order_id: Uuid::new_v4(),
            },
            ledger.actor,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(ledger.all_movements().await.is_empty());
}

#[tokio::test]
async fn transfer_moves_stock_with_paired_movements() {
    let ledger = TestLedger::new().await;
    let wh1 = ledger.warehouse("WH1").await;
    let wh2 = ledger.warehouse("WH2").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh1.id, product.id, 30).await;

    let result = ledger
        .stock
        .transfer_stock(transfer(wh1.id, wh2.id, product.id, 10), ledger.actor)
        .await
        .expect("transfer");

    assert_eq!(result.source.warehouse_id, wh1.id);
    assert_eq!(result.source.new_quantity, 20);
    assert_eq!(result.destination.warehouse_id, wh2.id);
    assert_eq!(result.destination.new_quantity, 10);
    assert_eq!(ledger.quantity(wh1.id, product.id).await, 20);
    assert_eq!(ledger.quantity(wh2.id, product.id).await, 10);

    let out: Vec<_> = ledger
        .movements_for(wh1.id, product.id)
        .await
        .into_iter()
        .filter(|m| m.movement_type == MovementType::TransferOut)
        .collect();
    let inbound = ledger.movements_for(wh2.id, product.id).await;
    assert_eq!(out.len(), 1);
    assert_eq!(inbound.len(), 1);
    assert_eq!(out[0].direction, MovementDirection::Out);
    assert_eq!(inbound[0].movement_type, MovementType::TransferIn);
    assert_eq!(inbound[0].direction, MovementDirection::In);
    assert_eq!(out[0].reference_type, Some(ReferenceType::Transfer));
    assert_eq!(out[0].reference_id, Some(result.transfer_id));
    assert_eq!(inbound[0].reference_id, Some(result.transfer_id));
    assert_eq!(inbound[0].notes.as_deref(), Some("weekly rebalance"));

    let destination = ledger.stock.get_product_stock(wh2.id, product.id).await.unwrap();
    assert!(destination.record.last_restocked_at.is_some());
}

#[tokio::test]
async fn transfer_leaves_cached_product_total_alone() {
    let ledger = TestLedger::new().await;
    let wh1 = ledger.warehouse("WH1").await;
    let wh2 = ledger.warehouse("WH2").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh1.id, product.id, 30).await;
    assert_eq!(ledger.product_total(product.id).await, 30);

    ledger
        .stock
        .transfer_stock(transfer(wh1.id, wh2.id, product.id, 30), ledger.actor)
        .await
        .unwrap();

    // Totals are conserved by a transfer, so the cache is not rewritten.
    assert_eq!(ledger.product_total(product.id).await, 30);
    assert_eq!(ledger.quantity(wh1.id, product.id).await, 0);
}

#[tokio::test]
async fn transfer_to_same_warehouse_is_rejected() {
    let ledger = TestLedger::new().await;
    let wh1 = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh1.id, product.id, 30).await;

    let err = ledger
        .stock
        .transfer_stock(transfer(wh1.id, wh1.id, product.id, 5), ledger.actor)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransfer(_));
    assert_eq!(ledger.quantity(wh1.id, product.id).await, 30);
    assert_eq!(ledger.all_movements().await.len(), 1);
}

#[tokio::test]
async fn transfer_from_empty_source_reports_zero_available() {
    let ledger = TestLedger::new().await;
    let wh1 = ledger.warehouse("WH1").await;
    let wh2 = ledger.warehouse("WH2").await;
    let product = ledger.product("SKU-1").await;

    let err = ledger
        .stock
        .transfer_stock(transfer(wh1.id, wh2.id, product.id, 3), ledger.actor)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock {
            available: 0,
            requested: 3,
            ..
        }
    );
    // The destination record created during the attempt was rolled back.
    let err = ledger.stock.get_product_stock(wh2.id, product.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn transfer_checks_each_warehouse() {
    let ledger = TestLedger::new().await;
    let wh1 = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh1.id, product.id, 10).await;

    let err = ledger
        .stock
        .transfer_stock(transfer(wh1.id, Uuid::new_v4(), product.id, 1), ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Not found: Destination warehouse not found");

    let err = ledger
        .stock
        .transfer_stock(transfer(Uuid::new_v4(), wh1.id, product.id, 1), ledger.actor)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Not found: Source warehouse not found");
}

#[tokio::test]
async fn sale_deduction_fails_when_short() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh.id, product.id, 3).await;

    let err = ledger
        .stock
        .deduct_for_sale(
            DeductForSaleRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 5,
                order_id: Uuid::new_v4(),
            },
            ledger.actor,
        )
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InsufficientStock {
            available: 3,
            requested: 5,
            ..
        }
    );
    let message = err.response_message();
    assert!(message.contains("available 3"), "{message}");
    assert!(message.contains("requested 5"), "{message}");
    assert_eq!(ledger.quantity(wh.id, product.id).await, 3);
}

#[tokio::test]
async fn sale_deduction_records_order_reference() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh.id, product.id, 8).await;
    let order_id = Uuid::new_v4();

    let record = ledger
        .stock
        .deduct_for_sale(
            DeductForSaleRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 5,
                order_id,
            },
            ledger.actor,
        )
        .await
        .unwrap();
    assert_eq!(record.quantity, 3);
    assert_eq!(ledger.product_total(product.id).await, 3);

    let sale = ledger
        .movements_for(wh.id, product.id)
        .await
        .into_iter()
        .find(|m| m.movement_type == MovementType::Sale)
        .expect("sale movement");
    assert_eq!(sale.direction, MovementDirection::Out);
    assert_eq!(sale.reference_type, Some(ReferenceType::Order));
    assert_eq!(sale.reference_id, Some(order_id));
    assert_eq!(sale.reason.as_deref(), Some("Order sale"));
}

#[tokio::test]
async fn receipt_and_restore_create_records_lazily() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let other = ledger.warehouse("WH2").await;
    let product = ledger.product("SKU-1").await;
    let po = Uuid::new_v4();
    let order = Uuid::new_v4();

    let received = ledger
        .stock
        .receive_stock(
            ReceiveStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 40,
                purchase_order_id: po,
            },
            ledger.actor,
        )
        .await
        .unwrap();
    assert_eq!(received.quantity, 40);
    assert!(received.last_restocked_at.is_some());

    let restored = ledger
        .stock
        .restore_for_cancellation(
            RestoreForCancellationRequest {
                warehouse_id: other.id,
                product_id: product.id,
                quantity: 2,
                order_id: order,
            },
            ledger.actor,
        )
        .await
        .unwrap();
    assert_eq!(restored.quantity, 2);
    assert!(restored.last_restocked_at.is_none());
    assert_eq!(ledger.product_total(product.id).await, 42);

    let receipt = &ledger.movements_for(wh.id, product.id).await[0];
    assert_eq!(receipt.movement_type, MovementType::PurchaseOrderReceived);
    assert_eq!(receipt.reference_type, Some(ReferenceType::PurchaseOrder));
    assert_eq!(receipt.reference_id, Some(po));
    assert_eq!(receipt.reason.as_deref(), Some("Purchase order received"));

    let restore = &ledger.movements_for(other.id, product.id).await[0];
    assert_eq!(restore.movement_type, MovementType::Return);
    assert_eq!(restore.direction, MovementDirection::In);
    assert_eq!(restore.reference_type, Some(ReferenceType::Return));
    assert_eq!(restore.reference_id, Some(order));
    assert_eq!(
        restore.reason.as_deref(),
        Some("Order cancellation - stock restored")
    );
}

#[tokio::test]
async fn caller_transaction_controls_the_commit() {
    let ledger = TestLedger::new().await;
    let wh = ledger.warehouse("WH1").await;
    let product = ledger.product("SKU-1").await;
    ledger.seed(wh.id, product.id, 10).await;

    let sale = |quantity| DeductForSaleRequest {
        warehouse_id: wh.id,
        product_id: product.id,
        quantity,
        order_id: Uuid::new_v4(),
    };

    let txn = begin_transaction(&ledger.db, None).await.unwrap();
    let record = ledger
        .stock
        .deduct_for_sale_in(&txn, sale(4), ledger.actor)
        .await
        .unwrap();
    assert_eq!(record.quantity, 6);
    txn.rollback().await.unwrap();
    assert_eq!(ledger.quantity(wh.id, product.id).await, 10);

    let txn = begin_transaction(&ledger.db, None).await.unwrap();
    ledger
        .stock
        .deduct_for_sale_in(&txn, sale(4), ledger.actor)
        .await
        .unwrap();
    ledger
        .stock
        .receive_stock_in(
            &txn,
            ReceiveStockRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 1,
                purchase_order_id: Uuid::new_v4(),
            },
            ledger.actor,
        )
        .await
        .unwrap();
    ledger
        .stock
        .restore_for_cancellation_in(
            &txn,
            RestoreForCancellationRequest {
                warehouse_id: wh.id,
                product_id: product.id,
                quantity: 2,
                order_id: Uuid::new_v4(),
            },
            ledger.actor,
        )
        .await
        .unwrap();
    txn.commit().await.unwrap();

    assert_eq!(ledger.quantity(wh.id, product.id).await, 9);
    assert_eq!(ledger.product_total(product.id).await, 9);
    assert_eq!(ledger.movements_for(wh.id, product.id).await.len(), 4);
}

#[tokio::test]
async fn committed_mutations_publish_events() {
    let mut ledger = TestLedger::with_event_capture().await;
    let wh1 = ledger.warehouse("WH1").await;
    let wh2 = ledger.warehouse("WH2").await;
    let product = ledger.product("SKU-1").await;
    ledger.take_events();

    ledger.seed(wh1.id, product.id, 12).await;
    let events = ledger.take_events();
    assert_matches!(
        events.as_slice(),
        [Event::StockAdjusted {
            old_quantity: 0,
            new_quantity: 12,
            ..
        }]
    );

    let result = ledger
        .stock
        .transfer_stock(transfer(wh1.id, wh2.id, product.id, 5), ledger.actor)
        .await
        .unwrap();
    let events = ledger.take_events();
    assert!(events.contains(&Event::StockTransferred {
        transfer_id: result.transfer_id,
        source_warehouse_id: wh1.id,
        destination_warehouse_id: wh2.id,
        product_id: product.id,
        quantity: 5,
        performed_by: ledger.actor,
    }));
    // Both sides landed at or below the default threshold of 10.
    assert!(events.contains(&Event::LowStock {
        warehouse_id: wh1.id,
        product_id: product.id,
        quantity: 7,
        threshold: 10,
    }));
    assert!(events.contains(&Event::LowStock {
        warehouse_id: wh2.id,
        product_id: product.id,
        quantity: 5,
        threshold: 10,
    }));

    ledger.adjust(wh1.id, product.id, -7).await.unwrap();
    let events = ledger.take_events();
    assert!(events.contains(&Event::OutOfStock {
        warehouse_id: wh1.id,
        product_id: product.id,
    }));

    let _ = ledger.adjust(wh1.id, product.id, -1).await.unwrap_err();
    assert!(ledger.take_events().is_empty());
}
