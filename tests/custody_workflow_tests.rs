//! End-to-end custody workflows against the in-memory store and ledger.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use custody_ledger_relayer::app::{OrchestratorConfig, TransferOrchestrator};
use custody_ledger_relayer::domain::{
    AppError, BatchStatus, CheckBalancesRequest, CreateTransferRequest, CustodySource,
    CustodyStatus, DatabaseClient, ErrorCategory, InconsistencyKind, LedgerError,
    MintBatchRequest, PartyRole, ReceiptStatus, RecoverMintRequest, Signer, SubmitOutcome,
    TxReceipt, UnitBatch, ValidationError,
};
use custody_ledger_relayer::test_utils::{
    MintEventMode, MockDatabaseClient, MockLedgerClient, test_signer,
};

struct Harness {
    db: Arc<MockDatabaseClient>,
    ledger: Arc<MockLedgerClient>,
    orchestrator: TransferOrchestrator,
    producer: Signer,
    distributor: Signer,
    retailer: Signer,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        finalization_timeout: Duration::from_millis(200),
        resolve_attempts: 2,
        requery_delay: Duration::from_millis(1),
        accept_inferred_token_ids: false,
        unknown_attempt_grace: Duration::from_secs(600),
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let db = Arc::new(MockDatabaseClient::new());
    let ledger = Arc::new(MockLedgerClient::new());
    let producer = test_signer(1);
    let distributor = test_signer(2);
    let retailer = test_signer(3);
    ledger.grant_role(producer.address(), PartyRole::Producer);
    ledger.grant_role(distributor.address(), PartyRole::Distributor);
    ledger.grant_role(retailer.address(), PartyRole::RetailOutlet);

    let orchestrator = TransferOrchestrator::new(db.clone(), ledger.clone(), config);
    Harness {
        db,
        ledger,
        orchestrator,
        producer,
        distributor,
        retailer,
    }
}

fn mint_request(producer: &Signer, quantity: u32) -> MintBatchRequest {
    MintBatchRequest {
        producer_address: producer.address().to_string(),
        product_ref: "PARA-500MG".to_string(),
        quantity,
        production_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
        expiry_date: NaiveDate::from_ymd_opt(2028, 1, 10).unwrap(),
        metadata_ref: "ipfs://bafy-batch".to_string(),
    }
}

async fn mint(h: &Harness, quantity: u32) -> UnitBatch {
    h.orchestrator
        .mint_batch(&h.producer, &mint_request(&h.producer, quantity))
        .await
        .unwrap()
}

async fn draft_from_batch(h: &Harness, batch: &UnitBatch, quantity: u32) -> String {
    h.orchestrator
        .create_transfer(&CreateTransferRequest {
            source: CustodySource::Batch {
                batch_id: batch.id.clone(),
            },
            destination_address: h.distributor.address().to_string(),
            destination_role: PartyRole::Distributor,
            quantity,
        })
        .await
        .unwrap()
        .record_id
}

// ============================================================================
// Mint
// ============================================================================

#[tokio::test]
async fn test_minted_ids_are_unique_ascending_and_complete() {
    let h = harness();
    h.ledger.set_next_token_id(1000);

    let batch = mint(&h, 25).await;

    assert_eq!(batch.token_ids.len(), 25);
    assert!(batch.token_ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(batch.token_ids[0], 1000);
    assert_eq!(batch.status, BatchStatus::Minted);
    assert_eq!(
        h.ledger.balance(h.producer.address(), 1024),
        1,
        "minted units belong to the producer"
    );
}

#[tokio::test]
async fn test_mint_falls_back_to_null_sender_transfers() {
    let h = harness();
    h.ledger.set_mint_event_mode(MintEventMode::NullSenderTransfer);

    let batch = mint(&h, 4).await;

    assert_eq!(batch.token_ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_incomplete_mint_events_are_reported_not_guessed() {
    let h = harness();
    h.ledger.set_next_token_id(500);
    h.ledger.set_mint_event_mode(MintEventMode::DropLast(2));

    let err = h
        .orchestrator
        .mint_batch(&h.producer, &mint_request(&h.producer, 50))
        .await
        .unwrap_err();

    match err {
        AppError::Inconsistency(details) => {
            assert_eq!(details.kind, InconsistencyKind::MintUnresolved);
            assert!(details.tx_ref.starts_with("0xmint"));
        }
        other => panic!("expected inconsistency, got {other:?}"),
    }
    assert!(h.db.get_all_batches().is_empty());
}

#[tokio::test]
async fn test_incomplete_mint_events_gap_filled_when_accepted() {
    let h = harness_with(OrchestratorConfig {
        accept_inferred_token_ids: true,
        ..config()
    });
    h.ledger.set_next_token_id(500);
    h.ledger.set_mint_event_mode(MintEventMode::DropLast(2));

    let batch = mint(&h, 50).await;

    assert_eq!(batch.token_ids.len(), 50);
    assert_eq!(batch.token_ids[47], 547);
    assert_eq!(&batch.token_ids[48..], &[548, 549]);
}

#[tokio::test]
async fn test_mint_without_any_ids_is_fatal() {
    let h = harness();
    h.ledger.set_mint_event_mode(MintEventMode::NoEvents);

    let err = h
        .orchestrator
        .mint_batch(&h.producer, &mint_request(&h.producer, 3))
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Fatal);
    assert!(h.db.get_all_batches().is_empty());
}

#[tokio::test]
async fn test_mint_preflight_failures_leave_nothing_behind() {
    let h = harness();
    let outsider = test_signer(9);

    let err = h
        .orchestrator
        .mint_batch(&outsider, &mint_request(&outsider, 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Ledger(LedgerError::MissingRole { .. })
    ));
    assert_eq!(err.category(), ErrorCategory::RejectedBeforeSubmission);

    h.ledger.set_deployed(false);
    let err = h
        .orchestrator
        .mint_batch(&h.producer, &mint_request(&h.producer, 3))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transport);

    assert_eq!(h.ledger.mint_count(), 0);
    assert!(h.db.get_all_batches().is_empty());
}

#[tokio::test]
async fn test_mint_rejects_expiry_before_production() {
    let h = harness();
    let mut request = mint_request(&h.producer, 3);
    request.expiry_date = request.production_date;

    let err = h
        .orchestrator
        .mint_batch(&h.producer, &request)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.ledger.mint_count(), 0);
}

#[tokio::test]
async fn test_recover_mint_records_batch_without_minting_again() {
    let h = harness();
    h.db.fail_operation("create_batch");
    let request = mint_request(&h.producer, 3);

    let err = h
        .orchestrator
        .mint_batch(&h.producer, &request)
        .await
        .unwrap_err();
    let tx_ref = match err {
        AppError::Inconsistency(details) => {
            assert_eq!(details.kind, InconsistencyKind::MintNotRecorded);
            details.tx_ref.clone()
        }
        other => panic!("expected inconsistency, got {other:?}"),
    };
    assert!(h.db.get_all_batches().is_empty());

    h.db.restore_operation("create_batch");
    let recover = RecoverMintRequest {
        tx_ref: tx_ref.clone(),
        batch: request,
    };
    let batch = h.orchestrator.recover_mint(&recover).await.unwrap();
    assert_eq!(batch.mint_tx_ref, tx_ref);
    assert_eq!(batch.token_ids.len(), 3);

    let again = h.orchestrator.recover_mint(&recover).await.unwrap();
    assert_eq!(again.id, batch.id);
    assert_eq!(h.ledger.mint_count(), 1);
    assert_eq!(h.db.get_all_batches().len(), 1);
}

// ============================================================================
// Transfer
// ============================================================================

#[tokio::test]
async fn test_full_custody_lifecycle() {
    let h = harness();
    let batch = mint(&h, 3).await;

    let created = h
        .orchestrator
        .create_transfer(&CreateTransferRequest {
            source: CustodySource::Batch {
                batch_id: batch.id.clone(),
            },
            destination_address: h.distributor.address().to_string(),
            destination_role: PartyRole::Distributor,
            quantity: 3,
        })
        .await
        .unwrap();
    assert_eq!(created.status, CustodyStatus::Draft);
    assert_eq!(created.selected_token_ids, batch.token_ids);
    assert_eq!(
        h.orchestrator.get_batch(&batch.id).await.unwrap().status,
        BatchStatus::TransferPending
    );

    let submitted = h
        .orchestrator
        .submit_transfer(&h.producer, &created.record_id)
        .await
        .unwrap();
    assert_eq!(submitted.outcome, SubmitOutcome::Finalized);
    assert_eq!(submitted.status, CustodyStatus::Sent);
    assert!(submitted.tx_ref.is_some());
    for id in &batch.token_ids {
        assert_eq!(h.ledger.balance(h.distributor.address(), *id), 1);
        assert_eq!(h.ledger.balance(h.producer.address(), *id), 0);
    }
    assert_eq!(
        h.orchestrator.get_batch(&batch.id).await.unwrap().status,
        BatchStatus::Transferred
    );

    let received = h
        .orchestrator
        .confirm_receipt(&created.record_id)
        .await
        .unwrap();
    assert_eq!(received.status, CustodyStatus::Received);

    let confirmed = h
        .orchestrator
        .advance_status(&created.record_id, CustodyStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(confirmed.status, CustodyStatus::Confirmed);

    let paid = h
        .orchestrator
        .advance_status(&created.record_id, CustodyStatus::Paid)
        .await
        .unwrap();
    assert_eq!(paid.status, CustodyStatus::Paid);
    assert_eq!(paid.tx_ref, submitted.tx_ref);

    for record in h.db.get_all_records() {
        if record.status.has_finalized_transfer() {
            assert!(record.tx_ref.is_some());
        }
    }
}

#[tokio::test]
async fn test_partial_transfers_draw_lowest_unallocated_ids() {
    let h = harness();
    let batch = mint(&h, 5).await;

    let first = draft_from_batch(&h, &batch, 2).await;
    let second = draft_from_batch(&h, &batch, 3).await;

    let first = h.orchestrator.get_custody_record(&first).await.unwrap();
    let second = h.orchestrator.get_custody_record(&second).await.unwrap();
    assert_eq!(first.token_ids, batch.token_ids[..2].to_vec());
    assert_eq!(second.token_ids, batch.token_ids[2..].to_vec());

    h.orchestrator
        .submit_transfer(&h.producer, &first.id)
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.get_batch(&batch.id).await.unwrap().status,
        BatchStatus::TransferPending
    );

    h.orchestrator
        .submit_transfer(&h.producer, &second.id)
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.get_batch(&batch.id).await.unwrap().status,
        BatchStatus::Transferred
    );
}

#[tokio::test]
async fn test_create_transfer_rejects_oversized_and_invalid_requests() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let source = CustodySource::Batch {
        batch_id: batch.id.clone(),
    };

    let too_many = h
        .orchestrator
        .create_transfer(&CreateTransferRequest {
            source: source.clone(),
            destination_address: h.distributor.address().to_string(),
            destination_role: PartyRole::Distributor,
            quantity: 3,
        })
        .await;
    assert!(matches!(
        too_many,
        Err(AppError::Validation(ValidationError::InvalidField { .. }))
    ));

    let to_producer = h
        .orchestrator
        .create_transfer(&CreateTransferRequest {
            source: source.clone(),
            destination_address: h.distributor.address().to_string(),
            destination_role: PartyRole::Producer,
            quantity: 1,
        })
        .await;
    assert!(matches!(to_producer, Err(AppError::Validation(_))));

    let to_self = h
        .orchestrator
        .create_transfer(&CreateTransferRequest {
            source,
            destination_address: h.producer.address().to_string(),
            destination_role: PartyRole::Distributor,
            quantity: 1,
        })
        .await;
    assert!(matches!(to_self, Err(AppError::Validation(_))));

    assert!(h.db.get_all_records().is_empty());
}

#[tokio::test]
async fn test_double_submit_returns_same_tx_ref() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;

    let first = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert_eq!(first.outcome, SubmitOutcome::Finalized);
    assert_eq!(second.outcome, SubmitOutcome::AlreadyFinalized);
    assert_eq!(first.tx_ref, second.tx_ref);
    assert_eq!(h.ledger.transfer_count(), 1);
}

#[tokio::test]
async fn test_concurrent_submits_reach_ledger_once() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.ledger.set_transfer_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        h.orchestrator.submit_transfer(&h.producer, &record_id),
        h.orchestrator.submit_transfer(&h.producer, &record_id),
    );

    let results = [a, b];
    let finalized = results.iter().filter(|r| r.is_ok()).count();
    let in_flight = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::TransferInFlight(_))))
        .count();
    assert_eq!(finalized, 1);
    assert_eq!(in_flight, 1);
    assert_eq!(h.ledger.transfer_count(), 1);

    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Sent);
}

#[tokio::test]
async fn test_insufficient_balance_blocks_submission() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.ledger
        .set_balance(h.producer.address(), batch.token_ids[0], 0);

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();

    match &err {
        AppError::InsufficientBalance { shortfalls, .. } => {
            assert_eq!(shortfalls.len(), 1);
            assert_eq!(shortfalls[0].token_id, batch.token_ids[0]);
            assert_eq!(shortfalls[0].held, "0");
            assert_eq!(shortfalls[0].needed, "1");
        }
        other => panic!("expected insufficient balance, got {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::RejectedBeforeSubmission);
    assert_eq!(h.ledger.transfer_count(), 0);

    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
    assert!(record.tx_ref.is_none());
    assert!(record.pending_tx_ref.is_none());
}

#[tokio::test]
async fn test_check_balances_reports_shortfall_amounts() {
    let h = harness();
    h.ledger.set_balance("holder", 42, 7);

    let check = h
        .orchestrator
        .check_balances(&CheckBalancesRequest {
            holder_address: "holder".to_string(),
            token_ids: vec![42],
            amounts: Some(vec![10]),
        })
        .await
        .unwrap();
    assert!(!check.can_transfer);
    assert_eq!(check.shortfalls.len(), 1);
    assert_eq!(check.shortfalls[0].held, "7");
    assert_eq!(check.shortfalls[0].needed, "10");

    let check = h
        .orchestrator
        .check_balances(&CheckBalancesRequest {
            holder_address: "holder".to_string(),
            token_ids: vec![42, 43],
            amounts: None,
        })
        .await
        .unwrap();
    assert!(!check.can_transfer);
    assert_eq!(check.shortfalls.len(), 1);
    assert_eq!(check.shortfalls[0].token_id, 43);
    assert_eq!(check.shortfalls[0].held, "0");
    assert_eq!(check.shortfalls[0].needed, "1");
    assert_eq!(h.ledger.transfer_count(), 0);
}

#[tokio::test]
async fn test_submit_requires_holder_signer() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;

    let err = h
        .orchestrator
        .submit_transfer(&h.retailer, &record_id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Authorization(_)));
    assert_eq!(h.ledger.transfer_count(), 0);
}

#[tokio::test]
async fn test_signer_rejection_is_recorded_and_retryable() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.ledger.reject_transfers(Some("user denied signature"));

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Ledger(LedgerError::SignerRejected(_))
    ));

    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
    assert_eq!(record.attempt_count, 1);
    assert!(record.last_error.unwrap().contains("user denied"));
    assert!(record.pending_tx_ref.is_none());

    h.ledger.reject_transfers(None);
    let submitted = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    assert_eq!(submitted.outcome, SubmitOutcome::Finalized);
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert!(record.last_error.is_none());
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_unrecorded_transfer_is_reconciled_without_resubmitting() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.db.fail_operation("attach_tx_ref_and_advance");

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();
    let tx_ref = match err {
        AppError::Inconsistency(details) => {
            assert_eq!(details.kind, InconsistencyKind::TransferNotRecorded);
            assert_eq!(details.subject_id.as_deref(), Some(record_id.as_str()));
            details.tx_ref.clone()
        }
        other => panic!("expected inconsistency, got {other:?}"),
    };
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
    assert_eq!(record.pending_tx_ref.as_deref(), Some(tx_ref.as_str()));

    h.db.restore_operation("attach_tx_ref_and_advance");
    let reconciled = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert_eq!(reconciled.outcome, SubmitOutcome::Reconciled);
    assert_eq!(reconciled.status, CustodyStatus::Sent);
    assert_eq!(reconciled.tx_ref.as_deref(), Some(tx_ref.as_str()));
    assert_eq!(h.ledger.transfer_count(), 1);
}

#[tokio::test]
async fn test_pending_transfer_is_not_resubmitted() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.ledger.hold_transfers(true);

    let first = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    assert_eq!(first.outcome, SubmitOutcome::Pending);
    assert_eq!(first.status, CustodyStatus::Draft);
    let pending = first.pending_tx_ref.clone().unwrap();

    let second = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    assert_eq!(second.outcome, SubmitOutcome::Pending);
    assert_eq!(second.pending_tx_ref.as_deref(), Some(pending.as_str()));
    assert_eq!(h.ledger.transfer_count(), 1);

    h.ledger.finalize_held(&pending);
    let third = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    assert_eq!(third.outcome, SubmitOutcome::Reconciled);
    assert_eq!(third.tx_ref.as_deref(), Some(pending.as_str()));
    assert_eq!(h.ledger.transfer_count(), 1);
}

#[tokio::test]
async fn test_reverted_attempt_is_resubmitted() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.ledger.hold_transfers(true);

    let first = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    let pending = first.pending_tx_ref.unwrap();
    h.ledger.revert_held(&pending);
    h.ledger.hold_transfers(false);

    let second = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert_eq!(second.outcome, SubmitOutcome::Finalized);
    assert_ne!(second.tx_ref.as_deref(), Some(pending.as_str()));
    assert_eq!(h.ledger.transfer_count(), 2);
}

#[tokio::test]
async fn test_attempt_not_yet_indexed_is_not_resubmitted() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.ledger.hold_transfers(true);

    let first = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    let pending = first.pending_tx_ref.unwrap();
    h.ledger.forget_held(&pending);
    h.ledger.hold_transfers(false);

    let second = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert_eq!(second.outcome, SubmitOutcome::Pending);
    assert_eq!(second.pending_tx_ref.as_deref(), Some(pending.as_str()));
    assert_eq!(h.ledger.transfer_count(), 1);
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.pending_tx_ref.as_deref(), Some(pending.as_str()));
}

#[tokio::test]
async fn test_attempt_dropped_after_grace_is_resubmitted() {
    let h = harness_with(OrchestratorConfig {
        unknown_attempt_grace: Duration::ZERO,
        ..config()
    });
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.ledger.hold_transfers(true);

    let first = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    h.ledger.forget_held(&first.pending_tx_ref.unwrap());
    h.ledger.hold_transfers(false);

    let second = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert_eq!(second.outcome, SubmitOutcome::Finalized);
    assert_eq!(h.ledger.transfer_count(), 2);
    assert!(h.ledger.transfer_calls()[1].is_single());
}

#[tokio::test]
async fn test_unpersisted_pending_ref_is_reported_with_tx_ref() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    h.ledger.hold_transfers(true);
    h.db.fail_operation("set_pending_tx_ref");

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();
    h.db.restore_operation("set_pending_tx_ref");

    let AppError::Inconsistency(inconsistency) = &err else {
        panic!("expected inconsistency, got {err:?}");
    };
    assert_eq!(inconsistency.kind, InconsistencyKind::TransferNotRecorded);
    assert_eq!(inconsistency.subject_id.as_deref(), Some(record_id.as_str()));
    assert_eq!(err.category(), ErrorCategory::RecoverableInconsistency);
    assert_eq!(h.ledger.transfer_count(), 1);
    assert!(inconsistency.tx_ref.starts_with("0xtransfer"));
}

#[tokio::test]
async fn test_reverted_transfer_is_recorded_and_retryable() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.ledger.revert_transfers(Some("caller is not a producer"));

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Ledger(LedgerError::Reverted { .. })));
    assert_eq!(err.category(), ErrorCategory::Reverted);
    assert!(err.to_string().contains("caller is not a producer"));
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
    assert!(record.pending_tx_ref.is_none());
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.ledger.balance(h.producer.address(), batch.token_ids[0]), 1);

    h.ledger.revert_transfers(None);
    let submitted = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();
    assert_eq!(submitted.outcome, SubmitOutcome::Finalized);
    assert_eq!(h.ledger.transfer_count(), 2);
}

// ============================================================================
// Status changes
// ============================================================================

#[tokio::test]
async fn test_cancelled_draft_releases_its_ids() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;

    let cancelled = h.orchestrator.cancel_transfer(&record_id).await.unwrap();
    assert_eq!(cancelled.status, CustodyStatus::Cancelled);

    let replacement = draft_from_batch(&h, &batch, 2).await;
    let replacement = h
        .orchestrator
        .get_custody_record(&replacement)
        .await
        .unwrap();
    assert_eq!(replacement.token_ids, batch.token_ids);

    let err = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_refused_while_attempt_outstanding() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.ledger.hold_transfers(true);
    h.orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    let err = h.orchestrator.cancel_transfer(&record_id).await.unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
}

#[tokio::test]
async fn test_sent_record_cannot_be_cancelled_or_skipped_ahead() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;
    h.orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap();

    assert!(h.orchestrator.cancel_transfer(&record_id).await.is_err());
    assert!(
        h.orchestrator
            .advance_status(&record_id, CustodyStatus::Paid)
            .await
            .is_err()
    );
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Sent);
}

#[tokio::test]
async fn test_confirm_receipt_detects_ledger_mismatch() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;
    let tx_ref = h
        .orchestrator
        .submit_transfer(&h.producer, &record_id)
        .await
        .unwrap()
        .tx_ref
        .unwrap();

    h.ledger.set_receipt(TxReceipt {
        tx_ref: tx_ref.clone(),
        status: ReceiptStatus::Success,
        block_number: Some(7),
        confirmations: 5,
        revert_reason: None,
        events: vec![],
    });

    let err = h.orchestrator.confirm_receipt(&record_id).await.unwrap_err();
    match err {
        AppError::Inconsistency(details) => {
            assert_eq!(details.kind, InconsistencyKind::TransferMismatch);
            assert_eq!(details.tx_ref, tx_ref);
        }
        other => panic!("expected inconsistency, got {other:?}"),
    }
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Sent);
}

#[tokio::test]
async fn test_units_pass_downstream_only_after_receipt() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let upstream = draft_from_batch(&h, &batch, 2).await;
    h.orchestrator
        .submit_transfer(&h.producer, &upstream)
        .await
        .unwrap();

    let downstream = CreateTransferRequest {
        source: CustodySource::Record {
            record_id: upstream.clone(),
        },
        destination_address: h.retailer.address().to_string(),
        destination_role: PartyRole::RetailOutlet,
        quantity: 2,
    };
    assert!(h.orchestrator.create_transfer(&downstream).await.is_err());

    h.orchestrator.confirm_receipt(&upstream).await.unwrap();
    let created = h.orchestrator.create_transfer(&downstream).await.unwrap();
    assert_eq!(created.selected_token_ids, batch.token_ids);

    let submitted = h
        .orchestrator
        .submit_transfer(&h.distributor, &created.record_id)
        .await
        .unwrap();
    assert_eq!(submitted.status, CustodyStatus::Sent);
    for id in &batch.token_ids {
        assert_eq!(h.ledger.balance(h.retailer.address(), *id), 1);
        assert_eq!(h.ledger.balance(h.distributor.address(), *id), 0);
    }
}

#[tokio::test]
async fn test_assigned_ids_never_overwritten() {
    let h = harness();
    let batch = mint(&h, 2).await;
    let record_id = draft_from_batch(&h, &batch, 2).await;

    let overwritten = h
        .db
        .assign_token_ids_once(&record_id, &[900, 901])
        .await
        .unwrap();

    assert!(!overwritten);
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.token_ids, batch.token_ids);
}

#[tokio::test]
async fn test_store_rejects_sent_without_tx_ref() {
    let h = harness();
    let batch = mint(&h, 1).await;
    let record_id = draft_from_batch(&h, &batch, 1).await;

    let advanced = h
        .db
        .update_record_status(&record_id, CustodyStatus::Draft, CustodyStatus::Sent)
        .await
        .unwrap();

    assert!(!advanced);
    let record = h.orchestrator.get_custody_record(&record_id).await.unwrap();
    assert_eq!(record.status, CustodyStatus::Draft);
}
