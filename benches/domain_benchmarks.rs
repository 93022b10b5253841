use chrono::NaiveDate;
use criterion::{Criterion, criterion_group, criterion_main};
use custody_ledger_relayer::app::TokenIdResolver;
use custody_ledger_relayer::domain::{LedgerEvent, MintBatchRequest, NULL_ADDRESS};
use std::hint::black_box;
use validator::Validate;

fn bench_validation(c: &mut Criterion) {
    let request = MintBatchRequest {
        producer_address: "ProducerA".to_string(),
        product_ref: "AMOX-500-CAPS".to_string(),
        quantity: 500,
        production_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        expiry_date: NaiveDate::from_ymd_opt(2028, 3, 1).unwrap(),
        metadata_ref: "bafybeimeta".to_string(),
    };

    c.bench_function("validate_mint_request", |b| {
        b.iter(|| {
            let _ = black_box(&request).validate();
        })
    });
}

fn bench_token_id_resolution(c: &mut Criterion) {
    let ids: Vec<u64> = (1_000..2_000).collect();
    let minted = vec![LedgerEvent::UnitsMinted {
        to: "ProducerA".to_string(),
        token_ids: ids.clone(),
    }];
    let null_sender: Vec<LedgerEvent> = ids
        .iter()
        .map(|id| LedgerEvent::TransferSingle {
            operator: "ProducerA".to_string(),
            from: NULL_ADDRESS.to_string(),
            to: "ProducerA".to_string(),
            id: *id,
            value: 1,
        })
        .collect();

    c.bench_function("resolve_minted_event", |b| {
        b.iter(|| TokenIdResolver::resolve_events(black_box(&minted), 1_000))
    });
    c.bench_function("resolve_null_sender_transfers", |b| {
        b.iter(|| TokenIdResolver::resolve_events(black_box(&null_sender), 1_000))
    });
}

criterion_group!(benches, bench_validation, bench_token_id_resolution);
criterion_main!(benches);
