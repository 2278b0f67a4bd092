use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{Duration, Utc};
use marketpay_core::{AccountId, CreatedBy, Currency, EntryId};
use marketpay_infra::{BalanceMaterializer, CoreStore, InMemoryStore, StoreTx};
use marketpay_ledger::{
    Balance, Direction, EntryStatus, EntryType, LedgerEntry, SourceType, UnpostedEntry,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

fn synthetic_history(account: AccountId, len: usize) -> Vec<LedgerEntry> {
    let base = Utc::now() - Duration::days(365);
    (0..len)
        .map(|i| {
            let (entry_type, direction, amount) = match i % 4 {
                0 => (EntryType::Charge, Direction::Credit, 10_000),
                1 => (EntryType::Fee, Direction::Debit, 320),
                2 => (EntryType::Fee, Direction::Debit, 100),
                _ => (EntryType::Payout, Direction::Debit, 5_000),
            };
            let effective_at = base + Duration::minutes(i as i64);
            let settles = entry_type.settles();
            LedgerEntry {
                id: EntryId::new(),
                account_id: account,
                entry_type,
                direction,
                amount,
                currency: Currency::usd(),
                source_type: SourceType::Order,
                source_reference: format!("order-{}", i / 4),
                status: EntryStatus::Posted,
                effective_at,
                available_at: if settles {
                    effective_at + Duration::days(7)
                } else {
                    effective_at
                },
                created_by: CreatedBy::System,
                metadata: JsonValue::Null,
                sequence: i as u64 + 1,
            }
        })
        .collect()
}

fn bench_fold_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_fold");
    let account = AccountId::new();

    for len in [100usize, 1_000, 10_000] {
        let history = synthetic_history(account, len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &history, |b, history| {
            let as_of = Utc::now();
            b.iter(|| {
                black_box(Balance::fold(
                    account,
                    Currency::usd(),
                    black_box(history),
                    as_of,
                ))
            });
        });
    }
    group.finish();
}

fn bench_recompute_through_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("materializer_recompute");
    let account = AccountId::new();

    for len in [100usize, 1_000] {
        let store = Arc::new(InMemoryStore::new());
        let base = Utc::now() - Duration::days(365);
        store
            .transaction(|tx| {
                for i in 0..len {
                    let effective_at = base + Duration::minutes(i as i64);
                    tx.append_entry(UnpostedEntry {
                        id: EntryId::new(),
                        account_id: account,
                        entry_type: EntryType::Adjustment,
                        direction: Direction::Credit,
                        amount: 100,
                        currency: Currency::usd(),
                        source_type: SourceType::Adjustment,
                        source_reference: "bench".to_string(),
                        status: EntryStatus::Posted,
                        effective_at,
                        available_at: effective_at,
                        created_by: CreatedBy::System,
                        metadata: JsonValue::Null,
                    })?;
                }
                Ok(())
            })
            .unwrap();

        let materializer = BalanceMaterializer::new(Arc::clone(&store));
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            let as_of = Utc::now();
            b.iter(|| {
                black_box(
                    materializer
                        .recompute(account, &Currency::usd(), as_of)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fold_throughput, bench_recompute_through_store);
criterion_main!(benches);
