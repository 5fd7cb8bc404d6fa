// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Cost of one admission decision against the in-memory context, with a
//! growing number of usage rows recorded for the day.

use chrono::{Duration, FixedOffset, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use entitle_core::{
    manager::context::memory::InMemoryContext,
    quota::{MeteredAction, QuotaLedger, QuotaWindow, UsageKind},
};

pub fn criterion_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let now = FixedOffset::east_opt(8 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 6, 18, 0, 0)
        .unwrap();
    let utc_now = now.with_timezone(&Utc);
    let window = QuotaWindow::containing(now);
    let action = MeteredAction::for_path("/api/chat/messages");

    c.bench_function("Classify path", |b| {
        b.iter(|| MeteredAction::for_path(black_box("/api/v1/meals/photo/upload")))
    });

    let mut admit_group = c.benchmark_group("Admit with varying usage rows");

    for log_number_of_rows in [4, 8, 12] {
        let context = InMemoryContext::default();
        for i in 0..(1u32 << log_number_of_rows) {
            let kind = UsageKind::ALL[i as usize % UsageKind::ALL.len()];
            // Most rows fall on previous days.
            let at = utc_now - Duration::hours(i64::from(i % 96));
            context.record_usage(7, kind, at).unwrap();
        }
        let ledger = QuotaLedger::with_default_policies(context);

        admit_group.bench_function(
            &format!("Admit w/ 2^{} usage rows", log_number_of_rows),
            |b| {
                b.to_async(&runtime).iter(|| {
                    ledger.admit(
                        black_box(7),
                        black_box(&action),
                        black_box(&window),
                        black_box(utc_now),
                    )
                })
            },
        );
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
