// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Choice of the purchase entry a legacy receipt stands for.

use entitle_core::record::ReceiptInfo;

use crate::api::LegacyReceiptInfo;

/// Ranking given to entries whose expiry cannot be parsed: one day after now.
const UNKNOWN_EXPIRY_GRACE_MS: i64 = 24 * 60 * 60 * 1000;

/// Whether a returned product satisfies the requested one.
///
/// An empty value on either side matches anything.
pub fn product_matches(filter: Option<&str>, product_id: &str) -> bool {
    match filter {
        Some(filter) if !filter.is_empty() && !product_id.is_empty() => filter == product_id,
        _ => true,
    }
}

/// Picks the entry with the largest expiry among those matching `product_filter`.
///
/// Ties keep the first entry seen. Entries without a parseable expiry rank as
/// expiring at `now_ms` plus one day; the ranking value is never returned.
pub fn pick_latest_receipt<'a>(
    infos: &'a [LegacyReceiptInfo],
    product_filter: Option<&str>,
    now_ms: i64,
) -> Option<&'a LegacyReceiptInfo> {
    let filter = product_filter.filter(|filter| !filter.is_empty());

    let mut latest: Option<(&LegacyReceiptInfo, i64)> = None;
    for info in infos {
        if filter.is_some_and(|filter| info.product_id != filter) {
            continue;
        }
        let rank = info
            .expires_date_ms
            .trim()
            .parse::<i64>()
            .unwrap_or(now_ms + UNKNOWN_EXPIRY_GRACE_MS);
        match latest {
            Some((_, best)) if rank <= best => {}
            _ => latest = Some((info, rank)),
        }
    }
    latest.map(|(info, _)| info)
}

impl From<&LegacyReceiptInfo> for ReceiptInfo {
    fn from(info: &LegacyReceiptInfo) -> Self {
        ReceiptInfo {
            product_id: info.product_id.clone(),
            transaction_id: info.transaction_id.clone(),
            original_transaction_id: info.original_transaction_id.clone(),
            expires_at_millis: info.expires_date_ms.trim().parse().ok(),
        }
    }
}
