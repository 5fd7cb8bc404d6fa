// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};

use super::adapters::{EntitlementRead, EntitlementStore};
use crate::record::{
    ReceiptInfo, SubscriptionStatus, SubscriptionUpdate, VerificationOutcome, VerificationRequest,
};

pub struct EntitlementManager<E> {
    /// Context that implements adapters
    context: E,
}

impl<E> EntitlementManager<E> {
    pub fn new(context: E) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &E {
        &self.context
    }
}

impl<E> EntitlementManager<E>
where
    E: EntitlementStore + EntitlementRead + Sync,
{
    /// Persists the transaction selected by the verifier and reports the
    /// resulting status to the client.
    ///
    /// Ids missing from `info` fall back to what the client sent: the
    /// transaction id to the request's, the original transaction id to the
    /// transaction id, the product to the requested product.
    ///
    /// Persistence is best effort. A failed write is logged and the client
    /// still learns the live status; a failed subscriber count reports rank 0.
    pub async fn record_verification(
        &self,
        request: &VerificationRequest,
        info: Option<&ReceiptInfo>,
        now: DateTime<Utc>,
    ) -> VerificationOutcome {
        let expire_at = info.and_then(ReceiptInfo::expires_at);
        let status = SubscriptionStatus::from_expiry(expire_at, now);

        let transaction_id = info
            .map(|info| info.transaction_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| request.transaction_id.clone());
        let original_transaction_id = info
            .map(|info| info.original_transaction_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| transaction_id.clone());
        let product_id = info
            .map(|info| info.product_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| request.product_id.clone());

        let update = SubscriptionUpdate {
            user_id: request.user_id,
            platform: request.platform.clone(),
            sku: product_id.clone(),
            status,
            expire_at,
            transaction_id,
            original_transaction_id,
        };
        if let Err(err) = self.context.upsert(update, now).await {
            log::error!(
                "Failed to save subscription of user {}: {err}",
                request.user_id
            );
        }

        let subscriber_rank = match self.context.count_distinct_subscribers().await {
            Ok(count) => count,
            Err(err) => {
                log::warn!("Failed to count subscribers: {err}");
                0
            }
        };

        VerificationOutcome {
            active: status == SubscriptionStatus::Active,
            status,
            expire_at,
            product_id,
            subscriber_rank,
        }
    }
}
