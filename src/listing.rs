use crate::{
    database::Database,
    error::{MarketError, Result},
    model::{ConformityState, Listing, LogisticsState, ModerationState},
    notify::{Notifier, Topic},
    ListingId, UserId,
};
use chrono::Utc;
use rand::Rng;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_RETRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformityVerdict {
    Conforme,
    NonConforme,
}

/// Moderation and physical logistics of a listing: approval, conformity
/// inspection, deposit/quality/withdrawal scans and seller withdrawal.
#[derive(Clone)]
pub struct ListingService {
    db: Database,
    notifier: Notifier,
}

impl ListingService {
    pub fn new(db: Database, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// New listings always enter the queue as Pending / AwaitingDeposit.
    /// `self_certified` records whether the seller vouched for the item at
    /// listing time; approval consults it to skip the physical deposit leg.
    pub async fn create_listing(
        &self,
        seller_id: UserId,
        title: &str,
        description: Option<&str>,
        category: Option<&str>,
        price: f64,
        self_certified: bool,
    ) -> Result<Listing> {
        if !price.is_finite() || price <= 0.0 {
            return Err(MarketError::InvalidAmount(price));
        }
        if title.trim().is_empty() {
            return Err(MarketError::Validation("title cannot be empty".into()));
        }

        let listing = Listing::new(
            seller_id,
            title.trim().to_string(),
            description.map(str::to_string),
            category.map(str::to_string),
            price,
            self_certified,
        );
        self.db.create_listing(&listing).await?;

        tracing::info!(listing = %listing.id, seller = %seller_id, "listing submitted for moderation");
        self.notifier.publish(Topic::Listing, listing.id);
        Ok(listing)
    }

    pub async fn get_listing(&self, id: ListingId) -> Result<Listing> {
        self.db
            .get_listing(id)
            .await?
            .ok_or(MarketError::NotFound("listing", id))
    }

    pub async fn browse(&self) -> Result<Vec<Listing>> {
        self.db.browse_listings().await
    }

    pub async fn listings_by_seller(&self, seller_id: UserId) -> Result<Vec<Listing>> {
        self.db.listings_by_seller(seller_id).await
    }

    /// Puts a listing back into the moderation queue. New listings enter
    /// Pending at creation; only a Rejected listing can be resubmitted.
    pub async fn submit_for_moderation(&self, id: ListingId, actor: UserId) -> Result<Listing> {
        let listing = self.get_listing(id).await?;
        if listing.seller_id != actor {
            return Err(MarketError::Forbidden(
                "only the seller can resubmit a listing".into(),
            ));
        }

        let rows = self.db.resubmit_listing(id, Utc::now()).await?;
        if rows != 1 {
            return Err(MarketError::wrong_state("listing", "not rejected"));
        }

        tracing::info!(listing = %id, "listing resubmitted for moderation");
        self.notifier.publish(Topic::Listing, id);
        self.get_listing(id).await
    }

    /// Moderator decision on a Pending listing. Approval issues the
    /// one-time logistics codes; a self-certified item additionally skips
    /// straight to QualityChecked.
    pub async fn moderate(
        &self,
        id: ListingId,
        decision: ModerationDecision,
        moderator: UserId,
    ) -> Result<Listing> {
        let listing = self.get_listing(id).await?;
        if listing.moderation != ModerationState::Pending {
            return Err(MarketError::wrong_state(
                "listing",
                &format!("moderation already {}", listing.moderation.as_str()),
            ));
        }

        let rows = match decision {
            ModerationDecision::Reject => {
                self.db
                    .moderate_listing(id, ModerationState::Rejected, None, None, None, Utc::now())
                    .await?
            }
            ModerationDecision::Approve => {
                let logistics = listing
                    .self_certified
                    .then_some(LogisticsState::QualityChecked);
                self.approve_with_codes(id, logistics).await?
            }
        };

        if rows != 1 {
            return Err(MarketError::wrong_state("listing", "not pending moderation"));
        }

        tracing::info!(listing = %id, ?decision, %moderator, "listing moderated");
        self.notifier.publish(Topic::Listing, id);
        self.get_listing(id).await
    }

    /// The UNIQUE indexes on the code columns catch the (rare) collision
    /// with another active code; retry with fresh codes.
    async fn approve_with_codes(
        &self,
        id: ListingId,
        logistics: Option<LogisticsState>,
    ) -> Result<u64> {
        for _ in 0..CODE_RETRIES {
            let deposit_code = generate_code();
            let withdrawal_code = generate_code();
            match self
                .db
                .moderate_listing(
                    id,
                    ModerationState::Approved,
                    logistics,
                    Some(&deposit_code),
                    Some(&withdrawal_code),
                    Utc::now(),
                )
                .await
            {
                Ok(rows) => return Ok(rows),
                Err(MarketError::Database(sqlx::Error::Database(ref db)))
                    if db.is_unique_violation() =>
                {
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(MarketError::Validation(
            "could not allocate unique logistics codes".into(),
        ))
    }

    /// Inspection verdict, recorded once with the inspector's identity. A
    /// failed inspection bans the listing and drops its likes.
    pub async fn assess_conformity(
        &self,
        id: ListingId,
        verdict: ConformityVerdict,
        inspector: UserId,
    ) -> Result<Listing> {
        self.get_listing(id).await?;

        let (state, ban) = match verdict {
            ConformityVerdict::Conforme => (ConformityState::Conforme, false),
            ConformityVerdict::NonConforme => (ConformityState::NonConforme, true),
        };

        let rows = self
            .db
            .record_conformity(id, state, inspector, ban, Utc::now())
            .await?;
        if rows != 1 {
            return Err(MarketError::wrong_state("listing", "conformity already assessed"));
        }

        if ban {
            tracing::warn!(listing = %id, %inspector, "listing failed conformity inspection, banned");
        }
        self.notifier.publish(Topic::Listing, id);
        self.get_listing(id).await
    }

    /// Store counter: item handed over by the seller.
    pub async fn record_deposit(&self, code: &str) -> Result<Listing> {
        self.scan_deposit_code(code, LogisticsState::AwaitingDeposit, LogisticsState::Deposited)
            .await
    }

    /// Store counter: item inspected after deposit.
    pub async fn record_quality_check(&self, code: &str) -> Result<Listing> {
        self.scan_deposit_code(code, LogisticsState::Deposited, LogisticsState::QualityChecked)
            .await
    }

    async fn scan_deposit_code(
        &self,
        code: &str,
        from: LogisticsState,
        to: LogisticsState,
    ) -> Result<Listing> {
        let listing = self
            .db
            .get_listing_by_deposit_code(code)
            .await?
            .ok_or(MarketError::InvalidCode)?;

        let rows = self
            .db
            .advance_logistics(listing.id, from, to, Utc::now())
            .await?;
        if rows != 1 {
            return Err(MarketError::wrong_state(
                "listing",
                &format!("logistics not {}", from.as_str()),
            ));
        }

        tracing::info!(listing = %listing.id, from = from.as_str(), to = to.as_str(), "logistics advanced");
        self.notifier.publish(Topic::Listing, listing.id);
        self.get_listing(listing.id).await
    }

    /// Store counter: buyer picks the item up. The single event that makes
    /// escrowed funds payable; the settlement orchestrator chains the
    /// ledger release onto the returned listing.
    pub async fn record_withdrawal(&self, code: &str) -> Result<Listing> {
        let listing = self
            .db
            .get_listing_by_withdrawal_code(code)
            .await?
            .ok_or(MarketError::InvalidCode)?;

        let rows = self
            .db
            .advance_logistics(
                listing.id,
                LogisticsState::Sold,
                LogisticsState::WithdrawnByBuyer,
                Utc::now(),
            )
            .await?;
        if rows != 1 {
            return Err(MarketError::wrong_state("listing", "not sold or already withdrawn"));
        }

        tracing::info!(listing = %listing.id, "item withdrawn by buyer");
        self.notifier.publish(Topic::Listing, listing.id);
        self.get_listing(listing.id).await
    }

    /// Seller pulls an unsold listing. Soft delete: the row stays for
    /// audit but leaves every buyer-facing query; likes are dropped.
    pub async fn withdraw_listing(&self, id: ListingId, actor: UserId) -> Result<Listing> {
        let listing = self.get_listing(id).await?;
        if listing.seller_id != actor {
            return Err(MarketError::Forbidden(
                "only the seller can withdraw a listing".into(),
            ));
        }
        if listing.buyer_id.is_some() {
            return Err(MarketError::wrong_state("listing", "already sold"));
        }

        let rows = self.db.withdraw_listing(id, actor, Utc::now()).await?;
        if rows != 1 {
            return Err(MarketError::wrong_state("listing", "cannot be withdrawn"));
        }

        tracing::info!(listing = %id, seller = %actor, "listing withdrawn by seller");
        self.notifier.publish(Topic::Listing, id);
        self.get_listing(id).await
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_uppercase_alphanumerics() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn codes_vary() {
        let a = generate_code();
        let unique = (0..50).map(|_| generate_code()).any(|c| c != a);
        assert!(unique);
    }
}
