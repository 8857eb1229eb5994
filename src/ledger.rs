use crate::{
    database::Database,
    error::{MarketError, Result},
    model::{PayoutRequest, Transaction, TransactionStatus, WalletEntry},
    notify::{Notifier, Topic},
    ListingId, OfferId, PayoutId, TransactionId, UserId,
};
use chrono::Utc;
use uuid::Uuid;

/// Fixed platform rate: the buyer pays the agreed amount plus 10%
/// protection, the seller receives the agreed amount.
pub const COMMISSION_RATE: f64 = 0.10;

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommissionSplit {
    pub gross: f64,
    pub commission: f64,
    pub net_seller: f64,
}

/// Splits an agreed amount into the three money fields. Gross is derived
/// as net + commission so the accounting identity holds to the cent.
pub fn commission_split(amount: f64) -> CommissionSplit {
    let net_seller = round_cents(amount);
    let commission = round_cents(net_seller * COMMISSION_RATE);
    CommissionSplit {
        gross: round_cents(net_seller + commission),
        commission,
        net_seller,
    }
}

#[derive(Debug, Clone)]
pub enum PayoutDecision {
    Complete,
    Reject(String),
}

/// Escrow accounting: transaction creation, fund release after verified
/// pickup, wallet balances and payout processing.
#[derive(Clone)]
pub struct Ledger {
    db: Database,
    notifier: Notifier,
}

impl Ledger {
    pub fn new(db: Database, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Creates the escrow transaction and flips the listing to sold in one
    /// atomic write. Wallet settlement is synchronous, so the transaction
    /// is born Completed with funds still held in escrow.
    pub async fn create_transaction(
        &self,
        listing_id: ListingId,
        buyer: UserId,
        agreed_amount: f64,
        offer_id: Option<OfferId>,
    ) -> Result<Transaction> {
        if !agreed_amount.is_finite() || agreed_amount <= 0.0 {
            return Err(MarketError::InvalidAmount(agreed_amount));
        }

        let listing = self
            .db
            .get_listing(listing_id)
            .await?
            .ok_or(MarketError::NotFound("listing", listing_id))?;
        listing.ensure_purchasable()?;
        if listing.seller_id == buyer {
            return Err(MarketError::Forbidden(
                "seller cannot buy their own listing".into(),
            ));
        }

        let split = commission_split(agreed_amount);
        let txn = Transaction {
            id: Uuid::new_v4(),
            listing_id,
            buyer_id: buyer,
            seller_id: listing.seller_id,
            gross_amount: split.gross,
            commission: split.commission,
            net_seller_amount: split.net_seller,
            status: TransactionStatus::Completed,
            funds_released: false,
            created_at: Utc::now(),
            released_at: None,
        };

        let offer = match offer_id {
            Some(id) => Some(
                self.db
                    .get_offer(id)
                    .await?
                    .ok_or(MarketError::NotFound("offer", id))?,
            ),
            None => None,
        };
        self.db.purchase_listing(&txn, offer.as_ref()).await?;

        tracing::info!(
            transaction = %txn.id,
            listing = %listing_id,
            %buyer,
            gross = txn.gross_amount,
            commission = txn.commission,
            "escrow transaction created"
        );
        self.notifier.publish(Topic::Transaction, txn.id);
        self.notifier.publish(Topic::Listing, listing_id);
        Ok(txn)
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.db
            .get_transaction(id)
            .await?
            .ok_or(MarketError::NotFound("transaction", id))
    }

    /// Converts escrow into payable seller funds. Idempotent: replaying
    /// the withdrawal event is a no-op, the wallet is credited exactly
    /// once. Returns whether this call performed the release.
    pub async fn release_funds(&self, transaction_id: TransactionId) -> Result<bool> {
        let released = self
            .db
            .release_transaction_funds(transaction_id, Utc::now())
            .await?;

        if released {
            let txn = self.get_transaction(transaction_id).await?;
            tracing::info!(
                transaction = %transaction_id,
                seller = %txn.seller_id,
                amount = txn.net_seller_amount,
                "escrow released to seller wallet"
            );
            self.notifier.publish(Topic::Transaction, transaction_id);
            self.notifier.publish(Topic::Wallet, txn.seller_id);
        } else {
            tracing::debug!(transaction = %transaction_id, "duplicate release ignored");
        }

        Ok(released)
    }

    pub async fn wallet_balance(&self, user: UserId) -> Result<f64> {
        self.db.wallet_balance(user).await
    }

    pub async fn wallet_history(&self, user: UserId) -> Result<Vec<WalletEntry>> {
        self.db.wallet_history(user).await
    }

    /// Balance is checked at request time and re-validated at processing
    /// time; it can change in between.
    pub async fn request_payout(
        &self,
        user: UserId,
        amount: f64,
        account_ref: &str,
    ) -> Result<PayoutRequest> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(MarketError::InvalidAmount(amount));
        }
        if account_ref.trim().is_empty() {
            return Err(MarketError::Validation("account reference required".into()));
        }

        let balance = self.db.wallet_balance(user).await?;
        if amount > balance {
            return Err(MarketError::InsufficientFunds {
                requested: amount,
                available: balance,
            });
        }

        let payout = PayoutRequest::new(user, amount, account_ref.trim().to_string());
        self.db.create_payout(&payout).await?;

        tracing::info!(payout = %payout.id, %user, amount, "payout requested");
        self.notifier.publish(Topic::Payout, payout.id);
        Ok(payout)
    }

    pub async fn list_payouts(
        &self,
        status: Option<crate::model::PayoutStatus>,
    ) -> Result<Vec<PayoutRequest>> {
        self.db.list_payouts(status).await
    }

    /// Back-office decision on a pending payout. Completion debits the
    /// wallet and appends the balance-history entry atomically.
    pub async fn process_payout(
        &self,
        request_id: PayoutId,
        decision: PayoutDecision,
        operator: UserId,
    ) -> Result<PayoutRequest> {
        match decision {
            PayoutDecision::Complete => {
                self.db.complete_payout(request_id, operator, Utc::now()).await?;
                tracing::info!(payout = %request_id, %operator, "payout completed");
            }
            PayoutDecision::Reject(ref reason) => {
                let rows = self
                    .db
                    .reject_payout(request_id, operator, reason, Utc::now())
                    .await?;
                if rows != 1 {
                    self.db
                        .get_payout(request_id)
                        .await?
                        .ok_or(MarketError::NotFound("payout request", request_id))?;
                    return Err(MarketError::wrong_state("payout request", "not pending"));
                }
                tracing::info!(payout = %request_id, %operator, %reason, "payout rejected");
            }
        }

        self.notifier.publish(Topic::Payout, request_id);
        self.db
            .get_payout(request_id)
            .await?
            .ok_or(MarketError::NotFound("payout request", request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_adds_up() {
        let split = commission_split(100.0);
        assert_eq!(split.gross, 110.0);
        assert_eq!(split.commission, 10.0);
        assert_eq!(split.net_seller, 100.0);
        assert_eq!(split.gross, split.net_seller + split.commission);
    }

    #[test]
    fn split_rounds_to_cents() {
        let split = commission_split(33.33);
        assert_eq!(split.net_seller, 33.33);
        assert_eq!(split.commission, 3.33);
        assert_eq!(split.gross, 36.66);

        let split = commission_split(0.05);
        assert_eq!(split.commission, 0.01);
        assert_eq!(split.gross, split.net_seller + split.commission);
    }

    #[test]
    fn split_is_the_same_for_buy_and_offer_paths() {
        // Both settlement paths call the same function; pin the identity
        // for a spread of realistic prices.
        for amount in [1.0, 9.99, 49.5, 100.0, 249.99, 1000.0] {
            let split = commission_split(amount);
            assert!((split.gross - (split.net_seller + split.commission)).abs() < 1e-9);
            assert!((split.commission - round_cents(amount * COMMISSION_RATE)).abs() < 1e-9);
        }
    }
}
