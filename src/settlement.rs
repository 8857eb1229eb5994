use crate::{
    database::Database,
    error::{MarketError, Result},
    ledger::Ledger,
    listing::ListingService,
    model::{ChatMessage, Listing, Transaction},
    negotiation::NegotiationService,
    notify::{Notifier, Topic},
    ListingId, OfferId, UserId,
};

/// The three operator scan modes at the store counter. Each maps 1:1 onto
/// a listing lifecycle operation; withdrawal additionally releases escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    VerifyDeposit,
    QualityCheck,
    ProcessWithdrawal,
}

/// Composes negotiation, listing lifecycle and ledger: a buyer action
/// (buy, pay an accepted offer) becomes an escrow transaction plus a sold
/// listing; a verified pickup becomes released funds.
#[derive(Clone)]
pub struct SettlementService {
    db: Database,
    listings: ListingService,
    ledger: Ledger,
    notifier: Notifier,
}

impl SettlementService {
    pub fn new(
        db: Database,
        listings: ListingService,
        ledger: Ledger,
        notifier: Notifier,
    ) -> Self {
        Self {
            db,
            listings,
            ledger,
            notifier,
        }
    }

    /// Direct purchase at the listed price.
    pub async fn buy_now(&self, listing_id: ListingId, buyer: UserId) -> Result<Transaction> {
        let listing = self.listings.get_listing(listing_id).await?;
        self.ledger
            .create_transaction(listing_id, buyer, listing.price, None)
            .await
    }

    /// Settles an accepted offer at the agreed amount. Only the
    /// conversation's buyer pays, whichever side authored the accepted
    /// (possibly counter-) offer.
    pub async fn pay_offer(&self, offer_id: OfferId, payer: UserId) -> Result<Transaction> {
        let offer = self
            .db
            .get_offer(offer_id)
            .await?
            .ok_or(MarketError::NotFound("offer", offer_id))?;
        let conv = self
            .db
            .get_conversation(offer.conversation_id)
            .await?
            .ok_or(MarketError::NotFound("conversation", offer.conversation_id))?;

        if payer != conv.buyer_id {
            return Err(MarketError::Forbidden("only the buyer can pay".into()));
        }
        offer.ensure_payable()?;

        let txn = self
            .ledger
            .create_transaction(offer.listing_id, payer, offer.amount, Some(offer_id))
            .await?;

        let receipt = ChatMessage::new(
            conv.id,
            payer,
            format!("Payment completed: {:.2}\u{20ac} held in escrow", offer.amount),
        );
        self.db.create_message(&receipt).await?;
        self.notifier.publish(Topic::Message, receipt.id);

        Ok(txn)
    }

    /// Verified pickup: advances the listing to WithdrawnByBuyer and
    /// releases the escrowed funds to the seller. The release side is
    /// idempotent, so a replayed withdrawal event cannot double-credit.
    pub async fn process_withdrawal(&self, code: &str) -> Result<(Listing, Transaction)> {
        let listing = self.listings.record_withdrawal(code).await?;

        let txn = self
            .db
            .transaction_for_listing(listing.id)
            .await?
            .ok_or_else(|| MarketError::wrong_state("listing", "sold without a transaction"))?;
        self.ledger.release_funds(txn.id).await?;

        let txn = self.ledger.get_transaction(txn.id).await?;
        Ok((listing, txn))
    }

    /// Operator text-input dispatch for the store counter.
    pub async fn scan(&self, mode: ScanMode, code: &str) -> Result<Listing> {
        match mode {
            ScanMode::VerifyDeposit => self.listings.record_deposit(code).await,
            ScanMode::QualityCheck => self.listings.record_quality_check(code).await,
            ScanMode::ProcessWithdrawal => {
                let (listing, _) = self.process_withdrawal(code).await?;
                Ok(listing)
            }
        }
    }

    /// Convenience wiring for a fully composed marketplace core.
    pub fn assemble(db: Database, notifier: Notifier) -> (ListingService, NegotiationService, Ledger, SettlementService) {
        let listings = ListingService::new(db.clone(), notifier.clone());
        let negotiation = NegotiationService::new(db.clone(), notifier.clone());
        let ledger = Ledger::new(db.clone(), notifier.clone());
        let settlement = SettlementService::new(db, listings.clone(), ledger.clone(), notifier);
        (listings, negotiation, ledger, settlement)
    }
}
