use kirppu::{
    database::Database,
    error::{MarketError, Result},
    ledger::{Ledger, PayoutDecision},
    listing::{ConformityVerdict, ListingService, ModerationDecision},
    model::{
        ConformityState, Listing, LogisticsState, ModerationState, OfferStatus, PaymentStatus,
        PayoutStatus, TransactionStatus, WalletEntryKind,
    },
    negotiation::{NegotiationService, OfferAction},
    notify::Notifier,
    settlement::{ScanMode, SettlementService},
};
use tempfile::NamedTempFile;
use uuid::Uuid;

struct TestMarket {
    _db_file: NamedTempFile,
    db: Database,
    listings: ListingService,
    negotiation: NegotiationService,
    ledger: Ledger,
    settlement: SettlementService,
}

async fn setup() -> Result<TestMarket> {
    let db_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite://{}", db_file.path().to_string_lossy());
    let db = Database::new(&db_url).await?;

    let notifier = Notifier::default();
    let (listings, negotiation, ledger, settlement) =
        SettlementService::assemble(db.clone(), notifier);

    Ok(TestMarket {
        _db_file: db_file,
        db,
        listings,
        negotiation,
        ledger,
        settlement,
    })
}

async fn approved_listing(
    market: &TestMarket,
    seller: Uuid,
    price: f64,
    self_certified: bool,
) -> Result<Listing> {
    let listing = market
        .listings
        .create_listing(
            seller,
            "Vintage lamp",
            Some("Teak base, 1960s"),
            Some("FURNITURE"),
            price,
            self_certified,
        )
        .await?;

    market
        .listings
        .moderate(listing.id, ModerationDecision::Approve, Uuid::new_v4())
        .await
}

#[tokio::test]
async fn test_direct_purchase_commission_split() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;
    assert_eq!(listing.moderation, ModerationState::Approved);
    assert_eq!(listing.logistics, LogisticsState::QualityChecked);
    assert!(listing.deposit_code.is_some());
    assert!(listing.withdrawal_code.is_some());

    let txn = market.settlement.buy_now(listing.id, buyer).await?;
    assert_eq!(txn.gross_amount, 110.0);
    assert_eq!(txn.commission, 10.0);
    assert_eq!(txn.net_seller_amount, 100.0);
    assert_eq!(txn.gross_amount, txn.net_seller_amount + txn.commission);
    assert_eq!(txn.status, TransactionStatus::Completed);
    assert!(!txn.funds_released);

    let listing = market.listings.get_listing(listing.id).await?;
    assert_eq!(listing.buyer_id, Some(buyer));
    assert_eq!(listing.logistics, LogisticsState::Sold);

    // escrow held: nothing payable yet
    assert_eq!(market.ledger.wallet_balance(seller).await?, 0.0);

    Ok(())
}

#[tokio::test]
async fn test_double_purchase_has_one_winner() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 50.0, true).await?;

    market
        .settlement
        .buy_now(listing.id, Uuid::new_v4())
        .await?;
    let second = market.settlement.buy_now(listing.id, Uuid::new_v4()).await;
    assert!(matches!(second, Err(MarketError::DuplicatePurchase)));

    Ok(())
}

#[tokio::test]
async fn test_withdrawal_releases_escrow_exactly_once() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;
    let code = listing.withdrawal_code.clone().unwrap();

    let txn = market.settlement.buy_now(listing.id, buyer).await?;

    let (listing_after, txn_after) = market.settlement.process_withdrawal(&code).await?;
    assert_eq!(listing_after.logistics, LogisticsState::WithdrawnByBuyer);
    assert!(txn_after.funds_released);
    assert!(txn_after.released_at.is_some());
    assert_eq!(market.ledger.wallet_balance(seller).await?, 100.0);

    // a second scan of the same code loses the state race
    let replay = market.settlement.process_withdrawal(&code).await;
    assert!(matches!(replay, Err(MarketError::WrongState(_))));

    // a replayed release event is an idempotent no-op
    let released_again = market.ledger.release_funds(txn.id).await?;
    assert!(!released_again);
    assert_eq!(market.ledger.wallet_balance(seller).await?, 100.0);

    let history = market.ledger.wallet_history(seller).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, WalletEntryKind::EscrowRelease);
    assert_eq!(history[0].amount, 100.0);
    assert_eq!(history[0].balance_after, 100.0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_code_is_rejected() -> Result<()> {
    let market = setup().await?;

    let result = market
        .settlement
        .scan(ScanMode::VerifyDeposit, "ZZZZZZ")
        .await;
    assert!(matches!(result, Err(MarketError::InvalidCode)));

    Ok(())
}

#[tokio::test]
async fn test_deposit_flow_for_uncertified_listing() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 40.0, false).await?;
    // no self-certification: the item must pass through the store
    assert_eq!(listing.logistics, LogisticsState::AwaitingDeposit);
    let code = listing.deposit_code.clone().unwrap();

    // quality check before deposit is out of order
    let early = market.settlement.scan(ScanMode::QualityCheck, &code).await;
    assert!(matches!(early, Err(MarketError::WrongState(_))));

    let listing = market.settlement.scan(ScanMode::VerifyDeposit, &code).await?;
    assert_eq!(listing.logistics, LogisticsState::Deposited);

    // depositing twice is caught by the state guard
    let replay = market.settlement.scan(ScanMode::VerifyDeposit, &code).await;
    assert!(matches!(replay, Err(MarketError::WrongState(_))));

    let listing = market.settlement.scan(ScanMode::QualityCheck, &code).await?;
    assert_eq!(listing.logistics, LogisticsState::QualityChecked);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_quality_scans_have_one_winner() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 40.0, false).await?;
    let code = listing.deposit_code.clone().unwrap();
    market.listings.record_deposit(&code).await?;

    let (a, b) = tokio::join!(
        market.listings.record_quality_check(&code),
        market.listings.record_quality_check(&code),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(MarketError::WrongState(_))));

    let listing = market.listings.get_listing(listing.id).await?;
    assert_eq!(listing.logistics, LogisticsState::QualityChecked);

    Ok(())
}

#[tokio::test]
async fn test_offer_negotiation_round_trip() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;
    let conv = market
        .negotiation
        .find_or_create_conversation(listing.id, buyer)
        .await?;

    // buyer opens at 50, seller declines
    let first = market.negotiation.make_offer(conv.id, buyer, 50.0).await?;
    assert_eq!(first.receiver_id, seller);
    let first = market
        .negotiation
        .respond_to_offer(first.id, seller, OfferAction::Decline)
        .await?;
    assert_eq!(first.status, OfferStatus::Declined);

    // the declined offer is terminal, a new one may open
    let second = market.negotiation.make_offer(conv.id, buyer, 60.0).await?;

    // but only one proposal can be live at a time
    let third = market.negotiation.make_offer(conv.id, buyer, 65.0).await;
    assert!(matches!(third, Err(MarketError::WrongState(_))));

    // seller counters: the original is resolved and exactly one new
    // pending offer exists, with roles swapped
    let counter = market
        .negotiation
        .respond_to_offer(second.id, seller, OfferAction::Counter(80.0))
        .await?;
    assert_eq!(counter.sender_id, seller);
    assert_eq!(counter.receiver_id, buyer);
    assert_eq!(counter.status, OfferStatus::Pending);

    let second = market.db.get_offer(second.id).await?.unwrap();
    assert_eq!(second.status, OfferStatus::Countered);

    // responding to the countered offer again is rejected
    let stale = market
        .negotiation
        .respond_to_offer(second.id, seller, OfferAction::Accept)
        .await;
    assert!(matches!(stale, Err(MarketError::WrongState(_))));

    // buyer accepts the counter and pays the agreed amount
    let counter = market
        .negotiation
        .respond_to_offer(counter.id, buyer, OfferAction::Accept)
        .await?;
    assert_eq!(counter.status, OfferStatus::Accepted);
    assert_eq!(counter.payment_status, Some(PaymentStatus::Unpaid));

    let txn = market.settlement.pay_offer(counter.id, buyer).await?;
    assert_eq!(txn.gross_amount, 88.0);
    assert_eq!(txn.commission, 8.0);
    assert_eq!(txn.net_seller_amount, 80.0);

    let counter = market.db.get_offer(counter.id).await?.unwrap();
    assert_eq!(counter.payment_status, Some(PaymentStatus::Paid));
    assert_eq!(counter.transaction_id, Some(txn.id));

    // paying twice is rejected
    let again = market.settlement.pay_offer(counter.id, buyer).await;
    assert!(matches!(again, Err(MarketError::WrongState(_))));

    Ok(())
}

#[tokio::test]
async fn test_offer_authorization() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;
    let conv = market
        .negotiation
        .find_or_create_conversation(listing.id, buyer)
        .await?;

    assert!(matches!(
        market.negotiation.make_offer(conv.id, buyer, 0.0).await,
        Err(MarketError::InvalidAmount(_))
    ));
    assert!(matches!(
        market
            .negotiation
            .make_offer(conv.id, Uuid::new_v4(), 50.0)
            .await,
        Err(MarketError::Forbidden(_))
    ));

    let offer = market.negotiation.make_offer(conv.id, buyer, 50.0).await?;

    // only the receiver may respond
    let by_sender = market
        .negotiation
        .respond_to_offer(offer.id, buyer, OfferAction::Accept)
        .await;
    assert!(matches!(by_sender, Err(MarketError::Forbidden(_))));

    market
        .negotiation
        .respond_to_offer(offer.id, seller, OfferAction::Accept)
        .await?;

    // only the conversation's buyer pays, even for seller-sent offers
    let by_stranger = market.settlement.pay_offer(offer.id, Uuid::new_v4()).await;
    assert!(matches!(by_stranger, Err(MarketError::Forbidden(_))));
    let by_seller = market.settlement.pay_offer(offer.id, seller).await;
    assert!(matches!(by_seller, Err(MarketError::Forbidden(_))));

    Ok(())
}

#[tokio::test]
async fn test_conversation_creation_is_idempotent() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;

    let a = market
        .negotiation
        .find_or_create_conversation(listing.id, buyer)
        .await?;
    let b = market
        .negotiation
        .find_or_create_conversation(listing.id, buyer)
        .await?;
    assert_eq!(a.id, b.id);
    assert_eq!(a.buyer_id, buyer);
    assert_eq!(a.seller_id, seller);

    // the seller has no buyer role on their own listing
    let own = market
        .negotiation
        .find_or_create_conversation(listing.id, seller)
        .await;
    assert!(matches!(own, Err(MarketError::Forbidden(_))));

    Ok(())
}

#[tokio::test]
async fn test_moderation_guards() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let moderator = Uuid::new_v4();

    let missing = market
        .listings
        .moderate(Uuid::new_v4(), ModerationDecision::Approve, moderator)
        .await;
    assert!(matches!(missing, Err(MarketError::NotFound(_, _))));

    let listing = market
        .listings
        .create_listing(seller, "Old books", None, Some("BOOKS"), 12.5, false)
        .await?;
    assert_eq!(listing.moderation, ModerationState::Pending);

    let listing = market
        .listings
        .moderate(listing.id, ModerationDecision::Reject, moderator)
        .await?;
    assert_eq!(listing.moderation, ModerationState::Rejected);
    assert!(listing.deposit_code.is_none());

    // moderation is single-shot
    let again = market
        .listings
        .moderate(listing.id, ModerationDecision::Approve, moderator)
        .await;
    assert!(matches!(again, Err(MarketError::WrongState(_))));

    // rejected listings are not purchasable
    let buy = market.settlement.buy_now(listing.id, Uuid::new_v4()).await;
    assert!(matches!(buy, Err(MarketError::WrongState(_))));

    // the seller may resubmit after rejection, and only the seller
    let stranger = market
        .listings
        .submit_for_moderation(listing.id, Uuid::new_v4())
        .await;
    assert!(matches!(stranger, Err(MarketError::Forbidden(_))));

    let listing = market.listings.submit_for_moderation(listing.id, seller).await?;
    assert_eq!(listing.moderation, ModerationState::Pending);

    let listing = market
        .listings
        .moderate(listing.id, ModerationDecision::Approve, moderator)
        .await?;
    assert_eq!(listing.moderation, ModerationState::Approved);
    assert_eq!(listing.logistics, LogisticsState::AwaitingDeposit);

    // approved listings cannot be resubmitted
    let approved = market.listings.submit_for_moderation(listing.id, seller).await;
    assert!(matches!(approved, Err(MarketError::WrongState(_))));

    Ok(())
}

#[tokio::test]
async fn test_failed_conformity_bans_listing_and_drops_likes() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let inspector = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 75.0, false).await?;
    market.db.add_like(Uuid::new_v4(), listing.id).await?;
    market.db.add_like(Uuid::new_v4(), listing.id).await?;
    assert_eq!(market.db.like_count(listing.id).await?, 2);

    let listing = market
        .listings
        .assess_conformity(listing.id, ConformityVerdict::NonConforme, inspector)
        .await?;
    assert_eq!(listing.conformity, ConformityState::NonConforme);
    assert_eq!(listing.moderation, ModerationState::BannedByModerator);
    assert_eq!(listing.conformity_checked_by, Some(inspector));
    assert!(listing.conformity_checked_at.is_some());
    assert_eq!(market.db.like_count(listing.id).await?, 0);

    let buy = market.settlement.buy_now(listing.id, Uuid::new_v4()).await;
    assert!(matches!(buy, Err(MarketError::WrongState(_))));

    // the verdict is recorded once
    let again = market
        .listings
        .assess_conformity(listing.id, ConformityVerdict::Conforme, inspector)
        .await;
    assert!(matches!(again, Err(MarketError::WrongState(_))));

    Ok(())
}

#[tokio::test]
async fn test_seller_withdrawal_is_soft_delete() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 30.0, true).await?;
    market.db.add_like(Uuid::new_v4(), listing.id).await?;
    assert_eq!(market.listings.browse().await?.len(), 1);

    let stranger = market
        .listings
        .withdraw_listing(listing.id, Uuid::new_v4())
        .await;
    assert!(matches!(stranger, Err(MarketError::Forbidden(_))));

    let listing = market.listings.withdraw_listing(listing.id, seller).await?;
    assert_eq!(listing.moderation, ModerationState::WithdrawnBySeller);
    assert_eq!(market.db.like_count(listing.id).await?, 0);

    // gone from buyer-facing queries, still readable for audit
    assert!(market.listings.browse().await?.is_empty());
    assert!(market.listings.get_listing(listing.id).await.is_ok());

    // a sold listing cannot be withdrawn
    let sold = approved_listing(&market, seller, 30.0, true).await?;
    market.settlement.buy_now(sold.id, Uuid::new_v4()).await?;
    let late = market.listings.withdraw_listing(sold.id, seller).await;
    assert!(matches!(late, Err(MarketError::WrongState(_))));

    Ok(())
}

#[tokio::test]
async fn test_payout_lifecycle_and_revalidation() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    let operator = Uuid::new_v4();

    // requesting against an empty wallet fails and creates nothing
    let broke = market
        .ledger
        .request_payout(seller, 50.0, "FI12 3456 7890 1234 56")
        .await;
    assert!(matches!(broke, Err(MarketError::InsufficientFunds { .. })));
    assert!(market.ledger.list_payouts(None).await?.is_empty());

    // fund the wallet through a full sale + pickup
    let listing = approved_listing(&market, seller, 100.0, true).await?;
    let code = listing.withdrawal_code.clone().unwrap();
    market.settlement.buy_now(listing.id, buyer).await?;
    market.settlement.process_withdrawal(&code).await?;
    assert_eq!(market.ledger.wallet_balance(seller).await?, 100.0);

    let over = market
        .ledger
        .request_payout(seller, 150.0, "FI12 3456 7890 1234 56")
        .await;
    assert!(matches!(over, Err(MarketError::InsufficientFunds { .. })));

    // two requests within balance at request time
    let first = market
        .ledger
        .request_payout(seller, 80.0, "FI12 3456 7890 1234 56")
        .await?;
    let second = market
        .ledger
        .request_payout(seller, 80.0, "FI12 3456 7890 1234 56")
        .await?;

    let first = market
        .ledger
        .process_payout(first.id, PayoutDecision::Complete, operator)
        .await?;
    assert_eq!(first.status, PayoutStatus::Completed);
    assert_eq!(market.ledger.wallet_balance(seller).await?, 20.0);

    // balance moved since the request: completion re-validates
    let stale = market
        .ledger
        .process_payout(second.id, PayoutDecision::Complete, operator)
        .await;
    assert!(matches!(stale, Err(MarketError::InsufficientFunds { .. })));
    let second = market.db.get_payout(second.id).await?.unwrap();
    assert_eq!(second.status, PayoutStatus::Pending);

    let second = market
        .ledger
        .process_payout(
            second.id,
            PayoutDecision::Reject("balance no longer covers the request".into()),
            operator,
        )
        .await?;
    assert_eq!(second.status, PayoutStatus::Rejected);
    assert!(second.rejection_reason.is_some());

    // processing is single-shot
    let done = market
        .ledger
        .process_payout(first.id, PayoutDecision::Complete, operator)
        .await;
    assert!(matches!(done, Err(MarketError::WrongState(_))));

    let history = market.ledger.wallet_history(seller).await?;
    assert_eq!(history.len(), 2); // one release, one payout
    let payout_entry = history
        .iter()
        .find(|e| e.kind == WalletEntryKind::Payout)
        .unwrap();
    assert_eq!(payout_entry.amount, -80.0);
    assert_eq!(payout_entry.balance_after, 20.0);

    Ok(())
}

#[tokio::test]
async fn test_chat_thread_alongside_offers() -> Result<()> {
    let market = setup().await?;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let listing = approved_listing(&market, seller, 100.0, true).await?;
    let conv = market
        .negotiation
        .find_or_create_conversation(listing.id, buyer)
        .await?;

    market
        .negotiation
        .send_message(conv.id, buyer, "Is the shade original?")
        .await?;
    market
        .negotiation
        .send_message(conv.id, seller, "Yes, never replaced.")
        .await?;
    market.negotiation.make_offer(conv.id, buyer, 50.0).await?;

    // plain messages plus the offer announcement
    let messages = market.negotiation.conversation_messages(conv.id).await?;
    assert_eq!(messages.len(), 3);
    assert!(messages[2].body.contains("50.00"));

    market.negotiation.mark_read(conv.id, seller).await?;
    let messages = market.negotiation.conversation_messages(conv.id).await?;
    assert!(messages
        .iter()
        .filter(|m| m.sender_id == buyer)
        .all(|m| m.read));

    let listed = market.negotiation.list_conversations(buyer).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, conv.id);

    let outsider = market
        .negotiation
        .send_message(conv.id, Uuid::new_v4(), "hello")
        .await;
    assert!(matches!(outsider, Err(MarketError::Forbidden(_))));

    Ok(())
}
