use crate::{
    ConversationId, ListingId, MarketError, MessageId, OfferId, PayoutId, Result, TransactionId,
    UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Editorial approval status of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationState {
    Pending,
    Approved,
    Rejected,
    WithdrawnBySeller,
    BannedByModerator,
}

/// Physical custody status of the item. Strictly forward-moving: an
/// operation may skip a stage (deposit bypass) but never go back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogisticsState {
    AwaitingDeposit,
    Deposited,
    QualityChecked,
    Sold,
    WithdrawnByBuyer,
}

impl LogisticsState {
    pub fn rank(self) -> u8 {
        match self {
            LogisticsState::AwaitingDeposit => 0,
            LogisticsState::Deposited => 1,
            LogisticsState::QualityChecked => 2,
            LogisticsState::Sold => 3,
            LogisticsState::WithdrawnByBuyer => 4,
        }
    }

    pub fn can_advance_to(self, next: LogisticsState) -> bool {
        next.rank() > self.rank()
    }
}

/// Inspection verdict on whether the physical item matches its description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConformityState {
    Pending,
    Conforme,
    NonConforme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Countered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletEntryKind {
    EscrowRelease,
    Payout,
}

macro_rules! state_codec {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = MarketError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(MarketError::Validation(format!(
                        concat!("invalid ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

state_codec!(ModerationState {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    WithdrawnBySeller => "WITHDRAWN_BY_SELLER",
    BannedByModerator => "BANNED_BY_MODERATOR",
});

state_codec!(LogisticsState {
    AwaitingDeposit => "AWAITING_DEPOSIT",
    Deposited => "DEPOSITED",
    QualityChecked => "QUALITY_CHECKED",
    Sold => "SOLD",
    WithdrawnByBuyer => "WITHDRAWN_BY_BUYER",
});

state_codec!(ConformityState {
    Pending => "PENDING",
    Conforme => "CONFORME",
    NonConforme => "NON_CONFORME",
});

state_codec!(OfferStatus {
    Pending => "PENDING",
    Accepted => "ACCEPTED",
    Declined => "DECLINED",
    Countered => "COUNTERED",
});

state_codec!(PaymentStatus {
    Unpaid => "UNPAID",
    Paid => "PAID",
    Refunded => "REFUNDED",
});

state_codec!(TransactionStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Refunded => "REFUNDED",
});

state_codec!(PayoutStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Rejected => "REJECTED",
});

state_codec!(WalletEntryKind {
    EscrowRelease => "ESCROW_RELEASE",
    Payout => "PAYOUT",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: UserId,
    pub buyer_id: Option<UserId>,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub moderation: ModerationState,
    pub logistics: LogisticsState,
    pub conformity: ConformityState,
    pub conformity_checked_by: Option<UserId>,
    pub conformity_checked_at: Option<DateTime<Utc>>,
    pub self_certified: bool,
    pub deposit_code: Option<String>,
    pub withdrawal_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(
        seller_id: UserId,
        title: String,
        description: Option<String>,
        category: Option<String>,
        price: f64,
        self_certified: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seller_id,
            buyer_id: None,
            title,
            description,
            category,
            price,
            moderation: ModerationState::Pending,
            logistics: LogisticsState::AwaitingDeposit,
            conformity: ConformityState::Pending,
            conformity_checked_by: None,
            conformity_checked_at: None,
            self_certified,
            deposit_code: None,
            withdrawal_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_purchasable(&self) -> bool {
        self.moderation == ModerationState::Approved
            && self.conformity != ConformityState::NonConforme
            && self.buyer_id.is_none()
    }

    pub fn ensure_purchasable(&self) -> Result<()> {
        if self.buyer_id.is_some() {
            return Err(MarketError::DuplicatePurchase);
        }
        if self.moderation != ModerationState::Approved {
            return Err(MarketError::wrong_state(
                "listing",
                "not approved for sale",
            ));
        }
        if self.conformity == ConformityState::NonConforme {
            return Err(MarketError::wrong_state(
                "listing",
                "failed conformity inspection",
            ));
        }
        Ok(())
    }
}

/// Two fixed roles per thread, assigned at creation and never swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(listing_id: ListingId, buyer_id: UserId, seller_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            buyer_id,
            seller_id,
            created_at: Utc::now(),
        }
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        user == self.buyer_id || user == self.seller_id
    }

    pub fn other_party(&self, user: UserId) -> Option<UserId> {
        if user == self.buyer_id {
            Some(self.seller_id)
        } else if user == self.seller_id {
            Some(self.buyer_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(conversation_id: ConversationId, sender_id: UserId, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body,
            read: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub conversation_id: ConversationId,
    pub listing_id: ListingId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub amount: f64,
    pub status: OfferStatus,
    pub payment_status: Option<PaymentStatus>,
    pub message_id: MessageId,
    pub transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        conversation_id: ConversationId,
        listing_id: ListingId,
        sender_id: UserId,
        receiver_id: UserId,
        amount: f64,
        message_id: MessageId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            listing_id,
            sender_id,
            receiver_id,
            amount,
            status: OfferStatus::Pending,
            payment_status: None,
            message_id,
            transaction_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn ensure_pending(&self) -> Result<()> {
        if self.status != OfferStatus::Pending {
            return Err(MarketError::wrong_state(
                "offer",
                &format!("already {}", self.status.as_str()),
            ));
        }
        Ok(())
    }

    pub fn ensure_payable(&self) -> Result<()> {
        if self.status != OfferStatus::Accepted {
            return Err(MarketError::wrong_state("offer", "not accepted"));
        }
        if self.payment_status != Some(PaymentStatus::Unpaid) {
            return Err(MarketError::wrong_state("offer", "already settled"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub gross_amount: f64,
    pub commission: f64,
    pub net_seller_amount: f64,
    pub status: TransactionStatus,
    pub funds_released: bool,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: PayoutId,
    pub user_id: UserId,
    pub amount: f64,
    pub account_ref: String,
    pub status: PayoutStatus,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<UserId>,
    pub rejection_reason: Option<String>,
}

impl PayoutRequest {
    pub fn new(user_id: UserId, amount: f64, account_ref: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            account_ref,
            status: PayoutStatus::Pending,
            requested_at: Utc::now(),
            processed_at: None,
            processed_by: None,
            rejection_reason: None,
        }
    }
}

/// One append-only row per wallet balance mutation, written in the same
/// database transaction as the mutation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: f64,
    pub kind: WalletEntryKind,
    pub reference_id: Uuid,
    pub balance_after: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistics_only_moves_forward() {
        use LogisticsState::*;
        assert!(AwaitingDeposit.can_advance_to(Deposited));
        assert!(AwaitingDeposit.can_advance_to(QualityChecked)); // deposit bypass
        assert!(Deposited.can_advance_to(QualityChecked));
        assert!(QualityChecked.can_advance_to(Sold));
        assert!(Sold.can_advance_to(WithdrawnByBuyer));

        assert!(!Deposited.can_advance_to(AwaitingDeposit));
        assert!(!Sold.can_advance_to(QualityChecked));
        assert!(!WithdrawnByBuyer.can_advance_to(Sold));
        assert!(!Sold.can_advance_to(Sold));
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [
            ModerationState::Pending,
            ModerationState::Approved,
            ModerationState::Rejected,
            ModerationState::WithdrawnBySeller,
            ModerationState::BannedByModerator,
        ] {
            assert_eq!(state.as_str().parse::<ModerationState>().unwrap(), state);
        }
        assert!("VENDU".parse::<LogisticsState>().is_err());
    }

    #[test]
    fn purchasability_requires_approval_and_no_buyer() {
        let seller = Uuid::new_v4();
        let mut listing = Listing::new(seller, "Vintage lamp".into(), None, None, 40.0, false);
        assert!(!listing.is_purchasable());

        listing.moderation = ModerationState::Approved;
        assert!(listing.is_purchasable());

        listing.conformity = ConformityState::NonConforme;
        assert!(listing.ensure_purchasable().is_err());

        listing.conformity = ConformityState::Conforme;
        listing.buyer_id = Some(Uuid::new_v4());
        assert!(matches!(
            listing.ensure_purchasable(),
            Err(MarketError::DuplicatePurchase)
        ));
    }

    #[test]
    fn offer_guards() {
        let conv = Uuid::new_v4();
        let listing = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let mut offer = Offer::new(conv, listing, buyer, seller, 50.0, Uuid::new_v4());

        assert!(offer.ensure_pending().is_ok());
        assert!(offer.ensure_payable().is_err());

        offer.status = OfferStatus::Accepted;
        offer.payment_status = Some(PaymentStatus::Unpaid);
        assert!(offer.ensure_pending().is_err());
        assert!(offer.ensure_payable().is_ok());

        offer.payment_status = Some(PaymentStatus::Paid);
        assert!(offer.ensure_payable().is_err());
    }
}
