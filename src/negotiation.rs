use crate::{
    database::Database,
    error::{MarketError, Result},
    model::{ChatMessage, Conversation, Offer, OfferStatus, PaymentStatus},
    notify::{Notifier, Topic},
    ConversationId, ListingId, OfferId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OfferAction {
    Accept,
    Decline,
    Counter(f64),
}

/// Offer/counter-offer protocol on top of a two-party chat thread. Exactly
/// one proposal may be live per conversation; resolving it (accept,
/// decline, counter) is the only way to open the next one.
#[derive(Clone)]
pub struct NegotiationService {
    db: Database,
    notifier: Notifier,
}

impl NegotiationService {
    pub fn new(db: Database, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Opens (or returns) the thread between a buyer and the listing's
    /// seller. Idempotent: concurrent calls converge on the same row.
    pub async fn find_or_create_conversation(
        &self,
        listing_id: ListingId,
        buyer: UserId,
    ) -> Result<Conversation> {
        let listing = self
            .db
            .get_listing(listing_id)
            .await?
            .ok_or(MarketError::NotFound("listing", listing_id))?;

        if listing.seller_id == buyer {
            return Err(MarketError::Forbidden(
                "seller cannot open a conversation on their own listing".into(),
            ));
        }

        let conv = self
            .db
            .find_or_create_conversation(&Conversation::new(listing_id, buyer, listing.seller_id))
            .await?;

        self.notifier.publish(Topic::Conversation, conv.id);
        Ok(conv)
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.db
            .get_conversation(id)
            .await?
            .ok_or(MarketError::NotFound("conversation", id))
    }

    pub async fn list_conversations(&self, user: UserId) -> Result<Vec<Conversation>> {
        self.db.conversations_for_user(user).await
    }

    pub async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<ChatMessage>> {
        self.db.messages_for_conversation(id).await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        body: &str,
    ) -> Result<ChatMessage> {
        let conv = self.get_conversation(conversation_id).await?;
        if !conv.is_participant(sender) {
            return Err(MarketError::Forbidden("not a participant".into()));
        }

        let message = ChatMessage::new(conversation_id, sender, body.to_string());
        self.db.create_message(&message).await?;

        self.notifier.publish(Topic::Message, message.id);
        Ok(message)
    }

    pub async fn mark_read(&self, conversation_id: ConversationId, reader: UserId) -> Result<()> {
        let conv = self.get_conversation(conversation_id).await?;
        if !conv.is_participant(reader) {
            return Err(MarketError::Forbidden("not a participant".into()));
        }

        self.db.mark_messages_read(conversation_id, reader).await?;
        Ok(())
    }

    /// Proposes a price to the other participant. The announcing chat
    /// message and the offer are written together.
    pub async fn make_offer(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        amount: f64,
    ) -> Result<Offer> {
        validate_amount(amount)?;

        let conv = self.get_conversation(conversation_id).await?;
        let receiver = conv
            .other_party(sender)
            .ok_or_else(|| MarketError::Forbidden("not a participant".into()))?;

        let message = ChatMessage::new(
            conversation_id,
            sender,
            format!("Offer: {amount:.2}\u{20ac}"),
        );
        let offer = Offer::new(
            conversation_id,
            conv.listing_id,
            sender,
            receiver,
            amount,
            message.id,
        );
        self.db.create_offer(&offer, &message).await?;

        tracing::info!(offer = %offer.id, conversation = %conversation_id, amount, "offer made");
        self.notifier.publish(Topic::Offer, offer.id);
        Ok(offer)
    }

    /// Receiver's move on a pending offer. Counter atomically retires the
    /// original and opens the replacement with roles swapped.
    pub async fn respond_to_offer(
        &self,
        offer_id: OfferId,
        actor: UserId,
        action: OfferAction,
    ) -> Result<Offer> {
        let offer = self
            .db
            .get_offer(offer_id)
            .await?
            .ok_or(MarketError::NotFound("offer", offer_id))?;

        if offer.receiver_id != actor {
            return Err(MarketError::Forbidden(
                "only the offer's receiver can respond".into(),
            ));
        }
        offer.ensure_pending()?;

        let resolved = match action {
            OfferAction::Accept => {
                let message = ChatMessage::new(
                    offer.conversation_id,
                    actor,
                    format!("Offer accepted: {:.2}\u{20ac}", offer.amount),
                );
                let rows = self
                    .db
                    .resolve_offer(
                        offer_id,
                        OfferStatus::Accepted,
                        Some(PaymentStatus::Unpaid),
                        &message,
                    )
                    .await?;
                if rows != 1 {
                    return Err(MarketError::wrong_state("offer", "already resolved"));
                }
                self.db.get_offer(offer_id).await?.unwrap_or(offer)
            }
            OfferAction::Decline => {
                let message = ChatMessage::new(
                    offer.conversation_id,
                    actor,
                    format!("Offer declined: {:.2}\u{20ac}", offer.amount),
                );
                let rows = self
                    .db
                    .resolve_offer(offer_id, OfferStatus::Declined, None, &message)
                    .await?;
                if rows != 1 {
                    return Err(MarketError::wrong_state("offer", "already resolved"));
                }
                self.db.get_offer(offer_id).await?.unwrap_or(offer)
            }
            OfferAction::Counter(amount) => {
                validate_amount(amount)?;

                let message = ChatMessage::new(
                    offer.conversation_id,
                    actor,
                    format!("Counter-offer: {amount:.2}\u{20ac}"),
                );
                let replacement = Offer::new(
                    offer.conversation_id,
                    offer.listing_id,
                    actor,
                    offer.sender_id,
                    amount,
                    message.id,
                );
                let rows = self
                    .db
                    .counter_offer(offer_id, &replacement, &message)
                    .await?;
                if rows != 1 {
                    return Err(MarketError::wrong_state("offer", "already resolved"));
                }
                replacement
            }
        };

        tracing::info!(offer = %offer_id, ?action, "offer resolved");
        self.notifier.publish(Topic::Offer, resolved.id);
        Ok(resolved)
    }
}

fn validate_amount(amount: f64) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(MarketError::InvalidAmount(amount));
    }
    Ok(())
}
