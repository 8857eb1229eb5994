use crate::{
    model::*, ConversationId, ListingId, MarketError, OfferId, PayoutId, Result, TransactionId,
    UserId,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite-backed store. Every guarded state transition is expressed as a
/// conditional UPDATE checked through `rows_affected`, and the writes with
/// financial consequences (purchase, fund release, payout completion) run
/// inside a single database transaction.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                seller_id TEXT NOT NULL,
                buyer_id TEXT,
                title TEXT NOT NULL,
                description TEXT,
                category TEXT,
                price REAL NOT NULL,
                moderation TEXT NOT NULL,
                logistics TEXT NOT NULL,
                conformity TEXT NOT NULL,
                conformity_checked_by TEXT,
                conformity_checked_at DATETIME,
                self_certified INTEGER NOT NULL DEFAULT 0,
                deposit_code TEXT UNIQUE,
                withdrawal_code TEXT UNIQUE,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                listing_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                UNIQUE (listing_id, buyer_id, seller_id),
                FOREIGN KEY (listing_id) REFERENCES listings(id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS offers (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                listing_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                amount REAL NOT NULL,
                status TEXT NOT NULL,
                payment_status TEXT,
                message_id TEXT NOT NULL,
                transaction_id TEXT,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (listing_id) REFERENCES listings(id)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                listing_id TEXT NOT NULL UNIQUE,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                gross_amount REAL NOT NULL,
                commission REAL NOT NULL,
                net_seller_amount REAL NOT NULL,
                status TEXT NOT NULL,
                funds_released INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                released_at DATETIME,
                FOREIGN KEY (listing_id) REFERENCES listings(id)
            );

            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS wallet_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount REAL NOT NULL,
                kind TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                balance_after REAL NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payout_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount REAL NOT NULL,
                account_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_at DATETIME NOT NULL,
                processed_at DATETIME,
                processed_by TEXT,
                rejection_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS likes (
                user_id TEXT NOT NULL,
                listing_id TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                PRIMARY KEY (user_id, listing_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_offers_one_pending
                ON offers(conversation_id) WHERE status = 'PENDING';

            CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings(seller_id);
            CREATE INDEX IF NOT EXISTS idx_listings_moderation ON listings(moderation);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_offers_conversation ON offers(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_wallet_entries_user ON wallet_entries(user_id);
            CREATE INDEX IF NOT EXISTS idx_payouts_status ON payout_requests(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- listings ----

    pub async fn create_listing(&self, listing: &Listing) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (id, seller_id, buyer_id, title, description, category, price,
                moderation, logistics, conformity, conformity_checked_by, conformity_checked_at,
                self_certified, deposit_code, withdrawal_code, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(listing.id.to_string())
        .bind(listing.seller_id.to_string())
        .bind(listing.buyer_id.map(|id| id.to_string()))
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(&listing.category)
        .bind(listing.price)
        .bind(listing.moderation.as_str())
        .bind(listing.logistics.as_str())
        .bind(listing.conformity.as_str())
        .bind(listing.conformity_checked_by.map(|id| id.to_string()))
        .bind(listing.conformity_checked_at)
        .bind(listing.self_certified)
        .bind(&listing.deposit_code)
        .bind(&listing.withdrawal_code)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_listing(&self, id: ListingId) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| listing_from_row(&r)).transpose()
    }

    pub async fn get_listing_by_deposit_code(&self, code: &str) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE deposit_code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| listing_from_row(&r)).transpose()
    }

    pub async fn get_listing_by_withdrawal_code(&self, code: &str) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE withdrawal_code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| listing_from_row(&r)).transpose()
    }

    /// Buyer-facing catalogue: approved, not failed inspection, unsold.
    pub async fn browse_listings(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM listings
            WHERE moderation = 'APPROVED' AND conformity != 'NON_CONFORME' AND buyer_id IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(listing_from_row).collect()
    }

    pub async fn listings_by_seller(&self, seller_id: UserId) -> Result<Vec<Listing>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM listings
            WHERE seller_id = ?
              AND moderation NOT IN ('WITHDRAWN_BY_SELLER', 'BANNED_BY_MODERATOR')
            ORDER BY created_at DESC
            "#,
        )
        .bind(seller_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(listing_from_row).collect()
    }

    /// Moderation decision, legal only while the listing is still Pending.
    /// Logistics and codes are only touched when provided (approval path).
    pub async fn moderate_listing(
        &self,
        id: ListingId,
        moderation: ModerationState,
        logistics: Option<LogisticsState>,
        deposit_code: Option<&str>,
        withdrawal_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET moderation = ?,
                logistics = COALESCE(?, logistics),
                deposit_code = COALESCE(?, deposit_code),
                withdrawal_code = COALESCE(?, withdrawal_code),
                updated_at = ?
            WHERE id = ? AND moderation = 'PENDING'
            "#,
        )
        .bind(moderation.as_str())
        .bind(logistics.map(|l| l.as_str()))
        .bind(deposit_code)
        .bind(withdrawal_code)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Puts a Rejected listing back into the moderation queue.
    pub async fn resubmit_listing(&self, id: ListingId, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET moderation = 'PENDING', updated_at = ?
            WHERE id = ? AND moderation = 'REJECTED'
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Records the inspection verdict; a failed inspection also bans the
    /// listing and cascades deletion of its likes, in one transaction.
    pub async fn record_conformity(
        &self,
        id: ListingId,
        verdict: ConformityState,
        inspector: UserId,
        ban: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE listings
            SET conformity = ?,
                conformity_checked_by = ?,
                conformity_checked_at = ?,
                moderation = CASE WHEN ? THEN 'BANNED_BY_MODERATOR' ELSE moderation END,
                updated_at = ?
            WHERE id = ? AND conformity = 'PENDING'
            "#,
        )
        .bind(verdict.as_str())
        .bind(inspector.to_string())
        .bind(now)
        .bind(ban)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 && ban {
            sqlx::query("DELETE FROM likes WHERE listing_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Compare-and-swap on the logistics column; the losing side of a
    /// concurrent scan sees zero rows affected.
    pub async fn advance_logistics(
        &self,
        id: ListingId,
        from: LogisticsState,
        to: LogisticsState,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE listings SET logistics = ?, updated_at = ? WHERE id = ? AND logistics = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Seller withdrawal: soft delete, only while no buyer is attached.
    pub async fn withdraw_listing(
        &self,
        id: ListingId,
        seller_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE listings
            SET moderation = 'WITHDRAWN_BY_SELLER', updated_at = ?
            WHERE id = ? AND seller_id = ? AND buyer_id IS NULL
              AND moderation IN ('PENDING', 'APPROVED', 'REJECTED')
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .bind(seller_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            sqlx::query("DELETE FROM likes WHERE listing_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // ---- conversations & messages ----

    /// Idempotent, first-writer-wins: concurrent attempts for the same
    /// (listing, buyer, seller) converge on one row.
    pub async fn find_or_create_conversation(&self, conv: &Conversation) -> Result<Conversation> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, listing_id, buyer_id, seller_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (listing_id, buyer_id, seller_id) DO NOTHING
            "#,
        )
        .bind(conv.id.to_string())
        .bind(conv.listing_id.to_string())
        .bind(conv.buyer_id.to_string())
        .bind(conv.seller_id.to_string())
        .bind(conv.created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM conversations WHERE listing_id = ? AND buyer_id = ? AND seller_id = ?",
        )
        .bind(conv.listing_id.to_string())
        .bind(conv.buyer_id.to_string())
        .bind(conv.seller_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        conversation_from_row(&row)
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| conversation_from_row(&r)).transpose()
    }

    pub async fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM conversations
            WHERE buyer_id = ? OR seller_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user.to_string())
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        insert_message(&self.pool, message).await
    }

    pub async fn messages_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET read = 1 WHERE conversation_id = ? AND sender_id != ?",
        )
        .bind(conversation_id.to_string())
        .bind(reader.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- offers ----

    /// Inserts the offer together with its announcing chat message. The
    /// partial unique index on pending offers makes a second live proposal
    /// in the same conversation fail here.
    pub async fn create_offer(&self, offer: &Offer, message: &ChatMessage) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        insert_message(&mut *tx, message).await?;
        insert_offer(&mut *tx, offer)
            .await
            .map_err(map_pending_offer_conflict)?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_offer(&self, id: OfferId) -> Result<Option<Offer>> {
        let row = sqlx::query("SELECT * FROM offers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| offer_from_row(&r)).transpose()
    }

    /// Accept/decline: CAS on Pending plus the announcing message. Returns
    /// zero when a concurrent caller already resolved the offer.
    pub async fn resolve_offer(
        &self,
        id: OfferId,
        status: OfferStatus,
        payment_status: Option<PaymentStatus>,
        message: &ChatMessage,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE offers SET status = ?, payment_status = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(payment_status.map(|p| p.as_str()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            insert_message(&mut *tx, message).await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Counter-offer: atomically retires the original Pending offer and
    /// creates the replacement with roles swapped. Either both writes land
    /// or neither does.
    pub async fn counter_offer(
        &self,
        original: OfferId,
        replacement: &Offer,
        message: &ChatMessage,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE offers SET status = 'COUNTERED' WHERE id = ? AND status = 'PENDING'",
        )
        .bind(original.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(0);
        }

        insert_message(&mut *tx, message).await?;
        insert_offer(&mut *tx, replacement)
            .await
            .map_err(map_pending_offer_conflict)?;

        tx.commit().await?;
        Ok(1)
    }

    // ---- transactions & escrow ----

    /// The purchase boundary: transaction insert, listing flip and (for an
    /// accepted offer) the Unpaid -> Paid mark are one atomic write. The
    /// listing flip is a CAS on `buyer_id IS NULL` plus the purchasability
    /// conditions, so racing buyers get exactly one winner.
    pub async fn purchase_listing(&self, txn: &Transaction, offer: Option<&Offer>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE listings
            SET buyer_id = ?, logistics = 'SOLD', updated_at = ?
            WHERE id = ? AND buyer_id IS NULL
              AND moderation = 'APPROVED' AND conformity != 'NON_CONFORME'
            "#,
        )
        .bind(txn.buyer_id.to_string())
        .bind(txn.created_at)
        .bind(txn.listing_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            drop(tx);
            return match self.get_listing(txn.listing_id).await? {
                None => Err(MarketError::NotFound("listing", txn.listing_id)),
                Some(l) if l.buyer_id.is_some() => Err(MarketError::DuplicatePurchase),
                Some(_) => Err(MarketError::wrong_state("listing", "not purchasable")),
            };
        }

        sqlx::query(
            r#"
            INSERT INTO transactions (id, listing_id, buyer_id, seller_id, gross_amount,
                commission, net_seller_amount, status, funds_released, created_at, released_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(txn.id.to_string())
        .bind(txn.listing_id.to_string())
        .bind(txn.buyer_id.to_string())
        .bind(txn.seller_id.to_string())
        .bind(txn.gross_amount)
        .bind(txn.commission)
        .bind(txn.net_seller_amount)
        .bind(txn.status.as_str())
        .bind(txn.funds_released)
        .bind(txn.created_at)
        .bind(txn.released_at)
        .execute(&mut *tx)
        .await?;

        if let Some(offer) = offer {
            let marked = sqlx::query(
                r#"
                UPDATE offers SET payment_status = 'PAID', transaction_id = ?
                WHERE id = ? AND status = 'ACCEPTED' AND payment_status = 'UNPAID'
                "#,
            )
            .bind(txn.id.to_string())
            .bind(offer.id.to_string())
            .execute(&mut *tx)
            .await?;

            if marked.rows_affected() != 1 {
                return Err(MarketError::wrong_state("offer", "already settled"));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| transaction_from_row(&r)).transpose()
    }

    pub async fn transaction_for_listing(
        &self,
        listing_id: ListingId,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE listing_id = ?")
            .bind(listing_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| transaction_from_row(&r)).transpose()
    }

    /// Escrow release. The `funds_released` flag only moves 0 -> 1; a
    /// replayed release is reported as `Ok(false)` and leaves the wallet
    /// untouched. First release credits the seller and appends the history
    /// entry in the same transaction.
    pub async fn release_transaction_funds(
        &self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE transactions SET funds_released = 1, released_at = ? WHERE id = ? AND funds_released = 0",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM transactions WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(MarketError::NotFound("transaction", id)),
            };
        }

        let row = sqlx::query("SELECT seller_id, net_seller_amount FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let seller: String = row.get("seller_id");
        let net: f64 = row.get("net_seller_amount");

        let balance_after = credit_wallet(&mut tx, &seller, net).await?;
        insert_wallet_entry(
            &mut tx,
            &WalletEntry {
                id: Uuid::new_v4(),
                user_id: Uuid::parse_str(&seller)?,
                amount: net,
                kind: WalletEntryKind::EscrowRelease,
                reference_id: id,
                balance_after,
                created_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ---- wallets ----

    pub async fn wallet_balance(&self, user: UserId) -> Result<f64> {
        let balance: Option<f64> =
            sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(user.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance.unwrap_or(0.0))
    }

    pub async fn wallet_history(&self, user: UserId) -> Result<Vec<WalletEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM wallet_entries WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(wallet_entry_from_row).collect()
    }

    // ---- payouts ----

    pub async fn create_payout(&self, payout: &PayoutRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payout_requests (id, user_id, amount, account_ref, status,
                requested_at, processed_at, processed_by, rejection_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(payout.id.to_string())
        .bind(payout.user_id.to_string())
        .bind(payout.amount)
        .bind(&payout.account_ref)
        .bind(payout.status.as_str())
        .bind(payout.requested_at)
        .bind(payout.processed_at)
        .bind(payout.processed_by.map(|id| id.to_string()))
        .bind(&payout.rejection_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_payout(&self, id: PayoutId) -> Result<Option<PayoutRequest>> {
        let row = sqlx::query("SELECT * FROM payout_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| payout_from_row(&r)).transpose()
    }

    pub async fn list_payouts(&self, status: Option<PayoutStatus>) -> Result<Vec<PayoutRequest>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM payout_requests WHERE status = ? ORDER BY requested_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM payout_requests ORDER BY requested_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(payout_from_row).collect()
    }

    /// Payout completion re-validates the balance inside the transaction;
    /// the balance can have dropped since the request was made. On
    /// insufficient funds the request stays Pending.
    pub async fn complete_payout(
        &self,
        id: PayoutId,
        operator: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT user_id, amount FROM payout_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(MarketError::NotFound("payout request", id))?;
        let user: String = row.get("user_id");
        let amount: f64 = row.get("amount");

        let result = sqlx::query(
            r#"
            UPDATE payout_requests
            SET status = 'COMPLETED', processed_at = ?, processed_by = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(operator.to_string())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(MarketError::wrong_state("payout request", "not pending"));
        }

        let balance: Option<f64> =
            sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(&user)
                .fetch_optional(&mut *tx)
                .await?;
        let balance = balance.unwrap_or(0.0);
        if balance < amount {
            // Dropping the transaction rolls the CAS back; the request
            // stays Pending.
            return Err(MarketError::InsufficientFunds {
                requested: amount,
                available: balance,
            });
        }

        let balance_after = credit_wallet(&mut tx, &user, -amount).await?;
        insert_wallet_entry(
            &mut tx,
            &WalletEntry {
                id: Uuid::new_v4(),
                user_id: Uuid::parse_str(&user)?,
                amount: -amount,
                kind: WalletEntryKind::Payout,
                reference_id: id,
                balance_after,
                created_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn reject_payout(
        &self,
        id: PayoutId,
        operator: UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payout_requests
            SET status = 'REJECTED', processed_at = ?, processed_by = ?, rejection_reason = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(operator.to_string())
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- likes (favourites collaborator) ----

    pub async fn add_like(&self, user: UserId, listing_id: ListingId) -> Result<()> {
        sqlx::query(
            "INSERT INTO likes (user_id, listing_id, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(user.to_string())
        .bind(listing_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn like_count(&self, listing_id: ListingId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE listing_id = ?")
            .bind(listing_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

async fn insert_message<'e, E>(executor: E, message: &ChatMessage) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, sender_id, body, read, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.conversation_id.to_string())
    .bind(message.sender_id.to_string())
    .bind(&message.body)
    .bind(message.read)
    .bind(message.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_offer<'e, E>(executor: E, offer: &Offer) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO offers (id, conversation_id, listing_id, sender_id, receiver_id, amount,
            status, payment_status, message_id, transaction_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(offer.id.to_string())
    .bind(offer.conversation_id.to_string())
    .bind(offer.listing_id.to_string())
    .bind(offer.sender_id.to_string())
    .bind(offer.receiver_id.to_string())
    .bind(offer.amount)
    .bind(offer.status.as_str())
    .bind(offer.payment_status.map(|p| p.as_str()))
    .bind(offer.message_id.to_string())
    .bind(offer.transaction_id.map(|id| id.to_string()))
    .bind(offer.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn credit_wallet(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user: &str,
    delta: f64,
) -> Result<f64> {
    sqlx::query("INSERT INTO wallets (user_id, balance) VALUES (?, 0) ON CONFLICT (user_id) DO NOTHING")
        .bind(user)
        .execute(&mut **tx)
        .await?;

    sqlx::query("UPDATE wallets SET balance = balance + ? WHERE user_id = ?")
        .bind(delta)
        .bind(user)
        .execute(&mut **tx)
        .await?;

    let balance: f64 = sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = ?")
        .bind(user)
        .fetch_one(&mut **tx)
        .await?;

    Ok(balance)
}

async fn insert_wallet_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &WalletEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_entries (id, user_id, amount, kind, reference_id, balance_after, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(entry.user_id.to_string())
    .bind(entry.amount)
    .bind(entry.kind.as_str())
    .bind(entry.reference_id.to_string())
    .bind(entry.balance_after)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// A violation of the one-pending-offer-per-conversation index surfaces as
/// a state error, not a database error: the previous proposal must be
/// resolved first.
fn map_pending_offer_conflict(err: MarketError) -> MarketError {
    match err {
        MarketError::Database(sqlx::Error::Database(ref db)) if db.is_unique_violation() => {
            MarketError::wrong_state("offer", "conversation already has a pending offer")
        }
        other => other,
    }
}

fn parse_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(&row.get::<String, _>(column))?)
}

fn parse_uuid_opt(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<Uuid>> {
    row.get::<Option<String>, _>(column)
        .map(|s| Uuid::parse_str(&s).map_err(Into::into))
        .transpose()
}

fn listing_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Listing> {
    Ok(Listing {
        id: parse_uuid(row, "id")?,
        seller_id: parse_uuid(row, "seller_id")?,
        buyer_id: parse_uuid_opt(row, "buyer_id")?,
        title: row.get("title"),
        description: row.get("description"),
        category: row.get("category"),
        price: row.get("price"),
        moderation: row.get::<String, _>("moderation").parse()?,
        logistics: row.get::<String, _>("logistics").parse()?,
        conformity: row.get::<String, _>("conformity").parse()?,
        conformity_checked_by: parse_uuid_opt(row, "conformity_checked_by")?,
        conformity_checked_at: row.get("conformity_checked_at"),
        self_certified: row.get("self_certified"),
        deposit_code: row.get("deposit_code"),
        withdrawal_code: row.get("withdrawal_code"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: parse_uuid(row, "id")?,
        listing_id: parse_uuid(row, "listing_id")?,
        buyer_id: parse_uuid(row, "buyer_id")?,
        seller_id: parse_uuid(row, "seller_id")?,
        created_at: row.get("created_at"),
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: parse_uuid(row, "id")?,
        conversation_id: parse_uuid(row, "conversation_id")?,
        sender_id: parse_uuid(row, "sender_id")?,
        body: row.get("body"),
        read: row.get("read"),
        created_at: row.get("created_at"),
    })
}

fn offer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Offer> {
    Ok(Offer {
        id: parse_uuid(row, "id")?,
        conversation_id: parse_uuid(row, "conversation_id")?,
        listing_id: parse_uuid(row, "listing_id")?,
        sender_id: parse_uuid(row, "sender_id")?,
        receiver_id: parse_uuid(row, "receiver_id")?,
        amount: row.get("amount"),
        status: row.get::<String, _>("status").parse()?,
        payment_status: row
            .get::<Option<String>, _>("payment_status")
            .map(|s| s.parse())
            .transpose()?,
        message_id: parse_uuid(row, "message_id")?,
        transaction_id: parse_uuid_opt(row, "transaction_id")?,
        created_at: row.get("created_at"),
    })
}

fn transaction_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
    Ok(Transaction {
        id: parse_uuid(row, "id")?,
        listing_id: parse_uuid(row, "listing_id")?,
        buyer_id: parse_uuid(row, "buyer_id")?,
        seller_id: parse_uuid(row, "seller_id")?,
        gross_amount: row.get("gross_amount"),
        commission: row.get("commission"),
        net_seller_amount: row.get("net_seller_amount"),
        status: row.get::<String, _>("status").parse()?,
        funds_released: row.get("funds_released"),
        created_at: row.get("created_at"),
        released_at: row.get("released_at"),
    })
}

fn payout_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PayoutRequest> {
    Ok(PayoutRequest {
        id: parse_uuid(row, "id")?,
        user_id: parse_uuid(row, "user_id")?,
        amount: row.get("amount"),
        account_ref: row.get("account_ref"),
        status: row.get::<String, _>("status").parse()?,
        requested_at: row.get("requested_at"),
        processed_at: row.get("processed_at"),
        processed_by: parse_uuid_opt(row, "processed_by")?,
        rejection_reason: row.get("rejection_reason"),
    })
}

fn wallet_entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WalletEntry> {
    Ok(WalletEntry {
        id: parse_uuid(row, "id")?,
        user_id: parse_uuid(row, "user_id")?,
        amount: row.get("amount"),
        kind: row.get::<String, _>("kind").parse()?,
        reference_id: parse_uuid(row, "reference_id")?,
        balance_after: row.get("balance_after"),
        created_at: row.get("created_at"),
    })
}
