use souk_db::conversations::{self, ConversationRow};
use souk_db::DbPool;
use souk_models::conversation::{Conversation, ListingPreview, ReadState};
use std::collections::HashMap;

use crate::listings::ListingProvider;
use crate::CoreError;

/// The one membership check. REST sends, gateway joins and gateway
/// dispatches all go through here.
pub async fn is_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<bool, CoreError> {
    Ok(conversations::is_participant(pool, conversation_id, user_id).await?)
}

/// `NotFound` when the conversation does not exist, `Forbidden` when the
/// user is not in it.
pub async fn ensure_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<ConversationRow, CoreError> {
    let row = conversations::get_conversation(pool, conversation_id)
        .await?
        .ok_or(CoreError::NotFound)?;
    if !is_participant(pool, conversation_id, user_id).await? {
        return Err(CoreError::Forbidden);
    }
    Ok(row)
}

pub struct StartOutcome {
    pub conversation: Conversation,
    pub created: bool,
}

/// Resolve the listing's conversation, creating it on first use, and make
/// sure the seller, the caller and the optional peer are all members.
pub async fn start_or_get_conversation(
    pool: &DbPool,
    listings: &ListingProvider,
    listing_id: i64,
    caller_id: i64,
    peer_id: Option<i64>,
) -> Result<StartOutcome, CoreError> {
    let listing = listings
        .resolve(listing_id)
        .await?
        .ok_or(CoreError::NotFound)?;

    let mut desired = vec![listing.seller_id];
    for id in std::iter::once(caller_id).chain(peer_id) {
        if !desired.contains(&id) {
            desired.push(id);
        }
    }

    if let Some(existing) = conversations::get_conversation_by_listing(pool, listing_id).await? {
        conversations::add_participants(pool, existing.id, &desired).await?;
        let conversation = build_view(pool, existing, listing, 0).await?;
        return Ok(StartOutcome {
            conversation,
            created: false,
        });
    }

    if desired.len() < 2 {
        return Err(CoreError::InvalidPayload(
            "a conversation needs someone other than the seller".into(),
        ));
    }

    let id = souk_util::snowflake::generate(crate::WORKER_ID);
    let (row, created) =
        match conversations::create_conversation(pool, id, listing_id, &desired).await? {
            Some(row) => (row, true),
            None => {
                // Lost the creation race; join the winner instead.
                let winner = conversations::get_conversation_by_listing(pool, listing_id)
                    .await?
                    .ok_or_else(|| CoreError::Internal("conversation vanished".into()))?;
                conversations::add_participants(pool, winner.id, &desired).await?;
                (winner, false)
            }
        };

    if created {
        tracing::info!(
            conversation_id = row.id,
            listing_id,
            participants = desired.len(),
            "conversation created"
        );
    }
    let conversation = build_view(pool, row, listing, 0).await?;
    Ok(StartOutcome {
        conversation,
        created,
    })
}

pub async fn get_conversation(
    pool: &DbPool,
    listings: &ListingProvider,
    conversation_id: i64,
    caller_id: i64,
) -> Result<Conversation, CoreError> {
    let row = ensure_participant(pool, conversation_id, caller_id).await?;
    let listing = listings
        .resolve(row.listing_id)
        .await?
        .ok_or(CoreError::NotFound)?;
    let unread = souk_db::read_states::unread_counts(pool, caller_id)
        .await?
        .into_iter()
        .find_map(|(id, count)| (id == conversation_id).then_some(count))
        .unwrap_or(0);
    build_view(pool, row, listing, unread).await
}

/// The caller's conversations, most recent activity first. Conversations
/// whose listing can no longer be resolved are left out.
pub async fn list_conversations(
    pool: &DbPool,
    listings: &ListingProvider,
    caller_id: i64,
) -> Result<Vec<Conversation>, CoreError> {
    let rows = conversations::list_user_conversations(pool, caller_id).await?;
    let unread: HashMap<i64, i64> = souk_db::read_states::unread_counts(pool, caller_id)
        .await?
        .into_iter()
        .collect();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(listing) = listings.resolve(row.listing_id).await? else {
            tracing::warn!(
                conversation_id = row.id,
                listing_id = row.listing_id,
                "listing missing for conversation"
            );
            continue;
        };
        let count = unread.get(&row.id).copied().unwrap_or(0);
        out.push(build_view(pool, row, listing, count).await?);
    }
    Ok(out)
}

pub async fn mark_read(
    pool: &DbPool,
    conversation_id: i64,
    caller_id: i64,
    last_message_id: i64,
) -> Result<ReadState, CoreError> {
    ensure_participant(pool, conversation_id, caller_id).await?;
    let row = souk_db::read_states::update_read_state(
        pool,
        caller_id,
        conversation_id,
        last_message_id,
    )
    .await?;
    Ok(ReadState {
        conversation_id: row.conversation_id,
        last_message_id: row.last_message_id,
    })
}

async fn build_view(
    pool: &DbPool,
    row: ConversationRow,
    listing: ListingPreview,
    unread_count: i64,
) -> Result<Conversation, CoreError> {
    let participant_ids = conversations::get_participant_ids(pool, row.id).await?;
    Ok(Conversation {
        id: row.id,
        listing_id: row.listing_id,
        participant_ids,
        last_message_id: row.last_message_id,
        created_at: row.created_at,
        last_activity_at: row.last_activity_at,
        listing,
        unread_count,
    })
}
