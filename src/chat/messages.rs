//! Persistence and enrichment of accepted chat messages.

use crate::auth::Identity;
use crate::db::models::Author;
use crate::db::{PersistenceGateway, StoreError};
use crate::ws::protocol::ChatMessage;

/// Local user id for an identity. Identities from providers with
/// non-integer ids carry id 0 and are matched by email.
pub async fn resolve_author_id(
    gateway: &dyn PersistenceGateway,
    identity: &Identity,
) -> Result<i64, StoreError> {
    if identity.id != 0 {
        return Ok(identity.id);
    }
    if identity.email.is_empty() {
        return Err(StoreError::UnknownAuthor("identity without id or email".to_string()));
    }
    gateway
        .find_user_id(&identity.email)
        .await?
        .ok_or_else(|| StoreError::UnknownAuthor(identity.email.clone()))
}

/// Store `message`, then stamp it with `id`, `ts` and a fresh author snapshot
/// and store its attachments. Attachment failures are logged individually and
/// do not fail the message. Returns the persisted message id.
///
/// On error the message is left unstamped.
pub async fn persist_and_stamp(
    gateway: &dyn PersistenceGateway,
    identity: &Identity,
    message: &mut ChatMessage,
) -> Result<i64, StoreError> {
    let author_id = resolve_author_id(gateway, identity).await?;
    let stored = gateway
        .insert_message(author_id, message.text(), message.recipient())
        .await?;

    let author = match gateway.lookup_author(author_id).await {
        Ok(author) => author,
        Err(e) => {
            tracing::warn!(user_id = author_id, error = %e, "Author lookup failed, stamping id only");
            Author::bare(author_id)
        }
    };
    message.stamp(stored.id, stored.created_at, &author);

    for attachment in message.attachments() {
        if let Err(e) = gateway.insert_attachment(stored.id, &attachment).await {
            tracing::warn!(
                message_id = stored.id,
                url = %attachment.url,
                error = %e,
                "Failed to store attachment"
            );
        }
    }

    Ok(stored.id)
}
