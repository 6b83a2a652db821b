use tokio::sync::OwnedRwLockWriteGuard;

use crate::limits::*;
use crate::model::*;
use crate::policy::{self, DenyReason};

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

/// Whether `actor` may review `booking_id`, given the ledger's view of it.
/// Guards run in order and the first failure wins.
pub fn check_review_precondition(
    actor: &Actor,
    booking_id: BookingId,
    state: Option<BookingState>,
) -> Result<(), EngineError> {
    let state = state.ok_or(EngineError::NotFound(Entity::Booking, booking_id))?;
    if state.owner_id != actor.id {
        return Err(DenyReason::NotOwner.into());
    }
    if state.status != BookingStatus::Completed {
        return Err(EngineError::Validation("booking is not completed"));
    }
    if state.reviewed {
        return Err(EngineError::AlreadyExists(Entity::Review, booking_id));
    }
    Ok(())
}

fn validate_rating(rating: i64) -> Result<u8, EngineError> {
    if !(MIN_RATING as i64..=MAX_RATING as i64).contains(&rating) {
        return Err(EngineError::Validation("rating must be between 1 and 5"));
    }
    Ok(rating as u8)
}

fn validate_comment(comment: &str) -> Result<(), EngineError> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_review(
        &self,
        actor: &Actor,
        booking_id: BookingId,
        rating: i64,
        comment: String,
    ) -> Result<Review, EngineError> {
        let rating = validate_rating(rating)?;
        validate_comment(&comment)?;

        let _permit = self.commit_permit().await;
        let (mut guard, state) = match self.lock_booking(booking_id).await {
            Ok(guard) => {
                let state = guard.state_of(booking_id);
                (Some(guard), state)
            }
            Err(EngineError::NotFound(..)) => (None, None),
            Err(e) => return Err(e),
        };
        check_review_precondition(actor, booking_id, state)?;
        let Some(guard) = guard.as_mut() else {
            return Err(EngineError::NotFound(Entity::Booking, booking_id));
        };

        let review = Review {
            id: self.ids.next_review(),
            booking_id,
            user_id: actor.id,
            rating,
            comment,
            created_at: now_ms(),
        };
        let event = Event::ReviewCreated {
            id: review.id,
            booking_id,
            service_id: guard.info.id,
            user_id: review.user_id,
            rating,
            comment: review.comment.clone(),
            created_at: review.created_at,
        };
        self.persist_and_apply(guard, &event).await?;
        tracing::debug!(review_id = review.id, booking_id, "review created");
        Ok(review)
    }

    pub async fn update_review(
        &self,
        actor: &Actor,
        id: ReviewId,
        patch: ReviewPatch,
    ) -> Result<Review, EngineError> {
        let rating = patch.rating.map(validate_rating).transpose()?;
        if let Some(comment) = &patch.comment {
            validate_comment(comment)?;
        }

        let _permit = self.commit_permit().await;
        let (mut guard, current) = self.lock_review(id).await?;
        policy::authorize_review_edit(actor, current.user_id).into_result()?;

        let next = Review {
            rating: rating.unwrap_or(current.rating),
            comment: patch.comment.unwrap_or_else(|| current.comment.clone()),
            ..current.clone()
        };
        if next == current {
            return Ok(next);
        }
        let event = Event::ReviewUpdated {
            id,
            booking_id: next.booking_id,
            service_id: guard.info.id,
            rating: next.rating,
            comment: next.comment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(next)
    }

    pub async fn delete_review(&self, actor: &Actor, id: ReviewId) -> Result<Review, EngineError> {
        let _permit = self.commit_permit().await;
        let (mut guard, current) = self.lock_review(id).await?;
        policy::authorize_review_edit(actor, current.user_id).into_result()?;

        let event = Event::ReviewDeleted {
            id,
            booking_id: current.booking_id,
            service_id: guard.info.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(current)
    }

    /// All reviews left on a service, oldest first. Unknown services have none.
    pub async fn list_reviews(&self, service_id: ServiceId) -> Vec<Review> {
        let Some(rs) = self.get_service(&service_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        let mut reviews: Vec<Review> = guard.reviews.values().cloned().collect();
        reviews.sort_unstable_by_key(|r| r.id);
        reviews
    }

    async fn lock_review(
        &self,
        id: ReviewId,
    ) -> Result<(OwnedRwLockWriteGuard<ServiceState>, Review), EngineError> {
        let not_found = || EngineError::NotFound(Entity::Review, id);
        let (service_id, booking_id) = self.index.location_of_review(&id).ok_or_else(not_found)?;
        let guard = self.write_service(service_id).await.map_err(|_| not_found())?;
        let review = guard
            .reviews
            .get(&booking_id)
            .filter(|r| r.id == id)
            .cloned()
            .ok_or_else(not_found)?;
        Ok((guard, review))
    }
}
