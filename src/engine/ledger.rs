use crate::limits::MAX_BOOKINGS_PER_SERVICE;
use crate::model::*;
use crate::policy;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, Entity};

/// Copy of a booking and its policy view, taken under the service lock.
fn snapshot(rs: &ServiceState, id: BookingId) -> Result<(Booking, BookingState), EngineError> {
    let booking = rs
        .booking(id)
        .cloned()
        .ok_or(EngineError::NotFound(Entity::Booking, id))?;
    let state = BookingState {
        owner_id: booking.user_id,
        status: booking.status,
        reviewed: rs.reviews.contains_key(&id),
    };
    Ok((booking, state))
}

impl Engine {
    /// Reserve `[start, end)` on a service for the actor. The new booking is `pending`.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        service_id: ServiceId,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let _permit = self.commit_permit().await;
        let mut guard = self.write_service(service_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many bookings on service"));
        }

        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id: self.ids.next_booking(),
            user_id: actor.id,
            service_id,
            span,
            status: BookingStatus::Pending,
            created_at: now_ms(),
        };
        let event = Event::BookingCreated {
            id: booking.id,
            user_id: booking.user_id,
            service_id,
            span,
            status: booking.status,
            created_at: booking.created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(booking_id = booking.id, service_id, user_id = actor.id, "booking created");
        Ok(booking)
    }

    /// Reschedule and/or change the status of a booking.
    ///
    /// Either endpoint may be given alone; the other is kept. The result is
    /// re-checked for conflicts when it occupies its interval and either the
    /// interval moved or the booking was cancelled until now.
    pub async fn transition_booking(
        &self,
        actor: &Actor,
        id: BookingId,
        changes: BookingChanges,
    ) -> Result<Booking, EngineError> {
        let _permit = self.commit_permit().await;
        let mut guard = self.lock_booking(id).await?;
        let (current, state) = snapshot(&guard, id)?;

        policy::authorize_transition(actor, &state, &changes).into_result()?;

        let span = validate_span(
            changes.start.unwrap_or(current.span.start),
            changes.end.unwrap_or(current.span.end),
        )?;
        let status = changes.status.unwrap_or(current.status);
        if span == current.span && status == current.status {
            return Ok(current);
        }

        if status.is_active() && (span != current.span || !current.status.is_active()) {
            check_no_conflict(&guard, &span, Some(id))?;
        }

        let event = Event::BookingUpdated {
            id,
            service_id: current.service_id,
            span,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(
            booking_id = id,
            from = %current.status,
            to = %status,
            "booking updated"
        );
        Ok(Booking {
            span,
            status,
            ..current
        })
    }

    /// Mark a booking as served. Administrators only, and never on their own booking.
    pub async fn complete_booking(&self, actor: &Actor, id: BookingId) -> Result<Booking, EngineError> {
        let _permit = self.commit_permit().await;
        let mut guard = self.lock_booking(id).await?;
        let (current, state) = snapshot(&guard, id)?;

        policy::authorize_completion(actor, &state).into_result()?;

        let event = Event::BookingUpdated {
            id,
            service_id: current.service_id,
            span: current.span,
            status: BookingStatus::Completed,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(booking_id = id, admin_id = actor.id, "booking completed");
        Ok(Booking {
            status: BookingStatus::Completed,
            ..current
        })
    }

    /// Hard delete. Returns the removed booking.
    pub async fn delete_booking(&self, actor: &Actor, id: BookingId) -> Result<Booking, EngineError> {
        let _permit = self.commit_permit().await;
        let mut guard = self.lock_booking(id).await?;
        let (current, state) = snapshot(&guard, id)?;

        policy::authorize_delete(actor, &state, current.span.start, now_ms()).into_result()?;
        if state.reviewed {
            return Err(EngineError::HasReview(id));
        }

        let event = Event::BookingDeleted {
            id,
            service_id: current.service_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(booking_id = id, user_id = actor.id, "booking deleted");
        Ok(current)
    }
}
