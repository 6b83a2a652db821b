use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::model::*;

/// Reverse lookups from entity ids to the service lock scope that owns them.
pub struct EntityIndex {
    booking_to_service: DashMap<BookingId, ServiceId>,
    review_to_booking: DashMap<ReviewId, (ServiceId, BookingId)>,
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIndex {
    pub fn new() -> Self {
        Self {
            booking_to_service: DashMap::new(),
            review_to_booking: DashMap::new(),
        }
    }

    pub fn service_for_booking(&self, id: &BookingId) -> Option<ServiceId> {
        self.booking_to_service.get(id).map(|e| *e.value())
    }

    pub fn location_of_review(&self, id: &ReviewId) -> Option<(ServiceId, BookingId)> {
        self.review_to_booking.get(id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event directly to a ServiceState (no locking; caller holds the lock).
    pub fn apply_event(&self, rs: &mut ServiceState, event: &Event) {
        match event {
            Event::ServiceUpdated {
                title,
                description,
                price_cents,
                duration_minutes,
                active,
                ..
            } => {
                rs.info.title = title.clone();
                rs.info.description = description.clone();
                rs.info.price_cents = *price_cents;
                rs.info.duration_minutes = *duration_minutes;
                rs.info.active = *active;
            }
            Event::ServiceDeleted { .. } => {
                rs.retired = true;
            }
            Event::BookingCreated {
                id,
                user_id,
                service_id,
                span,
                status,
                created_at,
            } => {
                rs.insert_booking(Booking {
                    id: *id,
                    user_id: *user_id,
                    service_id: *service_id,
                    span: *span,
                    status: *status,
                    created_at: *created_at,
                });
                self.booking_to_service.insert(*id, *service_id);
            }
            Event::BookingUpdated { id, span, status, .. } => {
                // Re-insert so the start ordering survives a reschedule.
                if let Some(mut booking) = rs.remove_booking(*id) {
                    booking.span = *span;
                    booking.status = *status;
                    rs.insert_booking(booking);
                }
            }
            Event::BookingDeleted { id, .. } => {
                rs.remove_booking(*id);
                if let Some(review) = rs.reviews.remove(id) {
                    self.review_to_booking.remove(&review.id);
                }
                self.booking_to_service.remove(id);
            }
            Event::ReviewCreated {
                id,
                booking_id,
                service_id,
                user_id,
                rating,
                comment,
                created_at,
            } => {
                rs.reviews.insert(
                    *booking_id,
                    Review {
                        id: *id,
                        booking_id: *booking_id,
                        user_id: *user_id,
                        rating: *rating,
                        comment: comment.clone(),
                        created_at: *created_at,
                    },
                );
                self.review_to_booking.insert(*id, (*service_id, *booking_id));
            }
            Event::ReviewUpdated {
                booking_id,
                rating,
                comment,
                ..
            } => {
                if let Some(review) = rs.reviews.get_mut(booking_id) {
                    review.rating = *rating;
                    review.comment = comment.clone();
                }
            }
            Event::ReviewDeleted { id, booking_id, .. } => {
                rs.reviews.remove(booking_id);
                self.review_to_booking.remove(id);
            }
            // Created is handled at the DashMap level; ids at the sequence level.
            Event::ServiceCreated { .. } | Event::IdsReserved { .. } => {}
        }
    }
}

/// Monotonic id source for bookings and reviews.
pub struct IdSequence {
    next_booking: AtomicI64,
    next_review: AtomicI64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next_booking: AtomicI64::new(1),
            next_review: AtomicI64::new(1),
        }
    }

    pub fn next_booking(&self) -> BookingId {
        self.next_booking.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_review(&self) -> ReviewId {
        self.next_review.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> (BookingId, ReviewId) {
        (
            self.next_booking.load(Ordering::SeqCst),
            self.next_review.load(Ordering::SeqCst),
        )
    }

    /// Advance past any id seen during replay.
    pub fn observe(&self, event: &Event) {
        match event {
            Event::BookingCreated { id, .. } => {
                self.next_booking.fetch_max(id + 1, Ordering::SeqCst);
            }
            Event::ReviewCreated { id, .. } => {
                self.next_review.fetch_max(id + 1, Ordering::SeqCst);
            }
            Event::IdsReserved {
                next_booking_id,
                next_review_id,
            } => {
                self.next_booking.fetch_max(*next_booking_id, Ordering::SeqCst);
                self.next_review.fetch_max(*next_review_id, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}
