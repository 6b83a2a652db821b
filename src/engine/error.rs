use std::fmt;

use crate::model::{BookingId, ServiceId};
use crate::policy::DenyReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Service,
    Booking,
    Review,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Service => "service",
            Entity::Booking => "booking",
            Entity::Review => "review",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, i64),
    AlreadyExists(Entity, i64),
    Validation(&'static str),
    /// Ids of the active bookings the requested interval overlaps.
    Conflict(Vec<BookingId>),
    Forbidden(DenyReason),
    HasBookings(ServiceId),
    HasReview(BookingId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists(Entity::Review, id) => {
                write!(f, "a review for booking {id} already exists")
            }
            EngineError::AlreadyExists(entity, id) => write!(f, "{entity} already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            // Other users' booking ids stay private.
            EngineError::Conflict(_) => write!(f, "booking conflict: time slot is already taken"),
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete service {id}: it has bookings")
            }
            EngineError::HasReview(id) => {
                write!(f, "cannot delete booking {id}: it has a review")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DenyReason> for EngineError {
    fn from(reason: DenyReason) -> Self {
        metrics::counter!(crate::observability::AUTHZ_DENIALS_TOTAL).increment(1);
        EngineError::Forbidden(reason)
    }
}
