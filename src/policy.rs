//! Who may do what to a booking.
//!
//! Every function here is pure: the ledger hands in the actor and a snapshot
//! of the booking taken under the service lock, and gets back a [`Decision`].
//! Owner rules take precedence over administrator rules, so an administrator
//! acting on their own booking is treated as its owner.

use std::fmt;

use crate::model::{Actor, BookingChanges, BookingState, BookingStatus, Ms, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Actor is neither the owner nor an administrator.
    NotOwner,
    /// The booking's current status does not allow this actor to touch it.
    InvalidCurrentStatus(BookingStatus),
    /// The actor's role may not move a booking into this status.
    StatusNotAllowed(BookingStatus),
    /// Owner tried to delete a booking at or after its start.
    AlreadyStarted,
    AdminOnly,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NotOwner => write!(f, "not authorized to access this booking"),
            DenyReason::InvalidCurrentStatus(s) => {
                write!(f, "booking cannot be changed while {s}")
            }
            DenyReason::StatusNotAllowed(s) => {
                write!(f, "not allowed to set status to {s}")
            }
            DenyReason::AlreadyStarted => {
                write!(f, "cannot delete a booking that has already started")
            }
            DenyReason::AdminOnly => write!(f, "administrator role required"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(reason),
        }
    }
}

const OWNER_MUTABLE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];
const OWNER_SETTABLE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Cancelled];
const ADMIN_SETTABLE: [BookingStatus; 3] = [
    BookingStatus::Pending,
    BookingStatus::Confirmed,
    BookingStatus::Cancelled,
];

/// Reschedule and/or status change.
pub fn authorize_transition(
    actor: &Actor,
    target: &BookingState,
    changes: &BookingChanges,
) -> Decision {
    if actor.id == target.owner_id {
        if !OWNER_MUTABLE.contains(&target.status) {
            return Decision::Deny(DenyReason::InvalidCurrentStatus(target.status));
        }
        if let Some(requested) = changes.status
            && !OWNER_SETTABLE.contains(&requested)
        {
            return Decision::Deny(DenyReason::StatusNotAllowed(requested));
        }
        return Decision::Allow;
    }
    if actor.is_admin() {
        if let Some(requested) = changes.status
            && !ADMIN_SETTABLE.contains(&requested)
        {
            return Decision::Deny(DenyReason::StatusNotAllowed(requested));
        }
        return Decision::Allow;
    }
    Decision::Deny(DenyReason::NotOwner)
}

/// Owners may delete strictly before the booking starts; administrators always.
pub fn authorize_delete(actor: &Actor, target: &BookingState, start: Ms, now: Ms) -> Decision {
    if actor.id == target.owner_id {
        if now >= start {
            return Decision::Deny(DenyReason::AlreadyStarted);
        }
        return Decision::Allow;
    }
    if actor.is_admin() {
        return Decision::Allow;
    }
    Decision::Deny(DenyReason::NotOwner)
}

/// Completion is an administrative act and never self-service.
pub fn authorize_completion(actor: &Actor, target: &BookingState) -> Decision {
    if actor.id == target.owner_id {
        return Decision::Deny(DenyReason::StatusNotAllowed(BookingStatus::Completed));
    }
    if !actor.is_admin() {
        return Decision::Deny(DenyReason::NotOwner);
    }
    if !OWNER_MUTABLE.contains(&target.status) {
        return Decision::Deny(DenyReason::InvalidCurrentStatus(target.status));
    }
    Decision::Allow
}

pub fn authorize_read(actor: &Actor, target: &BookingState) -> Decision {
    if actor.id == target.owner_id || actor.is_admin() {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::NotOwner)
    }
}

/// Reviews are edited or removed by their author or an administrator.
pub fn authorize_review_edit(actor: &Actor, author_id: UserId) -> Decision {
    if actor.id == author_id || actor.is_admin() {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::NotOwner)
    }
}

pub fn authorize_catalog(actor: &Actor) -> Decision {
    if actor.is_admin() {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::AdminOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const OWNER: UserId = 1;
    const OTHER: UserId = 2;
    const ADMIN: UserId = 99;

    fn target(status: BookingStatus) -> BookingState {
        BookingState { owner_id: OWNER, status, reviewed: false }
    }

    fn deny(reason: DenyReason) -> Decision {
        Decision::Deny(reason)
    }

    #[test]
    fn stranger_is_denied_everything() {
        let stranger = Actor::user(OTHER);
        for status in [Pending, Confirmed, Cancelled, Completed] {
            assert_eq!(
                authorize_transition(&stranger, &target(status), &BookingChanges::default()),
                deny(DenyReason::NotOwner)
            );
            assert_eq!(
                authorize_delete(&stranger, &target(status), 1000, 0),
                deny(DenyReason::NotOwner)
            );
            assert_eq!(authorize_read(&stranger, &target(status)), deny(DenyReason::NotOwner));
        }
    }

    #[test]
    fn owner_may_cancel_or_return_to_pending() {
        let owner = Actor::user(OWNER);
        for current in [Pending, Confirmed] {
            for requested in [Pending, Cancelled] {
                assert!(
                    authorize_transition(&owner, &target(current), &BookingChanges::status(requested))
                        .is_allowed()
                );
            }
        }
    }

    #[test]
    fn owner_cannot_self_confirm_or_complete() {
        let owner = Actor::user(OWNER);
        for requested in [Confirmed, Completed] {
            assert_eq!(
                authorize_transition(&owner, &target(Pending), &BookingChanges::status(requested)),
                deny(DenyReason::StatusNotAllowed(requested))
            );
        }
    }

    #[test]
    fn owner_locked_out_of_terminal_states() {
        let owner = Actor::user(OWNER);
        for current in [Cancelled, Completed] {
            let reschedule = BookingChanges::reschedule(0, 10);
            assert_eq!(
                authorize_transition(&owner, &target(current), &reschedule),
                deny(DenyReason::InvalidCurrentStatus(current))
            );
            assert_eq!(
                authorize_transition(&owner, &target(current), &BookingChanges::status(Pending)),
                deny(DenyReason::InvalidCurrentStatus(current))
            );
        }
    }

    #[test]
    fn owner_reschedule_without_status_change() {
        let owner = Actor::user(OWNER);
        let reschedule = BookingChanges::reschedule(0, 10);
        assert!(authorize_transition(&owner, &target(Pending), &reschedule).is_allowed());
        assert!(authorize_transition(&owner, &target(Confirmed), &reschedule).is_allowed());
    }

    #[test]
    fn admin_status_set_excludes_completed() {
        let admin = Actor::admin(ADMIN);
        for requested in [Pending, Confirmed, Cancelled] {
            assert!(
                authorize_transition(&admin, &target(Pending), &BookingChanges::status(requested))
                    .is_allowed()
            );
        }
        assert_eq!(
            authorize_transition(&admin, &target(Confirmed), &BookingChanges::status(Completed)),
            deny(DenyReason::StatusNotAllowed(Completed))
        );
    }

    #[test]
    fn admin_reschedules_any_status() {
        let admin = Actor::admin(ADMIN);
        for current in [Pending, Confirmed, Cancelled, Completed] {
            assert!(
                authorize_transition(&admin, &target(current), &BookingChanges::reschedule(0, 10))
                    .is_allowed()
            );
        }
    }

    #[test]
    fn admin_owning_booking_follows_owner_rules() {
        let admin_owner = Actor::admin(OWNER);
        assert_eq!(
            authorize_transition(&admin_owner, &target(Pending), &BookingChanges::status(Confirmed)),
            deny(DenyReason::StatusNotAllowed(Confirmed))
        );
        assert_eq!(
            authorize_delete(&admin_owner, &target(Pending), 100, 100),
            deny(DenyReason::AlreadyStarted)
        );
    }

    #[test]
    fn deletion_window() {
        let owner = Actor::user(OWNER);
        let admin = Actor::admin(ADMIN);
        let start = 1_000;
        assert!(authorize_delete(&owner, &target(Pending), start, start - 1).is_allowed());
        assert_eq!(
            authorize_delete(&owner, &target(Pending), start, start),
            deny(DenyReason::AlreadyStarted)
        );
        assert_eq!(
            authorize_delete(&owner, &target(Pending), start, start + 1),
            deny(DenyReason::AlreadyStarted)
        );
        assert!(authorize_delete(&admin, &target(Completed), start, start + 1).is_allowed());
        assert!(authorize_delete(&admin, &target(Pending), start, start - 1).is_allowed());
    }

    #[test]
    fn completion_is_admin_only() {
        let admin = Actor::admin(ADMIN);
        assert!(authorize_completion(&admin, &target(Pending)).is_allowed());
        assert!(authorize_completion(&admin, &target(Confirmed)).is_allowed());
        assert_eq!(
            authorize_completion(&admin, &target(Cancelled)),
            deny(DenyReason::InvalidCurrentStatus(Cancelled))
        );
        assert_eq!(
            authorize_completion(&admin, &target(Completed)),
            deny(DenyReason::InvalidCurrentStatus(Completed))
        );
        assert_eq!(
            authorize_completion(&Actor::user(OWNER), &target(Confirmed)),
            deny(DenyReason::StatusNotAllowed(Completed))
        );
        assert_eq!(
            authorize_completion(&Actor::user(OTHER), &target(Confirmed)),
            deny(DenyReason::NotOwner)
        );
    }

    #[test]
    fn review_edit_and_catalog() {
        assert!(authorize_review_edit(&Actor::user(OWNER), OWNER).is_allowed());
        assert!(authorize_review_edit(&Actor::admin(ADMIN), OWNER).is_allowed());
        assert_eq!(
            authorize_review_edit(&Actor::user(OTHER), OWNER),
            deny(DenyReason::NotOwner)
        );
        assert!(authorize_catalog(&Actor::admin(ADMIN)).is_allowed());
        assert_eq!(authorize_catalog(&Actor::user(OWNER)), deny(DenyReason::AdminOnly));
    }

    #[test]
    fn decision_into_result() {
        assert_eq!(Decision::Allow.into_result(), Ok(()));
        assert_eq!(
            Decision::Deny(DenyReason::AdminOnly).into_result(),
            Err(DenyReason::AdminOnly)
        );
    }
}
