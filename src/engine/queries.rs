use crate::model::*;
use crate::policy;

use super::conflict::{find_conflicts, validate_window};
use super::{Engine, EngineError, Entity, SharedServiceState};

impl Engine {
    /// Clone every service handle so no DashMap shard is held across an await.
    pub(super) fn snapshot_services(&self) -> Vec<SharedServiceState> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// Active bookings on `service_id` that overlap `[start, end)`, excluding one booking if given.
    pub async fn check_conflict(
        &self,
        service_id: ServiceId,
        start: Ms,
        end: Ms,
        excluding: Option<BookingId>,
    ) -> Result<Vec<Booking>, EngineError> {
        let span = validate_window(start, end)?;
        let rs = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(Entity::Service, service_id))?;
        let guard = rs.read().await;
        Ok(find_conflicts(&guard, span, excluding).cloned().collect())
    }

    pub async fn get_booking(&self, actor: &Actor, id: BookingId) -> Result<Booking, EngineError> {
        let not_found = || EngineError::NotFound(Entity::Booking, id);
        let service_id = self.index.service_for_booking(&id).ok_or_else(not_found)?;
        let rs = self.get_service(&service_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        let state = guard.state_of(id).ok_or_else(not_found)?;
        policy::authorize_read(actor, &state).into_result()?;
        guard.booking(id).cloned().ok_or_else(not_found)
    }

    /// Users see their own bookings; administrators see everyone's.
    /// Ordered by start, then id.
    pub async fn list_bookings(&self, actor: &Actor, filter: BookingFilter) -> Vec<Booking> {
        let services = match filter.service_id {
            Some(id) => self.get_service(&id).into_iter().collect(),
            None => self.snapshot_services(),
        };
        let mut out = Vec::new();
        for rs in services {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| actor.is_admin() || b.user_id == actor.id)
                    .filter(|b| filter.matches(b))
                    .cloned(),
            );
        }
        out.sort_unstable_by_key(|b| (b.span.start, b.id));
        out
    }

    /// Owner, status and review flag of a booking.
    pub async fn booking_state(&self, id: BookingId) -> Result<BookingState, EngineError> {
        let not_found = || EngineError::NotFound(Entity::Booking, id);
        let service_id = self.index.service_for_booking(&id).ok_or_else(not_found)?;
        let rs = self.get_service(&service_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard.state_of(id).ok_or_else(not_found)
    }
}
