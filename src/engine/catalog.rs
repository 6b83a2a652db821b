use std::sync::Arc;

use tokio::sync::RwLock;

use crate::limits::*;
use crate::model::*;
use crate::policy;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

fn validate_service_fields(
    title: &str,
    description: &str,
    price_cents: i64,
    duration_minutes: u32,
) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::Validation("title must not be empty"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if price_cents < 0 {
        return Err(EngineError::Validation("price must not be negative"));
    }
    if duration_minutes == 0 {
        return Err(EngineError::Validation("duration must be positive"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_service(
        &self,
        actor: &Actor,
        new: NewService,
    ) -> Result<ServiceInfo, EngineError> {
        policy::authorize_catalog(actor).into_result()?;
        validate_service_fields(&new.title, &new.description, new.price_cents, new.duration_minutes)?;

        let _permit = self.commit_permit().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(Entity::Service, new.id));
        }

        let info = ServiceInfo {
            id: new.id,
            title: new.title,
            description: new.description,
            price_cents: new.price_cents,
            duration_minutes: new.duration_minutes,
            active: new.active,
            created_at: now_ms(),
        };
        self.wal_append(&Event::ServiceCreated {
            id: info.id,
            title: info.title.clone(),
            description: info.description.clone(),
            price_cents: info.price_cents,
            duration_minutes: info.duration_minutes,
            active: info.active,
            created_at: info.created_at,
        })
        .await?;
        self.services
            .insert(info.id, Arc::new(RwLock::new(ServiceState::new(info.clone()))));
        tracing::info!(service_id = info.id, title = %info.title, "service created");
        Ok(info)
    }

    pub async fn update_service(
        &self,
        actor: &Actor,
        id: ServiceId,
        patch: ServicePatch,
    ) -> Result<ServiceInfo, EngineError> {
        policy::authorize_catalog(actor).into_result()?;
        let _permit = self.commit_permit().await;
        let mut guard = self.write_service(id).await?;

        let current = &guard.info;
        let next = ServiceInfo {
            title: patch.title.unwrap_or_else(|| current.title.clone()),
            description: patch.description.unwrap_or_else(|| current.description.clone()),
            price_cents: patch.price_cents.unwrap_or(current.price_cents),
            duration_minutes: patch.duration_minutes.unwrap_or(current.duration_minutes),
            active: patch.active.unwrap_or(current.active),
            ..current.clone()
        };
        validate_service_fields(&next.title, &next.description, next.price_cents, next.duration_minutes)?;
        if next == *current {
            return Ok(next);
        }

        let event = Event::ServiceUpdated {
            id,
            title: next.title.clone(),
            description: next.description.clone(),
            price_cents: next.price_cents,
            duration_minutes: next.duration_minutes,
            active: next.active,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(next)
    }

    /// Remove a service with no bookings. Returns its last catalog entry.
    pub async fn delete_service(&self, actor: &Actor, id: ServiceId) -> Result<ServiceInfo, EngineError> {
        policy::authorize_catalog(actor).into_result()?;
        let _permit = self.commit_permit().await;
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.write_service(id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        self.persist_and_apply(&mut guard, &Event::ServiceDeleted { id }).await?;
        self.services.remove(&id);
        tracing::info!(service_id = id, "service deleted");
        Ok(guard.info.clone())
    }

    /// Catalog listing ordered by id, optionally restricted to (in)active services.
    pub async fn list_services(&self, active: Option<bool>) -> Vec<ServiceInfo> {
        let mut out = Vec::new();
        for rs in self.snapshot_services() {
            let guard = rs.read().await;
            if active.is_none_or(|a| guard.info.active == a) {
                out.push(guard.info.clone());
            }
        }
        out.sort_unstable_by_key(|s| s.id);
        out
    }

    pub async fn get_service_info(&self, id: ServiceId) -> Result<ServiceInfo, EngineError> {
        let rs = self
            .get_service(&id)
            .ok_or(EngineError::NotFound(Entity::Service, id))?;
        let guard = rs.read().await;
        Ok(guard.info.clone())
    }

    pub fn service_exists(&self, id: ServiceId) -> bool {
        self.services.contains_key(&id)
    }
}
