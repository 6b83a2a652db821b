use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type UserId = i64;
pub type ServiceId = i64;
pub type BookingId = i64;
pub type ReviewId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Everything except `cancelled` occupies its interval.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown booking status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// The authenticated identity attempting an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self { id, role: Role::User }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// What the review store is allowed to see of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingState {
    pub owner_id: UserId,
    pub status: BookingStatus,
    pub reviewed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub booking_id: BookingId,
    pub user_id: UserId,
    pub rating: u8,
    pub comment: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub title: String,
    pub description: String,
    /// Price in minor currency units.
    pub price_cents: i64,
    pub duration_minutes: u32,
    pub active: bool,
    pub created_at: Ms,
}

/// Requested booking mutation. Absent fields stay as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<BookingStatus>,
}

impl BookingChanges {
    pub fn reschedule(start: Ms, end: Ms) -> Self {
        Self { start: Some(start), end: Some(end), status: None }
    }

    pub fn status(status: BookingStatus) -> Self {
        Self { start: None, end: None, status: Some(status) }
    }

    pub fn touches_interval(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

/// Catalog entry as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub id: ServiceId,
    pub title: String,
    pub description: String,
    pub price_cents: i64,
    pub duration_minutes: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub duration_minutes: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewPatch {
    /// Unchecked; the review store enforces the rating range.
    pub rating: Option<i64>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub service_id: Option<ServiceId>,
    pub status: Option<BookingStatus>,
    /// Bookings starting at or after this instant.
    pub from: Option<Ms>,
    /// Bookings ending at or before this instant.
    pub to: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.service_id.is_none_or(|s| b.service_id == s)
            && self.status.is_none_or(|s| b.status == s)
            && self.from.is_none_or(|t| b.span.start >= t)
            && self.to.is_none_or(|t| b.span.end <= t)
    }
}

/// A service and everything booked against it. One lock scope per service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub info: ServiceInfo,
    /// All bookings, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// At most one review per booking.
    pub reviews: HashMap<BookingId, Review>,
    /// Set when the service is deleted while someone still holds its Arc.
    pub retired: bool,
}

impl ServiceState {
    pub fn new(info: ServiceInfo) -> Self {
        Self {
            info,
            bookings: Vec::new(),
            reviews: HashMap::new(),
            retired: false,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn state_of(&self, id: BookingId) -> Option<BookingState> {
        self.booking(id).map(|b| BookingState {
            owner_id: b.user_id,
            status: b.status,
            reviewed: self.reviews.contains_key(&id),
        })
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        id: ServiceId,
        title: String,
        description: String,
        price_cents: i64,
        duration_minutes: u32,
        active: bool,
        created_at: Ms,
    },
    ServiceUpdated {
        id: ServiceId,
        title: String,
        description: String,
        price_cents: i64,
        duration_minutes: u32,
        active: bool,
    },
    ServiceDeleted {
        id: ServiceId,
    },
    BookingCreated {
        id: BookingId,
        user_id: UserId,
        service_id: ServiceId,
        span: Span,
        status: BookingStatus,
        created_at: Ms,
    },
    BookingUpdated {
        id: BookingId,
        service_id: ServiceId,
        span: Span,
        status: BookingStatus,
    },
    BookingDeleted {
        id: BookingId,
        service_id: ServiceId,
    },
    ReviewCreated {
        id: ReviewId,
        booking_id: BookingId,
        service_id: ServiceId,
        user_id: UserId,
        rating: u8,
        comment: String,
        created_at: Ms,
    },
    ReviewUpdated {
        id: ReviewId,
        booking_id: BookingId,
        service_id: ServiceId,
        rating: u8,
        comment: String,
    },
    ReviewDeleted {
        id: ReviewId,
        booking_id: BookingId,
        service_id: ServiceId,
    },
    /// Written at the head of a compacted log so ids are never handed out twice.
    IdsReserved {
        next_booking_id: BookingId,
        next_review_id: ReviewId,
    },
}

impl Event {
    /// The service whose lock scope this event mutates.
    pub fn service_id(&self) -> Option<ServiceId> {
        match self {
            Event::ServiceUpdated { id, .. } => Some(*id),
            Event::BookingCreated { service_id, .. }
            | Event::BookingUpdated { service_id, .. }
            | Event::BookingDeleted { service_id, .. }
            | Event::ReviewCreated { service_id, .. }
            | Event::ReviewUpdated { service_id, .. }
            | Event::ReviewDeleted { service_id, .. } => Some(*service_id),
            Event::ServiceCreated { .. } | Event::ServiceDeleted { .. } | Event::IdsReserved { .. } => {
                None
            }
        }
    }
}
