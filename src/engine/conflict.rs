use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Ordered, inside the accepted timestamp range.
fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::try_new(start, end)
        .ok_or(EngineError::Validation("start_time must be before end_time"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    Ok(span)
}

/// Build the interval for a booking, rejecting it before any conflict check runs.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_interval(start, end)?;
    if span.duration_ms() > crate::limits::MAX_SPAN_DURATION_MS {
        return Err(EngineError::Validation("booking too long"));
    }
    Ok(span)
}

/// A conflict query window may be wider than any one booking, up to its own cap.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_interval(start, end)?;
    if span.duration_ms() > crate::limits::MAX_QUERY_WINDOW_MS {
        return Err(EngineError::Validation("query window too wide"));
    }
    Ok(span)
}

/// Every non-cancelled booking on the service that overlaps `span`, except `excluding`.
pub(crate) fn find_conflicts(
    rs: &ServiceState,
    span: Span,
    excluding: Option<BookingId>,
) -> impl Iterator<Item = &Booking> {
    rs.overlapping(span)
        .filter(move |b| b.status.is_active() && Some(b.id) != excluding)
}

pub(crate) fn check_no_conflict(
    rs: &ServiceState,
    span: &Span,
    excluding: Option<BookingId>,
) -> Result<(), EngineError> {
    let conflicts: Vec<BookingId> = find_conflicts(rs, *span, excluding).map(|b| b.id).collect();
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    tracing::debug!(
        service_id = rs.info.id,
        start = span.start,
        end = span.end,
        conflicts = conflicts.len(),
        "booking conflict"
    );
    Err(EngineError::Conflict(conflicts))
}
