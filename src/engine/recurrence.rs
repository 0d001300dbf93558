//! Recurrence schedule computation: given a template's time range and its
//! recurrence descriptor, produce the time ranges of every sibling
//! instance. Creation of the instances (and their best-effort failure
//! handling) lives in the engine mutations.

use chrono::{Datelike, TimeZone, Utc};

use crate::limits::MAX_RECURRENCE_INSTANCES;
use crate::model::{Ms, Recurrence, RecurrenceFrequency, TimeRange};

use super::EngineError;

/// Walk day by day from the day after the template's start date through
/// `until` (inclusive). Included dates keep the template's wall-clock
/// start time and duration.
pub fn expansion_schedule(
    template: &TimeRange,
    recurrence: &Recurrence,
) -> Result<Vec<TimeRange>, EngineError> {
    let start = Utc
        .timestamp_millis_opt(template.start)
        .single()
        .ok_or(EngineError::Validation("template start out of range"))?;
    let until = Utc
        .timestamp_millis_opt(recurrence.until)
        .single()
        .ok_or(EngineError::Validation("recurrence end date out of range"))?;

    let duration_ms = template.duration_ms();
    let wall_clock = start.time();
    let until_date = until.date_naive();

    let mut schedule = Vec::new();
    let mut date = start
        .date_naive()
        .succ_opt()
        .ok_or(EngineError::Validation("template start out of range"))?;

    while date <= until_date {
        let include = match recurrence.frequency {
            RecurrenceFrequency::Daily => true,
            RecurrenceFrequency::Weekly => recurrence
                .days_of_week
                .contains(&(date.weekday().num_days_from_sunday() as u8)),
            RecurrenceFrequency::Monthly => date.day() == start.day(),
        };
        if include {
            if schedule.len() >= MAX_RECURRENCE_INSTANCES {
                return Err(EngineError::LimitExceeded("recurrence window too wide"));
            }
            let instance_start = Utc
                .from_utc_datetime(&date.and_time(wall_clock))
                .timestamp_millis();
            schedule.push(TimeRange::new(instance_start, instance_start + duration_ms));
        }
        date = date
            .succ_opt()
            .ok_or(EngineError::Validation("recurrence walked past calendar end"))?;
    }

    Ok(schedule)
}
