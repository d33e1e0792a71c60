use std::sync::atomic::{AtomicI32, Ordering};

use tracing::error;

/// Syslog facility and level codes. Only the names are accepted in
/// configuration; the numeric values follow `<syslog.h>`.
const LEVELS: &[(&str, i32)] = &[
    ("LOG_ALERT", 1),
    ("LOG_CRIT", 2),
    ("LOG_DEBUG", 7),
    ("LOG_EMERG", 0),
    ("LOG_ERR", 3),
    ("LOG_INFO", 6),
    ("LOG_NOTICE", 5),
    ("LOG_WARNING", 4),
];

const FACILITIES: &[(&str, i32)] = &[
    ("LOG_AUTH", 4 << 3),
    ("LOG_AUTHPRIV", 10 << 3),
    ("LOG_CRON", 9 << 3),
    ("LOG_DAEMON", 3 << 3),
    ("LOG_KERN", 0),
    ("LOG_LOCAL0", 16 << 3),
    ("LOG_LOCAL1", 17 << 3),
    ("LOG_LOCAL2", 18 << 3),
    ("LOG_LOCAL3", 19 << 3),
    ("LOG_LOCAL4", 20 << 3),
    ("LOG_LOCAL5", 21 << 3),
    ("LOG_LOCAL6", 22 << 3),
    ("LOG_LOCAL7", 23 << 3),
    ("LOG_LPR", 6 << 3),
    ("LOG_MAIL", 2 << 3),
    ("LOG_NEWS", 7 << 3),
    ("LOG_SYSLOG", 5 << 3),
    ("LOG_USER", 1 << 3),
    ("LOG_UUCP", 8 << 3),
];

pub const DEFAULT_FACILITY: i32 = 1 << 3; // LOG_USER
pub const DEFAULT_LEVEL: i32 = 4; // LOG_WARNING

const EVENT_PREFIX: &str = "event.";

/// Session log events with an operator-configurable facility and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    AuthenticationFailure = 0,
}

struct EventEntry {
    name: &'static str,
    id: EventId,
    facility: AtomicI32,
    level: AtomicI32,
}

static EVENTS: [EventEntry; 1] = [EventEntry {
    name: "authentication_failure",
    id: EventId::AuthenticationFailure,
    facility: AtomicI32::new(DEFAULT_FACILITY),
    level: AtomicI32::new(DEFAULT_LEVEL),
}];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureResult {
    /// The parameter was a valid event parameter and its value was accepted.
    Accepted,
    /// The parameter was an event parameter but the value was invalid.
    Invalid,
    /// The parameter was not an event parameter.
    Ignored,
}

pub fn level_from_string(value: &str) -> Option<i32> {
    LEVELS
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, v)| *v)
}

pub fn level_to_string(level: i32) -> &'static str {
    LEVELS
        .iter()
        .find(|(_, v)| *v == level)
        .map(|(name, _)| *name)
        .unwrap_or("Unknown")
}

pub fn facility_from_string(value: &str) -> Option<i32> {
    FACILITIES
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, v)| *v)
}

pub fn facility_to_string(facility: i32) -> &'static str {
    FACILITIES
        .iter()
        .find(|(_, v)| *v == facility)
        .map(|(name, _)| *name)
        .unwrap_or("Unknown")
}

pub fn event_from_string(value: &str) -> Option<EventId> {
    EVENTS
        .iter()
        .find(|entry| entry.name == value)
        .map(|entry| entry.id)
}

pub fn event_to_string(id: EventId) -> &'static str {
    EVENTS[id as usize].name
}

pub fn set_log_facility(id: EventId, facility: i32) {
    EVENTS[id as usize].facility.store(facility, Ordering::Relaxed);
}

pub fn get_log_facility(id: EventId) -> i32 {
    EVENTS[id as usize].facility.load(Ordering::Relaxed)
}

pub fn set_log_level(id: EventId, level: i32) {
    EVENTS[id as usize].level.store(level, Ordering::Relaxed);
}

pub fn get_log_level(id: EventId) -> i32 {
    EVENTS[id as usize].level.load(Ordering::Relaxed)
}

/// Apply one `event.<name>.facility` or `event.<name>.level` configuration
/// parameter. Names that do not start with `event.` are ignored so the
/// caller can feed its whole parameter table through here.
pub fn configure(name: &str, value: &str) -> ConfigureResult {
    let Some(rest) = name.strip_prefix(EVENT_PREFIX) else {
        return ConfigureResult::Ignored;
    };

    let Some((event_name, property)) = rest.split_once('.') else {
        error!("{} is not a valid event configuration.", name);
        return ConfigureResult::Invalid;
    };

    let Some(id) = event_from_string(event_name) else {
        error!("{} does not refer to a known event.", event_name);
        return ConfigureResult::Invalid;
    };

    match property {
        "facility" => match facility_from_string(value) {
            Some(facility) => {
                set_log_facility(id, facility);
                ConfigureResult::Accepted
            }
            None => {
                error!("{} is not a valid facility.", value);
                ConfigureResult::Invalid
            }
        },
        "level" => match level_from_string(value) {
            Some(level) => {
                set_log_level(id, level);
                ConfigureResult::Accepted
            }
            None => {
                error!("{} is not a valid level.", value);
                ConfigureResult::Invalid
            }
        },
        other => {
            error!("{} is neither facility nor level.", other);
            ConfigureResult::Invalid
        }
    }
}
