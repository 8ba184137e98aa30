//! MegaTrade Protocol
//!
//! Shared types for communication between the group-chat relay and its clients.
//! These types are serialized as JSON text frames over WebSocket, adjacently
//! tagged as `{"event": <name>, "data": <payload>}`.

use std::time::{SystemTime, UNIX_EPOCH};

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Room served when a client does not name one.
pub const DEFAULT_ROOM: &str = "chat-group";

/// `error` code sent to a subscriber that fell behind the room broadcast.
/// The client answers it with `history.request`.
pub const LAGGED_CODE: &str = "lagged";

/// Current wall-clock time as an ISO 8601 UTC timestamp.
pub fn now_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    iso_timestamp(millis)
}

/// Format millis-since-epoch as ISO 8601 timestamp
pub fn iso_timestamp(millis: u128) -> String {
    let total_secs = millis / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let total_hours = total_mins / 60;
    let hours = total_hours % 24;
    let mut remaining_days = (total_hours / 24) as i64;

    let mut year = 1970i64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let month_days = [
        31,
        if is_leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    while month < 11 && remaining_days >= month_days[month] {
        remaining_days -= month_days[month];
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        year,
        month + 1,
        remaining_days + 1,
        hours,
        mins,
        secs,
        millis % 1000
    )
}

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
