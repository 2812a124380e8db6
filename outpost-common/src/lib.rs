// Copyright (C) 2026 Outpost Maintainers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How long a pending registration waits for out-of-band confirmation.
pub const REGISTRATION_TTL_SECONDS: u64 = 60;

pub const IDLE_POLL_INTERVAL_SECONDS: u64 = 60;
/// Consecutive empty polls before the one-time "shutdown imminent" notice.
pub const IDLE_EARLY_WARNING_CYCLES: u32 = 4;
/// Consecutive empty polls before the shutdown sequence fires.
pub const IDLE_SHUTDOWN_CYCLES: u32 = 5;
pub const SHUTDOWN_GRACE_SECONDS: u64 = 10;

/// One chat-platform identity and, once linked, its game account. The store
/// keeps exactly one document per identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub identity: String,
    pub display_name: String,
    #[serde(default)]
    pub account: Option<LinkedAccount>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub account_name: String,
    /// PHC-format Argon2id hash of password + pepper, never the raw secret.
    pub password_hash: String,
    pub linked: bool,
}

/// Shallow patch applied to an existing [`UserRecord`]. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub display_name: Option<String>,
    pub account: Option<LinkedAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddUserRequest {
    pub identity: String,
    pub display_name: String,
}

/// Listing entry for the internal admin surface. Deliberately excludes the
/// password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub identity: String,
    pub display_name: String,
    pub account_name: Option<String>,
    pub linked: bool,
}

impl From<&UserRecord> for UserSummary {
    fn from(record: &UserRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            display_name: record.display_name.clone(),
            account_name: record
                .account
                .as_ref()
                .map(|account| account.account_name.clone()),
            linked: record
                .account
                .as_ref()
                .is_some_and(|account| account.linked),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatusResponse {
    pub online: bool,
    pub players: u32,
    #[serde(default)]
    pub tick: Option<String>,
}

/// Extract the online player count from the server's `list` command reply.
/// Handles both the modern wording and the older `N/M` form.
pub fn parse_player_count(reply: &str) -> Option<u32> {
    let re = Regex::new(r"There are (\d+)(?: of a max of \d+|/\d+) players online").unwrap();
    re.captures(reply)
        .and_then(|caps| caps[1].parse::<u32>().ok())
}
