use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A live conversation between one user and the system in one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSession {
    pub user_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub session_start: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_count: u32,
}

impl ConversationSession {
    pub fn open(user_id: &str, guild_id: &str, channel_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            user_id: user_id.to_owned(),
            guild_id: guild_id.to_owned(),
            channel_id: channel_id.to_owned(),
            session_start: now,
            last_interaction: now,
            expires_at: now + ttl,
            message_count: 1,
        }
    }

    /// Sliding TTL: each directed message pushes expiry forward.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_interaction = now;
        self.expires_at = now + ttl;
        self.message_count += 1;
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn duration(&self) -> Duration {
        (self.last_interaction - self.session_start).max(Duration::zero())
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Superseded,
    Timeout,
    Explicit,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Timeout => "timeout",
            Self::Explicit => "explicit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {
    pub session: ConversationSession,
    pub reason: EndReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let s = ConversationSession::open("u", "g", "c", now, Duration::seconds(10));
        assert!(!s.is_expired_at(now + Duration::seconds(9)));
        assert!(s.is_expired_at(now + Duration::seconds(10)));
    }

    #[test]
    fn touch_slides_expiry() {
        let now = Utc::now();
        let mut s = ConversationSession::open("u", "g", "c", now, Duration::seconds(10));
        s.touch(now + Duration::seconds(8), Duration::seconds(10));
        assert_eq!(s.expires_at, now + Duration::seconds(18));
        assert_eq!(s.message_count, 2);
        assert_eq!(s.duration(), Duration::seconds(8));
    }
}
