use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::session::{ConversationSession, EndReason, SessionEnd};
use crate::types::{Routing, Stimulus};

/// Greetings that may precede the address name, e.g. "hey warden".
const ADDRESS_PREFIXES: [&str; 4] = ["hey ", "hi ", "ok ", "yo "];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    user: String,
    guild: String,
    channel: String,
}

type ChannelKey = (String, String);

/// Result of routing one stimulus.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub routing: Routing,
    pub session: Option<ConversationSession>,
    pub ended: Vec<SessionEnd>,
}

/// Classifies stimuli as directed/ambient/system and owns conversation sessions.
///
/// Per channel this is a two-state machine: no session, or one active user.
#[derive(Debug)]
pub struct SessionRouter {
    ttl: Duration,
    address_name: String,
    sessions: HashMap<SessionKey, ConversationSession>,
    active_by_channel: HashMap<ChannelKey, String>,
}

impl SessionRouter {
    pub fn new(ttl: std::time::Duration, address_name: &str) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
            address_name: address_name.trim().to_lowercase(),
            sessions: HashMap::new(),
            active_by_channel: HashMap::new(),
        }
    }

    pub fn route(&mut self, stimulus: &mut Stimulus) -> RouteOutcome {
        self.route_at(stimulus, Utc::now())
    }

    pub fn route_at(&mut self, stimulus: &mut Stimulus, now: DateTime<Utc>) -> RouteOutcome {
        let mut ended = self.expire_stale_at(now);

        if !stimulus.kind.is_conversational() {
            stimulus.routing = Routing::System;
            return RouteOutcome { routing: Routing::System, session: None, ended };
        }

        let (Some(author), Some(channel)) = (stimulus.author_id(), stimulus.channel_id()) else {
            stimulus.routing = Routing::Ambient;
            return RouteOutcome { routing: Routing::Ambient, session: None, ended };
        };
        let author = author.to_owned();
        let channel = channel.to_owned();
        let guild = stimulus.server_id().to_owned();

        let key = SessionKey { user: author.clone(), guild: guild.clone(), channel: channel.clone() };
        let has_live_session = self.sessions.contains_key(&key);
        let explicit = stimulus.mentions_bot() || self.looks_addressed(stimulus.content());

        if !(explicit || has_live_session) {
            stimulus.routing = Routing::Ambient;
            return RouteOutcome { routing: Routing::Ambient, session: None, ended };
        }

        let channel_key = (guild.clone(), channel.clone());
        if let Some(active_user) = self.active_by_channel.get(&channel_key)
            && *active_user != author
        {
            let prior = SessionKey { user: active_user.clone(), guild: guild.clone(), channel: channel.clone() };
            if let Some(session) = self.sessions.remove(&prior) {
                tracing::debug!(user = %session.user_id, channel = %channel, "session superseded");
                ended.push(SessionEnd { session, reason: EndReason::Superseded });
            }
        }

        let ttl = self.ttl;
        let session = self
            .sessions
            .entry(key)
            .and_modify(|s| s.touch(now, ttl))
            .or_insert_with(|| ConversationSession::open(&author, &guild, &channel, now, ttl))
            .clone();
        self.active_by_channel.insert(channel_key, author);

        stimulus.routing = Routing::Directed;
        RouteOutcome { routing: Routing::Directed, session: Some(session), ended }
    }

    pub fn expire_stale(&mut self) -> Vec<SessionEnd> {
        self.expire_stale_at(Utc::now())
    }

    pub fn expire_stale_at(&mut self, now: DateTime<Utc>) -> Vec<SessionEnd> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut ended = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(session) = self.remove(&key) {
                ended.push(SessionEnd { session, reason: EndReason::Timeout });
            }
        }
        ended
    }

    /// End a session on request (disengage command, adapter signal).
    pub fn end_session(&mut self, user: &str, guild: &str, channel: &str) -> Option<SessionEnd> {
        let key = SessionKey { user: user.to_owned(), guild: guild.to_owned(), channel: channel.to_owned() };
        self.remove(&key)
            .map(|session| SessionEnd { session, reason: EndReason::Explicit })
    }

    pub fn active_for_channel(&self, guild: &str, channel: &str) -> Option<&ConversationSession> {
        let user = self.active_by_channel.get(&(guild.to_owned(), channel.to_owned()))?;
        self.sessions.get(&SessionKey { user: user.clone(), guild: guild.to_owned(), channel: channel.to_owned() })
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn remove(&mut self, key: &SessionKey) -> Option<ConversationSession> {
        let session = self.sessions.remove(key)?;
        let channel_key = (key.guild.clone(), key.channel.clone());
        if self.active_by_channel.get(&channel_key) == Some(&key.user) {
            self.active_by_channel.remove(&channel_key);
        }
        Some(session)
    }

    fn looks_addressed(&self, content: &str) -> bool {
        if self.address_name.is_empty() {
            return false;
        }
        let text = content.trim().to_lowercase();
        let text = ADDRESS_PREFIXES
            .iter()
            .find_map(|p| text.strip_prefix(p))
            .unwrap_or(text.as_str());
        match text.strip_prefix(self.address_name.as_str()) {
            Some(rest) => rest.chars().next().is_none_or(|c| !c.is_alphanumeric()),
            None => text.contains(&format!("@{}", self.address_name)),
        }
    }
}
