use crate::error::{RecallError, Result};
use crate::traits::AnswerGenerator;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the given retrieval content to answer \
the user's question accurately. If the information is not available in the data given to you or \
you are unsure about it, only say you don't know unless that information was given by the user \
themselves.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

pub fn format_user_turn(context: &str, query: &str) -> String {
    format!("Context:\n{context}\n\nUser query: {query}")
}

#[derive(Debug, Clone, Copy)]
pub struct ConversationLimits {
    /// Messages sent to the generator, the new user turn included.
    pub prompt_cap: usize,
    /// Messages kept once the reply is appended.
    pub retained_cap: usize,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            prompt_cap: 5,
            retained_cap: 6,
        }
    }
}

/// Most recent turns of one conversation, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ConversationWindow {
    limits: ConversationLimits,
    messages: VecDeque<Message>,
}

impl ConversationWindow {
    pub fn new(limits: ConversationLimits) -> Self {
        Self {
            limits,
            messages: VecDeque::new(),
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// One question/answer round trip.
    ///
    /// The generator sees the latest turns up to the prompt cap, the new user
    /// turn included. Both turns are committed only once the reply arrives, then
    /// the window is trimmed to the retained cap. A failed or cancelled
    /// generation leaves the window untouched.
    pub async fn exchange<G>(&mut self, generator: &G, context: &str, query: &str) -> Result<String>
    where
        G: AnswerGenerator + ?Sized,
    {
        let user = Message::user(format_user_turn(context, query));
        let earlier = self.limits.prompt_cap.saturating_sub(1);
        let skip = self.messages.len().saturating_sub(earlier);
        let mut turns: Vec<Message> = self.messages.iter().skip(skip).cloned().collect();
        turns.push(user.clone());

        let reply = generator
            .generate(SYSTEM_PROMPT, &turns)
            .await?
            .trim()
            .to_string();

        self.messages.push_back(user);
        self.messages.push_back(Message::assistant(reply.clone()));
        self.trim(self.limits.retained_cap);
        Ok(reply)
    }

    fn trim(&mut self, cap: usize) {
        while self.messages.len() > cap {
            self.messages.pop_front();
        }
    }
}

/// When idle sessions are dropped from a [`SessionRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Sessions unused for longer than this are evicted.
    pub idle_ttl: Duration,
    /// Once reached, opening a new session evicts the least recently used idle one.
    pub max_sessions: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30 * 60),
            max_sessions: 10_000,
        }
    }
}

struct SessionEntry {
    window: Arc<AsyncMutex<ConversationWindow>>,
    last_used: Instant,
}

impl SessionEntry {
    /// A window handed out by [`SessionRegistry::session`] is still referenced.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.window) > 1
    }
}

/// Conversation windows keyed by session id.
///
/// Each window sits behind its own async mutex, held for a whole exchange, so
/// two requests on one session run one after the other while different
/// sessions proceed independently. Sessions in use are never evicted.
#[derive(Default)]
pub struct SessionRegistry {
    limits: ConversationLimits,
    policy: SessionPolicy,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(limits: ConversationLimits) -> Self {
        Self::with_policy(limits, SessionPolicy::default())
    }

    pub fn with_policy(limits: ConversationLimits, policy: SessionPolicy) -> Self {
        Self {
            limits,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self, session_id: &str) -> Result<Arc<AsyncMutex<ConversationWindow>>> {
        let mut sessions = self.sessions.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        self.evict_idle(&mut sessions, now);
        if !sessions.contains_key(session_id) {
            self.make_room(&mut sessions);
        }

        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                window: Arc::new(AsyncMutex::new(ConversationWindow::new(self.limits))),
                last_used: now,
            });
        entry.last_used = now;
        Ok(entry.window.clone())
    }

    pub async fn exchange<G>(
        &self,
        session_id: &str,
        generator: &G,
        context: &str,
        query: &str,
    ) -> Result<String>
    where
        G: AnswerGenerator + ?Sized,
    {
        let session = self.session(session_id)?;
        let mut window = session.lock().await;
        let reply = window.exchange(generator, context, query).await;
        match &reply {
            Ok(_) => debug!(session_id, retained = window.len(), "conversation exchange"),
            Err(error) => warn!(session_id, %error, "answer generation failed"),
        }
        reply
    }

    /// Returns whether the session existed.
    pub fn forget(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().map_err(|_| poisoned())?;
        Ok(sessions.remove(session_id).is_some())
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }

    fn evict_idle(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry.in_use() || now.duration_since(entry.last_used) <= self.policy.idle_ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "idle sessions evicted");
        }
    }

    fn make_room(&self, sessions: &mut HashMap<String, SessionEntry>) {
        while sessions.len() >= self.policy.max_sessions.max(1) {
            let oldest = sessions
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else {
                warn!(sessions = sessions.len(), "session capacity reached, every session in use");
                return;
            };
            sessions.remove(&oldest);
            debug!(session_id = %oldest, "least recently used session evicted");
        }
    }
}

/// Forgets its session when dropped, including when the owning request is
/// cancelled mid-flight.
pub struct EphemeralSession<'a> {
    registry: &'a SessionRegistry,
    session_id: String,
}

impl<'a> EphemeralSession<'a> {
    pub fn new(registry: &'a SessionRegistry, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for EphemeralSession<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.registry.forget(&self.session_id) {
            warn!(session_id = %self.session_id, %error, "ephemeral session not released");
        }
    }
}

fn poisoned() -> RecallError {
    RecallError::BackendUnavailable {
        backend: "sessions".to_string(),
        details: "session registry lock poisoned".to_string(),
    }
}
