//! Pairing token lifecycle
//!
//! Each token owns a small ordered mailbox. Events are posted into the
//! mailbox regardless of whether a listener is attached, so a listener that
//! attaches late still sees everything it has not yet consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{AUTHORIZATION_FAILED, PairingEvent, ProviderTokens};
use crate::{Error, Result};

/// Token length in random bytes
const TOKEN_LENGTH: usize = 16;

/// Mailbox depth; a token sees at most one visit and one terminal event
const MAILBOX_CAPACITY: usize = 4;

/// Default heartbeat interval on pairing streams
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Default lifetime of a token that is never completed
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Lifecycle state of a live token
///
/// Completion removes the token, so there is no `Completed` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// Token minted, redirect not followed yet
    Waiting,
    /// User followed the authorization redirect
    Visited,
    /// A callback holds the token while its authorization code is exchanged
    Exchanging,
}

/// A freshly minted token
#[derive(Debug, Clone, Serialize)]
pub struct PairingTicket {
    /// Correlation token, also used as the OAuth `state`
    pub token: String,

    /// URL the user opens to start authorization
    #[serde(rename = "redirectUrl")]
    pub redirect_url: String,
}

/// Result of marking a token visited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    /// Provider the token was minted for
    pub provider: String,

    /// False if the token had already been visited
    pub first: bool,
}

struct PairingEntry {
    provider: String,
    state: PairingState,
    created_at: Instant,
    mailbox: mpsc::Sender<PairingEvent>,
    /// Present while no listener holds it
    inbox: Option<mpsc::Receiver<PairingEvent>>,
}

impl PairingEntry {
    fn post(&self, token: &str, event: PairingEvent) {
        if self.mailbox.try_send(event).is_err() {
            tracing::warn!(token = %short(token), "pairing mailbox full, event dropped");
        }
    }
}

type TokenTable = Arc<Mutex<HashMap<String, PairingEntry>>>;

/// Coordinates pairing tokens and their listeners
#[derive(Clone)]
pub struct PairingCoordinator {
    tokens: TokenTable,
    ttl: Duration,
}

impl Default for PairingCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl PairingCoordinator {
    /// Create a coordinator whose idle tokens expire after `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Idle-token lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a new token for `provider`
    ///
    /// `public_url` is the externally reachable base URL of this service.
    #[must_use]
    pub fn create_token(&self, provider: &str, public_url: &str) -> PairingTicket {
        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let entry = PairingEntry {
            provider: provider.to_string(),
            state: PairingState::Waiting,
            created_at: Instant::now(),
            mailbox,
            inbox: Some(inbox),
        };

        let mut tokens = lock(&self.tokens);
        let token = loop {
            let candidate = generate_token();
            if !tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        tokens.insert(token.clone(), entry);
        drop(tokens);

        tracing::debug!(provider, token = %short(&token), "pairing token created");

        PairingTicket {
            redirect_url: format!(
                "{}/pair/{provider}/auth/{token}",
                public_url.trim_end_matches('/')
            ),
            token,
        }
    }

    /// Record that the user followed the redirect
    ///
    /// The first call moves the token to `Visited` and posts a visit event.
    /// Later calls change nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` for an unknown token
    pub fn mark_visited(&self, token: &str) -> Result<Visit> {
        let mut tokens = lock(&self.tokens);
        let entry = tokens
            .get_mut(token)
            .ok_or_else(|| Error::InvalidToken(short(token)))?;

        let first = entry.state == PairingState::Waiting;
        if first {
            entry.state = PairingState::Visited;
            entry.post(token, PairingEvent::Visited);
            tracing::info!(
                provider = %entry.provider,
                token = %short(token),
                "pairing URL visited"
            );
        }

        Ok(Visit {
            provider: entry.provider.clone(),
            first,
        })
    }

    /// Bind the token's stream to a listener
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` for an unknown token, or `Error::Conflict`
    /// if another listener is attached
    pub fn attach_listener(&self, token: &str) -> Result<PairingListener> {
        let mut tokens = lock(&self.tokens);
        let entry = tokens
            .get_mut(token)
            .ok_or_else(|| Error::InvalidToken(short(token)))?;

        let inbox = entry
            .inbox
            .take()
            .ok_or_else(|| Error::Conflict("listener already attached".to_string()))?;

        tracing::debug!(token = %short(token), "pairing listener attached");

        Ok(PairingListener {
            token: token.to_string(),
            inbox: Some(inbox),
            tokens: Arc::clone(&self.tokens),
        })
    }

    /// Claim the token for a provider callback
    ///
    /// The claim is exclusive: until it is settled, every other callback for
    /// the token is refused, so a replayed or prefetched callback cannot
    /// settle the token while the real one is still exchanging its code.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` for an unknown token, or `Error::Conflict`
    /// if another callback already holds it
    pub fn begin_completion(&self, token: &str) -> Result<CompletionClaim> {
        let mut tokens = lock(&self.tokens);
        let entry = tokens
            .get_mut(token)
            .ok_or_else(|| Error::InvalidToken(short(token)))?;

        if entry.state == PairingState::Exchanging {
            tracing::warn!(
                provider = %entry.provider,
                token = %short(token),
                "duplicate pairing callback refused"
            );
            return Err(Error::Conflict("authorization already in progress".to_string()));
        }
        entry.state = PairingState::Exchanging;
        drop(tokens);

        Ok(CompletionClaim {
            token: token.to_string(),
            coordinator: self.clone(),
            settled: false,
        })
    }

    /// Deliver the provider's credentials and discard the token
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` if the token is unknown or already completed
    pub fn complete(&self, token: &str, credentials: ProviderTokens) -> Result<()> {
        let entry = self.take(token)?;
        entry.post(token, PairingEvent::Authorized(credentials));
        tracing::info!(provider = %entry.provider, token = %short(token), "pairing completed");
        Ok(())
    }

    /// Deliver a failure and discard the token
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` if the token is unknown or already completed
    pub fn fail(&self, token: &str, error: &str) -> Result<()> {
        let entry = self.take(token)?;
        entry.post(
            token,
            PairingEvent::Failed {
                error: error.to_string(),
            },
        );
        tracing::warn!(provider = %entry.provider, token = %short(token), error, "pairing failed");
        Ok(())
    }

    /// Evict tokens older than the TTL, notifying any listener
    ///
    /// Returns the number of tokens evicted.
    pub fn reap_expired(&self) -> usize {
        let mut tokens = lock(&self.tokens);
        let ttl = self.ttl;
        let expired: Vec<String> = tokens
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= ttl)
            .map(|(token, _)| token.clone())
            .collect();

        for token in &expired {
            if let Some(entry) = tokens.remove(token) {
                entry.post(token, PairingEvent::Expired);
            }
        }
        drop(tokens);

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired pairing tokens evicted");
        }
        expired.len()
    }

    /// Run [`Self::reap_expired`] every `every` until the handle is aborted
    #[must_use]
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.reap_expired();
            }
        })
    }

    /// Provider a token was minted for
    #[must_use]
    pub fn provider_of(&self, token: &str) -> Option<String> {
        lock(&self.tokens).get(token).map(|e| e.provider.clone())
    }

    /// Current state of a live token
    #[must_use]
    pub fn state(&self, token: &str) -> Option<PairingState> {
        lock(&self.tokens).get(token).map(|e| e.state)
    }

    /// Number of live tokens
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    /// Whether there are no live tokens
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, token: &str) -> Result<PairingEntry> {
        lock(&self.tokens)
            .remove(token)
            .ok_or_else(|| Error::InvalidToken(short(token)))
    }
}

/// Exclusive right to settle a token, taken by [`PairingCoordinator::begin_completion`]
///
/// Dropping an unsettled claim fails the token.
#[must_use]
pub struct CompletionClaim {
    token: String,
    coordinator: PairingCoordinator,
    settled: bool,
}

impl CompletionClaim {
    /// Deliver the credentials and discard the token
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` if the token was reaped meanwhile
    pub fn complete(mut self, credentials: ProviderTokens) -> Result<()> {
        self.settled = true;
        self.coordinator.complete(&self.token, credentials)
    }

    /// Deliver a failure and discard the token
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` if the token was reaped meanwhile
    pub fn fail(mut self, error: &str) -> Result<()> {
        self.settled = true;
        self.coordinator.fail(&self.token, error)
    }
}

impl Drop for CompletionClaim {
    fn drop(&mut self) {
        if !self.settled && self.coordinator.fail(&self.token, AUTHORIZATION_FAILED).is_ok() {
            tracing::debug!(token = %short(&self.token), "abandoned pairing callback");
        }
    }
}

/// The receiving end of a token's stream
///
/// Dropping the listener detaches it; the token stays live and can be
/// re-attached.
pub struct PairingListener {
    token: String,
    inbox: Option<mpsc::Receiver<PairingEvent>>,
    tokens: TokenTable,
}

impl PairingListener {
    /// Next non-heartbeat event
    ///
    /// Yields `Expired` if the token disappears without a terminal event.
    pub async fn recv(&mut self) -> PairingEvent {
        match self.inbox.as_mut() {
            Some(inbox) => inbox.recv().await.unwrap_or(PairingEvent::Expired),
            None => PairingEvent::Expired,
        }
    }

    /// Turn the listener into a stream with a heartbeat every `heartbeat`
    ///
    /// The stream ends right after the first terminal event. Dropping it
    /// stops the heartbeat and detaches the listener.
    pub fn into_events(self, heartbeat: Duration) -> impl Stream<Item = PairingEvent> + Send {
        let start = tokio::time::Instant::now() + heartbeat;
        let ticker = tokio::time::interval_at(start, heartbeat);

        futures::stream::unfold(Some((self, ticker)), |state| async move {
            let (mut listener, mut ticker) = state?;

            let event = tokio::select! {
                biased;
                event = listener.recv() => event,
                _ = ticker.tick() => PairingEvent::KeepAlive,
            };

            let next = (!event.is_terminal()).then_some((listener, ticker));
            Some((event, next))
        })
    }
}

impl Drop for PairingListener {
    fn drop(&mut self) {
        let Some(inbox) = self.inbox.take() else {
            return;
        };

        // Hand the mailbox back if the token is still live
        if let Some(entry) = lock(&self.tokens).get_mut(&self.token) {
            entry.inbox = Some(inbox);
            tracing::debug!(token = %short(&self.token), "pairing listener detached");
        }
    }
}

fn lock(tokens: &TokenTable) -> MutexGuard<'_, HashMap<String, PairingEntry>> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token prefix for logs
fn short(token: &str) -> String {
    token.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn credentials() -> ProviderTokens {
        ProviderTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in: Some(3600),
        }
    }

    #[test]
    fn test_listener_parks_until_event() {
        let coordinator = PairingCoordinator::default();
        let ticket = coordinator.create_token("spotify", "http://localhost:18800");
        let mut listener = coordinator.attach_listener(&ticket.token).unwrap();

        let mut recv = tokio_test::task::spawn(listener.recv());
        tokio_test::assert_pending!(recv.poll());

        coordinator.mark_visited(&ticket.token).unwrap();
        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), PairingEvent::Visited);
    }

    #[test]
    fn test_create_token() {
        let coordinator = PairingCoordinator::default();
        let ticket = coordinator.create_token("spotify", "http://localhost:18800/");

        assert_eq!(ticket.token.len(), TOKEN_LENGTH * 2);
        assert_eq!(
            ticket.redirect_url,
            format!("http://localhost:18800/pair/spotify/auth/{}", ticket.token)
        );
        assert_eq!(coordinator.state(&ticket.token), Some(PairingState::Waiting));
        assert_eq!(coordinator.provider_of(&ticket.token).as_deref(), Some("spotify"));
    }

    #[test]
    fn test_unknown_token_is_invalid() {
        let coordinator = PairingCoordinator::default();
        assert!(matches!(coordinator.mark_visited("nope"), Err(Error::InvalidToken(_))));
        assert!(matches!(coordinator.attach_listener("nope"), Err(Error::InvalidToken(_))));
        assert!(matches!(
            coordinator.complete("nope", credentials()),
            Err(Error::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_before_visit() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("google", "http://x").token;

        let mut listener = coordinator.attach_listener(&token).unwrap();
        assert!(coordinator.mark_visited(&token).unwrap().first);
        coordinator.complete(&token, credentials()).unwrap();

        assert_eq!(listener.recv().await, PairingEvent::Visited);
        assert_eq!(listener.recv().await, PairingEvent::Authorized(credentials()));
    }

    #[tokio::test]
    async fn test_listener_after_visit_still_sees_visit_once() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("google", "http://x").token;

        coordinator.mark_visited(&token).unwrap();
        assert!(!coordinator.mark_visited(&token).unwrap().first);
        assert_eq!(coordinator.state(&token), Some(PairingState::Visited));

        let mut listener = coordinator.attach_listener(&token).unwrap();
        coordinator.complete(&token, credentials()).unwrap();

        assert_eq!(listener.recv().await, PairingEvent::Visited);
        assert_eq!(listener.recv().await, PairingEvent::Authorized(credentials()));
    }

    #[tokio::test]
    async fn test_complete_twice_delivers_once() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;
        let listener = coordinator.attach_listener(&token).unwrap();

        coordinator.complete(&token, credentials()).unwrap();
        assert!(matches!(
            coordinator.complete(&token, credentials()),
            Err(Error::InvalidToken(_))
        ));
        assert!(coordinator.is_empty());

        let events: Vec<_> = listener.into_events(Duration::from_secs(60)).collect().await;
        assert_eq!(events, vec![PairingEvent::Authorized(credentials())]);
    }

    #[tokio::test]
    async fn test_second_listener_conflicts() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;

        let first = coordinator.attach_listener(&token).unwrap();
        assert!(matches!(coordinator.attach_listener(&token), Err(Error::Conflict(_))));

        // Detaching keeps the token and frees the slot
        drop(first);
        assert_eq!(coordinator.state(&token), Some(PairingState::Waiting));
        assert!(coordinator.attach_listener(&token).is_ok());
    }

    #[tokio::test]
    async fn test_detached_listener_does_not_lose_events() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;

        drop(coordinator.attach_listener(&token).unwrap());
        coordinator.mark_visited(&token).unwrap();

        let mut listener = coordinator.attach_listener(&token).unwrap();
        assert_eq!(listener.recv().await, PairingEvent::Visited);
    }

    #[tokio::test]
    async fn test_stream_heartbeat_then_terminal() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;
        let listener = coordinator.attach_listener(&token).unwrap();

        let mut events = Box::pin(listener.into_events(Duration::from_millis(20)));
        assert_eq!(events.next().await, Some(PairingEvent::KeepAlive));

        coordinator.fail(&token, "Authorization failed").unwrap();
        let mut rest = Vec::new();
        while let Some(event) = events.next().await {
            rest.push(event);
        }
        assert_eq!(
            rest.last(),
            Some(&PairingEvent::Failed {
                error: "Authorization failed".to_string()
            })
        );
        assert!(rest[..rest.len() - 1].iter().all(|e| *e == PairingEvent::KeepAlive));
    }

    #[tokio::test]
    async fn test_reaper_expires_idle_tokens() {
        let coordinator = PairingCoordinator::new(Duration::from_millis(10));
        let token = coordinator.create_token("spotify", "http://x").token;
        let mut listener = coordinator.attach_listener(&token).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(coordinator.reap_expired(), 1);
        assert!(coordinator.state(&token).is_none());
        assert_eq!(listener.recv().await, PairingEvent::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_expires_listener() {
        let coordinator = PairingCoordinator::new(Duration::from_secs(60));
        let token = coordinator.create_token("spotify", "http://x").token;
        let mut listener = coordinator.attach_listener(&token).unwrap();
        let started = Instant::now();

        let reaper = coordinator.spawn_reaper(Duration::from_secs(6));
        assert_eq!(listener.recv().await, PairingEvent::Expired);
        reaper.abort();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_claim_refuses_second_callback() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;
        let mut listener = coordinator.attach_listener(&token).unwrap();

        let claim = coordinator.begin_completion(&token).unwrap();
        assert_eq!(coordinator.state(&token), Some(PairingState::Exchanging));
        assert!(matches!(coordinator.begin_completion(&token), Err(Error::Conflict(_))));
        assert!(!coordinator.mark_visited(&token).unwrap().first);

        claim.complete(credentials()).unwrap();
        assert!(coordinator.is_empty());
        assert_eq!(listener.recv().await, PairingEvent::Authorized(credentials()));
        assert!(matches!(coordinator.begin_completion(&token), Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_dropped_claim_fails_token() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;
        let mut listener = coordinator.attach_listener(&token).unwrap();

        drop(coordinator.begin_completion(&token).unwrap());

        assert!(coordinator.is_empty());
        assert_eq!(
            listener.recv().await,
            PairingEvent::Failed {
                error: AUTHORIZATION_FAILED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_claim_settles_after_reap() {
        let coordinator = PairingCoordinator::new(Duration::ZERO);
        let token = coordinator.create_token("spotify", "http://x").token;

        let claim = coordinator.begin_completion(&token).unwrap();
        assert_eq!(coordinator.reap_expired(), 1);
        assert!(matches!(claim.complete(credentials()), Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_concurrent_complete_single_winner() {
        let coordinator = PairingCoordinator::default();
        let token = coordinator.create_token("spotify", "http://x").token;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                coordinator.complete(&token, credentials()).is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
