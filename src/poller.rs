//! Waiting for resources to reach a terminal state.
//!
//! Consents, quick payments and payments change state on the server as the customer works through their bank's
//! authorisation flow. The [`StatusPoller`] turns that into a bounded wait: it fetches the resource once per tick,
//! classifies it, and either returns it, fails with a typed rejection, or gives up once the wait budget is spent.
//! When giving up on a revocable resource it revokes it so the customer can't authorise something nobody is waiting
//! for anymore.
//!
//! Retries of a failed fetch happen inside a tick and, in [`DeadlineMode::Soft`], their backoff isn't charged to the
//! wait budget. Use [`DeadlineMode::Hard`] when the budget must bound the total wall time.

use futures::future::BoxFuture;
use std::{
    fmt::{self, Display},
    future::Future,
    time::Duration,
};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ConsentStatus, PaymentStatus, QuickPayment},
    retry::RetryPolicy,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
// Stand-in deadline for budgets too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The kinds of resources that can be waited on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Consent,
    QuickPayment,
    Payment,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consent => write!(f, "consent"),
            Self::QuickPayment => write!(f, "quick payment"),
            Self::Payment => write!(f, "payment"),
        }
    }
}

/// How statuses are interpreted while waiting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AwaitStrategy {
    /// Only the single success status ends the wait, everything else (rejections included) keeps polling until the
    /// wait times out.
    Legacy,

    /// Usable terminal statuses end the wait, rejections fail it immediately.
    #[default]
    Strict,
}

/// Whether retry backoff counts against the wait budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeadlineMode {
    /// Only poll ticks are counted. Retries inside a tick can stretch the wait past its budget.
    #[default]
    Soft,

    /// Fetches and sleeps are cut short at the deadline, so the wait never exceeds its budget plus the revoke call.
    /// A budget shorter than one poll interval still gets a single poll of up to one interval.
    Hard,
}

/// What a fetched resource means for the wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The resource reached a usable terminal state.
    Success,

    /// The resource is still moving, with its current status.
    Pending(String),

    /// The resource reached a failed terminal state, with the reason.
    Rejected(String),
}

impl Classification {
    /// Turn this classification into an outcome, pending included.
    pub fn settle(self, kind: ResourceKind, id: Uuid) -> Result<(), ApiError> {
        match self {
            Self::Success => Ok(()),
            Self::Pending(status) => Err(ApiError::StillPending { kind, id, status }),
            Self::Rejected(reason) => Err(ApiError::ConsentRejectedOrRevoked { kind, id, reason }),
        }
    }
}

/// Classify a consent status.
pub fn classify_consent(strategy: AwaitStrategy, status: ConsentStatus) -> Classification {
    use ConsentStatus::*;
    match (strategy, status) {
        (_, Authorised) => Classification::Success,
        (AwaitStrategy::Legacy, _) => Classification::Pending(status.to_string()),
        (AwaitStrategy::Strict, Consumed) => Classification::Success,
        (AwaitStrategy::Strict, Rejected | Revoked | GatewayTimeout) => Classification::Rejected(status.to_string()),
        (AwaitStrategy::Strict, AwaitingAuthorisation | GatewayAwaitingSubmission | Unknown) => {
            Classification::Pending(status.to_string())
        }
    }
}

/// Classify a quick payment by the status of its consent.
pub fn classify_quick_payment(strategy: AwaitStrategy, quick_payment: &QuickPayment) -> Classification {
    classify_consent(strategy, quick_payment.consent.status)
}

/// Classify a payment status.
pub fn classify_payment(strategy: AwaitStrategy, status: PaymentStatus) -> Classification {
    use PaymentStatus::*;
    match (strategy, status) {
        (_, AcceptedSettlementCompleted) => Classification::Success,
        (AwaitStrategy::Legacy, _) => Classification::Pending(status.to_string()),
        (AwaitStrategy::Strict, Rejected) => Classification::Rejected(status.to_string()),
        (AwaitStrategy::Strict, Pending | AcceptedSettlementInProcess | Unknown) => {
            Classification::Pending(status.to_string())
        }
    }
}

/// A single wait on a resource.
#[derive(Clone, Debug)]
pub struct PollSession {
    /// The resource being waited on.
    pub id: Uuid,

    /// The kind of resource being waited on.
    pub kind: ResourceKind,

    /// How long the caller is willing to wait.
    pub max_wait: Duration,

    /// When the wait runs out.
    pub deadline: Instant,

    /// The time between two polls.
    pub poll_interval: Duration,

    /// The number of ticks the wait may sleep for.
    pub max_ticks: u64,

    /// The number of polls made so far.
    pub attempts_made: u32,
}

impl PollSession {
    pub fn new(id: Uuid, kind: ResourceKind, max_wait: Duration, poll_interval: Duration) -> Self {
        let max_ticks = if poll_interval.is_zero() {
            0
        } else {
            let ticks = (max_wait.as_secs_f64() / poll_interval.as_secs_f64()).ceil();
            if ticks >= u64::MAX as f64 {
                u64::MAX
            } else {
                ticks as u64
            }
        };
        Self {
            id,
            kind,
            max_wait,
            deadline: after(max_wait),
            poll_interval,
            max_ticks,
            attempts_made: 0,
        }
    }

    /// Whether another tick may be spent after the polls made so far.
    pub fn has_ticks_left(&self) -> bool {
        u64::from(self.attempts_made) <= self.max_ticks
    }

    /// Whether the deadline has passed.
    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// The instant `duration` from now, or a far future instant when that can't be represented.
fn after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Revokes a resource the caller gave up waiting on.
pub type RevokeFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), ApiError>> + Send + 'a>;

/// Polls resources until they reach a terminal state.
#[derive(Clone, Debug)]
pub struct StatusPoller {
    retry: RetryPolicy,
    poll_interval: Duration,
    deadline_mode: DeadlineMode,
}

impl StatusPoller {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry, poll_interval: DEFAULT_POLL_INTERVAL, deadline_mode: DeadlineMode::default() }
    }

    /// Set the time between two polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set whether retry backoff counts against the wait budget.
    pub fn with_deadline_mode(mut self, deadline_mode: DeadlineMode) -> Self {
        self.deadline_mode = deadline_mode;
        self
    }

    /// Start a wait on a resource.
    pub fn session(&self, id: Uuid, kind: ResourceKind, max_wait: Duration) -> PollSession {
        PollSession::new(id, kind, max_wait, self.poll_interval)
    }

    /// Wait until a resource reaches a terminal state.
    ///
    /// Each tick fetches the resource through the retry policy and classifies it: success returns the resource,
    /// a rejection fails with [`ApiError::ConsentRejectedOrRevoked`] and anything else waits for the next tick. Once
    /// the ticks run out the resource is revoked, if `revoke` is given, and the wait fails with
    /// [`ApiError::ConsentOrPaymentTimedOut`] carrying the revoke failure if there was one. Errors that aren't worth
    /// retrying abort the wait as is.
    ///
    /// Cancelling `cancel` ends the wait with [`ApiError::Cancelled`] at the next tick boundary.
    ///
    /// In [`DeadlineMode::Hard`] the wait also gives up as soon as the session deadline passes, whatever the number
    /// of ticks left.
    pub async fn await_terminal<R, F, Fut, C>(
        &self,
        mut session: PollSession,
        mut fetch: F,
        classify: C,
        revoke: Option<RevokeFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<R, ApiError>
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = Result<R, ApiError>>,
        C: Fn(&R) -> Classification,
    {
        let (kind, id) = (session.kind, session.id);
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!("Stopped waiting for {kind} {id}: cancelled");
                return Err(ApiError::Cancelled { kind, id });
            }

            if self.deadline_mode == DeadlineMode::Hard && session.attempts_made > 0 && session.is_past_deadline() {
                debug!("{kind} {id} reached its deadline after {} polls", session.attempts_made);
                break;
            }

            session.attempts_made = session.attempts_made.saturating_add(1);
            debug!("Polling {kind} {id}, attempt {}", session.attempts_made);
            let Some(resource) = self.fetch(&session, &mut fetch).await? else {
                break;
            };

            match classify(&resource).settle(kind, id) {
                Ok(()) => {
                    info!("{kind} {id} completed after {} polls", session.attempts_made);
                    return Ok(resource);
                }
                Err(ApiError::StillPending { status, .. }) => {
                    if !session.has_ticks_left() {
                        debug!("{kind} {id} still {status} with no time left");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Stopped waiting for {kind} {id}: {e}");
                    return Err(e);
                }
            }

            let wake_at = self.next_tick(&session);
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Stopped waiting for {kind} {id}: cancelled");
                            return Err(ApiError::Cancelled { kind, id });
                        }
                        _ = sleep_until(wake_at) => {}
                    }
                }
                None => sleep_until(wake_at).await,
            }
        }
        Err(self.give_up(&session, revoke).await)
    }

    /// Fetch the resource once, returning `None` when a hard deadline cut the fetch short.
    async fn fetch<R, F, Fut>(&self, session: &PollSession, fetch: &mut F) -> Result<Option<R>, ApiError>
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = Result<R, ApiError>>,
    {
        let id = session.id;
        let attempt = self.retry.execute(|| fetch(id));
        match self.deadline_mode {
            DeadlineMode::Soft => attempt.await.map(Some),
            DeadlineMode::Hard => {
                // The first poll gets at least one interval, so a zero budget still polls once.
                let deadline = if session.attempts_made <= 1 {
                    session.deadline.max(after(session.poll_interval))
                } else {
                    session.deadline
                };
                match timeout_at(deadline, attempt).await {
                    Ok(result) => result.map(Some),
                    Err(_) => {
                        warn!("Fetching {} {} ran past the deadline", session.kind, id);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// When the next poll is due. Hard deadlines cut the last sleep short.
    fn next_tick(&self, session: &PollSession) -> Instant {
        let next = after(session.poll_interval);
        match self.deadline_mode {
            DeadlineMode::Soft => next,
            DeadlineMode::Hard => next.min(session.deadline),
        }
    }

    async fn give_up(&self, session: &PollSession, revoke: Option<RevokeFn<'_>>) -> ApiError {
        let (kind, id) = (session.kind, session.id);
        warn!("{kind} {id} did not complete within {:?} ({} polls)", session.max_wait, session.attempts_made);
        let revoke_failure = match revoke {
            Some(revoke) => match revoke().await {
                Ok(()) => {
                    info!("Revoked {kind} {id} after giving up on it");
                    None
                }
                Err(e) => {
                    error!("Failed to revoke {kind} {id} after giving up on it: {e}");
                    Some(Box::new(e))
                }
            },
            None => None,
        };
        ApiError::ConsentOrPaymentTimedOut { kind, id, waited: session.max_wait, revoke_failure }
    }
}
