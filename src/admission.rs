//! Ingestion edge: throttle, validate, stamp, and hand the event to the publisher.

use crate::error::{PipelineError, Result};
use crate::event::{EventEnvelope, GameSession, ScoreSubmission};
use crate::metrics::AdmissionMetrics;
use crate::publisher::AsyncPublisher;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub session: GameSession,
    /// `false` when the publish queue shed the event. The submission is still
    /// reported as accepted.
    pub queued: bool,
}

#[derive(Clone)]
pub struct Admission {
    limiter: Arc<RateLimiter>,
    publisher: AsyncPublisher,
}

impl Admission {
    pub fn new(limiter: Arc<RateLimiter>, publisher: AsyncPublisher) -> Self {
        Self { limiter, publisher }
    }

    pub fn publisher(&self) -> &AsyncPublisher {
        &self.publisher
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admit one score for an authenticated principal. Throttling is checked
    /// before the payload is looked at.
    pub fn submit(&self, principal_id: u64, submission: ScoreSubmission) -> Result<Admitted> {
        self.throttle(principal_id)?;
        self.admit(principal_id, submission)
    }

    /// Spend one of the principal's tokens. Counts the request.
    pub fn throttle(&self, principal_id: u64) -> Result<()> {
        AdmissionMetrics::record_request();
        if !self.limiter.allow(principal_id) {
            AdmissionMetrics::record_throttled();
            warn!(principal_id, "rate limit exceeded");
            return Err(PipelineError::Throttled { principal_id });
        }
        Ok(())
    }

    /// Validate and publish a submission whose principal already passed
    /// [`Admission::throttle`].
    pub fn admit(&self, principal_id: u64, submission: ScoreSubmission) -> Result<Admitted> {
        let session = match GameSession::admit(principal_id.to_string(), submission) {
            Ok(session) => session,
            Err(e) => {
                AdmissionMetrics::record_rejected();
                debug!(principal_id, error = %e, "rejected submission");
                return Err(e);
            }
        };
        AdmissionMetrics::record_admitted(&session.game_mode);

        let envelope = EventEnvelope::score_recorded(session);
        let queued = self.publisher.enqueue(&envelope);
        info!(
            session_id = %envelope.session.session_id,
            user_id = %envelope.session.user_id,
            score = envelope.session.score,
            game_mode = %envelope.session.game_mode,
            queued,
            "game session recorded"
        );
        Ok(Admitted {
            session: envelope.session,
            queued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::Limits;

    fn admission(burst: u32, capacity: usize) -> (Admission, crate::publisher::PublishQueue) {
        let limiter = Arc::new(RateLimiter::new(Limits {
            tokens_per_minute: 30.0,
            burst,
        }));
        let (publisher, queue) = AsyncPublisher::new(capacity);
        (Admission::new(limiter, publisher), queue)
    }

    #[test]
    fn throttle_is_checked_before_validation() {
        let (admission, _queue) = admission(1, 10);
        assert!(admission.submit(7, ScoreSubmission::new(10, "classic")).is_ok());
        let err = admission
            .submit(7, ScoreSubmission::new(9_999, "bad mode!"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Throttled { principal_id: 7 }));
    }

    #[test]
    fn invalid_submission_consumes_a_token() {
        let (admission, _queue) = admission(1, 10);
        let err = admission.submit(3, ScoreSubmission::new(501, "classic")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(matches!(
            admission.submit(3, ScoreSubmission::new(1, "classic")),
            Err(PipelineError::Throttled { .. })
        ));
    }

    #[test]
    fn shed_event_is_still_admitted() {
        let (admission, _queue) = admission(5, 1);
        let first = admission.submit(1, ScoreSubmission::new(1, "classic")).unwrap();
        let second = admission.submit(1, ScoreSubmission::new(2, "classic")).unwrap();
        assert!(first.queued);
        assert!(!second.queued);
        assert_eq!(second.session.user_id, "1");
        assert_eq!(admission.publisher().stats().dropped, 1);
    }
}
