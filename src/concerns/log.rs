//! Access logging.
//!
//! One `info` event per request, emitted after the rest of the chain has
//! answered. A failed envelope additionally gets an `error` event carrying
//! the failure message and its source chain.

use tracing::{error, info};

use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::Middleware;

/// The access-log middleware. Install it first so it sees every response.
#[derive(Clone, Copy, Debug, Default)]
pub struct Log;

impl Log {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for Log {
    fn name(&self) -> &str {
        "log"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        from_outcome_fn(move |cx| {
            let next = next.clone();
            async move {
                let envelope = next.call(cx.clone()).await?;
                let status = envelope.status_code().as_u16();

                if let Some(failure) = envelope.failure() {
                    error!(
                        id = %cx.id(),
                        status,
                        stack = ?failure.stack(),
                        "{}",
                        failure.message()
                    );
                }

                info!(
                    id = %cx.id(),
                    ip = %cx.remote(),
                    host = %cx.host(),
                    method = %cx.method(),
                    url = %cx.url(),
                    elapsed_ms = cx.elapsed().as_millis() as u64,
                    status,
                    user_agent = cx.header("user-agent").unwrap_or_default(),
                    referer = cx.header("referer").unwrap_or_default(),
                    "{status} {} {}",
                    cx.method(),
                    cx.path()
                );
                Ok::<_, Failure>(envelope)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::envelope::Envelope;
    use crate::invariant::{Invariants, Shutdown};
    use crate::testing::context;

    #[tokio::test]
    async fn responses_pass_through_untouched() {
        let terminal = from_outcome_fn(|_cx| async {
            Ok::<_, Failure>(Envelope::text("ok").with_status(StatusCode::ACCEPTED))
        });
        let envelope = Log.wrap(terminal).call(context("GET", "/bloo")).await.unwrap();
        assert_eq!(envelope.status_code(), StatusCode::ACCEPTED);
        assert_eq!(envelope.payload().as_text(), Some("ok"));
    }

    #[tokio::test]
    async fn failed_envelopes_are_logged_and_returned() {
        let terminal = from_outcome_fn(|_cx| async { Err::<Envelope, _>(Failure::new("foo")) });
        let enforced = Invariants::new(Shutdown::new()).wrap(terminal);
        let envelope = Log.wrap(enforced).call(context("GET", "/bloo")).await.unwrap();
        assert!(envelope.is_failed());
        assert_eq!(envelope.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
