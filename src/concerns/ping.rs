//! `GET /monitor/ping` liveness answer.

use std::sync::OnceLock;

use rand::seq::SliceRandom;

use crate::envelope::Envelope;
use crate::failure::Failure;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::middleware::Middleware;

pub const PING_PATH: &str = "/monitor/ping";

const NAMES: &[&str] = &[
    "Quiet Arithmetic",
    "Patient Lantern",
    "Borrowed Thunder",
    "Reasonable Doubt",
    "Second Breakfast",
    "Unhurried Comet",
    "Lateral Thinker",
    "Modest Proposal",
];

/// This process's name, picked once at random.
pub fn process_name() -> &'static str {
    static NAME: OnceLock<&'static str> = OnceLock::new();
    NAME.get_or_init(|| NAMES.choose(&mut rand::thread_rng()).copied().unwrap_or(NAMES[0]))
}

/// Answers the ping path with [`process_name`]; everything else passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ping;

impl Middleware for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        from_outcome_fn(move |cx| {
            let next = next.clone();
            async move {
                if cx.path() == PING_PATH {
                    return Ok::<_, Failure>(Envelope::text(process_name()));
                }
                next.call(cx).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;

    #[tokio::test]
    async fn ping_answers_with_a_stable_name() {
        let terminal = from_outcome_fn(|_cx| async { Ok::<_, Failure>(Envelope::text("inner")) });
        let handler = Ping.wrap(terminal);

        let first = handler.call(context("GET", PING_PATH)).await.unwrap();
        let second = handler.call(context("GET", PING_PATH)).await.unwrap();
        assert_eq!(first.payload().as_text(), second.payload().as_text());
        assert!(NAMES.contains(&first.payload().as_text().unwrap()));

        let other = handler.call(context("GET", "/elsewhere")).await.unwrap();
        assert_eq!(other.payload().as_text(), Some("inner"));
    }
}
