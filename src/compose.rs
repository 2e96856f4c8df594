//! The Middleware Compositor.
//!
//! One routine, [`compose`], serves global middleware, per-route middleware
//! and decorators. It splices spacer layers around every declared layer and
//! around the terminal, then folds the list right-to-left:
//!
//! ```text
//! declared:  [a, b]                      terminal: router
//! spliced:   [L(a), E, a, L(b), E, b, L(router), E]
//! folded:    L(a)(E(a(L(b)(E(b(L(router)(E(router))))))))
//! ```
//!
//! `E` is the Invariant Enforcer. `L` is latency instrumentation, present in
//! development only. Decorators get `E` alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, warn};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxedHandler, from_outcome_fn};
use crate::invariant::{Invariants, Shutdown};
use crate::middleware::{Middleware, MiddlewareFactory};

// ── Spacers ───────────────────────────────────────────────────────────────────

/// Warning and stall thresholds for development latency logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatencyThresholds {
    pub warn_at: Duration,
    pub error_at: Duration,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            warn_at: Duration::from_millis(500),
            error_at: Duration::from_millis(2000),
        }
    }
}

/// What gets spliced in front of each layer.
#[derive(Clone, Debug)]
pub(crate) struct Spacing {
    shutdown: Shutdown,
    latency: Option<LatencyThresholds>,
}

impl Spacing {
    /// Enforcer plus, when `latency` is set, instrumentation. Used for
    /// middleware.
    pub(crate) fn middleware(shutdown: Shutdown, latency: Option<LatencyThresholds>) -> Self {
        Self { shutdown, latency }
    }

    /// Enforcer only. Used for decorators.
    pub(crate) fn decorators(shutdown: Shutdown) -> Self {
        Self { shutdown, latency: None }
    }

    fn spacers(&self, name: &str) -> Vec<Arc<dyn Middleware>> {
        let mut spacers: Vec<Arc<dyn Middleware>> = Vec::with_capacity(2);
        if let Some(thresholds) = self.latency {
            spacers.push(Arc::new(Latency::new(name, thresholds)));
        }
        spacers.push(Arc::new(Invariants::new(self.shutdown.clone())));
        spacers
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

/// Builds factories in declaration order. The first failure aborts.
pub(crate) async fn build_layers(
    factories: Vec<Box<dyn MiddlewareFactory>>,
) -> Result<Vec<Arc<dyn Middleware>>, Error> {
    let mut layers = Vec::with_capacity(factories.len());
    for factory in factories {
        let name = factory.name();
        let layer = factory.build().await.map_err(|e| Error::startup(name, e))?;
        layers.push(layer);
    }
    Ok(layers)
}

/// Composes `layers` around `terminal`. `terminal_name` labels the spacer
/// placed directly around the terminal.
pub(crate) fn compose(
    layers: &[Arc<dyn Middleware>],
    terminal: BoxedHandler,
    terminal_name: &str,
    spacing: &Spacing,
) -> BoxedHandler {
    let mut spliced: Vec<Arc<dyn Middleware>> = Vec::with_capacity(layers.len() * 3 + 2);
    for layer in layers {
        spliced.extend(spacing.spacers(layer.name()));
        spliced.push(Arc::clone(layer));
    }
    spliced.extend(spacing.spacers(terminal_name));

    spliced.iter().rev().fold(terminal, |next, layer| layer.wrap(next))
}

// ── Latency instrumentation ───────────────────────────────────────────────────

/// Logs when the layer after it takes too long to answer.
///
/// Timers never cancel or alter the wrapped future. Entering a nested
/// `Latency` silences the outer ones, so a slow handler is reported once,
/// under the innermost layer that was reached.
struct Latency {
    name: String,
    thresholds: LatencyThresholds,
}

/// Per-request counter of latency layers entered.
#[derive(Clone, Default)]
struct LatencyEpoch(Arc<AtomicU64>);

impl Latency {
    fn new(name: &str, thresholds: LatencyThresholds) -> Self {
        Self { name: name.to_owned(), thresholds }
    }
}

fn epoch_of(cx: &Context) -> LatencyEpoch {
    if let Some(epoch) = cx.get::<LatencyEpoch>() {
        return epoch;
    }
    let epoch = LatencyEpoch::default();
    cx.insert(epoch.clone());
    epoch
}

impl Middleware for Latency {
    fn name(&self) -> &str {
        "latency"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let name: Arc<str> = Arc::from(self.name.as_str());
        let thresholds = self.thresholds;
        from_outcome_fn(move |cx| {
            let next = Arc::clone(&next);
            let name = Arc::clone(&name);
            async move {
                let epoch = epoch_of(&cx);
                let mine = epoch.0.fetch_add(1, Ordering::SeqCst) + 1;
                let current = || epoch.0.load(Ordering::SeqCst) == mine;
                let method = cx.method();
                let url = cx.url().to_string();

                let inner = next.call(cx);
                tokio::pin!(inner);
                let warn_timer = tokio::time::sleep(thresholds.warn_at);
                tokio::pin!(warn_timer);
                let stall_timer = tokio::time::sleep(thresholds.error_at);
                tokio::pin!(stall_timer);
                let (mut warned, mut stalled) = (false, false);

                loop {
                    tokio::select! {
                        biased;

                        outcome = &mut inner => return outcome,

                        () = &mut warn_timer, if !warned => {
                            warned = true;
                            if current() {
                                warn!(
                                    layer = %name,
                                    %method,
                                    %url,
                                    threshold_ms = thresholds.warn_at.as_millis() as u64,
                                    "slow response (tune with DEV_LATENCY_WARNING_MS)"
                                );
                            }
                        }

                        () = &mut stall_timer, if !stalled => {
                            stalled = true;
                            if current() {
                                error!(
                                    layer = %name,
                                    %method,
                                    %url,
                                    threshold_ms = thresholds.error_at.as_millis() as u64,
                                    "stalled response (tune with DEV_LATENCY_ERROR_MS)"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}
