//! Samplers for processes sitting on a public/private trust boundary.
//!
//! Such a process serves two audiences with independent sampling budgets: its
//! own operator (first party) and the external callers whose requests it
//! handles (third party). [`BoundarySampler`] merges the two decisions so
//! neither budget can suppress visibility for the other, and
//! [`ThirdPartyParentSampler`] carries an externally made decision across the
//! process, from the inbound public edge to any outbound calls made on the
//! external caller's behalf.

use crate::trace::sampler::{
    SamplingDecision, SamplingParameters, SamplingResult, ShouldSample,
};
use crate::trace::{SpanKind, TraceResult, TraceState};
use crate::{Context, ContextGuard, Key, KeyValue};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Attribute marking spans visible to the third-party audience only, so a
/// downstream agent can route them away from first-party storage.
pub const THIRD_PARTY_ONLY_ATTRIBUTE: Key = Key::from_static_str("sampling.third_party.only");

/// Attribute carrying the externally visible resource id on spans sampled
/// for the third-party audience.
pub const RESOURCE_ID_ATTRIBUTE: Key = Key::from_static_str("resource.id");

/// Trace-state key used to carry the external caller's sampling decision
/// through the process. The value `01` means "propagated and sampled".
const EXTERNAL_FLAG_KEY: &str = "tf@ext";
const EXTERNAL_FLAG_SET: &str = "01";

/// Combines a first-party and a third-party sampler for a process on a trust
/// boundary.
///
/// Both delegates are evaluated against the same parameters. The merged
/// decision is sampled-in if **either** delegate samples in, with both
/// results' attributes merged; when only the third-party delegate sampled,
/// the [`THIRD_PARTY_ONLY_ATTRIBUTE`] marker is added so downstream agents
/// can route the span to the third-party audience alone.
#[derive(Clone, Debug)]
pub struct BoundarySampler {
    first_party: Box<dyn ShouldSample>,
    third_party: Box<dyn ShouldSample>,
}

impl BoundarySampler {
    /// Create a sampler merging the two audiences' decisions.
    pub fn new(
        first_party: impl ShouldSample + 'static,
        third_party: impl ShouldSample + 'static,
    ) -> Self {
        BoundarySampler {
            first_party: Box::new(first_party),
            third_party: Box::new(third_party),
        }
    }

    fn evaluate(
        sampler: &dyn ShouldSample,
        params: &SamplingParameters<'_>,
        audience: &str,
    ) -> SamplingResult {
        sampler.should_sample(params).unwrap_or_else(|err| {
            tracing::warn!(
                audience,
                error = %err,
                "boundary delegate sampler failed, dropping for this audience"
            );
            SamplingResult::new(SamplingDecision::Drop)
        })
    }
}

impl ShouldSample for BoundarySampler {
    fn should_sample(&self, params: &SamplingParameters<'_>) -> TraceResult<SamplingResult> {
        let first = Self::evaluate(self.first_party.as_ref(), params, "first-party");
        let third = Self::evaluate(self.third_party.as_ref(), params, "third-party");

        let first_recorded = first.decision.is_recording();
        let third_recorded = third.decision.is_recording();

        if !first_recorded && !third_recorded {
            // Attribute merging on sampled-out spans is skipped; nothing
            // downstream ever sees them.
            return Ok(SamplingResult::new(SamplingDecision::Drop));
        }

        let trace_state = first.trace_state.or(third.trace_state);
        let mut attributes = first.attributes;
        attributes.extend(third.attributes);
        if !first_recorded {
            attributes.push(KeyValue {
                key: THIRD_PARTY_ONLY_ATTRIBUTE,
                value: true.into(),
            });
        }

        Ok(SamplingResult {
            decision: SamplingDecision::RecordAndSample,
            attributes,
            trace_state,
        })
    }
}

/// The public edges a [`ThirdPartyParentSampler`] watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicBoundary(u8);

impl PublicBoundary {
    /// Inbound requests arrive from outside the trust boundary.
    pub const INBOUND: PublicBoundary = PublicBoundary(0x1);

    /// Outbound requests leave the trust boundary.
    pub const OUTBOUND: PublicBoundary = PublicBoundary(0x2);

    /// Both edges are public.
    pub const BOTH: PublicBoundary = PublicBoundary(0x3);

    /// Whether all edges in `other` are included in this set.
    pub fn contains(&self, other: PublicBoundary) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PublicBoundary {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        PublicBoundary(self.0 | rhs.0)
    }
}

type ResourceIdFn = dyn Fn() -> Option<String> + Send + Sync;
type AuthorizeFn = dyn Fn(&str) -> bool + Send + Sync;

/// Follows the external caller's sampling decision across a public boundary.
///
/// On an inbound server span at the public edge, a remote parent with the
/// sampled flag set is honored when the authorization policy allows the
/// current resource; the decision is then carried through the process via a
/// private trace-state flag so that outbound spans issued later in the same
/// logical call — identified by an active [`ExternalCallScope`] — continue
/// it across the outbound edge. The flag is removed before it leaves the
/// process on client and producer spans, but kept on purely internal spans
/// so nested outbound calls still see it.
#[derive(Clone)]
pub struct ThirdPartyParentSampler {
    resource_id: Arc<ResourceIdFn>,
    authorize: Arc<AuthorizeFn>,
    boundaries: PublicBoundary,
    propagate_context: bool,
}

impl fmt::Debug for ThirdPartyParentSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThirdPartyParentSampler")
            .field("boundaries", &self.boundaries)
            .field("propagate_context", &self.propagate_context)
            .finish()
    }
}

impl ThirdPartyParentSampler {
    /// Create a sampler for the given public edges.
    ///
    /// `resource_id` resolves the identity of the externally visible
    /// resource handling the current call (`None` disables third-party
    /// sampling for the call); `authorize` decides whether that resource may
    /// emit third-party telemetry.
    pub fn new(
        resource_id: impl Fn() -> Option<String> + Send + Sync + 'static,
        authorize: impl Fn(&str) -> bool + Send + Sync + 'static,
        boundaries: PublicBoundary,
    ) -> Self {
        ThirdPartyParentSampler {
            resource_id: Arc::new(resource_id),
            authorize: Arc::new(authorize),
            boundaries,
            propagate_context: true,
        }
    }

    /// Disable or enable stamping the in-process propagation flag. Disable
    /// only when the service never issues outbound calls.
    pub fn with_context_propagation(mut self, enabled: bool) -> Self {
        self.propagate_context = enabled;
        self
    }

    fn is_entry_span(kind: SpanKind) -> bool {
        matches!(kind, SpanKind::Server | SpanKind::Consumer)
    }

    fn is_exit_or_internal_span(kind: SpanKind) -> bool {
        matches!(
            kind,
            SpanKind::Client | SpanKind::Producer | SpanKind::Internal
        )
    }

    /// A missing or malformed flag reads as "not propagated", never as an
    /// error.
    fn flag_propagated(state: &TraceState) -> bool {
        state
            .get(EXTERNAL_FLAG_KEY)
            .map(|flag| flag.len() == 2 && flag.ends_with('1'))
            .unwrap_or(false)
    }
}

impl ShouldSample for ThirdPartyParentSampler {
    fn should_sample(&self, params: &SamplingParameters<'_>) -> TraceResult<SamplingResult> {
        let parent = params.parent_span_context();

        // Inbound public edge: follow the external client's decision, gated
        // by the authorization policy.
        if self.boundaries.contains(PublicBoundary::INBOUND)
            && Self::is_entry_span(params.span_kind)
        {
            if let Some(resource_id) = (self.resource_id)().filter(|id| !id.is_empty()) {
                let parent_sampled = parent
                    .map(|sc| sc.is_valid() && sc.is_sampled())
                    .unwrap_or(false);
                if parent_sampled && (self.authorize)(&resource_id) {
                    let trace_state = if self.propagate_context {
                        let state = parent
                            .map(|sc| sc.trace_state().clone())
                            .unwrap_or_default();
                        Some(state.insert(EXTERNAL_FLAG_KEY, EXTERNAL_FLAG_SET)?)
                    } else {
                        None
                    };
                    return Ok(SamplingResult {
                        decision: SamplingDecision::RecordAndSample,
                        attributes: vec![KeyValue {
                            key: RESOURCE_ID_ATTRIBUTE,
                            value: resource_id.into(),
                        }],
                        trace_state,
                    });
                }
            }
        }

        // Outbound public edge: continue the decision for calls made on the
        // external caller's behalf.
        if self.boundaries.contains(PublicBoundary::OUTBOUND)
            && Self::is_exit_or_internal_span(params.span_kind)
            && params
                .parent_context
                .map(ExternalCallScope::is_marked)
                .unwrap_or(false)
        {
            if let Some(state) = parent.map(|sc| sc.trace_state()) {
                if Self::flag_propagated(state) {
                    // Strip the flag before it leaves the process; internal
                    // spans keep it so nested outbound calls still see it.
                    let trace_state = if params.span_kind != SpanKind::Internal {
                        Some(state.delete(EXTERNAL_FLAG_KEY)?)
                    } else {
                        None
                    };
                    let resource_id = (self.resource_id)().unwrap_or_default();
                    return Ok(SamplingResult {
                        decision: SamplingDecision::RecordAndSample,
                        attributes: vec![KeyValue {
                            key: RESOURCE_ID_ATTRIBUTE,
                            value: resource_id.into(),
                        }],
                        trace_state,
                    });
                }
            }
        }

        Ok(SamplingResult::new(SamplingDecision::Drop))
    }
}

/// Marks the current logical call as running on behalf of an external
/// caller.
///
/// Instrumentation at the inbound public edge opens the scope before issuing
/// work that may leave the process; [`ThirdPartyParentSampler`] checks it on
/// outbound spans. The marker travels with the [`Context`], so it follows
/// the logical call rather than the thread, and the returned guard restores
/// the previous state on every exit path.
///
/// # Examples
///
/// ```
/// use traceline::trace::ExternalCallScope;
///
/// assert!(!ExternalCallScope::is_active());
/// {
///     let _scope = ExternalCallScope::begin();
///     assert!(ExternalCallScope::is_active());
/// }
/// assert!(!ExternalCallScope::is_active());
/// ```
#[derive(Debug)]
pub struct ExternalCallScope {
    _private: (),
}

#[derive(Clone, Copy, Debug)]
struct ExternalCallMarker;

impl ExternalCallScope {
    /// Mark the current context until the returned guard is dropped.
    #[must_use = "dropping the guard ends the scope immediately"]
    pub fn begin() -> ContextGuard {
        Context::current_with_value(ExternalCallMarker).attach()
    }

    /// Whether the current ambient context is marked.
    pub fn is_active() -> bool {
        Context::map_current(Self::is_marked)
    }

    /// Whether the given context is marked.
    pub fn is_marked(cx: &Context) -> bool {
        cx.get::<ExternalCallMarker>().is_some()
    }
}
