//! Sampling decisions.
//!
//! A [`ShouldSample`] implementation is consulted once per span creation,
//! before the span exists, and decides whether the span is recorded and
//! whether it is exported. Samplers are synchronous and effectively pure:
//! they must not block, and a failing sampler degrades to [`Drop`] at the
//! call site rather than disturbing the instrumented request.
//!
//! [`Drop`]: SamplingDecision::Drop

use crate::trace::{Link, SpanContext, SpanKind, TraceId, TraceResult, TraceState};
use crate::{Context, KeyValue};
use rand::Rng;
use std::fmt;

mod boundary;

pub use boundary::{
    BoundarySampler, ExternalCallScope, PublicBoundary, ThirdPartyParentSampler,
    RESOURCE_ID_ATTRIBUTE, THIRD_PARTY_ONLY_ATTRIBUTE,
};

/// Trace-state key under which [`ScoreSampler`] stamps the per-trace score.
pub const SAMPLING_SCORE_KEY: &str = "sampling.score";

/// The complete, side-effect-free input to a sampling decision.
#[derive(Clone, Debug)]
pub struct SamplingParameters<'a> {
    /// The context the new span would be created in, carrying the parent
    /// span (if any) and ambient markers such as [`ExternalCallScope`].
    pub parent_context: Option<&'a Context>,
    /// The trace id the new span will belong to.
    pub trace_id: TraceId,
    /// The name of the span being created.
    pub name: &'a str,
    /// The kind of the span being created.
    pub span_kind: SpanKind,
    /// Links the span will carry at creation.
    pub links: &'a [Link],
}

impl SamplingParameters<'_> {
    /// The parent span context, if the parent context carries an active span.
    pub fn parent_span_context(&self) -> Option<&SpanContext> {
        self.parent_context.and_then(|cx| cx.span_context())
    }
}

/// A decision on what to do with a span about to be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingDecision {
    /// The span is neither recorded nor exported.
    Drop,
    /// The span records attributes and events but is not exported.
    RecordOnly,
    /// The span is recorded and exported.
    RecordAndSample,
}

impl SamplingDecision {
    /// Whether the span records information under this decision.
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            SamplingDecision::RecordOnly | SamplingDecision::RecordAndSample
        )
    }
}

/// The outcome of a sampling decision.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingResult {
    /// Whether the new span is dropped, recorded, or recorded and sampled.
    pub decision: SamplingDecision,
    /// Extra attributes the sampler wants on the new span.
    pub attributes: Vec<KeyValue>,
    /// An updated trace state for the new span, or `None` to keep the
    /// parent's state untouched.
    pub trace_state: Option<TraceState>,
}

impl SamplingResult {
    /// A result with the given decision and no attribute or state changes.
    pub fn new(decision: SamplingDecision) -> Self {
        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: None,
        }
    }

    /// Attach attributes to this result.
    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Attach an updated trace state to this result.
    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = Some(trace_state);
        self
    }
}

/// The interface for sampling strategies.
///
/// Implementations decide, from the [`SamplingParameters`] alone, whether a
/// span should be recorded and exported. An `Err` return is treated as
/// [`SamplingDecision::Drop`] by the caller; implementations should prefer
/// returning an explicit decision.
pub trait ShouldSample: CloneShouldSample + Send + Sync + fmt::Debug {
    /// Returns the sampling decision for a span about to be created.
    fn should_sample(&self, params: &SamplingParameters<'_>) -> TraceResult<SamplingResult>;
}

/// This trait should not be used directly; it exists so boxed samplers can
/// be cloned.
pub trait CloneShouldSample {
    #[doc(hidden)]
    fn box_clone(&self) -> Box<dyn ShouldSample>;
}

impl<T> CloneShouldSample for T
where
    T: ShouldSample + Clone + 'static,
{
    fn box_clone(&self) -> Box<dyn ShouldSample> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn ShouldSample> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Built-in sampling strategies.
///
/// For score-based sampling see [`ScoreSampler`]; for trust-boundary
/// composition see [`BoundarySampler`] and [`ThirdPartyParentSampler`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Sampler {
    /// Always sample the trace.
    AlwaysOn,
    /// Never sample the trace.
    AlwaysOff,
    /// Respect the parent span's sampling decision (or that of any sampled
    /// link), delegating to the wrapped sampler for root spans and spans
    /// whose parent context is invalid.
    ParentBased(Box<dyn ShouldSample>),
}

impl ShouldSample for Sampler {
    fn should_sample(&self, params: &SamplingParameters<'_>) -> TraceResult<SamplingResult> {
        let decision = match self {
            Sampler::AlwaysOn => SamplingDecision::RecordAndSample,
            Sampler::AlwaysOff => SamplingDecision::Drop,
            Sampler::ParentBased(root) => {
                match params.parent_span_context().filter(|sc| sc.is_valid()) {
                    Some(parent) => {
                        let link_sampled = params
                            .links
                            .iter()
                            .any(|link| link.span_context.is_sampled());
                        if parent.is_sampled() || link_sampled {
                            SamplingDecision::RecordAndSample
                        } else {
                            SamplingDecision::Drop
                        }
                    }
                    // An invalid parent is indistinguishable from no parent.
                    None => return root.should_sample(params),
                }
            }
        };
        Ok(SamplingResult::new(decision))
    }
}

/// How [`ScoreSampler`] derives a score when the trace state carries none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScoreGenerator {
    /// Deterministic function of the low 8 bytes of the trace id, so every
    /// participant derives the same score for a trace without coordination.
    #[default]
    TraceIdRatio,
    /// A uniform random draw per decision.
    Random,
}

impl ScoreGenerator {
    fn score(&self, trace_id: TraceId) -> f64 {
        match self {
            ScoreGenerator::TraceIdRatio => {
                let bytes = trace_id.to_bytes();
                let mut low = [0u8; 8];
                low.copy_from_slice(&bytes[8..]);
                (u64::from_be_bytes(low) >> 1) as f64 / (1u64 << 63) as f64
            }
            ScoreGenerator::Random => rand::thread_rng().gen_range(0.0..1.0),
        }
    }
}

/// Samples a fraction of traces, coordinating the decision across processes
/// through the trace state.
///
/// The first participant in a trace derives a score in `[0, 1)` and stamps
/// it under [`SAMPLING_SCORE_KEY`] at the front of the trace state;
/// downstream participants read the stamped score back so all spans of one
/// trace agree. The span is sampled iff `score <= probability`.
#[derive(Clone, Debug)]
pub struct ScoreSampler {
    probability: f64,
    generator: ScoreGenerator,
}

impl ScoreSampler {
    /// Create a sampler keeping the given fraction of traces, scored with
    /// the deterministic trace-id generator.
    pub fn new(probability: f64) -> Self {
        ScoreSampler {
            probability,
            generator: ScoreGenerator::default(),
        }
    }

    /// Use a different score generator for traces with no stamped score.
    pub fn with_generator(mut self, generator: ScoreGenerator) -> Self {
        self.generator = generator;
        self
    }
}

impl ShouldSample for ScoreSampler {
    fn should_sample(&self, params: &SamplingParameters<'_>) -> TraceResult<SamplingResult> {
        let parent_state = params
            .parent_span_context()
            .map(|sc| sc.trace_state().clone())
            .unwrap_or_default();

        // Reuse the stamped score when the parent already carries one, so the
        // whole trace agrees; otherwise derive one and stamp it for the
        // processes downstream.
        let (score, updated_state) = match parent_state
            .get(SAMPLING_SCORE_KEY)
            .and_then(|value| value.parse::<f64>().ok())
        {
            Some(score) => (score, None),
            None => {
                let score = self.generator.score(params.trace_id);
                let stamped = parent_state.insert(SAMPLING_SCORE_KEY, score.to_string())?;
                (score, Some(stamped))
            }
        };

        let sampled = score <= self.probability;
        Ok(SamplingResult {
            decision: if sampled {
                SamplingDecision::RecordAndSample
            } else {
                SamplingDecision::Drop
            },
            attributes: if sampled {
                vec![KeyValue::new(SAMPLING_SCORE_KEY, score)]
            } else {
                Vec::new()
            },
            trace_state: updated_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanId, TraceContextExt, TraceFlags};

    fn parent_cx(flags: TraceFlags, state: TraceState) -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from(1u128),
            SpanId::from(1u64),
            flags,
            true,
            state,
        ))
    }

    fn params<'a>(parent: Option<&'a Context>, trace_id: u128, links: &'a [Link]) -> SamplingParameters<'a> {
        SamplingParameters {
            parent_context: parent,
            trace_id: TraceId::from(trace_id),
            name: "test",
            span_kind: SpanKind::Internal,
            links,
        }
    }

    #[test]
    fn always_on_and_off() {
        let on = Sampler::AlwaysOn
            .should_sample(&params(None, 1, &[]))
            .unwrap();
        assert_eq!(on.decision, SamplingDecision::RecordAndSample);

        let off = Sampler::AlwaysOff
            .should_sample(&params(None, 1, &[]))
            .unwrap();
        assert_eq!(off.decision, SamplingDecision::Drop);
    }

    #[test]
    fn parent_based_follows_sampled_parent() {
        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOff));
        let cx = parent_cx(TraceFlags::SAMPLED, TraceState::default());
        let result = sampler.should_sample(&params(Some(&cx), 1, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }

    #[test]
    fn parent_based_drops_for_unsampled_parent() {
        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOn));
        let cx = parent_cx(TraceFlags::default(), TraceState::default());
        let result = sampler.should_sample(&params(Some(&cx), 1, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::Drop);
    }

    #[test]
    fn parent_based_delegates_for_roots() {
        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOn));
        let result = sampler.should_sample(&params(None, 1, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);

        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOff));
        let result = sampler.should_sample(&params(None, 1, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::Drop);
    }

    #[test]
    fn parent_based_delegates_for_invalid_parent() {
        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOn));
        let cx = Context::new().with_remote_span_context(SpanContext::empty_context());
        let result = sampler.should_sample(&params(Some(&cx), 1, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }

    #[test]
    fn parent_based_honors_sampled_links() {
        let sampler = Sampler::ParentBased(Box::new(Sampler::AlwaysOff));
        let cx = parent_cx(TraceFlags::default(), TraceState::default());
        let links = vec![Link::new(
            SpanContext::new(
                TraceId::from(7u128),
                SpanId::from(7u64),
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            ),
            Vec::new(),
        )];
        let result = sampler
            .should_sample(&params(Some(&cx), 1, &links))
            .unwrap();
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }

    #[test]
    fn score_sampler_is_deterministic_per_trace_id() {
        let sampler = ScoreSampler::new(0.5);
        let first = sampler.should_sample(&params(None, 99, &[])).unwrap();
        let second = sampler.should_sample(&params(None, 99, &[])).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn score_sampler_stamps_score_into_trace_state() {
        let sampler = ScoreSampler::new(1.0);
        let result = sampler.should_sample(&params(None, 99, &[])).unwrap();
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);

        let state = result.trace_state.expect("score must be stamped");
        let stamped: f64 = state.get(SAMPLING_SCORE_KEY).unwrap().parse().unwrap();
        assert!((0.0..1.0).contains(&stamped));
        // The stamped entry leads the state.
        assert!(state.header().starts_with(SAMPLING_SCORE_KEY));
    }

    #[test]
    fn score_sampler_reuses_stamped_score() {
        let state = TraceState::default()
            .insert(SAMPLING_SCORE_KEY, "0.25")
            .unwrap();
        let cx = parent_cx(TraceFlags::SAMPLED, state);

        let keeps = ScoreSampler::new(0.3)
            .should_sample(&params(Some(&cx), 4242, &[]))
            .unwrap();
        assert_eq!(keeps.decision, SamplingDecision::RecordAndSample);
        // State already carries the score, nothing to rewrite.
        assert_eq!(keeps.trace_state, None);

        let drops = ScoreSampler::new(0.2)
            .should_sample(&params(Some(&cx), 4242, &[]))
            .unwrap();
        assert_eq!(drops.decision, SamplingDecision::Drop);
    }

    #[test]
    fn score_sampler_probability_bounds() {
        let all = ScoreSampler::new(1.0);
        for trace_id in [2u128, 3, 5, 7, 1 << 70, u128::MAX] {
            let result = all.should_sample(&params(None, trace_id, &[])).unwrap();
            assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        }

        // Ids whose low 8 bytes are non-zero derive a score strictly above 0.
        let none = ScoreSampler::new(0.0);
        for trace_id in [2u128, 3, 5, 7, u128::MAX] {
            let result = none.should_sample(&params(None, trace_id, &[])).unwrap();
            assert_eq!(result.decision, SamplingDecision::Drop);
        }
    }

    #[test]
    fn score_sampler_attaches_score_attribute_when_sampled() {
        let sampler = ScoreSampler::new(1.0);
        let result = sampler.should_sample(&params(None, 99, &[])).unwrap();
        assert!(result
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == SAMPLING_SCORE_KEY));
    }

    #[test]
    fn cloned_boxed_sampler_behaves_identically() {
        let sampler: Box<dyn ShouldSample> =
            Box::new(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)));
        #[allow(clippy::redundant_clone)]
        let cloned = sampler.clone();

        let cx = parent_cx(TraceFlags::SAMPLED, TraceState::default());
        let a = sampler.should_sample(&params(Some(&cx), 1, &[])).unwrap();
        let b = cloned.should_sample(&params(Some(&cx), 1, &[])).unwrap();
        assert_eq!(a, b);
    }
}
