//! Pipeline configuration shared by all tracers of a provider.

use crate::trace::{
    IdGenerator, RandomIdGenerator, Sampler, ShouldSample, SpanLimits,
};
use crate::Resource;
use std::borrow::Cow;
use std::env;
use std::str::FromStr;

const SPAN_ATTRIBUTE_COUNT_LIMIT: &str = "TRACELINE_SPAN_ATTRIBUTE_COUNT_LIMIT";
const SPAN_EVENT_COUNT_LIMIT: &str = "TRACELINE_SPAN_EVENT_COUNT_LIMIT";
const SPAN_LINK_COUNT_LIMIT: &str = "TRACELINE_SPAN_LINK_COUNT_LIMIT";

/// Tracer configuration.
///
/// Built once per [`crate::trace::TracerProvider`] and shared by all of its
/// tracers.
#[derive(Debug)]
#[non_exhaustive]
pub struct Config {
    /// The sampler consulted for every created span.
    pub sampler: Box<dyn ShouldSample>,

    /// The id generator for new trace and span ids.
    pub id_generator: Box<dyn IdGenerator>,

    /// Caps for span attribute/event/link collections.
    pub span_limits: SpanLimits,

    /// Labels describing the entity producing spans, stamped on every
    /// exported span.
    pub resource: Cow<'static, Resource>,
}

impl Default for Config {
    /// The default configuration: parent-based always-on sampling, random
    /// ids, default span limits overridable through the
    /// `TRACELINE_SPAN_*_COUNT_LIMIT` environment variables, and an empty
    /// resource.
    fn default() -> Self {
        let mut config = Config {
            sampler: Box::new(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
            id_generator: Box::<RandomIdGenerator>::default(),
            span_limits: SpanLimits::default(),
            resource: Cow::Owned(Resource::empty()),
        };

        if let Some(max_attributes_per_span) = env::var(SPAN_ATTRIBUTE_COUNT_LIMIT)
            .ok()
            .and_then(|count_limit| u32::from_str(&count_limit).ok())
        {
            config.span_limits.max_attributes_per_span = max_attributes_per_span;
        }

        if let Some(max_events_per_span) = env::var(SPAN_EVENT_COUNT_LIMIT)
            .ok()
            .and_then(|max_events| u32::from_str(&max_events).ok())
        {
            config.span_limits.max_events_per_span = max_events_per_span;
        }

        if let Some(max_links_per_span) = env::var(SPAN_LINK_COUNT_LIMIT)
            .ok()
            .and_then(|max_links| u32::from_str(&max_links).ok())
        {
            config.span_limits.max_links_per_span = max_links_per_span;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_limits_overridable_from_env() {
        let config = temp_env::with_vars(
            [
                (SPAN_ATTRIBUTE_COUNT_LIMIT, Some("12")),
                (SPAN_EVENT_COUNT_LIMIT, Some("34")),
                (SPAN_LINK_COUNT_LIMIT, Some("56")),
            ],
            Config::default,
        );

        assert_eq!(config.span_limits.max_attributes_per_span, 12);
        assert_eq!(config.span_limits.max_events_per_span, 34);
        assert_eq!(config.span_limits.max_links_per_span, 56);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = temp_env::with_vars(
            [(SPAN_ATTRIBUTE_COUNT_LIMIT, Some("not-a-number"))],
            Config::default,
        );
        assert_eq!(
            config.span_limits.max_attributes_per_span,
            SpanLimits::default().max_attributes_per_span
        );
    }
}
