/// Default maximum number of attributes kept per span.
pub(crate) const DEFAULT_MAX_ATTRIBUTES_PER_SPAN: u32 = 128;
/// Default maximum number of events kept per span.
pub(crate) const DEFAULT_MAX_EVENTS_PER_SPAN: u32 = 128;
/// Default maximum number of links kept per span.
pub(crate) const DEFAULT_MAX_LINKS_PER_SPAN: u32 = 128;
/// Default maximum number of attributes kept per event.
pub(crate) const DEFAULT_MAX_ATTRIBUTES_PER_EVENT: u32 = 128;
/// Default maximum number of attributes kept per link.
pub(crate) const DEFAULT_MAX_ATTRIBUTES_PER_LINK: u32 = 128;

/// Caps on the mutable collections owned by a span.
///
/// When a collection reaches its cap, the oldest entry is evicted and
/// counted; span creation and mutation never fail because of limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpanLimits {
    /// The max number of events that can be added to a `Span`.
    pub max_events_per_span: u32,
    /// The max number of attributes that can be added to a `Span`.
    pub max_attributes_per_span: u32,
    /// The max number of links that can be added to a `Span`.
    pub max_links_per_span: u32,
    /// The max number of attributes that can be added to an `Event`.
    pub max_attributes_per_event: u32,
    /// The max number of attributes that can be added to a `Link`.
    pub max_attributes_per_link: u32,
}

impl Default for SpanLimits {
    fn default() -> Self {
        SpanLimits {
            max_events_per_span: DEFAULT_MAX_EVENTS_PER_SPAN,
            max_attributes_per_span: DEFAULT_MAX_ATTRIBUTES_PER_SPAN,
            max_links_per_span: DEFAULT_MAX_LINKS_PER_SPAN,
            max_attributes_per_event: DEFAULT_MAX_ATTRIBUTES_PER_EVENT,
            max_attributes_per_link: DEFAULT_MAX_ATTRIBUTES_PER_LINK,
        }
    }
}
