use super::ServiceName;
use crate::envelope::{keys, Metadata};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::Context;
use rand::Rng;

/// Trace, span and service identifiers carried by a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lower-case hex characters
    pub trace_id: String,
    /// 16 lower-case hex characters
    pub span_id: String,
    /// Originating service, if known
    pub service: Option<String>,
}

impl TraceContext {
    /// Reads the identifiers of the active span.
    ///
    /// Without an active span a new root trace is started so that the message can still be
    /// followed from here on.
    pub fn current() -> Self {
        let cx = Context::current();
        let span = cx.span();
        let span_context = span.span_context();

        let (trace_id, span_id) = if span_context.is_valid() {
            (span_context.trace_id(), span_context.span_id())
        } else {
            let mut rng = rand::thread_rng();
            (
                TraceId::from_bytes(rng.gen::<[u8; 16]>()),
                SpanId::from_bytes(rng.gen::<[u8; 8]>()),
            )
        };

        Self {
            trace_id: format!("{:032x}", trace_id),
            span_id: format!("{:016x}", span_id),
            service: cx.get::<ServiceName>().map(|name| name.0.clone()),
        }
    }

    /// Writes the identifiers into the reserved metadata keys.
    /// Existing identifiers are left untouched, the service is only written if absent.
    pub fn inject(&self, metadata: &mut Metadata) {
        if !metadata.contains_key(keys::TRACE_ID) {
            metadata.insert(keys::TRACE_ID, self.trace_id.clone());
            metadata.insert(keys::SPAN_ID, self.span_id.clone());
        }

        if let Some(service) = &self.service {
            if !metadata.contains_key(keys::SOURCE_SERVICE) {
                metadata.insert(keys::SOURCE_SERVICE, service.clone());
            }
        }
    }

    /// Reads the identifiers from the reserved metadata keys, `None` if absent or malformed
    pub fn extract(metadata: &Metadata) -> Option<Self> {
        let trace_id = metadata.get(keys::TRACE_ID)?;
        let span_id = metadata.get(keys::SPAN_ID)?;

        let valid = |value: &str, length: usize| {
            value.len() == length && value.chars().all(|c| c.is_ascii_hexdigit())
        };

        if !valid(trace_id, 32) || !valid(span_id, 16) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_lowercase(),
            span_id: span_id.to_lowercase(),
            service: metadata.get(keys::SOURCE_SERVICE).map(str::to_owned),
        })
    }

    /// Builds an OpenTelemetry context whose remote parent is the publishing span
    pub fn into_context(self) -> Context {
        let trace_id = TraceId::from_hex(&self.trace_id).unwrap_or(TraceId::INVALID);
        let span_id = SpanId::from_hex(&self.span_id).unwrap_or(SpanId::INVALID);

        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );

        let cx = Context::current().with_remote_span_context(span_context);

        match self.service {
            Some(service) => cx.with_value(ServiceName(service)),
            None => cx,
        }
    }
}
