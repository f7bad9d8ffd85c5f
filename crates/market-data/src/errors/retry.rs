/// Classification for retry policy.
///
/// Used by the request dispatcher to decide whether a failed dispatch goes
/// back into its lane or is surfaced to the caller.
///
/// | Class | Retried? | Effect on rate-limit window |
/// |-------|----------|-----------------------------|
/// | `Never` | No | None |
/// | `WithBackoff` | Yes, until the attempt ceiling | Saturated when the upstream rate limited us |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Never retry - malformed input, unknown token, or terminal failure.
    Never,

    /// Transient failure (timeout, 5xx, rate limit). Retry with exponential
    /// backoff up to the configured number of attempts.
    WithBackoff,
}
