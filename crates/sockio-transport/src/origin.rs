//! Pluggable origin check.

/// Decides which origin a response is issued for.
pub trait OriginCheck: Send + Sync {
    /// Returns the accepted origin, or `None` to reject the request.
    fn check_origin(&self, host: Option<&str>, origin: Option<&str>) -> Option<String>;
}

/// Default check: echoes `Origin`, falling back to `Host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoOrigin;

impl OriginCheck for EchoOrigin {
    fn check_origin(&self, host: Option<&str>, origin: Option<&str>) -> Option<String> {
        origin.or(host).map(str::to_string)
    }
}

impl<F> OriginCheck for F
where
    F: Fn(Option<&str>, Option<&str>) -> Option<String> + Send + Sync,
{
    fn check_origin(&self, host: Option<&str>, origin: Option<&str>) -> Option<String> {
        self(host, origin)
    }
}
