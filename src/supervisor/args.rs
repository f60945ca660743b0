//! Launch argument merging.
//!
//! Sources are concatenated lowest priority first:
//! 1. the app's default args from the registry
//! 2. args recovered from an instance discovered at startup
//! 3. args the service itself was started with
//! 4. args sent with the control command that triggered the launch
//!
//! This is a flat append. Repeated flags are kept as-is; a later source
//! only adds tokens, it never replaces earlier ones.

/// Concatenate argument sources in order, skipping missing ones.
pub fn merge_args<'a, I>(sources: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<&'a [String]>>,
{
    sources.into_iter().flatten().flatten().cloned().collect()
}
