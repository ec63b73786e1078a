/// Surfaces the end of a sync attempt to the user.
///
/// The tracker calls exactly one of these at most once per attempt.
pub trait Notifier: Send + Sync {
    fn success(&self, note: &str);
    fn failure(&self, note: &str);
}
