//! Restart/inspect error triage
//!
//! Decides from the daemon's error text whether a container is beyond help
//! until it is replaced. Matching is case-insensitive.

use crate::error::Error;

/// Why a container can no longer be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unrestartable {
    /// A container it joins (network namespace) no longer exists
    DependencyMissing,
    /// The container is pending removal and refuses to start
    MarkedForRemoval,
    /// The id or name no longer resolves
    ContainerGone,
}

impl Unrestartable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unrestartable::DependencyMissing => "dependency_missing",
            Unrestartable::MarkedForRemoval => "marked_for_removal",
            Unrestartable::ContainerGone => "container_gone",
        }
    }

    /// The container itself is gone, so it may need to be recreated
    pub fn parent_gone(&self) -> bool {
        matches!(self, Unrestartable::MarkedForRemoval | Unrestartable::ContainerGone)
    }
}

impl std::fmt::Display for Unrestartable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error; `None` means transient and worth retrying later
pub fn classify(err: &Error) -> Option<Unrestartable> {
    classify_message(&err.to_string())
}

pub fn classify_message(message: &str) -> Option<Unrestartable> {
    let msg = message.to_lowercase();

    // "no such container" alone means gone, so the combined pattern goes first
    if msg.contains("joining network namespace") && msg.contains("no such container") {
        return Some(Unrestartable::DependencyMissing);
    }
    if msg.contains("marked for removal") || (msg.contains("cannot be started") && msg.contains("removal")) {
        return Some(Unrestartable::MarkedForRemoval);
    }
    if msg.contains("no such container") {
        return Some(Unrestartable::ContainerGone);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_gone() {
        assert_eq!(
            classify_message("Error response from daemon: No such container: 3f2a"),
            Some(Unrestartable::ContainerGone)
        );
    }

    #[test]
    fn test_dependency_missing_wins_over_gone() {
        let msg = "Cannot restart container app: joining network namespace of container: No such container: 9b1c";
        assert_eq!(classify_message(msg), Some(Unrestartable::DependencyMissing));
    }

    #[test]
    fn test_marked_for_removal() {
        assert_eq!(
            classify_message("container is marked for removal and cannot be started"),
            Some(Unrestartable::MarkedForRemoval)
        );
        assert_eq!(
            classify_message("Container cannot be started: removal in progress"),
            Some(Unrestartable::MarkedForRemoval)
        );
    }

    #[test]
    fn test_transient_errors() {
        assert_eq!(classify_message("dial unix /var/run/docker.sock: connection refused"), None);
        assert_eq!(classify_message("context deadline exceeded"), None);
        assert_eq!(classify_message(""), None);
    }

    #[test]
    fn test_classify_error_display() {
        let err = Error::Gateway("No such container: abc".to_string());
        assert_eq!(classify(&err), Some(Unrestartable::ContainerGone));
    }

    #[test]
    fn test_parent_gone() {
        assert!(Unrestartable::ContainerGone.parent_gone());
        assert!(Unrestartable::MarkedForRemoval.parent_gone());
        assert!(!Unrestartable::DependencyMissing.parent_gone());
        assert_eq!(Unrestartable::DependencyMissing.to_string(), "dependency_missing");
    }
}
