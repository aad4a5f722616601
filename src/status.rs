use serde::Serialize;

/// Lifecycle events reported to the spawning collaborator, one JSON object
/// per line on stdout. This is the proxy's only channel back to the
/// process that owns the preview session.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StatusMessage<'a> {
    /// The pinned upstream origin, reported before the listener binds.
    Upstream { origin: &'a str },
    /// The externally reachable preview URL once the listener is bound.
    Listening { url: String },
    /// A listener-level failure; the collaborator decides whether to respawn.
    ListenerError { message: String },
    /// Acknowledgement of a termination signal; draining has begun.
    Shutdown { signal: &'a str },
}

pub fn report(message: &StatusMessage<'_>) {
    if let Ok(line) = serde_json::to_string(message) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_single_line_json() {
        let line = serde_json::to_string(&StatusMessage::Listening {
            url: "http://127.0.0.1:4400".to_string(),
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"event":"listening","url":"http://127.0.0.1:4400"}"#
        );
        assert!(!line.contains('\n'));
    }

    #[test]
    fn upstream_message_carries_origin() {
        let line = serde_json::to_string(&StatusMessage::Upstream {
            origin: "http://127.0.0.1:5173",
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"event":"upstream","origin":"http://127.0.0.1:5173"}"#
        );
    }
}
