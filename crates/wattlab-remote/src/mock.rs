//! Scriptable transport for tests.
//!
//! Replies are registered against a substring of the command (optionally
//! restricted to one logical host) and consumed in registration order.
//! Commands with no pending reply succeed with empty output. Clones share
//! state, so a test keeps one handle and gives another to the code under test.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::RemoteError;
use crate::registry::HostCredentials;
use crate::transport::{ExecOutput, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Output { stdout: String, stderr: String },
    Unreachable(String),
}

impl MockReply {
    pub fn stdout(text: &str) -> Self {
        MockReply::Output {
            stdout: text.to_string(),
            stderr: String::new(),
        }
    }

    pub fn stderr(text: &str) -> Self {
        MockReply::Output {
            stdout: String::new(),
            stderr: text.to_string(),
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        MockReply::Unreachable(reason.to_string())
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Logical host name.
    pub host: String,
    pub command: String,
}

#[derive(Debug)]
struct Rule {
    host: Option<String>,
    needle: String,
    replies: VecDeque<MockReply>,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    calls: Vec<MockCall>,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for the next command containing `needle`, on any host.
    pub fn on(&self, needle: &str, reply: MockReply) {
        self.push_rule(None, needle, reply);
    }

    /// Queue `reply` for the next command containing `needle` on `host`.
    pub fn on_host(&self, host: &str, needle: &str, reply: MockReply) {
        self.push_rule(Some(host), needle, reply);
    }

    fn push_rule(&self, host: Option<&str>, needle: &str, reply: MockReply) {
        let mut state = self.state.borrow_mut();
        let host = host.map(|h| h.to_string());
        if let Some(rule) = state
            .rules
            .iter_mut()
            .find(|r| r.host == host && r.needle == needle)
        {
            rule.replies.push_back(reply);
            return;
        }
        state.rules.push(Rule {
            host,
            needle: needle.to_string(),
            replies: VecDeque::from(vec![reply]),
        });
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    /// Number of recorded commands containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    /// Commands sent to `host`, in order.
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Index of the first recorded command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.state
            .borrow()
            .calls
            .iter()
            .position(|c| c.command.contains(needle))
    }
}

impl Transport for MockTransport {
    fn exec(&self, host: &HostCredentials, command: &str) -> Result<ExecOutput, RemoteError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(MockCall {
            host: host.name.clone(),
            command: command.to_string(),
        });
        let reply = state
            .rules
            .iter_mut()
            .filter(|r| r.host.as_deref().map_or(true, |h| h == host.name))
            .filter(|r| command.contains(&r.needle))
            .find_map(|r| r.replies.pop_front());

        match reply {
            None => Ok(ExecOutput::default()),
            Some(MockReply::Output { stdout, stderr }) => Ok(ExecOutput { stdout, stderr }),
            Some(MockReply::Unreachable(reason)) => Err(RemoteError::Connection {
                host: host.name.clone(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Secret;

    fn creds(name: &str) -> HostCredentials {
        HostCredentials {
            name: name.into(),
            address: "127.0.0.1".into(),
            username: "u".into(),
            secret: Secret::new("p"),
        }
    }

    #[test]
    fn replies_are_consumed_in_order_then_default() {
        let mock = MockTransport::new();
        mock.on("wc -l", MockReply::stdout("40"));
        mock.on("wc -l", MockReply::stdout("68"));
        let host = creds("GL6");
        assert_eq!(mock.exec(&host, "docker ps | wc -l").unwrap().stdout, "40");
        assert_eq!(mock.exec(&host, "docker ps | wc -l").unwrap().stdout, "68");
        assert_eq!(mock.exec(&host, "docker ps | wc -l").unwrap().stdout, "");
        assert_eq!(mock.count("wc -l"), 3);
    }

    #[test]
    fn host_rules_only_match_their_host() {
        let mock = MockTransport::new();
        mock.on_host("GL3", "start", MockReply::stderr("boom"));
        let ok = mock.exec(&creds("GL2"), "start.sh").unwrap();
        assert!(ok.stderr.is_empty());
        let failed = mock.exec(&creds("GL3"), "start.sh").unwrap();
        assert_eq!(failed.stderr, "boom");
        assert_eq!(mock.commands_for("GL3"), vec!["start.sh".to_string()]);
    }

    #[test]
    fn unreachable_becomes_connection_error() {
        let mock = MockTransport::new();
        mock.on("", MockReply::unreachable("timed out"));
        let err = mock.exec(&creds("GL6"), "uptime").unwrap_err();
        assert!(matches!(err, RemoteError::Connection { .. }));
        assert_eq!(mock.position("uptime"), Some(0));
    }
}
