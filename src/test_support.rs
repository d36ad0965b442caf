//! Scripted decision source shared by unit tests.

use crate::decision::{Decision, StreamDiff};
use crate::source::{DecisionSource, SourceError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// What a scripted call should return.
pub enum Reply<T> {
    Ok(T),
    Forbidden,
    Malformed,
}

impl<T> Reply<T> {
    fn into_result(self) -> Result<T, SourceError> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Forbidden => Err(SourceError::Rejected {
                status: StatusCode::FORBIDDEN,
            }),
            Reply::Malformed => Err(SourceError::MalformedResponse("scripted".to_string())),
        }
    }
}

/// Replays queued replies. Point queries without a queued reply answer
/// "no decisions"; stream calls without one fail as malformed.
#[derive(Default)]
pub struct ScriptedSource {
    point_replies: Mutex<VecDeque<Reply<Vec<Decision>>>>,
    stream_replies: Mutex<VecDeque<Reply<StreamDiff>>>,
    point_calls: AtomicUsize,
    startup_flags: Mutex<Vec<bool>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_point(&self, reply: Reply<Vec<Decision>>) {
        self.point_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_stream(&self, reply: Reply<StreamDiff>) {
        self.stream_replies.lock().unwrap().push_back(reply);
    }

    pub fn point_calls(&self) -> usize {
        self.point_calls.load(Ordering::SeqCst)
    }

    pub fn startup_flags(&self) -> Vec<bool> {
        self.startup_flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionSource for ScriptedSource {
    async fn decisions_for_ip(&self, _ip: &str) -> Result<Vec<Decision>, SourceError> {
        self.point_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.point_replies.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Ok(Vec::new())).into_result()
    }

    async fn stream(&self, startup: bool) -> Result<StreamDiff, SourceError> {
        self.startup_flags.lock().unwrap().push(startup);
        let reply = self.stream_replies.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Malformed).into_result()
    }
}

/// A ban decision for `value` lasting `duration`.
pub fn ban(value: &str, duration: &str) -> Decision {
    Decision {
        id: 1,
        origin: "crowdsec".to_string(),
        kind: "ban".to_string(),
        scope: "Ip".to_string(),
        value: value.to_string(),
        duration: duration.to_string(),
        scenario: "crowdsecurity/http-probing".to_string(),
        simulated: false,
    }
}
