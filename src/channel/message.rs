use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::TestStep;

/// Messages pushed by the backend over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    StatusUpdate(StatusUpdate),
    TestProgress(TestProgress),
    TestResult(TestResult),
    TestStopped(TestStopped),
}

/// Commands sent to the backend over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SubscribeStatus,
    StartTest(StartTest),
    StopTest(StopTest),
}

/// Per-platform connectivity snapshot, pushed after `subscribe_status`
/// and whenever the backend observes a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub platforms: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestProgress {
    pub run_id: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: String,
    pub platform: String,
    pub success: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backend acknowledgment of a cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStopped {
    pub run_id: String,
}

/// One fan-out run request, addressed to a single target platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTest {
    pub run_id: String,
    pub test_case: String,
    pub platform: String,
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTest {
    pub run_id: String,
}

/// Type tag of an inbound message, used as the handler-registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StatusUpdate,
    TestProgress,
    TestResult,
    TestStopped,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::StatusUpdate,
        MessageKind::TestProgress,
        MessageKind::TestResult,
        MessageKind::TestStopped,
    ];
}

impl Inbound {
    pub fn kind(&self) -> MessageKind {
        match self {
            Inbound::StatusUpdate(_) => MessageKind::StatusUpdate,
            Inbound::TestProgress(_) => MessageKind::TestProgress,
            Inbound::TestResult(_) => MessageKind::TestResult,
            Inbound::TestStopped(_) => MessageKind::TestStopped,
        }
    }
}
