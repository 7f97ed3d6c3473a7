use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The full set of active effects, replayed to a subscriber when it
/// first connects to the event stream
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct Suspensions {
    pub ready_q: Vec<ReadyQSuspension>,
    pub sched_q: Vec<SchedQSuspension>,
    pub sched_q_bounces: Vec<SchedQBounce>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct ReadyQSuspension {
    pub rule_hash: String,
    pub site_name: String,
    pub reason: String,
    pub source: String,
    pub expires: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct SchedQSuspension {
    pub rule_hash: String,
    pub tenant: String,
    pub domain: String,
    pub campaign: Option<String>,
    pub reason: String,
    pub expires: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct SchedQBounce {
    pub rule_hash: String,
    pub domain: String,
    pub tenant: Option<String>,
    pub campaign: Option<String>,
    pub reason: String,
    pub expires: DateTime<Utc>,
}

/// An individual event on the subscription stream
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TsaEvent {
    ReadyQSuspension(ReadyQSuspension),
    SchedQSuspension(SchedQSuspension),
    SchedQBounce(SchedQBounce),
}
