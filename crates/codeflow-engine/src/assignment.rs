//! Agent selection.
//!
//! [`select_agent`] is a pure function over a candidate snapshot.
//! [`AssignmentPolicy`] adds the round-robin cursor, which only moves once
//! the chosen agent has actually been assigned.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Mutex;

use codeflow_core::types::{Agent, AgentId, AssignmentMethod};

/// An agent together with the number of tasks it currently holds.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub agent: &'a Agent,
    pub load: usize,
}

impl<'a> Candidate<'a> {
    pub fn new(agent: &'a Agent, load: usize) -> Self {
        Self { agent, load }
    }

    /// Number of `required` capabilities this agent has.
    pub fn score(&self, required: &BTreeSet<String>) -> usize {
        required
            .iter()
            .filter(|c| self.agent.has_capability(c))
            .count()
    }
}

/// Pick an agent for a task, or `None` if nobody qualifies.
///
/// - `Manual` never picks; the caller names the agent.
/// - `RoundRobin` takes the next available agent (by id) strictly after
///   `cursor`, wrapping around.
/// - `CapabilityBased` takes the available agent with the most required
///   capabilities, then the lowest load, then the lowest id.
pub fn select_agent(
    candidates: &[Candidate<'_>],
    required: &BTreeSet<String>,
    method: AssignmentMethod,
    cursor: Option<&AgentId>,
) -> Option<AgentId> {
    let mut available: Vec<&Candidate<'_>> = candidates
        .iter()
        .filter(|c| c.agent.is_available())
        .collect();

    match method {
        AssignmentMethod::Manual => None,
        AssignmentMethod::RoundRobin => {
            available.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
            let after_cursor = cursor.and_then(|cursor| {
                available
                    .iter()
                    .find(|c| &c.agent.id > cursor)
                    .map(|c| c.agent.id.clone())
            });
            after_cursor.or_else(|| available.first().map(|c| c.agent.id.clone()))
        }
        AssignmentMethod::CapabilityBased => available
            .into_iter()
            .min_by_key(|c| (Reverse(c.score(required)), c.load, &c.agent.id))
            .map(|c| c.agent.id.clone()),
    }
}

/// Selection plus the shared round-robin cursor.
#[derive(Default)]
pub struct AssignmentPolicy {
    cursor: Mutex<Option<AgentId>>,
}

impl AssignmentPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Option<AgentId> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn select(
        &self,
        candidates: &[Candidate<'_>],
        required: &BTreeSet<String>,
        method: AssignmentMethod,
    ) -> Option<AgentId> {
        let cursor = self.cursor();
        select_agent(candidates, required, method, cursor.as_ref())
    }

    /// Record a successful round-robin assignment.
    pub fn commit(&self, method: AssignmentMethod, agent: &AgentId) {
        if method == AssignmentMethod::RoundRobin {
            *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(agent.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codeflow_core::types::{AgentStatus, AgentType};

    fn agent(id: &str, status: AgentStatus, caps: &[&str]) -> Agent {
        let now = Utc::now();
        Agent {
            id: AgentId::from(id),
            name: id.to_string(),
            agent_type: AgentType::Custom,
            status,
            endpoint: String::new(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            current_task_id: None,
            metrics: Default::default(),
            last_ping_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn required(caps: &[&str]) -> BTreeSet<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_round_robin_wraps_and_advances_on_success() {
        let agents = [
            agent("a1", AgentStatus::Online, &[]),
            agent("a2", AgentStatus::Online, &[]),
            agent("a3", AgentStatus::Online, &[]),
        ];
        let candidates: Vec<_> = agents.iter().map(|a| Candidate::new(a, 0)).collect();
        let policy = AssignmentPolicy::new();
        policy.commit(AssignmentMethod::RoundRobin, &AgentId::from("a1"));

        let mut picked = Vec::new();
        for _ in 0..3 {
            let id = policy
                .select(&candidates, &BTreeSet::new(), AssignmentMethod::RoundRobin)
                .unwrap();
            policy.commit(AssignmentMethod::RoundRobin, &id);
            picked.push(id.to_string());
        }
        assert_eq!(picked, vec!["a2", "a3", "a1"]);
    }

    #[test]
    fn test_round_robin_cursor_stays_without_commit() {
        let agents = [
            agent("a1", AgentStatus::Online, &[]),
            agent("a2", AgentStatus::Online, &[]),
        ];
        let candidates: Vec<_> = agents.iter().map(|a| Candidate::new(a, 0)).collect();
        let policy = AssignmentPolicy::new();
        policy.commit(AssignmentMethod::RoundRobin, &AgentId::from("a1"));

        let first = policy.select(&candidates, &BTreeSet::new(), AssignmentMethod::RoundRobin);
        let again = policy.select(&candidates, &BTreeSet::new(), AssignmentMethod::RoundRobin);
        assert_eq!(first, again);
        assert_eq!(policy.cursor(), Some(AgentId::from("a1")));
    }

    #[test]
    fn test_round_robin_skips_unavailable() {
        let agents = [
            agent("a1", AgentStatus::Online, &[]),
            agent("a2", AgentStatus::Offline, &[]),
            agent("a3", AgentStatus::Busy, &[]),
        ];
        let candidates: Vec<_> = agents.iter().map(|a| Candidate::new(a, 0)).collect();
        let cursor = AgentId::from("a1");
        let picked = select_agent(
            &candidates,
            &BTreeSet::new(),
            AssignmentMethod::RoundRobin,
            Some(&cursor),
        );
        assert_eq!(picked, Some(AgentId::from("a1")));
    }

    #[test]
    fn test_capability_ties_break_on_load() {
        let a1 = agent("a1", AgentStatus::Online, &["python", "go"]);
        let a2 = agent("a2", AgentStatus::Online, &["python"]);
        let candidates = [Candidate::new(&a1, 2), Candidate::new(&a2, 0)];
        let picked = select_agent(
            &candidates,
            &required(&["python"]),
            AssignmentMethod::CapabilityBased,
            None,
        );
        assert_eq!(picked, Some(AgentId::from("a2")));
    }

    #[test]
    fn test_capability_prefers_higher_score_then_id() {
        let a1 = agent("a1", AgentStatus::Online, &["rust"]);
        let a2 = agent("a2", AgentStatus::Online, &["rust", "sql"]);
        let a3 = agent("a3", AgentStatus::Online, &["rust", "sql"]);
        let candidates = [
            Candidate::new(&a3, 0),
            Candidate::new(&a1, 0),
            Candidate::new(&a2, 0),
        ];
        let picked = select_agent(
            &candidates,
            &required(&["rust", "sql"]),
            AssignmentMethod::CapabilityBased,
            None,
        );
        assert_eq!(picked, Some(AgentId::from("a2")));

        // No requirements: everyone scores zero, lowest id wins.
        let picked = select_agent(
            &candidates,
            &BTreeSet::new(),
            AssignmentMethod::CapabilityBased,
            None,
        );
        assert_eq!(picked, Some(AgentId::from("a1")));
    }

    #[test]
    fn test_no_candidates_and_manual() {
        let offline = agent("a1", AgentStatus::Offline, &["python"]);
        let candidates = [Candidate::new(&offline, 0)];
        assert_eq!(
            select_agent(&candidates, &BTreeSet::new(), AssignmentMethod::CapabilityBased, None),
            None
        );

        let online = agent("a2", AgentStatus::Online, &[]);
        let candidates = [Candidate::new(&online, 0)];
        assert_eq!(
            select_agent(&candidates, &BTreeSet::new(), AssignmentMethod::Manual, None),
            None
        );
    }
}
